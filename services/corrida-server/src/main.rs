//! Corrida Server - Ride Dispatch & Lifecycle Coordinator
//!
//! Passengers request trips, drivers are matched through timed offers,
//! both sides follow the trip over the realtime socket, and completed
//! trips settle into the driver wallet.
//!
//! # Quick Start
//!
//! ```bash
//! # Start the coordinator
//! cargo run -p corrida-server
//!
//! # Start with demo mode (simulated drivers and passengers)
//! cargo run -p corrida-server -- --demo
//! ```

mod api;
mod config;
mod demo;
mod jobs;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use corrida_dispatch::{DispatchObserver, Dispatcher};
use corrida_geo::DriverIndex;
use corrida_realtime::{EventBus, EventObserver, EventRouter};
use corrida_rides::RideRegistry;
use corrida_types::EventKind;
use corrida_wallet::{LoggingPayoutGateway, PayoutGateway, WalletLedger};

use config::ServerConfig;

// ============================================================================
// CLI
// ============================================================================

#[derive(Parser)]
#[command(name = "corrida")]
#[command(about = "Corrida - ride dispatch and lifecycle coordinator")]
struct Cli {
    /// Port to listen on (overrides CORRIDA_PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable demo mode with simulated traffic
    #[arg(long)]
    demo: bool,

    /// Number of demo drivers
    #[arg(long, default_value = "5")]
    demo_drivers: usize,
}

// ============================================================================
// Application State
// ============================================================================

pub struct AppState {
    pub config: ServerConfig,
    pub events: Arc<EventBus>,
    pub registry: Arc<RideRegistry>,
    pub index: Arc<DriverIndex>,
    pub router: Arc<EventRouter>,
    pub dispatcher: Arc<Dispatcher>,
    pub wallet: Arc<WalletLedger>,
    pub payouts: Arc<dyn PayoutGateway>,
}

impl AppState {
    fn build(config: ServerConfig) -> Arc<Self> {
        let events = Arc::new(EventBus::new());
        let registry = Arc::new(RideRegistry::new(Arc::clone(&events)));
        let index = Arc::new(DriverIndex::new(config.geo.clone()));
        let router = Arc::new(EventRouter::new());
        let dispatcher = Arc::new(Dispatcher::new(
            config.dispatch.clone(),
            Arc::clone(&registry),
            Arc::clone(&index),
            Arc::clone(&events),
        ));
        let wallet = Arc::new(WalletLedger::new(config.wallet.clone()));

        // Observer wiring. Per kind, handlers fire in registration
        // order: clients hear about a transition before its
        // side-effects (offer revocation, settlement) land.
        let router_observer: Arc<dyn EventObserver> = router.clone();
        events.on(&EventKind::ALL, router_observer);
        events.on(
            &DispatchObserver::KINDS,
            Arc::new(DispatchObserver(Arc::clone(&dispatcher))),
        );
        let wallet_observer: Arc<dyn EventObserver> = wallet.clone();
        events.on(&[EventKind::RideCompleted], wallet_observer);

        Arc::new(Self {
            config,
            events,
            registry,
            index,
            router,
            dispatcher,
            wallet,
            payouts: Arc::new(LoggingPayoutGateway),
        })
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = ServerConfig::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }

    info!("Starting Corrida Coordinator");
    info!("======================================");
    info!("  Bind: {}:{}", config.host, config.port);
    info!("  Offer timeout: {:?}", config.dispatch.offer_timeout);
    info!("  Dispatch rounds: {}", config.dispatch.max_rounds);
    info!("  Hold period: {}h", config.wallet.hold_period.num_hours());
    info!("  Demo mode: {}", cli.demo);
    info!("======================================");

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let state = AppState::build(config);

    jobs::spawn_background_jobs(&state);
    if cli.demo {
        let demo_state = Arc::clone(&state);
        tokio::spawn(demo::run_demo(demo_state, cli.demo_drivers));
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(api::health))
        // Rides
        .route("/rides/estimate", post(api::estimate))
        .route("/rides/request", post(api::request_ride))
        .route("/rides", get(api::list_rides))
        .route("/rides/:id", get(api::get_ride))
        .route("/rides/:id/accept", post(api::accept_ride))
        .route("/rides/:id/decline", post(api::decline_ride))
        .route("/rides/:id/arriving", post(api::mark_arriving))
        .route("/rides/:id/start", post(api::start_ride))
        .route("/rides/:id/finish", post(api::finish_ride))
        .route("/rides/:id/cancel", post(api::cancel_ride))
        // Drivers
        .route("/drivers/me/status", post(api::set_driver_status))
        .route("/drivers/me/location", post(api::ping_location))
        .route("/passengers/drivers/nearby", get(api::nearby_drivers))
        // Wallet
        .route("/wallet/drivers/me/wallet", get(api::get_wallet))
        .route(
            "/wallet/drivers/me/wallet/transactions",
            get(api::list_transactions),
        )
        .route(
            "/wallet/drivers/me/withdrawals",
            post(api::request_withdrawal),
        )
        // Realtime
        .route("/ws", get(ws::ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}
