//! Server configuration
//!
//! Every tunable has a default and an environment override (loaded via
//! dotenv in `main`). CLI flags override both for the values they cover.

use std::str::FromStr;
use std::time::Duration;

use corrida_dispatch::DispatchConfig;
use corrida_geo::GeoConfig;
use corrida_rides::pricing::PricingConfig;
use corrida_wallet::WalletConfig;
use rust_decimal::Decimal;
use tracing::warn;

/// Top-level server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    pub dispatch: DispatchConfig,
    pub geo: GeoConfig,
    pub wallet: WalletConfig,
    pub pricing: PricingConfig,
    /// How often the hold-release sweep runs
    pub hold_sweep_interval: Duration,
    /// How often stale driver presences are purged
    pub presence_sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            dispatch: DispatchConfig::default(),
            geo: GeoConfig::default(),
            wallet: WalletConfig::default(),
            pricing: PricingConfig::default(),
            hold_sweep_interval: Duration::from_secs(60),
            presence_sweep_interval: Duration::from_secs(30),
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, raw, "unparseable env value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

impl ServerConfig {
    /// Build the configuration from the environment, falling back to
    /// defaults field by field.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let dispatch = DispatchConfig {
            initial_radius_km: env_parse(
                "CORRIDA_DISPATCH_RADIUS_KM",
                defaults.dispatch.initial_radius_km,
            ),
            extended_radius_km: env_parse(
                "CORRIDA_DISPATCH_EXTENDED_RADIUS_KM",
                defaults.dispatch.extended_radius_km,
            ),
            offer_timeout: Duration::from_secs(env_parse(
                "CORRIDA_OFFER_TIMEOUT_SECS",
                defaults.dispatch.offer_timeout.as_secs(),
            )),
            max_rounds: env_parse("CORRIDA_DISPATCH_ROUNDS", defaults.dispatch.max_rounds),
            retry_backoff: Duration::from_secs(env_parse(
                "CORRIDA_DISPATCH_BACKOFF_SECS",
                defaults.dispatch.retry_backoff.as_secs(),
            )),
            max_candidates: env_parse(
                "CORRIDA_DISPATCH_CANDIDATES",
                defaults.dispatch.max_candidates,
            ),
        };
        let geo = GeoConfig {
            staleness: chrono::Duration::seconds(env_parse(
                "CORRIDA_PRESENCE_STALENESS_SECS",
                defaults.geo.staleness.num_seconds(),
            )),
            ..defaults.geo
        };
        let wallet = WalletConfig {
            hold_period: chrono::Duration::hours(env_parse(
                "CORRIDA_HOLD_HOURS",
                defaults.wallet.hold_period.num_hours(),
            )),
            minimum_withdrawal: env_parse::<Decimal>(
                "CORRIDA_MIN_WITHDRAWAL",
                defaults.wallet.minimum_withdrawal,
            ),
            ..defaults.wallet
        };

        Self {
            host: env_parse("CORRIDA_HOST", defaults.host),
            port: env_parse("CORRIDA_PORT", defaults.port),
            dispatch,
            geo,
            wallet,
            pricing: defaults.pricing,
            hold_sweep_interval: Duration::from_secs(env_parse(
                "CORRIDA_HOLD_SWEEP_SECS",
                defaults.hold_sweep_interval.as_secs(),
            )),
            presence_sweep_interval: Duration::from_secs(env_parse(
                "CORRIDA_PRESENCE_SWEEP_SECS",
                defaults.presence_sweep_interval.as_secs(),
            )),
        }
    }
}
