//! REST surface
//!
//! Identity arrives pre-verified: an upstream gateway injects
//! `X-User-Id` and `X-User-Role` headers after authenticating the
//! caller, and this layer only checks that the acting role fits the
//! route. Errors map the core taxonomy onto HTTP statuses with a
//! `{"error": {"code", "message"}}` payload.

use std::sync::Arc;

use axum::{
    async_trait,
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};
use uuid::Uuid;

use corrida_geo::NearbyDriver;
use corrida_types::{
    Actor, CoreError, DriverId, GeoPoint, Location, PassengerId, Ride, RideCategory, RideEvent,
    RideId, RideQuote, RideStatus, Role,
};
use corrida_wallet::{Transaction, WalletAccount, Withdrawal};

use crate::AppState;

// ============================================================================
// Errors
// ============================================================================

/// Core error carried to the HTTP edge
pub struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::InvalidInput { .. } => StatusCode::BAD_REQUEST,
            CoreError::Conflict { .. } => StatusCode::CONFLICT,
            CoreError::Forbidden { .. } => StatusCode::FORBIDDEN,
            CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            CoreError::InsufficientFunds { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            CoreError::NoDriversAvailable { .. } => StatusCode::CONFLICT,
            CoreError::ExternalServiceFailure { .. } => StatusCode::BAD_GATEWAY,
        };
        let body = Json(json!({
            "error": {
                "code": self.0.error_code(),
                "message": self.0.to_string(),
            }
        }));
        (status, body).into_response()
    }
}

// ============================================================================
// Identity
// ============================================================================

/// Authenticated caller, as established upstream
#[derive(Debug, Clone, Copy)]
pub struct Identity {
    pub user_id: Uuid,
    pub role: Role,
}

impl Identity {
    fn as_driver(&self) -> Result<DriverId, ApiError> {
        match self.role {
            Role::Driver => Ok(DriverId::from_uuid(self.user_id)),
            Role::Passenger => {
                Err(CoreError::forbidden("this operation requires the driver role").into())
            }
        }
    }

    fn as_passenger(&self) -> Result<PassengerId, ApiError> {
        match self.role {
            Role::Passenger => Ok(PassengerId::from_uuid(self.user_id)),
            Role::Driver => {
                Err(CoreError::forbidden("this operation requires the passenger role").into())
            }
        }
    }

    fn actor(&self) -> Actor {
        match self.role {
            Role::Passenger => Actor::Passenger(PassengerId::from_uuid(self.user_id)),
            Role::Driver => Actor::Driver(DriverId::from_uuid(self.user_id)),
        }
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Identity {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| {
                ApiError(CoreError::forbidden("missing or malformed X-User-Id header"))
            })?;
        let role = parts
            .headers
            .get("x-user-role")
            .and_then(|v| v.to_str().ok())
            .and_then(Role::parse)
            .ok_or_else(|| {
                ApiError(CoreError::forbidden("missing or malformed X-User-Role header"))
            })?;
        Ok(Self { user_id, role })
    }
}

// ============================================================================
// Request payloads
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct EstimateRequest {
    pub origin_lat: f64,
    pub origin_lon: f64,
    pub destination_lat: f64,
    pub destination_lon: f64,
    pub category: RideCategory,
}

#[derive(Debug, Deserialize)]
pub struct RequestRideRequest {
    pub origin_address: String,
    pub origin_lat: f64,
    pub origin_lon: f64,
    pub destination_address: String,
    pub destination_lat: f64,
    pub destination_lon: f64,
    pub category: RideCategory,
}

#[derive(Debug, Deserialize)]
pub struct FinishRideRequest {
    /// Recalculated fare; the accepted estimate is used when absent
    pub final_price: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
pub struct DriverStatusRequest {
    pub online: bool,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub heading: Option<f64>,
    pub category: Option<RideCategory>,
}

#[derive(Debug, Deserialize)]
pub struct LocationPing {
    pub latitude: f64,
    pub longitude: f64,
    pub heading: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct NearbyQuery {
    pub latitude: f64,
    pub longitude: f64,
    /// Search radius in km
    pub radius: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct WithdrawalRequest {
    pub amount: Decimal,
    /// PIX key or bank reference handed to the payout rails
    pub payout_target: String,
}

// ============================================================================
// Health
// ============================================================================

pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "corrida",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ============================================================================
// Rides
// ============================================================================

pub async fn estimate(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Json(req): Json<EstimateRequest>,
) -> Result<Json<RideQuote>, ApiError> {
    identity.as_passenger()?;
    let quote = state.config.pricing.quote(
        &GeoPoint::new(req.origin_lat, req.origin_lon),
        &GeoPoint::new(req.destination_lat, req.destination_lon),
        req.category,
    )?;
    Ok(Json(quote))
}

pub async fn request_ride(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Json(req): Json<RequestRideRequest>,
) -> Result<Json<Ride>, ApiError> {
    let passenger = identity.as_passenger()?;
    let origin = GeoPoint::new(req.origin_lat, req.origin_lon);
    let destination = GeoPoint::new(req.destination_lat, req.destination_lon);
    let quote = state.config.pricing.quote(&origin, &destination, req.category)?;
    let ride = state.registry.create(
        passenger,
        Location::new(req.origin_address, origin),
        Location::new(req.destination_address, destination),
        req.category,
        quote,
    )?;
    state.dispatcher.spawn_dispatch(ride.id);
    Ok(Json(ride))
}

pub async fn get_ride(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Path(id): Path<Uuid>,
) -> Result<Json<Ride>, ApiError> {
    let ride = state.registry.get(RideId::from_uuid(id))?;
    let is_participant = match identity.role {
        Role::Passenger => ride.passenger_id.0 == identity.user_id,
        Role::Driver => ride.driver_id.map(|d| d.0) == Some(identity.user_id),
    };
    if !is_participant {
        return Err(CoreError::forbidden("caller is not part of this ride").into());
    }
    Ok(Json(ride))
}

pub async fn list_rides(
    State(state): State<Arc<AppState>>,
    identity: Identity,
) -> Result<Json<Vec<Ride>>, ApiError> {
    let rides = match identity.role {
        Role::Passenger => state
            .registry
            .rides_for_passenger(PassengerId::from_uuid(identity.user_id)),
        Role::Driver => state
            .registry
            .rides_for_driver(DriverId::from_uuid(identity.user_id)),
    };
    Ok(Json(rides))
}

pub async fn accept_ride(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Path(id): Path<Uuid>,
) -> Result<Json<Ride>, ApiError> {
    let driver = identity.as_driver()?;
    let ride = state.dispatcher.accept(RideId::from_uuid(id), driver)?;
    Ok(Json(ride))
}

pub async fn decline_ride(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let driver = identity.as_driver()?;
    state.dispatcher.decline(RideId::from_uuid(id), driver)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn mark_arriving(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Path(id): Path<Uuid>,
) -> Result<Json<Ride>, ApiError> {
    let driver = identity.as_driver()?;
    let ride = state.registry.mark_arriving(RideId::from_uuid(id), driver)?;
    Ok(Json(ride))
}

pub async fn start_ride(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Path(id): Path<Uuid>,
) -> Result<Json<Ride>, ApiError> {
    let driver = identity.as_driver()?;
    let ride = state.registry.start_ride(RideId::from_uuid(id), driver)?;
    Ok(Json(ride))
}

pub async fn finish_ride(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Path(id): Path<Uuid>,
    Json(req): Json<FinishRideRequest>,
) -> Result<Json<Ride>, ApiError> {
    let driver = identity.as_driver()?;
    let ride_id = RideId::from_uuid(id);
    let final_price = match req.final_price {
        Some(price) => price,
        None => state.registry.get(ride_id)?.estimated_price,
    };
    let ride = state.registry.finish_ride(ride_id, driver, final_price)?;
    Ok(Json(ride))
}

pub async fn cancel_ride(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Path(id): Path<Uuid>,
) -> Result<Json<Ride>, ApiError> {
    let ride = state
        .registry
        .cancel(RideId::from_uuid(id), identity.actor())?;
    Ok(Json(ride))
}

// ============================================================================
// Drivers
// ============================================================================

pub async fn set_driver_status(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Json(req): Json<DriverStatusRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let driver = identity.as_driver()?;
    if req.online {
        let (Some(latitude), Some(longitude)) = (req.latitude, req.longitude) else {
            return Err(CoreError::invalid_input(
                "position",
                "going online requires latitude and longitude",
            )
            .into());
        };
        state.index.set_online(
            driver,
            GeoPoint::new(latitude, longitude),
            req.heading,
            req.category.unwrap_or(RideCategory::Standard),
        )?;
    } else {
        state.index.set_offline(driver);
    }
    Ok(Json(json!({ "online": req.online })))
}

pub async fn ping_location(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Json(req): Json<LocationPing>,
) -> Result<StatusCode, ApiError> {
    let driver = identity.as_driver()?;
    let position = GeoPoint::new(req.latitude, req.longitude);
    state.index.update_location(driver, position, req.heading)?;

    // While a ride is active, the passenger follows the car in realtime.
    let active = state
        .registry
        .rides_for_driver(driver)
        .into_iter()
        .find(|r| {
            matches!(
                r.status,
                RideStatus::Accepted | RideStatus::DriverArriving | RideStatus::InProgress
            )
        });
    if let Some(ride) = active {
        state.events.emit(&RideEvent::DriverLocation {
            ride_id: ride.id,
            passenger_id: ride.passenger_id,
            driver_id: driver,
            latitude: position.latitude,
            longitude: position.longitude,
            heading: req.heading,
        });
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn nearby_drivers(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Query(query): Query<NearbyQuery>,
) -> Result<Json<Vec<NearbyDriver>>, ApiError> {
    identity.as_passenger()?;
    let drivers = state.index.nearby(
        &GeoPoint::new(query.latitude, query.longitude),
        query.radius.unwrap_or(5.0),
        None,
        20,
    )?;
    Ok(Json(drivers))
}

// ============================================================================
// Wallet
// ============================================================================

pub async fn get_wallet(
    State(state): State<Arc<AppState>>,
    identity: Identity,
) -> Result<Json<WalletAccount>, ApiError> {
    let driver = identity.as_driver()?;
    let account = state
        .wallet
        .account(driver)
        .unwrap_or_else(|| WalletAccount::empty(driver, state.config.wallet.currency));
    Ok(Json(account))
}

pub async fn list_transactions(
    State(state): State<Arc<AppState>>,
    identity: Identity,
) -> Result<Json<Vec<Transaction>>, ApiError> {
    let driver = identity.as_driver()?;
    Ok(Json(state.wallet.transactions_for(driver)))
}

pub async fn request_withdrawal(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Json(req): Json<WithdrawalRequest>,
) -> Result<(StatusCode, Json<Withdrawal>), ApiError> {
    let driver = identity.as_driver()?;
    let withdrawal = state
        .wallet
        .request_withdrawal(driver, req.amount, req.payout_target)?;

    // The debit is committed; the payout handoff runs on its own task so
    // no wallet lock spans the external call. A gateway failure is
    // reconciled with a compensating credit.
    let wallet = Arc::clone(&state.wallet);
    let gateway = Arc::clone(&state.payouts);
    let handoff = withdrawal.clone();
    tokio::spawn(async move {
        match gateway.send_payout(&handoff).await {
            Ok(provider_ref) => {
                info!(withdrawal = %handoff.id, provider_ref, "payout confirmed");
            }
            Err(e) => {
                error!(withdrawal = %handoff.id, error = %e, "payout failed, reconciling");
                if let Err(e) = wallet.reconcile_failed_payout(&handoff) {
                    error!(withdrawal = %handoff.id, error = %e, "reconciliation failed");
                }
            }
        }
    });

    Ok((StatusCode::CREATED, Json(withdrawal)))
}
