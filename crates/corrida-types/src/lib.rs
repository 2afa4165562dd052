//! Corrida Types - Canonical domain types for the ride dispatch platform
//!
//! This crate contains all foundational types for Corrida with zero
//! dependencies on other corrida crates. It defines the complete type
//! system for:
//!
//! - Identity types (RideId, DriverId, PassengerId, etc.)
//! - Geographic points and great-circle distances
//! - Currency (BRL, 2 decimal places)
//! - The ride record and its lifecycle vocabulary
//! - Realtime event envelopes delivered over the socket
//! - The error taxonomy shared by every component
//!
//! # Architectural Invariants
//!
//! These types support the core coordinator invariants:
//!
//! 1. A ride's driver id is set iff its status is Accepted or later
//! 2. Exactly one driver ever binds to a ride (conditional updates only)
//! 3. Terminal statuses (Completed, Cancelled) are never left
//! 4. Wallet balances are non-negative and reconcile with the ledger

pub mod error;
pub mod event;
pub mod geo;
pub mod ids;
pub mod money;
pub mod ride;

pub use error::*;
pub use event::*;
pub use geo::*;
pub use ids::*;
pub use money::*;
pub use ride::*;

/// Version of the Corrida types schema
pub const TYPES_VERSION: &str = "0.1.0";
