//! Identity types for Corrida
//!
//! All identifiers are uuid v4 newtypes. `UserId` is the transport-level
//! identity used by the realtime connection registry; passenger and driver
//! ids convert into it losslessly.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Ride identifier
    RideId
);
uuid_id!(
    /// Passenger identifier
    PassengerId
);
uuid_id!(
    /// Driver identifier
    DriverId
);
uuid_id!(
    /// Ledger transaction identifier
    TransactionId
);
uuid_id!(
    /// Withdrawal request identifier
    WithdrawalId
);

/// Transport-level identity for realtime subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<PassengerId> for UserId {
    fn from(id: PassengerId) -> Self {
        Self(id.0)
    }
}

impl From<DriverId> for UserId {
    fn from(id: DriverId) -> Self {
        Self(id.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection role, as presented by the client at subscription time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Passenger,
    Driver,
}

impl Role {
    /// Parse the `role` query parameter of the socket route
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "passenger" => Some(Self::Passenger),
            "driver" => Some(Self::Driver),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passenger => write!(f, "passenger"),
            Self::Driver => write!(f, "driver"),
        }
    }
}

/// The party performing a ride operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Actor {
    Passenger(PassengerId),
    Driver(DriverId),
}

impl Actor {
    pub fn role(&self) -> Role {
        match self {
            Self::Passenger(_) => Role::Passenger,
            Self::Driver(_) => Role::Driver,
        }
    }
}
