//! Currency for wallet balances and fares
//!
//! All monetary values use `rust_decimal::Decimal` rounded to 2 decimal
//! places. The platform settles in a single currency per deployment.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Settlement currency (ISO 4217)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Currency {
    BRL,
}

impl Currency {
    pub fn code(&self) -> &'static str {
        match self {
            Self::BRL => "BRL",
        }
    }

    pub fn decimals(&self) -> u32 {
        2
    }
}

impl Default for Currency {
    fn default() -> Self {
        Self::BRL
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Round a monetary value to currency precision
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp(2)
}
