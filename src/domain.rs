pub mod account;
pub mod bar;
pub mod conviction;
pub mod impact;
pub mod order;
pub mod position;
pub mod session;
pub mod simulator;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{impl_arith_primitive, impl_from_primitive};

// ================================================================================================
// Domain Strong Types (NewTypes)
// ================================================================================================

/// Represents a price level in the quote currency.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
pub struct Price(pub f64);
impl_from_primitive!(Price, f64);
impl_arith_primitive!(Price, f64);

/// Represents an amount of the traded instrument.
///
/// Wraps `f64` to support fractional quantities while providing strong typing
/// against `Price` or other metrics.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
pub struct Quantity(pub f64);
impl_from_primitive!(Quantity, f64);
impl_arith_primitive!(Quantity, f64);

/// Semantic alias for `Quantity` when referring to aggregated market activity.
pub type Volume = Quantity;

/// A ticker symbol, e.g. `AAPL`.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Symbol(pub String);
impl_from_primitive!(Symbol, String);

impl From<&str> for Symbol {
    fn from(value: &str) -> Self {
        Symbol(value.to_string())
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

macro_rules! impl_id_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
        )]
        pub struct $name(pub String);
        impl_from_primitive!($name, String);

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                $name(value.to_string())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

impl_id_newtype!(
    /// Identifies a platform user.
    UserId
);
impl_id_newtype!(
    /// Identifies one session binding of a user to a simulator.
    SessionId
);
impl_id_newtype!(
    /// Identifies the client device a session is pinned to.
    DeviceId
);
impl_id_newtype!(
    /// Identifies an order inside one simulator.
    OrderId
);
impl_id_newtype!(
    /// Identifies a simulator instance.
    SimulatorId
);
impl_id_newtype!(
    /// Client-supplied idempotency key.
    RequestId
);

impl SessionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl OrderId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl SimulatorId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn symbol_roundtrips_through_string() {
        let s = Symbol::from("AAPL");
        assert_eq!(s.to_string(), "AAPL");
        let raw: String = s.into();
        assert_eq!(raw, "AAPL");
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(OrderId::generate(), OrderId::generate());
        assert_ne!(SessionId::generate(), SessionId::generate());
    }

    #[test]
    fn quantity_arithmetic() {
        let q = Quantity(2.0) + Quantity(3.0);
        assert_eq!(q, Quantity(5.0));
        let scaled = q * 2.0;
        assert_eq!(scaled, Quantity(10.0));
    }
}
