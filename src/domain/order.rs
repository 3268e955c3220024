use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

use crate::{
    domain::{OrderId, Price, Quantity, RequestId, SessionId, Symbol, UserId},
    error::{EngineError, SimdeskResult},
};

/// Direction of an order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Buy,
    Sell,
}

/// Execution style of an order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
}

/// Lifecycle state of an order.
///
/// `NEW → (PARTIALLY_FILLED)* → FILLED | CANCELED | REJECTED`.
/// Terminal states are absorbing: no transition leaves them.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Canceled | Self::Rejected)
    }
}

/// An order owned by exactly one simulator.
///
/// Invariants upheld by the mutation methods below:
/// - `filled_quantity ≤ quantity`
/// - `status == FILLED ⇒ filled_quantity == quantity`
/// - terminal states absorb all further transitions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub session_id: SessionId,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Quantity,
    pub price: Option<Price>,
    pub status: OrderStatus,
    pub filled_quantity: Quantity,
    pub average_price: Price,
    pub request_id: Option<RequestId>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn new(
        user_id: UserId,
        session_id: SessionId,
        symbol: Symbol,
        side: Side,
        order_type: OrderType,
        quantity: Quantity,
        price: Option<Price>,
        request_id: Option<RequestId>,
        now: DateTime<Utc>,
    ) -> SimdeskResult<Self> {
        if quantity.0 <= 0.0 || !quantity.0.is_finite() {
            return Err(EngineError::InvalidOrder(format!(
                "quantity must be positive, got {}",
                quantity.0
            ))
            .into());
        }
        if let Some(p) = price
            && (p.0 < 0.0 || !p.0.is_finite())
        {
            return Err(
                EngineError::InvalidOrder(format!("price must be non-negative, got {}", p.0))
                    .into(),
            );
        }
        if order_type == OrderType::Limit && price.is_none() {
            return Err(EngineError::InvalidOrder("limit orders require a price".into()).into());
        }

        Ok(Self {
            order_id: OrderId::generate(),
            user_id,
            session_id,
            symbol,
            side,
            order_type,
            quantity,
            price,
            status: OrderStatus::New,
            filled_quantity: Quantity(0.0),
            average_price: Price(0.0),
            request_id,
            error_message: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn is_open(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn remaining_quantity(&self) -> Quantity {
        Quantity((self.quantity.0 - self.filled_quantity.0).max(0.0))
    }

    /// Applies a fill, updating the running average fill price and status.
    ///
    /// Fills beyond the remaining quantity are clipped, preserving the
    /// `filled_quantity ≤ quantity` invariant regardless of caller input.
    pub fn apply_fill(
        &mut self,
        fill_quantity: Quantity,
        fill_price: Price,
        now: DateTime<Utc>,
    ) -> SimdeskResult<()> {
        if self.status.is_terminal() {
            return Err(EngineError::InvalidOrder(format!(
                "cannot fill order {} in terminal state {}",
                self.order_id, self.status
            ))
            .into());
        }

        let fill = fill_quantity.0.min(self.remaining_quantity().0);
        if fill <= 0.0 {
            return Ok(());
        }

        let prior = self.filled_quantity.0;
        let new_filled = prior + fill;
        self.average_price =
            Price((prior * self.average_price.0 + fill * fill_price.0) / new_filled);
        self.filled_quantity = Quantity(new_filled);
        self.status = if new_filled >= self.quantity.0 {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        self.updated_at = now;
        Ok(())
    }

    /// Moves the order to CANCELED unless it is already terminal.
    ///
    /// Returns whether a transition occurred; canceling an already-terminal
    /// order is a no-op by design of the idempotent cancel RPC.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = OrderStatus::Canceled;
        self.updated_at = now;
        true
    }

    pub fn reject(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = OrderStatus::Rejected;
        self.error_message = Some(reason.into());
        self.updated_at = now;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_order(qty: f64) -> Order {
        Order::new(
            UserId::from("u1"),
            SessionId::from("s1"),
            Symbol::from("AAPL"),
            Side::Buy,
            OrderType::Market,
            Quantity(qty),
            None,
            Some(RequestId::from("r1")),
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn status_wire_names_are_screaming_snake() {
        assert_eq!(OrderStatus::PartiallyFilled.to_string(), "PARTIALLY_FILLED");
        assert_eq!(Side::Buy.to_string(), "BUY");
        assert_eq!(OrderType::Limit.to_string(), "LIMIT");
    }

    #[test]
    fn rejects_non_positive_quantity() {
        assert!(
            Order::new(
                UserId::from("u1"),
                SessionId::from("s1"),
                Symbol::from("AAPL"),
                Side::Buy,
                OrderType::Market,
                Quantity(0.0),
                None,
                None,
                Utc::now(),
            )
            .is_err()
        );
    }

    #[test]
    fn limit_requires_price() {
        assert!(
            Order::new(
                UserId::from("u1"),
                SessionId::from("s1"),
                Symbol::from("AAPL"),
                Side::Sell,
                OrderType::Limit,
                Quantity(1.0),
                None,
                None,
                Utc::now(),
            )
            .is_err()
        );
    }

    #[test]
    fn partial_then_full_fill_tracks_average() {
        let mut order = sample_order(10.0);

        order.apply_fill(Quantity(4.0), Price(100.0), Utc::now()).unwrap();
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert_eq!(order.filled_quantity, Quantity(4.0));
        assert_eq!(order.average_price, Price(100.0));

        order.apply_fill(Quantity(6.0), Price(110.0), Utc::now()).unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.filled_quantity, Quantity(10.0));
        assert!((order.average_price.0 - 106.0).abs() < 1e-9);
    }

    #[test]
    fn overfill_is_clipped() {
        let mut order = sample_order(5.0);
        order.apply_fill(Quantity(50.0), Price(10.0), Utc::now()).unwrap();
        assert_eq!(order.filled_quantity, Quantity(5.0));
        assert_eq!(order.status, OrderStatus::Filled);
    }

    #[test]
    fn terminal_states_absorb() {
        let mut order = sample_order(1.0);
        order.apply_fill(Quantity(1.0), Price(10.0), Utc::now()).unwrap();
        assert_eq!(order.status, OrderStatus::Filled);

        assert!(!order.cancel(Utc::now()));
        assert_eq!(order.status, OrderStatus::Filled);

        order.reject("late", Utc::now());
        assert_eq!(order.status, OrderStatus::Filled);

        assert!(order.apply_fill(Quantity(1.0), Price(10.0), Utc::now()).is_err());
    }

    #[test]
    fn cancel_open_order() {
        let mut order = sample_order(2.0);
        assert!(order.cancel(Utc::now()));
        assert_eq!(order.status, OrderStatus::Canceled);
    }
}
