use serde::{Deserialize, Serialize};

use crate::{
    domain::{Price, Quantity, Symbol},
    error::{EngineError, SimdeskResult},
};

/// A long-only holding in a single instrument.
///
/// `market_value` is recomputed on every minute tick from the latest traded
/// price; `average_cost` only changes on buys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    pub quantity: Quantity,
    pub average_cost: Price,
    pub market_value: f64,
}

impl Position {
    pub fn flat(symbol: Symbol) -> Self {
        Self {
            symbol,
            quantity: Quantity(0.0),
            average_cost: Price(0.0),
            market_value: 0.0,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.quantity.0 <= 0.0
    }

    /// Folds a buy fill into the running average cost:
    /// `new_avg = (old_q·old_avg + fill_q·fill_px) / new_q`.
    pub fn apply_buy(&mut self, fill_quantity: Quantity, fill_price: Price) {
        let old_notional = self.quantity.0 * self.average_cost.0;
        let fill_notional = fill_quantity.0 * fill_price.0;
        let new_quantity = self.quantity.0 + fill_quantity.0;
        if new_quantity > 0.0 {
            self.average_cost = Price((old_notional + fill_notional) / new_quantity);
        }
        self.quantity = Quantity(new_quantity);
    }

    /// Reduces the holding. The engine has no shorting: selling more than is
    /// held is rejected before any state changes.
    pub fn apply_sell(&mut self, fill_quantity: Quantity) -> SimdeskResult<()> {
        if fill_quantity.0 > self.quantity.0 + 1e-9 {
            return Err(EngineError::InvalidOrder(format!(
                "cannot sell {} of {}: holding {}",
                fill_quantity.0, self.symbol, self.quantity.0
            ))
            .into());
        }
        self.quantity = Quantity((self.quantity.0 - fill_quantity.0).max(0.0));
        if self.is_flat() {
            self.average_cost = Price(0.0);
        }
        Ok(())
    }

    pub fn revalue(&mut self, last_price: Price) {
        self.market_value = self.quantity.0 * last_price.0;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn buy_accumulates_average_cost() {
        let mut pos = Position::flat(Symbol::from("AAPL"));
        pos.apply_buy(Quantity(10.0), Price(100.0));
        pos.apply_buy(Quantity(10.0), Price(110.0));
        assert_eq!(pos.quantity, Quantity(20.0));
        assert!((pos.average_cost.0 - 105.0).abs() < 1e-9);
    }

    #[test]
    fn sell_within_holding() {
        let mut pos = Position::flat(Symbol::from("AAPL"));
        pos.apply_buy(Quantity(10.0), Price(100.0));
        pos.apply_sell(Quantity(4.0)).unwrap();
        assert_eq!(pos.quantity, Quantity(6.0));
        // Average cost is untouched by sells.
        assert_eq!(pos.average_cost, Price(100.0));
    }

    #[test]
    fn selling_to_flat_resets_cost_basis() {
        let mut pos = Position::flat(Symbol::from("AAPL"));
        pos.apply_buy(Quantity(5.0), Price(50.0));
        pos.apply_sell(Quantity(5.0)).unwrap();
        assert!(pos.is_flat());
        assert_eq!(pos.average_cost, Price(0.0));
    }

    #[test]
    fn shorting_is_rejected() {
        let mut pos = Position::flat(Symbol::from("AAPL"));
        pos.apply_buy(Quantity(1.0), Price(10.0));
        assert!(pos.apply_sell(Quantity(2.0)).is_err());
        // State unchanged on rejection.
        assert_eq!(pos.quantity, Quantity(1.0));
    }

    #[test]
    fn revalue_tracks_last_price() {
        let mut pos = Position::flat(Symbol::from("AAPL"));
        pos.apply_buy(Quantity(3.0), Price(100.0));
        pos.revalue(Price(120.0));
        assert!((pos.market_value - 360.0).abs() < 1e-9);
    }
}
