use crate::{
    domain::{Price, Quantity, Symbol, order::Side, position::Position},
    error::SimdeskResult,
    sorted_vec_map::SortedVecMap,
};

/// All positions of one session, keyed by symbol in deterministic order.
#[derive(Debug, Clone, Default)]
pub struct Portfolio {
    positions: SortedVecMap<Symbol, Position>,
}

impl Portfolio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(&self, symbol: &Symbol) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn quantity(&self, symbol: &Symbol) -> Quantity {
        self.positions
            .get(symbol)
            .map(|p| p.quantity)
            .unwrap_or(Quantity(0.0))
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn held_symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.positions.keys()
    }

    /// Folds a fill into the held position. Sells against an absent or
    /// insufficient position are rejected before any state changes.
    pub fn apply_fill(
        &mut self,
        symbol: &Symbol,
        side: Side,
        quantity: Quantity,
        price: Price,
    ) -> SimdeskResult<()> {
        let position = self
            .positions
            .get_or_insert_with(symbol.clone(), || Position::flat(symbol.clone()));
        match side {
            Side::Buy => {
                position.apply_buy(quantity, price);
            }
            Side::Sell => {
                position.apply_sell(quantity)?;
            }
        }
        position.revalue(price);
        if position.is_flat() {
            self.positions.remove(symbol);
        }
        Ok(())
    }

    /// Marks one symbol to the latest traded price.
    pub fn revalue(&mut self, symbol: &Symbol, last_price: Price) {
        if let Some(position) = self.positions.get_mut(symbol) {
            position.revalue(last_price);
        }
    }

    /// Sum of position market values.
    pub fn market_value(&self) -> f64 {
        self.positions.values().map(|p| p.market_value).sum()
    }

    /// Current weight of each held symbol relative to `aum`.
    pub fn weights(&self, aum: f64) -> SortedVecMap<Symbol, f64> {
        if aum <= 0.0 {
            return SortedVecMap::new();
        }
        self.positions
            .iter()
            .map(|(symbol, position)| (symbol.clone(), position.market_value / aum))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fills_accumulate_and_flat_positions_drop_out() {
        let mut portfolio = Portfolio::new();
        let aapl = Symbol::from("AAPL");

        portfolio
            .apply_fill(&aapl, Side::Buy, Quantity(10.0), Price(100.0))
            .unwrap();
        assert_eq!(portfolio.quantity(&aapl), Quantity(10.0));

        portfolio
            .apply_fill(&aapl, Side::Sell, Quantity(10.0), Price(110.0))
            .unwrap();
        assert!(portfolio.position(&aapl).is_none());
    }

    #[test]
    fn sell_without_position_rejected() {
        let mut portfolio = Portfolio::new();
        let result = portfolio.apply_fill(
            &Symbol::from("AAPL"),
            Side::Sell,
            Quantity(1.0),
            Price(100.0),
        );
        assert!(result.is_err());
    }

    #[test]
    fn market_value_tracks_revaluation() {
        let mut portfolio = Portfolio::new();
        let aapl = Symbol::from("AAPL");
        let msft = Symbol::from("MSFT");

        portfolio
            .apply_fill(&aapl, Side::Buy, Quantity(10.0), Price(100.0))
            .unwrap();
        portfolio
            .apply_fill(&msft, Side::Buy, Quantity(5.0), Price(200.0))
            .unwrap();
        assert!((portfolio.market_value() - 2_000.0).abs() < 1e-9);

        portfolio.revalue(&aapl, Price(120.0));
        assert!((portfolio.market_value() - 2_200.0).abs() < 1e-9);
    }

    #[test]
    fn weights_are_relative_to_aum() {
        let mut portfolio = Portfolio::new();
        let aapl = Symbol::from("AAPL");
        portfolio
            .apply_fill(&aapl, Side::Buy, Quantity(10.0), Price(100.0))
            .unwrap();

        let weights = portfolio.weights(10_000.0);
        assert!((weights[&aapl] - 0.1).abs() < 1e-9);
        assert!(portfolio.weights(0.0).is_empty());
    }
}
