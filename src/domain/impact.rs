use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{OrderId, Price, Symbol};

/// Modeled transient price shift attributed to this session's own fills.
///
/// Impact grows with the traded share of cumulative volume and decays toward
/// zero on every minute tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpactState {
    pub symbol: Symbol,
    pub trade_id: Option<OrderId>,
    pub current_impact: f64,
    pub previous_impact: f64,
    pub base_price: Price,
    pub impacted_price: Price,
    pub cumulative_volume: f64,
    pub start_timestamp: Option<DateTime<Utc>>,
    pub end_timestamp: Option<DateTime<Utc>>,
}

impl ImpactState {
    pub fn flat(symbol: Symbol) -> Self {
        Self {
            symbol,
            trade_id: None,
            current_impact: 0.0,
            previous_impact: 0.0,
            base_price: Price(0.0),
            impacted_price: Price(0.0),
            cumulative_volume: 0.0,
            start_timestamp: None,
            end_timestamp: None,
        }
    }

    /// Registers a fill against this symbol.
    ///
    /// The incremental impact is the fill's participation in cumulative volume
    /// scaled by `impact_coefficient`; the impacted price is derived from the
    /// prevailing base price.
    pub fn apply_trade(
        &mut self,
        trade_id: OrderId,
        base_price: Price,
        trade_volume: f64,
        impact_coefficient: f64,
        now: DateTime<Utc>,
    ) -> Price {
        self.previous_impact = self.current_impact;
        self.cumulative_volume += trade_volume;
        let participation = if self.cumulative_volume > 0.0 {
            trade_volume / self.cumulative_volume
        } else {
            0.0
        };
        self.current_impact += participation * impact_coefficient;

        self.trade_id = Some(trade_id);
        self.base_price = base_price;
        self.impacted_price = Price(base_price.0 * (1.0 + self.current_impact));
        if self.start_timestamp.is_none() {
            self.start_timestamp = Some(now);
        }
        self.end_timestamp = Some(now);
        self.impacted_price
    }

    /// One tick of exponential decay: `impact ← impact × (1 − rate)`,
    /// floored at zero.
    pub fn decay(&mut self, decay_rate: f64) {
        self.previous_impact = self.current_impact;
        self.current_impact = (self.current_impact * (1.0 - decay_rate)).max(0.0);
        self.impacted_price = Price(self.base_price.0 * (1.0 + self.current_impact));
    }

    pub fn is_negligible(&self) -> bool {
        self.current_impact < 1e-9
    }
}
