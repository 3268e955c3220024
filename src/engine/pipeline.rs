//! The conviction pipeline:
//! `alpha_processor → constraint_manager → risk_manager → solver → order_generator`.
//!
//! Each stage transforms a target book of per-symbol weights and appends to
//! the ordered decision log returned with the results. Orders produced by the
//! final stage are routed through the standard submission path by the caller.

pub mod alpha;
pub mod constraints;
pub mod generator;
pub mod risk;
pub mod solver;

use chrono::{DateTime, Utc};

use crate::{
    domain::{OrderId, Price, Symbol, conviction::Conviction},
    engine::state::OrderSpec,
    sorted_vec_map::SortedVecMap,
};

/// Tunables for the pipeline stages.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// PM-level clip on any single target weight.
    pub max_position_size: f64,
    /// Liquidity cap: `|w| ≤ adv_usd × max_adv_participation / aum`.
    pub enable_liquidity_limits: bool,
    pub max_adv_participation: f64,
    /// Hard cap a single position may never exceed, applied by the risk stage.
    pub single_position_hard_cap: f64,
    /// Risk model this engine build supports.
    pub risk_model: String,
    /// Leverage the solver normalises the book to.
    pub target_leverage: f64,
    /// Positions below this weight are dropped by the solver.
    pub min_position_size: f64,
    /// Weight changes below `min_trade_size / aum` produce no order.
    pub min_trade_size: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_position_size: 0.10,
            enable_liquidity_limits: false,
            max_adv_participation: 0.05,
            single_position_hard_cap: 0.25,
            risk_model: "factor_v1".to_string(),
            target_leverage: 1.0,
            min_position_size: 0.001,
            min_trade_size: 1_000.0,
        }
    }
}

/// Target book threaded through the stages.
#[derive(Debug, Clone, Default)]
pub struct TargetBook {
    pub weights: SortedVecMap<Symbol, f64>,
    pub urgency: SortedVecMap<Symbol, crate::domain::conviction::Urgency>,
    /// Average daily volume in base currency, when known. Consulted by the
    /// liquidity constraint only.
    pub adv_usd: SortedVecMap<Symbol, f64>,
}

/// Result entry per input conviction, preserving input order.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvictionResultEntry {
    pub conviction_id: String,
    pub success: bool,
    pub order_ids: Vec<OrderId>,
    pub error: Option<String>,
}

/// An order generated by the final stage, not yet submitted.
#[derive(Debug, Clone)]
pub struct GeneratedOrder {
    pub conviction_id: String,
    pub spec: OrderSpec,
}

/// The full pipeline output.
#[derive(Debug, Clone, Default)]
pub struct ConvictionOutcome {
    pub results: Vec<ConvictionResultEntry>,
    pub orders: Vec<GeneratedOrder>,
    pub decision_log: Vec<String>,
}

impl Default for ConvictionResultEntry {
    fn default() -> Self {
        Self {
            conviction_id: String::new(),
            success: true,
            order_ids: Vec::new(),
            error: None,
        }
    }
}

/// Runs all five stages over a conviction batch.
pub fn run(
    convictions: &[Conviction],
    current_weights: &SortedVecMap<Symbol, f64>,
    last_prices: &SortedVecMap<Symbol, Price>,
    aum: f64,
    _now: DateTime<Utc>,
) -> ConvictionOutcome {
    run_with_config(
        &PipelineConfig::default(),
        convictions,
        current_weights,
        last_prices,
        aum,
    )
}

pub fn run_with_config(
    cfg: &PipelineConfig,
    convictions: &[Conviction],
    current_weights: &SortedVecMap<Symbol, f64>,
    last_prices: &SortedVecMap<Symbol, Price>,
    aum: f64,
) -> ConvictionOutcome {
    let mut log = Vec::new();
    let mut results: Vec<ConvictionResultEntry> = convictions
        .iter()
        .map(|c| ConvictionResultEntry {
            conviction_id: c.conviction_id.clone(),
            ..ConvictionResultEntry::default()
        })
        .collect();

    let mut book = alpha::process(cfg, convictions, &mut results, aum, &mut log);

    if let Err(gate) = risk::check_model_gate(cfg, &mut log) {
        for entry in &mut results {
            entry.success = false;
            entry.error = Some(gate.clone());
        }
        return ConvictionOutcome {
            results,
            orders: Vec::new(),
            decision_log: log,
        };
    }

    constraints::apply(cfg, &mut book, aum, &mut log);
    risk::apply(cfg, &mut book, &mut log);
    solver::solve(cfg, &mut book, &mut log);
    let orders = generator::generate(
        cfg,
        &book,
        convictions,
        current_weights,
        last_prices,
        aum,
        &mut log,
    );

    // A valid conviction that survives the stages but generates no order is
    // still a success (its delta was below the trade threshold).
    ConvictionOutcome {
        results,
        orders,
        decision_log: log,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::domain::conviction::Urgency;

    fn conviction(id: &str, symbol: &str, weight: f64, urgency: Urgency) -> Conviction {
        Conviction {
            conviction_id: id.to_string(),
            symbol: Symbol::from(symbol),
            target_weight: Some(weight),
            target_notional: None,
            score: None,
            urgency,
        }
    }

    fn prices(pairs: &[(&str, f64)]) -> SortedVecMap<Symbol, Price> {
        pairs
            .iter()
            .map(|(s, p)| (Symbol::from(*s), Price(*p)))
            .collect()
    }

    #[test]
    fn pipeline_generates_orders_for_meaningful_deltas() {
        let convictions = vec![
            conviction("c1", "AAPL", 0.05, Urgency::High),
            conviction("c2", "MSFT", 0.04, Urgency::Low),
        ];
        let outcome = run_with_config(
            &PipelineConfig::default(),
            &convictions,
            &SortedVecMap::new(),
            &prices(&[("AAPL", 100.0), ("MSFT", 200.0)]),
            1_000_000.0,
        );

        assert_eq!(outcome.results.len(), 2);
        assert!(outcome.results.iter().all(|r| r.success));
        assert_eq!(outcome.orders.len(), 2);
        assert!(!outcome.decision_log.is_empty());
    }

    #[test]
    fn pipeline_is_deterministic() {
        let convictions = vec![
            conviction("c1", "AAPL", 0.05, Urgency::Medium),
            conviction("c2", "MSFT", 0.08, Urgency::High),
        ];
        let px = prices(&[("AAPL", 100.0), ("MSFT", 200.0)]);

        let first = run_with_config(
            &PipelineConfig::default(),
            &convictions,
            &SortedVecMap::new(),
            &px,
            1_000_000.0,
        );
        let second = run_with_config(
            &PipelineConfig::default(),
            &convictions,
            &SortedVecMap::new(),
            &px,
            1_000_000.0,
        );

        assert_eq!(first.decision_log, second.decision_log);
        let specs_a: Vec<_> = first.orders.iter().map(|o| o.spec.clone()).collect();
        let specs_b: Vec<_> = second.orders.iter().map(|o| o.spec.clone()).collect();
        assert_eq!(specs_a, specs_b);
    }

    #[test]
    fn unsupported_risk_model_fails_everything() {
        let cfg = PipelineConfig {
            risk_model: "exotic_v9".to_string(),
            ..PipelineConfig::default()
        };
        let convictions = vec![conviction("c1", "AAPL", 0.05, Urgency::Low)];
        let outcome = run_with_config(
            &cfg,
            &convictions,
            &SortedVecMap::new(),
            &prices(&[("AAPL", 100.0)]),
            1_000_000.0,
        );
        assert!(outcome.orders.is_empty());
        assert!(outcome.results.iter().all(|r| !r.success));
    }

    #[test]
    fn results_preserve_input_order() {
        let convictions = vec![
            conviction("z-last", "MSFT", 0.02, Urgency::Low),
            conviction("a-first", "AAPL", 0.02, Urgency::Low),
        ];
        let outcome = run_with_config(
            &PipelineConfig::default(),
            &convictions,
            &SortedVecMap::new(),
            &prices(&[("AAPL", 100.0), ("MSFT", 200.0)]),
            1_000_000.0,
        );
        assert_eq!(outcome.results[0].conviction_id, "z-last");
        assert_eq!(outcome.results[1].conviction_id, "a-first");
    }
}
