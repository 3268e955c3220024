use crate::{
    domain::conviction::Conviction,
    engine::pipeline::{ConvictionResultEntry, PipelineConfig, TargetBook},
};

/// Validates convictions and normalises them into target weights.
///
/// Exactly one of `target_weight`, `target_notional` or `score` must be set.
/// Notionals divide by AUM; scores are clamped to `[-1, 1]` and scaled by the
/// PM position limit. Weights outside `[-1, 1]` are invalid. The engine is
/// long-only, so negative targets floor at zero (an exit intent).
pub fn process(
    cfg: &PipelineConfig,
    convictions: &[Conviction],
    results: &mut [ConvictionResultEntry],
    aum: f64,
    log: &mut Vec<String>,
) -> TargetBook {
    let mut book = TargetBook::default();

    for (conviction, entry) in convictions.iter().zip(results.iter_mut()) {
        let weight = match normalised_weight(cfg, conviction, aum) {
            Ok(weight) => weight,
            Err(reason) => {
                entry.success = false;
                entry.error = Some(reason.clone());
                log.push(format!(
                    "alpha: rejected {} ({}): {reason}",
                    conviction.conviction_id, conviction.symbol
                ));
                continue;
            }
        };

        let floored = weight.max(0.0);
        if weight < 0.0 {
            log.push(format!(
                "alpha: floored {} to 0 (long-only engine)",
                conviction.symbol
            ));
        }
        book.weights.insert(conviction.symbol.clone(), floored);
        book.urgency
            .insert(conviction.symbol.clone(), conviction.urgency);
        log.push(format!(
            "alpha: {} target weight {:.6} urgency {}",
            conviction.symbol, floored, conviction.urgency
        ));
    }

    book
}

fn normalised_weight(
    cfg: &PipelineConfig,
    conviction: &Conviction,
    aum: f64,
) -> Result<f64, String> {
    let weight = match (
        conviction.target_weight,
        conviction.target_notional,
        conviction.score,
    ) {
        (Some(w), _, _) => w,
        (None, Some(notional), _) => {
            if aum <= 0.0 {
                return Err("cannot convert notional target with zero AUM".to_string());
            }
            notional / aum
        }
        (None, None, Some(score)) => score.clamp(-1.0, 1.0) * cfg.max_position_size,
        (None, None, None) => {
            return Err("conviction carries no target weight, notional or score".to_string());
        }
    };

    if !weight.is_finite() {
        return Err(format!("target weight {weight} is not finite"));
    }
    if weight.abs() > 1.0 {
        return Err(format!("target weight {weight} outside [-1, 1]"));
    }
    Ok(weight)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::domain::{Symbol, conviction::Urgency};

    fn entry(id: &str) -> ConvictionResultEntry {
        ConvictionResultEntry {
            conviction_id: id.to_string(),
            ..ConvictionResultEntry::default()
        }
    }

    fn conviction(symbol: &str) -> Conviction {
        Conviction {
            conviction_id: "c1".to_string(),
            symbol: Symbol::from(symbol),
            target_weight: None,
            target_notional: None,
            score: None,
            urgency: Urgency::Medium,
        }
    }

    #[test]
    fn notional_converts_through_aum() {
        let mut c = conviction("AAPL");
        c.target_notional = Some(50_000.0);
        let mut results = vec![entry("c1")];
        let mut log = Vec::new();
        let book = process(
            &PipelineConfig::default(),
            &[c],
            &mut results,
            1_000_000.0,
            &mut log,
        );
        assert!((book.weights[&Symbol::from("AAPL")] - 0.05).abs() < 1e-12);
        assert!(results[0].success);
    }

    #[test]
    fn score_scales_by_position_limit() {
        let mut c = conviction("AAPL");
        c.score = Some(2.0); // clamped to 1.0
        let mut results = vec![entry("c1")];
        let mut log = Vec::new();
        let book = process(
            &PipelineConfig::default(),
            &[c],
            &mut results,
            1_000_000.0,
            &mut log,
        );
        assert!((book.weights[&Symbol::from("AAPL")] - 0.10).abs() < 1e-12);
    }

    #[test]
    fn out_of_bounds_weight_is_rejected() {
        let mut c = conviction("AAPL");
        c.target_weight = Some(1.5);
        let mut results = vec![entry("c1")];
        let mut log = Vec::new();
        let book = process(
            &PipelineConfig::default(),
            &[c],
            &mut results,
            1_000_000.0,
            &mut log,
        );
        assert!(book.weights.is_empty());
        assert!(!results[0].success);
        assert!(results[0].error.as_deref().unwrap().contains("outside"));
    }

    #[test]
    fn empty_conviction_is_rejected() {
        let c = conviction("AAPL");
        let mut results = vec![entry("c1")];
        let mut log = Vec::new();
        process(
            &PipelineConfig::default(),
            &[c],
            &mut results,
            1_000_000.0,
            &mut log,
        );
        assert!(!results[0].success);
    }

    #[test]
    fn negative_weight_floors_to_exit() {
        let mut c = conviction("AAPL");
        c.target_weight = Some(-0.05);
        let mut results = vec![entry("c1")];
        let mut log = Vec::new();
        let book = process(
            &PipelineConfig::default(),
            &[c],
            &mut results,
            1_000_000.0,
            &mut log,
        );
        assert_eq!(book.weights[&Symbol::from("AAPL")], 0.0);
        assert!(results[0].success);
    }
}
