use crate::engine::pipeline::{PipelineConfig, TargetBook};

/// Risk model families this engine build can evaluate.
const SUPPORTED_RISK_MODELS: &[&str] = &["factor_v1", "factor_v2", "statistical_v1"];

/// Gate on the configured risk model type.
///
/// An unsupported model fails the whole batch before any weights move; there
/// is no sensible partial behavior when the risk engine cannot run.
pub fn check_model_gate(cfg: &PipelineConfig, log: &mut Vec<String>) -> Result<(), String> {
    if SUPPORTED_RISK_MODELS.contains(&cfg.risk_model.as_str()) {
        log.push(format!("risk: model gate passed ({})", cfg.risk_model));
        Ok(())
    } else {
        let reason = format!("unsupported risk model '{}'", cfg.risk_model);
        log.push(format!("risk: model gate failed: {reason}"));
        Err(reason)
    }
}

/// Enforces the single-position hard cap.
pub fn apply(cfg: &PipelineConfig, book: &mut TargetBook, log: &mut Vec<String>) {
    let cap = cfg.single_position_hard_cap;
    let mut entries: Vec<String> = Vec::new();
    for (symbol, weight) in book.weights.iter_mut() {
        if weight.abs() > cap {
            let original = *weight;
            *weight = cap.copysign(original);
            entries.push(format!(
                "risk: hard_cap {symbol} {original:.6} -> {weight:.6} (cap {cap})"
            ));
        }
    }
    log.append(&mut entries);
}
