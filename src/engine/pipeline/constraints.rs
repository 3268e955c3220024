use crate::engine::pipeline::{PipelineConfig, TargetBook};

/// Applies PM operational constraints to the target book.
///
/// Position limits always apply; the ADV liquidity cap only when enabled and
/// the symbol's average daily volume is known.
pub fn apply(cfg: &PipelineConfig, book: &mut TargetBook, aum: f64, log: &mut Vec<String>) {
    let limit = cfg.max_position_size;
    let mut clips: Vec<String> = Vec::new();

    for (symbol, weight) in book.weights.iter_mut() {
        if weight.abs() > limit {
            let original = *weight;
            *weight = limit.copysign(original);
            clips.push(format!(
                "constraint: pm_position_limit {symbol} {original:.6} -> {weight:.6} (limit {limit})"
            ));
        }
    }
    log.append(&mut clips);

    if !cfg.enable_liquidity_limits || aum <= 0.0 {
        return;
    }
    let mut liquidity_clips: Vec<String> = Vec::new();
    for (symbol, weight) in book.weights.iter_mut() {
        let Some(adv_usd) = book.adv_usd.get(symbol).copied() else {
            continue;
        };
        let cap = adv_usd * cfg.max_adv_participation / aum;
        if weight.abs() > cap {
            let original = *weight;
            *weight = cap.copysign(original);
            liquidity_clips.push(format!(
                "constraint: liquidity_limit {symbol} {original:.6} -> {weight:.6} (adv_usd {adv_usd}, participation {})",
                cfg.max_adv_participation
            ));
        }
    }
    log.append(&mut liquidity_clips);
}
