use crate::engine::pipeline::{PipelineConfig, TargetBook};

const LEVERAGE_EPSILON: f64 = 1e-6;

/// Normalises the book to target leverage, then drops dust positions.
pub fn solve(cfg: &PipelineConfig, book: &mut TargetBook, log: &mut Vec<String>) {
    normalise_leverage(cfg, book, log);
    cleanup_positions(cfg, book, log);
}

fn normalise_leverage(cfg: &PipelineConfig, book: &mut TargetBook, log: &mut Vec<String>) {
    let current: f64 = book.weights.values().sum();
    if current.abs() < LEVERAGE_EPSILON {
        return;
    }
    if (current - cfg.target_leverage).abs() <= LEVERAGE_EPSILON {
        return;
    }
    let scale = cfg.target_leverage / current;
    for weight in book.weights.values_mut() {
        *weight *= scale;
    }
    log.push(format!(
        "solver: leverage_normalization {current:.6} -> {:.6} (scale {scale:.6})",
        cfg.target_leverage
    ));
}

fn cleanup_positions(cfg: &PipelineConfig, book: &mut TargetBook, log: &mut Vec<String>) {
    let min = cfg.min_position_size;
    let mut dropped: Vec<String> = Vec::new();
    book.weights.retain(|symbol, weight| {
        if weight.abs() < min {
            dropped.push(format!(
                "solver: position_cleanup {symbol} {weight:.6} below min {min}"
            ));
            false
        } else {
            true
        }
    });
    log.append(&mut dropped);
}
