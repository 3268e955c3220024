use crate::{
    domain::{
        Price, Quantity, Symbol,
        conviction::{Conviction, Urgency},
        order::{OrderType, Side},
    },
    engine::{
        pipeline::{GeneratedOrder, PipelineConfig, TargetBook},
        state::OrderSpec,
    },
    sorted_vec_map::SortedVecMap,
};

/// Emits one order per symbol whose weight delta clears the trade threshold.
///
/// Quantities are derived from the delta notional at the last traded price;
/// sell quantities are clamped to the current holding (long-only engine).
/// Urgency execution parameters are recorded in the decision log.
pub fn generate(
    cfg: &PipelineConfig,
    book: &TargetBook,
    convictions: &[Conviction],
    current_weights: &SortedVecMap<Symbol, f64>,
    last_prices: &SortedVecMap<Symbol, Price>,
    aum: f64,
    log: &mut Vec<String>,
) -> Vec<GeneratedOrder> {
    if aum <= 0.0 {
        log.push("generator: zero AUM, no orders".to_string());
        return Vec::new();
    }
    let threshold = cfg.min_trade_size / aum;
    let mut orders = Vec::new();

    // Union of targeted and currently-held symbols, in deterministic order.
    let mut symbols: Vec<&Symbol> = book.weights.keys().collect();
    for symbol in current_weights.keys() {
        if !book.weights.contains_key(symbol) && conviction_for(convictions, symbol).is_some() {
            symbols.push(symbol);
        }
    }
    symbols.sort();

    for symbol in symbols {
        let target = book.weights.get(symbol).copied().unwrap_or(0.0);
        let current = current_weights.get(symbol).copied().unwrap_or(0.0);
        let delta = target - current;

        if delta.abs() <= threshold {
            continue;
        }
        let Some(conviction) = conviction_for(convictions, symbol) else {
            continue;
        };
        let Some(last_price) = last_prices.get(symbol).copied() else {
            log.push(format!("generator: no market data for {symbol}, skipped"));
            continue;
        };
        if last_price.0 <= 0.0 {
            continue;
        }

        let delta_notional = delta * aum;
        let side = if delta_notional > 0.0 {
            Side::Buy
        } else {
            Side::Sell
        };
        let mut quantity = delta_notional.abs() / last_price.0;
        if side == Side::Sell {
            let held = current * aum / last_price.0;
            quantity = quantity.min(held);
        }
        // Share quantities floor at four decimals.
        quantity = (quantity * 1e4).floor() / 1e4;
        if quantity <= 0.0 {
            continue;
        }

        let urgency = book
            .urgency
            .get(symbol)
            .copied()
            .unwrap_or(Urgency::Medium);
        log.push(format!(
            "generator: {symbol} {side} {quantity:.4} @ market (Δw {delta:.6}, participation {}, max {}h)",
            urgency.participation_rate(),
            urgency.max_duration_hours()
        ));

        orders.push(GeneratedOrder {
            conviction_id: conviction.conviction_id.clone(),
            spec: OrderSpec {
                symbol: symbol.clone(),
                side,
                order_type: OrderType::Market,
                quantity: Quantity(quantity),
                price: None,
                request_id: None,
            },
        });
    }

    orders
}

fn conviction_for<'a>(convictions: &'a [Conviction], symbol: &Symbol) -> Option<&'a Conviction> {
    convictions.iter().find(|c| &c.symbol == symbol)
}
