use std::collections::HashMap;

use crate::{
    config::EngineConfig,
    domain::{
        OrderId, Price, Quantity, RequestId,
        order::{Order, OrderType, Side},
    },
};

/// One execution against an order.
#[derive(Debug, Clone, PartialEq)]
pub struct Fill {
    pub order_id: OrderId,
    pub quantity: Quantity,
    pub price: Price,
}

/// Decides whether (and how much of) an order executes at the given price.
///
/// Market orders always execute, paying half the configured spread on their
/// side. Limit orders execute only when the last price crosses the limit:
/// buys at or below, sells at or above. When `available_volume` is given the
/// fill is capped at the configured participation share of it, which is how
/// resting orders fill partially, proportional to bar volume.
pub fn evaluate_order(
    order: &Order,
    last_price: Price,
    available_volume: Option<f64>,
    cfg: &EngineConfig,
) -> Option<Fill> {
    if !order.is_open() {
        return None;
    }

    let fill_price = match order.order_type {
        OrderType::Market => match order.side {
            Side::Buy => Price(last_price.0 + cfg.spread / 2.0),
            Side::Sell => Price((last_price.0 - cfg.spread / 2.0).max(0.0)),
        },
        OrderType::Limit => {
            let limit = order.price.expect("limit orders are validated to carry a price");
            let crossed = match order.side {
                Side::Buy => last_price.0 <= limit.0,
                Side::Sell => last_price.0 >= limit.0,
            };
            if !crossed {
                return None;
            }
            last_price
        }
    };

    let remaining = order.remaining_quantity().0;
    let quantity = match available_volume {
        Some(volume) => remaining.min(volume * cfg.fill_participation),
        None => remaining,
    };
    if quantity <= 0.0 {
        return None;
    }

    Some(Fill {
        order_id: order.order_id.clone(),
        quantity: Quantity(quantity),
        price: fill_price,
    })
}

/// All orders of one session, in submission order.
///
/// Also owns the engine-local idempotency index: the response bound to a
/// request id is replayed verbatim within the idempotency window.
#[derive(Debug, Default)]
pub struct OrderBook {
    orders: HashMap<OrderId, Order>,
    sequence: Vec<OrderId>,
    by_request: HashMap<RequestId, OrderId>,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, order: Order) {
        if let Some(request_id) = &order.request_id {
            self.by_request
                .insert(request_id.clone(), order.order_id.clone());
        }
        self.sequence.push(order.order_id.clone());
        self.orders.insert(order.order_id.clone(), order);
    }

    pub fn get(&self, order_id: &OrderId) -> Option<&Order> {
        self.orders.get(order_id)
    }

    pub fn get_mut(&mut self, order_id: &OrderId) -> Option<&mut Order> {
        self.orders.get_mut(order_id)
    }

    pub fn by_request(&self, request_id: &RequestId) -> Option<&Order> {
        self.by_request
            .get(request_id)
            .and_then(|id| self.orders.get(id))
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    /// Orders in submission order.
    pub fn in_sequence(&self) -> impl Iterator<Item = &Order> {
        self.sequence.iter().filter_map(|id| self.orders.get(id))
    }

    /// Ids of open orders, in submission order.
    pub fn open_order_ids(&self) -> Vec<OrderId> {
        self.sequence
            .iter()
            .filter(|id| self.orders.get(id).is_some_and(Order::is_open))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod test {
    use chrono::Utc;

    use super::*;
    use crate::domain::{SessionId, Symbol, UserId};

    fn order(side: Side, order_type: OrderType, qty: f64, price: Option<f64>) -> Order {
        Order::new(
            UserId::from("u1"),
            SessionId::from("s1"),
            Symbol::from("AAPL"),
            side,
            order_type,
            Quantity(qty),
            price.map(Price),
            None,
            Utc::now(),
        )
        .unwrap()
    }

    fn cfg() -> EngineConfig {
        EngineConfig {
            spread: 0.02,
            fill_participation: 0.25,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn market_buy_pays_half_spread() {
        let o = order(Side::Buy, OrderType::Market, 10.0, None);
        let fill = evaluate_order(&o, Price(100.0), None, &cfg()).unwrap();
        assert_eq!(fill.price, Price(100.01));
        assert_eq!(fill.quantity, Quantity(10.0));
    }

    #[test]
    fn market_sell_receives_half_spread() {
        let o = order(Side::Sell, OrderType::Market, 10.0, None);
        let fill = evaluate_order(&o, Price(100.0), None, &cfg()).unwrap();
        assert_eq!(fill.price, Price(99.99));
    }

    #[test]
    fn limit_buy_fills_only_at_or_below_limit() {
        let o = order(Side::Buy, OrderType::Limit, 10.0, Some(99.0));
        assert!(evaluate_order(&o, Price(100.0), None, &cfg()).is_none());
        let fill = evaluate_order(&o, Price(98.5), None, &cfg()).unwrap();
        assert_eq!(fill.price, Price(98.5));
    }

    #[test]
    fn limit_sell_fills_only_at_or_above_limit() {
        let o = order(Side::Sell, OrderType::Limit, 10.0, Some(101.0));
        assert!(evaluate_order(&o, Price(100.0), None, &cfg()).is_none());
        assert!(evaluate_order(&o, Price(101.0), None, &cfg()).is_some());
    }

    #[test]
    fn volume_caps_the_fill() {
        let o = order(Side::Buy, OrderType::Market, 1_000.0, None);
        // 25% participation of 400 volume = 100 shares.
        let fill = evaluate_order(&o, Price(50.0), Some(400.0), &cfg()).unwrap();
        assert_eq!(fill.quantity, Quantity(100.0));
    }

    #[test]
    fn terminal_orders_do_not_fill() {
        let mut o = order(Side::Buy, OrderType::Market, 10.0, None);
        o.cancel(Utc::now());
        assert!(evaluate_order(&o, Price(100.0), None, &cfg()).is_none());
    }

    #[test]
    fn book_preserves_submission_order() {
        let mut book = OrderBook::new();
        let first = order(Side::Buy, OrderType::Market, 1.0, None);
        let second = order(Side::Sell, OrderType::Limit, 2.0, Some(105.0));
        let first_id = first.order_id.clone();
        book.insert(first);
        book.insert(second);

        let ids: Vec<_> = book.in_sequence().map(|o| o.order_id.clone()).collect();
        assert_eq!(ids[0], first_id);
        assert_eq!(book.open_order_ids().len(), 2);
    }

    #[test]
    fn request_index_finds_orders() {
        let mut book = OrderBook::new();
        let mut o = order(Side::Buy, OrderType::Market, 1.0, None);
        o.request_id = Some(RequestId::from("r1"));
        let id = o.order_id.clone();
        book.insert(o);
        assert_eq!(book.by_request(&RequestId::from("r1")).unwrap().order_id, id);
        assert!(book.by_request(&RequestId::from("r2")).is_none());
    }
}
