use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use tracing::{debug, warn};

use crate::{
    config::EngineConfig,
    domain::{
        OrderId, Price, Quantity, RequestId, SessionId, Symbol, UserId,
        account::CashFlow,
        bar::MinuteBar,
        conviction::Conviction,
        impact::ImpactState,
        order::{Order, OrderType, Side},
    },
    engine::{
        accounts::AccountsLedger,
        execution::{Fill, OrderBook, evaluate_order},
        pipeline::{self, ConvictionOutcome},
        portfolio::Portfolio,
    },
    error::{EngineError, SimdeskResult},
    generated::simdesk::v1 as pb,
    sorted_vec_map::SortedVecMap,
};

/// Parameters of one order submission.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderSpec {
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Quantity,
    pub price: Option<Price>,
    pub request_id: Option<RequestId>,
}

/// Result of a submission, already shaped for the RPC response.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// The order was recorded (and possibly filled).
    Accepted { order_id: OrderId },
    /// A previous submission with the same request id is replayed.
    Replayed { order_id: OrderId },
    /// The order was recorded as REJECTED; the RPC still succeeds.
    Rejected {
        order_id: Option<OrderId>,
        error: String,
    },
}

/// The authoritative state of one simulator session.
///
/// Owned exclusively by the engine coordinator task; every method here is
/// synchronous, so a minute tick runs as one non-suspending critical section
/// and all mutations for bar T are observable before the frame for T is
/// emitted.
#[derive(Debug)]
pub struct EngineState {
    pub session_id: SessionId,
    pub user_id: UserId,
    cfg: EngineConfig,
    last_prices: SortedVecMap<Symbol, Price>,
    portfolio: Portfolio,
    accounts: AccountsLedger,
    impacts: SortedVecMap<Symbol, ImpactState>,
    orders: OrderBook,
    /// Orders mutated since the last emitted frame.
    dirty_orders: Vec<OrderId>,
    update_seq: u64,
    persisted_flow_cursor: usize,
}

impl EngineState {
    pub fn new(session_id: SessionId, user_id: UserId, cfg: EngineConfig) -> Self {
        let accounts = AccountsLedger::new(cfg.base_currency.clone(), cfg.initial_cash);
        Self {
            session_id,
            user_id,
            cfg,
            last_prices: SortedVecMap::new(),
            portfolio: Portfolio::new(),
            accounts,
            impacts: SortedVecMap::new(),
            orders: OrderBook::new(),
            dirty_orders: Vec::new(),
            update_seq: 0,
            persisted_flow_cursor: 0,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn portfolio(&self) -> &Portfolio {
        &self.portfolio
    }

    pub fn accounts(&self) -> &AccountsLedger {
        &self.accounts
    }

    pub fn order(&self, order_id: &OrderId) -> Option<&Order> {
        self.orders.get(order_id)
    }

    pub fn last_price(&self, symbol: &Symbol) -> Option<Price> {
        self.last_prices.get(symbol).copied()
    }

    /// Trading cash plus position market value.
    pub fn aum(&self) -> f64 {
        let cash = self.accounts.trading_balance().to_f64().unwrap_or(0.0);
        cash + self.portfolio.market_value()
    }

    // ============================================================================
    // Order entry
    // ============================================================================

    /// Validates, records and synchronously executes an order against the
    /// latest in-memory market data.
    ///
    /// Idempotent on request id: an identical replay returns the original
    /// order; a replay with a different payload is a conflict. Execution
    /// failures are recoverable and produce a REJECTED order.
    pub fn submit_order(&mut self, spec: OrderSpec, now: DateTime<Utc>) -> SubmitOutcome {
        if let Some(request_id) = &spec.request_id
            && let Some(existing) = self.orders.by_request(request_id)
        {
            if order_matches_spec(existing, &spec) {
                debug!(order_id = %existing.order_id, request_id = %request_id, "replaying submission");
                return SubmitOutcome::Replayed {
                    order_id: existing.order_id.clone(),
                };
            }
            return SubmitOutcome::Rejected {
                order_id: None,
                error: EngineError::IdempotencyConflict {
                    request_id: request_id.to_string(),
                }
                .to_string(),
            };
        }

        let order = match Order::new(
            self.user_id.clone(),
            self.session_id.clone(),
            spec.symbol.clone(),
            spec.side,
            spec.order_type,
            spec.quantity,
            spec.price,
            spec.request_id.clone(),
            now,
        ) {
            Ok(order) => order,
            Err(err) => {
                return SubmitOutcome::Rejected {
                    order_id: None,
                    error: err.to_string(),
                };
            }
        };
        let order_id = order.order_id.clone();
        self.orders.insert(order);
        self.dirty_orders.push(order_id.clone());

        let Some(last_price) = self.last_prices.get(&spec.symbol).copied() else {
            // No market data yet for this symbol. Market orders cannot rest.
            if spec.order_type == OrderType::Market {
                let error = EngineError::UnknownSymbol(spec.symbol.to_string()).to_string();
                if let Some(order) = self.orders.get_mut(&order_id) {
                    order.reject(error.clone(), now);
                }
                return SubmitOutcome::Rejected {
                    order_id: Some(order_id),
                    error,
                };
            }
            return SubmitOutcome::Accepted { order_id };
        };

        let fill = {
            let order = self.orders.get(&order_id).expect("just inserted");
            evaluate_order(order, last_price, None, &self.cfg)
        };
        if let Some(fill) = fill
            && let Err(err) = self.apply_fill(&fill, now)
        {
            let error = err.to_string();
            if let Some(order) = self.orders.get_mut(&order_id) {
                order.reject(error.clone(), now);
            }
            return SubmitOutcome::Rejected {
                order_id: Some(order_id),
                error,
            };
        }

        SubmitOutcome::Accepted { order_id }
    }

    /// Cancels an order. A cancel of an already-terminal order with a known
    /// id succeeds without effect.
    pub fn cancel_order(&mut self, order_id: &OrderId, now: DateTime<Utc>) -> SimdeskResult<()> {
        let order = self
            .orders
            .get_mut(order_id)
            .ok_or_else(|| EngineError::OrderNotFound(order_id.to_string()))?;
        order.cancel(now);
        self.dirty_orders.push(order_id.clone());
        Ok(())
    }

    /// Runs the conviction pipeline and routes the generated orders through
    /// the standard submission path.
    pub fn submit_convictions(
        &mut self,
        convictions: Vec<Conviction>,
        now: DateTime<Utc>,
    ) -> ConvictionOutcome {
        let aum = self.aum();
        let current_weights = self.portfolio.weights(aum);
        let mut outcome =
            pipeline::run(&convictions, &current_weights, &self.last_prices, aum, now);

        for generated in outcome.orders.drain(..) {
            let result = self.submit_order(generated.spec, now);
            let entry = outcome
                .results
                .iter_mut()
                .find(|r| r.conviction_id == generated.conviction_id)
                .expect("pipeline emits a result per conviction");
            match result {
                SubmitOutcome::Accepted { order_id } | SubmitOutcome::Replayed { order_id } => {
                    entry.order_ids.push(order_id);
                }
                SubmitOutcome::Rejected { error, .. } => {
                    entry.success = false;
                    entry.error = Some(error);
                }
            }
        }
        outcome
    }

    // ============================================================================
    // Minute tick (steps 2..6 of the tick algorithm)
    // ============================================================================

    /// Applies one batch of minute bars and emits the frame for it.
    ///
    /// Gap handling (step 1) happens upstream in the replay gate; by the time
    /// a batch reaches this method it is in causal order.
    pub fn apply_bar_batch(&mut self, bars: &[MinuteBar], now: DateTime<Utc>) -> pb::ExchangeDataUpdate {
        // 2. Latest prices and mark-to-market.
        for bar in bars {
            let last = bar.last_price();
            self.last_prices.insert(bar.symbol.clone(), last);
            self.portfolio.revalue(&bar.symbol, last);
        }

        // 3. Impact decay.
        let decay_rate = self.cfg.impact_decay_rate;
        for impact in self.impacts.values_mut() {
            impact.decay(decay_rate);
        }
        self.impacts.retain(|_, impact| !impact.is_negligible());

        // 4./5. Evaluate open orders against each bar and settle fills.
        for bar in bars {
            for order_id in self.orders.open_order_ids() {
                let fill = {
                    let order = self.orders.get(&order_id).expect("open id is present");
                    if order.symbol != bar.symbol {
                        continue;
                    }
                    evaluate_order(order, bar.last_price(), Some(bar.volume.0), &self.cfg)
                };
                if let Some(fill) = fill {
                    match self.apply_fill(&fill, now) {
                        Ok(()) => self.dirty_orders.push(order_id),
                        Err(err) => {
                            warn!(order_id = %order_id, error = %err, "order rejected on tick");
                            let msg = err.to_string();
                            if let Some(order) = self.orders.get_mut(&order_id) {
                                order.reject(msg, now);
                            }
                            self.dirty_orders.push(order_id);
                        }
                    }
                }
            }
        }

        // 6. Build the frame last; every mutation above is already committed.
        self.update_seq += 1;
        let timestamp_ms = bars
            .iter()
            .map(|b| b.timestamp_utc.timestamp_millis())
            .max()
            .unwrap_or_else(|| now.timestamp_millis());
        let dirty = std::mem::take(&mut self.dirty_orders);

        pb::ExchangeDataUpdate {
            update_id: self.update_seq,
            timestamp_ms,
            market_data: bars.iter().map(pb::MarketDataBar::from).collect(),
            orders_data: self.orders_snapshot(&dirty),
            portfolio: Some(self.portfolio_snapshot()),
        }
    }

    fn apply_fill(&mut self, fill: &Fill, now: DateTime<Utc>) -> SimdeskResult<()> {
        let (symbol, side) = {
            let order = self
                .orders
                .get(&fill.order_id)
                .ok_or_else(|| EngineError::OrderNotFound(fill.order_id.to_string()))?;
            (order.symbol.clone(), order.side)
        };
        let notional = fill.quantity.0 * fill.price.0;

        // Cash first: an overdraft must reject the fill before any state moves.
        self.accounts
            .settle_fill(side == Side::Buy, notional, &symbol, &fill.order_id, now)?;
        if let Err(err) = self
            .portfolio
            .apply_fill(&symbol, side, fill.quantity, fill.price)
        {
            // Unwind the cash leg so the rejection leaves no trace.
            self.accounts
                .settle_fill(side == Side::Sell, notional, &symbol, &fill.order_id, now)?;
            return Err(err);
        }
        self.accounts.charge_fee(
            notional,
            self.cfg.fee_bps,
            &symbol,
            &fill.order_id,
            now,
        )?;

        let impact = self
            .impacts
            .get_or_insert_with(symbol.clone(), || ImpactState::flat(symbol.clone()));
        impact.apply_trade(
            fill.order_id.clone(),
            fill.price,
            fill.quantity.0,
            self.cfg.impact_coefficient,
            now,
        );

        let order = self
            .orders
            .get_mut(&fill.order_id)
            .ok_or_else(|| EngineError::OrderNotFound(fill.order_id.to_string()))?;
        order.apply_fill(fill.quantity, fill.price, now)?;
        Ok(())
    }

    // ============================================================================
    // Snapshots
    // ============================================================================

    pub fn portfolio_snapshot(&self) -> pb::PortfolioStatus {
        let cash = self.accounts.trading_balance().to_f64().unwrap_or(0.0);
        pb::PortfolioStatus {
            cash_balance: cash,
            total_value: cash + self.portfolio.market_value(),
            positions: self
                .portfolio
                .positions()
                .map(|p| pb::PositionStatus {
                    symbol: p.symbol.to_string(),
                    quantity: p.quantity.0,
                    average_cost: p.average_cost.0,
                    market_value: p.market_value,
                })
                .collect(),
        }
    }

    /// Open orders plus any orders mutated since the last frame, in
    /// submission order.
    fn orders_snapshot(&self, dirty: &[OrderId]) -> Vec<pb::OrderData> {
        self.orders
            .in_sequence()
            .filter(|o| o.is_open() || dirty.contains(&o.order_id))
            .map(order_to_pb)
            .collect()
    }

    /// Flow records not yet handed to persistence.
    pub fn unpersisted_flows(&mut self) -> Vec<CashFlow> {
        let flows = self.accounts.flows();
        let new = flows[self.persisted_flow_cursor.min(flows.len())..].to_vec();
        self.persisted_flow_cursor = flows.len();
        new
    }
}

pub fn order_to_pb(order: &Order) -> pb::OrderData {
    pb::OrderData {
        order_id: order.order_id.to_string(),
        symbol: order.symbol.to_string(),
        side: order.side.to_string(),
        order_type: order.order_type.to_string(),
        quantity: order.quantity.0,
        price: order.price.map(|p| p.0).unwrap_or_default(),
        status: order.status.to_string(),
        filled_quantity: order.filled_quantity.0,
        average_price: order.average_price.0,
    }
}

fn order_matches_spec(order: &Order, spec: &OrderSpec) -> bool {
    order.symbol == spec.symbol
        && order.side == spec.side
        && order.order_type == spec.order_type
        && order.quantity == spec.quantity
        && order.price == spec.price
}
