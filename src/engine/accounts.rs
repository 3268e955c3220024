use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::{
    domain::{
        OrderId, Symbol,
        account::{Account, CashFlow, CashFlowKind, EXTERNAL_ACCOUNT, PORTFOLIO_ACCOUNT},
    },
    error::{EngineError, SimdeskResult},
};

/// The label of the account trades settle against.
pub const TRADING_ACCOUNT: &str = "TRADING";

fn dec(value: f64) -> Decimal {
    Decimal::from_f64_retain(value).unwrap_or(Decimal::ZERO)
}

/// Cash accounts plus the immutable flow ledger.
///
/// Every balance mutation goes through [`AccountsLedger::transfer`], which
/// both moves the balances and appends the matching [`CashFlow`] record, so
/// the ledger invariant (balance equals net of flows plus seed) holds by
/// construction.
#[derive(Debug, Clone)]
pub struct AccountsLedger {
    accounts: HashMap<(String, String), Account>,
    flows: Vec<CashFlow>,
    /// FX rates into the base currency; the base currency maps to 1.
    fx_rates: HashMap<String, Decimal>,
    base_currency: String,
    /// Seeded balances predate the flow ledger.
    seed: HashMap<(String, String), Decimal>,
}

impl AccountsLedger {
    pub fn new(base_currency: impl Into<String>, initial_cash: f64) -> Self {
        let base_currency = base_currency.into();
        let mut fx_rates = HashMap::new();
        fx_rates.insert(base_currency.clone(), Decimal::ONE);

        let mut ledger = Self {
            accounts: HashMap::new(),
            flows: Vec::new(),
            fx_rates,
            base_currency: base_currency.clone(),
            seed: HashMap::new(),
        };
        ledger.seed_account(TRADING_ACCOUNT, &base_currency, dec(initial_cash));
        ledger
    }

    /// Installs an opening balance outside the flow ledger.
    pub fn seed_account(&mut self, label: &str, currency: &str, balance: Decimal) {
        let key = (label.to_string(), currency.to_string());
        self.seed.insert(key.clone(), balance);
        self.accounts
            .insert(key, Account::new(label, currency, balance));
    }

    pub fn set_fx_rate(&mut self, currency: impl Into<String>, rate: Decimal) {
        self.fx_rates.insert(currency.into(), rate);
    }

    pub fn fx_rate(&self, currency: &str) -> Decimal {
        self.fx_rates.get(currency).copied().unwrap_or(Decimal::ONE)
    }

    pub fn balance(&self, label: &str, currency: &str) -> Decimal {
        self.accounts
            .get(&(label.to_string(), currency.to_string()))
            .map(|a| a.balance)
            .unwrap_or(Decimal::ZERO)
    }

    pub fn trading_balance(&self) -> Decimal {
        self.balance(TRADING_ACCOUNT, &self.base_currency)
    }

    pub fn flows(&self) -> &[CashFlow] {
        &self.flows
    }

    pub fn drain_flows(&mut self) -> Vec<CashFlow> {
        std::mem::take(&mut self.flows)
    }

    /// Moves `amount` between two accounts and appends the flow record.
    ///
    /// The portfolio and external pseudo-accounts are counterparties only;
    /// they carry no balance of their own.
    #[allow(clippy::too_many_arguments)]
    fn transfer(
        &mut self,
        kind: CashFlowKind,
        from_account: &str,
        to_account: &str,
        currency: &str,
        amount: Decimal,
        instrument: Option<Symbol>,
        trade_id: Option<OrderId>,
        description: Option<String>,
        timestamp: DateTime<Utc>,
    ) -> SimdeskResult<()> {
        if amount < Decimal::ZERO {
            return Err(EngineError::Execution(format!(
                "negative transfer amount {amount}"
            ))
            .into());
        }
        let fx = self.fx_rate(currency);

        if !is_pseudo_account(from_account) {
            let balance = self.balance(from_account, currency);
            if balance < amount {
                return Err(EngineError::InsufficientFunds {
                    needed: amount.to_string(),
                    available: balance.to_string(),
                }
                .into());
            }
            let account = self
                .accounts
                .get_mut(&(from_account.to_string(), currency.to_string()))
                .expect("balance check implies account exists");
            account.balance -= amount;
        }
        if !is_pseudo_account(to_account) {
            let account = self
                .accounts
                .entry((to_account.to_string(), currency.to_string()))
                .or_insert_with(|| Account::new(to_account, currency, Decimal::ZERO));
            account.balance += amount;
        }

        self.flows.push(CashFlow {
            timestamp,
            kind,
            from_account: from_account.to_string(),
            from_currency: currency.to_string(),
            from_fx: fx,
            from_amount: amount,
            to_account: to_account.to_string(),
            to_currency: currency.to_string(),
            to_fx: fx,
            to_amount: amount,
            instrument,
            trade_id,
            description,
        });
        Ok(())
    }

    /// Settles a fill: cash out on buys, cash in on sells.
    pub fn settle_fill(
        &mut self,
        is_buy: bool,
        notional: f64,
        symbol: &Symbol,
        trade_id: &OrderId,
        timestamp: DateTime<Utc>,
    ) -> SimdeskResult<()> {
        let amount = dec(notional);
        let (from, to) = if is_buy {
            (TRADING_ACCOUNT, PORTFOLIO_ACCOUNT)
        } else {
            (PORTFOLIO_ACCOUNT, TRADING_ACCOUNT)
        };
        let base = self.base_currency.clone();
        self.transfer(
            CashFlowKind::PortfolioTransfer,
            from,
            to,
            &base,
            amount,
            Some(symbol.clone()),
            Some(trade_id.clone()),
            Some(format!(
                "{} {symbol}",
                if is_buy { "buy" } else { "sell" }
            )),
            timestamp,
        )
    }

    /// Charges the execution fee on a fill to the external account.
    pub fn charge_fee(
        &mut self,
        notional: f64,
        fee_bps: f64,
        symbol: &Symbol,
        trade_id: &OrderId,
        timestamp: DateTime<Utc>,
    ) -> SimdeskResult<()> {
        let fee = dec(notional * fee_bps / 10_000.0);
        if fee <= Decimal::ZERO {
            return Ok(());
        }
        let base = self.base_currency.clone();
        self.transfer(
            CashFlowKind::PortfolioFee,
            TRADING_ACCOUNT,
            EXTERNAL_ACCOUNT,
            &base,
            fee,
            Some(symbol.clone()),
            Some(trade_id.clone()),
            Some("execution fee".to_string()),
            timestamp,
        )
    }

    /// Net of all recorded flows for an account, in base currency.
    pub fn net_flows(&self, label: &str) -> Decimal {
        self.flows.iter().map(|f| f.net_for(label)).sum()
    }

    /// Checks the ledger invariant for every real account.
    pub fn verify_balances(&self) -> bool {
        self.accounts.iter().all(|((label, currency), account)| {
            let seed = self
                .seed
                .get(&(label.clone(), currency.clone()))
                .copied()
                .unwrap_or(Decimal::ZERO);
            let fx = self.fx_rate(currency);
            account.balance * fx == seed * fx + self.net_flows(label)
        })
    }
}

fn is_pseudo_account(label: &str) -> bool {
    label == PORTFOLIO_ACCOUNT || label == EXTERNAL_ACCOUNT
}
