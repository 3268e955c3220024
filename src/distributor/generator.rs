use chrono::{DateTime, Utc};
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::domain::{Price, Quantity, Symbol, bar::MinuteBar};

/// Seed prices for household names; anything else starts at a uniform draw.
const BASE_PRICES: &[(&str, f64)] = &[
    ("AAPL", 190.0),
    ("MSFT", 420.0),
    ("GOOGL", 160.0),
    ("AMZN", 180.0),
    ("TSLA", 200.0),
    ("NVDA", 930.0),
    ("JPM", 195.0),
    ("V", 280.0),
];

const MIN_PRICE: f64 = 1.0;
const DRIFT_PER_MINUTE: f64 = 0.0001;

struct SymbolState {
    symbol: Symbol,
    price: f64,
    sigma: f64,
}

/// Deterministic (given a seed) geometric-Brownian-motion bar generator.
///
/// Each minute every symbol takes one multiplicative step with a slight
/// upward drift; occasionally a symbol's volatility is re-drawn, which is
/// what produces calm and stormy stretches.
pub struct BarGenerator {
    states: Vec<SymbolState>,
    rng: StdRng,
    sigma_redraw_probability: f64,
}

impl BarGenerator {
    pub fn new(symbols: &[String], seed: Option<u64>, sigma_redraw_probability: f64) -> Self {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let states = symbols
            .iter()
            .map(|raw| {
                let price = BASE_PRICES
                    .iter()
                    .find(|(name, _)| name == raw)
                    .map(|(_, price)| *price)
                    .unwrap_or_else(|| rng.random_range(5.0..500.0));
                SymbolState {
                    symbol: Symbol::from(raw.as_str()),
                    price,
                    sigma: draw_sigma(&mut rng),
                }
            })
            .collect();
        Self {
            states,
            rng,
            sigma_redraw_probability,
        }
    }

    pub fn price(&self, symbol: &Symbol) -> Option<f64> {
        self.states
            .iter()
            .find(|s| &s.symbol == symbol)
            .map(|s| s.price)
    }

    /// One bar per tracked symbol for the given minute boundary.
    pub fn generate(&mut self, timestamp_utc: DateTime<Utc>) -> Vec<MinuteBar> {
        let mut bars = Vec::with_capacity(self.states.len());
        for state in &mut self.states {
            if self.rng.random_bool(self.sigma_redraw_probability) {
                state.sigma = draw_sigma(&mut self.rng);
            }

            let open = state.price;
            let step = DRIFT_PER_MINUTE + state.sigma * standard_normal(&mut self.rng);
            let close = (open * (1.0 + step)).max(MIN_PRICE);

            let high = close.max(open) * (1.0 + self.rng.random_range(0.0..0.005));
            let low = (close.min(open) * (1.0 - self.rng.random_range(0.0..0.005))).max(MIN_PRICE);
            let volume: f64 = self.rng.random_range(1_000.0..100_000.0);
            let vwap = (open + high + low + close) / 4.0;

            state.price = close;
            bars.push(MinuteBar {
                symbol: state.symbol.clone(),
                timestamp_utc,
                open: Price(round2(open)),
                high: Price(round2(high)),
                low: Price(round2(low)),
                close: Price(round2(close)),
                volume: Quantity(volume.round()),
                vwap: Price(round2(vwap)),
            });
        }
        bars
    }
}

fn draw_sigma(rng: &mut StdRng) -> f64 {
    rng.random_range(0.0005..0.01)
}

/// Box-Muller transform over two uniform draws.
fn standard_normal(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.random_range(f64::EPSILON..1.0);
    let u2: f64 = rng.random_range(0.0..1.0);
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod test {
    use chrono::TimeZone;

    use super::*;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 14, 30, 0).unwrap()
    }

    fn symbols() -> Vec<String> {
        vec!["AAPL".to_string(), "XYZ".to_string()]
    }

    #[test]
    fn generates_one_bar_per_symbol() {
        let mut generator = BarGenerator::new(&symbols(), Some(7), 0.05);
        let bars = generator.generate(ts());
        assert_eq!(bars.len(), 2);
        for bar in &bars {
            assert!(bar.is_minute_aligned());
            assert!(bar.low.0 <= bar.open.0.max(bar.close.0));
            assert!(bar.high.0 >= bar.open.0.min(bar.close.0));
            assert!(bar.close.0 >= 1.0);
            assert!(bar.volume.0 >= 1_000.0);
        }
    }

    #[test]
    fn same_seed_same_bars() {
        let mut a = BarGenerator::new(&symbols(), Some(42), 0.05);
        let mut b = BarGenerator::new(&symbols(), Some(42), 0.05);
        assert_eq!(a.generate(ts()), b.generate(ts()));
    }

    #[test]
    fn different_seeds_diverge() {
        let mut a = BarGenerator::new(&symbols(), Some(1), 0.05);
        let mut b = BarGenerator::new(&symbols(), Some(2), 0.05);
        assert_ne!(a.generate(ts()), b.generate(ts()));
    }

    #[test]
    fn known_symbols_start_at_base_prices() {
        let generator = BarGenerator::new(&symbols(), Some(7), 0.05);
        assert_eq!(generator.price(&Symbol::from("AAPL")), Some(190.0));
    }

    #[test]
    fn successive_bars_chain_open_to_close() {
        let mut generator = BarGenerator::new(&["AAPL".to_string()], Some(9), 0.05);
        let first = generator.generate(ts());
        let second = generator.generate(ts() + chrono::Duration::minutes(1));
        assert_eq!(second[0].open, first[0].close);
    }
}
