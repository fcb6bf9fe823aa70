//! Desired ladder math.
//!
//! Rung indices are signed: negative is a buy, positive is a sell, and
//! magnitude is the distance from the inside. Prices fan out
//! geometrically from a start position one tick inside the current best
//! bid/ask, rounded to the instrument's tick precision.

use rand::Rng;

use crate::config::Config;
use crate::error::MarketError;
use crate::exchange::types::{round_to, Instrument, Side, Ticker};

/// One rung of the ladder wanted this tick. Ephemeral: recomputed from
/// scratch on every pass.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredOrder {
    pub side: Side,
    pub price: f64,
    pub qty: i64,
}

#[derive(Debug, Clone)]
pub struct Ladder {
    start_buy: f64,
    start_sell: f64,
    tick_log: u32,
    interval: f64,
    maintain_spreads: bool,
}

impl Ladder {
    /// Derive start positions from the current ticker. When our own
    /// order already is the best bid or ask, maintain-spreads mode
    /// holds the start there instead of stepping further inside, so we
    /// never walk our own quotes inward until they collide.
    pub fn from_market(
        ticker: &Ticker,
        instrument: &Instrument,
        own_highest_buy: Option<f64>,
        own_lowest_sell: Option<f64>,
        cfg: &Config,
    ) -> Self {
        let tick = instrument.tick_size;
        let mut start_buy = ticker.buy + tick;
        let mut start_sell = ticker.sell - tick;

        if cfg.maintain_spreads {
            if own_highest_buy == Some(ticker.buy) {
                start_buy = ticker.buy;
            }
            if own_lowest_sell == Some(ticker.sell) {
                start_sell = ticker.sell;
            }
        }

        // Back off symmetrically if the spread collapsed under the floor.
        if start_buy * (1.0 + cfg.min_spread) > start_sell {
            start_buy *= 1.0 - cfg.min_spread / 2.0;
            start_sell *= 1.0 + cfg.min_spread / 2.0;
        }

        Self {
            start_buy,
            start_sell,
            tick_log: instrument.tick_log(),
            interval: cfg.interval,
            maintain_spreads: cfg.maintain_spreads,
        }
    }

    pub fn start_buy(&self) -> f64 {
        self.start_buy
    }

    pub fn start_sell(&self) -> f64 {
        self.start_sell
    }

    /// Price for a signed rung index. In maintain-spreads mode the
    /// innermost rung sits exactly at the start position and the rest
    /// branch outward from there.
    pub fn price_at(&self, index: i32) -> f64 {
        debug_assert!(index != 0);
        let start = if index < 0 {
            self.start_buy
        } else {
            self.start_sell
        };
        let index = if self.maintain_spreads {
            if index < 0 {
                index + 1
            } else {
                index - 1
            }
        } else {
            index
        };
        round_to(start * (1.0 + self.interval).powi(index), self.tick_log)
    }

    /// The innermost rungs must not sit through the opposite side of the
    /// book. If they do, the data cannot be trusted.
    pub fn check_not_crossed(&self, ticker: &Ticker) -> Result<(), MarketError> {
        if self.price_at(-1) >= ticker.sell || self.price_at(1) <= ticker.buy {
            return Err(MarketError::Crossed {
                buy: self.start_buy,
                sell: self.start_sell,
            });
        }
        Ok(())
    }
}

/// Quantity for a rung: flat size growing by a step per rung, or a
/// uniform random size when configured.
pub fn rung_qty(cfg: &Config, index: i32) -> i64 {
    if cfg.random_order_size {
        rand::thread_rng().gen_range(cfg.min_order_size..=cfg.max_order_size)
    } else {
        cfg.order_start_size + (index.abs() as i64 - 1) * cfg.order_step_size
    }
}

pub fn long_limit_reached(cfg: &Config, position_qty: i64) -> bool {
    cfg.check_position_limits && position_qty >= cfg.max_position
}

pub fn short_limit_reached(cfg: &Config, position_qty: i64) -> bool {
    cfg.check_position_limits && position_qty <= cfg.min_position
}

/// Build both sides outward-first. When an inner rung fills, matching
/// outward-first lets the surviving outer orders keep their exchange
/// identity and only the freed inner slot needs a brand new order. A
/// side at its position limit is omitted entirely.
pub fn desired_ladder(
    ladder: &Ladder,
    cfg: &Config,
    position_qty: i64,
) -> (Vec<DesiredOrder>, Vec<DesiredOrder>) {
    let mut buys = Vec::new();
    let mut sells = Vec::new();
    let long_blocked = long_limit_reached(cfg, position_qty);
    let short_blocked = short_limit_reached(cfg, position_qty);

    for i in (1..=cfg.order_pairs as i32).rev() {
        if !long_blocked {
            buys.push(DesiredOrder {
                side: Side::Buy,
                price: ladder.price_at(-i),
                qty: rung_qty(cfg, -i),
            });
        }
        if !short_blocked {
            sells.push(DesiredOrder {
                side: Side::Sell,
                price: ladder.price_at(i),
                qty: rung_qty(cfg, i),
            });
        }
    }
    (buys, sells)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> Config {
        Config {
            api_key: Some("key".into()),
            api_secret: Some("secret".into()),
            order_pairs: 3,
            order_start_size: 100,
            order_step_size: 50,
            interval: 0.01,
            min_spread: 0.0,
            maintain_spreads: true,
            ..Config::default()
        }
    }

    fn instrument(tick_size: f64) -> Instrument {
        Instrument {
            symbol: "XBTUSD".into(),
            state: "Open".into(),
            tick_size,
            multiplier: 1.0,
            init_margin: 0.01,
            bid_price: None,
            ask_price: None,
            last_price: None,
            mid_price: None,
            mark_price: None,
        }
    }

    fn ticker() -> Ticker {
        Ticker {
            last: 1000.0,
            buy: 999.5,
            sell: 1000.5,
            mid: 1000.0,
        }
    }

    #[test]
    fn start_positions_step_one_tick_inside() {
        let ladder = Ladder::from_market(&ticker(), &instrument(0.5), None, None, &cfg());
        assert_eq!(ladder.start_buy(), 1000.0);
        assert_eq!(ladder.start_sell(), 1000.0);
    }

    #[test]
    fn innermost_rung_sits_at_the_start_position() {
        let ladder = Ladder::from_market(&ticker(), &instrument(0.5), None, None, &cfg());
        assert_eq!(ladder.price_at(-1), 1000.0);
        // one interval step out, rounded to the half tick
        assert_eq!(ladder.price_at(-2), 990.1);
        assert_eq!(ladder.price_at(2), 1010.0);
    }

    #[test]
    fn own_best_order_does_not_walk_the_spread_inward() {
        let t = ticker();
        let ladder =
            Ladder::from_market(&t, &instrument(0.5), Some(t.buy), None, &cfg());
        assert_eq!(ladder.start_buy(), t.buy);
        assert_eq!(ladder.start_sell(), t.sell - 0.5);
    }

    #[test]
    fn min_spread_pulls_the_starts_apart() {
        let mut c = cfg();
        c.min_spread = 0.01;
        let ladder = Ladder::from_market(&ticker(), &instrument(0.5), None, None, &c);
        assert!(ladder.start_buy() < 1000.0);
        assert!(ladder.start_sell() > 1000.0);
        assert!(ladder.start_buy() * 1.01 <= ladder.start_sell() + 1e-9);
    }

    #[test]
    fn prices_round_to_tick_precision() {
        let ladder = Ladder::from_market(&ticker(), &instrument(0.5), None, None, &cfg());
        for i in [-3, -2, -1, 1, 2, 3] {
            let px = ladder.price_at(i);
            assert_eq!(px, round_to(px, 1));
        }
    }

    #[test]
    fn ladder_is_built_outward_first() {
        let c = cfg();
        let ladder = Ladder::from_market(&ticker(), &instrument(0.5), None, None, &c);
        let (buys, sells) = desired_ladder(&ladder, &c, 0);
        assert_eq!(buys.len(), 3);
        assert_eq!(sells.len(), 3);
        // outermost first: ascending prices on the buy side
        assert!(buys[0].price < buys[1].price && buys[1].price < buys[2].price);
        assert!(sells[0].price > sells[1].price && sells[1].price > sells[2].price);
        // sizes grow with distance from the inside
        assert_eq!(buys[0].qty, 200);
        assert_eq!(buys[2].qty, 100);
    }

    #[test]
    fn long_limit_omits_the_buy_side_only() {
        let mut c = cfg();
        c.check_position_limits = true;
        c.min_position = -100;
        c.max_position = 100;
        let ladder = Ladder::from_market(&ticker(), &instrument(0.5), None, None, &c);
        let (buys, sells) = desired_ladder(&ladder, &c, 100);
        assert!(buys.is_empty());
        assert_eq!(sells.len(), 3);
    }

    #[test]
    fn short_limit_omits_the_sell_side_only() {
        let mut c = cfg();
        c.check_position_limits = true;
        c.min_position = -100;
        c.max_position = 100;
        let ladder = Ladder::from_market(&ticker(), &instrument(0.5), None, None, &c);
        let (buys, sells) = desired_ladder(&ladder, &c, -100);
        assert_eq!(buys.len(), 3);
        assert!(sells.is_empty());
    }

    #[test]
    fn crossed_reference_prices_are_refused() {
        let crossed = Ticker {
            last: 1000.0,
            buy: 1000.5,
            sell: 999.5,
            mid: 1000.0,
        };
        let ladder = Ladder::from_market(&crossed, &instrument(0.5), None, None, &cfg());
        assert!(ladder.check_not_crossed(&crossed).is_err());

        let sane = ticker();
        let ladder = Ladder::from_market(&sane, &instrument(0.5), None, None, &cfg());
        assert!(ladder.check_not_crossed(&sane).is_ok());
    }

    #[test]
    fn random_sizing_stays_in_bounds() {
        let mut c = cfg();
        c.random_order_size = true;
        c.min_order_size = 10;
        c.max_order_size = 20;
        for i in 1..=5 {
            let q = rung_qty(&c, i);
            assert!((10..=20).contains(&q));
        }
    }
}
