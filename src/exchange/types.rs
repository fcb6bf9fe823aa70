//! Wire data model for the exchange's JSON payloads.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One row of a streamed table, fields as delivered.
pub type Record = Map<String, Value>;

/// Settlement unit scale (satoshi-style micro units per base unit).
pub const SETTLE_UNIT_SCALE: f64 = 100_000_000.0;

pub const POST_ONLY: &str = "ParticipateDoNotInitiate";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "Buy"),
            Side::Sell => write!(f, "Sell"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instrument {
    pub symbol: String,
    #[serde(default)]
    pub state: String,
    pub tick_size: f64,
    #[serde(default)]
    pub multiplier: f64,
    #[serde(default)]
    pub init_margin: f64,
    #[serde(default)]
    pub bid_price: Option<f64>,
    #[serde(default)]
    pub ask_price: Option<f64>,
    #[serde(default)]
    pub last_price: Option<f64>,
    #[serde(default)]
    pub mid_price: Option<f64>,
    #[serde(default)]
    pub mark_price: Option<f64>,
}

impl Instrument {
    /// Decimal precision implied by the tick size (0.5 -> 1, 0.01 -> 2).
    pub fn tick_log(&self) -> u32 {
        tick_log(self.tick_size)
    }

    pub fn round_price(&self, price: f64) -> f64 {
        round_to(price, self.tick_log())
    }

    /// Index symbols carry a leading dot and quote off the mark price.
    pub fn is_index(&self) -> bool {
        self.symbol.starts_with('.')
    }

    pub fn is_open(&self) -> bool {
        self.state == "Open"
    }

    /// Notional cost of a position. A negative multiplier marks an
    /// inverse contract priced in the quote currency.
    pub fn cost(&self, quantity: i64, price: f64) -> f64 {
        let per_contract = if self.multiplier >= 0.0 {
            self.multiplier * price
        } else {
            self.multiplier / price
        };
        (quantity as f64 * per_contract).abs()
    }

    pub fn margin(&self, quantity: i64, price: f64) -> f64 {
        self.cost(quantity, price) * self.init_margin
    }
}

/// Derived best-price view, rounded to the instrument's tick precision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ticker {
    pub last: f64,
    pub buy: f64,
    pub sell: f64,
    pub mid: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    #[serde(rename = "orderID")]
    pub order_id: String,
    #[serde(rename = "clOrdID", default)]
    pub cl_ord_id: String,
    pub side: Side,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub order_qty: i64,
    #[serde(default)]
    pub leaves_qty: i64,
    #[serde(default)]
    pub ord_status: String,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub text: Option<String>,
}

impl Order {
    pub fn price(&self) -> f64 {
        self.price.unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub symbol: String,
    #[serde(default)]
    pub current_qty: i64,
    #[serde(default)]
    pub avg_cost_price: Option<f64>,
    #[serde(default)]
    pub avg_entry_price: Option<f64>,
}

impl Position {
    pub fn flat(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            current_qty: 0,
            avg_cost_price: None,
            avg_entry_price: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Margin {
    #[serde(default)]
    pub margin_balance: f64,
    #[serde(default, alias = "availableFunds")]
    pub available_margin: f64,
}

impl Margin {
    /// Balance in the base settlement unit.
    pub fn base_balance(&self) -> f64 {
        self.margin_balance / SETTLE_UNIT_SCALE
    }
}

/// New order payload. Every order carries a prefixed client id and a
/// maker-only instruction.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrder {
    pub symbol: String,
    #[serde(rename = "clOrdID")]
    pub cl_ord_id: String,
    pub side: Side,
    pub order_qty: i64,
    pub price: f64,
    pub exec_inst: &'static str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderAmend {
    #[serde(rename = "orderID")]
    pub order_id: String,
    pub leaves_qty: i64,
    pub price: f64,
}

/// Streamed table actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Partial,
    Insert,
    Update,
    Delete,
}

/// Inbound realtime message. The feed multiplexes subscription acks,
/// status codes and table deltas over one envelope shape.
#[derive(Debug, Deserialize)]
pub struct StreamMessage {
    #[serde(default)]
    pub subscribe: Option<String>,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub action: Option<Action>,
    #[serde(default)]
    pub data: Option<Vec<Record>>,
    #[serde(default)]
    pub keys: Option<Vec<String>>,
}

pub fn tick_log(tick_size: f64) -> u32 {
    let repr = format!("{tick_size}");
    repr.split_once('.')
        .map(|(_, frac)| frac.len() as u32)
        .unwrap_or(0)
}

pub fn round_to(value: f64, decimals: u32) -> f64 {
    let scale = 10f64.powi(decimals as i32);
    (value * scale).round() / scale
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instrument(tick_size: f64) -> Instrument {
        Instrument {
            symbol: "XBTUSD".into(),
            state: "Open".into(),
            tick_size,
            multiplier: 1.0,
            init_margin: 0.01,
            bid_price: Some(1000.0),
            ask_price: Some(1000.5),
            last_price: Some(1000.5),
            mid_price: Some(1000.25),
            mark_price: None,
        }
    }

    #[test]
    fn tick_log_follows_tick_size_decimals() {
        assert_eq!(tick_log(0.5), 1);
        assert_eq!(tick_log(0.01), 2);
        assert_eq!(tick_log(1.0), 0);
        assert_eq!(tick_log(0.25), 2);
    }

    #[test]
    fn prices_round_to_tick_precision() {
        assert_eq!(instrument(0.5).round_price(1000.27), 1000.3);
        assert_eq!(instrument(0.01).round_price(1000.277), 1000.28);
        assert_eq!(instrument(1.0).round_price(1000.27), 1000.0);
    }

    #[test]
    fn inverse_contract_cost_divides_by_price() {
        let mut inst = instrument(0.5);
        inst.multiplier = -100_000_000.0;
        let cost = inst.cost(100, 400.0);
        assert!((cost - 100.0 * 100_000_000.0 / 400.0).abs() < 1e-6);
        assert!((inst.margin(100, 400.0) - cost * 0.01).abs() < 1e-6);
    }

    #[test]
    fn order_rows_deserialize_from_wire_names() {
        let raw = serde_json::json!({
            "orderID": "abc-123",
            "clOrdID": "laddr_x1",
            "side": "Buy",
            "price": 995.0,
            "orderQty": 100,
            "leavesQty": 40,
            "ordStatus": "PartiallyFilled",
            "symbol": "XBTUSD"
        });
        let order: Order = serde_json::from_value(raw).unwrap();
        assert_eq!(order.order_id, "abc-123");
        assert_eq!(order.cl_ord_id, "laddr_x1");
        assert_eq!(order.side, Side::Buy);
        assert_eq!(order.leaves_qty, 40);
    }

    #[test]
    fn new_order_serializes_exchange_field_names() {
        let order = NewOrder {
            symbol: "XBTUSD".into(),
            cl_ord_id: "laddr_abc".into(),
            side: Side::Sell,
            order_qty: 100,
            price: 1001.5,
            exec_inst: POST_ONLY,
        };
        let v = serde_json::to_value(&order).unwrap();
        assert_eq!(v["clOrdID"], "laddr_abc");
        assert_eq!(v["orderQty"], 100);
        assert_eq!(v["execInst"], POST_ONLY);
        assert_eq!(v["side"], "Sell");
    }

    #[test]
    fn margin_balance_converts_to_base_units() {
        let margin = Margin {
            margin_balance: 150_000_000.0,
            available_margin: 0.0,
        };
        assert!((margin.base_balance() - 1.5).abs() < 1e-9);
    }
}
