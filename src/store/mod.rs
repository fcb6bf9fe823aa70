//! In-memory mirror of the exchange's streamed tables.
//!
//! One coarse lock serialises delta application against the view reads
//! from the tick loop, so a tick never observes a half-applied delta.

pub mod table;

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::MarketError;
use crate::exchange::types::{round_to, Action, Instrument, Margin, Order, Position, Record, Ticker};
use table::Table;

pub const ORDER_TABLE: &str = "order";

const TERMINAL_STATUSES: [&str; 3] = ["Filled", "Canceled", "Rejected"];

pub struct TableStore {
    tables: Mutex<HashMap<String, Table>>,
    max_table_len: usize,
}

impl TableStore {
    pub fn new(max_table_len: usize) -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            max_table_len,
        }
    }

    /// Apply one streamed delta. Unknown tables and unmatched rows are
    /// logged and dropped, never fatal.
    pub fn apply_delta(
        &self,
        name: &str,
        action: Action,
        keys: Option<Vec<String>>,
        rows: Vec<Record>,
    ) {
        let mut tables = self.tables.lock();
        if action == Action::Partial {
            let key_fields = keys.unwrap_or_default();
            debug!(table = name, rows = rows.len(), "table snapshot");
            let evictable = name != ORDER_TABLE;
            tables
                .entry(name.to_string())
                .or_insert_with(|| Table::new(key_fields.clone(), self.max_table_len, evictable))
                .reset(key_fields, rows);
            return;
        }

        let Some(tbl) = tables.get_mut(name) else {
            debug!(table = name, ?action, "delta before snapshot, dropping");
            return;
        };
        match action {
            Action::Partial => unreachable!("handled above"),
            Action::Insert => tbl.insert(rows),
            Action::Update => {
                for delta in rows {
                    if name == ORDER_TABLE {
                        apply_order_update(tbl, delta);
                    } else {
                        let key = tbl.key_for(&delta);
                        if !tbl.merge(&key, delta) {
                            debug!(table = name, "update for missing row, dropping");
                        }
                    }
                }
            }
            Action::Delete => {
                for delta in rows {
                    if !tbl.delete(&delta) {
                        debug!(table = name, "delete for missing row, ignoring");
                    }
                }
            }
        }
    }

    /// True once every named table has received its snapshot.
    pub fn has_tables(&self, names: &[&str]) -> bool {
        let tables = self.tables.lock();
        names.iter().all(|name| tables.contains_key(*name))
    }

    pub fn instrument(&self, symbol: &str) -> Result<Instrument, MarketError> {
        let tables = self.tables.lock();
        let record = tables
            .get("instrument")
            .and_then(|tbl| {
                tbl.iter()
                    .find(|r| r.get("symbol").and_then(Value::as_str) == Some(symbol))
            })
            .cloned()
            .ok_or_else(|| MarketError::InstrumentMissing {
                symbol: symbol.to_string(),
            })?;
        serde_json::from_value(Value::Object(record)).map_err(|e| {
            warn!(symbol, error = %e, "undecodable instrument row");
            MarketError::InstrumentMissing {
                symbol: symbol.to_string(),
            }
        })
    }

    /// Best-price view rounded to the instrument's tick precision. Index
    /// symbols quote off the mark price for all four fields.
    pub fn ticker(&self, symbol: &str) -> Result<Ticker, MarketError> {
        let instrument = self.instrument(symbol)?;
        let tick_log = instrument.tick_log();
        if instrument.is_index() {
            let mark = round_to(instrument.mark_price.unwrap_or(0.0), tick_log);
            return Ok(Ticker {
                last: mark,
                buy: mark,
                sell: mark,
                mid: mark,
            });
        }
        let last = instrument.last_price.unwrap_or(0.0);
        let buy = instrument.bid_price.or(instrument.last_price).unwrap_or(0.0);
        let sell = instrument.ask_price.or(instrument.last_price).unwrap_or(0.0);
        Ok(Ticker {
            last: round_to(last, tick_log),
            buy: round_to(buy, tick_log),
            sell: round_to(sell, tick_log),
            mid: round_to((buy + sell) / 2.0, tick_log),
        })
    }

    /// Latest margin record.
    pub fn funds(&self) -> Option<Margin> {
        let tables = self.tables.lock();
        let record = tables.get("margin")?.iter().next().cloned()?;
        serde_json::from_value(Value::Object(record)).ok()
    }

    /// Orders this agent owns (prefix match) that still have quantity
    /// resting, in arrival order.
    pub fn open_orders(&self, prefix: &str) -> Vec<Order> {
        let tables = self.tables.lock();
        let Some(tbl) = tables.get(ORDER_TABLE) else {
            return Vec::new();
        };
        tbl.iter()
            .filter_map(|record| {
                match serde_json::from_value::<Order>(Value::Object(record.clone())) {
                    Ok(order) => Some(order),
                    Err(e) => {
                        warn!(error = %e, "undecodable order row, skipping");
                        None
                    }
                }
            })
            .filter(|o| o.cl_ord_id.starts_with(prefix) && o.leaves_qty > 0)
            .collect()
    }

    pub fn position(&self, symbol: &str) -> Position {
        let tables = self.tables.lock();
        tables
            .get("position")
            .and_then(|tbl| {
                tbl.iter()
                    .find(|r| r.get("symbol").and_then(Value::as_str) == Some(symbol))
            })
            .cloned()
            .and_then(|record| serde_json::from_value(Value::Object(record)).ok())
            .unwrap_or_else(|| Position::flat(symbol))
    }
}

/// Order rows get lifecycle handling on top of the plain merge: log the
/// executed quantity when leaves shrink outside a cancel, and drop the
/// row once it has no quantity left or reaches a terminal status.
fn apply_order_update(tbl: &mut Table, delta: Record) {
    let key = tbl.key_for(&delta);
    let Some(prev) = tbl.get(&key) else {
        debug!(table = ORDER_TABLE, "update for missing row, dropping");
        return;
    };
    let prev_leaves = prev.get("leavesQty").and_then(Value::as_i64);
    let canceled = delta.get("ordStatus").and_then(Value::as_str) == Some("Canceled");
    tbl.merge(&key, delta);

    let (leaves, terminal, side, symbol, price) = {
        let Some(row) = tbl.get(&key) else { return };
        let leaves = row.get("leavesQty").and_then(Value::as_i64);
        let terminal = row
            .get("ordStatus")
            .and_then(Value::as_str)
            .map(|s| TERMINAL_STATUSES.contains(&s))
            .unwrap_or(false);
        (
            leaves,
            terminal,
            row.get("side").cloned().unwrap_or(Value::Null),
            row.get("symbol").cloned().unwrap_or(Value::Null),
            row.get("price").cloned().unwrap_or(Value::Null),
        )
    };

    if let (Some(prev_leaves), Some(leaves)) = (prev_leaves, leaves) {
        if leaves < prev_leaves && !canceled {
            info!(
                side = %side,
                executed = prev_leaves - leaves,
                symbol = %symbol,
                price = %price,
                "execution"
            );
        }
    }

    if terminal || leaves.map(|l| l <= 0).unwrap_or(false) {
        tbl.remove(&key);
    }
}
