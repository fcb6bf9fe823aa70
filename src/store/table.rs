//! Generic keyed table.
//!
//! Each streamed table declares its unique key fields with the initial
//! snapshot. Rows are indexed by the canonicalised key tuple and kept in
//! arrival order so bounded tables can shed their oldest rows.

use std::collections::{HashMap, VecDeque};

use crate::exchange::types::Record;

pub type KeyTuple = Vec<String>;

#[derive(Debug)]
pub struct Table {
    key_fields: Vec<String>,
    rows: HashMap<KeyTuple, Record>,
    arrival: VecDeque<KeyTuple>,
    cap: usize,
    evictable: bool,
}

impl Table {
    pub fn new(key_fields: Vec<String>, cap: usize, evictable: bool) -> Self {
        Self {
            key_fields,
            rows: HashMap::new(),
            arrival: VecDeque::new(),
            cap,
            evictable,
        }
    }

    /// Replace the whole table from a fresh snapshot. Key fields are
    /// redeclared with every snapshot.
    pub fn reset(&mut self, key_fields: Vec<String>, rows: Vec<Record>) {
        self.key_fields = key_fields;
        self.rows.clear();
        self.arrival.clear();
        self.append(rows);
    }

    pub fn key_for(&self, record: &Record) -> KeyTuple {
        self.key_fields
            .iter()
            .map(|field| {
                record
                    .get(field)
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "null".to_string())
            })
            .collect()
    }

    pub fn insert(&mut self, rows: Vec<Record>) {
        self.append(rows);
        if self.evictable && self.rows.len() > self.cap {
            self.drop_oldest(self.cap / 2);
        }
    }

    fn append(&mut self, rows: Vec<Record>) {
        for record in rows {
            let key = self.key_for(&record);
            if self.rows.insert(key.clone(), record).is_none() {
                self.arrival.push_back(key);
            }
        }
    }

    fn drop_oldest(&mut self, count: usize) {
        for _ in 0..count {
            match self.arrival.pop_front() {
                Some(key) => {
                    self.rows.remove(&key);
                }
                None => break,
            }
        }
    }

    pub fn get(&self, key: &KeyTuple) -> Option<&Record> {
        self.rows.get(key)
    }

    /// Merge a delta's fields into the matching row. Returns false when
    /// no row matches.
    pub fn merge(&mut self, key: &KeyTuple, delta: Record) -> bool {
        match self.rows.get_mut(key) {
            Some(row) => {
                for (field, value) in delta {
                    row.insert(field, value);
                }
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, key: &KeyTuple) -> Option<Record> {
        let removed = self.rows.remove(key);
        if removed.is_some() {
            self.arrival.retain(|k| k != key);
        }
        removed
    }

    /// Remove the row matching a delete delta. Returns false when no row
    /// matches.
    pub fn delete(&mut self, delta: &Record) -> bool {
        let key = self.key_for(delta);
        self.remove(&key).is_some()
    }

    /// Rows in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.arrival.iter().filter_map(|key| self.rows.get(key))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: u64, qty: i64) -> Record {
        match json!({ "orderID": id.to_string(), "qty": qty }) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn table(cap: usize, evictable: bool) -> Table {
        Table::new(vec!["orderID".to_string()], cap, evictable)
    }

    #[test]
    fn bounded_tables_drop_the_oldest_half_over_cap() {
        let mut t = table(10, true);
        t.insert((0..11).map(|i| record(i, 1)).collect());
        assert_eq!(t.len(), 6);
        // the oldest five are gone, the newest survive
        assert!(t.get(&vec!["\"0\"".to_string()]).is_none());
        assert!(t.get(&vec!["\"10\"".to_string()]).is_some());
    }

    #[test]
    fn order_table_never_evicts() {
        let mut t = table(10, false);
        t.insert((0..50).map(|i| record(i, 1)).collect());
        assert_eq!(t.len(), 50);
        assert!(t.get(&vec!["\"0\"".to_string()]).is_some());
    }

    #[test]
    fn merge_updates_matching_row_in_place() {
        let mut t = table(10, true);
        t.insert(vec![record(1, 100)]);
        let delta = record(1, 60);
        let key = t.key_for(&delta);
        assert!(t.merge(&key, delta));
        assert_eq!(t.get(&key).unwrap()["qty"], 60);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn merge_without_match_reports_miss() {
        let mut t = table(10, true);
        let delta = record(7, 60);
        let key = t.key_for(&delta);
        assert!(!t.merge(&key, delta));
        assert!(t.is_empty());
    }

    #[test]
    fn removed_rows_leave_arrival_order_intact() {
        let mut t = table(10, false);
        t.insert(vec![record(1, 1), record(2, 2), record(3, 3)]);
        assert!(t.delete(&record(2, 0)));
        assert!(!t.delete(&record(2, 0)));
        let ids: Vec<_> = t.iter().map(|r| r["orderID"].clone()).collect();
        assert_eq!(ids, vec![json!("1"), json!("3")]);
    }

    #[test]
    fn reinserted_key_keeps_a_single_arrival_slot() {
        let mut t = table(10, false);
        t.insert(vec![record(1, 1)]);
        t.delete(&record(1, 0));
        t.insert(vec![record(1, 5)]);
        assert_eq!(t.iter().count(), 1);
        assert_eq!(t.len(), 1);
    }
}
