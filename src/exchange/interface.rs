//! Facade over the REST client, the table mirror and the stream handle.
//!
//! All reads come from the mirror except where HTTP is explicitly
//! required (startup checks, cancel-everything). In dry-run mode every
//! mutating call logs what it would do and returns empty.

use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::error::{MarketError, RestError};
use crate::exchange::rest::AuthedClient;
use crate::exchange::stream::StreamHandle;
use crate::exchange::types::{
    Instrument, Margin, NewOrder, Order, OrderAmend, Position, Side, Ticker, POST_ONLY,
    SETTLE_UNIT_SCALE,
};
use crate::store::TableStore;

pub struct ExchangeInterface {
    client: AuthedClient,
    store: Arc<TableStore>,
    stream: StreamHandle,
    symbol: String,
    prefix: String,
    dry_run: bool,
    dry_balance: f64,
}

impl ExchangeInterface {
    pub fn new(
        client: AuthedClient,
        store: Arc<TableStore>,
        stream: StreamHandle,
        cfg: &Config,
    ) -> Self {
        Self {
            client,
            store,
            stream,
            symbol: cfg.symbol.clone(),
            prefix: cfg.order_id_prefix.clone(),
            dry_run: cfg.dry_run,
            dry_balance: cfg.dry_balance,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn is_stream_open(&self) -> bool {
        self.stream.is_open()
    }

    pub fn shutdown_stream(&self) {
        self.stream.shutdown();
    }

    //
    // Mirror views
    //

    pub fn instrument(&self) -> Result<Instrument, MarketError> {
        self.store.instrument(&self.symbol)
    }

    pub fn ticker(&self) -> Result<Ticker, MarketError> {
        self.store.ticker(&self.symbol)
    }

    pub fn position(&self) -> Position {
        self.store.position(&self.symbol)
    }

    pub fn funds(&self) -> Option<Margin> {
        if self.dry_run {
            return Some(Margin {
                margin_balance: self.dry_balance * SETTLE_UNIT_SCALE,
                available_margin: self.dry_balance * SETTLE_UNIT_SCALE,
            });
        }
        self.store.funds()
    }

    pub fn open_orders(&self) -> Vec<Order> {
        self.store.open_orders(&self.prefix)
    }

    pub fn highest_buy(&self) -> Option<f64> {
        self.open_orders()
            .iter()
            .filter(|o| o.side == Side::Buy)
            .map(Order::price)
            .fold(None, |best, p| Some(best.map_or(p, |b: f64| b.max(p))))
    }

    pub fn lowest_sell(&self) -> Option<f64> {
        self.open_orders()
            .iter()
            .filter(|o| o.side == Side::Sell)
            .map(Order::price)
            .fold(None, |best, p| Some(best.map_or(p, |b: f64| b.min(p))))
    }

    //
    // HTTP reads
    //

    pub async fn instrument_http(&self) -> Result<Instrument, RestError> {
        self.client.instrument().await
    }

    pub async fn position_http(&self) -> Result<Position, RestError> {
        self.client.position().await
    }

    pub async fn margin_http(&self) -> Result<Margin, RestError> {
        self.client.margin().await
    }

    //
    // Order mutations
    //

    pub fn new_order(&self, side: Side, qty: i64, price: f64) -> NewOrder {
        NewOrder {
            symbol: self.symbol.clone(),
            cl_ord_id: self.client.new_cl_ord_id(),
            side,
            order_qty: qty,
            price,
            exec_inst: POST_ONLY,
        }
    }

    pub async fn create_bulk(&self, orders: Vec<NewOrder>) -> Result<Vec<Order>, RestError> {
        if self.dry_run {
            for order in &orders {
                info!(side = %order.side, qty = order.order_qty, price = order.price, "dry run: would create");
            }
            return Ok(Vec::new());
        }
        self.client.create_bulk(orders).await
    }

    pub async fn amend_bulk(&self, amends: Vec<OrderAmend>) -> Result<Vec<Order>, RestError> {
        if self.dry_run {
            for amend in &amends {
                info!(order_id = %amend.order_id, qty = amend.leaves_qty, price = amend.price, "dry run: would amend");
            }
            return Ok(Vec::new());
        }
        self.client.amend_bulk(amends).await
    }

    pub async fn cancel_bulk(&self, order_ids: &[String]) -> Result<Vec<Order>, RestError> {
        if self.dry_run {
            info!(count = order_ids.len(), "dry run: would cancel");
            return Ok(Vec::new());
        }
        self.client.cancel_orders(order_ids).await
    }

    /// Cancel every order carrying our prefix. Goes through the HTTP
    /// listing rather than the mirror, which may lag behind.
    pub async fn cancel_all(&self) -> Result<usize, RestError> {
        if self.dry_run {
            info!("dry run: would cancel all open orders");
            return Ok(0);
        }
        let orders = self.client.open_orders().await?;
        if orders.is_empty() {
            return Ok(0);
        }
        for order in &orders {
            info!(side = %order.side, qty = order.order_qty, price = order.price(), "cancelling");
        }
        let ids: Vec<String> = orders.iter().map(|o| o.order_id.clone()).collect();
        self.client.cancel_orders(&ids).await?;
        Ok(orders.len())
    }
}
