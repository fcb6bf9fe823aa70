use std::time::Duration;

use thiserror::Error;

/// Failures surfaced by the REST layer. Transient conditions (timeouts,
/// rate limits, maintenance windows) are retried internally and never
/// appear here.
#[derive(Debug, Error)]
pub enum RestError {
    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("{verb} {endpoint} rejected ({status}): {message}")]
    Rejected {
        verb: String,
        endpoint: String,
        status: u16,
        message: String,
        body: String,
    },

    #[error("duplicate clOrdID recovery mismatch: {0}")]
    Integrity(String),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Market-state conditions checked once per tick before any order math.
#[derive(Debug, Error)]
pub enum MarketError {
    #[error("instrument {symbol} is not open (state: {state})")]
    MarketClosed { symbol: String, state: String },

    #[error("order book for {symbol} is empty, cannot quote")]
    OrderBookEmpty { symbol: String },

    #[error("no instrument data for {symbol}")]
    InstrumentMissing { symbol: String },

    #[error("reference prices crossed (buy {buy} / sell {sell}), exchange data is inconsistent")]
    Crossed { buy: f64, sell: f64 },

    #[error("realtime feed closed")]
    StreamClosed,
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("websocket error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("stream handshake failed: {0}")]
    Handshake(String),

    #[error("snapshots not received within {0:?}")]
    SnapshotTimeout(Duration),

    #[error("stream closed during handshake")]
    ClosedDuringHandshake,
}

/// Top-level error for the driver loop.
#[derive(Debug, Error)]
pub enum BotError {
    #[error(transparent)]
    Rest(#[from] RestError),

    #[error(transparent)]
    Market(#[from] MarketError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BotError {
    /// Conditions that pause quoting for the current tick and clear on
    /// their own (closed instrument, empty book).
    pub fn pauses_quoting(&self) -> bool {
        matches!(
            self,
            BotError::Market(MarketError::MarketClosed { .. })
                | BotError::Market(MarketError::OrderBookEmpty { .. })
        )
    }

    /// Bad credentials. There is no authenticated session to unwind from.
    pub fn is_fatal_auth(&self) -> bool {
        matches!(self, BotError::Rest(RestError::Auth(_)))
    }
}
