//! Realtime table feed.
//!
//! One connection per process. Topics are subscribed in the connect
//! querystring; the session is live once every subscribed table has
//! delivered its snapshot. A closed or errored connection is fatal for
//! this instance: the process exits and the supervisor restart rebuilds
//! the mirror from a fresh snapshot instead of replaying deltas.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::StreamError;
use crate::exchange::sign;
use crate::exchange::types::StreamMessage;
use crate::store::TableStore;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SNAPSHOT_POLL: Duration = Duration::from_millis(100);

/// Handle to the live session. Dropping it leaves the reader running;
/// the owner checks liveness every tick.
pub struct StreamHandle {
    exited: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl StreamHandle {
    pub fn is_open(&self) -> bool {
        !self.exited.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        self.exited.store(true, Ordering::SeqCst);
        self.task.abort();
    }
}

/// Connect, subscribe and block until the mirror holds a snapshot of
/// every subscribed table.
pub async fn connect(cfg: &Config, store: Arc<TableStore>) -> Result<StreamHandle, StreamError> {
    let symbol = &cfg.symbol;
    let mut topics = vec![
        format!("quote:{symbol}"),
        format!("trade:{symbol}"),
        "instrument".to_string(),
    ];
    topics.extend([
        format!("order:{symbol}"),
        format!("execution:{symbol}"),
        "margin".to_string(),
        "position".to_string(),
    ]);

    let url = realtime_url(&cfg.base_url, &topics)?;
    info!(%url, "connecting realtime feed");
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(StreamError::Transport)?;
    auth_headers(cfg, request.headers_mut())?;

    let (socket, _response) = connect_async(request).await?;
    let (write, read) = socket.split();

    let exited = Arc::new(AtomicBool::new(false));
    let task = tokio::spawn(run_reader(write, read, store.clone(), exited.clone()));

    info!("connected, waiting for table snapshots");
    let wanted = ["instrument", "trade", "quote", "margin", "position", "order"];
    let deadline = tokio::time::Instant::now() + cfg.snapshot_timeout;
    while !store.has_tables(&wanted) {
        if exited.load(Ordering::SeqCst) {
            return Err(StreamError::ClosedDuringHandshake);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(StreamError::SnapshotTimeout(cfg.snapshot_timeout));
        }
        tokio::time::sleep(SNAPSHOT_POLL).await;
    }
    info!("all table snapshots received, session live");

    Ok(StreamHandle { exited, task })
}

fn realtime_url(base_url: &str, topics: &[String]) -> Result<reqwest::Url, StreamError> {
    let mut url = reqwest::Url::parse(base_url)
        .map_err(|e| StreamError::Handshake(format!("base url: {e}")))?;
    let scheme = match url.scheme() {
        "https" => "wss",
        _ => "ws",
    };
    url.set_scheme(scheme)
        .map_err(|_| StreamError::Handshake("unsupported url scheme".into()))?;
    url.set_path("/realtime");
    url.set_query(Some(&format!("subscribe={}", topics.join(","))));
    Ok(url)
}

/// The connect handshake signs the nominal `GET /realtime` pair, not a
/// resource path. Session-scheme credentials fall back to plain login
/// headers.
fn auth_headers(
    cfg: &Config,
    headers: &mut tokio_tungstenite::tungstenite::http::HeaderMap,
) -> Result<(), StreamError> {
    let mut put = |name: &'static str, value: String| -> Result<(), StreamError> {
        let value = HeaderValue::from_str(&value)
            .map_err(|e| StreamError::Handshake(format!("{name}: {e}")))?;
        headers.insert(name, value);
        Ok(())
    };
    match (&cfg.api_key, &cfg.api_secret) {
        (Some(key), Some(secret)) => {
            let token = cfg.scheme.token();
            put("api-key", key.clone())?;
            put(
                "api-signature",
                sign::sign(secret, "GET", "/realtime", token, ""),
            )?;
            put(cfg.scheme.header(), token.to_string())?;
        }
        _ => {
            if let (Some(email), Some(password)) = (&cfg.login, &cfg.password) {
                put("email", email.clone())?;
                put("password", password.clone())?;
            }
        }
    }
    Ok(())
}

async fn run_reader(
    mut write: SplitSink<WsStream, Message>,
    mut read: SplitStream<WsStream>,
    store: Arc<TableStore>,
    exited: Arc<AtomicBool>,
) {
    while let Some(frame) = read.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if let Err(e) = dispatch(&store, &text) {
                    error!(error = %e, "fatal stream condition");
                    break;
                }
            }
            Ok(Message::Ping(payload)) => {
                if write.send(Message::Pong(payload)).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => {
                info!("realtime feed closed by exchange");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "realtime transport error");
                break;
            }
        }
    }
    exited.store(true, Ordering::SeqCst);
    warn!("realtime session ended; a restart rebuilds the mirror from a fresh snapshot");
}

/// Route one inbound message. Returns Err only for conditions that end
/// the session; malformed messages are logged and dropped.
fn dispatch(store: &TableStore, text: &str) -> Result<(), StreamError> {
    let msg: StreamMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(error = %e, "undecodable stream message, dropping");
            return Ok(());
        }
    };

    if let Some(topic) = msg.subscribe {
        if msg.success.unwrap_or(false) {
            debug!(%topic, "subscribed");
            return Ok(());
        }
        return Err(StreamError::Handshake(format!(
            "subscription to {topic} refused: {}",
            msg.error.unwrap_or_default()
        )));
    }

    if let Some(status) = msg.status {
        let detail = msg.error.unwrap_or_default();
        if status == 400 || status == 401 {
            return Err(StreamError::Handshake(format!("status {status}: {detail}")));
        }
        warn!(status, %detail, "stream status message");
        return Ok(());
    }

    if let (Some(table), Some(action)) = (msg.table, msg.action) {
        store.apply_delta(&table, action, msg.keys, msg.data.unwrap_or_default());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn realtime_url_swaps_scheme_and_path() {
        let topics = vec!["instrument".to_string(), "quote:XBTUSD".to_string()];
        let url = realtime_url("https://testnet.bitmex.com/api/v1/", &topics).unwrap();
        assert_eq!(
            url.as_str(),
            "wss://testnet.bitmex.com/realtime?subscribe=instrument,quote:XBTUSD"
        );
    }

    #[test]
    fn table_deltas_reach_the_store() {
        let store = TableStore::new(10);
        let partial = r#"{
            "table": "instrument",
            "action": "partial",
            "keys": ["symbol"],
            "data": [{"symbol": "XBTUSD", "state": "Open", "tickSize": 0.5,
                      "bidPrice": 100.0, "askPrice": 100.5, "lastPrice": 100.5,
                      "midPrice": 100.25}]
        }"#;
        dispatch(&store, partial).unwrap();
        assert!(store.has_tables(&["instrument"]));
        assert_eq!(store.instrument("XBTUSD").unwrap().tick_size, 0.5);
    }

    #[test]
    fn refused_subscription_ends_the_session() {
        let store = TableStore::new(10);
        let nack = r#"{"subscribe": "order:XBTUSD", "success": false, "error": "not authorized"}"#;
        assert!(dispatch(&store, nack).is_err());
    }

    #[test]
    fn auth_status_codes_end_the_session() {
        let store = TableStore::new(10);
        assert!(dispatch(&store, r#"{"status": 401, "error": "bad key"}"#).is_err());
        assert!(dispatch(&store, r#"{"status": 400, "error": "bad request"}"#).is_err());
    }

    #[test]
    fn garbage_is_dropped_not_fatal() {
        let store = TableStore::new(10);
        assert!(dispatch(&store, "not json at all").is_ok());
    }
}
