//! Signed REST client and retry policy.
//!
//! Transient conditions (timeouts, connection errors, rate limits,
//! maintenance windows) are retried forever with a fixed backoff: the
//! agent runs unattended and waits out exchange downtime. Everything
//! else surfaces as a typed [`RestError`].

use std::time::Duration;

use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use reqwest::{Client, Method, StatusCode, Url};
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::error::RestError;
use crate::exchange::sign::{self, FreshnessScheme};
use crate::exchange::types::{Instrument, Margin, NewOrder, Order, OrderAmend, Position};

const USER_AGENT: &str = concat!("laddr-rs/", env!("CARGO_PKG_VERSION"));

/// Unauthenticated client. Holds the connection pool and retry policy;
/// privileged endpoints only exist on [`AuthedClient`].
pub struct RestClient {
    http: Client,
    base_url: Url,
    backoff: Duration,
}

/// Identity attached to every privileged request.
enum Identity {
    ApiKey {
        key: String,
        secret: String,
        scheme: FreshnessScheme,
    },
    Session {
        email: String,
        password: String,
        otp: Option<String>,
        token: Mutex<Option<String>>,
    },
}

/// Client carrying a proven identity. Constructed only by
/// [`authenticate`], so an unauthenticated privileged call is a type
/// error rather than a runtime check.
pub struct AuthedClient {
    rest: RestClient,
    identity: Identity,
    symbol: String,
    order_id_prefix: String,
}

impl RestClient {
    pub fn new(cfg: &Config) -> Result<Self, RestError> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(cfg.rest_timeout)
            .build()?;
        let base_url = Url::parse(&cfg.base_url)
            .map_err(|e| RestError::InvalidRequest(format!("base url: {e}")))?;
        Ok(Self {
            http,
            base_url,
            backoff: cfg.api_error_interval,
        })
    }

    async fn request(
        &self,
        identity: Option<&Identity>,
        verb: Method,
        endpoint: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> Result<Option<Value>, RestError> {
        let mut url = self
            .base_url
            .join(endpoint)
            .map_err(|e| RestError::InvalidRequest(format!("endpoint {endpoint}: {e}")))?;
        for (name, value) in query {
            url.query_pairs_mut().append_pair(name, value);
        }

        // The signature covers the relative path plus query string and
        // the exact body bytes sent.
        let mut path = url.path().to_string();
        if let Some(q) = url.query() {
            path.push('?');
            path.push_str(q);
        }
        let body_text = match &body {
            Some(value) => serde_json::to_string(value)?,
            None => String::new(),
        };

        let mut refreshed = false;
        loop {
            let mut req = self.http.request(verb.clone(), url.clone());
            if body.is_some() {
                req = req
                    .header("content-type", "application/json")
                    .body(body_text.clone());
            }
            match identity {
                Some(Identity::ApiKey {
                    key,
                    secret,
                    scheme,
                }) => {
                    let token = scheme.token();
                    let signature = sign::sign(secret, verb.as_str(), &path, token, &body_text);
                    req = req
                        .header("api-key", key.as_str())
                        .header("api-signature", signature)
                        .header(scheme.header(), token.to_string());
                }
                Some(Identity::Session { token, .. }) => {
                    let current = token.lock().clone();
                    if let Some(token) = current {
                        req = req.header("access-token", token);
                    }
                }
                None => {}
            }

            let resp = match req.send().await {
                Ok(resp) => resp,
                Err(e) if e.is_timeout() || e.is_connect() => {
                    warn!(verb = %verb, endpoint, error = %e, "transport error, retrying");
                    sleep(self.backoff).await;
                    continue;
                }
                Err(e) => return Err(RestError::Transport(e)),
            };

            let status = resp.status();
            if status.is_success() {
                return Ok(Some(resp.json::<Value>().await?));
            }

            let text = resp.text().await.unwrap_or_default();
            let message = error_message(&text);

            match status {
                StatusCode::UNAUTHORIZED => match identity {
                    Some(id @ Identity::Session { .. }) if !refreshed => {
                        refreshed = true;
                        warn!(endpoint, "session token rejected, logging in again");
                        Box::pin(self.refresh_session(id)).await?;
                    }
                    _ => {
                        error!(endpoint, %message, "authentication failed, check key and secret");
                        return Err(RestError::Auth(message));
                    }
                },
                StatusCode::NOT_FOUND if verb == Method::DELETE => {
                    debug!(endpoint, "nothing to cancel");
                    return Ok(None);
                }
                StatusCode::TOO_MANY_REQUESTS => {
                    warn!(
                        endpoint,
                        "rate limited, backing off; fewer order pairs or a longer loop interval may be needed"
                    );
                    sleep(self.backoff).await;
                }
                StatusCode::SERVICE_UNAVAILABLE => {
                    warn!(endpoint, "exchange unavailable, retrying");
                    sleep(self.backoff).await;
                }
                StatusCode::BAD_REQUEST if message == "Duplicate clOrdID" => {
                    let submitted = body.as_ref().ok_or_else(|| {
                        RestError::InvalidRequest("duplicate clOrdID without a request body".into())
                    })?;
                    return Box::pin(self.recover_duplicate(identity, submitted))
                        .await
                        .map(Some);
                }
                _ => {
                    error!(
                        verb = %verb,
                        endpoint,
                        status = status.as_u16(),
                        %message,
                        body = %body_text,
                        "request rejected"
                    );
                    return Err(RestError::Rejected {
                        verb: verb.to_string(),
                        endpoint: endpoint.to_string(),
                        status: status.as_u16(),
                        message,
                        body: body_text,
                    });
                }
            }
        }
    }

    /// A duplicate client order id is benign if the resting order matches
    /// what was submitted (a retransmit after a dropped response). A
    /// mismatch is a data-integrity failure, never silently accepted.
    async fn recover_duplicate(
        &self,
        identity: Option<&Identity>,
        submitted: &Value,
    ) -> Result<Value, RestError> {
        if let Some(orders) = submitted.get("orders").and_then(Value::as_array) {
            let mut fetched = Vec::with_capacity(orders.len());
            for entry in orders {
                fetched.push(self.fetch_and_verify(identity, entry).await?);
            }
            return Ok(Value::Array(fetched));
        }
        self.fetch_and_verify(identity, submitted).await
    }

    async fn fetch_and_verify(
        &self,
        identity: Option<&Identity>,
        submitted: &Value,
    ) -> Result<Value, RestError> {
        let cl_ord_id = submitted
            .get("clOrdID")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                RestError::InvalidRequest("duplicate clOrdID on a body without clOrdID".into())
            })?;
        warn!(cl_ord_id, "duplicate clOrdID reported, fetching resting order");
        let filter = json!({ "clOrdID": cl_ord_id }).to_string();
        let fetched = Box::pin(self.request(
            identity,
            Method::GET,
            "order",
            &[("filter", filter)],
            None,
        ))
        .await?
        .and_then(|v| v.as_array().and_then(|rows| rows.first().cloned()))
        .ok_or_else(|| {
            RestError::Integrity(format!("order {cl_ord_id} reported duplicate but not found"))
        })?;
        if duplicate_matches(submitted, &fetched) {
            Ok(fetched)
        } else {
            Err(RestError::Integrity(format!(
                "resting order {cl_ord_id} does not match the rejected submission: \
                 sent {submitted}, found {fetched}"
            )))
        }
    }

    async fn refresh_session(&self, identity: &Identity) -> Result<(), RestError> {
        let Identity::Session {
            email,
            password,
            otp,
            token,
        } = identity
        else {
            return Ok(());
        };
        let body = json!({ "email": email, "password": password, "token": otp });
        let resp = Box::pin(self.request(None, Method::POST, "user/login", &[], Some(body)))
            .await?
            .ok_or_else(|| RestError::Auth("empty login response".into()))?;
        let id = resp
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| RestError::Auth("login response missing session id".into()))?;
        *token.lock() = Some(id.to_string());
        Ok(())
    }
}

/// Prove an identity and obtain the privileged client. API keys need no
/// round trip; the session scheme logs in immediately so a bad password
/// fails here rather than on the first order call.
pub async fn authenticate(rest: RestClient, cfg: &Config) -> Result<AuthedClient, RestError> {
    let identity = match (&cfg.api_key, &cfg.api_secret) {
        (Some(key), Some(secret)) => Identity::ApiKey {
            key: key.clone(),
            secret: secret.clone(),
            scheme: cfg.scheme,
        },
        _ => {
            let (Some(email), Some(password)) = (&cfg.login, &cfg.password) else {
                return Err(RestError::Auth("no credentials configured".into()));
            };
            Identity::Session {
                email: email.clone(),
                password: password.clone(),
                otp: cfg.otp_token.clone(),
                token: Mutex::new(None),
            }
        }
    };
    let client = AuthedClient {
        rest,
        identity,
        symbol: cfg.symbol.clone(),
        order_id_prefix: cfg.order_id_prefix.clone(),
    };
    if matches!(client.identity, Identity::Session { .. }) {
        client.rest.refresh_session(&client.identity).await?;
    }
    Ok(client)
}

impl AuthedClient {
    async fn call(
        &self,
        verb: Method,
        endpoint: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> Result<Option<Value>, RestError> {
        self.rest
            .request(Some(&self.identity), verb, endpoint, query, body)
            .await
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn order_id_prefix(&self) -> &str {
        &self.order_id_prefix
    }

    pub fn new_cl_ord_id(&self) -> String {
        fresh_cl_ord_id(&self.order_id_prefix)
    }

    pub async fn instrument(&self) -> Result<Instrument, RestError> {
        let filter = json!({ "symbol": self.symbol }).to_string();
        let value = self
            .call(Method::GET, "instrument", &[("filter", filter)], None)
            .await?
            .unwrap_or_else(|| json!([]));
        let rows: Vec<Instrument> = serde_json::from_value(value)?;
        rows.into_iter().next().ok_or_else(|| {
            RestError::InvalidRequest(format!("unknown instrument {}", self.symbol))
        })
    }

    pub async fn position(&self) -> Result<Position, RestError> {
        let filter = json!({ "symbol": self.symbol }).to_string();
        let value = self
            .call(Method::GET, "position", &[("filter", filter)], None)
            .await?
            .unwrap_or_else(|| json!([]));
        let rows: Vec<Position> = serde_json::from_value(value)?;
        Ok(rows
            .into_iter()
            .next()
            .unwrap_or_else(|| Position::flat(&self.symbol)))
    }

    pub async fn margin(&self) -> Result<Margin, RestError> {
        let value = self
            .call(Method::GET, "user/margin", &[], None)
            .await?
            .unwrap_or_else(|| json!({}));
        Ok(serde_json::from_value(value)?)
    }

    /// Open orders via HTTP rather than the mirror. Used before
    /// cancel-everything, where a lagging stream must not hide orders.
    pub async fn open_orders(&self) -> Result<Vec<Order>, RestError> {
        let filter = json!({ "ordStatus.isTerminated": false, "symbol": self.symbol }).to_string();
        let value = self
            .call(Method::GET, "order", &[("filter", filter)], None)
            .await?
            .unwrap_or_else(|| json!([]));
        let orders: Vec<Order> = serde_json::from_value(value)?;
        Ok(orders
            .into_iter()
            .filter(|o| o.cl_ord_id.starts_with(&self.order_id_prefix))
            .collect())
    }

    pub async fn create_bulk(&self, orders: Vec<NewOrder>) -> Result<Vec<Order>, RestError> {
        let value = self
            .call(
                Method::POST,
                "order/bulk",
                &[],
                Some(json!({ "orders": orders })),
            )
            .await?
            .unwrap_or_else(|| json!([]));
        Ok(serde_json::from_value(value)?)
    }

    pub async fn amend_bulk(&self, amends: Vec<OrderAmend>) -> Result<Vec<Order>, RestError> {
        let value = self
            .call(
                Method::PUT,
                "order/bulk",
                &[],
                Some(json!({ "orders": amends })),
            )
            .await?
            .unwrap_or_else(|| json!([]));
        Ok(serde_json::from_value(value)?)
    }

    /// Cancel by exchange order id, one or many. A 404 means the orders
    /// are already gone and is reported as an empty result.
    pub async fn cancel_orders(&self, order_ids: &[String]) -> Result<Vec<Order>, RestError> {
        let body = json!({ "orderID": order_ids });
        match self.call(Method::DELETE, "order", &[], Some(body)).await? {
            None => Ok(Vec::new()),
            Some(value) => Ok(serde_json::from_value(value)?),
        }
    }
}

pub(crate) fn fresh_cl_ord_id(prefix: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    format!("{prefix}{suffix}")
}

/// Fields that must agree for a duplicate client order id to count as
/// the same order.
fn duplicate_matches(submitted: &Value, existing: &Value) -> bool {
    ["side", "orderQty", "price", "symbol"]
        .iter()
        .all(|field| submitted.get(*field) == existing.get(*field))
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submission() -> Value {
        json!({
            "symbol": "XBTUSD",
            "clOrdID": "laddr_abcdef",
            "side": "Buy",
            "orderQty": 100,
            "price": 995.5,
            "execInst": "ParticipateDoNotInitiate"
        })
    }

    #[test]
    fn duplicate_with_identical_terms_is_benign() {
        let resting = json!({
            "orderID": "exch-1",
            "clOrdID": "laddr_abcdef",
            "side": "Buy",
            "orderQty": 100,
            "price": 995.5,
            "symbol": "XBTUSD",
            "leavesQty": 100
        });
        assert!(duplicate_matches(&submission(), &resting));
    }

    #[test]
    fn duplicate_with_different_terms_is_an_integrity_failure() {
        let resting = json!({
            "orderID": "exch-1",
            "clOrdID": "laddr_abcdef",
            "side": "Buy",
            "orderQty": 100,
            "price": 990.0,
            "symbol": "XBTUSD"
        });
        assert!(!duplicate_matches(&submission(), &resting));

        let wrong_side = json!({
            "clOrdID": "laddr_abcdef",
            "side": "Sell",
            "orderQty": 100,
            "price": 995.5,
            "symbol": "XBTUSD"
        });
        assert!(!duplicate_matches(&submission(), &wrong_side));
    }

    #[test]
    fn client_order_ids_carry_the_prefix() {
        let id = fresh_cl_ord_id("laddr_");
        assert!(id.starts_with("laddr_"));
        assert_eq!(id.len(), "laddr_".len() + 16);
        assert_ne!(id, fresh_cl_ord_id("laddr_"));
    }

    #[test]
    fn error_messages_unwrap_the_envelope() {
        let body = r#"{"error":{"message":"Duplicate clOrdID","name":"HTTPError"}}"#;
        assert_eq!(error_message(body), "Duplicate clOrdID");
        assert_eq!(error_message("plain text"), "plain text");
    }
}
