use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{Broker, OrderRequest, OrderSnapshot};
use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::models::BrokerEvent;

type BrokerRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Page returned by `GET /events`
#[derive(Debug, Deserialize)]
struct EventsPage {
    events: Vec<BrokerEvent>,
    cursor: Option<String>,
}

/// JSON-over-HTTP exchange adapter
///
/// Endpoints (relative to `base_url`):
/// - `POST   /orders`              submit, body = [`OrderRequest`]
/// - `GET    /orders/{client_id}`  status
/// - `DELETE /orders/{client_id}`  cancel
/// - `GET    /events?since=cursor` fills and status changes
///
/// Requests are signed with HMAC-SHA256 over `timestamp + method + path + body`
/// when a secret is configured. Retries live in the caller; this type only
/// classifies failures.
#[derive(Clone)]
pub struct RestBroker {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    api_secret: Option<String>,
    rate_limiter: Arc<BrokerRateLimiter>,
    cursor: Arc<Mutex<Option<String>>>,
}

impl RestBroker {
    pub fn new(config: &BrokerConfig, timeout: Duration) -> Result<Self> {
        let base_url = config
            .base_url
            .clone()
            .context("broker.base_url is required for the rest broker")?;

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        let rps = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_second(rps)));

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            rate_limiter,
            cursor: Arc::new(Mutex::new(None)),
        })
    }

    fn sign(&self, timestamp: &str, method: &Method, path: &str, body: &str) -> Option<String> {
        let secret = self.api_secret.as_ref()?;
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).ok()?;
        mac.update(format!("{}{}{}{}", timestamp, method.as_str(), path, body).as_bytes());
        Some(hex::encode(mac.finalize().into_bytes()))
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<String>,
        read_only: bool,
    ) -> Result<T, BrokerError> {
        let text = self.send_raw(method, path, body, read_only).await?;
        serde_json::from_str(&text)
            .map_err(|e| BrokerError::Transient(format!("undecodable response: {}", e)))
    }

    /// One rate-limited, signed request; `read_only` requests never report ambiguity
    async fn send_raw(
        &self,
        method: Method,
        path: &str,
        body: Option<String>,
        read_only: bool,
    ) -> Result<String, BrokerError> {
        self.rate_limiter.until_ready().await;

        let body = body.unwrap_or_default();
        let timestamp = chrono::Utc::now().timestamp_millis().to_string();
        let url = format!("{}{}", self.base_url, path);

        let mut request = self
            .client
            .request(method.clone(), &url)
            .header("Content-Type", "application/json")
            .header("X-BB-TIMESTAMP", &timestamp);
        if let Some(key) = &self.api_key {
            request = request.header("X-BB-APIKEY", key);
        }
        if let Some(signature) = self.sign(&timestamp, &method, path, &body) {
            request = request.header("X-BB-SIGNATURE", signature);
        }
        if !body.is_empty() {
            request = request.body(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| classify_transport(e, read_only))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| classify_transport(e, read_only))?;
        if status.is_success() {
            return Ok(text);
        }
        Err(classify_status(status, text))
    }
}

fn classify_transport(e: reqwest::Error, read_only: bool) -> BrokerError {
    if e.is_timeout() && !read_only {
        BrokerError::Ambiguous(e.to_string())
    } else {
        BrokerError::Transient(e.to_string())
    }
}

fn classify_status(status: StatusCode, body: String) -> BrokerError {
    match status {
        StatusCode::NOT_FOUND => BrokerError::NotFound(body),
        StatusCode::CONFLICT if body.to_lowercase().contains("filled") => {
            BrokerError::AlreadyFilled(body)
        }
        StatusCode::CONFLICT => BrokerError::DuplicateOrder(body),
        StatusCode::TOO_MANY_REQUESTS => BrokerError::Transient(format!("rate limited: {}", body)),
        s if s.is_server_error() => BrokerError::Transient(format!("{}: {}", s, body)),
        s => BrokerError::Rejected(format!("{}: {}", s, body)),
    }
}

#[async_trait]
impl Broker for RestBroker {
    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderSnapshot, BrokerError> {
        let body = serde_json::to_string(request)
            .map_err(|e| BrokerError::Rejected(format!("unserializable order: {}", e)))?;
        self.send(Method::POST, "/orders", Some(body), false).await
    }

    async fn cancel_order(
        &self,
        client_order_id: Uuid,
        _instrument: &str,
    ) -> Result<(), BrokerError> {
        let path = format!("/orders/{}", client_order_id);
        self.send_raw(Method::DELETE, &path, None, false).await?;
        Ok(())
    }

    async fn fetch_order_status(
        &self,
        client_order_id: Uuid,
        _instrument: &str,
    ) -> Result<OrderSnapshot, BrokerError> {
        let path = format!("/orders/{}", client_order_id);
        self.send(Method::GET, &path, None, true).await
    }

    async fn poll_events(&self) -> Result<Vec<BrokerEvent>, BrokerError> {
        let mut cursor = self.cursor.lock().await;
        let path = match cursor.as_deref() {
            Some(c) => format!("/events?since={}", c),
            None => "/events".to_string(),
        };
        let page: EventsPage = self.send(Method::GET, &path, None, true).await?;
        if page.cursor.is_some() {
            *cursor = page.cursor;
        }
        Ok(page.events)
    }

    fn name(&self) -> &str {
        "rest"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE, String::new()),
            BrokerError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, String::new()),
            BrokerError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::CONFLICT, "duplicate client id".into()),
            BrokerError::DuplicateOrder(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::CONFLICT, "order already FILLED".into()),
            BrokerError::AlreadyFilled(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY, "insufficient balance".into()),
            BrokerError::Rejected(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, String::new()),
            BrokerError::NotFound(_)
        ));
    }

    #[test]
    fn test_signature_is_stable_hex() {
        let config = BrokerConfig {
            base_url: Some("http://localhost".to_string()),
            api_secret: Some("secret".to_string()),
            ..Default::default()
        };
        let broker = RestBroker::new(&config, Duration::from_secs(1)).unwrap();
        let a = broker.sign("1", &Method::POST, "/orders", "{}").unwrap();
        let b = broker.sign("1", &Method::POST, "/orders", "{}").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, broker.sign("2", &Method::POST, "/orders", "{}").unwrap());
    }

    #[test]
    fn test_missing_base_url() {
        assert!(RestBroker::new(&BrokerConfig::default(), Duration::from_secs(1)).is_err());
    }
}
