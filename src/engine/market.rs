use crate::engine::types::{Attribute, AttributeKind, SaleEvent};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::{StatusCode, Url};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const ACCEPT_VALUE: &str = "application/json, text/plain, */*";
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("marketplace rejected the credential (401)")]
    TokenInvalid,
    #[error("marketplace request failed: {0}")]
    Transient(String),
}

#[async_trait]
pub trait MarketFeed: Send + Sync {
    /// Latest purchase page, newest first as the API returns it.
    async fn fetch_latest(&self, token: &str, limit: usize) -> Result<Vec<SaleEvent>, FetchError>;

    /// Single 1-row call without retries. `TokenInvalid` only on HTTP 401;
    /// network trouble and other statuses come back as `Transient`.
    async fn probe(&self, token: &str) -> Result<(), FetchError>;
}

#[derive(Clone)]
pub struct MarketClient {
    http: reqwest::Client,
    endpoint: Url,
    retry_attempts: u32,
    request_timeout: Duration,
    backoff_unit: Duration,
}

impl MarketClient {
    pub fn new(endpoint: &str, retry_attempts: u32, request_timeout: Duration) -> Result<Self> {
        let endpoint = Url::parse(endpoint).context("invalid marketplace url")?;
        let http = reqwest::Client::builder()
            .build()
            .context("build marketplace http client")?;
        Ok(Self {
            http,
            endpoint,
            retry_attempts: retry_attempts.max(1),
            request_timeout,
            backoff_unit: Duration::from_secs(1),
        })
    }

    /// Base of the `2^attempt` backoff; one second in production.
    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    fn actions_url(&self, limit: usize) -> Url {
        let mut url = self.endpoint.clone();
        {
            let mut qp = url.query_pairs_mut();
            qp.append_pair("offset", "0");
            qp.append_pair("limit", &limit.to_string());
            qp.append_pair("action_types", "buy");
        }
        url
    }

    async fn fetch_once(
        &self,
        token: &str,
        limit: usize,
        timeout: Duration,
    ) -> Result<Vec<SaleEvent>, FetchError> {
        let resp = self
            .http
            .get(self.actions_url(limit))
            .header(AUTHORIZATION, token)
            .header(ACCEPT, ACCEPT_VALUE)
            .header(USER_AGENT, BROWSER_USER_AGENT)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| FetchError::Transient(format!("request error: {e}")))?;

        match resp.status() {
            StatusCode::OK => {}
            StatusCode::UNAUTHORIZED => return Err(FetchError::TokenInvalid),
            other => return Err(FetchError::Transient(format!("status {other}"))),
        }

        let body = resp
            .text()
            .await
            .map_err(|e| FetchError::Transient(format!("body read error: {e}")))?;
        parse_actions_page(&body).map_err(|e| FetchError::Transient(format!("{e:#}")))
    }
}

#[async_trait]
impl MarketFeed for MarketClient {
    async fn fetch_latest(&self, token: &str, limit: usize) -> Result<Vec<SaleEvent>, FetchError> {
        let mut last_err = String::from("no attempt made");
        for attempt in 0..self.retry_attempts {
            match self.fetch_once(token, limit, self.request_timeout).await {
                Ok(events) => {
                    info!(count = events.len(), "fetched purchases");
                    return Ok(events);
                }
                Err(FetchError::TokenInvalid) => {
                    warn!("authorization failed, credential expired");
                    return Err(FetchError::TokenInvalid);
                }
                Err(FetchError::Transient(e)) => {
                    warn!(attempt = attempt + 1, err = %e, "marketplace request failed");
                    last_err = e;
                }
            }
            if attempt + 1 < self.retry_attempts {
                tokio::time::sleep(self.backoff_unit * 2u32.saturating_pow(attempt)).await;
            }
        }
        Err(FetchError::Transient(last_err))
    }

    async fn probe(&self, token: &str) -> Result<(), FetchError> {
        match self.fetch_once(token, 1, PROBE_TIMEOUT).await {
            Ok(_) => {
                info!("token validation successful");
                Ok(())
            }
            Err(e) => {
                warn!(err = %e, "token validation failed");
                Err(e)
            }
        }
    }
}

/// Parses `{"actions": [...]}`, keeping purchases and skipping malformed rows.
pub fn parse_actions_page(body: &str) -> Result<Vec<SaleEvent>> {
    let page: ActionsPage = serde_json::from_str(body).context("marketplace json decode failed")?;
    let mut out = Vec::with_capacity(page.actions.len());
    for raw in page.actions {
        let action: RawAction = match serde_json::from_value(raw) {
            Ok(a) => a,
            Err(e) => {
                warn!(err = %e, "skipping undecodable action");
                continue;
            }
        };
        if action.kind.as_deref() != Some("purchase") {
            debug!(kind = ?action.kind, "ignoring non-purchase action");
            continue;
        }
        match action.into_sale_event() {
            Ok(ev) => out.push(ev),
            Err(e) => warn!(err = %e, "skipping malformed purchase"),
        }
    }
    Ok(out)
}

#[derive(Debug, Deserialize)]
struct ActionsPage {
    #[serde(default)]
    actions: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawAction {
    #[serde(default)]
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    amount: Option<serde_json::Value>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    nft: Option<RawNft>,
}

#[derive(Debug, Deserialize)]
struct RawNft {
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    external_collection_number: Option<serde_json::Value>,
    #[serde(default)]
    floor_price: Option<serde_json::Value>,
    #[serde(default)]
    attributes: Vec<RawAttribute>,
}

#[derive(Debug, Deserialize)]
struct RawAttribute {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    value: Option<serde_json::Value>,
    #[serde(default)]
    rarity_per_mille: Option<serde_json::Value>,
}

fn value_as_string(v: &serde_json::Value) -> Option<String> {
    match v {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn value_as_decimal(v: &serde_json::Value) -> Option<Decimal> {
    value_as_string(v).and_then(|s| Decimal::from_str(s.trim()).ok())
}

fn value_as_i64(v: &serde_json::Value) -> Option<i64> {
    match v {
        serde_json::Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                .map(|f| f as i64)
        }),
        serde_json::Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

impl RawAction {
    fn into_sale_event(self) -> Result<SaleEvent> {
        let nft = self.nft.ok_or_else(|| anyhow!("purchase without nft block"))?;
        let collectible_id = nft
            .id
            .as_ref()
            .and_then(value_as_string)
            .ok_or_else(|| anyhow!("nft without id"))?;
        let name = nft.name.ok_or_else(|| anyhow!("nft {collectible_id} without name"))?;
        let external_number = nft
            .external_collection_number
            .as_ref()
            .and_then(value_as_i64)
            .ok_or_else(|| anyhow!("nft {collectible_id} without external_collection_number"))?;
        let amount = self
            .amount
            .as_ref()
            .and_then(value_as_decimal)
            .ok_or_else(|| anyhow!("nft {collectible_id} with invalid amount"))?;
        let floor_price = nft
            .floor_price
            .as_ref()
            .and_then(value_as_decimal)
            .unwrap_or_default();
        let created_at = self
            .created_at
            .ok_or_else(|| anyhow!("nft {collectible_id} without created_at"))?;

        let attributes = nft
            .attributes
            .into_iter()
            .map(|a| Attribute {
                kind: AttributeKind::parse(&a.kind),
                value: a.value.as_ref().and_then(value_as_string).unwrap_or_default(),
                rarity_per_mille: a.rarity_per_mille.as_ref().and_then(value_as_i64).unwrap_or(0),
            })
            .collect();

        Ok(SaleEvent {
            action_id: SaleEvent::synth_action_id(&collectible_id, &created_at, &amount),
            collectible_id,
            name,
            external_number,
            amount,
            floor_price,
            created_at,
            attributes,
        })
    }
}
