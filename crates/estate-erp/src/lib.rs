//! ERP source contract, the HTTP client behind it, and wire decoding of
//! ERP documents into core records.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use estate_core::{EntityKind, ExternalBuilding, SnapshotDetail, SnapshotRow};
use reqwest::{header, StatusCode, Url};
use serde::{Deserialize, Deserializer};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "estate-erp";

pub const DEFAULT_PAGE_LENGTH: u32 = 100_000;

/// Every variant means the same thing to callers: the fetch failed and the
/// pass must not reconcile anything.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("undecodable {kind} payload: {message}")]
    Decode { kind: EntityKind, message: String },
    #[error("invalid ERP url: {0}")]
    InvalidUrl(String),
    #[error("source unavailable: {0}")]
    Unavailable(String),
}

/// A full-snapshot source of ERP documents.
#[async_trait]
pub trait ErpSource: Send + Sync {
    /// Returns every document of `kind` as raw JSON objects, or an error.
    /// Never a partial list.
    async fn fetch_all(&self, kind: EntityKind) -> Result<Vec<JsonValue>, FetchError>;
}

#[derive(Clone)]
pub struct ErpClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub page_length: u32,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl fmt::Debug for ErpClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErpClientConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .field("page_length", &self.page_length)
            .field("timeout", &self.timeout)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

impl Default for ErpClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/api/resource".to_string(),
            api_key: String::new(),
            api_secret: String::new(),
            page_length: DEFAULT_PAGE_LENGTH,
            timeout: Duration::from_secs(60),
            user_agent: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    data: Vec<JsonValue>,
}

/// Token-authenticated client for the ERP's resource API.
pub struct ErpClient {
    client: reqwest::Client,
    base_url: Url,
    authorization: String,
    page_length: u32,
}

impl fmt::Debug for ErpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErpClient")
            .field("base_url", &self.base_url.as_str())
            .field("page_length", &self.page_length)
            .finish_non_exhaustive()
    }
}

impl ErpClient {
    pub fn new(config: ErpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        let base_url = Url::parse(&config.base_url)
            .with_context(|| format!("parsing ERP base url {}", config.base_url))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("ERP base url {} cannot carry a path", config.base_url);
        }

        Ok(Self {
            client,
            base_url,
            authorization: format!("Token {}:{}", config.api_key, config.api_secret),
            page_length: config.page_length.max(1),
        })
    }

    pub fn resource_url(&self, kind: EntityKind) -> Result<Url, FetchError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| FetchError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .push(kind.erp_resource());
        Ok(url)
    }

    async fn get_envelope(&self, kind: EntityKind, url: Url) -> Result<Vec<JsonValue>, FetchError> {
        let page_length = self.page_length.to_string();
        let resp = self
            .client
            .get(url.clone())
            .header(header::AUTHORIZATION, &self.authorization)
            .header(header::ACCEPT, "application/json")
            .query(&[("fields", r#"["*"]"#), ("limit_page_length", page_length.as_str())])
            .send()
            .await?;

        let status = resp.status();
        if status != StatusCode::OK {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let body = resp.bytes().await?;
        let envelope: Envelope = serde_json::from_slice(&body).map_err(|err| FetchError::Decode {
            kind,
            message: err.to_string(),
        })?;
        debug!(%kind, records = envelope.data.len(), bytes = body.len(), "erp snapshot received");
        Ok(envelope.data)
    }
}

#[async_trait]
impl ErpSource for ErpClient {
    async fn fetch_all(&self, kind: EntityKind) -> Result<Vec<JsonValue>, FetchError> {
        let url = self.resource_url(kind)?;
        let span = info_span!("erp_fetch", %kind, url = %url);
        self.get_envelope(kind, url).instrument(span).await
    }
}

/// Canned source keyed by kind. Backs tests and fixture-driven dry runs.
#[derive(Debug, Default)]
pub struct StaticSource {
    responses: Mutex<HashMap<EntityKind, Result<Vec<JsonValue>, String>>>,
    fetches: Mutex<HashMap<EntityKind, usize>>,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(kind: EntityKind, records: Vec<JsonValue>) -> Self {
        let mut responses = HashMap::new();
        responses.insert(kind, Ok(records));
        Self {
            responses: Mutex::new(responses),
            fetches: Mutex::new(HashMap::new()),
        }
    }

    pub fn failing(kind: EntityKind, message: impl Into<String>) -> Self {
        let mut responses = HashMap::new();
        responses.insert(kind, Err(message.into()));
        Self {
            responses: Mutex::new(responses),
            fetches: Mutex::new(HashMap::new()),
        }
    }

    /// Load `<dir>/<kind>.json` envelopes for every kind that has one.
    pub fn from_fixture_dir(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        let mut responses = HashMap::new();
        for kind in EntityKind::ALL {
            let path = dir.join(format!("{}.json", kind.as_str()));
            if !path.exists() {
                continue;
            }
            responses.insert(kind, Ok(load_fixture_envelope(&path)?));
        }
        Ok(Self {
            responses: Mutex::new(responses),
            fetches: Mutex::new(HashMap::new()),
        })
    }

    pub async fn set_records(&self, kind: EntityKind, records: Vec<JsonValue>) {
        self.responses.lock().await.insert(kind, Ok(records));
    }

    pub async fn set_failure(&self, kind: EntityKind, message: impl Into<String>) {
        self.responses.lock().await.insert(kind, Err(message.into()));
    }

    pub async fn fetches(&self, kind: EntityKind) -> usize {
        self.fetches.lock().await.get(&kind).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ErpSource for StaticSource {
    async fn fetch_all(&self, kind: EntityKind) -> Result<Vec<JsonValue>, FetchError> {
        *self.fetches.lock().await.entry(kind).or_default() += 1;
        match self.responses.lock().await.get(&kind) {
            Some(Ok(records)) => Ok(records.clone()),
            Some(Err(message)) => Err(FetchError::Unavailable(message.clone())),
            None => Err(FetchError::Unavailable(format!("no {kind} records configured"))),
        }
    }
}

pub fn load_fixture_envelope(path: impl AsRef<Path>) -> anyhow::Result<Vec<JsonValue>> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let envelope: Envelope =
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
    Ok(envelope.data)
}

/// Fetch and decode every building. One undecodable document fails the
/// whole snapshot.
pub async fn fetch_buildings(source: &dyn ErpSource) -> Result<Vec<ExternalBuilding>, FetchError> {
    source
        .fetch_all(EntityKind::Buildings)
        .await?
        .into_iter()
        .map(decode_building)
        .collect()
}

pub async fn fetch_snapshot(
    source: &dyn ErpSource,
    kind: EntityKind,
) -> Result<Vec<SnapshotRow>, FetchError> {
    source
        .fetch_all(kind)
        .await?
        .into_iter()
        .map(|value| decode_snapshot_row(kind, value))
        .collect()
}

// ERP numbers arrive as numbers, numeric strings, empty strings or null.
fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(match value {
        Some(JsonValue::Number(n)) => n.as_f64(),
        Some(JsonValue::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    })
}

fn lenient_i32<'de, D>(deserializer: D) -> Result<Option<i32>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient_f64(deserializer)?
        .filter(|v| v.is_finite() && *v >= i32::MIN as f64 && *v <= i32::MAX as f64)
        .map(|v| v.round() as i32))
}

#[derive(Debug, Deserialize)]
struct ErpBuilding {
    name: String,
    building_name: Option<String>,
    building_type: Option<String>,
    status: Option<String>,
    address: Option<String>,
    city: Option<String>,
    district: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64")]
    latitude: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    longitude: Option<f64>,
    #[serde(default, deserialize_with = "lenient_i32")]
    floors: Option<i32>,
    #[serde(default, deserialize_with = "lenient_f64")]
    total_area: Option<f64>,
    modified: Option<String>,
}

pub fn decode_building(value: JsonValue) -> Result<ExternalBuilding, FetchError> {
    let doc = ErpBuilding::deserialize(&value).map_err(|err| FetchError::Decode {
        kind: EntityKind::Buildings,
        message: err.to_string(),
    })?;
    Ok(ExternalBuilding {
        name: doc.building_name.unwrap_or_else(|| doc.name.clone()),
        external_id: doc.name,
        classification: doc.building_type,
        status: doc.status,
        address: doc.address,
        city: doc.city,
        district: doc.district,
        latitude: doc.latitude,
        longitude: doc.longitude,
        floors: doc.floors,
        total_area: doc.total_area,
        erp_modified: doc.modified,
        raw_payload: value,
    })
}

#[derive(Debug, Deserialize)]
struct ErpSalesDocument {
    name: String,
    building: Option<String>,
    workflow_state: Option<String>,
    status: Option<String>,
    creation: Option<String>,
    modified: Option<String>,
    // acquisition
    seller_name: Option<String>,
    acquisition_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64")]
    asking_price: Option<f64>,
    // proposal
    acquisition: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64")]
    proposed_price: Option<f64>,
    valid_until: Option<String>,
    // letter of intent
    proposal: Option<String>,
    buyer_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64")]
    offered_price: Option<f64>,
    signed_on: Option<String>,
}

pub fn decode_snapshot_row(kind: EntityKind, value: JsonValue) -> Result<SnapshotRow, FetchError> {
    let doc = ErpSalesDocument::deserialize(&value).map_err(|err| FetchError::Decode {
        kind,
        message: err.to_string(),
    })?;
    let detail = match kind {
        EntityKind::Acquisitions => SnapshotDetail::Acquisition {
            seller_name: doc.seller_name,
            acquisition_type: doc.acquisition_type,
            asking_price: doc.asking_price,
        },
        EntityKind::Proposals => SnapshotDetail::Proposal {
            acquisition_ref: doc.acquisition,
            proposed_price: doc.proposed_price,
            valid_until: doc.valid_until,
        },
        EntityKind::LettersOfIntent => SnapshotDetail::LetterOfIntent {
            proposal_ref: doc.proposal,
            buyer_name: doc.buyer_name,
            offered_price: doc.offered_price,
            signed_on: doc.signed_on,
        },
        EntityKind::Buildings => {
            return Err(FetchError::Decode {
                kind,
                message: "buildings are not a full-refresh kind".to_string(),
            })
        }
    };
    Ok(SnapshotRow {
        external_id: doc.name,
        building_ref: doc.building,
        workflow_state: doc.workflow_state,
        status: doc.status,
        erp_created: doc.creation,
        erp_modified: doc.modified,
        detail,
        raw_payload: value,
    })
}
