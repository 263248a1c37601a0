//! Origin adapters: the cluster custom-resource watch and the legacy document
//! change feed.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use wpinv_core::{normalize_site_url, ordered_languages, CategoryCatalog, KeyError, SiteFields};
use wpinv_storage::{FetchError, HttpFetcher};

pub const CRATE_NAME: &str = "wpinv-sources";

pub const DEFAULT_CLUSTER_PLATFORM: &str = "kubernetes";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub resource_version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteOwner {
    #[serde(default)]
    pub unit_id: Option<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PluginSet {
    Names(Vec<String>),
    Configured(BTreeMap<String, JsonValue>),
}

impl Default for PluginSet {
    fn default() -> Self {
        PluginSet::Names(Vec::new())
    }
}

impl PluginSet {
    pub fn names(&self) -> Vec<String> {
        match self {
            PluginSet::Names(names) => names.clone(),
            PluginSet::Configured(map) => map.keys().cloned().collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WordpressSpec {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub tagline: Option<String>,
    #[serde(default)]
    pub theme: Option<String>,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub plugins: PluginSet,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteSpec {
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub owner: Option<SiteOwner>,
    #[serde(default)]
    pub site_type: Option<String>,
    #[serde(default)]
    pub wordpress: WordpressSpec,
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

/// A custom resource announcing one managed site.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteObject {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: SiteSpec,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterSite {
    pub url: String,
    pub fields: SiteFields,
}

impl SiteObject {
    /// Canonical URL of the site: `https://` + hostname + path.
    pub fn site_url(&self) -> Result<String, MalformedEvent> {
        let name = self.metadata.name.clone().unwrap_or_default();
        let hostname = self
            .spec
            .hostname
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| MalformedEvent::MissingField {
                field: "spec.hostname",
                name: name.clone(),
            })?;
        let path = self
            .spec
            .path
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| MalformedEvent::MissingField {
                field: "spec.path",
                name: name.clone(),
            })?;
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        Ok(normalize_site_url(&format!("https://{hostname}{path}"))?)
    }

    /// Project the object onto the cluster-origin site fields. Tag-like spec
    /// keys are dropped; tags come from tag membership only.
    pub fn project(&self, catalog: &CategoryCatalog) -> Result<ClusterSite, MalformedEvent> {
        let url = self.site_url()?;
        let wordpress = &self.spec.wordpress;
        let plugins = wordpress.plugins.names();
        let unit_id = self
            .spec
            .owner
            .as_ref()
            .and_then(|owner| owner.unit_id.as_ref())
            .and_then(|value| match value {
                JsonValue::String(s) => Some(s.clone()),
                JsonValue::Number(n) => Some(n.to_string()),
                _ => None,
            });
        let categories = catalog.categories_for_plugins(&plugins);

        let mut fields = SiteFields {
            title: wordpress.title.clone(),
            tagline: wordpress.tagline.clone(),
            theme: wordpress.theme.clone(),
            languages: Some(ordered_languages(&wordpress.languages)),
            categories: (!categories.is_empty()).then_some(categories),
            unit_id,
            platform: Some(
                self.spec
                    .site_type
                    .clone()
                    .unwrap_or_else(|| DEFAULT_CLUSTER_PLATFORM.to_string()),
            ),
            k8s_name: self.metadata.name.clone(),
            extra: self.spec.extra.clone(),
            ..Default::default()
        };
        fields.strip_tag_fields();
        Ok(ClusterSite { url, fields })
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WatchStatus {
    #[serde(default)]
    pub code: Option<u16>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl WatchStatus {
    /// The resume point is older than the server keeps history for.
    pub fn is_expired(&self) -> bool {
        self.code == Some(410) || self.reason.as_deref() == Some("Expired")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Added(SiteObject),
    /// Update in place. The reconciler treats it exactly like `Added`.
    Modified(SiteObject),
    Deleted(SiteObject),
    Bookmark { resource_version: String },
    Error(WatchStatus),
}

impl WatchEvent {
    pub fn resource_version(&self) -> Option<&str> {
        match self {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => {
                obj.metadata.resource_version.as_deref()
            }
            WatchEvent::Bookmark { resource_version } => Some(resource_version),
            WatchEvent::Error(_) => None,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum MalformedEvent {
    #[error("undecodable watch event: {0}")]
    Json(String),
    #[error("unknown watch event type {0}")]
    UnknownKind(String),
    #[error("object {name:?} is missing {field}")]
    MissingField { field: &'static str, name: String },
    #[error(transparent)]
    Url(#[from] KeyError),
}

#[derive(Debug, Deserialize)]
struct RawWatchEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    object: JsonValue,
}

pub fn decode_watch_line(line: &str) -> Result<WatchEvent, MalformedEvent> {
    let raw: RawWatchEvent =
        serde_json::from_str(line).map_err(|err| MalformedEvent::Json(err.to_string()))?;
    let object = |value: JsonValue| {
        serde_json::from_value::<SiteObject>(value)
            .map_err(|err| MalformedEvent::Json(err.to_string()))
    };
    match raw.kind.as_str() {
        "ADDED" => Ok(WatchEvent::Added(object(raw.object)?)),
        "MODIFIED" => Ok(WatchEvent::Modified(object(raw.object)?)),
        "DELETED" => Ok(WatchEvent::Deleted(object(raw.object)?)),
        "BOOKMARK" => {
            let meta = object(raw.object)?.metadata;
            Ok(WatchEvent::Bookmark {
                resource_version: meta.resource_version.unwrap_or_default(),
            })
        }
        "ERROR" => Ok(WatchEvent::Error(
            serde_json::from_value(raw.object)
                .map_err(|err| MalformedEvent::Json(err.to_string()))?,
        )),
        other => Err(MalformedEvent::UnknownKind(other.to_string())),
    }
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("connecting to cluster api failed: {0}")]
    Connect(#[source] reqwest::Error),
    #[error("cluster api answered {status} for {url}")]
    Status { status: u16, url: String },
    #[error("watch stream broke: {0}")]
    Stream(#[source] reqwest::Error),
    #[error("resource version expired")]
    Gone,
    #[error("undecodable list response: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SiteList {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub items: Vec<SiteObject>,
}

impl SiteList {
    pub fn resource_version(&self) -> &str {
        self.metadata.resource_version.as_deref().unwrap_or("")
    }
}

/// Outcome of reading one line from a watch stream. The outer result is the
/// connection, the inner one the individual event.
pub type WatchItem = Result<Option<Result<WatchEvent, MalformedEvent>>, WatchError>;

#[async_trait]
pub trait WatchStream: Send {
    /// Next event, or `Ok(None)` once the server closed the stream.
    async fn next_event(&mut self) -> WatchItem;
}

#[async_trait]
pub trait WatchSource: Send + Sync {
    async fn list(&self) -> Result<SiteList, WatchError>;

    async fn watch(&self, resource_version: &str) -> Result<Box<dyn WatchStream>, WatchError>;
}

#[derive(Debug, Clone)]
pub struct KubeConfig {
    pub api_url: String,
    pub namespace: String,
    pub group: String,
    pub version: String,
    pub plural: String,
    pub token: Option<String>,
    pub ca_pem: Option<Vec<u8>>,
    pub connect_timeout: Duration,
    pub watch_timeout_secs: u64,
}

impl KubeConfig {
    pub fn collection_url(&self) -> String {
        format!(
            "{}/apis/{}/{}/namespaces/{}/{}",
            self.api_url.trim_end_matches('/'),
            self.group,
            self.version,
            self.namespace,
            self.plural
        )
    }
}

/// Namespace-scoped list and watch against a cluster API server.
#[derive(Debug, Clone)]
pub struct KubeWatchSource {
    client: reqwest::Client,
    config: Arc<KubeConfig>,
}

impl KubeWatchSource {
    pub fn new(config: KubeConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().connect_timeout(config.connect_timeout);
        if let Some(pem) = &config.ca_pem {
            let cert = reqwest::Certificate::from_pem(pem).context("parsing cluster CA")?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder.build().context("building cluster api client")?;
        Ok(Self {
            client,
            config: Arc::new(config),
        })
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self.client.get(url);
        match &self.config.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl WatchSource for KubeWatchSource {
    async fn list(&self) -> Result<SiteList, WatchError> {
        let url = self.config.collection_url();
        let resp = self.get(&url).send().await.map_err(WatchError::Connect)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(WatchError::Status {
                status: status.as_u16(),
                url,
            });
        }
        let body = resp.bytes().await.map_err(WatchError::Stream)?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn watch(&self, resource_version: &str) -> Result<Box<dyn WatchStream>, WatchError> {
        let url = self.config.collection_url();
        let timeout = self.config.watch_timeout_secs.to_string();
        let resp = self
            .get(&url)
            .query(&[
                ("watch", "1"),
                ("allowWatchBookmarks", "true"),
                ("resourceVersion", resource_version),
                ("timeoutSeconds", timeout.as_str()),
            ])
            .send()
            .await
            .map_err(WatchError::Connect)?;
        match resp.status() {
            StatusCode::GONE => Err(WatchError::Gone),
            status if !status.is_success() => Err(WatchError::Status {
                status: status.as_u16(),
                url,
            }),
            _ => Ok(Box::new(LineStream {
                response: resp,
                buffer: Vec::new(),
                done: false,
            })),
        }
    }
}

/// Splits a chunked HTTP body into newline-delimited watch events.
struct LineStream {
    response: reqwest::Response,
    buffer: Vec<u8>,
    done: bool,
}

impl LineStream {
    fn take_line(&mut self) -> Option<Vec<u8>> {
        let pos = self.buffer.iter().position(|b| *b == b'\n')?;
        let mut line = self.buffer.drain(..=pos).collect::<Vec<_>>();
        line.pop();
        Some(line)
    }
}

fn decode_line_bytes(line: &[u8]) -> Option<Result<WatchEvent, MalformedEvent>> {
    let text = match std::str::from_utf8(line) {
        Ok(text) => text.trim(),
        Err(err) => return Some(Err(MalformedEvent::Json(err.to_string()))),
    };
    if text.is_empty() {
        None
    } else {
        Some(decode_watch_line(text))
    }
}

#[async_trait]
impl WatchStream for LineStream {
    async fn next_event(&mut self) -> WatchItem {
        loop {
            while let Some(line) = self.take_line() {
                if let Some(event) = decode_line_bytes(&line) {
                    return Ok(Some(event));
                }
            }
            if self.done {
                let rest = std::mem::take(&mut self.buffer);
                return Ok(decode_line_bytes(&rest));
            }
            match self.response.chunk().await {
                Ok(Some(bytes)) => self.buffer.extend_from_slice(&bytes),
                Ok(None) => self.done = true,
                Err(err) => return Err(WatchError::Stream(err)),
            }
        }
    }
}

/// A legacy document with its source identifier split off from the fields.
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyDocument {
    pub id: String,
    pub url: String,
    pub fields: SiteFields,
}

#[derive(Debug, Error, PartialEq)]
pub enum MalformedDocument {
    #[error("legacy document is not an object")]
    NotAnObject,
    #[error("legacy document has no _id")]
    MissingId,
    #[error("legacy document {id} has no url")]
    MissingUrl { id: String },
    #[error("legacy document {id}: {reason}")]
    Invalid { id: String, reason: String },
}

impl LegacyDocument {
    pub fn from_json(value: JsonValue) -> Result<Self, MalformedDocument> {
        let JsonValue::Object(mut map) = value else {
            return Err(MalformedDocument::NotAnObject);
        };
        let id = match map.remove("_id") {
            Some(JsonValue::String(s)) if !s.is_empty() => s,
            Some(JsonValue::Number(n)) => n.to_string(),
            _ => return Err(MalformedDocument::MissingId),
        };
        let url = match map.remove("url") {
            Some(JsonValue::String(s)) if !s.trim().is_empty() => s,
            _ => return Err(MalformedDocument::MissingUrl { id }),
        };
        let url = normalize_site_url(&url).map_err(|err| MalformedDocument::Invalid {
            id: id.clone(),
            reason: err.to_string(),
        })?;
        let mut fields: SiteFields = serde_json::from_value(JsonValue::Object(map)).map_err(
            |err| MalformedDocument::Invalid {
                id: id.clone(),
                reason: err.to_string(),
            },
        )?;
        fields.strip_tag_fields();
        Ok(Self { id, url, fields })
    }

    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.url.as_bytes());
        hasher.update(serde_json::to_vec(&self.fields).unwrap_or_default());
        hex::encode(hasher.finalize())
    }
}

/// Identifier of a document that failed to parse, if it had a readable one.
fn readable_id(value: &JsonValue) -> Option<String> {
    match value.get("_id")? {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LegacyChange {
    Added(LegacyDocument),
    Changed(LegacyDocument),
    Removed { id: String },
}

#[derive(Debug, Default)]
pub struct ParsedDocuments {
    pub documents: Vec<LegacyDocument>,
    pub malformed: Vec<(Option<String>, MalformedDocument)>,
}

pub fn parse_documents(values: Vec<JsonValue>) -> ParsedDocuments {
    let mut parsed = ParsedDocuments::default();
    for value in values {
        let id = readable_id(&value);
        match LegacyDocument::from_json(value) {
            Ok(doc) => parsed.documents.push(doc),
            Err(err) => {
                warn!(id = ?id, error = %err, "skipping malformed legacy document");
                parsed.malformed.push((id, err));
            }
        }
    }
    parsed
}

/// Compare a fresh document set against the previous fingerprints. Documents
/// that became unreadable keep their previous fingerprint instead of being
/// reported as removed.
pub fn diff_documents(
    previous: &HashMap<String, String>,
    parsed: &ParsedDocuments,
) -> (Vec<LegacyChange>, HashMap<String, String>) {
    let mut changes = Vec::new();
    let mut next = HashMap::with_capacity(previous.len());

    for doc in &parsed.documents {
        let fingerprint = doc.fingerprint();
        match previous.get(&doc.id) {
            None => changes.push(LegacyChange::Added(doc.clone())),
            Some(old) if *old != fingerprint => changes.push(LegacyChange::Changed(doc.clone())),
            Some(_) => {}
        }
        next.insert(doc.id.clone(), fingerprint);
    }

    let unreadable = parsed
        .malformed
        .iter()
        .filter_map(|(id, _)| id.clone())
        .collect::<HashSet<_>>();
    let mut removed = previous
        .iter()
        .filter(|(id, _)| !next.contains_key(*id))
        .collect::<Vec<_>>();
    removed.sort_by(|a, b| a.0.cmp(b.0));
    for (id, fingerprint) in removed {
        if unreadable.contains(id) {
            next.insert(id.clone(), fingerprint.clone());
        } else {
            changes.push(LegacyChange::Removed { id: id.clone() });
        }
    }

    (changes, next)
}

#[derive(Debug, Error)]
pub enum LegacySourceError {
    #[error(transparent)]
    Load(#[from] anyhow::Error),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("legacy documents are not a JSON array: {0}")]
    Decode(#[from] serde_json::Error),
}

#[async_trait]
pub trait DocumentLoader: Send + Sync {
    async fn load(&self) -> Result<Vec<JsonValue>, LegacySourceError>;
}

#[derive(Debug, Clone)]
pub struct FileDocumentLoader {
    path: PathBuf,
}

impl FileDocumentLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DocumentLoader for FileDocumentLoader {
    async fn load(&self) -> Result<Vec<JsonValue>, LegacySourceError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[derive(Debug)]
pub struct HttpDocumentLoader {
    fetcher: HttpFetcher,
    url: String,
}

impl HttpDocumentLoader {
    pub fn new(fetcher: HttpFetcher, url: impl Into<String>) -> Self {
        Self {
            fetcher,
            url: url.into(),
        }
    }
}

#[async_trait]
impl DocumentLoader for HttpDocumentLoader {
    async fn load(&self) -> Result<Vec<JsonValue>, LegacySourceError> {
        let resp = self.fetcher.fetch_bytes(&self.url).await?;
        Ok(serde_json::from_slice(&resp.body)?)
    }
}

#[async_trait]
pub trait LegacySource: Send + Sync {
    /// Every current document, once.
    async fn snapshot(&self) -> Result<Vec<LegacyDocument>, LegacySourceError>;

    /// Changes relative to the last snapshot, for as long as the receiver lives.
    async fn subscribe(&self) -> Result<mpsc::Receiver<LegacyChange>, LegacySourceError>;
}

/// Change feed built by periodically reloading the legacy document set and
/// diffing per-document fingerprints.
pub struct PollingLegacySource {
    loader: Arc<dyn DocumentLoader>,
    interval: Duration,
    baseline: Arc<Mutex<HashMap<String, String>>>,
}

impl PollingLegacySource {
    pub fn new(loader: Arc<dyn DocumentLoader>, interval: Duration) -> Self {
        Self {
            loader,
            interval,
            baseline: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl LegacySource for PollingLegacySource {
    async fn snapshot(&self) -> Result<Vec<LegacyDocument>, LegacySourceError> {
        let parsed = parse_documents(self.loader.load().await?);
        let mut baseline = self.baseline.lock().await;
        let (_, next) = diff_documents(&HashMap::new(), &parsed);
        *baseline = next;
        Ok(parsed.documents)
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<LegacyChange>, LegacySourceError> {
        let (tx, rx) = mpsc::channel(256);
        let loader = Arc::clone(&self.loader);
        let baseline = Arc::clone(&self.baseline);
        let interval = self.interval;

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if tx.is_closed() {
                    return;
                }
                let values = match loader.load().await {
                    Ok(values) => values,
                    Err(err) => {
                        warn!(error = %err, "legacy document poll failed; retrying next interval");
                        continue;
                    }
                };
                let parsed = parse_documents(values);
                let changes = {
                    let mut guard = baseline.lock().await;
                    let (changes, next) = diff_documents(&guard, &parsed);
                    *guard = next;
                    changes
                };
                if !changes.is_empty() {
                    debug!(changes = changes.len(), "legacy change feed poll");
                }
                for change in changes {
                    if tx.send(change).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}
