//! Canonical collection and tag storage, snapshot persistence and HTTP fetch
//! utilities for the site inventory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;
use wpinv_core::{SiteFields, TagRecord};

pub const CRATE_NAME: &str = "wpinv-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("stored document is not valid: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Snapshot(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct SnapshotWrite {
    pub content_hash: String,
    pub byte_size: usize,
    pub skipped: bool,
}

/// A JSON document persisted with temp-file + rename so readers never see a
/// torn write. Writes whose content hash matches the last write are skipped.
#[derive(Debug)]
pub struct SnapshotFile {
    path: PathBuf,
    last_hash: Mutex<Option<String>>,
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_hash: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub async fn load<T: DeserializeOwned>(&self) -> anyhow::Result<Option<T>> {
        if !fs::try_exists(&self.path)
            .await
            .with_context(|| format!("checking snapshot path {}", self.path.display()))?
        {
            return Ok(None);
        }
        let bytes = fs::read(&self.path)
            .await
            .with_context(|| format!("reading snapshot {}", self.path.display()))?;
        let value = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing snapshot {}", self.path.display()))?;
        *self.last_hash.lock().await = Some(Self::sha256_hex(&bytes));
        Ok(Some(value))
    }

    pub async fn store_json<T: Serialize>(&self, value: &T) -> anyhow::Result<SnapshotWrite> {
        let bytes = serde_json::to_vec_pretty(value).context("serializing snapshot")?;
        let content_hash = Self::sha256_hex(&bytes);
        let mut last_hash = self.last_hash.lock().await;
        if last_hash.as_deref() == Some(content_hash.as_str()) {
            return Ok(SnapshotWrite {
                content_hash,
                byte_size: bytes.len(),
                skipped: true,
            });
        }

        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating snapshot directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp snapshot file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp snapshot {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            });
        }

        *last_hash = Some(content_hash.clone());
        Ok(SnapshotWrite {
            content_hash,
            byte_size: bytes.len(),
            skipped: false,
        })
    }
}

/// A record of the canonical collection, keyed by canonical URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalSite {
    pub url: String,
    pub fields: SiteFields,
    /// Identifier of the legacy document this record mirrors, if any.
    #[serde(default)]
    pub source_id: Option<String>,
    /// Set when the legacy document went away and the record was retained.
    #[serde(default)]
    pub stale: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// Fold an upsert onto the current record. Present fields overwrite, absent
/// fields are kept, and a repeated identical payload is `Unchanged`.
pub fn apply_upsert(
    existing: Option<&CanonicalSite>,
    url: &str,
    fields: &SiteFields,
    source_id: Option<&str>,
    now: DateTime<Utc>,
) -> (CanonicalSite, UpsertOutcome) {
    let Some(current) = existing else {
        let mut fields = fields.clone();
        fields.strip_tag_fields();
        return (
            CanonicalSite {
                url: url.to_string(),
                fields,
                source_id: source_id.map(ToString::to_string),
                stale: false,
                updated_at: now,
            },
            UpsertOutcome::Inserted,
        );
    };

    let mut next = current.clone();
    next.fields.overlay(fields);
    next.fields.strip_tag_fields();
    if let Some(source_id) = source_id {
        next.source_id = Some(source_id.to_string());
    }
    next.stale = false;

    if next.fields == current.fields && next.source_id == current.source_id && !current.stale {
        (current.clone(), UpsertOutcome::Unchanged)
    } else {
        next.updated_at = now;
        (next, UpsertOutcome::Updated)
    }
}

#[async_trait]
pub trait SiteCollection: Send + Sync {
    async fn get(&self, url: &str) -> Result<Option<CanonicalSite>, StoreError>;

    async fn find_by_source_id(&self, source_id: &str)
        -> Result<Option<CanonicalSite>, StoreError>;

    async fn list(&self) -> Result<Vec<CanonicalSite>, StoreError>;

    async fn upsert(
        &self,
        url: &str,
        fields: &SiteFields,
        source_id: Option<&str>,
    ) -> Result<UpsertOutcome, StoreError>;

    /// Update the record carrying `source_id`, moving it when the document's
    /// URL changed. Returns `None` when no record carries that id.
    async fn update_by_source_id(
        &self,
        source_id: &str,
        url: &str,
        fields: &SiteFields,
    ) -> Result<Option<UpsertOutcome>, StoreError>;

    async fn remove(&self, url: &str) -> Result<bool, StoreError>;

    async fn mark_stale(&self, url: &str) -> Result<bool, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipChange {
    Applied,
    AlreadyMember,
    NotMember,
    TagMissing,
}

#[async_trait]
pub trait TagStore: Send + Sync {
    async fn get_tag(&self, id: &str) -> Result<Option<TagRecord>, StoreError>;

    async fn list_tags(&self) -> Result<Vec<TagRecord>, StoreError>;

    /// Insert a tag unless one with the same id exists. Used for seeding.
    async fn insert_tag_if_absent(&self, tag: TagRecord) -> Result<bool, StoreError>;

    async fn add_member(&self, tag_id: &str, url: &str) -> Result<MembershipChange, StoreError>;

    async fn remove_member(&self, tag_id: &str, url: &str)
        -> Result<MembershipChange, StoreError>;
}

/// In-process canonical collection, optionally persisted to a snapshot file
/// after every mutation. A mutation becomes visible only once its snapshot
/// write succeeded.
#[derive(Debug, Default)]
pub struct MemorySiteCollection {
    records: RwLock<BTreeMap<String, CanonicalSite>>,
    snapshot: Option<SnapshotFile>,
}

impl MemorySiteCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let snapshot = SnapshotFile::new(path);
        let records = snapshot
            .load::<Vec<CanonicalSite>>()
            .await?
            .unwrap_or_default()
            .into_iter()
            .map(|site| (site.url.clone(), site))
            .collect();
        Ok(Self {
            records: RwLock::new(records),
            snapshot: Some(snapshot),
        })
    }

    async fn persist(&self, records: &BTreeMap<String, CanonicalSite>) -> Result<(), StoreError> {
        if let Some(snapshot) = &self.snapshot {
            let rows = records.values().collect::<Vec<_>>();
            let write = snapshot.store_json(&rows).await?;
            debug!(
                path = %snapshot.path().display(),
                hash = %write.content_hash,
                skipped = write.skipped,
                "canonical collection snapshot"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl SiteCollection for MemorySiteCollection {
    async fn get(&self, url: &str) -> Result<Option<CanonicalSite>, StoreError> {
        Ok(self.records.read().await.get(url).cloned())
    }

    async fn find_by_source_id(
        &self,
        source_id: &str,
    ) -> Result<Option<CanonicalSite>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .find(|site| site.source_id.as_deref() == Some(source_id))
            .cloned())
    }

    async fn list(&self) -> Result<Vec<CanonicalSite>, StoreError> {
        Ok(self.records.read().await.values().cloned().collect())
    }

    async fn upsert(
        &self,
        url: &str,
        fields: &SiteFields,
        source_id: Option<&str>,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut records = self.records.write().await;
        let (next, outcome) = apply_upsert(records.get(url), url, fields, source_id, Utc::now());
        if outcome != UpsertOutcome::Unchanged {
            let mut staged = records.clone();
            staged.insert(url.to_string(), next);
            self.persist(&staged).await?;
            *records = staged;
        }
        Ok(outcome)
    }

    async fn update_by_source_id(
        &self,
        source_id: &str,
        url: &str,
        fields: &SiteFields,
    ) -> Result<Option<UpsertOutcome>, StoreError> {
        let mut records = self.records.write().await;
        let Some(current_url) = records
            .values()
            .find(|site| site.source_id.as_deref() == Some(source_id))
            .map(|site| site.url.clone())
        else {
            return Ok(None);
        };

        let now = Utc::now();
        let mut staged = records.clone();
        let outcome = if current_url == url {
            let (next, outcome) = apply_upsert(staged.get(url), url, fields, Some(source_id), now);
            if outcome != UpsertOutcome::Unchanged {
                staged.insert(url.to_string(), next);
            }
            outcome
        } else {
            let moved = staged.remove(&current_url);
            let mut carried = moved.map(|site| site.fields).unwrap_or_default();
            carried.overlay(fields);
            let (next, _) = apply_upsert(staged.get(url), url, &carried, Some(source_id), now);
            staged.insert(url.to_string(), next);
            UpsertOutcome::Updated
        };

        if outcome != UpsertOutcome::Unchanged {
            self.persist(&staged).await?;
            *records = staged;
        }
        Ok(Some(outcome))
    }

    async fn remove(&self, url: &str) -> Result<bool, StoreError> {
        let mut records = self.records.write().await;
        if !records.contains_key(url) {
            return Ok(false);
        }
        let mut staged = records.clone();
        staged.remove(url);
        self.persist(&staged).await?;
        *records = staged;
        Ok(true)
    }

    async fn mark_stale(&self, url: &str) -> Result<bool, StoreError> {
        let mut records = self.records.write().await;
        match records.get(url) {
            None => return Ok(false),
            Some(site) if site.stale => return Ok(true),
            Some(_) => {}
        }
        let mut staged = records.clone();
        if let Some(site) = staged.get_mut(url) {
            site.stale = true;
            site.updated_at = Utc::now();
        }
        self.persist(&staged).await?;
        *records = staged;
        Ok(true)
    }
}

#[derive(Debug, Default)]
pub struct MemoryTagStore {
    tags: RwLock<BTreeMap<String, TagRecord>>,
    snapshot: Option<SnapshotFile>,
}

impl MemoryTagStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tags(tags: impl IntoIterator<Item = TagRecord>) -> Self {
        Self {
            tags: RwLock::new(tags.into_iter().map(|t| (t.id.clone(), t)).collect()),
            snapshot: None,
        }
    }

    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let snapshot = SnapshotFile::new(path);
        let tags = snapshot
            .load::<Vec<TagRecord>>()
            .await?
            .unwrap_or_default()
            .into_iter()
            .map(|tag| (tag.id.clone(), tag))
            .collect();
        Ok(Self {
            tags: RwLock::new(tags),
            snapshot: Some(snapshot),
        })
    }

    async fn persist(&self, tags: &BTreeMap<String, TagRecord>) -> Result<(), StoreError> {
        if let Some(snapshot) = &self.snapshot {
            snapshot.store_json(&tags.values().collect::<Vec<_>>()).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl TagStore for MemoryTagStore {
    async fn get_tag(&self, id: &str) -> Result<Option<TagRecord>, StoreError> {
        Ok(self.tags.read().await.get(id).cloned())
    }

    async fn list_tags(&self) -> Result<Vec<TagRecord>, StoreError> {
        Ok(self.tags.read().await.values().cloned().collect())
    }

    async fn insert_tag_if_absent(&self, tag: TagRecord) -> Result<bool, StoreError> {
        let mut tags = self.tags.write().await;
        if tags.contains_key(&tag.id) {
            return Ok(false);
        }
        let mut staged = tags.clone();
        staged.insert(tag.id.clone(), tag);
        self.persist(&staged).await?;
        *tags = staged;
        Ok(true)
    }

    async fn add_member(&self, tag_id: &str, url: &str) -> Result<MembershipChange, StoreError> {
        let mut tags = self.tags.write().await;
        let mut staged = tags.clone();
        let Some(tag) = staged.get_mut(tag_id) else {
            return Ok(MembershipChange::TagMissing);
        };
        if tag.has_member(url) {
            return Ok(MembershipChange::AlreadyMember);
        }
        tag.sites.push(url.to_string());
        self.persist(&staged).await?;
        *tags = staged;
        Ok(MembershipChange::Applied)
    }

    async fn remove_member(
        &self,
        tag_id: &str,
        url: &str,
    ) -> Result<MembershipChange, StoreError> {
        let mut tags = self.tags.write().await;
        let mut staged = tags.clone();
        let Some(tag) = staged.get_mut(tag_id) else {
            return Ok(MembershipChange::TagMissing);
        };
        let before = tag.sites.len();
        tag.sites.retain(|s| s != url);
        if tag.sites.len() == before {
            return Ok(MembershipChange::NotMember);
        }
        self.persist(&staged).await?;
        *tags = staged;
        Ok(MembershipChange::Applied)
    }
}

/// Postgres-backed canonical collection and tag store. Site fields and tag
/// metadata are JSONB documents; every mutation runs in one transaction with
/// the touched row locked.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running migrations")
    }

    fn site_from_row(row: &sqlx::postgres::PgRow) -> Result<CanonicalSite, StoreError> {
        let fields: serde_json::Value = row.try_get("fields")?;
        Ok(CanonicalSite {
            url: row.try_get("url")?,
            fields: serde_json::from_value(fields)?,
            source_id: row.try_get("source_id")?,
            stale: row.try_get("stale")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn tag_from_row(row: &sqlx::postgres::PgRow) -> Result<TagRecord, StoreError> {
        let doc: serde_json::Value = row.try_get("doc")?;
        let mut tag: TagRecord = serde_json::from_value(doc)?;
        tag.id = row.try_get("id")?;
        tag.sites = row.try_get("sites")?;
        Ok(tag)
    }

    async fn write_site(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        site: &CanonicalSite,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO canonical_sites (url, fields, source_id, stale, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (url) DO UPDATE
               SET fields = EXCLUDED.fields,
                   source_id = EXCLUDED.source_id,
                   stale = EXCLUDED.stale,
                   updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&site.url)
        .bind(serde_json::to_value(&site.fields)?)
        .bind(&site.source_id)
        .bind(site.stale)
        .bind(site.updated_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn locked_site(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        url: &str,
    ) -> Result<Option<CanonicalSite>, StoreError> {
        let row = sqlx::query(
            "SELECT url, fields, source_id, stale, updated_at FROM canonical_sites WHERE url = $1 FOR UPDATE",
        )
        .bind(url)
        .fetch_optional(&mut **tx)
        .await?;
        row.as_ref().map(Self::site_from_row).transpose()
    }
}

#[async_trait]
impl SiteCollection for PgStore {
    async fn get(&self, url: &str) -> Result<Option<CanonicalSite>, StoreError> {
        let row = sqlx::query(
            "SELECT url, fields, source_id, stale, updated_at FROM canonical_sites WHERE url = $1",
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::site_from_row).transpose()
    }

    async fn find_by_source_id(
        &self,
        source_id: &str,
    ) -> Result<Option<CanonicalSite>, StoreError> {
        let row = sqlx::query(
            "SELECT url, fields, source_id, stale, updated_at FROM canonical_sites WHERE source_id = $1 LIMIT 1",
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::site_from_row).transpose()
    }

    async fn list(&self) -> Result<Vec<CanonicalSite>, StoreError> {
        let rows = sqlx::query(
            "SELECT url, fields, source_id, stale, updated_at FROM canonical_sites ORDER BY url",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::site_from_row).collect()
    }

    async fn upsert(
        &self,
        url: &str,
        fields: &SiteFields,
        source_id: Option<&str>,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let existing = Self::locked_site(&mut tx, url).await?;
        let (next, outcome) = apply_upsert(existing.as_ref(), url, fields, source_id, Utc::now());
        if outcome != UpsertOutcome::Unchanged {
            Self::write_site(&mut tx, &next).await?;
        }
        tx.commit().await?;
        Ok(outcome)
    }

    async fn update_by_source_id(
        &self,
        source_id: &str,
        url: &str,
        fields: &SiteFields,
    ) -> Result<Option<UpsertOutcome>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT url, fields, source_id, stale, updated_at FROM canonical_sites WHERE source_id = $1 LIMIT 1 FOR UPDATE",
        )
        .bind(source_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(current) = row.as_ref().map(Self::site_from_row).transpose()? else {
            tx.rollback().await?;
            return Ok(None);
        };

        let now = Utc::now();
        let outcome = if current.url == url {
            let (next, outcome) = apply_upsert(Some(&current), url, fields, Some(source_id), now);
            if outcome != UpsertOutcome::Unchanged {
                Self::write_site(&mut tx, &next).await?;
            }
            outcome
        } else {
            sqlx::query("DELETE FROM canonical_sites WHERE url = $1")
                .bind(&current.url)
                .execute(&mut *tx)
                .await?;
            let mut carried = current.fields.clone();
            carried.overlay(fields);
            let target = Self::locked_site(&mut tx, url).await?;
            let (next, _) = apply_upsert(target.as_ref(), url, &carried, Some(source_id), now);
            Self::write_site(&mut tx, &next).await?;
            UpsertOutcome::Updated
        };
        tx.commit().await?;
        Ok(Some(outcome))
    }

    async fn remove(&self, url: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM canonical_sites WHERE url = $1")
            .bind(url)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_stale(&self, url: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE canonical_sites SET stale = TRUE, updated_at = NOW() WHERE url = $1",
        )
        .bind(url)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl TagStore for PgStore {
    async fn get_tag(&self, id: &str) -> Result<Option<TagRecord>, StoreError> {
        let row = sqlx::query("SELECT id, doc, sites FROM tags WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::tag_from_row).transpose()
    }

    async fn list_tags(&self) -> Result<Vec<TagRecord>, StoreError> {
        let rows = sqlx::query("SELECT id, doc, sites FROM tags ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::tag_from_row).collect()
    }

    async fn insert_tag_if_absent(&self, tag: TagRecord) -> Result<bool, StoreError> {
        let doc = serde_json::to_value(tag.without_members())?;
        let result = sqlx::query(
            "INSERT INTO tags (id, doc, sites) VALUES ($1, $2, $3) ON CONFLICT (id) DO NOTHING",
        )
        .bind(&tag.id)
        .bind(doc)
        .bind(&tag.sites)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn add_member(&self, tag_id: &str, url: &str) -> Result<MembershipChange, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT sites FROM tags WHERE id = $1 FOR UPDATE")
            .bind(tag_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(MembershipChange::TagMissing);
        };
        let sites: Vec<String> = row.try_get("sites")?;
        if sites.iter().any(|s| s == url) {
            tx.rollback().await?;
            return Ok(MembershipChange::AlreadyMember);
        }
        sqlx::query("UPDATE tags SET sites = array_append(sites, $2) WHERE id = $1")
            .bind(tag_id)
            .bind(url)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(MembershipChange::Applied)
    }

    async fn remove_member(
        &self,
        tag_id: &str,
        url: &str,
    ) -> Result<MembershipChange, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT sites FROM tags WHERE id = $1 FOR UPDATE")
            .bind(tag_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(MembershipChange::TagMissing);
        };
        let sites: Vec<String> = row.try_get("sites")?;
        if !sites.iter().any(|s| s == url) {
            tx.rollback().await?;
            return Ok(MembershipChange::NotMember);
        }
        sqlx::query("UPDATE tags SET sites = array_remove(sites, $2) WHERE id = $1")
            .bind(tag_id)
            .bind(url)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(MembershipChange::Applied)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher is shut down")]
    Closed,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let _permit = self.limit.acquire().await.map_err(|_| FetchError::Closed)?;
        self.fetch_with_retries(url)
            .instrument(info_span!("http_fetch", url))
            .await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            let (disposition, err) = match self.attempt(url).await {
                Ok(resp) => return Ok(resp),
                Err(failure) => failure,
            };
            let exhausted = attempt >= self.backoff.max_retries;
            if disposition == RetryDisposition::NonRetryable || exhausted {
                return Err(err);
            }
            let delay = self.backoff.delay_for_attempt(attempt);
            warn!(attempt = attempt + 1, ?delay, error = %err, "fetch failed; retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn attempt(&self, url: &str) -> Result<FetchedResponse, (RetryDisposition, FetchError)> {
        let resp = match self.client.get(url).send().await {
            Ok(resp) => resp,
            Err(err) => return Err((classify_reqwest_error(&err), FetchError::Request(err))),
        };
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            let err = FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            };
            return Err((classify_status(status), err));
        }
        let body = resp
            .bytes()
            .await
            .map_err(|err| (classify_reqwest_error(&err), FetchError::Request(err)))?;
        debug!(%final_url, bytes = body.len(), "fetched");
        Ok(FetchedResponse {
            status,
            final_url,
            body: body.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use wpinv_core::TagType;

    fn fields(title: &str) -> SiteFields {
        SiteFields {
            title: Some(title.to_string()),
            ..Default::default()
        }
    }

    fn tag(id: &str, sites: &[&str]) -> TagRecord {
        TagRecord {
            id: id.to_string(),
            name_fr: format!("{id}-fr"),
            name_en: format!("{id}-en"),
            url_fr: String::new(),
            url_en: String::new(),
            tag_type: TagType::Institute,
            sites: sites.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn snapshot_hashing_is_stable() {
        let hash = SnapshotFile::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn snapshot_writes_skip_unchanged_content() {
        let dir = tempdir().expect("tempdir");
        let snapshot = SnapshotFile::new(dir.path().join("nested/sites.json"));
        let first = snapshot.store_json(&vec!["a"]).await.expect("first write");
        let second = snapshot.store_json(&vec!["a"]).await.expect("second write");
        let third = snapshot.store_json(&vec!["b"]).await.expect("third write");

        assert!(!first.skipped);
        assert!(second.skipped);
        assert!(!third.skipped);
        let loaded: Vec<String> = snapshot.load().await.expect("load").expect("present");
        assert_eq!(loaded, vec!["b"]);
    }

    #[tokio::test]
    async fn repeated_upsert_is_unchanged() {
        let sites = MemorySiteCollection::new();
        let url = "https://example.org/a/";
        assert_eq!(
            sites.upsert(url, &fields("A"), Some("doc1")).await.unwrap(),
            UpsertOutcome::Inserted
        );
        let before = sites.get(url).await.unwrap().unwrap();
        assert_eq!(
            sites.upsert(url, &fields("A"), Some("doc1")).await.unwrap(),
            UpsertOutcome::Unchanged
        );
        assert_eq!(sites.get(url).await.unwrap().unwrap(), before);
        assert_eq!(
            sites.upsert(url, &fields("B"), None).await.unwrap(),
            UpsertOutcome::Updated
        );
        let after = sites.get(url).await.unwrap().unwrap();
        assert_eq!(after.fields.title.as_deref(), Some("B"));
        assert_eq!(after.source_id.as_deref(), Some("doc1"));
    }

    #[tokio::test]
    async fn update_by_source_id_follows_url_changes() {
        let sites = MemorySiteCollection::new();
        sites
            .upsert("https://example.org/old/", &fields("Old"), Some("doc1"))
            .await
            .unwrap();
        let outcome = sites
            .update_by_source_id(
                "doc1",
                "https://example.org/new/",
                &SiteFields {
                    comment: Some("moved".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome, Some(UpsertOutcome::Updated));
        assert!(sites.get("https://example.org/old/").await.unwrap().is_none());
        let moved = sites.get("https://example.org/new/").await.unwrap().unwrap();
        assert_eq!(moved.fields.title.as_deref(), Some("Old"));
        assert_eq!(moved.fields.comment.as_deref(), Some("moved"));
        assert_eq!(
            sites
                .update_by_source_id("missing", "https://example.org/x/", &fields("X"))
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn stale_records_revive_on_upsert() {
        let sites = MemorySiteCollection::new();
        let url = "https://example.org/a/";
        sites.upsert(url, &fields("A"), Some("doc1")).await.unwrap();
        assert!(sites.mark_stale(url).await.unwrap());
        assert!(sites.get(url).await.unwrap().unwrap().stale);
        assert_eq!(
            sites.upsert(url, &fields("A"), Some("doc1")).await.unwrap(),
            UpsertOutcome::Updated
        );
        assert!(!sites.get(url).await.unwrap().unwrap().stale);
        assert!(!sites.mark_stale("https://example.org/none/").await.unwrap());
    }

    #[tokio::test]
    async fn collection_snapshot_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("sites.json");
        {
            let sites = MemorySiteCollection::open(&path).await.unwrap();
            sites
                .upsert("https://example.org/a/", &fields("A"), Some("doc1"))
                .await
                .unwrap();
        }
        let reopened = MemorySiteCollection::open(&path).await.unwrap();
        let site = reopened
            .find_by_source_id("doc1")
            .await
            .unwrap()
            .expect("persisted");
        assert_eq!(site.url, "https://example.org/a/");
    }

    #[tokio::test]
    async fn failed_snapshot_write_leaves_memory_untouched() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("sites.json");
        let sites = MemorySiteCollection::open(&path).await.unwrap();
        let tags = MemoryTagStore::open(dir.path().join("tags.json")).await.unwrap();
        tags.insert_tag_if_absent(tag("t1", &[])).await.unwrap();

        // A directory where the snapshot belongs makes the rename fail.
        std::fs::create_dir_all(path.join("blocker")).unwrap();
        assert!(sites
            .upsert("https://example.org/a/", &fields("A"), Some("doc1"))
            .await
            .is_err());
        assert!(sites.get("https://example.org/a/").await.unwrap().is_none());

        std::fs::remove_file(dir.path().join("tags.json")).unwrap();
        std::fs::create_dir_all(dir.path().join("tags.json/blocker")).unwrap();
        assert!(tags.add_member("t1", "https://example.org/a/").await.is_err());
        let t1 = tags.get_tag("t1").await.unwrap().unwrap();
        assert!(t1.sites.is_empty());

        std::fs::remove_dir_all(&path).unwrap();
        assert_eq!(
            sites
                .upsert("https://example.org/a/", &fields("A"), Some("doc1"))
                .await
                .unwrap(),
            UpsertOutcome::Inserted
        );
        assert!(path.is_file());
    }

    #[tokio::test]
    async fn membership_changes_are_reported() {
        let tags = MemoryTagStore::with_tags([tag("t1", &["https://example.org/a/"])]);
        assert_eq!(
            tags.add_member("t1", "https://example.org/a/").await.unwrap(),
            MembershipChange::AlreadyMember
        );
        assert_eq!(
            tags.add_member("t1", "https://example.org/b/").await.unwrap(),
            MembershipChange::Applied
        );
        assert_eq!(
            tags.add_member("nope", "https://example.org/b/").await.unwrap(),
            MembershipChange::TagMissing
        );
        assert_eq!(
            tags.remove_member("t1", "https://example.org/c/").await.unwrap(),
            MembershipChange::NotMember
        );
        assert_eq!(
            tags.remove_member("t1", "https://example.org/a/").await.unwrap(),
            MembershipChange::Applied
        );
        let t1 = tags.get_tag("t1").await.unwrap().unwrap();
        assert_eq!(t1.sites, vec!["https://example.org/b/"]);
        assert!(!tags.insert_tag_if_absent(tag("t1", &[])).await.unwrap());
        assert!(tags.insert_tag_if_absent(tag("t2", &[])).await.unwrap());
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }
}
