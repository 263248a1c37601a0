use std::collections::HashSet;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use wpinv_sources::{LegacyChange, LegacyDocument, LegacySource};
use wpinv_storage::{BackoffPolicy, SiteCollection, StoreError, UpsertOutcome};

/// What the mirror does with a canonical record whose legacy document is gone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemovePolicy {
    #[default]
    Delete,
    RetainStale,
}

impl FromStr for RemovePolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "delete" => Ok(RemovePolicy::Delete),
            "retain-stale" | "retain_stale" | "stale" => Ok(RemovePolicy::RetainStale),
            other => Err(format!("unknown remove policy {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MirrorOutcome {
    Upserted { url: String, outcome: UpsertOutcome },
    Removed { url: String },
    MarkedStale { url: String },
    UnknownSource { id: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MirrorReport {
    pub documents: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub removed: usize,
    pub errors: Vec<String>,
}

impl MirrorReport {
    fn record(&mut self, outcome: &MirrorOutcome) {
        match outcome {
            MirrorOutcome::Upserted { outcome, .. } => match outcome {
                UpsertOutcome::Inserted => self.inserted += 1,
                UpsertOutcome::Updated => self.updated += 1,
                UpsertOutcome::Unchanged => self.unchanged += 1,
            },
            MirrorOutcome::Removed { .. } | MirrorOutcome::MarkedStale { .. } => self.removed += 1,
            MirrorOutcome::UnknownSource { .. } => {}
        }
    }
}

/// Replicates the legacy document feed into the canonical collection.
///
/// Every write carries the document's source id so later changes and
/// removals can find the record even after its URL moved.
pub struct StoreMirror {
    sites: Arc<dyn SiteCollection>,
    policy: RemovePolicy,
    retry: BackoffPolicy,
}

impl StoreMirror {
    pub fn new(sites: Arc<dyn SiteCollection>, policy: RemovePolicy) -> Self {
        Self {
            sites,
            policy,
            retry: BackoffPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: BackoffPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn policy(&self) -> RemovePolicy {
        self.policy
    }

    /// Upsert every document. Failures are collected per document; one bad
    /// write never stops the rest.
    pub async fn initial_sync(&self, documents: Vec<LegacyDocument>) -> MirrorReport {
        let mut report = MirrorReport {
            documents: documents.len(),
            ..Default::default()
        };
        for document in documents {
            match self.upsert_document(&document).await {
                Ok(outcome) => report.record(&outcome),
                Err(err) => {
                    warn!(id = %document.id, url = %document.url, error = %err, "initial sync write failed");
                    report.errors.push(format!("{}: {err}", document.id));
                }
            }
        }
        info!(
            documents = report.documents,
            inserted = report.inserted,
            updated = report.updated,
            unchanged = report.unchanged,
            errors = report.errors.len(),
            "legacy snapshot mirrored"
        );
        report
    }

    pub async fn apply(&self, change: LegacyChange) -> Result<MirrorOutcome, StoreError> {
        match change {
            LegacyChange::Added(document) => self.upsert_document(&document).await,
            LegacyChange::Changed(document) => {
                let sites = &self.sites;
                let (id, url, fields) = (&document.id, &document.url, &document.fields);
                let updated = self
                    .with_retries(move || sites.update_by_source_id(id, url, fields))
                    .await?;
                match updated {
                    Some(outcome) => Ok(MirrorOutcome::Upserted {
                        url: document.url.clone(),
                        outcome,
                    }),
                    // Never seen under this id; treat it as a fresh document.
                    None => self.upsert_document(&document).await,
                }
            }
            LegacyChange::Removed { id } => self.remove_document(&id).await,
        }
    }

    async fn upsert_document(
        &self,
        document: &LegacyDocument,
    ) -> Result<MirrorOutcome, StoreError> {
        let sites = &self.sites;
        let (id, url, fields) = (document.id.as_str(), &document.url, &document.fields);
        let outcome = self
            .with_retries(move || sites.upsert(url, fields, Some(id)))
            .await?;
        debug!(%url, ?outcome, "canonical site upserted");
        Ok(MirrorOutcome::Upserted {
            url: document.url.clone(),
            outcome,
        })
    }

    async fn remove_document(&self, id: &str) -> Result<MirrorOutcome, StoreError> {
        let sites = &self.sites;
        let Some(record) = self.with_retries(move || sites.find_by_source_id(id)).await? else {
            debug!(%id, "removal for unknown legacy document");
            return Ok(MirrorOutcome::UnknownSource { id: id.to_string() });
        };
        let url = record.url.as_str();
        match self.policy {
            RemovePolicy::Delete => {
                self.with_retries(move || sites.remove(url)).await?;
                info!(%url, "canonical site deleted");
                Ok(MirrorOutcome::Removed { url: record.url })
            }
            RemovePolicy::RetainStale => {
                self.with_retries(move || sites.mark_stale(url)).await?;
                info!(%url, "canonical site marked stale");
                Ok(MirrorOutcome::MarkedStale { url: record.url })
            }
        }
    }

    async fn with_retries<T, F, Fut>(&self, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0usize;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if is_transient(&err) && attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(attempt = attempt + 1, ?delay, error = %err, "canonical store write failed; retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Mirror the current snapshot once, then drop records whose legacy
    /// document is no longer in it.
    pub async fn sync_once(&self, source: &dyn LegacySource) -> anyhow::Result<MirrorReport> {
        let documents = source.snapshot().await?;
        let live: HashSet<String> = documents.iter().map(|doc| doc.id.clone()).collect();
        let mut report = self.initial_sync(documents).await;
        self.sweep_orphans(&live, &mut report).await;
        Ok(report)
    }

    async fn first_sync(&self, source: &dyn LegacySource) -> MirrorReport {
        let mut attempt = 0usize;
        loop {
            match self.sync_once(source).await {
                Ok(report) => return report,
                Err(err) => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(attempt = attempt + 1, ?delay, error = %err, "legacy snapshot unavailable; retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn sweep_orphans(&self, live: &HashSet<String>, report: &mut MirrorReport) {
        let records = match self.sites.list().await {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, "orphan sweep skipped");
                report.errors.push(format!("orphan sweep: {err}"));
                return;
            }
        };
        for record in records {
            let Some(id) = record.source_id else { continue };
            if live.contains(&id) || (record.stale && self.policy == RemovePolicy::RetainStale) {
                continue;
            }
            match self.remove_document(&id).await {
                Ok(outcome) => report.record(&outcome),
                Err(err) => report.errors.push(format!("removed {id}: {err}")),
            }
        }
    }

    /// Mirror the snapshot, then follow the change feed until it closes.
    /// The first snapshot is retried until it loads; the feed is only
    /// subscribed once the collection holds a full copy.
    pub async fn run(&self, source: &dyn LegacySource) -> anyhow::Result<MirrorReport> {
        let mut report = self.first_sync(source).await;
        let mut changes = source.subscribe().await?;
        while let Some(change) = changes.recv().await {
            let label = change_label(&change);
            match self.apply(change).await {
                Ok(outcome) => report.record(&outcome),
                Err(err) => {
                    warn!(change = %label, error = %err, "legacy change not mirrored");
                    report.errors.push(format!("{label}: {err}"));
                }
            }
        }
        info!("legacy change feed closed");
        Ok(report)
    }
}

fn change_label(change: &LegacyChange) -> String {
    match change {
        LegacyChange::Added(doc) => format!("added {}", doc.id),
        LegacyChange::Changed(doc) => format!("changed {}", doc.id),
        LegacyChange::Removed { id } => format!("removed {id}"),
    }
}

fn is_transient(err: &StoreError) -> bool {
    !matches!(err, StoreError::Decode(_))
}
