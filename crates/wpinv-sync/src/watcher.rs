//! Resource watcher and the cluster-origin cache it owns.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};
use wpinv_core::{CategoryCatalog, SiteFields};
use wpinv_sources::{
    ClusterSite, MalformedEvent, SiteList, WatchError, WatchEvent, WatchSource, WatchStatus,
};
use wpinv_storage::BackoffPolicy;

/// Cluster-origin site fields keyed by canonical URL. Only the watcher
/// mutates it; everyone else goes through [`ClusterCacheReader`].
#[derive(Debug, Default)]
pub struct ClusterCache {
    sites: RwLock<BTreeMap<String, SiteFields>>,
}

impl ClusterCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reader(self: &Arc<Self>) -> ClusterCacheReader {
        ClusterCacheReader {
            inner: Arc::clone(self),
        }
    }

    /// Returns whether the stored entry changed.
    pub(crate) async fn upsert(&self, site: ClusterSite) -> bool {
        let mut sites = self.sites.write().await;
        match sites.get(&site.url) {
            Some(existing) if *existing == site.fields => false,
            _ => {
                sites.insert(site.url, site.fields);
                true
            }
        }
    }

    pub(crate) async fn remove(&self, url: &str) -> bool {
        self.sites.write().await.remove(url).is_some()
    }

    pub(crate) async fn replace_all(&self, sites: Vec<ClusterSite>) -> usize {
        let next = sites
            .into_iter()
            .map(|site| (site.url, site.fields))
            .collect::<BTreeMap<_, _>>();
        let count = next.len();
        *self.sites.write().await = next;
        count
    }
}

#[derive(Debug, Clone)]
pub struct ClusterCacheReader {
    inner: Arc<ClusterCache>,
}

impl ClusterCacheReader {
    pub async fn get(&self, url: &str) -> Option<SiteFields> {
        self.inner.sites.read().await.get(url).cloned()
    }

    pub async fn snapshot(&self) -> BTreeMap<String, SiteFields> {
        self.inner.sites.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.sites.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WatcherStatus {
    Disabled,
    Starting,
    Listing,
    Watching { resource_version: String },
    Reconnecting { attempt: usize, error: String },
    Failed { error: String },
}

impl WatcherStatus {
    pub fn label(&self) -> &'static str {
        match self {
            WatcherStatus::Disabled => "disabled",
            WatcherStatus::Starting => "starting",
            WatcherStatus::Listing => "listing",
            WatcherStatus::Watching { .. } => "watching",
            WatcherStatus::Reconnecting { .. } => "reconnecting",
            WatcherStatus::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WatcherStats {
    pub applied: u64,
    pub removed: u64,
    pub skipped: u64,
    pub reconnects: u64,
    pub relists: u64,
}

#[derive(Debug, Default)]
struct Counters {
    applied: AtomicU64,
    removed: AtomicU64,
    skipped: AtomicU64,
    reconnects: AtomicU64,
    relists: AtomicU64,
}

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("watch reconnection exhausted after {attempts} attempts: {last_error}")]
    ReconnectExhausted { attempts: usize, last_error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    Upserted { url: String, changed: bool },
    Removed { url: String, existed: bool },
    Skipped(MalformedEvent),
    Bookmark,
    /// The server ended the watch; the cache must be rebuilt from a list.
    Resync(WatchStatus),
}

enum SessionEnd {
    Closed { events: usize },
    Resync,
}

/// Keeps the cluster cache in sync with one namespace of site resources.
///
/// The first session lists every object and replaces the cache, then watches
/// from the list's resource version. Clean stream ends resume from the last
/// seen version; expired versions trigger a fresh list. Consecutive failures
/// back off exponentially and end the watcher once `backoff.max_retries` is
/// exceeded. `MODIFIED` events are applied exactly like `ADDED`.
pub struct ResourceWatcher {
    source: Arc<dyn WatchSource>,
    cache: Arc<ClusterCache>,
    catalog: CategoryCatalog,
    backoff: BackoffPolicy,
    status: watch::Sender<WatcherStatus>,
    counters: Counters,
}

impl ResourceWatcher {
    pub fn new(
        source: Arc<dyn WatchSource>,
        cache: Arc<ClusterCache>,
        catalog: CategoryCatalog,
        backoff: BackoffPolicy,
    ) -> Self {
        let (status, _) = watch::channel(WatcherStatus::Starting);
        Self {
            source,
            cache,
            catalog,
            backoff,
            status,
            counters: Counters::default(),
        }
    }

    pub fn reader(&self) -> ClusterCacheReader {
        self.cache.reader()
    }

    pub fn status(&self) -> watch::Receiver<WatcherStatus> {
        self.status.subscribe()
    }

    pub fn stats(&self) -> WatcherStats {
        WatcherStats {
            applied: self.counters.applied.load(Ordering::Relaxed),
            removed: self.counters.removed.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            reconnects: self.counters.reconnects.load(Ordering::Relaxed),
            relists: self.counters.relists.load(Ordering::Relaxed),
        }
    }

    fn publish(&self, status: WatcherStatus) {
        self.status.send_replace(status);
    }

    pub async fn apply_event(&self, event: WatchEvent) -> EventOutcome {
        match event {
            WatchEvent::Added(object) | WatchEvent::Modified(object) => {
                match object.project(&self.catalog) {
                    Ok(site) => {
                        let url = site.url.clone();
                        let changed = self.cache.upsert(site).await;
                        self.counters.applied.fetch_add(1, Ordering::Relaxed);
                        debug!(%url, changed, "cluster site upserted");
                        EventOutcome::Upserted { url, changed }
                    }
                    Err(err) => self.skip(object.metadata.name.as_deref(), err),
                }
            }
            WatchEvent::Deleted(object) => match object.site_url() {
                Ok(url) => {
                    let existed = self.cache.remove(&url).await;
                    self.counters.removed.fetch_add(1, Ordering::Relaxed);
                    debug!(%url, existed, "cluster site removed");
                    EventOutcome::Removed { url, existed }
                }
                Err(err) => self.skip(object.metadata.name.as_deref(), err),
            },
            WatchEvent::Bookmark { .. } => EventOutcome::Bookmark,
            WatchEvent::Error(status) => {
                warn!(code = ?status.code, reason = ?status.reason, message = ?status.message, "watch ended by server");
                EventOutcome::Resync(status)
            }
        }
    }

    fn skip(&self, name: Option<&str>, err: MalformedEvent) -> EventOutcome {
        self.counters.skipped.fetch_add(1, Ordering::Relaxed);
        warn!(name = name.unwrap_or("<unnamed>"), error = %err, "skipping malformed site event");
        EventOutcome::Skipped(err)
    }

    /// Replace the cache with a full listing; malformed items are skipped.
    pub async fn resync(&self, list: SiteList) -> usize {
        let mut sites = Vec::with_capacity(list.items.len());
        for object in &list.items {
            match object.project(&self.catalog) {
                Ok(site) => sites.push(site),
                Err(err) => {
                    self.skip(object.metadata.name.as_deref(), err);
                }
            }
        }
        let count = self.cache.replace_all(sites).await;
        self.counters.relists.fetch_add(1, Ordering::Relaxed);
        info!(sites = count, resource_version = list.resource_version(), "cluster cache relisted");
        count
    }

    /// Run until reconnection is exhausted. Never returns `Ok` on its own.
    pub async fn run(&self) -> Result<(), WatcherError> {
        let mut resume: Option<String> = None;
        let mut failures = 0usize;

        loop {
            match self.session(&mut resume, &mut failures).await {
                Ok(SessionEnd::Closed { events }) => {
                    debug!(events, "watch stream closed; resuming");
                    if events == 0 {
                        tokio::time::sleep(self.backoff.base_delay).await;
                    }
                }
                Ok(SessionEnd::Resync) => {
                    resume = None;
                }
                Err(err) => {
                    if matches!(err, WatchError::Gone) {
                        resume = None;
                    }
                    failures += 1;
                    if failures > self.backoff.max_retries {
                        let last_error = err.to_string();
                        error!(attempts = failures, error = %last_error, "cluster watch reconnection exhausted; serving stale cache");
                        self.publish(WatcherStatus::Failed {
                            error: last_error.clone(),
                        });
                        return Err(WatcherError::ReconnectExhausted {
                            attempts: failures,
                            last_error,
                        });
                    }
                    let delay = self.backoff.delay_for_attempt(failures - 1);
                    warn!(attempt = failures, ?delay, error = %err, "cluster watch failed; reconnecting");
                    self.publish(WatcherStatus::Reconnecting {
                        attempt: failures,
                        error: err.to_string(),
                    });
                    self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn session(
        &self,
        resume: &mut Option<String>,
        failures: &mut usize,
    ) -> Result<SessionEnd, WatchError> {
        let resource_version = match resume.clone() {
            Some(version) => version,
            None => {
                self.publish(WatcherStatus::Listing);
                let list = self.source.list().await?;
                let version = list.resource_version().to_string();
                self.resync(list).await;
                *failures = 0;
                *resume = Some(version.clone());
                version
            }
        };

        let mut stream = self.source.watch(&resource_version).await?;
        self.publish(WatcherStatus::Watching {
            resource_version: resource_version.clone(),
        });

        let mut events = 0usize;
        while let Some(item) = stream.next_event().await? {
            events += 1;
            *failures = 0;
            let event = match item {
                Ok(event) => event,
                Err(err) => {
                    self.skip(None, err);
                    continue;
                }
            };
            if let Some(version) = event.resource_version().filter(|v| !v.is_empty()) {
                *resume = Some(version.to_string());
            }
            if let EventOutcome::Resync(_) = self.apply_event(event).await {
                return Ok(SessionEnd::Resync);
            }
        }
        Ok(SessionEnd::Closed { events })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Mutex;
    use wpinv_sources::{decode_watch_line, ObjectMeta, SiteObject, WatchItem, WatchStream};

    use super::*;
    use crate::test_support::site_object;

    enum Step {
        List(SiteList),
        ListFails,
        Watch(Vec<WatchItem>),
        WatchFails,
    }

    /// Replays a fixed script of list/watch results, then fails forever.
    struct ScriptedSource {
        steps: Mutex<VecDeque<Step>>,
        watched_versions: Mutex<Vec<String>>,
    }

    impl ScriptedSource {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into()),
                watched_versions: Mutex::new(Vec::new()),
            })
        }
    }

    struct ScriptedStream(VecDeque<WatchItem>);

    #[async_trait]
    impl WatchStream for ScriptedStream {
        async fn next_event(&mut self) -> WatchItem {
            self.0.pop_front().unwrap_or(Ok(None))
        }
    }

    #[async_trait]
    impl WatchSource for ScriptedSource {
        async fn list(&self) -> Result<SiteList, WatchError> {
            match self.steps.lock().await.pop_front() {
                Some(Step::List(list)) => Ok(list),
                _ => Err(WatchError::Status {
                    status: 503,
                    url: "scripted".into(),
                }),
            }
        }

        async fn watch(&self, resource_version: &str) -> Result<Box<dyn WatchStream>, WatchError> {
            self.watched_versions
                .lock()
                .await
                .push(resource_version.to_string());
            match self.steps.lock().await.pop_front() {
                Some(Step::Watch(items)) => Ok(Box::new(ScriptedStream(items.into()))),
                Some(Step::WatchFails) | Some(Step::ListFails) | None => Err(WatchError::Status {
                    status: 503,
                    url: "scripted".into(),
                }),
                Some(Step::List(_)) => Err(WatchError::Gone),
            }
        }
    }

    fn fast_backoff(max_retries: usize) -> BackoffPolicy {
        BackoffPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    fn list_of(objects: Vec<SiteObject>, version: &str) -> SiteList {
        SiteList {
            metadata: ObjectMeta {
                resource_version: Some(version.into()),
                ..Default::default()
            },
            items: objects,
        }
    }

    fn idle_watcher() -> ResourceWatcher {
        ResourceWatcher::new(
            ScriptedSource::new(vec![]),
            ClusterCache::new(),
            CategoryCatalog::default(),
            fast_backoff(0),
        )
    }

    #[tokio::test]
    async fn repeated_added_event_is_idempotent() {
        let watcher = idle_watcher();
        let event = WatchEvent::Added(site_object("example.org", "/a", "A"));

        let first = watcher.apply_event(event.clone()).await;
        let once = watcher.reader().snapshot().await;
        for _ in 0..4 {
            watcher.apply_event(event.clone()).await;
        }
        assert_eq!(
            first,
            EventOutcome::Upserted {
                url: "https://example.org/a/".into(),
                changed: true
            }
        );
        assert_eq!(watcher.reader().snapshot().await, once);
        assert_eq!(
            watcher.apply_event(event).await,
            EventOutcome::Upserted {
                url: "https://example.org/a/".into(),
                changed: false
            }
        );
    }

    #[tokio::test]
    async fn modified_is_an_upsert_and_deleted_removes() {
        let watcher = idle_watcher();
        watcher
            .apply_event(WatchEvent::Added(site_object("example.org", "/a", "A")))
            .await;
        watcher
            .apply_event(WatchEvent::Modified(site_object("example.org", "/a", "A2")))
            .await;
        let fields = watcher.reader().get("https://example.org/a/").await.unwrap();
        assert_eq!(fields.title.as_deref(), Some("A2"));

        let outcome = watcher
            .apply_event(WatchEvent::Deleted(site_object("example.org", "/a", "A2")))
            .await;
        assert_eq!(
            outcome,
            EventOutcome::Removed {
                url: "https://example.org/a/".into(),
                existed: true
            }
        );
        assert!(watcher.reader().is_empty().await);
    }

    #[tokio::test]
    async fn malformed_events_are_skipped_and_counted() {
        let watcher = idle_watcher();
        let mut broken = site_object("example.org", "/a", "A");
        broken.spec.hostname = None;
        let outcome = watcher.apply_event(WatchEvent::Added(broken)).await;
        assert!(matches!(outcome, EventOutcome::Skipped(_)));
        assert_eq!(watcher.stats().skipped, 1);
        assert!(watcher.reader().is_empty().await);
    }

    #[tokio::test]
    async fn reconnects_resume_from_last_version_and_relist_on_expiry() {
        let expired = decode_watch_line(
            r#"{"type":"ERROR","object":{"code":410,"reason":"Expired"}}"#,
        )
        .unwrap();
        let mut added = site_object("example.org", "/b", "B");
        added.metadata.resource_version = Some("11".into());

        let source = ScriptedSource::new(vec![
            Step::List(list_of(vec![site_object("example.org", "/a", "A")], "10")),
            Step::Watch(vec![Ok(Some(Ok(WatchEvent::Added(added))))]),
            Step::WatchFails,
            Step::Watch(vec![Ok(Some(Ok(expired)))]),
            Step::List(list_of(vec![site_object("example.org", "/c", "C")], "20")),
            Step::ListFails,
        ]);
        let watcher = ResourceWatcher::new(
            source.clone(),
            ClusterCache::new(),
            CategoryCatalog::default(),
            fast_backoff(1),
        );

        let result = watcher.run().await;
        assert!(matches!(
            result,
            Err(WatcherError::ReconnectExhausted { attempts: 2, .. })
        ));
        assert_eq!(
            *source.watched_versions.lock().await,
            vec!["10", "11", "11", "20", "20"]
        );
        // The relist replaced the cache wholesale; the stale cache keeps serving.
        let urls = watcher.reader().snapshot().await.into_keys().collect::<Vec<_>>();
        assert_eq!(urls, vec!["https://example.org/c/"]);
        assert_eq!(watcher.stats().relists, 2);
        assert!(matches!(
            *watcher.status().borrow(),
            WatcherStatus::Failed { .. }
        ));
    }

    #[tokio::test]
    async fn exhaustion_after_only_failures() {
        let source = ScriptedSource::new(vec![Step::ListFails, Step::ListFails, Step::ListFails]);
        let watcher = ResourceWatcher::new(
            source,
            ClusterCache::new(),
            CategoryCatalog::default(),
            fast_backoff(2),
        );
        let result = watcher.run().await;
        assert!(matches!(
            result,
            Err(WatcherError::ReconnectExhausted { attempts: 3, .. })
        ));
        assert_eq!(watcher.stats().reconnects, 2);
    }
}
