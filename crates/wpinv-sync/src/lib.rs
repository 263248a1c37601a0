//! Reconciliation engine: cluster watcher, legacy mirror, merged view and tag index.

pub mod mirror;
pub mod tags;
pub mod view;
pub mod watcher;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use wpinv_core::{normalize_site_url, CategoryCatalog, KeyDeriver, TagRecord, DEFAULT_DOMAIN_SUFFIX};
use wpinv_sources::{
    FileDocumentLoader, HttpDocumentLoader, KubeConfig, KubeWatchSource, LegacySource,
    PollingLegacySource,
};
use wpinv_storage::{
    BackoffPolicy, HttpClientConfig, HttpFetcher, MemorySiteCollection, MemoryTagStore, PgStore,
    SiteCollection, TagStore,
};

pub use mirror::{MirrorOutcome, MirrorReport, RemovePolicy, StoreMirror};
pub use tags::{intersect_sorted, TagError, TagIndex};
pub use view::{merge_origins, SiteQuery, SiteQueryEngine, SiteView};
pub use watcher::{
    ClusterCache, ClusterCacheReader, EventOutcome, ResourceWatcher, WatcherError, WatcherStats,
    WatcherStatus,
};

pub const CRATE_NAME: &str = "wpinv-sync";

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

#[derive(Debug, Clone)]
pub struct KubeSettings {
    pub api_url: String,
    pub namespace: String,
    pub group: String,
    pub version: String,
    pub plural: String,
    pub token_file: PathBuf,
    pub ca_file: Option<PathBuf>,
    pub watch_timeout_secs: u64,
}

impl KubeSettings {
    /// Settings from `WPINV_KUBE_*`, falling back to the in-cluster service
    /// account. `None` when no API server is known.
    fn from_env() -> Option<Self> {
        let api_url = std::env::var("WPINV_KUBE_API").ok().or_else(|| {
            let host = std::env::var("KUBERNETES_SERVICE_HOST").ok()?;
            let port =
                std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
            Some(format!("https://{host}:{port}"))
        })?;
        let account = PathBuf::from(SERVICE_ACCOUNT_DIR);
        let ca_file = std::env::var("WPINV_KUBE_CA_FILE")
            .map(PathBuf::from)
            .ok()
            .or_else(|| Some(account.join("ca.crt")).filter(|p| p.exists()));
        Some(Self {
            api_url,
            namespace: env_or("WPINV_KUBE_NAMESPACE", "wordpress"),
            group: env_or("WPINV_CRD_GROUP", "wordpress.epfl.ch"),
            version: env_or("WPINV_CRD_VERSION", "v2"),
            plural: env_or("WPINV_CRD_PLURAL", "wordpresssites"),
            token_file: std::env::var("WPINV_KUBE_TOKEN_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| account.join("token")),
            ca_file,
            watch_timeout_secs: std::env::var("WPINV_KUBE_WATCH_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
        })
    }

    pub async fn connect(&self) -> Result<KubeWatchSource> {
        let token = match tokio::fs::read_to_string(&self.token_file).await {
            Ok(token) => Some(token.trim().to_string()),
            Err(err) => {
                warn!(path = %self.token_file.display(), error = %err, "no cluster token; connecting anonymously");
                None
            }
        };
        let ca_pem = match &self.ca_file {
            Some(path) => Some(
                tokio::fs::read(path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?,
            ),
            None => None,
        };
        KubeWatchSource::new(KubeConfig {
            api_url: self.api_url.clone(),
            namespace: self.namespace.clone(),
            group: self.group.clone(),
            version: self.version.clone(),
            plural: self.plural.clone(),
            token,
            ca_pem,
            connect_timeout: Duration::from_secs(10),
            watch_timeout_secs: self.watch_timeout_secs,
        })
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: Option<String>,
    pub data_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub kube: Option<KubeSettings>,
    pub legacy_source: Option<String>,
    pub legacy_poll_secs: u64,
    pub remove_policy: RemovePolicy,
    pub domain_suffixes: Vec<String>,
    pub max_reconnects: usize,
    pub resync_cron: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let remove_policy = std::env::var("WPINV_REMOVE_POLICY")
            .ok()
            .and_then(|v| match v.parse::<RemovePolicy>() {
                Ok(policy) => Some(policy),
                Err(err) => {
                    warn!(error = %err, "ignoring WPINV_REMOVE_POLICY");
                    None
                }
            })
            .unwrap_or_default();
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            data_dir: std::env::var("WPINV_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            workspace_root: std::env::var("WPINV_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            kube: KubeSettings::from_env(),
            legacy_source: std::env::var("WPINV_LEGACY_SOURCE").ok().filter(|v| !v.is_empty()),
            legacy_poll_secs: std::env::var("WPINV_LEGACY_POLL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            remove_policy,
            domain_suffixes: std::env::var("WPINV_DOMAIN_SUFFIXES")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(ToString::to_string)
                        .collect()
                })
                .unwrap_or_else(|_| vec![DEFAULT_DOMAIN_SUFFIX.to_string()]),
            max_reconnects: std::env::var("WPINV_MAX_RECONNECTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            resync_cron: std::env::var("WPINV_RESYNC_CRON").ok().filter(|v| !v.is_empty()),
            user_agent: env_or("WPINV_USER_AGENT", "wpinv/0.1"),
            http_timeout_secs: std::env::var("WPINV_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        }
    }

    pub fn key_deriver(&self) -> KeyDeriver {
        KeyDeriver::new(self.domain_suffixes.clone())
    }

    pub fn reconnect_backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.max_reconnects,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

pub async fn load_catalog(path: &Path) -> Result<CategoryCatalog> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => CategoryCatalog::from_yaml_str(&text)
            .with_context(|| format!("parsing {}", path.display())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "no category catalog; categories pass through");
            Ok(CategoryCatalog::default())
        }
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TagSeedFile {
    #[serde(default)]
    pub tags: Vec<TagRecord>,
}

pub async fn load_tag_seed(path: &Path) -> Result<Vec<TagRecord>> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => {
            let file: TagSeedFile = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(file.tags)
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SeedReport {
    pub inserted: usize,
    pub existing: usize,
    pub errors: Vec<String>,
}

/// Insert seed tags the store does not know yet. Member URLs are normalized
/// first; existing tags are never overwritten.
pub async fn seed_tags(store: &dyn TagStore, tags: Vec<TagRecord>) -> SeedReport {
    let mut report = SeedReport::default();
    for mut tag in tags {
        let mut sites = Vec::with_capacity(tag.sites.len());
        for raw in &tag.sites {
            match normalize_site_url(raw) {
                Ok(url) if !sites.contains(&url) => sites.push(url),
                Ok(_) => {}
                Err(err) => report.errors.push(format!("{}: {err}", tag.id)),
            }
        }
        tag.sites = sites;
        let id = tag.id.clone();
        match store.insert_tag_if_absent(tag).await {
            Ok(true) => report.inserted += 1,
            Ok(false) => report.existing += 1,
            Err(err) => report.errors.push(format!("{id}: {err}")),
        }
    }
    report
}

#[derive(Clone)]
pub struct Stores {
    pub sites: Arc<dyn SiteCollection>,
    pub tags: Arc<dyn TagStore>,
    pub backend: &'static str,
}

/// Postgres when `DATABASE_URL` is set, snapshot-backed memory stores otherwise.
pub async fn open_stores(config: &EngineConfig) -> Result<Stores> {
    if let Some(url) = &config.database_url {
        let store = Arc::new(PgStore::connect(url).await?);
        store.migrate().await?;
        return Ok(Stores {
            sites: store.clone(),
            tags: store,
            backend: "postgres",
        });
    }
    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("creating {}", config.data_dir.display()))?;
    let sites = MemorySiteCollection::open(config.data_dir.join("canonical_sites.json")).await?;
    let tags = MemoryTagStore::open(config.data_dir.join("tags.json")).await?;
    Ok(Stores {
        sites: Arc::new(sites),
        tags: Arc::new(tags),
        backend: "snapshot",
    })
}

pub fn legacy_source(config: &EngineConfig) -> Result<Option<Arc<dyn LegacySource>>> {
    let Some(location) = &config.legacy_source else {
        return Ok(None);
    };
    let interval = Duration::from_secs(config.legacy_poll_secs.max(1));
    let source: Arc<dyn LegacySource> =
        if location.starts_with("http://") || location.starts_with("https://") {
            let fetcher = HttpFetcher::new(HttpClientConfig {
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: Some(config.user_agent.clone()),
                ..Default::default()
            })?;
            Arc::new(PollingLegacySource::new(
                Arc::new(HttpDocumentLoader::new(fetcher, location.clone())),
                interval,
            ))
        } else {
            Arc::new(PollingLegacySource::new(
                Arc::new(FileDocumentLoader::new(location)),
                interval,
            ))
        };
    Ok(Some(source))
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineSummary {
    pub backend: &'static str,
    pub cluster_sites: usize,
    pub canonical_sites: usize,
    pub stale_sites: usize,
    pub tags: usize,
    pub watcher: WatcherStatus,
    pub stats: WatcherStats,
    pub remove_policy: RemovePolicy,
    pub legacy_feed: bool,
}

pub struct Engine {
    pub config: EngineConfig,
    pub stores: Stores,
    pub cluster: ClusterCacheReader,
    pub watcher: Option<Arc<ResourceWatcher>>,
    pub mirror: Arc<StoreMirror>,
    pub legacy: Option<Arc<dyn LegacySource>>,
    pub view: Arc<SiteQueryEngine>,
    pub tags: Arc<TagIndex>,
    status: watch::Receiver<WatcherStatus>,
}

impl Engine {
    pub async fn from_env() -> Result<Self> {
        Self::from_config(EngineConfig::from_env()).await
    }

    pub async fn from_config(config: EngineConfig) -> Result<Self> {
        let stores = open_stores(&config).await?;
        let catalog = load_catalog(&config.workspace_root.join("config/categories.yaml")).await?;
        let seed = load_tag_seed(&config.workspace_root.join("config/tags.yaml")).await?;
        let seeded = seed_tags(stores.tags.as_ref(), seed).await;
        if !seeded.errors.is_empty() {
            warn!(errors = ?seeded.errors, "some seed tags were not stored");
        }
        info!(backend = stores.backend, inserted = seeded.inserted, existing = seeded.existing, "stores ready");

        let cache = ClusterCache::new();
        let watcher = match &config.kube {
            Some(kube) => {
                let source = kube.connect().await?;
                Some(Arc::new(ResourceWatcher::new(
                    Arc::new(source),
                    Arc::clone(&cache),
                    catalog.clone(),
                    config.reconnect_backoff(),
                )))
            }
            None => {
                warn!("no cluster api configured; cluster origin stays empty");
                None
            }
        };
        let status = match &watcher {
            Some(watcher) => watcher.status(),
            None => watch::channel(WatcherStatus::Disabled).1,
        };

        let mirror = Arc::new(StoreMirror::new(
            Arc::clone(&stores.sites),
            config.remove_policy,
        ));
        let legacy = legacy_source(&config)?;
        let view = Arc::new(SiteQueryEngine::new(
            cache.reader(),
            Arc::clone(&stores.sites),
            Arc::clone(&stores.tags),
            catalog,
            config.key_deriver(),
        ));
        let tags = Arc::new(TagIndex::new(Arc::clone(&view)));

        Ok(Self {
            config,
            stores,
            cluster: cache.reader(),
            watcher,
            mirror,
            legacy,
            view,
            tags,
            status,
        })
    }

    pub fn watcher_status(&self) -> WatcherStatus {
        self.status.borrow().clone()
    }

    pub fn watcher_stats(&self) -> WatcherStats {
        self.watcher
            .as_ref()
            .map(|watcher| watcher.stats())
            .unwrap_or_default()
    }

    pub async fn summary(&self) -> Result<EngineSummary> {
        let canonical = self.stores.sites.list().await?;
        Ok(EngineSummary {
            backend: self.stores.backend,
            cluster_sites: self.cluster.len().await,
            canonical_sites: canonical.len(),
            stale_sites: canonical.iter().filter(|site| site.stale).count(),
            tags: self.stores.tags.list_tags().await?.len(),
            watcher: self.watcher_status(),
            stats: self.watcher_stats(),
            remove_policy: self.config.remove_policy,
            legacy_feed: self.legacy.is_some(),
        })
    }

    /// Start the watcher and the mirror as background tasks.
    pub fn spawn(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        if let Some(watcher) = &self.watcher {
            let watcher = Arc::clone(watcher);
            handles.push(tokio::spawn(async move {
                if let Err(err) = watcher.run().await {
                    error!(error = %err, "cluster watcher stopped");
                }
            }));
        }
        if let Some(legacy) = &self.legacy {
            let legacy = Arc::clone(legacy);
            let mirror = Arc::clone(&self.mirror);
            handles.push(tokio::spawn(async move {
                match mirror.run(legacy.as_ref()).await {
                    Ok(report) => info!(errors = report.errors.len(), "legacy mirror finished"),
                    Err(err) => error!(error = %err, "legacy mirror stopped"),
                }
            }));
        }
        handles
    }

    /// Cron job re-running the full mirror sync, when `WPINV_RESYNC_CRON` is set.
    pub async fn maybe_build_scheduler(&self) -> Result<Option<JobScheduler>> {
        let (Some(cron), Some(legacy)) = (&self.config.resync_cron, &self.legacy) else {
            return Ok(None);
        };

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let mirror = Arc::clone(&self.mirror);
        let legacy = Arc::clone(legacy);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let mirror = Arc::clone(&mirror);
            let legacy = Arc::clone(&legacy);
            Box::pin(async move {
                match mirror.sync_once(legacy.as_ref()).await {
                    Ok(report) => info!(
                        inserted = report.inserted,
                        updated = report.updated,
                        removed = report.removed,
                        errors = report.errors.len(),
                        "scheduled resync finished"
                    ),
                    Err(err) => warn!(error = %err, "scheduled resync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

/// One full mirror pass from the configured legacy source.
pub async fn run_mirror_once_from_env() -> Result<MirrorReport> {
    let config = EngineConfig::from_env();
    let legacy = legacy_source(&config)?.context("WPINV_LEGACY_SOURCE is not set")?;
    let stores = open_stores(&config).await?;
    let mirror = StoreMirror::new(stores.sites, config.remove_policy);
    mirror.sync_once(legacy.as_ref()).await
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use wpinv_core::{CategoryCatalog, KeyDeriver, TagRecord, TagType};
    use wpinv_sources::{
        ObjectMeta, SiteList, SiteObject, SiteSpec, WatchError, WatchSource, WatchStream,
        WordpressSpec,
    };
    use wpinv_storage::{BackoffPolicy, MemorySiteCollection, MemoryTagStore};

    use crate::{ClusterCache, ResourceWatcher, SiteQueryEngine, TagIndex};

    pub fn site_object(host: &str, path: &str, title: &str) -> SiteObject {
        SiteObject {
            metadata: ObjectMeta {
                name: Some(format!("{host}{path}").replace(['/', '.'], "-")),
                namespace: Some("wordpress".into()),
                resource_version: Some("1".into()),
            },
            spec: SiteSpec {
                hostname: Some(host.into()),
                path: Some(path.into()),
                wordpress: WordpressSpec {
                    title: Some(title.into()),
                    ..Default::default()
                },
                ..Default::default()
            },
        }
    }

    pub fn tag(id: &str, tag_type: TagType, name: &str, sites: &[&str]) -> TagRecord {
        TagRecord {
            id: id.into(),
            name_fr: name.into(),
            name_en: name.into(),
            url_fr: String::new(),
            url_en: String::new(),
            tag_type,
            sites: sites.iter().map(|s| s.to_string()).collect(),
        }
    }

    struct NoCluster;

    #[async_trait::async_trait]
    impl WatchSource for NoCluster {
        async fn list(&self) -> Result<SiteList, WatchError> {
            Err(WatchError::Gone)
        }

        async fn watch(&self, _resource_version: &str) -> Result<Box<dyn WatchStream>, WatchError> {
            Err(WatchError::Gone)
        }
    }

    pub struct Harness {
        pub watcher: ResourceWatcher,
        pub sites: Arc<MemorySiteCollection>,
        pub tags: Arc<MemoryTagStore>,
        pub engine: Arc<SiteQueryEngine>,
        pub index: TagIndex,
    }

    /// Memory stores plus a watcher whose events are applied by hand.
    pub async fn engine_with(tags: Vec<TagRecord>) -> Harness {
        let cache = ClusterCache::new();
        let watcher = ResourceWatcher::new(
            Arc::new(NoCluster),
            Arc::clone(&cache),
            CategoryCatalog::default(),
            BackoffPolicy::default(),
        );
        let sites = Arc::new(MemorySiteCollection::new());
        let tag_store = Arc::new(MemoryTagStore::with_tags(tags));
        let engine = Arc::new(SiteQueryEngine::new(
            cache.reader(),
            sites.clone(),
            tag_store.clone(),
            CategoryCatalog::default(),
            KeyDeriver::default(),
        ));
        let index = TagIndex::new(Arc::clone(&engine));
        Harness {
            watcher,
            sites,
            tags: tag_store,
            engine,
            index,
        }
    }
}
