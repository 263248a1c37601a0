// Replays fixtures/watch through the resource watcher.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use wpinv_core::CategoryCatalog;
use wpinv_sources::{decode_watch_line, SiteList, WatchError, WatchItem, WatchSource, WatchStream};
use wpinv_storage::BackoffPolicy;
use wpinv_sync::{ClusterCache, ResourceWatcher, WatcherError};

fn root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

/// Lists once from the fixture, streams the recorded events once, then
/// refuses every further call.
struct FixtureSource {
    list: Mutex<Option<SiteList>>,
    events: Mutex<Option<Vec<String>>>,
}

struct Lines(VecDeque<String>);

#[async_trait]
impl WatchStream for Lines {
    async fn next_event(&mut self) -> WatchItem {
        Ok(self.0.pop_front().map(|line| decode_watch_line(&line)))
    }
}

#[async_trait]
impl WatchSource for FixtureSource {
    async fn list(&self) -> Result<SiteList, WatchError> {
        self.list.lock().await.take().ok_or(WatchError::Status {
            status: 503,
            url: "fixture".into(),
        })
    }

    async fn watch(&self, resource_version: &str) -> Result<Box<dyn WatchStream>, WatchError> {
        assert_eq!(resource_version, "1200");
        let lines = self.events.lock().await.take().ok_or(WatchError::Gone)?;
        Ok(Box::new(Lines(lines.into())))
    }
}

#[tokio::test]
async fn recorded_watch_session_updates_the_cache() {
    let list: SiteList = serde_json::from_str(
        &std::fs::read_to_string(root().join("fixtures/watch/list.json")).unwrap(),
    )
    .unwrap();
    let events = std::fs::read_to_string(root().join("fixtures/watch/events.jsonl"))
        .unwrap()
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(ToString::to_string)
        .collect::<Vec<_>>();
    let catalog = CategoryCatalog::from_yaml_str(
        &std::fs::read_to_string(root().join("config/categories.yaml")).unwrap(),
    )
    .unwrap();

    let source = Arc::new(FixtureSource {
        list: Mutex::new(Some(list)),
        events: Mutex::new(Some(events)),
    });
    let watcher = ResourceWatcher::new(
        source,
        ClusterCache::new(),
        catalog,
        BackoffPolicy {
            max_retries: 0,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        },
    );

    // The trailing 410 forces a relist, which the fixture refuses.
    let result = watcher.run().await;
    assert!(matches!(
        result,
        Err(WatcherError::ReconnectExhausted { attempts: 1, .. })
    ));

    let cache = watcher.reader().snapshot().await;
    assert_eq!(
        cache.keys().collect::<Vec<_>>(),
        vec!["https://example.org/services/demo/"]
    );
    let demo = &cache["https://example.org/services/demo/"];
    assert_eq!(demo.title.as_deref(), Some("Test"));
    assert_eq!(demo.tagline.as_deref(), Some("Demo services"));
    assert_eq!(demo.unit_id.as_deref(), Some("10001"));

    let stats = watcher.stats();
    assert_eq!(stats.applied, 2);
    assert_eq!(stats.removed, 1);
    assert_eq!(stats.skipped, 2);
    assert_eq!(stats.relists, 1);
}
