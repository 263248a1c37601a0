//! Merged read model over the cluster cache and the canonical collection.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;
use wpinv_core::{
    normalize_site_url, site_id_for_url, CategoryCatalog, KeyDeriver, ObjectNameRegistry, Origin,
    SiteFields, TagRecord,
};
use wpinv_storage::{SiteCollection, StoreError, TagStore};

use crate::tags::{members_for_names, tagged_urls};
use crate::watcher::ClusterCacheReader;

/// Merge one site's records. Canonical fields win where present; tag-like
/// keys never survive from either side.
pub fn merge_origins(
    cluster: Option<&SiteFields>,
    canonical: Option<&SiteFields>,
) -> Option<SiteFields> {
    let mut merged = match (cluster, canonical) {
        (None, None) => return None,
        (Some(cluster), None) => cluster.clone(),
        (None, Some(canonical)) => canonical.clone(),
        (Some(cluster), Some(canonical)) => {
            let mut merged = cluster.clone();
            merged.strip_tag_fields();
            merged.overlay(canonical);
            merged
        }
    };
    merged.strip_tag_fields();
    Some(merged)
}

/// Keys the view writes itself; document fields of the same name are dropped.
const VIEW_KEYS: [&str; 7] = [
    "id",
    "url",
    "origins",
    "tags",
    "stale",
    "objectName",
    "inventoryHost",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteView {
    pub id: Uuid,
    pub url: String,
    #[serde(flatten)]
    pub fields: SiteFields,
    pub origins: Vec<Origin>,
    pub tags: Vec<TagRecord>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stale: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inventory_host: Option<String>,
}

impl SiteView {
    fn hidden(&self) -> bool {
        self.stale || self.fields.is_soft_deleted()
    }

    fn matches_text(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        let hit = |value: Option<&str>| value.is_some_and(|v| v.to_lowercase().contains(&needle));
        hit(Some(self.url.as_str()))
            || hit(self.fields.title.as_deref())
            || hit(self.fields.tagline.as_deref())
            || self
                .tags
                .iter()
                .any(|tag| hit(Some(tag.name_en.as_str())) || hit(Some(tag.name_fr.as_str())))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SiteQuery {
    /// Exact match on the canonical URL.
    #[serde(default)]
    pub url: Option<String>,
    /// Case-insensitive substring match on the URL.
    #[serde(default)]
    pub search_url: Option<String>,
    /// Sites carrying every one of these tag names.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Restrict to sites with at least one tag.
    #[serde(default)]
    pub tagged: bool,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub include_deleted: bool,
    #[serde(default)]
    pub object_names: bool,
}

struct Candidate {
    cluster: Option<SiteFields>,
    canonical: Option<SiteFields>,
    stale: bool,
}

pub struct SiteQueryEngine {
    cluster: ClusterCacheReader,
    sites: Arc<dyn SiteCollection>,
    tags: Arc<dyn TagStore>,
    catalog: CategoryCatalog,
    keys: KeyDeriver,
}

impl SiteQueryEngine {
    pub fn new(
        cluster: ClusterCacheReader,
        sites: Arc<dyn SiteCollection>,
        tags: Arc<dyn TagStore>,
        catalog: CategoryCatalog,
        keys: KeyDeriver,
    ) -> Self {
        Self {
            cluster,
            sites,
            tags,
            catalog,
            keys,
        }
    }

    pub fn tag_store(&self) -> Arc<dyn TagStore> {
        Arc::clone(&self.tags)
    }

    pub fn key_deriver(&self) -> &KeyDeriver {
        &self.keys
    }

    /// Both origins keyed by URL. Each side is read under its own lock, so a
    /// site moving between origins mid-query may show up from one side only.
    async fn candidates(&self) -> Result<BTreeMap<String, Candidate>, StoreError> {
        let mut out: BTreeMap<String, Candidate> = self
            .cluster
            .snapshot()
            .await
            .into_iter()
            .map(|(url, fields)| {
                let candidate = Candidate {
                    cluster: Some(fields),
                    canonical: None,
                    stale: false,
                };
                (url, candidate)
            })
            .collect();
        for record in self.sites.list().await? {
            let entry = out.entry(record.url).or_insert(Candidate {
                cluster: None,
                canonical: None,
                stale: false,
            });
            entry.canonical = Some(record.fields);
            entry.stale = record.stale;
        }
        Ok(out)
    }

    /// A stale canonical record only contributes while the cluster no longer
    /// announces the URL.
    fn render(&self, url: &str, candidate: &Candidate, all_tags: &[TagRecord]) -> Option<SiteView> {
        let live_in_cluster = candidate.cluster.is_some();
        let canonical = candidate
            .canonical
            .as_ref()
            .filter(|_| !(candidate.stale && live_in_cluster));
        let mut fields = merge_origins(candidate.cluster.as_ref(), canonical)?;
        fields.extra.retain(|key, _| !VIEW_KEYS.contains(&key.as_str()));
        if let Some(categories) = fields.categories.take() {
            fields.categories = Some(
                categories
                    .iter()
                    .map(|reference| self.catalog.display_name(reference))
                    .collect(),
            );
        }
        let mut origins = Vec::with_capacity(2);
        if live_in_cluster {
            origins.push(Origin::Cluster);
        }
        if canonical.is_some() {
            origins.push(Origin::Canonical);
        }
        Some(SiteView {
            id: site_id_for_url(url),
            url: url.to_string(),
            fields,
            origins,
            tags: tags_of(all_tags, url),
            stale: candidate.stale && !live_in_cluster,
            object_name: None,
            inventory_host: self.keys.inventory_host(url).ok(),
        })
    }

    /// Object names for every known URL, in URL order. A URL whose name is
    /// already owned by another URL gets none.
    fn object_names<'a>(&self, urls: impl Iterator<Item = &'a String>) -> HashMap<String, String> {
        let mut registry = ObjectNameRegistry::new(self.keys.clone());
        let mut names = HashMap::new();
        for url in urls {
            match registry.claim(url) {
                Ok(name) => {
                    names.insert(url.clone(), name);
                }
                Err(err) => warn!(%url, error = %err, "object name withheld"),
            }
        }
        names
    }

    pub async fn list_sites(&self, query: &SiteQuery) -> Result<Vec<SiteView>, StoreError> {
        let all_tags = self.tags.list_tags().await?;
        let tag_filter: Option<BTreeSet<String>> = if !query.tags.is_empty() {
            Some(members_for_names(&all_tags, &query.tags).into_iter().collect())
        } else if query.tagged {
            Some(tagged_urls(&all_tags).into_iter().collect())
        } else {
            None
        };
        let exact = query
            .url
            .as_deref()
            .map(|raw| normalize_site_url(raw).unwrap_or_else(|_| raw.to_string()));
        let fragment = query.search_url.as_deref().map(str::to_lowercase);

        let candidates = self.candidates().await?;
        let names = if query.object_names {
            self.object_names(candidates.keys())
        } else {
            HashMap::new()
        };

        let mut out = Vec::new();
        for (url, candidate) in &candidates {
            if tag_filter.as_ref().is_some_and(|set| !set.contains(url)) {
                continue;
            }
            if exact.as_ref().is_some_and(|wanted| wanted != url) {
                continue;
            }
            if fragment
                .as_ref()
                .is_some_and(|needle| !url.to_lowercase().contains(needle))
            {
                continue;
            }
            let Some(mut view) = self.render(url, candidate, &all_tags) else {
                continue;
            };
            if view.hidden() && !query.include_deleted {
                continue;
            }
            if query.text.as_deref().is_some_and(|text| !view.matches_text(text)) {
                continue;
            }
            view.object_name = names.get(url).cloned();
            out.push(view);
        }
        Ok(out)
    }

    /// Resolve an id to its canonical URL among currently known sites.
    pub async fn url_for_id(&self, id: Uuid) -> Result<Option<String>, StoreError> {
        Ok(self
            .candidates()
            .await?
            .into_keys()
            .find(|url| site_id_for_url(url) == id))
    }

    /// Fetch by id, soft-deleted sites included.
    pub async fn get_site(&self, id: Uuid) -> Result<Option<SiteView>, StoreError> {
        let all_tags = self.tags.list_tags().await?;
        let candidates = self.candidates().await?;
        let Some((url, candidate)) = candidates
            .iter()
            .find(|(url, _)| site_id_for_url(url) == id)
        else {
            return Ok(None);
        };
        let Some(mut view) = self.render(url, candidate, &all_tags) else {
            return Ok(None);
        };
        view.object_name = self.object_names(candidates.keys()).remove(url);
        Ok(Some(view))
    }

    pub async fn tags_for_site(&self, id: Uuid) -> Result<Option<Vec<TagRecord>>, StoreError> {
        let Some(url) = self.url_for_id(id).await? else {
            return Ok(None);
        };
        let all_tags = self.tags.list_tags().await?;
        Ok(Some(tags_of(&all_tags, &url)))
    }
}

/// Tags carrying `url`, membership lists dropped, ordered by type then name.
fn tags_of(all_tags: &[TagRecord], url: &str) -> Vec<TagRecord> {
    let mut seen = BTreeSet::new();
    let mut tags: Vec<TagRecord> = all_tags
        .iter()
        .filter(|tag| tag.has_member(url) && seen.insert(tag.id.clone()))
        .map(TagRecord::without_members)
        .collect();
    tags.sort_by(|a, b| {
        a.tag_type
            .cmp(&b.tag_type)
            .then_with(|| a.name_en.cmp(&b.name_en))
            .then_with(|| a.id.cmp(&b.id))
    });
    tags
}
