use std::sync::Arc;

use thiserror::Error;
use tracing::info;
use wpinv_core::{normalize_site_url, TagRecord};
use wpinv_storage::{MembershipChange, StoreError, TagStore};

use crate::view::{SiteQuery, SiteQueryEngine, SiteView};

#[derive(Debug, Error)]
pub enum TagError {
    #[error("tag {0} not found")]
    TagNotFound(String),
    #[error("site {url} already carries tag {tag_id}")]
    AlreadyMember { tag_id: String, url: String },
    #[error("site {url} does not carry tag {tag_id}")]
    NotMember { tag_id: String, url: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Intersection of ascending, duplicate-free lists, ascending.
pub fn intersect_sorted(lists: &[Vec<String>]) -> Vec<String> {
    let Some((first, rest)) = lists.split_first() else {
        return Vec::new();
    };
    let mut acc = first.clone();
    for list in rest {
        let mut next = Vec::with_capacity(acc.len().min(list.len()));
        let (mut i, mut j) = (0, 0);
        while i < acc.len() && j < list.len() {
            match acc[i].cmp(&list[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    next.push(acc[i].clone());
                    i += 1;
                    j += 1;
                }
            }
        }
        acc = next;
        if acc.is_empty() {
            break;
        }
    }
    acc
}

/// Member URLs of one name: the union over every tag answering to it.
fn members_for_name(tags: &[TagRecord], name: &str) -> Vec<String> {
    let mut urls: Vec<String> = tags
        .iter()
        .filter(|tag| tag.matches_name(name))
        .flat_map(|tag| tag.sites.iter().cloned())
        .collect();
    urls.sort();
    urls.dedup();
    urls
}

/// URLs carrying every name. An unknown name yields nothing.
pub fn members_for_names(tags: &[TagRecord], names: &[String]) -> Vec<String> {
    let lists = names
        .iter()
        .map(|name| members_for_name(tags, name))
        .collect::<Vec<_>>();
    intersect_sorted(&lists)
}

pub fn tagged_urls(tags: &[TagRecord]) -> Vec<String> {
    let mut urls: Vec<String> = tags.iter().flat_map(|tag| tag.sites.iter().cloned()).collect();
    urls.sort();
    urls.dedup();
    urls
}

/// Tag membership mutations plus tag-driven searches over the merged view.
pub struct TagIndex {
    store: Arc<dyn TagStore>,
    view: Arc<SiteQueryEngine>,
}

impl TagIndex {
    pub fn new(view: Arc<SiteQueryEngine>) -> Self {
        Self {
            store: view.tag_store(),
            view,
        }
    }

    pub async fn list_tags(&self) -> Result<Vec<TagRecord>, TagError> {
        Ok(self.store.list_tags().await?)
    }

    pub async fn associate(&self, tag_id: &str, site_url: &str) -> Result<(), TagError> {
        let url = canonical(site_url);
        match self.store.add_member(tag_id, &url).await? {
            MembershipChange::Applied => {
                info!(tag = tag_id, %url, "site tagged");
                Ok(())
            }
            MembershipChange::AlreadyMember => Err(TagError::AlreadyMember {
                tag_id: tag_id.to_string(),
                url,
            }),
            MembershipChange::TagMissing => Err(TagError::TagNotFound(tag_id.to_string())),
            MembershipChange::NotMember => Err(TagError::NotMember {
                tag_id: tag_id.to_string(),
                url,
            }),
        }
    }

    pub async fn dissociate(&self, tag_id: &str, site_url: &str) -> Result<(), TagError> {
        let url = canonical(site_url);
        match self.store.remove_member(tag_id, &url).await? {
            MembershipChange::Applied => {
                info!(tag = tag_id, %url, "site untagged");
                Ok(())
            }
            MembershipChange::NotMember => Err(TagError::NotMember {
                tag_id: tag_id.to_string(),
                url,
            }),
            MembershipChange::TagMissing => Err(TagError::TagNotFound(tag_id.to_string())),
            MembershipChange::AlreadyMember => Err(TagError::AlreadyMember {
                tag_id: tag_id.to_string(),
                url,
            }),
        }
    }

    /// Sites carrying every named tag, ordered by URL. No names at all means
    /// any tagged site.
    pub async fn search_by_tags(&self, names: &[String]) -> Result<Vec<SiteView>, TagError> {
        Ok(self
            .view
            .list_sites(&SiteQuery {
                tags: names.to_vec(),
                tagged: true,
                ..Default::default()
            })
            .await?)
    }

    /// Sites carrying at least one tag.
    pub async fn search_any(&self) -> Result<Vec<SiteView>, TagError> {
        Ok(self
            .view
            .list_sites(&SiteQuery {
                tagged: true,
                ..Default::default()
            })
            .await?)
    }

    /// Free-text search over tagged sites, optionally narrowed by tag names.
    pub async fn tagged_search(
        &self,
        text: &str,
        names: &[String],
    ) -> Result<Vec<SiteView>, TagError> {
        Ok(self
            .view
            .list_sites(&SiteQuery {
                tags: names.to_vec(),
                tagged: true,
                text: Some(text.to_string()),
                ..Default::default()
            })
            .await?)
    }
}

fn canonical(url: &str) -> String {
    normalize_site_url(url).unwrap_or_else(|_| url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{engine_with, site_object, tag};
    use wpinv_core::TagType;
    use wpinv_sources::WatchEvent;

    fn urls(views: &[SiteView]) -> Vec<&str> {
        views.iter().map(|v| v.url.as_str()).collect()
    }

    #[test]
    fn intersection_keeps_common_members_in_order() {
        let lists = vec![
            vec!["a".to_string(), "b".to_string()],
            vec!["b".to_string(), "c".to_string()],
        ];
        assert_eq!(intersect_sorted(&lists), vec!["b".to_string()]);
        assert!(intersect_sorted(&[]).is_empty());
    }

    #[test]
    fn same_named_tags_union_their_members() {
        let tags = vec![
            tag("t1", TagType::Faculty, "ENAC", &["https://x/1/"]),
            tag("t2", TagType::Institute, "enac", &["https://x/2/"]),
            tag("t3", TagType::Institute, "IIC", &["https://x/2/"]),
        ];
        assert_eq!(
            members_for_names(&tags, &["ENAC".into()]),
            vec!["https://x/1/", "https://x/2/"]
        );
        assert_eq!(
            members_for_names(&tags, &["enac".into(), "iic".into()]),
            vec!["https://x/2/"]
        );
        assert!(members_for_names(&tags, &["nope".into()]).is_empty());
    }

    #[tokio::test]
    async fn search_intersects_over_the_merged_view() {
        let harness = engine_with(vec![
            tag(
                "ta",
                TagType::Faculty,
                "A",
                &["https://example.org/a/", "https://example.org/b/"],
            ),
            tag(
                "tb",
                TagType::Institute,
                "B",
                &["https://example.org/b/", "https://example.org/c/"],
            ),
        ])
        .await;
        for path in ["/a", "/b", "/c", "/d"] {
            harness
                .watcher
                .apply_event(WatchEvent::Added(site_object("example.org", path, "T")))
                .await;
        }

        let both = harness
            .index
            .search_by_tags(&["A".into(), "B".into()])
            .await
            .unwrap();
        assert_eq!(urls(&both), vec!["https://example.org/b/"]);

        let any = harness.index.search_any().await.unwrap();
        assert_eq!(
            urls(&any),
            vec![
                "https://example.org/a/",
                "https://example.org/b/",
                "https://example.org/c/"
            ]
        );

        let unknown = harness.index.search_by_tags(&["Z".into()]).await.unwrap();
        assert!(unknown.is_empty());

        let unfiltered = harness.index.search_by_tags(&[]).await.unwrap();
        assert_eq!(urls(&unfiltered), urls(&any));
        assert!(!urls(&unfiltered).contains(&"https://example.org/d/"));
    }

    #[tokio::test]
    async fn tagged_search_matches_text_on_tag_names() {
        let harness = engine_with(vec![tag(
            "ta",
            TagType::Faculty,
            "Architecture",
            &["https://example.org/a/"],
        )])
        .await;
        for path in ["/a", "/b"] {
            harness
                .watcher
                .apply_event(WatchEvent::Added(site_object("example.org", path, "T")))
                .await;
        }
        let hits = harness.index.tagged_search("archi", &[]).await.unwrap();
        assert_eq!(urls(&hits), vec!["https://example.org/a/"]);
    }

    #[tokio::test]
    async fn duplicate_association_is_a_conflict() {
        let harness = engine_with(vec![tag("ta", TagType::Faculty, "A", &[])]).await;
        harness
            .index
            .associate("ta", "https://example.org/a")
            .await
            .unwrap();
        let again = harness.index.associate("ta", "https://example.org/a/").await;
        assert!(matches!(again, Err(TagError::AlreadyMember { .. })));

        let stored = harness.tags.get_tag("ta").await.unwrap().unwrap();
        assert_eq!(stored.sites, vec!["https://example.org/a/"]);

        let missing = harness.index.associate("zz", "https://example.org/a/").await;
        assert!(matches!(missing, Err(TagError::TagNotFound(_))));

        harness
            .index
            .dissociate("ta", "https://example.org/a/")
            .await
            .unwrap();
        let gone = harness.index.dissociate("ta", "https://example.org/a/").await;
        assert!(matches!(gone, Err(TagError::NotMember { .. })));
    }
}
