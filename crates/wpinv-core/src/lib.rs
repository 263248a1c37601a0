//! Core domain model for the managed site inventory: site/tag records, canonical
//! URLs and the object-name key deriver.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "wpinv-core";

/// Length bound imposed on object names by the orchestration platform.
pub const OBJECT_NAME_LIMIT: usize = 50;

pub const DEFAULT_DOMAIN_SUFFIX: &str = ".epfl.ch";

/// Document keys that carry embedded tag data. Tags are only ever resolved
/// through tag membership, so these keys never survive into a site record.
pub const TAG_LIKE_KEYS: [&str; 3] = ["tags", "tagIds", "tag_ids"];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("invalid site url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("site url {0} has no hostname")]
    MissingHost(String),
    #[error("object name {name} derived from {requested} collides with {existing}")]
    Collision {
        name: String,
        existing: String,
        requested: String,
    },
}

/// Canonicalize a site URL: absolute http(s), lowercase host, no query or
/// fragment, trailing slash always present.
pub fn normalize_site_url(raw: &str) -> Result<String, KeyError> {
    let mut parsed = Url::parse(raw.trim()).map_err(|err| KeyError::InvalidUrl {
        url: raw.to_string(),
        reason: err.to_string(),
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(KeyError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme {}", parsed.scheme()),
        });
    }
    if parsed.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(KeyError::MissingHost(raw.to_string()));
    }
    parsed.set_query(None);
    parsed.set_fragment(None);
    if !parsed.path().ends_with('/') {
        let path = format!("{}/", parsed.path());
        parsed.set_path(&path);
    }
    Ok(parsed.to_string())
}

/// Stable site id, identical whichever origin reports the URL.
pub fn site_id_for_url(canonical_url: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, canonical_url.as_bytes())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Cluster,
    Canonical,
}

/// One origin's contribution to a site. Every attribute is optional so the
/// merge can tell "absent" from "set".
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tagline: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub languages: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub categories: Option<Vec<String>>,
    #[serde(
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub unit_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_deleted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k8s_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

impl SiteFields {
    /// Copy every attribute present on `other` over `self`.
    pub fn overlay(&mut self, other: &SiteFields) {
        overlay_field(&mut self.title, &other.title);
        overlay_field(&mut self.tagline, &other.tagline);
        overlay_field(&mut self.theme, &other.theme);
        overlay_field(&mut self.languages, &other.languages);
        overlay_field(&mut self.categories, &other.categories);
        overlay_field(&mut self.unit_id, &other.unit_id);
        overlay_field(&mut self.platform, &other.platform);
        overlay_field(&mut self.created_at, &other.created_at);
        overlay_field(&mut self.is_deleted, &other.is_deleted);
        overlay_field(&mut self.k8s_name, &other.k8s_name);
        overlay_field(&mut self.comment, &other.comment);
        for (key, value) in &other.extra {
            self.extra.insert(key.clone(), value.clone());
        }
    }

    pub fn strip_tag_fields(&mut self) {
        for key in TAG_LIKE_KEYS {
            self.extra.remove(key);
        }
    }

    pub fn is_soft_deleted(&self) -> bool {
        self.is_deleted.unwrap_or(false)
    }
}

fn overlay_field<T: Clone>(target: &mut Option<T>, source: &Option<T>) {
    if let Some(value) = source {
        *target = Some(value.clone());
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(match value {
        Some(JsonValue::String(s)) => Some(s),
        Some(JsonValue::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Deduplicate language codes keeping first-seen order.
pub fn ordered_languages<I, S>(codes: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for code in codes {
        let code = code.as_ref().trim();
        if !code.is_empty() && !out.iter().any(|c| c == code) {
            out.push(code.to_string());
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TagType {
    Faculty,
    Institute,
    FieldOfResearch,
    DoctoralProgram,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagRecord {
    pub id: String,
    pub name_fr: String,
    pub name_en: String,
    #[serde(default)]
    pub url_fr: String,
    #[serde(default)]
    pub url_en: String,
    #[serde(rename = "type")]
    pub tag_type: TagType,
    /// Member site URLs, the only record of tag-site association.
    #[serde(default)]
    pub sites: Vec<String>,
}

impl TagRecord {
    pub fn matches_name(&self, name: &str) -> bool {
        let name = name.trim();
        self.name_fr.eq_ignore_ascii_case(name) || self.name_en.eq_ignore_ascii_case(name)
    }

    pub fn has_member(&self, url: &str) -> bool {
        self.sites.iter().any(|s| s == url)
    }

    /// Copy of the tag without its membership list, for embedding in results.
    pub fn without_members(&self) -> TagRecord {
        TagRecord {
            sites: Vec::new(),
            ..self.clone()
        }
    }
}

/// Derives object names for the orchestration platform from site URLs.
#[derive(Debug, Clone)]
pub struct KeyDeriver {
    domain_suffixes: Vec<String>,
    limit: usize,
}

impl Default for KeyDeriver {
    fn default() -> Self {
        Self::new(vec![DEFAULT_DOMAIN_SUFFIX.to_string()])
    }
}

impl KeyDeriver {
    pub fn new(domain_suffixes: Vec<String>) -> Self {
        Self {
            domain_suffixes,
            limit: OBJECT_NAME_LIMIT,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(2);
        self
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn object_name(&self, url: &str) -> Result<String, KeyError> {
        let (host, path) = host_and_path(url)?;
        let host = self
            .domain_suffixes
            .iter()
            .find_map(|suffix| host.strip_suffix(suffix.as_str()))
            .unwrap_or(&host);
        let joined = format!("{host}{path}");
        let joined = joined.strip_suffix('/').unwrap_or(&joined);
        Ok(self.abbreviate(joined.replace('/', "-")))
    }

    /// Name for the downstream inventory consumer: full host and path with
    /// every non-alphanumeric character mapped to `_`.
    pub fn inventory_host(&self, url: &str) -> Result<String, KeyError> {
        let (host, path) = host_and_path(url)?;
        let host = underscore_non_alphanumeric(&host);
        let path = underscore_non_alphanumeric(path.trim_matches('/'));
        if path.is_empty() {
            Ok(host)
        } else {
            Ok(format!("{host}__{path}"))
        }
    }

    fn abbreviate(&self, name: String) -> String {
        if name.len() < self.limit {
            return name;
        }
        let segments = name.split('-').collect::<Vec<_>>();
        for count in 1..=segments.len() {
            let candidate = segments
                .iter()
                .enumerate()
                .map(|(idx, segment)| {
                    if idx < count {
                        segment.chars().next().map(String::from).unwrap_or_default()
                    } else {
                        (*segment).to_string()
                    }
                })
                .collect::<Vec<_>>()
                .join("-");
            if candidate.len() < self.limit {
                return candidate;
            }
        }

        // More segments than the bound allows even when fully abbreviated.
        let cut = name
            .char_indices()
            .map(|(idx, _)| idx)
            .take_while(|idx| *idx < self.limit)
            .last()
            .unwrap_or(0);
        name[..cut].trim_end_matches('-').to_string()
    }
}

fn host_and_path(url: &str) -> Result<(String, String), KeyError> {
    let parsed = Url::parse(url).map_err(|err| KeyError::InvalidUrl {
        url: url.to_string(),
        reason: err.to_string(),
    })?;
    let host = parsed
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| KeyError::MissingHost(url.to_string()))?;
    Ok((host.to_string(), parsed.path().to_string()))
}

fn underscore_non_alphanumeric(input: &str) -> String {
    input
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Tracks which URL owns each derived object name so abbreviation collisions
/// are rejected instead of silently aliasing two sites.
#[derive(Debug, Clone, Default)]
pub struct ObjectNameRegistry {
    deriver: KeyDeriver,
    owners: HashMap<String, String>,
}

impl ObjectNameRegistry {
    pub fn new(deriver: KeyDeriver) -> Self {
        Self {
            deriver,
            owners: HashMap::new(),
        }
    }

    pub fn claim(&mut self, url: &str) -> Result<String, KeyError> {
        let name = self.deriver.object_name(url)?;
        match self.owners.get(&name) {
            Some(existing) if existing != url => Err(KeyError::Collision {
                name,
                existing: existing.clone(),
                requested: url.to_string(),
            }),
            Some(_) => Ok(name),
            None => {
                self.owners.insert(name.clone(), url.to_string());
                Ok(name)
            }
        }
    }

    pub fn owner_of(&self, name: &str) -> Option<&str> {
        self.owners.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub name: String,
    /// Plugins whose presence on a cluster site implies this category.
    #[serde(default)]
    pub plugins: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCatalog {
    #[serde(default)]
    pub categories: Vec<Category>,
}

impl CategoryCatalog {
    pub fn from_yaml_str(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    /// Display name for a category reference; unknown references pass through.
    pub fn display_name(&self, reference: &str) -> String {
        self.categories
            .iter()
            .find(|c| c.id == reference || c.name == reference)
            .map(|c| c.name.clone())
            .unwrap_or_else(|| reference.to_string())
    }

    pub fn categories_for_plugins(&self, plugins: &[String]) -> Vec<String> {
        self.categories
            .iter()
            .filter(|c| c.plugins.iter().any(|p| plugins.contains(p)))
            .map(|c| c.id.clone())
            .collect()
    }
}
