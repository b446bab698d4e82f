//! Property lookup seam. Search and matching live outside this crate; the
//! dispatcher only needs an async `search` and a list of alternative locations.

use crate::error::RealtimeResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One listing the assistant can show.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub id: String,
    pub title: String,
    /// e.g. villa, apartment
    pub kind: String,
    pub location: String,
    pub price: u64,
    #[serde(default)]
    pub bedrooms: Option<u32>,
    #[serde(default)]
    pub area_sqm: Option<u32>,
    #[serde(default)]
    pub description: String,
}

impl Property {
    /// Sentence spoken back to the backend when the property is shown.
    pub fn describe(&self) -> String {
        let mut text = format!("{} in {}, priced at {} SAR", self.title, self.location, self.price);
        if let Some(bedrooms) = self.bedrooms {
            text.push_str(&format!(", {} bedrooms", bedrooms));
        }
        if let Some(area) = self.area_sqm {
            text.push_str(&format!(", {} square meters", area));
        }
        text.push('.');
        if !self.description.trim().is_empty() {
            text.push(' ');
            text.push_str(self.description.trim());
        }
        text
    }
}

#[async_trait]
pub trait PropertyLookup: Send + Sync {
    /// Matching properties, best first. May be empty.
    async fn search(&self, query: &str) -> RealtimeResult<Vec<Property>>;

    /// Other locations where properties of `kind` are available.
    async fn alternatives(&self, kind: &str) -> RealtimeResult<Vec<String>>;
}

/// Fixed catalog matched by words in title, kind and location.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    properties: Vec<Property>,
}

impl InMemoryCatalog {
    pub fn new(properties: Vec<Property>) -> Self {
        Self { properties }
    }

    /// Load a catalog from a JSON array of properties.
    pub fn from_json(json: &str) -> RealtimeResult<Self> {
        Ok(Self::new(serde_json::from_str(json)?))
    }

    fn haystack(p: &Property) -> String {
        format!("{} {} {}", p.title, p.kind, p.location).to_lowercase()
    }
}

/// Words too generic to narrow a search ("in", "a", ...).
const STOP_WORDS: &[&str] = &["in", "a", "an", "the", "at", "for", "في", "فى", "من"];

fn terms(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|w| w.to_lowercase())
        .filter(|w| !STOP_WORDS.contains(&w.as_str()))
        .collect()
}

#[async_trait]
impl PropertyLookup for InMemoryCatalog {
    async fn search(&self, query: &str) -> RealtimeResult<Vec<Property>> {
        let terms = terms(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .properties
            .iter()
            .filter(|p| {
                let hay = Self::haystack(p);
                terms.iter().all(|t| hay.contains(t.as_str()))
            })
            .cloned()
            .collect())
    }

    async fn alternatives(&self, kind: &str) -> RealtimeResult<Vec<String>> {
        let terms = terms(kind);
        let mut locations: Vec<String> = Vec::new();
        for p in &self.properties {
            let kind_lower = p.kind.to_lowercase();
            let title_lower = p.title.to_lowercase();
            let matches = terms
                .iter()
                .any(|t| kind_lower.contains(t.as_str()) || title_lower.contains(t.as_str()));
            if matches && !locations.contains(&p.location) {
                locations.push(p.location.clone());
            }
        }
        Ok(locations)
    }
}
