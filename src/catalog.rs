//! Item weights and the item universe used by sync jobs.

use std::collections::HashMap;

use serde::Deserialize;
use tracing::info;

use crate::error::Result;

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    id: String,
    #[serde(default)]
    weight: Option<f64>,
}

/// Loaded once at startup. Items keep file order; weights missing from the file
/// fall back to the configured default.
#[derive(Debug, Clone, Default)]
pub struct ItemCatalog {
    items: Vec<String>,
    weights: HashMap<String, f64>,
    default_weight: f64,
}

impl ItemCatalog {
    pub fn empty(default_weight: f64) -> Self {
        Self {
            items: Vec::new(),
            weights: HashMap::new(),
            default_weight,
        }
    }

    /// Load `[{"id": "T4_BAG", "weight": 1.2}, ...]`.
    pub async fn load(path: &str, default_weight: f64) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        let catalog = Self::from_json(&raw, default_weight)?;
        info!(items = catalog.items.len(), "Item catalog loaded from {path}");
        Ok(catalog)
    }

    pub fn from_json(raw: &str, default_weight: f64) -> Result<Self> {
        let entries: Vec<CatalogEntry> = serde_json::from_str(raw)?;
        let mut catalog = Self::empty(default_weight);
        for e in entries {
            let id = e.id.trim().to_string();
            if id.is_empty() || catalog.weights.contains_key(&id) {
                continue;
            }
            let weight = e.weight.filter(|w| *w > 0.0).unwrap_or(default_weight);
            catalog.weights.insert(id.clone(), weight);
            catalog.items.push(id);
        }
        Ok(catalog)
    }

    pub fn weight(&self, item_id: &str) -> f64 {
        self.weights.get(item_id).copied().unwrap_or(self.default_weight)
    }

    pub fn items(&self) -> &[String] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
