//! The model catalog as returned by the backend.
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    #[serde(default)]
    pub text: bool,
    #[serde(default)]
    pub image: bool,
    #[serde(default)]
    pub code: bool,
}

// Object {
//     "id": String("anthropic.claude-3-sonnet-20240229-v1:0"),
//     "name": String("Claude 3 Sonnet"),
//     "provider": String("anthropic"),
//     "provider_name": String("Anthropic"),
//     "icon_url": String("data:image/svg+xml;base64,..."),
//     "provider_icon_url": String("data:image/svg+xml;base64,..."),
//     "capabilities": Object {"text": Bool(true), "image": Bool(true), "code": Bool(false)}
// }
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct ModelCatalogEntry {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub provider_name: String,
    #[serde(default)]
    pub icon_url: String,
    #[serde(default)]
    pub provider_icon_url: String,
    #[serde(default)]
    pub capabilities: Capabilities,
}

/// Ordered list of models the backend currently knows about.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Catalog(Vec<ModelCatalogEntry>);

impl Catalog {
    pub fn new(entries: Vec<ModelCatalogEntry>) -> Self {
        Self(entries)
    }

    pub fn entries(&self) -> &[ModelCatalogEntry] {
        &self.0
    }

    pub fn get(&self, model_id: &str) -> Option<&ModelCatalogEntry> {
        self.0.iter().find(|entry| entry.id == model_id)
    }

    pub fn contains(&self, model_id: &str) -> bool {
        self.get(model_id).is_some()
    }

    /// Models that are no longer in the catalog have no capabilities.
    pub fn capabilities(&self, model_id: &str) -> Capabilities {
        self.get(model_id)
            .map(|entry| entry.capabilities)
            .unwrap_or_default()
    }

    pub fn first(&self) -> Option<&ModelCatalogEntry> {
        self.0.first()
    }

    pub fn display_name<'a>(&'a self, model_id: &'a str) -> &'a str {
        self.get(model_id)
            .map(|entry| entry.name.as_str())
            .unwrap_or(model_id)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}
