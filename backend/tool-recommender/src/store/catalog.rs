use crate::models::{ToolId, ToolProfile};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Static tool metadata owned by an external catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolMetadata {
    pub tool_id: ToolId,
    pub category: String,
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl ToolMetadata {
    pub fn new(
        tool_id: impl Into<ToolId>,
        category: impl Into<String>,
        description: impl Into<String>,
        tags: &[&str],
    ) -> Self {
        Self {
            tool_id: tool_id.into(),
            category: category.into(),
            description: description.into(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    pub fn to_profile(&self) -> ToolProfile {
        ToolProfile::new(
            self.tool_id.clone(),
            self.category.clone(),
            self.description.clone(),
            self.tags.clone(),
        )
    }
}

/// Authoritative list of tools the engine may recommend
pub trait ToolCatalog: Send + Sync {
    fn get(&self, tool_id: &str) -> Option<ToolMetadata>;

    fn list(&self) -> Vec<ToolMetadata>;
}

#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    tools: RwLock<HashMap<ToolId, ToolMetadata>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tools(tools: impl IntoIterator<Item = ToolMetadata>) -> Self {
        let catalog = Self::new();
        for tool in tools {
            catalog.register(tool);
        }
        catalog
    }

    /// Insert or replace a tool's metadata
    pub fn register(&self, tool: ToolMetadata) {
        self.tools.write().insert(tool.tool_id.clone(), tool);
    }
}

impl ToolCatalog for InMemoryCatalog {
    fn get(&self, tool_id: &str) -> Option<ToolMetadata> {
        self.tools.read().get(tool_id).cloned()
    }

    fn list(&self) -> Vec<ToolMetadata> {
        let mut tools: Vec<_> = self.tools.read().values().cloned().collect();
        tools.sort_by(|a, b| a.tool_id.cmp(&b.tool_id));
        tools
    }
}
