use super::catalog::ToolCatalog;
use crate::config::ProfileConfig;
use crate::models::{InteractionRecord, ToolId, ToolProfile, UserId, UserProfile};
use dashmap::DashMap;
use std::collections::HashMap;

/// Concurrent user and tool profiles
#[derive(Default)]
pub struct ProfileStore {
    users: DashMap<UserId, UserProfile>,
    tools: DashMap<ToolId, ToolProfile>,
}

impl ProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update both profiles touched by `record`, creating them if absent.
    ///
    /// The user entry stays locked until both sides are written, so first
    /// use is decided once per (user, tool). Lock order is user, then tool.
    pub fn apply(&self, record: &InteractionRecord, catalog: &dyn ToolCatalog, config: &ProfileConfig) {
        let mut user = self
            .users
            .entry(record.user_id.clone())
            .or_insert_with(|| UserProfile::new(record.user_id.clone()));
        let first_use = user.usage_count(&record.tool_id) == 0;

        let category = {
            let mut tool = self.tools.entry(record.tool_id.clone()).or_insert_with(|| {
                catalog
                    .get(&record.tool_id)
                    .map(|meta| meta.to_profile())
                    .unwrap_or_else(|| ToolProfile::unknown(record.tool_id.clone()))
            });
            tool.record(record, first_use);
            tool.category.clone()
        };

        user.apply(record, Some(&category), config);
    }

    /// Create tool profiles for catalog entries not seen yet
    pub fn seed_from_catalog(&self, catalog: &dyn ToolCatalog) -> usize {
        let mut added = 0;
        for meta in catalog.list() {
            if !self.tools.contains_key(&meta.tool_id) {
                self.tools.insert(meta.tool_id.clone(), meta.to_profile());
                added += 1;
            }
        }
        added
    }

    pub fn set_segment(&self, user_id: &str, segment: impl Into<String>) {
        self.users
            .entry(user_id.to_string())
            .or_insert_with(|| UserProfile::new(user_id))
            .segment = Some(segment.into());
    }

    pub fn user(&self, user_id: &str) -> Option<UserProfile> {
        self.users.get(user_id).map(|u| u.clone())
    }

    pub fn tool(&self, tool_id: &str) -> Option<ToolProfile> {
        self.tools.get(tool_id).map(|t| t.clone())
    }

    pub fn tool_ids(&self) -> Vec<ToolId> {
        let mut ids: Vec<_> = self.tools.iter().map(|t| t.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn tool_profiles(&self) -> HashMap<ToolId, ToolProfile> {
        self.tools
            .iter()
            .map(|t| (t.key().clone(), t.value().clone()))
            .collect()
    }

    pub fn segments(&self) -> HashMap<UserId, String> {
        self.users
            .iter()
            .filter_map(|u| u.segment.clone().map(|s| (u.key().clone(), s)))
            .collect()
    }
}
