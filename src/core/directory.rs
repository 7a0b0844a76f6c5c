use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::core::store::Cents;

/// One line of a starter template materialized into a fresh project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateItem {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub bid_amount: Cents,
}

/// What the authoritative project list knows about a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub organization_id: String,
    #[serde(default)]
    pub accounting_id: Option<String>,
    /// Seeds the work item summaries once; cleared after use.
    #[serde(default)]
    pub starter_template: Option<Vec<TemplateItem>>,
    /// Serialized `StoreSnapshot` used when the store has nothing persisted.
    #[serde(default)]
    pub initial_content: Option<String>,
}

impl ProjectInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            organization_id: String::new(),
            accounting_id: None,
            starter_template: None,
            initial_content: None,
        }
    }
}

/// In-memory view of the authoritative project list.
///
/// The layer that owns the list feeds it; the lifecycle controller reads
/// existence and identifying fields and watches for changes.
#[derive(Debug)]
pub struct ProjectDirectory {
    projects: watch::Sender<BTreeMap<String, ProjectInfo>>,
}

impl Default for ProjectDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl ProjectDirectory {
    pub fn new() -> Self {
        let (projects, _) = watch::channel(BTreeMap::new());
        Self { projects }
    }

    pub fn upsert(&self, info: ProjectInfo) {
        self.projects.send_if_modified(|projects| {
            if projects.get(&info.id) == Some(&info) {
                return false;
            }
            projects.insert(info.id.clone(), info);
            true
        });
    }

    pub fn remove(&self, id: &str) -> Option<ProjectInfo> {
        let mut removed = None;
        self.projects.send_if_modified(|projects| {
            removed = projects.remove(id);
            removed.is_some()
        });
        removed
    }

    pub fn get(&self, id: &str) -> Option<ProjectInfo> {
        self.projects.borrow().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.projects.borrow().contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.projects.borrow().keys().cloned().collect()
    }

    /// Record the accounting system's id for a project.
    pub fn set_accounting_id(&self, id: &str, accounting_id: &str) {
        self.projects.send_if_modified(|projects| match projects.get_mut(id) {
            Some(info) if info.accounting_id.as_deref() != Some(accounting_id) => {
                info.accounting_id = Some(accounting_id.to_string());
                true
            }
            _ => false,
        });
    }

    /// Drop the starter template so seeding cannot run again.
    pub fn clear_starter_template(&self, id: &str) {
        self.projects.send_if_modified(|projects| match projects.get_mut(id) {
            Some(info) if info.starter_template.is_some() => {
                info.starter_template = None;
                true
            }
            _ => false,
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<BTreeMap<String, ProjectInfo>> {
        self.projects.subscribe()
    }
}
