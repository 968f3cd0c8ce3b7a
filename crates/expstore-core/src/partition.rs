//! Maps a triage scope onto an isolated storage namespace.

use crate::errors::{ExpStoreError, Result};
use std::fmt;

/// Partition id of the production branch.
pub const MASTER_PARTITION: &str = "master";

/// Kind of partition; decides the shard count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKind {
    Master,
    ChangeList,
}

/// Storage namespace holding its own entries, records and changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Partition {
    id: String,
}

impl Partition {
    pub fn master() -> Self {
        Self {
            id: MASTER_PARTITION.to_string(),
        }
    }

    /// Resolves the partition for a pending change.
    ///
    /// Returns `Ok(None)` when either part is empty, which means the scope is
    /// the production branch.
    pub fn for_change_list(change_list_id: &str, review_system: &str) -> Result<Option<Self>> {
        let change_list_id = change_list_id.trim();
        let review_system = review_system.trim();
        if change_list_id.is_empty() || review_system.is_empty() {
            return Ok(None);
        }
        validate_component("review system", review_system)?;
        validate_component("change list id", change_list_id)?;
        Ok(Some(Self {
            id: format!("{}_{}", review_system, change_list_id),
        }))
    }

    /// Resolves either scope: empty inputs give the master partition.
    pub fn resolve(change_list_id: &str, review_system: &str) -> Result<Self> {
        Ok(Self::for_change_list(change_list_id, review_system)?.unwrap_or_else(Self::master))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> PartitionKind {
        if self.id == MASTER_PARTITION {
            PartitionKind::Master
        } else {
            PartitionKind::ChangeList
        }
    }

    pub fn is_master(&self) -> bool {
        self.kind() == PartitionKind::Master
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

// Partition ids become path components in the backend.
fn validate_component(what: &str, value: &str) -> Result<()> {
    let ok = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !ok {
        return Err(ExpStoreError::Config(format!(
            "invalid {} '{}': only ASCII letters, digits, '-', '_' and '.' are allowed",
            what, value
        )));
    }
    Ok(())
}
