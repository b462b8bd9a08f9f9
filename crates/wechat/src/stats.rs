//! Aggregate counts derived from registry state.
//!
//! Stats are recomputed on every call and never cached, so a reload can
//! never leave a stale count behind.

use crate::registry::DatabaseEntry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use wxindex_core::{LogicalRole, RegistryState};

/// Summary counts for one registry generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryStats {
    /// Generation the counts were taken from.
    pub generation: u64,
    /// Registry lifecycle state at the time of the call.
    pub state: RegistryState,
    /// Databases in the manifest being served or loaded.
    pub total_databases: usize,
    /// Databases that opened and were classified.
    pub accessible_databases: usize,
    /// Databases that failed to open so far.
    pub inaccessible_databases: usize,
    /// Classified tables across accessible databases.
    pub total_tables: usize,
    /// Table count per logical role; every role is present.
    pub per_role_table_counts: BTreeMap<LogicalRole, usize>,
    /// Database count per declared type label.
    pub per_type_counts: BTreeMap<String, usize>,
}

impl RegistryStats {
    /// Share of databases that are accessible; 0 when nothing is loaded.
    pub fn accessibility_rate(&self) -> f64 {
        if self.total_databases == 0 {
            0.0
        } else {
            self.accessible_databases as f64 / self.total_databases as f64
        }
    }

    /// Tables classified under `role`.
    pub fn tables_with_role(&self, role: LogicalRole) -> usize {
        self.per_role_table_counts.get(&role).copied().unwrap_or(0)
    }
}

/// Fold database entries into stats.
///
/// `expected_total` is the descriptor count of an in-progress load; when it
/// is `None` the entries themselves are the full set.
pub(crate) fn aggregate<'a>(
    generation: u64,
    state: RegistryState,
    expected_total: Option<usize>,
    entries: impl Iterator<Item = &'a DatabaseEntry>,
) -> RegistryStats {
    let mut per_role_table_counts: BTreeMap<LogicalRole, usize> =
        LogicalRole::ALL.iter().map(|role| (*role, 0)).collect();
    let mut per_type_counts = BTreeMap::new();
    let mut seen = 0;
    let mut accessible = 0;
    let mut inaccessible = 0;
    let mut total_tables = 0;

    for entry in entries {
        seen += 1;
        *per_type_counts
            .entry(entry.descriptor.declared_type.clone())
            .or_insert(0) += 1;

        if !entry.is_accessible() {
            inaccessible += 1;
            continue;
        }
        accessible += 1;
        for role in LogicalRole::ALL {
            let count = entry.tables(role).len();
            total_tables += count;
            *per_role_table_counts.entry(role).or_insert(0) += count;
        }
    }

    RegistryStats {
        generation,
        state,
        total_databases: expected_total.unwrap_or(seen).max(seen),
        accessible_databases: accessible,
        inaccessible_databases: inaccessible,
        total_tables,
        per_role_table_counts,
        per_type_counts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_registry_rate_is_zero() {
        let stats = aggregate(0, RegistryState::Uninitialized, None, std::iter::empty());
        assert_eq!(stats.total_databases, 0);
        assert_eq!(stats.accessibility_rate(), 0.0);
        assert_eq!(stats.per_role_table_counts.len(), LogicalRole::ALL.len());
        assert_eq!(stats.tables_with_role(LogicalRole::ChatMessages), 0);
    }

    #[test]
    fn test_partial_load_reports_expected_total() {
        let stats = aggregate(3, RegistryState::Initializing, Some(5), std::iter::empty());
        assert_eq!(stats.total_databases, 5);
        assert_eq!(stats.accessible_databases, 0);
        assert!(stats.accessible_databases <= stats.total_databases);
    }
}
