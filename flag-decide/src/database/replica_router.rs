use std::collections::HashSet;
use std::sync::Mutex;

use crate::database::DatabaseTarget;
use crate::metrics::consts::FLAG_REPLICA_ROUTING_COUNTER;
use crate::metrics::utils::inc;

/// The logical row sets a request can read or write.
///
/// Read-your-writes is tracked per row set: a write to `HashKeyOverrides`
/// pins later override reads to the primary, but person property reads keep
/// going to the replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RowSet {
    Persons,
    PersonProperties,
    GroupProperties,
    HashKeyOverrides,
    StaticCohortMembership,
    FlagDefinitions,
    Teams,
}

impl RowSet {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowSet::Persons => "persons",
            RowSet::PersonProperties => "person_properties",
            RowSet::GroupProperties => "group_properties",
            RowSet::HashKeyOverrides => "hash_key_overrides",
            RowSet::StaticCohortMembership => "static_cohort_membership",
            RowSet::FlagDefinitions => "flag_definitions",
            RowSet::Teams => "teams",
        }
    }
}

/// Per-request choice between the primary and the replica.
///
/// One router lives for exactly one request; it is never shared between
/// requests, so the written set only ever describes this request's writes.
#[derive(Debug, Default)]
pub struct ReplicaRouter {
    written: Mutex<HashSet<RowSet>>,
}

impl ReplicaRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route_read(&self, rows: RowSet) -> DatabaseTarget {
        let target = if self.has_written(rows) {
            DatabaseTarget::Primary
        } else {
            DatabaseTarget::Replica
        };
        record(rows, "read", target);
        target
    }

    /// Writes always go to the primary, and every later read of `rows` follows them there.
    pub fn route_write(&self, rows: RowSet) -> DatabaseTarget {
        self.written
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(rows);
        record(rows, "write", DatabaseTarget::Primary);
        DatabaseTarget::Primary
    }

    pub fn has_written(&self, rows: RowSet) -> bool {
        self.written
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(&rows)
    }
}

fn record(rows: RowSet, kind: &str, target: DatabaseTarget) {
    inc(
        FLAG_REPLICA_ROUTING_COUNTER,
        &[
            ("rows".to_string(), rows.as_str().to_string()),
            ("kind".to_string(), kind.to_string()),
            ("target".to_string(), target.as_str().to_string()),
        ],
        1,
    );
}
