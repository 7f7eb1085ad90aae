//! Which postgres settings operators may change, and what a change costs.

use std::collections::BTreeMap;

use sirenia_core::Tunables;

use crate::error::{PostgresError, PostgresResult};

/// Settings accepted as tunables, with whether changing them requires a
/// restart rather than a reload.
const ALLOWED: &[(&str, bool)] = &[
    ("autovacuum", false),
    ("autovacuum_naptime", false),
    ("checkpoint_completion_target", false),
    ("checkpoint_timeout", false),
    ("client_encoding", false),
    ("datestyle", false),
    ("deadlock_timeout", false),
    ("default_statistics_target", false),
    ("default_text_search_config", false),
    ("dynamic_shared_memory_type", true),
    ("effective_cache_size", false),
    ("effective_io_concurrency", false),
    ("huge_pages", true),
    ("lock_timeout", false),
    ("log_checkpoints", false),
    ("log_connections", false),
    ("log_disconnections", false),
    ("log_lock_waits", false),
    ("log_min_duration_statement", false),
    ("log_min_messages", false),
    ("log_statement", false),
    ("log_temp_files", false),
    ("log_timezone", false),
    ("maintenance_work_mem", false),
    ("max_files_per_process", true),
    ("max_locks_per_transaction", true),
    ("max_prepared_transactions", true),
    ("max_standby_archive_delay", false),
    ("max_standby_streaming_delay", false),
    ("max_wal_senders", true),
    ("max_wal_size", false),
    ("max_worker_processes", true),
    ("min_wal_size", false),
    ("random_page_cost", false),
    ("shared_buffers", true),
    ("statement_timeout", false),
    ("temp_buffers", false),
    ("timezone", false),
    ("track_activity_query_size", true),
    ("wal_buffers", true),
    ("wal_keep_segments", false),
    ("wal_receiver_status_interval", false),
    ("work_mem", false),
];

fn lookup(key: &str) -> Option<bool> {
    ALLOWED
        .binary_search_by(|(name, _)| name.cmp(&key))
        .ok()
        .map(|i| ALLOWED[i].1)
}

/// Tunables a fresh cluster starts with.
#[must_use]
pub fn default_tunables() -> Tunables {
    let data = [
        ("dynamic_shared_memory_type", "posix"),
        ("shared_buffers", "32MB"),
        ("max_wal_senders", "15"),
        ("wal_keep_segments", "128"),
        ("max_standby_archive_delay", "30s"),
        ("max_standby_streaming_delay", "30s"),
        ("wal_receiver_status_interval", "10s"),
        ("datestyle", "'iso, mdy'"),
        ("timezone", "'UTC'"),
        ("client_encoding", "'UTF8'"),
        ("log_timezone", "'UTC'"),
        ("log_min_messages", "'LOG'"),
        ("log_connections", "on"),
        ("log_disconnections", "on"),
        ("default_text_search_config", "'pg_catalog.english'"),
    ];
    Tunables {
        version: 1,
        data: data
            .into_iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect(),
    }
}

/// Reject any key that is not an allowed setting.
pub fn validate(tunables: &Tunables) -> PostgresResult<()> {
    match tunables.data.keys().find(|key| lookup(key).is_none()) {
        Some(key) => Err(PostgresError::UnknownTunable(key.clone())),
        None => Ok(()),
    }
}

/// Whether moving from `current` to `next` changes, adds or removes a
/// setting that only takes effect on restart.
#[must_use]
pub fn requires_restart(current: &BTreeMap<String, String>, next: &BTreeMap<String, String>) -> bool {
    let mut changed = current
        .iter()
        .filter(|(key, value)| next.get(*key) != Some(*value))
        .map(|(key, _)| key)
        .chain(next.keys().filter(|key| !current.contains_key(*key)));
    changed.any(|key| lookup(key).unwrap_or(false))
}
