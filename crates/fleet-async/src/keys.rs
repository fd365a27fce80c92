//! Ephemeral store key layout.
//!
//! Per-host keys embed the host ID as a `{...}` hash tag so a host's buffer and its
//! "reported at" marker always land on the same shard and can be written in one
//! atomic batch.
//!
//! | Key | Type | Content |
//! |-----|------|---------|
//! | `<kind>:{<host>}` | sorted set / list / hash | Buffered results for one host |
//! | `<kind>:reported:{<host>}` | string | Unix milliseconds of the latest report |
//! | `<kind>:active_host_ids` | sorted set | Hosts with pending work, scored by report time |
//! | `locks:async_collector:<kind>` | string | Collector lock holder token |

use fleet_core::{HostId, TaskKind};

/// Returns the buffer key of a host.
#[must_use]
pub fn buffer_key(kind: TaskKind, host_id: HostId) -> String {
    format!("{kind}:{{{host_id}}}")
}

/// Returns the "reported at" marker key of a host.
#[must_use]
pub fn reported_key(kind: TaskKind, host_id: HostId) -> String {
    format!("{kind}:reported:{{{host_id}}}")
}

/// Returns the active-entity index key of a kind.
#[must_use]
pub fn active_index_key(kind: TaskKind) -> String {
    format!("{kind}:active_host_ids")
}

/// Returns the collector lock key of a kind.
#[must_use]
pub fn lock_key(kind: TaskKind) -> String {
    format!("locks:async_collector:{kind}")
}

/// Returns the hash field of a scheduled query: `pack\0query`.
#[must_use]
pub fn stats_field(pack_name: &str, query_name: &str) -> String {
    format!("{pack_name}\0{query_name}")
}

/// Splits a scheduled query hash field back into `(pack, query)`.
#[must_use]
pub fn parse_stats_field(field: &str) -> Option<(String, String)> {
    field
        .split_once('\0')
        .map(|(pack, query)| (pack.to_string(), query.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_keys_share_hash_tag() {
        let host = HostId::new(7);
        assert_eq!(
            buffer_key(TaskKind::LabelMembership, host),
            "label_membership:{7}"
        );
        assert_eq!(
            reported_key(TaskKind::LabelMembership, host),
            "label_membership:reported:{7}"
        );
    }

    #[test]
    fn kind_keys() {
        assert_eq!(
            active_index_key(TaskKind::HostLastSeen),
            "host_last_seen:active_host_ids"
        );
        assert_eq!(
            lock_key(TaskKind::PolicyMembership),
            "locks:async_collector:policy_membership"
        );
    }

    #[test]
    fn stats_field_roundtrip() {
        let field = stats_field("baseline", "processes");
        assert_eq!(
            parse_stats_field(&field),
            Some(("baseline".to_string(), "processes".to_string()))
        );
        assert_eq!(parse_stats_field("no-separator"), None);
    }
}
