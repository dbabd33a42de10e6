//! Replication catalog records.
//!
//! Members and replication slots are always re-read from the catalog for each
//! evaluation; nothing here is cached across ticks.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Prefix the replication manager uses when naming per-member physical slots.
pub const SLOT_NAME_PREFIX: &str = "repmgr_slot_";

/// Catalog role of a registered member.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Primary,
    Standby,
    Unknown,
}

impl Role {
    /// Parses the catalog `type` column. Anything unrecognized maps to `Unknown`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "primary" => Self::Primary,
            "standby" => Self::Standby,
            _ => Self::Unknown,
        }
    }

    pub fn is_primary(self) -> bool {
        self == Self::Primary
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Primary => "primary",
            Self::Standby => "standby",
            Self::Unknown => "unknown",
        })
    }
}

/// One registered cluster member.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Catalog identity.
    pub id: i32,
    /// Dial target for SQL and admin HTTP calls.
    pub hostname: String,
    pub region: String,
    pub active: bool,
    pub role: Role,
}

impl Member {
    pub fn is_primary(&self) -> bool {
        self.role == Role::Primary
    }

    pub fn is_standby(&self) -> bool {
        self.role == Role::Standby
    }
}

/// One physical replication slot as reported by the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicationSlot {
    pub name: String,
    pub active: bool,
    /// Bytes of WAL held back by this slot's restart point.
    pub retained_wal_bytes: u64,
}

impl ReplicationSlot {
    /// Member id encoded in the slot name, if the slot follows the
    /// `repmgr_slot_<id>` convention.
    pub fn member_id(&self) -> Option<i32> {
        member_id_from_slot_name(&self.name)
    }

    pub fn retained_wal_mb(&self) -> u64 {
        self.retained_wal_bytes / 1024 / 1024
    }
}

/// Extracts the owning member id from a slot name.
pub fn member_id_from_slot_name(name: &str) -> Option<i32> {
    name.strip_prefix(SLOT_NAME_PREFIX)?.parse::<i32>().ok()
}

/// Slot name used for a given member id.
pub fn slot_name_for_member(id: i32) -> String {
    format!("{SLOT_NAME_PREFIX}{id}")
}
