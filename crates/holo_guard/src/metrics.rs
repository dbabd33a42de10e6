//! In-process counters for the supervision monitors.
//!
//! Counters are lock-free and only ever increase. `render_text` produces
//! `key=value` lines, logged once at shutdown.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::diagnosis::Outcome;

#[derive(Debug, Default)]
pub struct GuardMetrics {
    ticks_ok: AtomicU64,
    ticks_failed: AtomicU64,
    diagnoses_confirmed: AtomicU64,
    diagnoses_undecided: AtomicU64,
    diagnoses_discovered: AtomicU64,
    quarantines: AtomicU64,
    quarantine_clears: AtomicU64,
    pooler_failures: AtomicU64,
    broadcast_failures: AtomicU64,
    readonly_mirror_changes: AtomicU64,
    members_reaped: AtomicU64,
    slots_dropped: AtomicU64,
    backups_ok: AtomicU64,
    backups_failed: AtomicU64,
    backup_attempts_failed: AtomicU64,
    retention_runs: AtomicU64,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GuardMetricsSnapshot {
    pub ticks_ok: u64,
    pub ticks_failed: u64,
    pub diagnoses_confirmed: u64,
    pub diagnoses_undecided: u64,
    pub diagnoses_discovered: u64,
    pub quarantines: u64,
    pub quarantine_clears: u64,
    pub pooler_failures: u64,
    pub broadcast_failures: u64,
    pub readonly_mirror_changes: u64,
    pub members_reaped: u64,
    pub slots_dropped: u64,
    pub backups_ok: u64,
    pub backups_failed: u64,
    pub backup_attempts_failed: u64,
    pub retention_runs: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl GuardMetrics {
    pub fn record_tick(&self, ok: bool) {
        if ok {
            bump(&self.ticks_ok);
        } else {
            bump(&self.ticks_failed);
        }
    }

    pub fn record_diagnosis(&self, outcome: Outcome) {
        match outcome {
            Outcome::Confirmed => bump(&self.diagnoses_confirmed),
            Outcome::Undecided => bump(&self.diagnoses_undecided),
            Outcome::DiscoveredOther => bump(&self.diagnoses_discovered),
        }
    }

    pub fn record_quarantine(&self) {
        bump(&self.quarantines);
    }

    pub fn record_quarantine_cleared(&self) {
        bump(&self.quarantine_clears);
    }

    pub fn record_pooler_failure(&self) {
        bump(&self.pooler_failures);
    }

    pub fn record_broadcast_failure(&self) {
        bump(&self.broadcast_failures);
    }

    pub fn record_readonly_mirror_change(&self) {
        bump(&self.readonly_mirror_changes);
    }

    pub fn record_member_reaped(&self) {
        bump(&self.members_reaped);
    }

    pub fn record_slot_dropped(&self) {
        bump(&self.slots_dropped);
    }

    pub fn record_backup(&self, ok: bool) {
        if ok {
            bump(&self.backups_ok);
        } else {
            bump(&self.backups_failed);
        }
    }

    pub fn record_backup_attempt_failed(&self) {
        bump(&self.backup_attempts_failed);
    }

    pub fn record_retention_run(&self) {
        bump(&self.retention_runs);
    }

    pub fn snapshot(&self) -> GuardMetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        GuardMetricsSnapshot {
            ticks_ok: load(&self.ticks_ok),
            ticks_failed: load(&self.ticks_failed),
            diagnoses_confirmed: load(&self.diagnoses_confirmed),
            diagnoses_undecided: load(&self.diagnoses_undecided),
            diagnoses_discovered: load(&self.diagnoses_discovered),
            quarantines: load(&self.quarantines),
            quarantine_clears: load(&self.quarantine_clears),
            pooler_failures: load(&self.pooler_failures),
            broadcast_failures: load(&self.broadcast_failures),
            readonly_mirror_changes: load(&self.readonly_mirror_changes),
            members_reaped: load(&self.members_reaped),
            slots_dropped: load(&self.slots_dropped),
            backups_ok: load(&self.backups_ok),
            backups_failed: load(&self.backups_failed),
            backup_attempts_failed: load(&self.backup_attempts_failed),
            retention_runs: load(&self.retention_runs),
        }
    }

    pub fn render_text(&self) -> String {
        let s = self.snapshot();
        format!(
            "ticks_ok={}\nticks_failed={}\ndiagnoses_confirmed={}\ndiagnoses_undecided={}\ndiagnoses_discovered={}\nquarantines={}\nquarantine_clears={}\npooler_failures={}\nbroadcast_failures={}\nreadonly_mirror_changes={}\nmembers_reaped={}\nslots_dropped={}\nbackups_ok={}\nbackups_failed={}\nbackup_attempts_failed={}\nretention_runs={}\n",
            s.ticks_ok,
            s.ticks_failed,
            s.diagnoses_confirmed,
            s.diagnoses_undecided,
            s.diagnoses_discovered,
            s.quarantines,
            s.quarantine_clears,
            s.pooler_failures,
            s.broadcast_failures,
            s.readonly_mirror_changes,
            s.members_reaped,
            s.slots_dropped,
            s.backups_ok,
            s.backups_failed,
            s.backup_attempts_failed,
            s.retention_runs,
        )
    }
}
