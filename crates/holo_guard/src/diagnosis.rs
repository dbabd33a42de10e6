//! Zombie diagnosis: does a quorum of registered members agree that this node
//! is the primary?
//!
//! A primary takes a [`DnaSample`] by asking every registered standby which
//! node it believes is primary, then [`diagnose`] turns the sample into a
//! verdict. Quorum is a strict majority of all *registered* members, so a
//! minority partition can neither confirm itself nor depose the majority's
//! primary.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use futures_util::stream::{FuturesUnordered, StreamExt};

use crate::member::Member;
use crate::sql::SqlConnector;

/// One-shot snapshot of peer agreement. Built, diagnosed, discarded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DnaSample {
    pub hostname: String,
    pub total_members: usize,
    pub total_active: usize,
    pub total_inactive: usize,
    pub total_conflicts: usize,
    /// Reported primary hostname -> number of standbys reporting it.
    pub conflict_map: BTreeMap<String, usize>,
}

impl DnaSample {
    /// Sample containing only self, counted as a live, agreeing member.
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            total_members: 1,
            total_active: 1,
            total_inactive: 0,
            total_conflicts: 0,
            conflict_map: BTreeMap::new(),
        }
    }

    pub fn record_unreachable(&mut self) {
        self.total_members += 1;
        self.total_inactive += 1;
    }

    /// A reachable standby and the primary it reports, if any. A standby that
    /// reports no primary has not contradicted self.
    pub fn record_reachable(&mut self, reported_primary: Option<&str>) {
        self.total_members += 1;
        self.total_active += 1;
        if let Some(primary) = reported_primary {
            if primary != self.hostname {
                self.total_conflicts += 1;
                *self.conflict_map.entry(primary.to_string()).or_insert(0) += 1;
            }
        }
    }

    pub fn quorum(&self) -> usize {
        self.total_members / 2 + 1
    }
}

/// Verdict kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// A quorum agrees this node is the primary.
    Confirmed,
    /// Not enough evidence either way; the node must fence itself.
    Undecided,
    /// A quorum reports a different primary.
    DiscoveredOther,
}

/// Verdict plus the primary hostname it names (empty for `Undecided`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnosis {
    pub primary: String,
    pub outcome: Outcome,
}

impl Diagnosis {
    fn confirmed(hostname: &str) -> Self {
        Self {
            primary: hostname.to_string(),
            outcome: Outcome::Confirmed,
        }
    }

    fn undecided() -> Self {
        Self {
            primary: String::new(),
            outcome: Outcome::Undecided,
        }
    }
}

/// Pure verdict over a sample.
///
/// Among conflict candidates with equal counts the first in map order is
/// kept; that choice is only visible when its count reaches quorum, and two
/// distinct candidates cannot both reach quorum.
pub fn diagnose(sample: &DnaSample) -> Diagnosis {
    if sample.total_members == 1 {
        return Diagnosis::confirmed(&sample.hostname);
    }

    let quorum = sample.quorum();
    if sample.total_active < quorum {
        return Diagnosis::undecided();
    }

    let mut top_candidate = "";
    let mut highest_total = 0usize;
    for (hostname, total) in &sample.conflict_map {
        if *total > highest_total {
            highest_total = *total;
            top_candidate = hostname.as_str();
        }
    }

    let my_count = sample
        .total_members
        .saturating_sub(sample.total_inactive)
        .saturating_sub(sample.total_conflicts);
    if my_count >= quorum {
        // Any contradiction under an otherwise passing quorum stays undecided.
        if sample.total_conflicts > 0 {
            return Diagnosis::undecided();
        }
        return Diagnosis::confirmed(&sample.hostname);
    }

    if highest_total >= quorum {
        return Diagnosis {
            primary: top_candidate.to_string(),
            outcome: Outcome::DiscoveredOther,
        };
    }

    Diagnosis::undecided()
}

/// Probes every standby and builds a sample for `hostname`.
///
/// An unreachable standby counts as inactive. A reachable standby whose
/// primary view cannot be queried fails the whole sample.
pub async fn take_dna_sample(
    connector: &dyn SqlConnector,
    hostname: &str,
    standbys: &[Member],
) -> Result<DnaSample> {
    let mut probes: FuturesUnordered<_> = standbys
        .iter()
        .map(|standby| probe_standby(connector, standby))
        .collect();

    let mut sample = DnaSample::new(hostname);
    while let Some(probe) = probes.next().await {
        match probe? {
            None => sample.record_unreachable(),
            Some(reported) => sample.record_reachable(reported.as_deref()),
        }
    }
    Ok(sample)
}

/// `Ok(None)` when unreachable, otherwise the standby's reported primary.
async fn probe_standby(
    connector: &dyn SqlConnector,
    standby: &Member,
) -> Result<Option<Option<String>>> {
    let session = match connector.connect(&standby.hostname).await {
        Ok(session) => session,
        Err(err) => {
            tracing::debug!(
                standby = %standby.hostname,
                error = %err,
                "standby unreachable while sampling"
            );
            return Ok(None);
        }
    };
    let primary = session
        .primary_member()
        .await
        .with_context(|| format!("query primary view of {}", standby.hostname))?;
    Ok(Some(primary.map(|m| m.hostname)))
}
