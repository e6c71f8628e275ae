use std::{collections::BTreeMap, time::Duration};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::endpoints::{mon_id, MonEndpoints};
use crate::client::ceph::MonStatus;

/// Whether `removed` mons may be absent from a set of `count` without losing
/// quorum. Sets of one or two never tolerate an absence.
pub fn quorum_allows_removal(count: usize, removed: usize) -> bool {
    count.div_ceil(2).saturating_sub(1) >= removed
}

/// What the manager should do after one health tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthAction {
    /// Nothing to do.
    Steady,
    /// Fewer than a majority of known mons are in quorum. Needs a human.
    MajorityLost { in_quorum: usize, total: usize },
    /// Replace this mon with a new one.
    Failover(String),
    /// Remove this surplus mon.
    ScaleDown(String),
    /// Start this many more mons.
    ScaleUp(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    /// In the backend mon map but not managed by us.
    pub external: Vec<String>,
    pub in_quorum: Vec<String>,
    pub out_of_quorum: Vec<String>,
    pub action: HealthAction,
}

/// Sorts mon names by numeric id, unknown names last.
pub fn by_id(names: &mut [String]) {
    names.sort_by_key(|n| (mon_id(n).unwrap_or(i32::MAX), n.clone()));
}

/// Remembers since when each mon has been out of quorum. Markers live
/// across ticks; a mon seen in quorum loses its marker.
#[derive(Debug, Default, Clone)]
pub struct HealthTracker {
    out_since: BTreeMap<String, DateTime<Utc>>,
}

impl HealthTracker {
    pub fn out_since(&self, name: &str) -> Option<DateTime<Utc>> {
        self.out_since.get(name).copied()
    }

    pub fn forget(&mut self, name: &str) {
        self.out_since.remove(name);
    }

    fn timed_out(&self, name: &str, timeout: Duration, now: DateTime<Utc>) -> bool {
        self.out_since
            .get(name)
            .is_some_and(|since| (now - *since).to_std().unwrap_or_default() > timeout)
    }

    /// One tick of the health check. `truth` is the persisted endpoint map.
    pub fn evaluate(
        &mut self,
        truth: &MonEndpoints,
        status: &MonStatus,
        size: usize,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> HealthReport {
        let external: Vec<String> = status
            .monmap
            .mons
            .iter()
            .filter(|m| !truth.contains_key(&m.name))
            .map(|m| m.name.clone())
            .collect();
        for name in &external {
            info!("mon {name} is not managed by the operator, skipping");
        }

        let mut names: Vec<String> = truth.keys().cloned().collect();
        by_id(&mut names);
        let (in_quorum, out_of_quorum): (Vec<String>, Vec<String>) =
            names.iter().cloned().partition(|n| status.in_quorum(n));

        self.out_since.retain(|name, _| truth.contains_key(name));
        for name in &in_quorum {
            if self.out_since.remove(name).is_some() {
                info!("mon {name} is back in quorum");
            }
        }
        for name in &out_of_quorum {
            self.out_since.entry(name.clone()).or_insert(now);
        }

        let action = self.decide(&names, &in_quorum, &out_of_quorum, size, timeout, now);
        HealthReport {
            external,
            in_quorum,
            out_of_quorum,
            action,
        }
    }

    fn decide(
        &mut self,
        names: &[String],
        in_quorum: &[String],
        out_of_quorum: &[String],
        size: usize,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> HealthAction {
        let total = names.len();
        if total > 0 && in_quorum.len() < total.div_ceil(2) {
            return HealthAction::MajorityLost {
                in_quorum: in_quorum.len(),
                total,
            };
        }

        for name in out_of_quorum {
            if !self.timed_out(name, timeout, now) {
                warn!("mon {name} not in quorum, waiting for timeout before failover");
                continue;
            }
            if !quorum_allows_removal(total, out_of_quorum.len()) {
                warn!("mon {name} timed out but removing it would risk quorum");
                continue;
            }
            self.out_since.remove(name);
            return HealthAction::Failover(name.clone());
        }

        if total > size {
            if let Some(extra) = names.last() {
                let absent = out_of_quorum.len() + usize::from(in_quorum.contains(extra));
                if quorum_allows_removal(total, absent) {
                    return HealthAction::ScaleDown(extra.clone());
                }
                warn!("cannot remove surplus mon {extra} without risking quorum");
            }
            return HealthAction::Steady;
        }

        if total < size {
            return HealthAction::ScaleUp(size - total);
        }
        HealthAction::Steady
    }
}
