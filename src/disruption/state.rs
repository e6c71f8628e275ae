use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::{api::constants::PDB_STATE_CONFIGMAP, client::kv_store::KvStore, Result};

pub const DISABLED_PDB_KEY: &str = "disabled-pdb";
const NOOUT_SUFFIX: &str = "-noout-set-at";

pub fn noout_key(domain: &str) -> String {
    format!("{domain}{NOOUT_SUFFIX}")
}

/// What the state config map remembers between ticks.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PdbState {
    /// The one failure-domain value without a budget, empty when all are protected.
    pub disabled: String,
    pub noout_set_at: BTreeMap<String, DateTime<Utc>>,
}

impl PdbState {
    pub fn from_data(data: &BTreeMap<String, String>) -> Self {
        let mut state = PdbState {
            disabled: data.get(DISABLED_PDB_KEY).cloned().unwrap_or_default(),
            ..Default::default()
        };
        for (key, value) in data {
            let Some(domain) = key.strip_suffix(NOOUT_SUFFIX) else {
                continue;
            };
            match DateTime::parse_from_rfc3339(value) {
                Ok(at) => {
                    state.noout_set_at.insert(domain.to_string(), at.with_timezone(&Utc));
                }
                Err(e) => warn!("ignoring unreadable {key}={value}: {e}"),
            }
        }
        state
    }

    pub fn to_data(&self) -> BTreeMap<String, String> {
        let mut data = BTreeMap::from([(DISABLED_PDB_KEY.to_string(), self.disabled.clone())]);
        for (domain, at) in &self.noout_set_at {
            data.insert(noout_key(domain), at.to_rfc3339());
        }
        data
    }

    pub async fn load(kv: &dyn KvStore) -> Result<Self> {
        match kv.list(PDB_STATE_CONFIGMAP).await {
            Ok(data) => Ok(PdbState::from_data(&data)),
            Err(e) if e.is_not_found() => Ok(PdbState::default()),
            Err(e) => Err(e),
        }
    }

    /// Writes the state, dropping stamps of domains that no longer hold one.
    pub async fn save(&self, kv: &dyn KvStore, previous: &PdbState) -> Result<()> {
        for (key, value) in self.to_data() {
            kv.set(PDB_STATE_CONFIGMAP, &key, &value).await?;
        }
        for domain in previous.noout_set_at.keys() {
            if !self.noout_set_at.contains_key(domain) {
                kv.delete(PDB_STATE_CONFIGMAP, &noout_key(domain)).await?;
            }
        }
        Ok(())
    }
}

/// The domain left open after this tick. A new domain opens only on a clean
/// cluster, and a domain still draining stays open.
pub fn next_disabled(current: &str, draining: &BTreeSet<String>, clean: bool) -> String {
    if draining.is_empty() {
        return String::new();
    }
    if draining.contains(current) {
        return current.to_string();
    }
    match draining.first() {
        Some(first) if clean => first.clone(),
        _ => current.to_string(),
    }
}

/// The desired budget and flag for one failure-domain value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DomainAction {
    pub domain: String,
    pub protected: bool,
    pub noout: bool,
}

/// Advances `state` one tick and returns the action for every domain.
/// Protected domains come first so the open one loses its budget last.
pub fn plan(
    state: &mut PdbState,
    domains: &BTreeSet<String>,
    draining: &BTreeSet<String>,
    clean: bool,
    now: DateTime<Utc>,
    maintenance_timeout: Duration,
) -> Vec<DomainAction> {
    state.disabled = next_disabled(&state.disabled, draining, clean);
    let timeout = chrono::Duration::from_std(maintenance_timeout).unwrap_or(chrono::Duration::MAX);

    let mut all: BTreeSet<String> = domains.clone();
    if !state.disabled.is_empty() {
        all.insert(state.disabled.clone());
    }

    let mut protected = vec![];
    let mut open = vec![];
    for domain in all {
        if domain == state.disabled {
            let set_at = *state.noout_set_at.entry(domain.clone()).or_insert(now);
            open.push(DomainAction {
                noout: now - set_at < timeout,
                protected: false,
                domain,
            });
        } else {
            state.noout_set_at.remove(&domain);
            protected.push(DomainAction {
                domain,
                protected: true,
                noout: false,
            });
        }
    }
    state.noout_set_at.retain(|d, _| *d == state.disabled);
    protected.extend(open);
    protected
}
