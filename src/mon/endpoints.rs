use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::api::constants::{MON_APP, MON_ENDPOINTS_DATA_KEY, MON_MAPPING_KEY, MON_MAX_ID_KEY};

/// Monitor name to `ip:port`.
pub type MonEndpoints = BTreeMap<String, String>;

/// `name=ip:port` pairs joined by commas, in name order.
pub fn flatten(endpoints: &MonEndpoints) -> String {
    endpoints
        .iter()
        .map(|(name, endpoint)| format!("{name}={endpoint}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Inverse of [`flatten`]. Malformed entries are logged and dropped.
pub fn parse(input: &str) -> MonEndpoints {
    let mut endpoints = MonEndpoints::new();
    for raw in input.split(',').filter(|r| !r.is_empty()) {
        match raw.split('=').collect::<Vec<_>>()[..] {
            [name, endpoint] if !name.is_empty() && !endpoint.is_empty() => {
                endpoints.insert(name.to_string(), endpoint.to_string());
            }
            _ => warn!("ignoring invalid monitor {raw}"),
        }
    }
    endpoints
}

/// Just the addresses, for `mon host` and client access info.
/// Mons ordered by numeric id, so mon-10 follows mon-9. Unknown names last.
pub fn ordered(endpoints: &MonEndpoints) -> Vec<(&str, &str)> {
    let mut mons: Vec<(&str, &str)> = endpoints.iter().map(|(n, a)| (n.as_str(), a.as_str())).collect();
    mons.sort_by_key(|(name, _)| (mon_id(name).unwrap_or(i32::MAX), *name));
    mons
}

pub fn addresses(endpoints: &MonEndpoints) -> Vec<String> {
    ordered(endpoints).into_iter().map(|(_, addr)| addr.to_string()).collect()
}

pub fn mon_name(id: i32) -> String {
    format!("{MON_APP}-{id}")
}

/// Numeric id of a mon name, if it follows the naming scheme.
pub fn mon_id(name: &str) -> Option<i32> {
    name.strip_prefix(MON_APP)?.strip_prefix('-')?.parse().ok()
}

/// Which node each mon was placed on.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct MonMapping {
    #[serde(default)]
    pub node: BTreeMap<String, String>,
}

/// Everything the mon manager keeps in the endpoints config map.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PersistedMons {
    pub endpoints: MonEndpoints,
    /// Highest id ever handed out, -1 before the first mon.
    pub max_id: i32,
    pub mapping: MonMapping,
}

impl PersistedMons {
    pub fn empty() -> Self {
        PersistedMons {
            max_id: -1,
            ..Default::default()
        }
    }

    /// Reads the config map data. `maxMonId` never goes below an id already in use.
    pub fn from_data(data: &BTreeMap<String, String>) -> Self {
        let endpoints = data
            .get(MON_ENDPOINTS_DATA_KEY)
            .map(|d| parse(d))
            .unwrap_or_default();
        let mapping: MonMapping = data
            .get(MON_MAPPING_KEY)
            .and_then(|m| match serde_json::from_str(m) {
                Ok(mapping) => Some(mapping),
                Err(e) => {
                    warn!("ignoring unreadable mon mapping: {e}");
                    None
                }
            })
            .unwrap_or_default();
        let stored = data
            .get(MON_MAX_ID_KEY)
            .and_then(|v| v.parse::<i32>().ok())
            .unwrap_or(-1);
        let max_id = endpoints
            .keys()
            .chain(mapping.node.keys())
            .filter_map(|name| mon_id(name))
            .fold(stored, i32::max);
        PersistedMons {
            endpoints,
            max_id,
            mapping,
        }
    }

    pub fn to_data(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (MON_ENDPOINTS_DATA_KEY.to_string(), flatten(&self.endpoints)),
            (MON_MAX_ID_KEY.to_string(), self.max_id.to_string()),
            (
                MON_MAPPING_KEY.to_string(),
                serde_json::to_string(&self.mapping).unwrap_or_else(|_| "{}".to_string()),
            ),
        ])
    }

    /// Hands out the next id. Ids are never reused.
    pub fn allocate(&mut self) -> String {
        self.max_id += 1;
        mon_name(self.max_id)
    }

    /// Mons that were placed but never published an endpoint.
    pub fn pending(&self) -> Vec<(String, String)> {
        self.mapping
            .node
            .iter()
            .filter(|(name, _)| !self.endpoints.contains_key(*name))
            .map(|(name, node)| (name.clone(), node.clone()))
            .collect()
    }

    pub fn forget(&mut self, name: &str) {
        self.endpoints.remove(name);
        self.mapping.node.remove(name);
    }

    /// Nodes that already host a mon, placed or running.
    pub fn used_nodes(&self) -> Vec<String> {
        self.mapping.node.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn flatten_then_parse_is_identity() {
        let endpoints = MonEndpoints::from([
            ("rook-ceph-mon-0".to_string(), "10.0.0.1:6790".to_string()),
            ("rook-ceph-mon-1".to_string(), "10.0.0.2:6790".to_string()),
            ("rook-ceph-mon-2".to_string(), "10.0.0.3:6790".to_string()),
        ]);
        let flat = flatten(&endpoints);
        assert_eq!(
            flat,
            "rook-ceph-mon-0=10.0.0.1:6790,rook-ceph-mon-1=10.0.0.2:6790,rook-ceph-mon-2=10.0.0.3:6790"
        );
        assert_eq!(parse(&flat), endpoints);
    }

    #[rstest]
    #[case("", 0)]
    #[case("a=1.1.1.1:6790", 1)]
    #[case("a=1.1.1.1:6790,garbage,b=2.2.2.2:6790", 2)]
    #[case("a=b=c", 0)]
    fn parse_skips_invalid_entries(#[case] input: &str, #[case] count: usize) {
        assert_eq!(parse(input).len(), count);
    }

    #[rstest]
    #[case("rook-ceph-mon-0", Some(0))]
    #[case("rook-ceph-mon-12", Some(12))]
    #[case("rook-ceph-mon-a", None)]
    #[case("mon-1", None)]
    fn ids_come_from_names(#[case] name: &str, #[case] id: Option<i32>) {
        assert_eq!(mon_id(name), id);
    }

    #[test]
    fn max_id_never_goes_below_known_names() {
        let data = BTreeMap::from([
            ("data".to_string(), "rook-ceph-mon-4=10.0.0.1:6790".to_string()),
            ("maxMonId".to_string(), "2".to_string()),
        ]);
        let mut mons = PersistedMons::from_data(&data);
        assert_eq!(mons.max_id, 4);
        assert_eq!(mons.allocate(), "rook-ceph-mon-5");
    }

    #[test]
    fn config_map_data_round_trips() {
        let mut mons = PersistedMons::empty();
        let name = mons.allocate();
        mons.mapping.node.insert(name.clone(), "node1".into());
        mons.endpoints.insert(name, "10.0.0.1:6790".into());
        assert_eq!(PersistedMons::from_data(&mons.to_data()), mons);
    }

    #[test]
    fn placed_mons_without_endpoints_are_pending() {
        let mut mons = PersistedMons::empty();
        let first = mons.allocate();
        let second = mons.allocate();
        mons.mapping.node.insert(first.clone(), "node1".into());
        mons.mapping.node.insert(second.clone(), "node2".into());
        mons.endpoints.insert(first, "10.0.0.1:6790".into());
        assert_eq!(mons.pending(), vec![(second, "node2".to_string())]);
    }
}
