use k8s_openapi::api::core::v1::{Node, NodeSelectorRequirement, NodeSelectorTerm, Taint, Toleration};

use crate::api::{constants::HOSTNAME_LABEL, v1::cluster::Placement};

fn tolerates(toleration: &Toleration, taint: &Taint) -> bool {
    if let Some(effect) = toleration.effect.as_deref() {
        if !effect.is_empty() && effect != taint.effect {
            return false;
        }
    }
    let key = toleration.key.as_deref().unwrap_or_default();
    match toleration.operator.as_deref().unwrap_or("Equal") {
        "Exists" => key.is_empty() || key == taint.key,
        _ => {
            key == taint.key
                && toleration.value.as_deref().unwrap_or_default()
                    == taint.value.as_deref().unwrap_or_default()
        }
    }
}

fn requirement_matches(req: &NodeSelectorRequirement, value: Option<&str>) -> bool {
    let values = req.values.as_deref().unwrap_or_default();
    match req.operator.as_str() {
        "In" => value.is_some_and(|v| values.iter().any(|x| x == v)),
        "NotIn" => value.is_none_or(|v| !values.iter().any(|x| x == v)),
        "Exists" => value.is_some(),
        "DoesNotExist" => value.is_none(),
        op @ ("Gt" | "Lt") => {
            let (Some(v), Some(bound)) = (
                value.and_then(|v| v.parse::<i64>().ok()),
                values.first().and_then(|b| b.parse::<i64>().ok()),
            ) else {
                return false;
            };
            if op == "Gt" {
                v > bound
            } else {
                v < bound
            }
        }
        _ => false,
    }
}

fn term_matches(term: &NodeSelectorTerm, node: &Node) -> bool {
    let labels = node.metadata.labels.clone().unwrap_or_default();
    let expressions = term.match_expressions.as_deref().unwrap_or_default();
    let fields = term.match_fields.as_deref().unwrap_or_default();
    if expressions.is_empty() && fields.is_empty() {
        return false;
    }
    expressions
        .iter()
        .all(|req| requirement_matches(req, labels.get(&req.key).map(String::as_str)))
        && fields.iter().all(|req| {
            let value = (req.key == "metadata.name")
                .then(|| node.metadata.name.as_deref())
                .flatten();
            requirement_matches(req, value)
        })
}

fn is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// A node a daemon with `placement` may run on: schedulable, ready, every
/// blocking taint tolerated, required node affinity satisfied.
pub fn valid_node(node: &Node, placement: &Placement) -> bool {
    let spec = node.spec.clone().unwrap_or_default();
    if spec.unschedulable.unwrap_or(false) || !is_ready(node) {
        return false;
    }

    let tolerations = placement.tolerations.as_deref().unwrap_or_default();
    let blocked = spec.taints.unwrap_or_default().iter().any(|taint| {
        (taint.effect == "NoSchedule" || taint.effect == "NoExecute")
            && !tolerations.iter().any(|t| tolerates(t, taint))
    });
    if blocked {
        return false;
    }

    match placement
        .node_affinity
        .as_ref()
        .and_then(|a| a.required_during_scheduling_ignored_during_execution.as_ref())
    {
        Some(selector) => selector
            .node_selector_terms
            .iter()
            .any(|term| term_matches(term, node)),
        None => true,
    }
}

/// The hostname label the daemons pin to, falling back to the node name.
pub fn hostname(node: &Node) -> Option<String> {
    node.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(HOSTNAME_LABEL).cloned())
        .or_else(|| node.metadata.name.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeAffinity, NodeCondition, NodeSelector, NodeSpec, NodeStatus};
    use kube::api::ObjectMeta;
    use rstest::rstest;
    use std::collections::BTreeMap;

    fn node(ready: bool, unschedulable: bool, taints: Vec<Taint>) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some("node1".into()),
                labels: Some(BTreeMap::from([
                    (HOSTNAME_LABEL.to_string(), "node1".to_string()),
                    ("zone".to_string(), "a".to_string()),
                ])),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                unschedulable: Some(unschedulable),
                taints: Some(taints),
                ..Default::default()
            }),
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".into(),
                    status: if ready { "True" } else { "False" }.into(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }

    fn taint(key: &str, effect: &str) -> Taint {
        Taint {
            key: key.into(),
            effect: effect.into(),
            ..Default::default()
        }
    }

    fn tolerate(key: &str) -> Placement {
        Placement {
            tolerations: Some(vec![Toleration {
                key: Some(key.into()),
                operator: Some("Exists".into()),
                ..Default::default()
            }]),
            ..Default::default()
        }
    }

    fn affinity(key: &str, values: &[&str]) -> Placement {
        Placement {
            node_affinity: Some(NodeAffinity {
                required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                    node_selector_terms: vec![NodeSelectorTerm {
                        match_expressions: Some(vec![NodeSelectorRequirement {
                            key: key.into(),
                            operator: "In".into(),
                            values: Some(values.iter().map(|v| v.to_string()).collect()),
                        }]),
                        match_fields: None,
                    }],
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[rstest]
    #[case(node(true, false, vec![]), Placement::default(), true)]
    #[case(node(false, false, vec![]), Placement::default(), false)]
    #[case(node(true, true, vec![]), Placement::default(), false)]
    #[case(node(true, false, vec![taint("storage", "NoSchedule")]), Placement::default(), false)]
    #[case(node(true, false, vec![taint("storage", "NoSchedule")]), tolerate("storage"), true)]
    #[case(node(true, false, vec![taint("storage", "PreferNoSchedule")]), Placement::default(), true)]
    #[case(node(true, false, vec![]), affinity("zone", &["a"]), true)]
    #[case(node(true, false, vec![]), affinity("zone", &["b"]), false)]
    fn node_validity(#[case] node: Node, #[case] placement: Placement, #[case] valid: bool) {
        assert_eq!(valid_node(&node, &placement), valid);
    }
}
