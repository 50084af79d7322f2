/*
This file contains the pod mutation applied on creation:
the placement label is written on the pod and the matching
node affinity term is appended to its spec.
*/

use k8s_openapi::api::core::v1::{
    Affinity,
    NodeAffinity,
    NodeSelector,
    NodeSelectorRequirement,
    NodeSelectorTerm,
    Pod,
    PreferredSchedulingTerm
};
use serde_json::Value;

use crate::utils::labels::{
    NODE_CAPACITY_LABEL_KEY,
    ON_DEMAND,
    PLACEMENT_LABEL_KEY,
    SPOT,
    SPOT_PREFERENCE_WEIGHT,
    Placement
};



fn capacity_term(capacity: &str) -> NodeSelectorTerm {
    NodeSelectorTerm {
        match_expressions: Some(vec![NodeSelectorRequirement {
            key: NODE_CAPACITY_LABEL_KEY.to_string(),
            operator: "In".to_string(),
            values: Some(vec![capacity.to_string()]),
        }]),
        ..Default::default()
    }
}

/*
Hard requirement restricting the pod to on-demand nodes.
*/
pub fn require_on_demand_term() -> NodeSelectorTerm {
    capacity_term(ON_DEMAND)
}

/*
Soft preference toward spot nodes.
*/
pub fn prefer_spot_term() -> PreferredSchedulingTerm {
    PreferredSchedulingTerm {
        weight: SPOT_PREFERENCE_WEIGHT,
        preference: capacity_term(SPOT),
    }
}

pub fn has_placement_label(pod: &Pod) -> bool {
    pod.metadata
        .labels
        .as_ref()
        .is_some_and(|labels| labels.contains_key(PLACEMENT_LABEL_KEY))
}

/*
This function writes the placement on the pod.
Returns false and leaves the pod untouched for Unset or
when the pod already carries a placement label, so that a
repeated admission call never appends a second term.
*/
pub fn apply_placement(pod: &mut Pod, placement: Placement) -> bool {
    let Some(value) = placement.label_value() else {
        return false;
    };
    if has_placement_label(pod) {
        return false;
    }

    pod.metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(PLACEMENT_LABEL_KEY.to_string(), value.to_string());

    let node_affinity = pod
        .spec
        .get_or_insert_with(Default::default)
        .affinity
        .get_or_insert_with(Affinity::default)
        .node_affinity
        .get_or_insert_with(NodeAffinity::default);

    match placement {
        Placement::OnDemand => {
            // Required terms are OR'd: the existing ones are kept as they are.
            node_affinity
                .required_during_scheduling_ignored_during_execution
                .get_or_insert_with(|| NodeSelector {
                    node_selector_terms: Vec::new(),
                })
                .node_selector_terms
                .push(require_on_demand_term());
        }
        Placement::Spot => {
            node_affinity
                .preferred_during_scheduling_ignored_during_execution
                .get_or_insert_with(Vec::new)
                .push(prefer_spot_term());
        }
        Placement::Unset => {}
    }
    true
}

/*
This function returns the JSON patch turning the pod into
its placed version, None when there is nothing to change.
Both sides go through the same serializer, so the patch only
carries the label and affinity changes.
*/
pub fn placement_patch(pod: &Pod, placement: Placement) -> Result<Option<json_patch::Patch>, serde_json::Error> {
    let mut placed = pod.clone();
    if !apply_placement(&mut placed, placement) {
        return Ok(None);
    }

    let before: Value = serde_json::to_value(pod)?;
    let after: Value = serde_json::to_value(&placed)?;
    Ok(Some(json_patch::diff(&before, &after)))
}
