/*
This file contains the label keys and values shared
by the placement webhook: the operator-facing workload
configuration, the placement label written on pods and
the node capacity label the injected affinity points at.
*/

use std::{
    collections::BTreeMap,
    fmt
};



/*
Workload configuration labels, carried on
Deployment and StatefulSet metadata.
*/

// Whether optimized placement is enabled for the workload. Must be a boolean.
pub const OPTIMIZE_SCHEDULING_KEY: &str = "vacant.sh/optimize-scheduling";

// Allocation strategy, one of the STRATEGY_* values below.
pub const OPTIMIZE_SCHEDULING_STRATEGY_KEY: &str = "vacant.sh/optimize-scheduling-strategy";

// Minimum number of on-demand replicas when the strategy is "custom".
pub const OPTIMIZE_SCHEDULING_CUSTOM_ON_DEMAND_KEY: &str =
    "vacant.sh/optimize-scheduling-strategy-custom-on-demand";

pub const STRATEGY_ALL_IN_ON_DEMAND: &str = "all-in-on-demand";
pub const STRATEGY_ALL_IN_SPOT: &str = "all-in-spot";
pub const STRATEGY_MAJORITY_IN_ON_DEMAND: &str = "majority-in-on-demand";
pub const STRATEGY_CUSTOM: &str = "custom";

pub const STRATEGIES: [&str; 4] = [
    STRATEGY_ALL_IN_ON_DEMAND,
    STRATEGY_ALL_IN_SPOT,
    STRATEGY_MAJORITY_IN_ON_DEMAND,
    STRATEGY_CUSTOM,
];

/*
Placement label written by the mutating webhook.
Once set on a pod it can never change.
*/
pub const PLACEMENT_LABEL_KEY: &str = "vacant.sh/affinity";

/*
Node capacity label, read by the cluster scheduler
through the injected node affinity terms.
*/
pub const NODE_CAPACITY_LABEL_KEY: &str = "node.kubernetes.io/capacity";

// Weight of the injected spot preference term.
pub const SPOT_PREFERENCE_WEIGHT: i32 = 10;

/*
Placement of a pod. OnDemand and Spot double as the
placement label values and the node capacity label values;
Unset means the pod carries no (recognized) placement label.
*/
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum Placement {
    OnDemand,
    Spot,
    #[default]
    Unset,
}

pub const ON_DEMAND: &str = "on-demand";
pub const SPOT: &str = "spot";

impl Placement {
    /*
    This function returns the label value of the placement,
    None for Unset since it is never written anywhere.
    */
    pub fn label_value(&self) -> Option<&'static str> {
        match self {
            Placement::OnDemand => Some(ON_DEMAND),
            Placement::Spot => Some(SPOT),
            Placement::Unset => None,
        }
    }

    pub fn from_label(value: &str) -> Self {
        match value {
            ON_DEMAND => Placement::OnDemand,
            SPOT => Placement::Spot,
            _ => Placement::Unset,
        }
    }

    /*
    This function reads the placement of a pod out of
    its labels; missing or unknown values are Unset.
    */
    pub fn from_labels(labels: Option<&BTreeMap<String, String>>) -> Self {
        labels
            .and_then(|labels| labels.get(PLACEMENT_LABEL_KEY))
            .map(|value| Placement::from_label(value))
            .unwrap_or(Placement::Unset)
    }
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label_value().unwrap_or("unset"))
    }
}
