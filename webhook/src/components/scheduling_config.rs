/*
This file contains the resolution of a workload's
placement configuration: the labels declared by the
operator plus the declared replica count are turned
into the number of on-demand and spot replicas the
workload should converge to.
*/

use std::{
    collections::BTreeMap,
    fmt
};

use crate::utils::labels::{
    OPTIMIZE_SCHEDULING_CUSTOM_ON_DEMAND_KEY,
    OPTIMIZE_SCHEDULING_KEY,
    OPTIMIZE_SCHEDULING_STRATEGY_KEY,
    STRATEGY_ALL_IN_ON_DEMAND,
    STRATEGY_ALL_IN_SPOT,
    STRATEGY_CUSTOM,
    STRATEGY_MAJORITY_IN_ON_DEMAND
};



/*
Kind of a top-level workload.
Drives strategy defaulting.
*/
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadKind::Deployment => f.write_str("Deployment"),
            WorkloadKind::StatefulSet => f.write_str("StatefulSet"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulingStrategy {
    AllOnDemand,
    AllSpot,
    MajorityOnDemand,
    Custom,
}

impl SchedulingStrategy {
    pub fn from_label(value: &str) -> Option<Self> {
        match value {
            STRATEGY_ALL_IN_ON_DEMAND => Some(SchedulingStrategy::AllOnDemand),
            STRATEGY_ALL_IN_SPOT => Some(SchedulingStrategy::AllSpot),
            STRATEGY_MAJORITY_IN_ON_DEMAND => Some(SchedulingStrategy::MajorityOnDemand),
            STRATEGY_CUSTOM => Some(SchedulingStrategy::Custom),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulingStrategy::AllOnDemand => STRATEGY_ALL_IN_ON_DEMAND,
            SchedulingStrategy::AllSpot => STRATEGY_ALL_IN_SPOT,
            SchedulingStrategy::MajorityOnDemand => STRATEGY_MAJORITY_IN_ON_DEMAND,
            SchedulingStrategy::Custom => STRATEGY_CUSTOM,
        }
    }

    /*
    Strategy used when the workload does not name one:
    Deployments go to spot, a single-replica StatefulSet
    stays on on-demand, larger ones keep a majority there.
    */
    pub fn default_for(kind: WorkloadKind, replicas: i32) -> Self {
        match kind {
            WorkloadKind::Deployment => SchedulingStrategy::AllSpot,
            WorkloadKind::StatefulSet if replicas == 1 => SchedulingStrategy::AllOnDemand,
            WorkloadKind::StatefulSet => SchedulingStrategy::MajorityOnDemand,
        }
    }
}

impl fmt::Display for SchedulingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/*
Resolved placement configuration of a workload.

`strategy` is None only when the strategy label carries a
value outside the recognized set; targets are then (0, 0).
For Custom, `target_spot` is negative when the custom count
exceeds the replica count; every new replica then goes to
on-demand until `custom_on_demand` of them are placed.
*/
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct SchedulingConfiguration {
    pub enabled: bool,
    pub strategy: Option<SchedulingStrategy>,
    pub custom_on_demand: i32,
    pub target_on_demand: i32,
    pub target_spot: i32,
}

impl SchedulingConfiguration {
    pub fn disabled() -> Self {
        Self::default()
    }

    /*
    This function resolves the configuration of a workload
    out of its labels and declared replica count.
    It never fails: malformed values are the job of the
    validating webhook, here they degrade to no targets.
    */
    pub fn resolve(labels: Option<&BTreeMap<String, String>>, replicas: i32, kind: WorkloadKind) -> Self {
        let Some(labels) = labels else {
            return Self::disabled();
        };

        if labels.get(OPTIMIZE_SCHEDULING_KEY).map(String::as_str) != Some("true") {
            return Self::disabled();
        }

        let strategy = match labels.get(OPTIMIZE_SCHEDULING_STRATEGY_KEY) {
            Some(value) => SchedulingStrategy::from_label(value),
            None => Some(SchedulingStrategy::default_for(kind, replicas)),
        };

        // Parsed like the validating webhook does; counts past i32 saturate.
        let custom_on_demand = labels
            .get(OPTIMIZE_SCHEDULING_CUSTOM_ON_DEMAND_KEY)
            .and_then(|value| value.parse::<i64>().ok())
            .map(|value| i32::try_from(value.max(0)).unwrap_or(i32::MAX))
            .unwrap_or(0);

        let (target_on_demand, target_spot) = match strategy {
            Some(SchedulingStrategy::AllOnDemand) => (replicas, 0),
            Some(SchedulingStrategy::AllSpot) => (0, replicas),
            Some(SchedulingStrategy::MajorityOnDemand) => {
                let on_demand = replicas / 2 + 1;
                (on_demand, replicas - on_demand)
            }
            Some(SchedulingStrategy::Custom) => (custom_on_demand, replicas.saturating_sub(custom_on_demand)),
            None => (0, 0),
        };

        Self {
            enabled: true,
            strategy,
            custom_on_demand,
            target_on_demand,
            target_spot,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn enabled_with(strategy: &str) -> BTreeMap<String, String> {
        labels(&[
            (OPTIMIZE_SCHEDULING_KEY, "true"),
            (OPTIMIZE_SCHEDULING_STRATEGY_KEY, strategy),
        ])
    }

    #[test]
    fn missing_or_false_flag_disables() {
        assert_eq!(
            SchedulingConfiguration::resolve(None, 3, WorkloadKind::Deployment),
            SchedulingConfiguration::disabled()
        );

        let off = labels(&[
            (OPTIMIZE_SCHEDULING_KEY, "false"),
            (OPTIMIZE_SCHEDULING_STRATEGY_KEY, STRATEGY_ALL_IN_SPOT),
        ]);
        assert!(!SchedulingConfiguration::resolve(Some(&off), 3, WorkloadKind::Deployment).enabled);

        let shouting = labels(&[(OPTIMIZE_SCHEDULING_KEY, "TRUE")]);
        assert!(!SchedulingConfiguration::resolve(Some(&shouting), 3, WorkloadKind::Deployment).enabled);
    }

    #[test]
    fn all_in_on_demand_and_all_in_spot() {
        let config = SchedulingConfiguration::resolve(Some(&enabled_with("all-in-on-demand")), 3, WorkloadKind::Deployment);
        assert_eq!(config.strategy, Some(SchedulingStrategy::AllOnDemand));
        assert_eq!((config.target_on_demand, config.target_spot), (3, 0));

        let config = SchedulingConfiguration::resolve(Some(&enabled_with("all-in-spot")), 3, WorkloadKind::StatefulSet);
        assert_eq!((config.target_on_demand, config.target_spot), (0, 3));
    }

    #[test]
    fn majority_keeps_more_than_half_on_demand() {
        for (replicas, expected) in [(1, (1, 0)), (2, (2, 0)), (3, (2, 1)), (4, (3, 1)), (5, (3, 2))] {
            let config = SchedulingConfiguration::resolve(
                Some(&enabled_with("majority-in-on-demand")),
                replicas,
                WorkloadKind::Deployment,
            );
            assert_eq!((config.target_on_demand, config.target_spot), expected, "replicas={replicas}");
            assert_eq!(config.target_on_demand + config.target_spot, replicas);
        }
    }

    #[test]
    fn custom_count_may_exceed_replicas() {
        let mut custom = enabled_with("custom");
        custom.insert(OPTIMIZE_SCHEDULING_CUSTOM_ON_DEMAND_KEY.to_string(), "5".to_string());
        let config = SchedulingConfiguration::resolve(Some(&custom), 2, WorkloadKind::Deployment);
        assert_eq!(config.strategy, Some(SchedulingStrategy::Custom));
        assert_eq!(config.custom_on_demand, 5);
        assert_eq!((config.target_on_demand, config.target_spot), (5, -3));

        custom.insert(OPTIMIZE_SCHEDULING_CUSTOM_ON_DEMAND_KEY.to_string(), "1".to_string());
        let config = SchedulingConfiguration::resolve(Some(&custom), 4, WorkloadKind::Deployment);
        assert_eq!((config.target_on_demand, config.target_spot), (1, 3));
    }

    #[test]
    fn custom_without_usable_count_places_everything_on_spot() {
        let config = SchedulingConfiguration::resolve(Some(&enabled_with("custom")), 4, WorkloadKind::Deployment);
        assert_eq!((config.target_on_demand, config.target_spot), (0, 4));

        let mut negative = enabled_with("custom");
        negative.insert(OPTIMIZE_SCHEDULING_CUSTOM_ON_DEMAND_KEY.to_string(), "-2".to_string());
        let config = SchedulingConfiguration::resolve(Some(&negative), 4, WorkloadKind::Deployment);
        assert_eq!(config.custom_on_demand, 0);
    }

    #[test]
    fn huge_custom_count_saturates_instead_of_vanishing() {
        for count in ["3000000000", "5000000000", "+5000000000"] {
            let mut custom = enabled_with("custom");
            custom.insert(OPTIMIZE_SCHEDULING_CUSTOM_ON_DEMAND_KEY.to_string(), count.to_string());
            let config = SchedulingConfiguration::resolve(Some(&custom), 3, WorkloadKind::Deployment);
            assert_eq!(config.custom_on_demand, i32::MAX, "count={count}");
            assert_eq!(config.target_on_demand, i32::MAX);
            assert_eq!(config.target_spot, 3 - i32::MAX);
        }
    }

    #[test]
    fn unrecognized_strategy_has_no_targets() {
        let config = SchedulingConfiguration::resolve(Some(&enabled_with("half-and-half")), 4, WorkloadKind::Deployment);
        assert!(config.enabled);
        assert_eq!(config.strategy, None);
        assert_eq!((config.target_on_demand, config.target_spot), (0, 0));
    }

    #[test]
    fn strategy_defaults_by_workload_kind() {
        let only_flag = labels(&[(OPTIMIZE_SCHEDULING_KEY, "true")]);

        let deployment = SchedulingConfiguration::resolve(Some(&only_flag), 3, WorkloadKind::Deployment);
        assert_eq!(deployment.strategy, Some(SchedulingStrategy::AllSpot));
        assert_eq!((deployment.target_on_demand, deployment.target_spot), (0, 3));

        let single = SchedulingConfiguration::resolve(Some(&only_flag), 1, WorkloadKind::StatefulSet);
        assert_eq!(single.strategy, Some(SchedulingStrategy::AllOnDemand));
        assert_eq!((single.target_on_demand, single.target_spot), (1, 0));

        let many = SchedulingConfiguration::resolve(Some(&only_flag), 4, WorkloadKind::StatefulSet);
        assert_eq!(many.strategy, Some(SchedulingStrategy::MajorityOnDemand));
        assert_eq!((many.target_on_demand, many.target_spot), (3, 1));
    }
}
