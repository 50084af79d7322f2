/*
This file contains the placement decision engine.
For a pod under admission it finds the owning workload,
reads its target split and live counts from the cache and
picks on-demand first, then spot, then no opinion.
The cache may lag behind the admission request, so the
lookup is retried for a short, bounded time.
*/

use std::sync::Arc;
use k8s_openapi::api::core::v1::Pod;
use tracing::{
    debug,
    error,
    warn
};

use crate::components::ownership::{
    resolve_replica_parent_in,
    ReplicaParent
};
use crate::components::workload_cache::{
    Snapshot,
    WorkloadCache
};
use crate::utils::labels::Placement;
use crate::utils::retry::{
    retry_bounded,
    Attempt,
    RetryPolicy,
    Sleeper,
    TokioSleeper
};



/*
This function applies the greedy allocation rule to a snapshot:
on-demand capacity is handed out before spot capacity, and once
both targets are met new pods get no placement.
*/
pub fn decide_from_snapshot(snapshot: &Snapshot) -> Placement {
    let config = &snapshot.config;
    if !config.enabled {
        return Placement::Unset;
    }
    if snapshot.on_demand_count < config.target_on_demand {
        return Placement::OnDemand;
    }
    if snapshot.spot_count < config.target_spot {
        return Placement::Spot;
    }
    Placement::Unset
}

/*
Decision engine. Never mutates the cache.
*/
pub struct DecisionEngine<S = TokioSleeper> {
    cache: Arc<WorkloadCache>,
    policy: RetryPolicy,
    sleeper: S,
}

impl DecisionEngine<TokioSleeper> {
    pub fn new(cache: Arc<WorkloadCache>, policy: RetryPolicy) -> Self {
        Self::with_sleeper(cache, policy, TokioSleeper)
    }
}

impl<S: Sleeper> DecisionEngine<S> {
    pub fn with_sleeper(cache: Arc<WorkloadCache>, policy: RetryPolicy, sleeper: S) -> Self {
        Self {
            cache,
            policy,
            sleeper,
        }
    }

    /*
    This function decides the placement of a new pod.
    `namespace` is the namespace the pod is created in, which
    the decoded pod may not carry yet at admission time.
    */
    pub async fn decide(&self, pod: &Pod, namespace: &str) -> Placement {
        let parent = resolve_replica_parent_in(pod, namespace);
        let pod_name = pod
            .metadata
            .name
            .as_deref()
            .or(pod.metadata.generate_name.as_deref())
            .unwrap_or_default();

        if parent == ReplicaParent::None {
            debug!(namespace = %namespace, pod = %pod_name, "Pod has no tracked owner, no placement");
            return Placement::Unset;
        }

        let outcome = retry_bounded(&self.policy, &self.sleeper, "placement-decision", || {
            match self.cache.snapshot(&parent) {
                Ok(snapshot) => Attempt::Done(Ok(snapshot)),
                Err(miss) if miss.is_invariant_violation() => Attempt::Done(Err(miss)),
                Err(miss) => Attempt::Retry(miss.to_string()),
            }
        })
        .await;

        match outcome {
            Ok(Ok(snapshot)) => {
                let placement = decide_from_snapshot(&snapshot);
                debug!(
                    namespace = %namespace,
                    pod = %pod_name,
                    workload = %snapshot.workload,
                    kind = %snapshot.kind,
                    strategy = ?snapshot.config.strategy,
                    target_on_demand = snapshot.config.target_on_demand,
                    target_spot = snapshot.config.target_spot,
                    on_demand = snapshot.on_demand_count,
                    spot = snapshot.spot_count,
                    placement = %placement,
                    "Decided pod placement"
                );
                placement
            }
            Ok(Err(miss)) => {
                error!(
                    namespace = %namespace,
                    pod = %pod_name,
                    parent = %parent,
                    reason = %miss,
                    "Scheduling info missing for a cached workload, leaving placement unset"
                );
                Placement::Unset
            }
            Err(exhausted) => {
                warn!(
                    namespace = %namespace,
                    pod = %pod_name,
                    parent = %parent,
                    attempts = exhausted.attempts,
                    reason = %exhausted.last_reason,
                    "Cache did not converge in time, leaving placement unset"
                );
                Placement::Unset
            }
        }
    }
}
