/*
This file contains the workload cache: the in-memory
state derived from Deployment, StatefulSet, ReplicaSet
and Pod notifications, and read by the placement decision.

All maps live behind a single mutex. Every notification
takes it once for its whole duration and nothing inside
the critical section performs I/O.
*/

use std::{
    collections::{
        BTreeMap,
        HashMap
    },
    sync::{
        Mutex,
        MutexGuard
    }
};
use k8s_openapi::{
    api::{
        apps::v1::{
            Deployment,
            ReplicaSet,
            StatefulSet
        },
        core::v1::Pod
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta
};
use tracing::{
    debug,
    error,
    trace
};

use crate::components::ownership::{
    resolve_group_parent,
    resolve_replica_parent,
    ReplicaParent,
    WorkloadKey
};
use crate::components::scheduling_config::{
    SchedulingConfiguration,
    WorkloadKind
};
use crate::utils::labels::Placement;



/*
A Deployment or StatefulSet as seen by the cache.
*/
pub trait TrackedWorkload {
    const KIND: WorkloadKind;

    fn metadata(&self) -> &ObjectMeta;

    /*
    Declared replica count; the API server
    defaults a missing value to 1.
    */
    fn declared_replicas(&self) -> i32;
}

impl TrackedWorkload for Deployment {
    const KIND: WorkloadKind = WorkloadKind::Deployment;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn declared_replicas(&self) -> i32 {
        self.spec.as_ref().and_then(|spec| spec.replicas).unwrap_or(1)
    }
}

impl TrackedWorkload for StatefulSet {
    const KIND: WorkloadKind = WorkloadKind::StatefulSet;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn declared_replicas(&self) -> i32 {
        self.spec.as_ref().and_then(|spec| spec.replicas).unwrap_or(1)
    }
}

/*
Last observed state of a Deployment or StatefulSet,
replaced wholesale on every update.
*/
#[derive(Clone, Debug, PartialEq)]
pub struct WorkloadRecord {
    pub kind: WorkloadKind,
    pub replicas: i32,
    pub labels: BTreeMap<String, String>,
    pub config: SchedulingConfiguration,
}

impl WorkloadRecord {
    pub fn from_workload<W: TrackedWorkload>(workload: &W) -> Self {
        let labels = workload.metadata().labels.clone().unwrap_or_default();
        let replicas = workload.declared_replicas();
        Self {
            kind: W::KIND,
            replicas,
            config: SchedulingConfiguration::resolve(Some(&labels), replicas, W::KIND),
            labels,
        }
    }
}

/*
Last observed state of a ReplicaSet. Only the
owning Deployment matters to placement.
*/
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicaGroupRecord {
    pub owner: Option<WorkloadKey>,
}

/*
Live placement of the pods directly owned by one
ReplicaSet or StatefulSet. The counters are an aggregate
of `replicas` and are only ever changed together with it.
*/
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkloadSchedulingInfo {
    on_demand_count: i32,
    spot_count: i32,
    replicas: HashMap<WorkloadKey, Placement>,
}

impl WorkloadSchedulingInfo {
    pub fn on_demand_count(&self) -> i32 {
        self.on_demand_count
    }

    pub fn spot_count(&self) -> i32 {
        self.spot_count
    }

    #[cfg(test)]
    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    #[cfg(test)]
    pub fn placement_of(&self, replica: &WorkloadKey) -> Option<Placement> {
        self.replicas.get(replica).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    fn adjust(&mut self, placement: Placement, delta: i32) {
        match placement {
            Placement::OnDemand => self.on_demand_count += delta,
            Placement::Spot => self.spot_count += delta,
            Placement::Unset => {}
        }
    }

    /*
    This function records the placement of a replica,
    superseding whatever was recorded for it before.
    */
    pub fn insert(&mut self, replica: WorkloadKey, placement: Placement) {
        if let Some(previous) = self.replicas.insert(replica, placement) {
            self.adjust(previous, -1);
        }
        self.adjust(placement, 1);
    }

    pub fn remove(&mut self, replica: &WorkloadKey) -> Option<Placement> {
        let removed = self.replicas.remove(replica)?;
        self.adjust(removed, -1);
        Some(removed)
    }

    /*
    This function checks that the counters match
    the per-replica placements they aggregate.
    */
    #[cfg(test)]
    pub fn is_consistent(&self) -> bool {
        let on_demand = self.replicas.values().filter(|p| **p == Placement::OnDemand).count();
        let spot = self.replicas.values().filter(|p| **p == Placement::Spot).count();
        on_demand as i32 == self.on_demand_count && spot as i32 == self.spot_count
    }
}

/*
Consistent view handed to the decision engine:
the target split of the owning workload plus the live
counts of the pod's direct parent.
*/
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub workload: WorkloadKey,
    pub kind: WorkloadKind,
    pub config: SchedulingConfiguration,
    pub on_demand_count: i32,
    pub spot_count: i32,
}

/*
Reasons a snapshot could not be taken. All but
SchedulingInfoMissing are expected while watches are
still converging.
*/
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheMiss {
    Untracked,
    GroupNotCached(WorkloadKey),
    GroupWithoutOwner(WorkloadKey),
    WorkloadNotCached(WorkloadKind, WorkloadKey),
    // The parent and its workload are cached but the parent has no scheduling info.
    SchedulingInfoMissing(ReplicaParent),
}

impl CacheMiss {
    /*
    Waiting cannot fix an invariant violation: the info of a
    cached parent is only ever created by the same events that
    cache it.
    */
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, CacheMiss::SchedulingInfoMissing(_))
    }
}

impl std::fmt::Display for CacheMiss {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheMiss::Untracked => f.write_str("pod has no tracked owner"),
            CacheMiss::GroupNotCached(key) => write!(f, "ReplicaSet {key} is not cached yet"),
            CacheMiss::GroupWithoutOwner(key) => write!(f, "ReplicaSet {key} has no owning Deployment"),
            CacheMiss::WorkloadNotCached(kind, key) => write!(f, "{kind} {key} is not cached yet"),
            CacheMiss::SchedulingInfoMissing(parent) => write!(f, "{parent} has no scheduling info"),
        }
    }
}

#[derive(Default)]
struct CacheState {
    deployments: HashMap<WorkloadKey, WorkloadRecord>,
    stateful_sets: HashMap<WorkloadKey, WorkloadRecord>,
    replica_sets: HashMap<WorkloadKey, ReplicaGroupRecord>,
    replica_set_scheduling: HashMap<WorkloadKey, WorkloadSchedulingInfo>,
    stateful_set_scheduling: HashMap<WorkloadKey, WorkloadSchedulingInfo>,
}

impl CacheState {
    fn workloads(&mut self, kind: WorkloadKind) -> &mut HashMap<WorkloadKey, WorkloadRecord> {
        match kind {
            WorkloadKind::Deployment => &mut self.deployments,
            WorkloadKind::StatefulSet => &mut self.stateful_sets,
        }
    }

    /*
    Scheduling info map of a direct pod parent, None for
    parents the cache does not track.
    */
    fn scheduling_map(&mut self, parent: &ReplicaParent) -> Option<(&mut HashMap<WorkloadKey, WorkloadSchedulingInfo>, WorkloadKey)> {
        match parent {
            ReplicaParent::ReplicaSet(key) => Some((&mut self.replica_set_scheduling, key.clone())),
            ReplicaParent::StatefulSet(key) => Some((&mut self.stateful_set_scheduling, key.clone())),
            ReplicaParent::None => None,
        }
    }

    fn add_workload<W: TrackedWorkload>(&mut self, workload: &W) {
        let key = WorkloadKey::from_meta(workload.metadata());
        let record = WorkloadRecord::from_workload(workload);
        trace!(kind = %W::KIND, workload = %key, config = ?record.config, "Caching workload");
        self.workloads(W::KIND).insert(key.clone(), record);

        // StatefulSets own their pods directly.
        if W::KIND == WorkloadKind::StatefulSet {
            self.stateful_set_scheduling.entry(key).or_default();
        }
    }

    fn delete_workload<W: TrackedWorkload>(&mut self, workload: &W) {
        let key = WorkloadKey::from_meta(workload.metadata());
        if self.workloads(W::KIND).remove(&key).is_none() {
            debug!(kind = %W::KIND, workload = %key, "Deleted workload was not cached");
        }
        if W::KIND == WorkloadKind::StatefulSet {
            drop_if_empty(&mut self.stateful_set_scheduling, &key);
        }
    }

    fn add_group(&mut self, replica_set: &ReplicaSet) {
        let key = WorkloadKey::from_meta(&replica_set.metadata);
        let owner = resolve_group_parent(replica_set);
        trace!(replica_set = %key, owner = ?owner, "Caching ReplicaSet");
        self.replica_sets.insert(key.clone(), ReplicaGroupRecord { owner });
        self.replica_set_scheduling.entry(key).or_default();
    }

    fn delete_group(&mut self, replica_set: &ReplicaSet) {
        let key = WorkloadKey::from_meta(&replica_set.metadata);
        self.replica_sets.remove(&key);
        drop_if_empty(&mut self.replica_set_scheduling, &key);
    }

    fn add_replica(&mut self, pod: &Pod) {
        let pod_key = WorkloadKey::from_meta(&pod.metadata);
        let parent = resolve_replica_parent(pod);
        let Some((map, parent_key)) = self.scheduling_map(&parent) else {
            trace!(pod = %pod_key, "Pod has no tracked owner, ignoring");
            return;
        };

        let placement = Placement::from_labels(pod.metadata.labels.as_ref());
        let info = map.entry(parent_key).or_default();
        info.insert(pod_key.clone(), placement);
        trace!(
            pod = %pod_key,
            parent = %parent,
            placement = %placement,
            on_demand = info.on_demand_count(),
            spot = info.spot_count(),
            "Tracked pod placement"
        );
    }

    fn delete_replica(&mut self, pod: &Pod) {
        let pod_key = WorkloadKey::from_meta(&pod.metadata);
        let parent = resolve_replica_parent(pod);
        let Some((map, parent_key)) = self.scheduling_map(&parent) else {
            return;
        };

        let removed = map.get_mut(&parent_key).and_then(|info| info.remove(&pod_key));
        if removed.is_none() {
            error!(pod = %pod_key, parent = %parent, "Deleted pod had no recorded placement");
            return;
        }

        // Nothing is tracked for this parent any more.
        if drop_if_empty(map, &parent_key) {
            debug!(parent = %parent, "Dropped scheduling info after last pod left");
        }
    }

    fn snapshot(&self, parent: &ReplicaParent) -> Result<Snapshot, CacheMiss> {
        let (kind, workload, info) = match parent {
            ReplicaParent::None => return Err(CacheMiss::Untracked),
            ReplicaParent::ReplicaSet(group) => {
                let record = self
                    .replica_sets
                    .get(group)
                    .ok_or_else(|| CacheMiss::GroupNotCached(group.clone()))?;
                let owner = record
                    .owner
                    .clone()
                    .ok_or_else(|| CacheMiss::GroupWithoutOwner(group.clone()))?;
                (WorkloadKind::Deployment, owner, self.replica_set_scheduling.get(group))
            }
            ReplicaParent::StatefulSet(key) => {
                (WorkloadKind::StatefulSet, key.clone(), self.stateful_set_scheduling.get(key))
            }
        };

        let records = match kind {
            WorkloadKind::Deployment => &self.deployments,
            WorkloadKind::StatefulSet => &self.stateful_sets,
        };
        let record = records
            .get(&workload)
            .ok_or_else(|| CacheMiss::WorkloadNotCached(kind, workload.clone()))?;

        let info = info.ok_or_else(|| CacheMiss::SchedulingInfoMissing(parent.clone()))?;

        Ok(Snapshot {
            workload,
            kind,
            config: record.config.clone(),
            on_demand_count: info.on_demand_count(),
            spot_count: info.spot_count(),
        })
    }
}

/*
This function removes the scheduling info stored under
`key` when it tracks no pods; returns whether it did.
*/
fn drop_if_empty(map: &mut HashMap<WorkloadKey, WorkloadSchedulingInfo>, key: &WorkloadKey) -> bool {
    if map.get(key).is_some_and(WorkloadSchedulingInfo::is_empty) {
        map.remove(key);
        return true;
    }
    false
}

/*
The cache service. Built once per process and shared
through an Arc with the informers and the webhook handlers.
*/
#[derive(Default)]
pub struct WorkloadCache {
    state: Mutex<CacheState>,
}

impl WorkloadCache {
    pub fn new() -> Self {
        Self::default()
    }

    /*
    A panic while holding the lock leaves maps that were only
    partially updated by one event; keep serving from them.
    */
    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn on_workload_add<W: TrackedWorkload>(&self, workload: &W) {
        self.lock().add_workload(workload);
    }

    pub fn on_workload_update<W: TrackedWorkload>(&self, old: &W, new: &W) {
        let mut state = self.lock();
        state.delete_workload(old);
        state.add_workload(new);
    }

    pub fn on_workload_delete<W: TrackedWorkload>(&self, workload: &W) {
        self.lock().delete_workload(workload);
    }

    pub fn on_group_add(&self, replica_set: &ReplicaSet) {
        self.lock().add_group(replica_set);
    }

    pub fn on_group_update(&self, old: &ReplicaSet, new: &ReplicaSet) {
        let mut state = self.lock();
        state.delete_group(old);
        state.add_group(new);
    }

    pub fn on_group_delete(&self, replica_set: &ReplicaSet) {
        self.lock().delete_group(replica_set);
    }

    pub fn on_replica_add(&self, pod: &Pod) {
        self.lock().add_replica(pod);
    }

    pub fn on_replica_update(&self, old: &Pod, new: &Pod) {
        let mut state = self.lock();
        state.delete_replica(old);
        state.add_replica(new);
    }

    pub fn on_replica_delete(&self, pod: &Pod) {
        self.lock().delete_replica(pod);
    }

    /*
    This function returns the placement view of the workload
    owning a pod with the given direct parent. The view is only
    valid at the instant the lock was held.
    */
    pub fn snapshot(&self, parent: &ReplicaParent) -> Result<Snapshot, CacheMiss> {
        self.lock().snapshot(parent)
    }

    #[cfg(test)]
    pub fn scheduling_info(&self, parent: &ReplicaParent) -> Option<WorkloadSchedulingInfo> {
        let state = self.lock();
        match parent {
            ReplicaParent::ReplicaSet(key) => state.replica_set_scheduling.get(key).cloned(),
            ReplicaParent::StatefulSet(key) => state.stateful_set_scheduling.get(key).cloned(),
            ReplicaParent::None => None,
        }
    }

    #[cfg(test)]
    pub fn workload(&self, kind: WorkloadKind, key: &WorkloadKey) -> Option<WorkloadRecord> {
        self.lock().workloads(kind).get(key).cloned()
    }

    pub fn workload_count(&self) -> usize {
        let state = self.lock();
        state.deployments.len() + state.stateful_sets.len()
    }

    #[cfg(test)]
    pub fn is_consistent(&self) -> bool {
        let state = self.lock();
        state
            .replica_set_scheduling
            .values()
            .chain(state.stateful_set_scheduling.values())
            .all(WorkloadSchedulingInfo::is_consistent)
    }
}
