/*
This file contains the component in charge of
collecting Deployment, StatefulSet, ReplicaSet and Pod
events from the cluster and delivering them to the
workload cache as add / update / delete notifications.

One watcher task runs per kind. The first full list
received by a watcher marks that kind as synced.
*/

use std::{
    collections::HashMap,
    fmt::Debug,
    sync::Arc,
    time::Duration
};
use futures::StreamExt;
use k8s_openapi::api::{
    apps::v1::{
        Deployment,
        ReplicaSet,
        StatefulSet
    },
    core::v1::Pod
};
use kube::{
    Api,
    Client,
    Resource,
    runtime::watcher::{
        watcher,
        Config,
        Event
    }
};
use serde::de::DeserializeOwned;
use tokio::{
    sync::watch,
    task::JoinHandle
};
use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    error,
    info,
    warn
};

use crate::components::ownership::WorkloadKey;
use crate::components::workload_cache::WorkloadCache;



// Pause before polling a watcher again after it reported an error.
const WATCH_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/*
Receiver of object notifications for one kind.
*/
pub trait ResourceEventHandler<K>: Send + Sync {
    fn on_add(&self, obj: &K);
    fn on_update(&self, old: &K, new: &K);
    fn on_delete(&self, obj: &K);
}

impl ResourceEventHandler<Deployment> for WorkloadCache {
    fn on_add(&self, obj: &Deployment) {
        self.on_workload_add(obj);
    }

    fn on_update(&self, old: &Deployment, new: &Deployment) {
        self.on_workload_update(old, new);
    }

    fn on_delete(&self, obj: &Deployment) {
        self.on_workload_delete(obj);
    }
}

impl ResourceEventHandler<StatefulSet> for WorkloadCache {
    fn on_add(&self, obj: &StatefulSet) {
        self.on_workload_add(obj);
    }

    fn on_update(&self, old: &StatefulSet, new: &StatefulSet) {
        self.on_workload_update(old, new);
    }

    fn on_delete(&self, obj: &StatefulSet) {
        self.on_workload_delete(obj);
    }
}

impl ResourceEventHandler<ReplicaSet> for WorkloadCache {
    fn on_add(&self, obj: &ReplicaSet) {
        self.on_group_add(obj);
    }

    fn on_update(&self, old: &ReplicaSet, new: &ReplicaSet) {
        self.on_group_update(old, new);
    }

    fn on_delete(&self, obj: &ReplicaSet) {
        self.on_group_delete(obj);
    }
}

impl ResourceEventHandler<Pod> for WorkloadCache {
    fn on_add(&self, obj: &Pod) {
        self.on_replica_add(obj);
    }

    fn on_update(&self, old: &Pod, new: &Pod) {
        self.on_replica_update(old, new);
    }

    fn on_delete(&self, obj: &Pod) {
        self.on_replica_delete(obj);
    }
}

/*
Last seen object per key for one watched kind.
Turns the watcher's Applied / Deleted / Restarted events
into add / update / delete notifications.
*/
pub struct InformerState<K> {
    known: HashMap<WorkloadKey, K>,
    synced: bool,
}

impl<K> Default for InformerState<K> {
    fn default() -> Self {
        Self {
            known: HashMap::new(),
            synced: false,
        }
    }
}

impl<K: Resource + Clone> InformerState<K> {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    fn upsert<H: ResourceEventHandler<K> + ?Sized>(&mut self, obj: K, handler: &H) {
        let key = WorkloadKey::from_meta(obj.meta());
        match self.known.get(&key) {
            Some(old) => handler.on_update(old, &obj),
            None => handler.on_add(&obj),
        }
        self.known.insert(key, obj);
    }

    fn remove<H: ResourceEventHandler<K> + ?Sized>(&mut self, obj: K, handler: &H) {
        let key = WorkloadKey::from_meta(obj.meta());
        // The last seen state is what the cache recorded.
        let last_seen = self.known.remove(&key).unwrap_or(obj);
        handler.on_delete(&last_seen);
    }

    /*
    This function dispatches one watcher event to the handler.
    Returns true when the event completed the initial sync.
    */
    pub fn apply<H: ResourceEventHandler<K> + ?Sized>(&mut self, event: Event<K>, handler: &H) -> bool {
        match event {
            Event::Applied(obj) => self.upsert(obj, handler),
            Event::Deleted(obj) => self.remove(obj, handler),
            Event::Restarted(objects) => {
                /*
                A restart carries the full list: whatever we knew
                that is no longer listed was deleted while the watch
                was down.
                */
                let listed: HashMap<WorkloadKey, K> = objects
                    .into_iter()
                    .map(|obj| (WorkloadKey::from_meta(obj.meta()), obj))
                    .collect();
                let vanished: Vec<WorkloadKey> = self
                    .known
                    .keys()
                    .filter(|key| !listed.contains_key(*key))
                    .cloned()
                    .collect();
                for key in vanished {
                    if let Some(obj) = self.known.remove(&key) {
                        handler.on_delete(&obj);
                    }
                }
                for obj in listed.into_values() {
                    self.upsert(obj, handler);
                }
                if !self.synced {
                    self.synced = true;
                    return true;
                }
            }
        }
        false
    }
}

/*
This function runs the watcher of one kind until the
stream ends or cancellation is requested.
*/
pub async fn run_informer<K, H>(
    kind: &'static str,
    api: Api<K>,
    handler: Arc<H>,
    synced: watch::Sender<bool>,
    cancel: CancellationToken,
) where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default,
    H: ResourceEventHandler<K> + ?Sized + 'static,
{
    let mut state = InformerState::<K>::new();
    let mut events = watcher(api, Config::default()).boxed();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(kind = kind, "Informer cancelled");
                break;
            }
            next = events.next() => match next {
                Some(Ok(event)) => {
                    if state.apply(event, handler.as_ref()) {
                        info!(kind = kind, objects = state.len(), "Informer synced");
                        let _ = synced.send(true);
                    }
                }
                Some(Err(e)) => {
                    warn!(kind = kind, error = %e, "Watch error, will retry");
                    tokio::time::sleep(WATCH_ERROR_BACKOFF).await;
                }
                None => {
                    error!(kind = kind, "Watch stream ended");
                    break;
                }
            }
        }
    }
}

/*
Outcome of waiting for the initial sync.
*/
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub unsynced: Vec<&'static str>,
    pub cancelled: bool,
}

impl SyncReport {
    pub fn is_complete(&self) -> bool {
        self.unsynced.is_empty() && !self.cancelled
    }
}

/*
Running informers and their sync flags.
*/
pub struct Informers {
    syncs: Vec<(&'static str, watch::Receiver<bool>)>,
    handles: Vec<JoinHandle<()>>,
}

impl Informers {
    fn spawn<K>(
        &mut self,
        kind: &'static str,
        api: Api<K>,
        cache: Arc<WorkloadCache>,
        cancel: &CancellationToken,
    ) where
        K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
        K::DynamicType: Default,
        WorkloadCache: ResourceEventHandler<K>,
    {
        let (tx, rx) = watch::channel(false);
        self.syncs.push((kind, rx));
        self.handles.push(tokio::spawn(run_informer(kind, api, cache, tx, cancel.clone())));
    }

    /*
    This function starts one informer per tracked kind,
    all feeding the same cache.
    */
    pub fn start(client: Client, cache: Arc<WorkloadCache>, cancel: &CancellationToken) -> Self {
        let mut informers = Self {
            syncs: Vec::new(),
            handles: Vec::new(),
        };
        informers.spawn("Deployment", Api::<Deployment>::all(client.clone()), cache.clone(), cancel);
        informers.spawn("StatefulSet", Api::<StatefulSet>::all(client.clone()), cache.clone(), cancel);
        informers.spawn("ReplicaSet", Api::<ReplicaSet>::all(client.clone()), cache.clone(), cancel);
        informers.spawn("Pod", Api::<Pod>::all(client), cache, cancel);
        informers
    }

    /*
    This function waits until every informer has synced, the
    timeout elapses or cancellation is requested. Kinds that did
    not sync are reported, never treated as fatal.
    */
    pub async fn wait_for_sync(&self, timeout: Duration, cancel: &CancellationToken) -> SyncReport {
        let mut receivers: Vec<watch::Receiver<bool>> = self.syncs.iter().map(|(_, rx)| rx.clone()).collect();
        let all_synced = futures::future::join_all(receivers.iter_mut().map(|rx| async move {
            // An informer that exited without syncing ends the wait too.
            let _ = rx.wait_for(|synced| *synced).await;
        }));

        tokio::select! {
            _ = all_synced => {}
            _ = tokio::time::sleep(timeout) => {}
            _ = cancel.cancelled() => {}
        }

        SyncReport {
            unsynced: self
                .syncs
                .iter()
                .filter(|(_, rx)| !*rx.borrow())
                .map(|(kind, _)| *kind)
                .collect(),
            cancelled: cancel.is_cancelled(),
        }
    }

    pub fn handles(self) -> Vec<JoinHandle<()>> {
        self.handles
    }
}

/*
This function starts the informers and blocks until the
initial resync is done (or cancelled, or timed out). Sync
failures are logged and start-up goes on with a partial cache.
*/
pub async fn run_cache(
    client: Client,
    cache: Arc<WorkloadCache>,
    sync_timeout: Duration,
    cancel: &CancellationToken,
) -> Informers {
    let informers = Informers::start(client, cache.clone(), cancel);
    let report = informers.wait_for_sync(sync_timeout, cancel).await;

    if report.cancelled {
        warn!("Initial cache sync cancelled");
    }
    for kind in &report.unsynced {
        error!(kind = kind, "Cache failed to sync");
    }
    if report.is_complete() {
        info!(workloads = cache.workload_count(), "Workload cache synced");
    }

    informers
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use crate::components::ownership::ReplicaParent;
    use crate::components::workload_cache::tests::{
        pod,
        NS
    };

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    fn placement_of(pod: &Pod) -> String {
        pod.metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.values().next().cloned())
            .unwrap_or_else(|| "none".to_string())
    }

    impl ResourceEventHandler<Pod> for Recorder {
        fn on_add(&self, obj: &Pod) {
            self.calls.lock().unwrap().push(format!("add {}", obj.metadata.name.as_deref().unwrap_or_default()));
        }

        fn on_update(&self, old: &Pod, new: &Pod) {
            self.calls.lock().unwrap().push(format!(
                "update {} {}->{}",
                new.metadata.name.as_deref().unwrap_or_default(),
                placement_of(old),
                placement_of(new)
            ));
        }

        fn on_delete(&self, obj: &Pod) {
            self.calls.lock().unwrap().push(format!(
                "delete {} {}",
                obj.metadata.name.as_deref().unwrap_or_default(),
                placement_of(obj)
            ));
        }
    }

    #[test]
    fn applied_events_become_add_then_update() {
        let recorder = Recorder::default();
        let mut state = InformerState::new();

        state.apply(Event::Applied(pod("web-1", "ReplicaSet", "web-rs", None)), &recorder);
        state.apply(Event::Applied(pod("web-1", "ReplicaSet", "web-rs", Some("spot"))), &recorder);
        state.apply(Event::Deleted(pod("web-1", "ReplicaSet", "web-rs", None)), &recorder);

        assert_eq!(
            recorder.calls(),
            vec!["add web-1", "update web-1 none->spot", "delete web-1 spot"]
        );
        assert_eq!(state.len(), 0);
    }

    #[test]
    fn restart_deletes_vanished_objects_and_marks_sync_once() {
        let recorder = Recorder::default();
        let mut state = InformerState::new();

        let first = state.apply(
            Event::Restarted(vec![
                pod("web-1", "ReplicaSet", "web-rs", None),
                pod("web-2", "ReplicaSet", "web-rs", None),
            ]),
            &recorder,
        );
        assert!(first);
        assert!(state.is_synced());

        let second = state.apply(
            Event::Restarted(vec![pod("web-2", "ReplicaSet", "web-rs", Some("on-demand"))]),
            &recorder,
        );
        assert!(!second);

        let calls = recorder.calls();
        assert_eq!(calls.len(), 4);
        assert!(calls[..2].contains(&"add web-1".to_string()));
        assert!(calls[..2].contains(&"add web-2".to_string()));
        assert_eq!(calls[2], "delete web-1 none");
        assert_eq!(calls[3], "update web-2 none->on-demand");
    }

    #[test]
    fn events_flow_into_the_workload_cache() {
        let cache = WorkloadCache::new();
        let mut state = InformerState::new();

        state.apply(
            Event::Restarted(vec![
                pod("db-0", "StatefulSet", "db", Some("on-demand")),
                pod("db-1", "StatefulSet", "db", Some("spot")),
            ]),
            &cache,
        );
        // Relabel db-1 (update) then drop db-0 while the watch was down.
        state.apply(Event::Restarted(vec![pod("db-1", "StatefulSet", "db", Some("on-demand"))]), &cache);

        let parent = ReplicaParent::StatefulSet(WorkloadKey::new(NS, "db"));
        let info = cache.scheduling_info(&parent).unwrap();
        assert_eq!((info.on_demand_count(), info.spot_count()), (1, 0));
        assert_eq!(info.replica_count(), 1);
        assert!(cache.is_consistent());
    }

    fn informers_with(flags: &[(&'static str, bool)]) -> (Informers, Vec<watch::Sender<bool>>) {
        let mut senders = Vec::new();
        let mut syncs = Vec::new();
        for (kind, synced) in flags {
            let (tx, rx) = watch::channel(*synced);
            senders.push(tx);
            syncs.push((*kind, rx));
        }
        (
            Informers {
                syncs,
                handles: Vec::new(),
            },
            senders,
        )
    }

    #[tokio::test]
    async fn wait_returns_once_every_kind_synced() {
        let (informers, senders) = informers_with(&[("Deployment", false), ("Pod", false)]);
        let cancel = CancellationToken::new();

        tokio::spawn(async move {
            for tx in senders {
                tx.send(true).unwrap();
                tokio::task::yield_now().await;
            }
        });

        let report = informers.wait_for_sync(Duration::from_secs(5), &cancel).await;
        assert!(report.is_complete(), "{report:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_reports_unsynced_kinds_without_failing() {
        let (informers, _senders) = informers_with(&[("Deployment", true), ("Pod", false)]);
        let cancel = CancellationToken::new();

        let report = informers.wait_for_sync(Duration::from_secs(2), &cancel).await;
        assert_eq!(report.unsynced, vec!["Pod"]);
        assert!(!report.cancelled);
    }

    #[tokio::test]
    async fn cancellation_ends_the_wait() {
        let (informers, _senders) = informers_with(&[("ReplicaSet", false)]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = informers.wait_for_sync(Duration::from_secs(60), &cancel).await;
        assert!(report.cancelled);
        assert_eq!(report.unsynced, vec!["ReplicaSet"]);
    }
}
