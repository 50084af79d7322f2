/*
This file contains the ownership resolution helpers:
they map a pod to the object that directly owns it
(a ReplicaSet or a StatefulSet) and a ReplicaSet to
the Deployment that owns it.
*/

use std::fmt;
use k8s_openapi::{
    api::{
        apps::v1::ReplicaSet,
        core::v1::Pod
    },
    apimachinery::pkg::apis::meta::v1::{
        ObjectMeta,
        OwnerReference
    }
};



/*
Namespace/name pair identifying a workload,
a replica-group or a pod.
*/
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkloadKey {
    pub namespace: String,
    pub name: String,
}

impl WorkloadKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /*
    This function builds the key of an object out of its
    metadata. Objects without a name get an empty one (pods
    under admission often only carry a generateName).
    */
    pub fn from_meta(meta: &ObjectMeta) -> Self {
        Self::new(
            meta.namespace.clone().unwrap_or_default(),
            meta.name.clone().unwrap_or_default(),
        )
    }
}

impl fmt::Display for WorkloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/*
Direct parent of a pod, as far as placement is concerned.
Deployments own their pods through a ReplicaSet, StatefulSets
own them directly. Everything else is out of scope.
*/
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ReplicaParent {
    ReplicaSet(WorkloadKey),
    StatefulSet(WorkloadKey),
    None,
}

impl ReplicaParent {
    pub fn kind(&self) -> &'static str {
        match self {
            ReplicaParent::ReplicaSet(_) => "ReplicaSet",
            ReplicaParent::StatefulSet(_) => "StatefulSet",
            ReplicaParent::None => "None",
        }
    }
}

impl fmt::Display for ReplicaParent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicaParent::ReplicaSet(key) | ReplicaParent::StatefulSet(key) => {
                write!(f, "{} {}", self.kind(), key)
            }
            ReplicaParent::None => f.write_str("no tracked owner"),
        }
    }
}

fn owner_references(meta: &ObjectMeta) -> &[OwnerReference] {
    meta.owner_references.as_deref().unwrap_or_default()
}

/*
This function resolves the direct parent of a pod.
The first owner reference of a tracked kind wins.
`namespace` is the pod namespace; owner references
never cross namespaces.
*/
pub fn resolve_replica_parent_in(pod: &Pod, namespace: &str) -> ReplicaParent {
    for owner in owner_references(&pod.metadata) {
        match owner.kind.as_str() {
            "ReplicaSet" => return ReplicaParent::ReplicaSet(WorkloadKey::new(namespace, &owner.name)),
            "StatefulSet" => return ReplicaParent::StatefulSet(WorkloadKey::new(namespace, &owner.name)),
            _ => continue,
        }
    }
    ReplicaParent::None
}

pub fn resolve_replica_parent(pod: &Pod) -> ReplicaParent {
    let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
    resolve_replica_parent_in(pod, namespace)
}

/*
This function resolves the Deployment owning a ReplicaSet.
Returns None for standalone ReplicaSets.
*/
pub fn resolve_group_parent(replica_set: &ReplicaSet) -> Option<WorkloadKey> {
    let namespace = replica_set.metadata.namespace.as_deref().unwrap_or_default();
    owner_references(&replica_set.metadata)
        .iter()
        .find(|owner| owner.kind == "Deployment")
        .map(|owner| WorkloadKey::new(namespace, &owner.name))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn owner(kind: &str, name: &str) -> OwnerReference {
        OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            uid: format!("uid-{name}"),
            controller: Some(true),
            ..Default::default()
        }
    }

    fn pod_owned_by(owners: Vec<OwnerReference>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("web-abc12".to_string()),
                namespace: Some("shop".to_string()),
                owner_references: Some(owners),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn pod_owned_by_replica_set() {
        let pod = pod_owned_by(vec![owner("ReplicaSet", "web-5d8f")]);
        assert_eq!(
            resolve_replica_parent(&pod),
            ReplicaParent::ReplicaSet(WorkloadKey::new("shop", "web-5d8f"))
        );
    }

    #[test]
    fn pod_owned_by_stateful_set() {
        let pod = pod_owned_by(vec![owner("StatefulSet", "db")]);
        let parent = resolve_replica_parent(&pod);
        assert_eq!(parent, ReplicaParent::StatefulSet(WorkloadKey::new("shop", "db")));
        assert_eq!(parent.to_string(), "StatefulSet shop/db");
    }

    #[test]
    fn untracked_owner_kinds_are_skipped() {
        let pod = pod_owned_by(vec![owner("Job", "batch"), owner("StatefulSet", "db")]);
        assert_eq!(
            resolve_replica_parent(&pod),
            ReplicaParent::StatefulSet(WorkloadKey::new("shop", "db"))
        );

        let orphan = pod_owned_by(vec![owner("DaemonSet", "agent")]);
        assert_eq!(resolve_replica_parent(&orphan), ReplicaParent::None);

        let bare = Pod::default();
        assert_eq!(resolve_replica_parent(&bare), ReplicaParent::None);
    }

    #[test]
    fn explicit_namespace_overrides_missing_pod_namespace() {
        let mut pod = pod_owned_by(vec![owner("ReplicaSet", "web-5d8f")]);
        pod.metadata.namespace = None;
        assert_eq!(
            resolve_replica_parent_in(&pod, "shop"),
            ReplicaParent::ReplicaSet(WorkloadKey::new("shop", "web-5d8f"))
        );
    }

    #[test]
    fn replica_set_owned_by_deployment() {
        let replica_set = ReplicaSet {
            metadata: ObjectMeta {
                name: Some("web-5d8f".to_string()),
                namespace: Some("shop".to_string()),
                owner_references: Some(vec![owner("Deployment", "web")]),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(resolve_group_parent(&replica_set), Some(WorkloadKey::new("shop", "web")));

        let standalone = ReplicaSet {
            metadata: ObjectMeta {
                name: Some("lonely".to_string()),
                namespace: Some("shop".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(resolve_group_parent(&standalone), None);
    }
}
