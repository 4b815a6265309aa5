#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod allowlist;
pub mod managed_cluster;

pub use self::{
    allowlist::{Error, ALLOWLIST_KEY},
    managed_cluster::{ManagedCluster, ManagedClusterSpec},
};
pub use k8s_openapi::api::core::v1::ConfigMap;
pub use kube::{
    api::{Api, ObjectMeta, PostParams},
    runtime::watcher,
    Client, ResourceExt,
};
