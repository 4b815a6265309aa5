#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use rbac_query_proxy_core as core;
pub use rbac_query_proxy_k8s_api as k8s;
pub use rbac_query_proxy_k8s_informer as informer;
pub use rbac_query_proxy_transport as transport;

mod access;
mod args;
mod cache;
mod client;
mod legacy;
mod metrics;
mod proxy;
mod review;
mod server;

pub use self::{
    access::AccessResolver,
    args::Args,
    cache::{UserProjectCache, UserProjectEntry},
    legacy::{LegacyApi, OpenShiftApi},
    metrics::{Outcome, RequestMetrics},
    proxy::{Proxy, Upstream, FORWARDED_TOKEN, FORWARDED_USER},
    review::{HttpAccessReviewer, NoAccessReviewer},
    server::{serve, Router},
};
