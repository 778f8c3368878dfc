//! Colony core types: resource endpoints, GVK keys, label keys and the store error taxonomy.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

pub use kube::core::GroupVersionKind;

pub mod error;
pub mod kinds;

pub use error::StoreError;

/// Label keys used to correlate credentials, jobs and workflows of one run.
pub mod labels {
    /// Carried by credential records; value is the host (BMC IP) they authenticate.
    pub const NAME: &str = "colony.konstruct.io/name";
    /// Attached to a credential record once its hardware has been discovered.
    pub const HARDWARE_ID: &str = "colony.konstruct.io/hardware-id";
    /// Per-step correlation token on power jobs and workflows.
    pub const JOB_ID: &str = "colony.konstruct.io/job-id";
    /// Host token a discovered hardware record is tagged with.
    pub const HOST: &str = "colony.konstruct.io/host";
}

/// Addressable collection for one served group/version/kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceEndpoint {
    pub group: String,
    pub version: String,
    pub kind: String,
    /// Plural resource name used in collection paths (e.g. `machines`).
    pub plural: String,
    pub namespaced: bool,
}

impl ResourceEndpoint {
    pub fn new(gvk: &GroupVersionKind, plural: &str, namespaced: bool) -> Self {
        Self {
            group: gvk.group.clone(),
            version: gvk.version.clone(),
            kind: gvk.kind.clone(),
            plural: plural.to_string(),
            namespaced,
        }
    }

    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(&self.group, &self.version, &self.kind)
    }

    pub fn api_version(&self) -> String {
        api_version(&self.gvk())
    }

    pub fn gvk_key(&self) -> String {
        gvk_key(&self.gvk())
    }
}

/// Render a GVK as `v1/Kind` or `group/v1/Kind`.
pub fn gvk_key(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}

pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind, StoreError> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind::gvk("", version, kind)),
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind::gvk(group, version, kind)),
        _ => Err(StoreError::Invalid(format!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key))),
    }
}

/// The `apiVersion` field for a GVK: `v1` for the core group, `group/v1` otherwise.
pub fn api_version(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() { gvk.version.clone() } else { format!("{}/{}", gvk.group, gvk.version) }
}

/// Split an `apiVersion` field into `(group, version)`; the core group is empty.
pub fn split_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Normalize a host identifier into a name/label-safe token (`10.0.10.5` -> `10-0-10-5`).
pub fn host_token(host: &str) -> String {
    host.trim().replace(['.', ':'], "-").to_ascii_lowercase()
}

pub fn label_selector(key: &str, value: &str) -> String {
    format!("{}={}", key, value)
}
