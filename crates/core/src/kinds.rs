//! Well-known resource kinds the orchestrator drives.

use crate::{GroupVersionKind, ResourceEndpoint};

pub const BMC_GROUP: &str = "bmc.tinkerbell.org";
pub const TINK_GROUP: &str = "tinkerbell.org";

pub fn secret() -> GroupVersionKind { GroupVersionKind::gvk("", "v1", "Secret") }
pub fn deployment() -> GroupVersionKind { GroupVersionKind::gvk("apps", "v1", "Deployment") }
pub fn machine() -> GroupVersionKind { GroupVersionKind::gvk(BMC_GROUP, "v1alpha1", "Machine") }
pub fn power_job() -> GroupVersionKind { GroupVersionKind::gvk(BMC_GROUP, "v1alpha1", "Job") }
pub fn hardware() -> GroupVersionKind { GroupVersionKind::gvk(TINK_GROUP, "v1alpha1", "Hardware") }
pub fn workflow() -> GroupVersionKind { GroupVersionKind::gvk(TINK_GROUP, "v1alpha1", "Workflow") }

/// Static discovery snapshot covering the kinds above (all namespace-scoped).
pub fn fleet_endpoints() -> Vec<ResourceEndpoint> {
    vec![
        ResourceEndpoint::new(&secret(), "secrets", true),
        ResourceEndpoint::new(&deployment(), "deployments", true),
        ResourceEndpoint::new(&machine(), "machines", true),
        ResourceEndpoint::new(&power_job(), "jobs", true),
        ResourceEndpoint::new(&hardware(), "hardware", true),
        ResourceEndpoint::new(&workflow(), "workflows", true),
    ]
}
