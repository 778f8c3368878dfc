//! Orchestrator settings with `COLONY_*` environment overrides.

use std::time::Duration;

/// Timeouts, poll intervals and names used by every provisioning run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionConfig {
    /// Namespace holding credentials, machines, jobs, hardware and workflows.
    pub namespace: String,
    pub job_timeout: Duration,
    pub workflow_timeout: Duration,
    pub machine_timeout: Duration,
    /// Bound on the wait for a hardware record after the discovery power cycle.
    pub discovery_timeout: Duration,
    pub deployment_timeout: Duration,
    pub ready_interval: Duration,
    pub appear_interval: Duration,
    /// Workflow template applied to discovered hardware.
    pub provision_template: String,
    pub wipe_template: String,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            namespace: "tink-system".into(),
            job_timeout: Duration::from_secs(300),
            workflow_timeout: Duration::from_secs(300),
            machine_timeout: Duration::from_secs(90),
            discovery_timeout: Duration::from_secs(600),
            deployment_timeout: Duration::from_secs(120),
            ready_interval: Duration::from_secs(5),
            appear_interval: Duration::from_secs(15),
            provision_template: "ubuntu-jammy".into(),
            wipe_template: "wipe-disks".into(),
        }
    }
}

impl ProvisionConfig {
    /// Defaults overlaid with `COLONY_*` variables. Unparseable values are ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let secs = |k: &str| lookup(k).and_then(|v| v.trim().parse::<u64>().ok()).map(Duration::from_secs);
        if let Some(ns) = lookup("COLONY_NAMESPACE").filter(|s| !s.trim().is_empty()) {
            cfg.namespace = ns.trim().to_string();
        }
        if let Some(d) = secs("COLONY_JOB_TIMEOUT_SECS") { cfg.job_timeout = d; }
        if let Some(d) = secs("COLONY_WORKFLOW_TIMEOUT_SECS") { cfg.workflow_timeout = d; }
        if let Some(d) = secs("COLONY_MACHINE_TIMEOUT_SECS") { cfg.machine_timeout = d; }
        if let Some(d) = secs("COLONY_DISCOVERY_TIMEOUT_SECS") { cfg.discovery_timeout = d; }
        if let Some(d) = secs("COLONY_DEPLOYMENT_TIMEOUT_SECS") { cfg.deployment_timeout = d; }
        if let Some(d) = secs("COLONY_READY_INTERVAL_SECS") { cfg.ready_interval = d; }
        if let Some(d) = secs("COLONY_APPEAR_INTERVAL_SECS") { cfg.appear_interval = d; }
        if let Some(t) = lookup("COLONY_PROVISION_TEMPLATE").filter(|s| !s.is_empty()) {
            cfg.provision_template = t;
        }
        if let Some(t) = lookup("COLONY_WIPE_TEMPLATE").filter(|s| !s.is_empty()) {
            cfg.wipe_template = t;
        }
        cfg
    }
}
