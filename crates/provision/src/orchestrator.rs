//! Lifecycle flows: register, provision, reboot, deprovision.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use colony_apply::{retry_on_conflict, Applier, RetryPolicy};
use colony_core::{host_token, kinds, label_selector, labels};
use colony_kubehub::{DiscoveryMapper, ResourceStore};
use colony_wait::Poller;
use kube::core::DynamicObject;
use kube::ResourceExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::hardware::{clear_ipxe, first_mac, HardwareSummary};
use crate::manifests::{BootDevice, BuiltinManifests, Credentials, ManifestSource, PowerCycle, WorkflowRun};
use crate::watch::{HardwareWatch, WatchScope};
use crate::{DiscoveryFailure, ProvisionConfig, ProvisionError, Stage, Step};

/// Random 6-character token correlating everything one run applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunId(String);

impl RunId {
    pub fn new() -> Self {
        let mut s = Uuid::new_v4().simple().to_string();
        s.truncate(6);
        RunId(s)
    }

    /// `job-id` label value for one step of the run.
    pub fn job_id(&self, step: &str) -> String {
        format!("{}-{}", self.0, step)
    }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl Default for RunId {
    fn default() -> Self { Self::new() }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    /// BMC address of the machine.
    pub host: String,
    /// Workflow template; the configured one when `None`.
    pub template: Option<String>,
    /// Boot device for the final power cycle.
    pub boot: BootDevice,
    pub efi_boot: bool,
}

impl ProvisionRequest {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into(), template: None, boot: BootDevice::Disk, efi_boot: true }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProvisionReport {
    pub host: String,
    pub run_id: String,
    pub hardware: String,
    pub workflow: String,
    #[serde(skip)]
    pub stage: Stage,
}

/// A service to wait for: Deployments matching `selector` in `namespace`.
#[derive(Debug, Clone)]
pub struct DeploymentTarget {
    pub namespace: String,
    pub selector: String,
    /// Falls back to the configured deployment timeout.
    pub timeout: Option<Duration>,
}

pub struct Provisioner {
    store: Arc<dyn ResourceStore>,
    mapper: Arc<DiscoveryMapper>,
    applier: Applier,
    poller: Poller,
    manifests: Arc<dyn ManifestSource>,
    config: ProvisionConfig,
}

fn advance(stage: &mut Stage, next: Stage, host: &str) {
    info!(host, from = %stage, to = %next, "stage reached");
    *stage = next;
}

impl Provisioner {
    pub fn new(store: Arc<dyn ResourceStore>, config: ProvisionConfig) -> Self {
        let mapper = Arc::new(DiscoveryMapper::new(store.clone()));
        Self::with_mapper(store, mapper, config)
    }

    pub fn with_mapper(store: Arc<dyn ResourceStore>, mapper: Arc<DiscoveryMapper>, config: ProvisionConfig) -> Self {
        let applier = Applier::new(store.clone(), mapper.clone()).with_default_namespace(config.namespace.clone());
        let poller = Poller::new(store.clone(), mapper.clone()).with_intervals(config.appear_interval, config.ready_interval);
        Self { store, mapper, applier, poller, manifests: Arc::new(BuiltinManifests), config }
    }

    pub fn with_manifests(mut self, manifests: Arc<dyn ManifestSource>) -> Self {
        self.manifests = manifests;
        self
    }

    pub fn config(&self) -> &ProvisionConfig { &self.config }
    pub fn applier(&self) -> &Applier { &self.applier }
    pub fn poller(&self) -> &Poller { &self.poller }

    /// Store BMC credentials for `host` and wait until its machine is contactable.
    pub async fn register(
        &self,
        host: &str,
        username: &str,
        password: &str,
        insecure_tls: bool,
        cancel: &CancellationToken,
    ) -> Result<DynamicObject, ProvisionError> {
        let fail = |e: anyhow::Error| ProvisionError::at(Step::Register, host, e);
        let docs = self
            .manifests
            .credentials(&Credentials {
                host: host.to_string(),
                namespace: self.config.namespace.clone(),
                username: username.to_string(),
                password: password.to_string(),
                insecure_tls,
            })
            .map_err(fail)?;
        self.applier.apply_all(&docs).await.map_err(|e| fail(e.into()))?;
        let selector = label_selector(labels::NAME, &host_token(host));
        let machine = self
            .poller
            .wait_for_machine(&self.config.namespace, &selector, self.config.machine_timeout, cancel)
            .await
            .map_err(|e| fail(e.into()))?;
        info!(host, machine = %machine.name_any(), "machine contactable");
        Ok(machine)
    }

    /// Power-cycle `req.host` into network boot, wait for its hardware record,
    /// run the provisioning workflow on it and boot it normally.
    pub async fn provision(&self, req: &ProvisionRequest, cancel: &CancellationToken) -> Result<ProvisionReport, ProvisionError> {
        let host = req.host.as_str();
        let run = RunId::new();
        let mut stage = Stage::Start;
        info!(host, run = %run, "provisioning started");

        // Listening before the power cycle so the creation can't be missed.
        let discovery_timeout = self.config.discovery_timeout;
        let scope = WatchScope::new(host, self.config.namespace.clone());
        let started = tokio::time::timeout(discovery_timeout, HardwareWatch::start(self.store.clone(), &self.mapper, scope, cancel))
            .await
            .map_err(|_| discovery(host, DiscoveryFailure::Timeout(discovery_timeout)))?;
        let mut watch = started.map_err(|e| ProvisionError::at(Step::AwaitHardware, host, e))?;

        if let Err(e) = self.power_cycle(host, &run.job_id("discover"), BootDevice::Pxe, req.efi_boot, cancel).await {
            watch.stop().await;
            return Err(ProvisionError::at(Step::DiscoveryPowerCycle, host, e));
        }
        advance(&mut stage, Stage::PoweredForDiscovery, host);
        advance(&mut stage, Stage::AwaitingHardware, host);

        let (delivered, failures) = watch.receivers();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProvisionError::Cancelled { step: Step::AwaitHardware, subject: host.to_string() }),
            hw = delivered.recv() => hw.ok_or(DiscoveryFailure::Closed).map_err(|reason| discovery(host, reason)),
            f = failures.recv() => Err(discovery(host, f.map(DiscoveryFailure::Watch).unwrap_or(DiscoveryFailure::Closed))),
            _ = tokio::time::sleep(discovery_timeout) => Err(discovery(host, DiscoveryFailure::Timeout(discovery_timeout))),
        };
        watch.stop().await;
        let hw = outcome?;
        let hardware = hw.name_any();
        advance(&mut stage, Stage::Associated, host);

        let template = req.template.clone().unwrap_or_else(|| self.config.provision_template.clone());
        let mac = first_mac(&hw)
            .map(str::to_string)
            .ok_or_else(|| ProvisionError::at(Step::ProvisionWorkflow, host, anyhow!("hardware {} reports no interface MAC", hardware)))?;
        advance(&mut stage, Stage::Provisioning, host);
        let workflow = self
            .run_workflow(&hardware, &mac, &template, &run.job_id("provision"), cancel)
            .await
            .map_err(|e| ProvisionError::at(Step::ProvisionWorkflow, host, e))?;

        self.power_cycle(host, &run.job_id("boot"), req.boot, req.efi_boot, cancel)
            .await
            .map_err(|e| ProvisionError::at(Step::BootPowerCycle, host, e))?;
        advance(&mut stage, Stage::Confirmed, host);

        Ok(ProvisionReport {
            host: host.to_string(),
            run_id: run.to_string(),
            hardware,
            workflow: workflow.name_any(),
            stage,
        })
    }

    /// Power-cycle the machine behind `hardware_id` with the given boot device.
    pub async fn reboot(&self, hardware_id: &str, boot: BootDevice, efi_boot: bool, cancel: &CancellationToken) -> Result<DynamicObject, ProvisionError> {
        let host = self.resolve_host(hardware_id).await?;
        let run = RunId::new();
        info!(hardware = hardware_id, host = %host, run = %run, boot = %boot, "rebooting");
        self.power_cycle(&host, &run.job_id("reboot"), boot, efi_boot, cancel)
            .await
            .map_err(|e| ProvisionError::at(Step::Reboot, hardware_id, e))
    }

    /// Stop network boot for `hardware_id`, wipe its disks and boot it with `boot`.
    pub async fn deprovision(&self, hardware_id: &str, boot: BootDevice, efi_boot: bool, cancel: &CancellationToken) -> Result<ProvisionReport, ProvisionError> {
        let run = RunId::new();
        info!(hardware = hardware_id, run = %run, "deprovisioning");
        let hw = self.clear_netboot(hardware_id).await.map_err(|e| ProvisionError::at(Step::ClearNetboot, hardware_id, e))?;
        let host = self.resolve_host(hardware_id).await?;
        let mac = first_mac(&hw)
            .map(str::to_string)
            .ok_or_else(|| ProvisionError::at(Step::WipeDisks, hardware_id, anyhow!("hardware reports no interface MAC")))?;
        let wipe_template = self.config.wipe_template.clone();
        let workflow = self
            .run_workflow(hardware_id, &mac, &wipe_template, &run.job_id("wipe"), cancel)
            .await
            .map_err(|e| ProvisionError::at(Step::WipeDisks, hardware_id, e))?;
        self.power_cycle(&host, &run.job_id("boot"), boot, efi_boot, cancel)
            .await
            .map_err(|e| ProvisionError::at(Step::BootPowerCycle, hardware_id, e))?;
        Ok(ProvisionReport {
            host,
            run_id: run.to_string(),
            hardware: hardware_id.to_string(),
            workflow: workflow.name_any(),
            stage: Stage::Confirmed,
        })
    }

    /// Wait for each service in order.
    pub async fn wait_for_deployments(&self, targets: &[DeploymentTarget], cancel: &CancellationToken) -> Result<(), ProvisionError> {
        for t in targets {
            let timeout = t.timeout.unwrap_or(self.config.deployment_timeout);
            self.poller
                .wait_for_deployment(&t.namespace, &t.selector, timeout, cancel)
                .await
                .map_err(|e| ProvisionError::at(Step::Deployments, t.selector.clone(), e))?;
            info!(namespace = %t.namespace, selector = %t.selector, "deployment ready");
        }
        Ok(())
    }

    /// Wait until the API server answers; returns its version.
    pub async fn wait_for_api(&self, timeout: Duration, cancel: &CancellationToken) -> Result<String, ProvisionError> {
        self.poller.wait_for_api(timeout, cancel).await.map_err(|e| ProvisionError::at(Step::ApiHealth, "cluster", e))
    }

    /// Hardware records in the configured namespace, sorted by name.
    pub async fn list_hardware(&self) -> Result<Vec<HardwareSummary>, ProvisionError> {
        let ns = self.config.namespace.as_str();
        let fail = |e: anyhow::Error| ProvisionError::at(Step::ListHardware, ns, e);
        let ep = self.mapper.resolve(&kinds::hardware()).await.map_err(|e| fail(e.into()))?;
        let items = self.store.list(&ep, Some(ns), None).await.map_err(|e| fail(e.into()))?;
        let mut rows: Vec<HardwareSummary> = items.iter().map(HardwareSummary::from_object).collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rows)
    }

    /// Host (BMC address) whose credential record carries `hardware_id`.
    pub async fn resolve_host(&self, hardware_id: &str) -> Result<String, ProvisionError> {
        self.lookup_host(hardware_id).await.map_err(|e| ProvisionError::at(Step::ResolveHost, hardware_id, e))
    }

    async fn lookup_host(&self, hardware_id: &str) -> Result<String> {
        let ep = self.mapper.resolve(&kinds::secret()).await?;
        let selector = label_selector(labels::HARDWARE_ID, hardware_id);
        let records = self.store.list(&ep, Some(&self.config.namespace), Some(&selector)).await?;
        let rec = records.first().ok_or_else(|| anyhow!("no credential record labelled {}", selector))?;
        rec.labels()
            .get(labels::NAME)
            .cloned()
            .ok_or_else(|| anyhow!("credential record {} has no {} label", rec.name_any(), labels::NAME))
    }

    async fn clear_netboot(&self, hardware_id: &str) -> Result<DynamicObject> {
        let ep = self.mapper.resolve(&kinds::hardware()).await?;
        let store = &self.store;
        let ep = &ep;
        let ns = Some(self.config.namespace.as_str());
        let hw = retry_on_conflict(&RetryPolicy::default(), || async move {
            let mut hw = store.get(ep, ns, hardware_id).await?;
            if clear_ipxe(&mut hw) == 0 {
                return Ok(hw);
            }
            store.replace(ep, ns, &hw).await
        })
        .await
        .with_context(|| format!("updating hardware {}", hardware_id))?;
        info!(hardware = hardware_id, "netboot script cleared");
        Ok(hw)
    }

    async fn power_cycle(&self, host: &str, job_id: &str, boot: BootDevice, efi_boot: bool, cancel: &CancellationToken) -> Result<DynamicObject> {
        let manifest = self.manifests.power_cycle(&PowerCycle {
            host: host.to_string(),
            namespace: self.config.namespace.clone(),
            job_id: job_id.to_string(),
            boot,
            efi_boot,
        })?;
        self.applier.apply_all(&[manifest]).await?;
        let selector = label_selector(labels::JOB_ID, job_id);
        let job = self.poller.wait_for_job(&self.config.namespace, &selector, self.config.job_timeout, cancel).await?;
        info!(host, job = %job.name_any(), boot = %boot, "power cycle completed");
        Ok(job)
    }

    async fn run_workflow(&self, hardware: &str, mac: &str, template: &str, job_id: &str, cancel: &CancellationToken) -> Result<DynamicObject> {
        let manifest = self.manifests.workflow(&WorkflowRun {
            hardware: hardware.to_string(),
            mac: mac.to_string(),
            template: template.to_string(),
            namespace: self.config.namespace.clone(),
            job_id: job_id.to_string(),
        })?;
        self.applier.apply_all(&[manifest]).await?;
        let selector = label_selector(labels::JOB_ID, job_id);
        let wf = self
            .poller
            .wait_for_workflow(&self.config.namespace, &selector, self.config.workflow_timeout, cancel)
            .await?;
        info!(hardware, workflow = %wf.name_any(), template, "workflow succeeded");
        Ok(wf)
    }
}

fn discovery(host: &str, reason: DiscoveryFailure) -> ProvisionError {
    ProvisionError::Discovery { host: host.to_string(), reason }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_are_short_and_distinct() {
        let a = RunId::new();
        let b = RunId::new();
        assert_eq!(a.as_str().len(), 6);
        assert_ne!(a, b);
        assert_eq!(a.job_id("boot"), format!("{}-boot", a));
    }
}
