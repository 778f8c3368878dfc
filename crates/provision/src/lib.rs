//! Colony provision: the hardware lifecycle orchestrator.
//!
//! [`Provisioner`] composes the applier, the readiness poller and the hardware
//! discovery watch into the register, provision, reboot and deprovision flows.

#![forbid(unsafe_code)]

use std::fmt;
use std::time::Duration;

use colony_apply::ApplyError;
use colony_core::StoreError;
use colony_wait::WaitError;
use thiserror::Error;

pub mod config;
pub mod hardware;
pub mod manifests;
pub mod orchestrator;
pub mod watch;

pub use config::ProvisionConfig;
pub use hardware::{clear_ipxe, first_mac, HardwareSummary};
pub use manifests::{BootDevice, BuiltinManifests, Credentials, ManifestSource, PowerCycle, WorkflowRun};
pub use orchestrator::{DeploymentTarget, ProvisionReport, ProvisionRequest, Provisioner, RunId};
pub use watch::{HardwareWatch, WatchFailure, WatchScope};

/// Provisioning state machine. Each run only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Start,
    PoweredForDiscovery,
    AwaitingHardware,
    Associated,
    Provisioning,
    Confirmed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Start => "start",
            Stage::PoweredForDiscovery => "powered-for-discovery",
            Stage::AwaitingHardware => "awaiting-hardware",
            Stage::Associated => "associated",
            Stage::Provisioning => "provisioning",
            Stage::Confirmed => "confirmed",
        };
        f.write_str(s)
    }
}

/// The operation that failed, for error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Register,
    AwaitHardware,
    DiscoveryPowerCycle,
    ProvisionWorkflow,
    BootPowerCycle,
    ResolveHost,
    ClearNetboot,
    WipeDisks,
    Reboot,
    Deployments,
    ApiHealth,
    ListHardware,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Step::Register => "registering credentials",
            Step::AwaitHardware => "hardware discovery",
            Step::DiscoveryPowerCycle => "power cycle into network boot",
            Step::ProvisionWorkflow => "provisioning workflow",
            Step::BootPowerCycle => "power cycle into normal boot",
            Step::ResolveHost => "resolving host",
            Step::ClearNetboot => "clearing netboot",
            Step::WipeDisks => "disk wipe workflow",
            Step::Reboot => "reboot",
            Step::Deployments => "waiting for deployments",
            Step::ApiHealth => "waiting for API server",
            Step::ListHardware => "listing hardware",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DiscoveryFailure {
    #[error("no hardware record appeared within {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Watch(WatchFailure),
    #[error("watch stopped before delivering a hardware record")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("{step} for {subject}: {error:#}")]
    Step { step: Step, subject: String, error: anyhow::Error },
    #[error("{step} for {subject}: cancelled")]
    Cancelled { step: Step, subject: String },
    #[error("hardware discovery for {host}: {reason}")]
    Discovery { host: String, reason: DiscoveryFailure },
}

impl ProvisionError {
    /// Wrap `error` for `step`, turning a cancelled wait or watch into [`ProvisionError::Cancelled`].
    pub fn at(step: Step, subject: impl Into<String>, error: impl Into<anyhow::Error>) -> Self {
        let error = error.into();
        let subject = subject.into();
        let cancelled = matches!(error.downcast_ref::<WaitError>(), Some(WaitError::Cancelled { .. }))
            || matches!(error.downcast_ref::<WatchFailure>(), Some(WatchFailure::Cancelled));
        if cancelled {
            return ProvisionError::Cancelled { step, subject };
        }
        ProvisionError::Step { step, subject, error }
    }

    pub fn step(&self) -> Option<Step> {
        match self {
            ProvisionError::Step { step, .. } | ProvisionError::Cancelled { step, .. } => Some(*step),
            ProvisionError::Discovery { .. } => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProvisionError::Cancelled { .. })
    }

    /// Store error at the root of the failure, if any.
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            ProvisionError::Step { error, .. } => error.chain().find_map(|e| {
                e.downcast_ref::<StoreError>()
                    .or_else(|| e.downcast_ref::<ApplyError>().and_then(ApplyError::store_error))
                    .or_else(|| match e.downcast_ref::<WaitError>() {
                        Some(WaitError::Store { error, .. }) => Some(error),
                        _ => None,
                    })
                    .or_else(|| match e.downcast_ref::<WatchFailure>() {
                        Some(WatchFailure::Watch(error) | WatchFailure::Label(error)) => Some(error),
                        _ => None,
                    })
            }),
            ProvisionError::Discovery { reason: DiscoveryFailure::Watch(WatchFailure::Watch(e) | WatchFailure::Label(e)), .. } => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_waits_become_cancelled_errors() {
        let e = ProvisionError::at(Step::ProvisionWorkflow, "10.0.10.5", WaitError::Cancelled { what: "Workflow x".into() });
        assert!(e.is_cancelled());
        assert_eq!(e.to_string(), "provisioning workflow for 10.0.10.5: cancelled");

        let e = ProvisionError::at(Step::Reboot, "hw-1", WaitError::ReadyTimeout { what: "Job j".into(), timeout: Duration::from_secs(300) });
        assert!(!e.is_cancelled());
        assert_eq!(e.to_string(), "reboot for hw-1: Job j was not ready within 300s");
    }

    #[test]
    fn cancelled_watch_start_becomes_cancelled_error() {
        let e = ProvisionError::at(Step::AwaitHardware, "10.0.10.5", WatchFailure::Cancelled);
        assert!(e.is_cancelled());
        assert_eq!(e.step(), Some(Step::AwaitHardware));

        let e = ProvisionError::at(Step::AwaitHardware, "10.0.10.5", WatchFailure::Watch(StoreError::Forbidden("hardware".into())));
        assert!(!e.is_cancelled());
        assert_eq!(e.store_error(), Some(&StoreError::Forbidden("hardware".into())));
    }

    #[test]
    fn stages_are_ordered() {
        assert!(Stage::Start < Stage::AwaitingHardware);
        assert!(Stage::Provisioning < Stage::Confirmed);
        assert_eq!(Stage::PoweredForDiscovery.to_string(), "powered-for-discovery");
    }
}
