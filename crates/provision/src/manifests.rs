//! Manifests the orchestrator applies: power jobs, credentials and workflows.
//!
//! [`ManifestSource`] is the seam to whatever renders them; [`BuiltinManifests`]
//! builds them directly as YAML documents.

use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use colony_core::{api_version, host_token, kinds, labels};
use serde_json::{json, Value as Json};

/// One-time boot device set before powering a machine back on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BootDevice {
    #[default]
    Pxe,
    Disk,
    Bios,
}

impl BootDevice {
    pub fn as_str(&self) -> &'static str {
        match self {
            BootDevice::Pxe => "pxe",
            BootDevice::Disk => "disk",
            BootDevice::Bios => "bios",
        }
    }
}

impl fmt::Display for BootDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BootDevice {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pxe" => Ok(BootDevice::Pxe),
            "disk" | "hdd" => Ok(BootDevice::Disk),
            "bios" => Ok(BootDevice::Bios),
            other => Err(format!("unknown boot device '{}' (expected pxe, disk or bios)", other)),
        }
    }
}

/// Power off, set a one-time boot device, power on.
#[derive(Debug, Clone)]
pub struct PowerCycle {
    pub host: String,
    pub namespace: String,
    pub job_id: String,
    pub boot: BootDevice,
    pub efi_boot: bool,
}

/// BMC credentials for one host.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub host: String,
    pub namespace: String,
    pub username: String,
    pub password: String,
    pub insecure_tls: bool,
}

/// Run `template` against one hardware record.
#[derive(Debug, Clone)]
pub struct WorkflowRun {
    pub hardware: String,
    pub mac: String,
    pub template: String,
    pub namespace: String,
    pub job_id: String,
}

pub trait ManifestSource: Send + Sync {
    fn power_cycle(&self, req: &PowerCycle) -> Result<String>;
    /// Credential record and BMC machine, in apply order.
    fn credentials(&self, req: &Credentials) -> Result<Vec<String>>;
    fn workflow(&self, req: &WorkflowRun) -> Result<String>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinManifests;

fn to_yaml(doc: &Json, what: &str) -> Result<String> {
    serde_yaml::to_string(doc).with_context(|| format!("rendering {} manifest", what))
}

impl ManifestSource for BuiltinManifests {
    fn power_cycle(&self, req: &PowerCycle) -> Result<String> {
        let token = host_token(&req.host);
        let doc = json!({
            "apiVersion": api_version(&kinds::power_job()),
            "kind": "Job",
            "metadata": {
                "name": format!("{}-{}-{}", token, req.boot, req.job_id),
                "namespace": req.namespace,
                "labels": { (labels::JOB_ID): req.job_id, (labels::NAME): token },
            },
            "spec": {
                "machineRef": { "name": token, "namespace": req.namespace },
                "tasks": [
                    { "powerAction": "off" },
                    { "oneTimeBootDeviceAction": { "device": [req.boot.as_str()], "efiBoot": req.efi_boot } },
                    { "powerAction": "on" },
                ],
            },
        });
        to_yaml(&doc, "power job")
    }

    fn credentials(&self, req: &Credentials) -> Result<Vec<String>> {
        let token = host_token(&req.host);
        let secret = json!({
            "apiVersion": api_version(&kinds::secret()),
            "kind": "Secret",
            "metadata": {
                "name": token,
                "namespace": req.namespace,
                "labels": { (labels::NAME): req.host },
            },
            "type": "kubernetes.io/basic-auth",
            "stringData": { "username": req.username, "password": req.password },
        });
        let machine = json!({
            "apiVersion": api_version(&kinds::machine()),
            "kind": "Machine",
            "metadata": {
                "name": token,
                "namespace": req.namespace,
                "labels": { (labels::NAME): token },
            },
            "spec": {
                "connection": {
                    "host": req.host,
                    "port": 623,
                    "insecureTLS": req.insecure_tls,
                    "authSecretRef": { "name": token, "namespace": req.namespace },
                },
            },
        });
        Ok(vec![to_yaml(&secret, "credential secret")?, to_yaml(&machine, "machine")?])
    }

    fn workflow(&self, req: &WorkflowRun) -> Result<String> {
        let doc = json!({
            "apiVersion": api_version(&kinds::workflow()),
            "kind": "Workflow",
            "metadata": {
                "name": format!("{}-{}", req.hardware, req.job_id),
                "namespace": req.namespace,
                "labels": { (labels::JOB_ID): req.job_id },
            },
            "spec": {
                "templateRef": req.template,
                "hardwareRef": req.hardware,
                "hardwareMap": { "device_1": req.mac },
            },
        });
        to_yaml(&doc, "workflow")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Json {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn power_cycle_targets_machine_by_host_token() {
        let y = BuiltinManifests
            .power_cycle(&PowerCycle {
                host: "10.0.10.5".into(),
                namespace: "tink-system".into(),
                job_id: "ab12cd-discover".into(),
                boot: BootDevice::Pxe,
                efi_boot: true,
            })
            .unwrap();
        let v = parse(&y);
        assert_eq!(v["apiVersion"], "bmc.tinkerbell.org/v1alpha1");
        assert_eq!(v["metadata"]["name"], "10-0-10-5-pxe-ab12cd-discover");
        assert_eq!(v["metadata"]["labels"]["colony.konstruct.io/job-id"], "ab12cd-discover");
        assert_eq!(v["spec"]["machineRef"]["name"], "10-0-10-5");
        assert_eq!(v["spec"]["tasks"][0]["powerAction"], "off");
        assert_eq!(v["spec"]["tasks"][1]["oneTimeBootDeviceAction"]["device"][0], "pxe");
        assert_eq!(v["spec"]["tasks"][1]["oneTimeBootDeviceAction"]["efiBoot"], true);
        assert_eq!(v["spec"]["tasks"][2]["powerAction"], "on");
    }

    #[test]
    fn credentials_render_secret_then_machine() {
        let docs = BuiltinManifests
            .credentials(&Credentials {
                host: "10.0.10.5".into(),
                namespace: "tink-system".into(),
                username: "admin".into(),
                password: "hunter2".into(),
                insecure_tls: true,
            })
            .unwrap();
        assert_eq!(docs.len(), 2);
        let secret = parse(&docs[0]);
        assert_eq!(secret["kind"], "Secret");
        assert_eq!(secret["metadata"]["name"], "10-0-10-5");
        assert_eq!(secret["metadata"]["labels"]["colony.konstruct.io/name"], "10.0.10.5");
        assert_eq!(secret["stringData"]["password"], "hunter2");
        let machine = parse(&docs[1]);
        assert_eq!(machine["kind"], "Machine");
        assert_eq!(machine["spec"]["connection"]["authSecretRef"]["name"], "10-0-10-5");
        assert_eq!(machine["spec"]["connection"]["insecureTLS"], true);
    }

    #[test]
    fn workflow_maps_first_device_to_mac() {
        let y = BuiltinManifests
            .workflow(&WorkflowRun {
                hardware: "hw-1".into(),
                mac: "aa:bb:cc:dd:ee:ff".into(),
                template: "ubuntu-jammy".into(),
                namespace: "tink-system".into(),
                job_id: "ab12cd-provision".into(),
            })
            .unwrap();
        let v = parse(&y);
        assert_eq!(v["metadata"]["name"], "hw-1-ab12cd-provision");
        assert_eq!(v["spec"]["templateRef"], "ubuntu-jammy");
        assert_eq!(v["spec"]["hardwareRef"], "hw-1");
        assert_eq!(v["spec"]["hardwareMap"]["device_1"], "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn boot_device_parses_case_insensitively() {
        assert_eq!("PXE".parse::<BootDevice>(), Ok(BootDevice::Pxe));
        assert_eq!("hdd".parse::<BootDevice>(), Ok(BootDevice::Disk));
        assert!("floppy".parse::<BootDevice>().is_err());
    }
}
