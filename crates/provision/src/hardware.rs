//! Reading and editing hardware records.

use kube::core::DynamicObject;
use kube::ResourceExt;
use serde::Serialize;
use serde_json::{Map, Value as Json};

/// One row of the hardware inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HardwareSummary {
    pub name: String,
    pub hostname: String,
    pub ip: String,
    pub mac: String,
    pub state: String,
}

impl HardwareSummary {
    pub fn from_object(obj: &DynamicObject) -> Self {
        let text = |ptr: &str| obj.data.pointer(ptr).and_then(Json::as_str).unwrap_or_default().to_string();
        let mut hostname = text("/spec/interfaces/0/dhcp/hostname");
        if hostname.is_empty() {
            hostname = text("/spec/metadata/instance/hostname");
        }
        Self {
            name: obj.name_any(),
            hostname,
            ip: text("/spec/interfaces/0/dhcp/ip/address"),
            mac: text("/spec/interfaces/0/dhcp/mac"),
            state: text("/status/state"),
        }
    }
}

/// MAC of the first interface, used as the workflow's `device_1`.
pub fn first_mac(obj: &DynamicObject) -> Option<&str> {
    obj.data.pointer("/spec/interfaces/0/dhcp/mac").and_then(Json::as_str).filter(|m| !m.is_empty())
}

/// Replace every interface's `netboot.ipxe` with an empty object so the host
/// stops chain-loading an iPXE script. Returns how many interfaces changed.
pub fn clear_ipxe(obj: &mut DynamicObject) -> usize {
    let Some(ifaces) = obj.data.pointer_mut("/spec/interfaces").and_then(Json::as_array_mut) else {
        return 0;
    };
    let mut changed = 0;
    for iface in ifaces.iter_mut() {
        if let Some(netboot) = iface.get_mut("netboot").and_then(Json::as_object_mut) {
            let empty = Json::Object(Map::new());
            if netboot.get("ipxe") != Some(&empty) {
                netboot.insert("ipxe".into(), empty);
                changed += 1;
            }
        }
    }
    changed
}
