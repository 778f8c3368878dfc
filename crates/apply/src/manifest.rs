//! Manifest decoding: YAML text into typed identity plus an opaque payload.

use colony_core::{split_api_version, GroupVersionKind};
use kube::core::DynamicObject;
use serde::Deserialize;
use serde_json::Value as Json;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("YAML payload too large (>{0} bytes)")]
    TooLarge(usize),
    #[error("YAML document too complex (>{0} nodes)")]
    TooComplex(usize),
    #[error("parsing YAML: {0}")]
    Yaml(String),
    #[error("YAML missing {0}")]
    Missing(&'static str),
    #[error("invalid object: {0}")]
    Invalid(String),
}

fn max_yaml_bytes() -> usize {
    std::env::var("COLONY_MAX_YAML_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000) // 1 MiB default
}

fn max_yaml_nodes() -> usize {
    std::env::var("COLONY_MAX_YAML_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    // Running counter; bail early once the budget is spent
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur > max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur > max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur > max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count > max
}

/// One decoded resource document, kind resolved but not yet mapped to an endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedManifest {
    pub gvk: GroupVersionKind,
    pub name: String,
    pub namespace: Option<String>,
    pub payload: Json,
}

impl DecodedManifest {
    /// `Kind ns/name` (or `Kind name`) for messages.
    pub fn target(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{} {}/{}", self.gvk.kind, ns, self.name),
            None => format!("{} {}", self.gvk.kind, self.name),
        }
    }

    pub fn to_object(&self) -> Result<DynamicObject, DecodeError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| DecodeError::Invalid(format!("{}: {}", self.target(), e)))
    }
}

/// Decode every non-empty `---` separated document in `text`.
pub fn decode_documents(text: &str) -> Result<Vec<DecodedManifest>, DecodeError> {
    documents(text).into_iter().collect()
}

/// Decode the non-empty documents of `text` one by one, in order.
///
/// Each entry is decoded on its own, so the documents ahead of a bad one
/// are still returned. The list ends at the first failure.
pub fn documents(text: &str) -> Vec<Result<DecodedManifest, DecodeError>> {
    let max_bytes = max_yaml_bytes();
    if text.len() > max_bytes {
        return vec![Err(DecodeError::TooLarge(max_bytes))];
    }
    let mut out = Vec::new();
    for de in serde_yaml::Deserializer::from_str(text) {
        match decode_document(de) {
            Ok(None) => continue,
            Ok(Some(doc)) => out.push(Ok(doc)),
            Err(e) => {
                out.push(Err(e));
                break;
            }
        }
    }
    out
}

fn decode_document(de: serde_yaml::Deserializer<'_>) -> Result<Option<DecodedManifest>, DecodeError> {
    let val = serde_yaml::Value::deserialize(de).map_err(|e| DecodeError::Yaml(e.to_string()))?;
    if val.is_null() {
        return Ok(None);
    }
    let json = serde_json::to_value(val).map_err(|e| DecodeError::Yaml(format!("converting YAML to JSON: {}", e)))?;
    decode_value(json).map(Some)
}

pub fn decode_value(json: Json) -> Result<DecodedManifest, DecodeError> {
    let max_nodes = max_yaml_nodes();
    if json_node_budget_exceeded(&json, max_nodes) {
        return Err(DecodeError::TooComplex(max_nodes));
    }
    let api_version = json.get("apiVersion").and_then(|v| v.as_str()).ok_or(DecodeError::Missing("apiVersion"))?;
    let kind = json.get("kind").and_then(|v| v.as_str()).ok_or(DecodeError::Missing("kind"))?;
    let (group, version) = split_api_version(api_version);
    let meta = json.get("metadata");
    let name = meta
        .and_then(|m| m.get("name"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or(DecodeError::Missing("metadata.name"))?
        .to_string();
    let namespace = meta
        .and_then(|m| m.get("namespace"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());
    let gvk = GroupVersionKind::gvk(&group, &version, kind);
    Ok(DecodedManifest { gvk, name, namespace, payload: json })
}
