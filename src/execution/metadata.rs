//! Beamline metadata lookup
//!
//! Fills parameters the caller did not supply from a JSON document. Any
//! problem reading the document is logged and the supplied values are used
//! as they are.

use crate::core::{
    params::{ParamValue, ParameterSet},
    stage::MetadataSpec,
};
use serde_json::Value;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Look up a dotted path (`user_input.unit_cell`) in a JSON document
pub fn lookup<'a>(document: &'a Value, dotted: &str) -> Option<&'a Value> {
    dotted
        .split('.')
        .try_fold(document, |node, key| node.get(key))
}

fn to_param(value: &Value) -> Option<ParamValue> {
    match value {
        Value::String(s) => Some(ParamValue::String(s.clone())),
        Value::Bool(b) => Some(ParamValue::Bool(*b)),
        Value::Number(n) => n
            .as_i64()
            .map(ParamValue::Integer)
            .or_else(|| n.as_f64().map(ParamValue::Float)),
        _ => None,
    }
}

/// Fill every field of `spec` that `params` lacks. Returns the keys filled.
pub fn fill_missing(spec: &MetadataSpec, params: &mut ParameterSet, stage: &str) -> Vec<String> {
    let missing: Vec<&(String, String)> = spec
        .fields
        .iter()
        .filter(|(key, _)| !params.contains(key))
        .collect();
    if missing.is_empty() {
        debug!("Stage {}: all metadata fields supplied, not reading metadata", stage);
        return Vec::new();
    }

    let path = match spec.file.render(params) {
        Ok(path) => PathBuf::from(path),
        Err(e) => {
            warn!("Stage {}: cannot locate metadata ({}); using supplied values", stage, e);
            return Vec::new();
        }
    };

    let document: Value = match std::fs::read_to_string(&path)
        .map_err(|e| e.to_string())
        .and_then(|text| serde_json::from_str(&text).map_err(|e| e.to_string()))
    {
        Ok(document) => document,
        Err(e) => {
            warn!(
                "Stage {}: could not read metadata {}: {}; using supplied values",
                stage,
                path.display(),
                e
            );
            return Vec::new();
        }
    };

    let mut filled = Vec::new();
    for (key, dotted) in missing {
        match lookup(&document, dotted).and_then(to_param) {
            Some(value) => {
                info!("Stage {}: {} = {} (from {})", stage, key, value, path.display());
                params.insert(key.clone(), value);
                filled.push(key.clone());
            }
            None => warn!(
                "Stage {}: {} has no scalar at '{}'; leaving '{}' unset",
                stage,
                path.display(),
                dotted,
                key
            ),
        }
    }
    filled
}
