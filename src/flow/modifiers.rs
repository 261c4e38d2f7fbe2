//! Per-state overrides applied to generated fragments.
//!
//! A modifier set maps a function name (or the state generated for it) to the
//! fields to override on that state:
//!
//! ```text
//! {"hello": {"WaitTime": 600, "payload": "message"}}
//! ```
//!
//! Top-level state fields are assigned as given. Payload fields are rewritten
//! into references the flow service resolves at run time.

use indexmap::IndexMap;
use serde_json::{Map, Value};

use super::definition::{FlowDefinition, State};
use crate::naming::{results_reference, state_name};
use crate::{Error, Result};

/// `{function_or_state_name: {field: value}}`.
pub type Modifiers = IndexMap<String, Map<String, Value>>;

/// Fields every state accepts directly.
pub const TOP_LEVEL_FIELDS: &[&str] = &[
    "Type",
    "ActionUrl",
    "WaitTime",
    "ExceptionOnActionFailure",
    "RunAs",
    "InputPath",
    "Parameters",
    "ResultPath",
    "Catch",
    "Next",
    "End",
];

/// The objects of a state's `Parameters` that receive payload modifiers.
pub type PayloadTargets = fn(&mut Map<String, Value>) -> Vec<&mut Map<String, Value>>;

/// Apply `modifiers` to the states generated for `functions`.
///
/// `payload_fields` lists the payload keys the action provider understands;
/// `targets` locates where those keys live inside `Parameters`.
pub(crate) fn apply_modifiers(
    definition: &mut FlowDefinition,
    modifiers: &Modifiers,
    functions: &[String],
    payload_fields: &[&str],
    targets: PayloadTargets,
) -> Result<()> {
    let names: IndexMap<String, String> = functions
        .iter()
        .map(|f| (f.clone(), state_name(f)))
        .collect();

    for (target, fields) in modifiers {
        let state_key = resolve_target(definition, &names, target)?;
        let Some(state) = definition.states.get(&state_key) else {
            continue;
        };
        let mut object = match serde_json::to_value(state)? {
            Value::Object(map) => map,
            _ => continue,
        };

        for (field, value) in fields {
            if TOP_LEVEL_FIELDS.contains(&field.as_str()) {
                assign_top_level(&mut object, field, value.clone());
            } else if payload_fields.contains(&field.as_str()) {
                let (key, rendered) = render_payload_value(field, value, &names);
                let params = object
                    .entry("Parameters")
                    .or_insert_with(|| Value::Object(Map::new()));
                let Value::Object(params) = params else {
                    return Err(Error::Config(format!(
                        "modifier for '{target}': Parameters of state '{state_key}' is not an object"
                    )));
                };
                for slot in targets(params) {
                    remove_variants(slot, field);
                    slot.insert(key.clone(), rendered.clone());
                }
            } else {
                let mut allowed: Vec<&str> = TOP_LEVEL_FIELDS.to_vec();
                allowed.extend_from_slice(payload_fields);
                return Err(Error::Config(format!(
                    "unsupported modifier field '{field}' for '{target}' (supported: {})",
                    allowed.join(", ")
                )));
            }
        }

        let modified: State = serde_json::from_value(Value::Object(object)).map_err(|e| {
            Error::Config(format!("modifiers for '{target}' produce an invalid state: {e}"))
        })?;
        definition.states.insert(state_key, modified);
    }
    Ok(())
}

fn resolve_target(
    definition: &FlowDefinition,
    names: &IndexMap<String, String>,
    target: &str,
) -> Result<String> {
    if let Some(state) = names.get(target) {
        return Ok(state.clone());
    }
    if definition.states.contains_key(target) {
        return Ok(target.to_string());
    }

    let mut allowed: Vec<&str> = names.keys().map(String::as_str).collect();
    allowed.extend(definition.states.keys().map(String::as_str));
    allowed.dedup();
    Err(Error::Config(format!(
        "modifier target '{target}' is not a function or state of this tool (allowed: {})",
        allowed.join(", ")
    )))
}

fn remove_variants(object: &mut Map<String, Value>, field: &str) {
    object.remove(field);
    object.remove(&format!("{field}.$"));
    object.remove(&format!("{field}.="));
}

fn assign_top_level(object: &mut Map<String, Value>, field: &str, value: Value) {
    remove_variants(object, field);
    match field {
        "Next" => {
            object.remove("End");
        }
        "End" if value == Value::Bool(true) => {
            object.remove("Next");
        }
        _ => {}
    }
    object.insert(field.to_string(), value);
}

/// Key and value a payload modifier renders to.
fn render_payload_value(
    field: &str,
    value: &Value,
    names: &IndexMap<String, String>,
) -> (String, Value) {
    let Value::String(text) = value else {
        return (field.to_string(), value.clone());
    };

    if text.starts_with("$.") {
        return (format!("{field}.$"), value.clone());
    }
    if let Some(expr) = text.strip_prefix('=') {
        return (format!("{field}.="), Value::String(expr.to_string()));
    }

    let referenced = names
        .get(text.as_str())
        .cloned()
        .or_else(|| names.values().find(|state| *state == text).cloned());
    match referenced {
        Some(state) => (format!("{field}.$"), Value::String(results_reference(&state))),
        None => (format!("{field}.$"), Value::String(format!("$.input.{text}"))),
    }
}
