//! Generating flow fragments from a tool's compute functions.
//!
//! Each function becomes one `Action` state against the compute action
//! provider, threaded in declaration order. Two payload shapes exist for the
//! same provider:
//!
//! * v2: `Parameters.tasks[*]` with `endpoint`, `function` and `payload`
//! * v3: flat `Parameters` with `endpoint`, `function`, `args`, `kwargs`,
//!   `user_endpoint_config` and `resource_specification`
//!
//! The tool's declared [`ComputeSchema`] picks the builder.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{json, Map, Value};
use tracing::debug;

use super::definition::{ActionState, FlowDefinition, State};
use super::modifiers::{apply_modifiers, Modifiers, PayloadTargets};
use crate::naming::{function_id_key, is_snake_identifier, result_path, state_name};
use crate::tool::{ComputeSchema, FunctionSet, RemoteFunction, Tool};
use crate::{Error, Result};

/// Action provider for v2 compute payloads.
pub const COMPUTE_V2_ACTION_URL: &str = "https://compute.actions.globus.org";
/// Action provider for v3 compute payloads.
pub const COMPUTE_V3_ACTION_URL: &str = "https://compute.actions.globus.org/v3";

/// Seconds the flow service waits on each generated action.
pub const DEFAULT_WAIT_TIME: u64 = 300;

const ENDPOINT_REF: &str = "$.input.compute_endpoint";
const PAYLOAD_REF: &str = "$.input";

/// Turns a list of remote functions into a linear fragment.
pub trait FlowBuilder {
    fn action_url(&self) -> &str;

    /// Payload keys modifiers may set.
    fn payload_fields(&self) -> &'static [&'static str];

    /// `Parameters` of the state calling the function stored under `function_key`.
    fn parameters(&self, function_key: &str) -> Map<String, Value>;

    fn payload_targets(&self) -> PayloadTargets;

    fn build(&self, functions: &[RemoteFunction], modifiers: &Modifiers) -> Result<FlowDefinition> {
        if functions.is_empty() {
            return Err(Error::Config("no compute functions to build a flow from".into()));
        }

        let mut seen = BTreeSet::new();
        for function in functions {
            if !is_snake_identifier(&function.name) {
                return Err(Error::Config(format!(
                    "function name '{}' is not a snake_case identifier",
                    function.name
                )));
            }
            let state = state_name(&function.name);
            if !seen.insert(state.clone()) {
                return Err(Error::Config(format!(
                    "function '{}' produces duplicate state name '{state}'",
                    function.name
                )));
            }
        }

        let names: Vec<String> = functions.iter().map(|f| state_name(&f.name)).collect();
        let mut definition = FlowDefinition::new(names[0].clone());
        for (index, function) in functions.iter().enumerate() {
            let state = &names[index];
            let next = names.get(index + 1).cloned();
            let action = ActionState {
                action_url: self.action_url().to_string(),
                parameters: Some(self.parameters(&function_id_key(&function.name))),
                result_path: Some(result_path(state)),
                wait_time: Some(DEFAULT_WAIT_TIME),
                exception_on_action_failure: Some(false),
                end: next.is_none(),
                next,
                ..Default::default()
            };
            definition.states.insert(state.clone(), State::Action(action));
        }

        let function_names: Vec<String> = functions.iter().map(|f| f.name.clone()).collect();
        apply_modifiers(
            &mut definition,
            modifiers,
            &function_names,
            self.payload_fields(),
            self.payload_targets(),
        )?;
        definition.validate()?;

        debug!(
            action_url = self.action_url(),
            states = definition.states.len(),
            "generated flow fragment"
        );
        Ok(definition)
    }
}

fn task_objects(params: &mut Map<String, Value>) -> Vec<&mut Map<String, Value>> {
    match params.get_mut("tasks") {
        Some(Value::Array(tasks)) => tasks.iter_mut().filter_map(Value::as_object_mut).collect(),
        _ => Vec::new(),
    }
}

fn whole_parameters(params: &mut Map<String, Value>) -> Vec<&mut Map<String, Value>> {
    vec![params]
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// v2 payload: a list of tasks.
#[derive(Debug, Clone)]
pub struct ComputeV2Builder {
    action_url: String,
}

impl ComputeV2Builder {
    pub fn new() -> Self {
        Self {
            action_url: COMPUTE_V2_ACTION_URL.to_string(),
        }
    }

    pub fn with_action_url(mut self, url: impl Into<String>) -> Self {
        self.action_url = url.into();
        self
    }
}

impl Default for ComputeV2Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowBuilder for ComputeV2Builder {
    fn action_url(&self) -> &str {
        &self.action_url
    }

    fn payload_fields(&self) -> &'static [&'static str] {
        &["endpoint", "function", "payload"]
    }

    fn parameters(&self, function_key: &str) -> Map<String, Value> {
        object(json!({
            "tasks": [{
                "endpoint.$": ENDPOINT_REF,
                "function.$": format!("$.input.{function_key}"),
                "payload.$": PAYLOAD_REF,
            }]
        }))
    }

    fn payload_targets(&self) -> PayloadTargets {
        task_objects
    }
}

/// v3 payload: one call per state with keyword arguments.
#[derive(Debug, Clone)]
pub struct ComputeV3Builder {
    action_url: String,
}

impl ComputeV3Builder {
    pub fn new() -> Self {
        Self {
            action_url: COMPUTE_V3_ACTION_URL.to_string(),
        }
    }

    pub fn with_action_url(mut self, url: impl Into<String>) -> Self {
        self.action_url = url.into();
        self
    }
}

impl Default for ComputeV3Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowBuilder for ComputeV3Builder {
    fn action_url(&self) -> &str {
        &self.action_url
    }

    fn payload_fields(&self) -> &'static [&'static str] {
        &[
            "endpoint",
            "function",
            "args",
            "kwargs",
            "user_endpoint_config",
            "resource_specification",
        ]
    }

    fn parameters(&self, function_key: &str) -> Map<String, Value> {
        object(json!({
            "endpoint.$": ENDPOINT_REF,
            "function.$": format!("$.input.{function_key}"),
            "kwargs.$": PAYLOAD_REF,
        }))
    }

    fn payload_targets(&self) -> PayloadTargets {
        whole_parameters
    }
}

/// The builder for a payload schema, optionally against another action URL.
pub fn builder_for(schema: ComputeSchema, action_url: Option<&str>) -> Box<dyn FlowBuilder> {
    match (schema, action_url) {
        (ComputeSchema::V2, None) => Box::new(ComputeV2Builder::new()),
        (ComputeSchema::V2, Some(url)) => Box::new(ComputeV2Builder::new().with_action_url(url)),
        (ComputeSchema::V3, None) => Box::new(ComputeV3Builder::new()),
        (ComputeSchema::V3, Some(url)) => Box::new(ComputeV3Builder::new().with_action_url(url)),
    }
}

/// Reject two different functions sharing a name across `tools`.
///
/// Registered ids are stored per function name, so one name must mean one
/// function. Aliased copies of the same tool share their functions and pass.
pub fn check_function_names(tools: &[Tool]) -> Result<()> {
    let mut seen: BTreeMap<&str, (String, String)> = BTreeMap::new();
    for tool in tools {
        for function in tool.functions() {
            let checksum = function.checksum()?;
            match seen.get(function.name.as_str()) {
                Some((known, owner)) if *known != checksum => {
                    return Err(Error::Config(format!(
                        "function '{}' of tool '{}' differs from the function of the same name \
                         in tool '{owner}'; rename one of them",
                        function.name,
                        tool.label()
                    )));
                }
                Some(_) => {}
                None => {
                    seen.insert(&function.name, (checksum, tool.label()));
                }
            }
        }
    }
    Ok(())
}

/// The unaliased fragment a tool contributes.
///
/// A hand-written fragment wins over generation. Otherwise the tool's
/// functions are built with the builder its schema selects.
pub fn build_fragment(tool: &Tool) -> Result<FlowDefinition> {
    if let Some(definition) = tool.definition() {
        if !tool.modifiers().is_empty() {
            return Err(Error::Config(format!(
                "tool '{}': modifiers only apply to generated fragments",
                tool.name()
            )));
        }
        return Ok(definition.clone());
    }

    let built = match tool.function_set() {
        FunctionSet::Compute(functions) => {
            builder_for(tool.schema(), tool.action_url()).build(functions, tool.modifiers())
        }
        FunctionSet::LegacyFuncx(functions) => {
            if !tool.modifiers().is_empty() {
                return Err(Error::Config(format!(
                    "tool '{}' declares legacy funcx functions; modifiers need compute functions. \
                     Move them to compute functions to use modifiers",
                    tool.name()
                )));
            }
            builder_for(ComputeSchema::V2, tool.action_url()).build(functions, tool.modifiers())
        }
        FunctionSet::None => Err(Error::Config(format!(
            "tool '{}' has neither a flow definition nor compute functions",
            tool.name()
        ))),
    };
    built.map_err(|e| match e {
        Error::Config(message) if !message.starts_with("tool '") => {
            Error::Config(format!("tool '{}': {message}", tool.name()))
        }
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn functions(names: &[&str]) -> Vec<RemoteFunction> {
        names
            .iter()
            .map(|n| RemoteFunction::new(*n, format!("def {n}(**data):\n    return data\n")))
            .collect()
    }

    #[test]
    fn test_v2_single_state() {
        let def = ComputeV2Builder::new()
            .build(&functions(&["hello"]), &Modifiers::new())
            .unwrap();
        let value = serde_json::to_value(&def).unwrap();
        let hello = &value["States"]["Hello"];
        assert_eq!(value["StartAt"], "Hello");
        assert_eq!(hello["ActionUrl"], COMPUTE_V2_ACTION_URL);
        assert_eq!(hello["ResultPath"], "$.Hello");
        assert_eq!(hello["WaitTime"], 300);
        assert_eq!(hello["ExceptionOnActionFailure"], false);
        assert_eq!(hello["End"], true);
        assert_eq!(
            hello["Parameters"]["tasks"][0],
            json!({
                "endpoint.$": "$.input.compute_endpoint",
                "function.$": "$.input.hello_function_id",
                "payload.$": "$.input"
            })
        );
    }

    #[test]
    fn test_states_threaded_in_order() {
        let def = ComputeV3Builder::new()
            .build(&functions(&["first_step", "second_step"]), &Modifiers::new())
            .unwrap();
        let names: Vec<&str> = def.states.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["FirstStep", "SecondStep"]);
        assert_eq!(def.states["FirstStep"].next(), Some("SecondStep"));
        assert!(def.states["SecondStep"].has_end());

        let value = serde_json::to_value(&def.states["FirstStep"]).unwrap();
        assert_eq!(value["ActionUrl"], COMPUTE_V3_ACTION_URL);
        assert_eq!(value["Parameters"]["kwargs.$"], "$.input");
        assert_eq!(value["Parameters"]["function.$"], "$.input.first_step_function_id");
    }

    #[test]
    fn test_rejects_empty_and_duplicates() {
        assert!(ComputeV2Builder::new().build(&[], &Modifiers::new()).is_err());
        let err = ComputeV2Builder::new()
            .build(&functions(&["hello", "hello"]), &Modifiers::new())
            .unwrap_err();
        assert!(err.to_string().contains("duplicate state name 'Hello'"));
    }

    #[test]
    fn test_modifiers_rewrite_payload_and_top_level() {
        let mut modifiers = Modifiers::new();
        modifiers.insert(
            "goodbye".into(),
            object(json!({"payload": "hello", "WaitTime": 600, "endpoint": "other_endpoint"})),
        );
        let def = ComputeV2Builder::new()
            .build(&functions(&["hello", "goodbye"]), &modifiers)
            .unwrap();
        let value = serde_json::to_value(&def.states["Goodbye"]).unwrap();
        let task = &value["Parameters"]["tasks"][0];
        assert_eq!(task["payload.$"], "$.Hello.details.results");
        assert_eq!(task["endpoint.$"], "$.input.other_endpoint");
        assert!(task.get("payload").is_none());
        assert_eq!(value["WaitTime"], 600);
    }

    #[test]
    fn test_v3_expression_modifier() {
        let mut modifiers = Modifiers::new();
        modifiers.insert("Hello".into(), object(json!({"args": "=[input.a, input.b]"})));
        let def = ComputeV3Builder::new()
            .build(&functions(&["hello"]), &modifiers)
            .unwrap();
        let value = serde_json::to_value(&def.states["Hello"]).unwrap();
        assert_eq!(value["Parameters"]["args.="], "[input.a, input.b]");
    }

    #[test]
    fn test_unsupported_field_named() {
        let mut modifiers = Modifiers::new();
        modifiers.insert("hello".into(), object(json!({"kwargs": "x"})));
        let err = ComputeV2Builder::new()
            .build(&functions(&["hello"]), &modifiers)
            .unwrap_err();
        assert!(err.to_string().contains("'kwargs'"));
    }

    #[test]
    fn test_unknown_target_lists_allowed() {
        let mut modifiers = Modifiers::new();
        modifiers.insert("missing".into(), object(json!({"WaitTime": 5})));
        let err = ComputeV2Builder::new()
            .build(&functions(&["hello"]), &modifiers)
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("'missing'"));
        assert!(message.contains("hello, Hello"));
    }
}
