//! Instance aliases for tools used more than once in a flow.
//!
//! Aliasing a fragment suffixes every state name with the alias and moves the
//! tool's input variables into their own namespace (`$.input.message` becomes
//! `$.input.first_message` for alias `First`). Variables in the exempt set keep
//! their shared name.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use serde_json::Value;

use super::definition::{FlowDefinition, State};
use crate::naming::alias_prefix;
use crate::{Error, Result};

/// Input variables shared by every instance unless configured otherwise.
pub const DEFAULT_EXEMPT: &[&str] = &["compute_endpoint"];

const INPUT_PREFIX: &str = "$.input.";

/// The alias given to one tool instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alias {
    name: String,
    exempt: BTreeSet<String>,
}

impl Alias {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exempt: DEFAULT_EXEMPT.iter().map(|v| v.to_string()).collect(),
        }
    }

    /// Replace the set of input variables that are never renamed.
    pub fn with_exempt<I, S>(mut self, exempt: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exempt = exempt.into_iter().map(Into::into).collect();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exempt(&self) -> &BTreeSet<String> {
        &self.exempt
    }

    /// `Hello` -> `HelloFirst`.
    pub fn state_name(&self, state: &str) -> String {
        format!("{state}{}", self.name)
    }

    /// The aliased name of input variable `var`, given the tool's inputs.
    pub fn variable(&self, var: &str, inputs: &BTreeSet<String>) -> String {
        if inputs.contains(var) && !self.exempt.contains(var) {
            format!("{}{var}", alias_prefix(&self.name))
        } else {
            var.to_string()
        }
    }

    /// Rewrite one JSON path string.
    fn rewrite_path(&self, path: &str, states: &BTreeSet<String>, inputs: &BTreeSet<String>) -> Option<String> {
        if let Some(rest) = path.strip_prefix(INPUT_PREFIX) {
            let (head, tail) = split_segment(rest);
            let renamed = self.variable(head, inputs);
            return (renamed != head).then(|| format!("{INPUT_PREFIX}{renamed}{tail}"));
        }

        let rest = path.strip_prefix("$.")?;
        let (head, tail) = split_segment(rest);
        states
            .contains(head)
            .then(|| format!("$.{}{tail}", self.state_name(head)))
    }

    fn rewrite_value(&self, value: &mut Value, states: &BTreeSet<String>, inputs: &BTreeSet<String>) {
        match value {
            Value::String(s) => {
                if let Some(renamed) = self.rewrite_path(s, states, inputs) {
                    *s = renamed;
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.rewrite_value(item, states, inputs);
                }
            }
            Value::Object(map) => {
                for item in map.values_mut() {
                    self.rewrite_value(item, states, inputs);
                }
            }
            _ => {}
        }
    }
}

impl From<&str> for Alias {
    fn from(name: &str) -> Self {
        Alias::new(name)
    }
}

impl From<String> for Alias {
    fn from(name: String) -> Self {
        Alias::new(name)
    }
}

fn split_segment(path: &str) -> (&str, &str) {
    let end = path.find(['.', '[']).unwrap_or(path.len());
    path.split_at(end)
}

/// Return an aliased copy of `definition`.
///
/// `inputs` is the tool's original input set (required names and names with
/// defaults).
pub fn alias_definition(
    definition: &FlowDefinition,
    alias: &Alias,
    inputs: &BTreeSet<String>,
) -> Result<FlowDefinition> {
    if alias.name.is_empty() {
        return Err(Error::Config("alias must not be empty".into()));
    }

    let states: BTreeSet<String> = definition.states.keys().cloned().collect();
    let rename = |target: &str| {
        if states.contains(target) {
            alias.state_name(target)
        } else {
            target.to_string()
        }
    };

    let mut renamed = IndexMap::with_capacity(definition.states.len());
    for (name, state) in &definition.states {
        let mut value = serde_json::to_value(state)?;
        alias.rewrite_value(&mut value, &states, inputs);
        let mut state: State = serde_json::from_value(value).map_err(|e| {
            Error::Config(format!("state '{name}' is invalid after aliasing: {e}"))
        })?;
        state.retarget(rename);
        renamed.insert(alias.state_name(name), state);
    }

    Ok(FlowDefinition {
        comment: definition.comment.clone(),
        start_at: rename(&definition.start_at),
        states: renamed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fragment() -> FlowDefinition {
        serde_json::from_value(json!({
            "StartAt": "Hello",
            "States": {
                "Hello": {
                    "Type": "Action",
                    "ActionUrl": "https://compute.actions.globus.org",
                    "Parameters": {"tasks": [{
                        "endpoint.$": "$.input.compute_endpoint",
                        "function.$": "$.input.hello_function_id",
                        "payload.$": "$.input"
                    }]},
                    "ResultPath": "$.Hello",
                    "Next": "Check"
                },
                "Check": {
                    "Type": "Choice",
                    "Choices": [{"Variable": "$.input.message.length", "NumericGreaterThan": 3, "Next": "Done"}],
                    "Default": "Echo"
                },
                "Echo": {
                    "Type": "Pass",
                    "Parameters": {"seen.$": "$.Hello.details.results", "msg.$": "$.input.message"},
                    "ResultPath": "$.Echo",
                    "End": true
                },
                "Done": {"Type": "Succeed"}
            }
        }))
        .unwrap()
    }

    fn inputs() -> BTreeSet<String> {
        ["message", "compute_endpoint"].iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_states_and_targets_suffixed() {
        let aliased = alias_definition(&fragment(), &Alias::new("First"), &inputs()).unwrap();
        let names: Vec<&str> = aliased.states.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["HelloFirst", "CheckFirst", "EchoFirst", "DoneFirst"]);
        assert_eq!(aliased.start_at, "HelloFirst");
        assert_eq!(aliased.states["HelloFirst"].next(), Some("CheckFirst"));
        assert_eq!(
            aliased.states["CheckFirst"].successors(),
            vec!["DoneFirst", "EchoFirst"]
        );
        aliased.validate().unwrap();
    }

    #[test]
    fn test_paths_rewritten() {
        let aliased = alias_definition(&fragment(), &Alias::new("First"), &inputs()).unwrap();
        let value = serde_json::to_value(&aliased).unwrap();
        let task = &value["States"]["HelloFirst"]["Parameters"]["tasks"][0];
        assert_eq!(task["endpoint.$"], "$.input.compute_endpoint");
        assert_eq!(task["function.$"], "$.input.hello_function_id");
        assert_eq!(task["payload.$"], "$.input");
        assert_eq!(value["States"]["HelloFirst"]["ResultPath"], "$.HelloFirst");

        let echo = &value["States"]["EchoFirst"]["Parameters"];
        assert_eq!(echo["seen.$"], "$.HelloFirst.details.results");
        assert_eq!(echo["msg.$"], "$.input.first_message");

        let rule = &value["States"]["CheckFirst"]["Choices"][0];
        assert_eq!(rule["Variable"], "$.input.first_message.length");
    }

    #[test]
    fn test_exempt_set_configurable() {
        let alias = Alias::new("Second").with_exempt(["message"]);
        let aliased = alias_definition(&fragment(), &alias, &inputs()).unwrap();
        let value = serde_json::to_value(&aliased).unwrap();
        let task = &value["States"]["HelloSecond"]["Parameters"]["tasks"][0];
        assert_eq!(task["endpoint.$"], "$.input.second_compute_endpoint");
        assert_eq!(
            value["States"]["EchoSecond"]["Parameters"]["msg.$"],
            "$.input.message"
        );
    }

    #[test]
    fn test_variable_naming() {
        let alias = Alias::new("BigRun");
        assert_eq!(alias.variable("message", &inputs()), "big_run_message");
        assert_eq!(alias.variable("compute_endpoint", &inputs()), "compute_endpoint");
        assert_eq!(alias.variable("unknown", &inputs()), "unknown");
    }
}
