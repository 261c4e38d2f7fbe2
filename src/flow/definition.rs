//! Flow definitions and their states.
//!
//! A [`FlowDefinition`] is the JSON document the flow service executes:
//! `Comment`, `StartAt` and an ordered `States` map. States are a tagged enum
//! on their `Type` field; each variant keeps the fields it understands typed and
//! (for the variants that allow it) passes everything else through untouched.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::choice::ChoiceRule;
use crate::{Error, Result};

fn is_false(value: &bool) -> bool {
    !*value
}

/// A complete flow, or a fragment of one contributed by a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FlowDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub start_at: String,
    pub states: IndexMap<String, State>,
}

/// One node of a flow, tagged by `Type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Type")]
pub enum State {
    Action(ActionState),
    Pass(PassState),
    Choice(ChoiceState),
    Wait(WaitState),
    Fail(FailState),
    Succeed(SucceedState),
    ExpressionEval(ExpressionEvalState),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ActionState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub action_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception_on_action_failure: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catch: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub end: bool,
    /// Fields this crate does not model (`Parameters.$`, `ResultSelector`, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PassState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub end: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChoiceState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub choices: Vec<ChoiceRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WaitState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub end: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FailState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SucceedState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExpressionEvalState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub end: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn check_next_or_end(next: &Option<String>, end: bool) -> std::result::Result<(), String> {
    match (next, end) {
        (Some(_), true) => Err("sets both Next and End".into()),
        (None, false) => Err("needs either Next or End: true".into()),
        _ => Ok(()),
    }
}

fn check_path(field: &str, value: &Option<String>) -> std::result::Result<(), String> {
    match value {
        Some(path) if !path.starts_with('$') => {
            Err(format!("{field} '{path}' must be a JSON path"))
        }
        _ => Ok(()),
    }
}

impl State {
    /// The `Type` tag of this state.
    pub fn kind(&self) -> &'static str {
        match self {
            State::Action(_) => "Action",
            State::Pass(_) => "Pass",
            State::Choice(_) => "Choice",
            State::Wait(_) => "Wait",
            State::Fail(_) => "Fail",
            State::Succeed(_) => "Succeed",
            State::ExpressionEval(_) => "ExpressionEval",
        }
    }

    /// The `Next` field, for states that have one.
    pub fn next(&self) -> Option<&str> {
        match self {
            State::Action(s) => s.next.as_deref(),
            State::Pass(s) => s.next.as_deref(),
            State::Wait(s) => s.next.as_deref(),
            State::ExpressionEval(s) => s.next.as_deref(),
            State::Choice(_) | State::Fail(_) | State::Succeed(_) => None,
        }
    }

    /// Whether the state carries `End: true`.
    pub fn has_end(&self) -> bool {
        match self {
            State::Action(s) => s.end,
            State::Pass(s) => s.end,
            State::Wait(s) => s.end,
            State::ExpressionEval(s) => s.end,
            State::Choice(_) | State::Fail(_) | State::Succeed(_) => false,
        }
    }

    /// Whether a run stops once it reaches this state.
    pub fn is_terminal(&self) -> bool {
        self.has_end() || matches!(self, State::Fail(_) | State::Succeed(_))
    }

    /// Continue into `target` instead of ending here.
    ///
    /// For a `Choice` state this fills in the `Default` branch. A `Choice`
    /// that already defaults elsewhere is an error.
    pub fn set_next(&mut self, target: impl Into<String>) -> Result<()> {
        let target = target.into();
        let kind = self.kind();
        match self {
            State::Action(s) => {
                s.next = Some(target);
                s.end = false;
            }
            State::Pass(s) => {
                s.next = Some(target);
                s.end = false;
            }
            State::Wait(s) => {
                s.next = Some(target);
                s.end = false;
            }
            State::ExpressionEval(s) => {
                s.next = Some(target);
                s.end = false;
            }
            State::Choice(s) => {
                if let Some(existing) = s.default.as_deref().filter(|d| *d != target) {
                    return Err(Error::Config(format!(
                        "choice state already defaults to '{existing}' and cannot also continue into '{target}'"
                    )));
                }
                s.default = Some(target);
            }
            State::Fail(_) | State::Succeed(_) => {
                return Err(Error::Config(format!(
                    "a {kind} state cannot continue into '{target}'"
                )))
            }
        }
        Ok(())
    }

    /// Make this state the last one of its flow.
    pub fn set_end(&mut self) {
        match self {
            State::Action(s) => {
                s.next = None;
                s.end = true;
            }
            State::Pass(s) => {
                s.next = None;
                s.end = true;
            }
            State::Wait(s) => {
                s.next = None;
                s.end = true;
            }
            State::ExpressionEval(s) => {
                s.next = None;
                s.end = true;
            }
            State::Choice(_) | State::Fail(_) | State::Succeed(_) => {}
        }
    }

    /// Transition targets in evaluation order: choice rules, then `Default`.
    pub fn successors(&self) -> Vec<&str> {
        match self {
            State::Choice(s) => s
                .choices
                .iter()
                .map(|rule| rule.next.as_str())
                .chain(s.default.as_deref())
                .collect(),
            other => other.next().into_iter().collect(),
        }
    }

    /// Rename every transition target with `rename`.
    pub fn retarget(&mut self, rename: impl Fn(&str) -> String) {
        let apply = |slot: &mut Option<String>| {
            if let Some(target) = slot.as_mut() {
                *target = rename(target);
            }
        };
        match self {
            State::Action(s) => apply(&mut s.next),
            State::Pass(s) => apply(&mut s.next),
            State::Wait(s) => apply(&mut s.next),
            State::ExpressionEval(s) => apply(&mut s.next),
            State::Choice(s) => {
                for rule in &mut s.choices {
                    rule.next = rename(&rule.next);
                }
                apply(&mut s.default);
            }
            State::Fail(_) | State::Succeed(_) => {}
        }
    }

    /// Per-variant field checks.
    pub fn validate(&self) -> std::result::Result<(), String> {
        match self {
            State::Action(s) => {
                if s.action_url.trim().is_empty() {
                    return Err("ActionUrl is empty".into());
                }
                check_path("ResultPath", &s.result_path)?;
                check_path("InputPath", &s.input_path)?;
                check_next_or_end(&s.next, s.end)
            }
            State::Pass(s) => {
                check_path("ResultPath", &s.result_path)?;
                check_path("InputPath", &s.input_path)?;
                check_next_or_end(&s.next, s.end)
            }
            State::ExpressionEval(s) => {
                check_path("ResultPath", &s.result_path)?;
                check_next_or_end(&s.next, s.end)
            }
            State::Wait(s) => {
                let set = [
                    s.seconds.is_some(),
                    s.timestamp.is_some(),
                    s.seconds_path.is_some(),
                    s.timestamp_path.is_some(),
                ]
                .iter()
                .filter(|b| **b)
                .count();
                if set != 1 {
                    return Err(
                        "needs exactly one of Seconds, Timestamp, SecondsPath, TimestampPath"
                            .into(),
                    );
                }
                check_path("SecondsPath", &s.seconds_path)?;
                check_path("TimestampPath", &s.timestamp_path)?;
                check_next_or_end(&s.next, s.end)
            }
            State::Choice(s) => {
                if s.choices.is_empty() {
                    return Err("Choices is empty".into());
                }
                s.choices
                    .iter()
                    .try_for_each(|rule| rule.condition.validate())
            }
            State::Fail(_) | State::Succeed(_) => Ok(()),
        }
    }
}

impl FlowDefinition {
    pub fn new(start_at: impl Into<String>) -> Self {
        Self {
            comment: None,
            start_at: start_at.into(),
            states: IndexMap::new(),
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_state(mut self, name: impl Into<String>, state: State) -> Self {
        self.states.insert(name.into(), state);
        self
    }

    /// Parse a definition from JSON text.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Parse a definition from YAML text.
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw)
            .map_err(|e| Error::Config(format!("invalid flow definition YAML: {e}")))
    }

    /// Load a definition from a `.json`, `.yaml` or `.yml` file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&raw),
            _ => Self::from_json_str(&raw),
        }
    }

    pub fn to_pretty_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Content checksum over the canonical JSON form.
    pub fn checksum(&self) -> Result<String> {
        crate::checksum::checksum(self)
    }

    /// States reachable from `StartAt` in visiting order (choice rules in
    /// order, then `Default`), followed by any unreachable states.
    pub fn ordered_state_names(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut order = Vec::with_capacity(self.states.len());
        let mut queue = VecDeque::from([self.start_at.as_str()]);

        while let Some(name) = queue.pop_front() {
            if !self.states.contains_key(name) || !seen.insert(name.to_string()) {
                continue;
            }
            order.push(name.to_string());
            if let Some(state) = self.states.get(name) {
                queue.extend(state.successors());
            }
        }

        for name in self.states.keys() {
            if !seen.contains(name) {
                order.push(name.clone());
            }
        }
        order
    }

    /// States that carry `End: true`, in flow order.
    pub fn end_states(&self) -> Vec<String> {
        self.ordered_state_names()
            .into_iter()
            .filter(|name| self.states.get(name).is_some_and(State::has_end))
            .collect()
    }

    /// Check the definition is well formed.
    ///
    /// Every state passes its own checks, every transition target exists,
    /// every reachable state can reach a terminal state and any cycle passes
    /// through a `Choice` state.
    pub fn validate(&self) -> Result<()> {
        if self.states.is_empty() {
            return Err(Error::Config("flow definition has no states".into()));
        }
        if !self.states.contains_key(&self.start_at) {
            return Err(Error::Config(format!(
                "StartAt '{}' is not a state of the flow",
                self.start_at
            )));
        }

        for (name, state) in &self.states {
            state
                .validate()
                .map_err(|e| Error::Config(format!("state '{name}': {e}")))?;
            for target in state.successors() {
                if !self.states.contains_key(target) {
                    return Err(Error::Config(format!(
                        "state '{name}' transitions to unknown state '{target}'"
                    )));
                }
            }
        }

        self.check_termination()?;
        self.check_cycles()
    }

    fn check_termination(&self) -> Result<()> {
        let mut terminates: BTreeSet<&str> = self
            .states
            .iter()
            .filter(|(_, s)| s.is_terminal())
            .map(|(n, _)| n.as_str())
            .collect();
        if terminates.is_empty() {
            return Err(Error::Config("flow has no terminal state".into()));
        }

        loop {
            let before = terminates.len();
            for (name, state) in &self.states {
                if terminates.contains(name.as_str()) {
                    continue;
                }
                if state.successors().iter().any(|t| terminates.contains(t)) {
                    terminates.insert(name.as_str());
                }
            }
            if terminates.len() == before {
                break;
            }
        }

        let reachable = reachable_from(self, &self.start_at);
        for name in self.ordered_state_names() {
            if reachable.contains(name.as_str()) && !terminates.contains(name.as_str()) {
                return Err(Error::Config(format!(
                    "state '{name}' never reaches a terminal state"
                )));
            }
        }
        Ok(())
    }

    fn check_cycles(&self) -> Result<()> {
        #[derive(Clone, Copy)]
        enum Mark {
            Visiting,
            Done,
        }

        let mut marks: HashMap<&str, Mark> = HashMap::new();
        for start in self.states.keys() {
            if marks.contains_key(start.as_str()) {
                continue;
            }
            let mut stack: Vec<(&str, bool)> = vec![(start.as_str(), false)];
            while let Some((name, exiting)) = stack.pop() {
                if exiting {
                    marks.insert(name, Mark::Done);
                    continue;
                }
                if marks.contains_key(name) {
                    continue;
                }
                marks.insert(name, Mark::Visiting);
                stack.push((name, true));

                let Some(state) = self.states.get(name) else {
                    continue;
                };
                if matches!(state, State::Choice(_)) {
                    continue;
                }
                if let Some(next) = state.next() {
                    match marks.get(next) {
                        Some(Mark::Visiting) => {
                            return Err(Error::Config(format!(
                                "states '{name}' and '{next}' form a cycle without a Choice state"
                            )))
                        }
                        Some(Mark::Done) => {}
                        None => stack.push((next, false)),
                    }
                }
            }
        }
        Ok(())
    }
}

fn reachable_from<'a>(def: &'a FlowDefinition, start: &'a str) -> BTreeSet<&'a str> {
    let mut seen = BTreeSet::new();
    let mut stack = vec![start];
    while let Some(name) = stack.pop() {
        let Some((key, state)) = def.states.get_key_value(name) else {
            continue;
        };
        if seen.insert(key.as_str()) {
            stack.extend(state.successors());
        }
    }
    seen
}

impl From<ActionState> for State {
    fn from(state: ActionState) -> Self {
        State::Action(state)
    }
}

impl From<PassState> for State {
    fn from(state: PassState) -> Self {
        State::Pass(state)
    }
}

impl From<ChoiceState> for State {
    fn from(state: ChoiceState) -> Self {
        State::Choice(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn linear() -> FlowDefinition {
        FlowDefinition::from_json_str(
            r#"{
                "StartAt": "One",
                "States": {
                    "One": {"Type": "Pass", "Next": "Two"},
                    "Two": {"Type": "Action", "ActionUrl": "https://actions.example.org",
                            "Parameters": {"a.$": "$.input.a"}, "ResultPath": "$.Two",
                            "End": true}
                }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_parse_and_serialize() {
        let def = linear();
        assert_eq!(def.states["One"].kind(), "Pass");
        assert_eq!(def.states["One"].next(), Some("Two"));
        assert!(def.states["Two"].has_end());

        let value = serde_json::to_value(&def).unwrap();
        assert_eq!(value["States"]["Two"]["Type"], "Action");
        assert_eq!(value["States"]["Two"]["End"], true);
        assert!(value["States"]["One"].get("End").is_none());
        assert!(value.get("Comment").is_none());
        def.validate().unwrap();
    }

    #[test]
    fn test_unknown_action_fields_pass_through() {
        let def = FlowDefinition::from_json_str(
            r#"{"StartAt": "A", "States": {"A": {"Type": "Action",
                "ActionUrl": "https://x", "ResultSelector": {"r.$": "$.x"}, "End": true}}}"#,
        )
        .unwrap();
        let value = serde_json::to_value(&def).unwrap();
        assert_eq!(value["States"]["A"]["ResultSelector"], json!({"r.$": "$.x"}));
    }

    #[test]
    fn test_missing_target_rejected() {
        let mut def = linear();
        def.states
            .get_mut("One")
            .unwrap()
            .set_next("Nowhere")
            .unwrap();
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("unknown state 'Nowhere'"));
    }

    #[test]
    fn test_next_and_end_both_rejected() {
        let def = FlowDefinition::from_json_str(
            r#"{"StartAt": "A", "States": {"A": {"Type": "Pass", "Next": "A", "End": true}}}"#,
        )
        .unwrap();
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_plain_cycle_rejected() {
        let def = FlowDefinition::from_json_str(
            r#"{"StartAt": "A", "States": {
                "A": {"Type": "Pass", "Next": "B"},
                "B": {"Type": "Pass", "Next": "A"},
                "C": {"Type": "Succeed"}
            }}"#,
        )
        .unwrap();
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_choice_back_edge_allowed() {
        let def = FlowDefinition::from_json_str(
            r#"{"StartAt": "Work", "States": {
                "Work": {"Type": "Pass", "Next": "Again"},
                "Again": {"Type": "Choice",
                          "Choices": [{"Variable": "$.retry", "BooleanEquals": true, "Next": "Work"}],
                          "Default": "Done"},
                "Done": {"Type": "Succeed"}
            }}"#,
        )
        .unwrap();
        def.validate().unwrap();
        assert_eq!(def.ordered_state_names(), vec!["Work", "Again", "Done"]);
    }

    #[test]
    fn test_wait_needs_one_duration() {
        let def = FlowDefinition::from_json_str(
            r#"{"StartAt": "W", "States": {"W": {"Type": "Wait", "End": true}}}"#,
        )
        .unwrap();
        assert!(def.validate().is_err());

        let def = FlowDefinition::from_json_str(
            r#"{"StartAt": "W", "States": {"W": {"Type": "Wait", "Seconds": 5, "End": true}}}"#,
        )
        .unwrap();
        def.validate().unwrap();
    }

    #[test]
    fn test_set_next_on_terminal_types() {
        let mut fail = State::Fail(FailState::default());
        assert!(fail.set_next("X").is_err());

        let mut pass = State::Pass(PassState {
            end: true,
            ..Default::default()
        });
        pass.set_next("X").unwrap();
        assert_eq!(pass.next(), Some("X"));
        assert!(!pass.has_end());
    }

    #[test]
    fn test_set_next_keeps_choice_default() {
        let mut open = State::Choice(ChoiceState::default());
        open.set_next("X").unwrap();
        assert!(matches!(&open, State::Choice(c) if c.default.as_deref() == Some("X")));

        let mut decided = State::Choice(ChoiceState {
            default: Some("Elsewhere".into()),
            ..Default::default()
        });
        let err = decided.set_next("X").unwrap_err().to_string();
        assert!(err.contains("'Elsewhere'"), "{err}");
        decided.set_next("Elsewhere").unwrap();
    }

    #[test]
    fn test_checksum_ignores_state_insertion_order() {
        let a = FlowDefinition::new("One")
            .with_state("One", State::Pass(PassState { next: Some("Two".into()), ..Default::default() }))
            .with_state("Two", State::Succeed(SucceedState::default()));
        let b = FlowDefinition::new("One")
            .with_state("Two", State::Succeed(SucceedState::default()))
            .with_state("One", State::Pass(PassState { next: Some("Two".into()), ..Default::default() }));
        assert_eq!(a.checksum().unwrap(), b.checksum().unwrap());
    }

    #[test]
    fn test_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flow.yaml");
        std::fs::write(
            &path,
            "StartAt: A\nStates:\n  A:\n    Type: Pass\n    End: true\n",
        )
        .unwrap();
        let def = FlowDefinition::from_path(&path).unwrap();
        assert_eq!(def.start_at, "A");
        def.validate().unwrap();
    }
}
