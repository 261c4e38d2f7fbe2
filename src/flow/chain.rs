//! Chaining per-tool fragments into one flow.

use indexmap::IndexMap;
use tracing::debug;

use super::definition::FlowDefinition;
use crate::{Error, Result};

/// One fragment to chain, with the tool it came from.
#[derive(Debug, Clone)]
pub struct ChainLink {
    /// Tool label used in error messages (`hello` or `hello:First`).
    pub tool: String,
    pub definition: FlowDefinition,
    /// States that continue into the next fragment. When `None`, every state
    /// with `End: true` does.
    pub transition_states: Option<Vec<String>>,
}

impl ChainLink {
    pub fn new(tool: impl Into<String>, definition: FlowDefinition) -> Self {
        Self {
            tool: tool.into(),
            definition,
            transition_states: None,
        }
    }

    pub fn with_transition_states(mut self, states: Vec<String>) -> Self {
        self.transition_states = Some(states);
        self
    }

    fn transitions(&self) -> Result<Vec<String>> {
        let states = match &self.transition_states {
            Some(declared) if !declared.is_empty() => declared.clone(),
            _ => self.definition.end_states(),
        };
        if states.is_empty() {
            return Err(Error::Config(format!(
                "tool '{}' has no state to continue from",
                self.tool
            )));
        }
        for name in &states {
            if !self.definition.states.contains_key(name) {
                return Err(Error::Config(format!(
                    "tool '{}' declares transition state '{name}' which it does not define",
                    self.tool
                )));
            }
        }
        Ok(states)
    }
}

/// Merge `links` in order into a single flow.
///
/// The transition states of each fragment continue into the entry state of
/// the next one. The combined flow starts at the first fragment's entry.
pub fn chain(links: Vec<ChainLink>) -> Result<FlowDefinition> {
    if links.is_empty() {
        return Err(Error::Config("no flow fragments to chain".into()));
    }

    let mut owners: IndexMap<String, String> = IndexMap::new();
    for link in &links {
        link.definition
            .validate()
            .map_err(|e| Error::Config(format!("tool '{}': {e}", link.tool)))?;
        for name in link.definition.states.keys() {
            if let Some(owner) = owners.insert(name.clone(), link.tool.clone()) {
                return Err(Error::Config(format!(
                    "state '{name}' is defined by both '{owner}' and '{}'; give one of them an alias",
                    link.tool
                )));
            }
        }
    }

    let entries: Vec<String> = links
        .iter()
        .map(|link| link.definition.start_at.clone())
        .collect();
    let single_comment = match links.as_slice() {
        [only] => only.definition.comment.clone(),
        _ => None,
    };

    let mut states = IndexMap::with_capacity(owners.len());
    for (index, link) in links.iter().enumerate() {
        let mut fragment = link.definition.clone();
        if let Some(next_entry) = entries.get(index + 1) {
            for name in link.transitions()? {
                if let Some(state) = fragment.states.get_mut(&name) {
                    state.set_next(next_entry.as_str()).map_err(|e| {
                        Error::Config(format!("tool '{}': {e}", link.tool))
                    })?;
                }
            }
        }
        for name in fragment.ordered_state_names() {
            if let Some(state) = fragment.states.shift_remove(&name) {
                states.insert(name, state);
            }
        }
    }

    let comment = single_comment.unwrap_or_else(|| {
        let names: Vec<&str> = states.keys().map(String::as_str).collect();
        format!("Flow with states: {}", names.join(", "))
    });

    let flow = FlowDefinition {
        comment: Some(comment),
        start_at: entries[0].clone(),
        states,
    };
    flow.validate()?;
    debug!(states = flow.states.len(), "chained flow fragments");
    Ok(flow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn linear(names: &[&str]) -> FlowDefinition {
        let mut states = serde_json::Map::new();
        for (i, name) in names.iter().enumerate() {
            let mut state = json!({"Type": "Pass"});
            match names.get(i + 1) {
                Some(next) => state["Next"] = json!(next),
                None => state["End"] = json!(true),
            }
            states.insert(name.to_string(), state);
        }
        serde_json::from_value(json!({"StartAt": names[0], "States": states})).unwrap()
    }

    #[test]
    fn test_linear_chain() {
        let flow = chain(vec![
            ChainLink::new("a", linear(&["A1", "A2"])),
            ChainLink::new("b", linear(&["B1"])),
        ])
        .unwrap();
        assert_eq!(flow.start_at, "A1");
        assert_eq!(flow.states["A2"].next(), Some("B1"));
        assert!(!flow.states["A2"].has_end());
        assert!(flow.states["B1"].has_end());
        assert_eq!(flow.comment.as_deref(), Some("Flow with states: A1, A2, B1"));
    }

    #[test]
    fn test_conflict_names_tools() {
        let err = chain(vec![
            ChainLink::new("hello", linear(&["Hello"])),
            ChainLink::new("hello_again", linear(&["Hello"])),
        ])
        .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("'hello'"));
        assert!(message.contains("'hello_again'"));
    }

    #[test]
    fn test_declared_transitions() {
        let branching: FlowDefinition = serde_json::from_value(json!({
            "StartAt": "Check",
            "States": {
                "Check": {"Type": "Choice",
                          "Choices": [{"Variable": "$.input.ok", "BooleanEquals": true, "Next": "Good"}],
                          "Default": "Bad"},
                "Good": {"Type": "Pass", "End": true},
                "Bad": {"Type": "Fail", "Error": "nope"}
            }
        }))
        .unwrap();
        let flow = chain(vec![
            ChainLink::new("branch", branching.clone()).with_transition_states(vec!["Good".into()]),
            ChainLink::new("last", linear(&["Last"])),
        ])
        .unwrap();
        assert_eq!(flow.states["Good"].next(), Some("Last"));
        assert_eq!(flow.states["Bad"].kind(), "Fail");

        let err = chain(vec![
            ChainLink::new("branch", branching).with_transition_states(vec!["Check".into()]),
            ChainLink::new("last", linear(&["Last"])),
        ])
        .unwrap_err()
        .to_string();
        assert!(err.contains("tool 'branch'"), "{err}");
        assert!(err.contains("'Bad'"), "{err}");
    }

    #[test]
    fn test_single_fragment_keeps_comment() {
        let flow = chain(vec![ChainLink::new(
            "a",
            linear(&["A"]).with_comment("Just A"),
        )])
        .unwrap();
        assert_eq!(flow.comment.as_deref(), Some("Just A"));
    }

    #[test]
    fn test_ill_formed_fragment_rejected() {
        let mut broken = linear(&["A", "B"]);
        broken.states.shift_remove("B");
        assert!(chain(vec![ChainLink::new("a", broken)]).is_err());
        assert!(chain(vec![]).is_err());
    }
}
