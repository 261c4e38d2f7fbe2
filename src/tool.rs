//! Tools: reusable bundles of remote functions and a flow fragment.
//!
//! # Example
//!
//! ```
//! use toolflow::tool::{RemoteFunction, Tool};
//!
//! let hello = Tool::builder("hello")
//!     .compute_function(RemoteFunction::new(
//!         "hello",
//!         "def hello(message, **data):\n    return message\n",
//!     ))
//!     .required_input(["message", "compute_endpoint"])
//!     .build();
//!
//! let first = hello.aliased("First");
//! assert_eq!(first.label(), "hello:First");
//! assert!(first.required_input().contains(&"first_message".to_string()));
//! ```

use std::collections::{BTreeMap, BTreeSet};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::flow::alias::{alias_definition, Alias};
use crate::flow::builder::build_fragment;
use crate::flow::definition::FlowDefinition;
use crate::flow::modifiers::Modifiers;
use crate::{Error, Result};

/// A function uploaded to the remote function service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFunction {
    /// snake_case identifier; names the generated state and storage keys.
    pub name: String,
    /// Source the function service executes.
    pub source: String,
    /// Callable inside `source` to invoke. Defaults to `name`.
    pub entry_point: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl RemoteFunction {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            entry_point: name.clone(),
            name,
            source: source.into(),
            description: None,
        }
    }

    pub fn with_entry_point(mut self, entry_point: impl Into<String>) -> Self {
        self.entry_point = entry_point.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Checksum of the registered form.
    ///
    /// Line endings are normalized so the same source checks out identically
    /// on every platform. The description is not part of the checksum.
    pub fn checksum(&self) -> Result<String> {
        let source = self.source.replace("\r\n", "\n");
        crate::checksum::checksum(&json!({
            "entry_point": self.entry_point,
            "name": self.name,
            "source": source,
        }))
    }
}

/// Which compute payload shape generated states use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeSchema {
    #[default]
    V2,
    V3,
}

/// The remote functions a tool carries, by how they are declared.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum FunctionSet {
    #[default]
    None,
    Compute(Vec<RemoteFunction>),
    /// Functions declared the pre-compute way. They register and run like
    /// compute functions but cannot take modifiers.
    LegacyFuncx(Vec<RemoteFunction>),
}

impl FunctionSet {
    pub fn functions(&self) -> &[RemoteFunction] {
        match self {
            FunctionSet::None => &[],
            FunctionSet::Compute(functions) | FunctionSet::LegacyFuncx(functions) => functions,
        }
    }
}

/// An immutable tool, optionally aliased.
#[derive(Debug, Clone)]
pub struct Tool {
    name: String,
    functions: FunctionSet,
    schema: ComputeSchema,
    action_url: Option<String>,
    definition: Option<FlowDefinition>,
    modifiers: Modifiers,
    required_input: Vec<String>,
    defaults: IndexMap<String, Value>,
    transition_states: Vec<String>,
    alias: Option<Alias>,
}

impl Tool {
    pub fn builder(name: impl Into<String>) -> ToolBuilder {
        ToolBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `name`, or `name:Alias` for an aliased instance.
    pub fn label(&self) -> String {
        match &self.alias {
            Some(alias) => format!("{}:{}", self.name, alias.name()),
            None => self.name.clone(),
        }
    }

    pub fn alias(&self) -> Option<&Alias> {
        self.alias.as_ref()
    }

    /// A copy of this tool instantiated under `alias`.
    pub fn aliased(&self, alias: impl Into<Alias>) -> Tool {
        Tool {
            alias: Some(alias.into()),
            ..self.clone()
        }
    }

    pub fn functions(&self) -> &[RemoteFunction] {
        self.functions.functions()
    }

    pub fn function_set(&self) -> &FunctionSet {
        &self.functions
    }

    pub fn schema(&self) -> ComputeSchema {
        self.schema
    }

    pub fn action_url(&self) -> Option<&str> {
        self.action_url.as_deref()
    }

    /// The hand-written fragment, if the tool has one.
    pub fn definition(&self) -> Option<&FlowDefinition> {
        self.definition.as_ref()
    }

    pub fn modifiers(&self) -> &Modifiers {
        &self.modifiers
    }

    /// Input names before aliasing: required names and names with defaults.
    pub fn input_names(&self) -> BTreeSet<String> {
        self.required_input
            .iter()
            .cloned()
            .chain(self.defaults.keys().cloned())
            .collect()
    }

    fn input_name(&self, var: &str, inputs: &BTreeSet<String>) -> String {
        match &self.alias {
            Some(alias) => alias.variable(var, inputs),
            None => var.to_string(),
        }
    }

    /// Required input names as the compiled flow references them.
    pub fn required_input(&self) -> Vec<String> {
        let inputs = self.input_names();
        self.required_input
            .iter()
            .map(|var| self.input_name(var, &inputs))
            .collect()
    }

    /// Default input values under their flow-visible names.
    pub fn defaults(&self) -> IndexMap<String, Value> {
        let inputs = self.input_names();
        self.defaults
            .iter()
            .map(|(var, value)| (self.input_name(var, &inputs), value.clone()))
            .collect()
    }

    /// Declared transition states, renamed for the alias.
    pub fn transition_states(&self) -> Option<Vec<String>> {
        if self.transition_states.is_empty() {
            return None;
        }
        Some(
            self.transition_states
                .iter()
                .map(|state| match &self.alias {
                    Some(alias) => alias.state_name(state),
                    None => state.clone(),
                })
                .collect(),
        )
    }

    /// The fragment this tool contributes to a flow, aliased if needed.
    pub fn flow_fragment(&self) -> Result<FlowDefinition> {
        let fragment = build_fragment(self)?;
        match &self.alias {
            Some(alias) => alias_definition(&fragment, alias, &self.input_names()),
            None => Ok(fragment),
        }
    }
}

/// Builder for [`Tool`].
#[derive(Debug, Clone)]
pub struct ToolBuilder {
    tool: Tool,
    legacy: bool,
}

impl ToolBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            tool: Tool {
                name: name.into(),
                functions: FunctionSet::None,
                schema: ComputeSchema::default(),
                action_url: None,
                definition: None,
                modifiers: Modifiers::new(),
                required_input: Vec::new(),
                defaults: IndexMap::new(),
                transition_states: Vec::new(),
                alias: None,
            },
            legacy: false,
        }
    }

    /// Add one compute function; states follow the order functions are added.
    pub fn compute_function(mut self, function: RemoteFunction) -> Self {
        let mut functions = std::mem::take(&mut self.tool.functions).functions().to_vec();
        functions.push(function);
        self.tool.functions = if self.legacy {
            FunctionSet::LegacyFuncx(functions)
        } else {
            FunctionSet::Compute(functions)
        };
        self
    }

    /// Declare the tool's functions the legacy funcx way.
    pub fn legacy_funcx(mut self) -> Self {
        self.legacy = true;
        let functions = std::mem::take(&mut self.tool.functions).functions().to_vec();
        self.tool.functions = FunctionSet::LegacyFuncx(functions);
        self
    }

    pub fn schema(mut self, schema: ComputeSchema) -> Self {
        self.tool.schema = schema;
        self
    }

    /// Call another action provider with the same payload shape.
    pub fn action_url(mut self, url: impl Into<String>) -> Self {
        self.tool.action_url = Some(url.into());
        self
    }

    /// Use a hand-written fragment instead of a generated one.
    pub fn flow_definition(mut self, definition: FlowDefinition) -> Self {
        self.tool.definition = Some(definition);
        self
    }

    pub fn modifier(mut self, target: impl Into<String>, field: impl Into<String>, value: Value) -> Self {
        self.tool
            .modifiers
            .entry(target.into())
            .or_default()
            .insert(field.into(), value);
        self
    }

    pub fn modifiers(mut self, modifiers: Modifiers) -> Self {
        self.tool.modifiers = modifiers;
        self
    }

    pub fn required_input<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            let name = name.into();
            if !self.tool.required_input.contains(&name) {
                self.tool.required_input.push(name);
            }
        }
        self
    }

    pub fn default_input(mut self, name: impl Into<String>, value: Value) -> Self {
        self.tool.defaults.insert(name.into(), value);
        self
    }

    pub fn transition_states<I, S>(mut self, states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tool.transition_states = states.into_iter().map(Into::into).collect();
        self
    }

    pub fn alias(mut self, alias: impl Into<Alias>) -> Self {
        self.tool.alias = Some(alias.into());
        self
    }

    pub fn build(self) -> Tool {
        self.tool
    }
}

/// Tools addressable by name, resolved as `name` or `name:Alias`.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Tool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `tool` under its name, replacing any previous tool of that name.
    pub fn register(&mut self, tool: Tool) -> &mut Self {
        self.tools.insert(tool.name().to_string(), tool);
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    /// Look up `name` or `name:Alias`.
    pub fn resolve(&self, spec: &str) -> Result<Tool> {
        let (name, alias) = match spec.split_once(':') {
            Some((name, alias)) => (name.trim(), Some(alias.trim())),
            None => (spec.trim(), None),
        };

        let tool = self.tools.get(name).ok_or_else(|| {
            let known: Vec<&str> = self.names().collect();
            Error::Config(format!(
                "unknown tool '{name}' (registered: {})",
                known.join(", ")
            ))
        })?;

        match alias {
            Some("") => Err(Error::Config(format!("empty alias in '{spec}'"))),
            Some(alias) => Ok(tool.aliased(alias)),
            None => Ok(tool.clone()),
        }
    }

    /// Resolve every entry of `specs` in order.
    pub fn resolve_all<'a>(&self, specs: impl IntoIterator<Item = &'a str>) -> Result<Vec<Tool>> {
        specs.into_iter().map(|spec| self.resolve(spec)).collect()
    }
}
