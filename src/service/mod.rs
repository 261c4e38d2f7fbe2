//! Contracts of the remote services and their HTTP clients.
//!
//! The managers only talk to [`FlowEngine`] and [`FunctionService`]; the
//! blocking HTTP implementations live in [`flows`] and [`compute`].

pub mod compute;
pub mod flows;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::Authorizer;
use crate::flow::definition::FlowDefinition;
use crate::run::RunRecord;
use crate::tool::RemoteFunction;
use crate::{Error, Result};

/// Substring the flow service uses when a token lacks a dependent scope.
pub const DEPENDENT_SCOPE_MARKER: &str = "unable to get tokens for scopes";

/// Principal string for a group.
pub fn group_urn(group: &str) -> String {
    format!("urn:globus:groups:id:{group}")
}

/// Who may see, start and administer a flow and its runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowPermissions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flow_viewers: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flow_starters: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flow_administrators: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub run_managers: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub run_monitors: Vec<String>,
}

impl FlowPermissions {
    /// Share everything with the members of `group`.
    pub fn for_group(group: &str) -> Self {
        let urn = vec![group_urn(group)];
        Self {
            flow_viewers: urn.clone(),
            flow_starters: urn.clone(),
            flow_administrators: urn.clone(),
            run_managers: urn.clone(),
            run_monitors: urn,
        }
    }
}

/// Body of a deploy or update call.
#[derive(Debug, Clone, Serialize)]
pub struct FlowRequest {
    pub definition: FlowDefinition,
    pub title: String,
    pub input_schema: Value,
    #[serde(flatten)]
    pub permissions: FlowPermissions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
}

/// Identity of a freshly deployed flow.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeployedFlow {
    pub id: String,
    /// The flow's own scope, when the service reports it.
    #[serde(default, alias = "globus_auth_scope")]
    pub scope: Option<String>,
}

/// Body of a run call.
#[derive(Debug, Clone, Serialize)]
pub struct RunRequest {
    pub body: Value,
    pub label: String,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub run_managers: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub run_monitors: Vec<String>,
}

/// The hosted flow service.
pub trait FlowEngine: Send + Sync {
    fn deploy(&self, auth: &Authorizer, request: &FlowRequest) -> Result<DeployedFlow>;

    fn update(&self, auth: &Authorizer, flow_id: &str, request: &FlowRequest) -> Result<()>;

    /// Start a run. `auth` carries the flow's own scope.
    fn run(&self, auth: &Authorizer, flow_id: &str, request: &RunRequest) -> Result<RunRecord>;

    fn status(&self, auth: &Authorizer, flow_id: &str, run_id: &str) -> Result<RunRecord>;
}

/// The remote function-execution service.
pub trait FunctionService: Send + Sync {
    /// Upload `function`, optionally shared with `group`; returns its id.
    fn register(
        &self,
        auth: &Authorizer,
        function: &RemoteFunction,
        group: Option<&str>,
    ) -> Result<String>;
}

impl<T: FlowEngine + ?Sized> FlowEngine for Arc<T> {
    fn deploy(&self, auth: &Authorizer, request: &FlowRequest) -> Result<DeployedFlow> {
        (**self).deploy(auth, request)
    }

    fn update(&self, auth: &Authorizer, flow_id: &str, request: &FlowRequest) -> Result<()> {
        (**self).update(auth, flow_id, request)
    }

    fn run(&self, auth: &Authorizer, flow_id: &str, request: &RunRequest) -> Result<RunRecord> {
        (**self).run(auth, flow_id, request)
    }

    fn status(&self, auth: &Authorizer, flow_id: &str, run_id: &str) -> Result<RunRecord> {
        (**self).status(auth, flow_id, run_id)
    }
}

impl<T: FunctionService + ?Sized> FunctionService for Arc<T> {
    fn register(
        &self,
        auth: &Authorizer,
        function: &RemoteFunction,
        group: Option<&str>,
    ) -> Result<String> {
        (**self).register(auth, function, group)
    }
}

/// Classify a failed service response.
///
/// 404 becomes [`Error::NotFound`]; a body mentioning missing dependent scopes
/// becomes [`Error::ScopeChange`] (listing the scopes named in the message, or
/// `fallback_scope` when none can be read); anything else is
/// [`Error::Engine`].
pub fn classify_error(status: u16, body: &str, fallback_scope: &str) -> Error {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let pick = |pointer: &str| {
        parsed
            .as_ref()
            .and_then(|v| v.pointer(pointer))
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    let code = pick("/error/code").or_else(|| pick("/code"));
    let message = pick("/error/detail")
        .or_else(|| pick("/detail"))
        .or_else(|| pick("/message"))
        .or_else(|| pick("/error/message"))
        .unwrap_or_else(|| body.trim().to_string());

    if status == 404 {
        return Error::NotFound(message);
    }

    if body.to_lowercase().contains(DEPENDENT_SCOPE_MARKER) {
        let mut scopes = scopes_in(body);
        if scopes.is_empty() && !fallback_scope.is_empty() {
            scopes.push(fallback_scope.to_string());
        }
        return Error::ScopeChange { message, scopes };
    }

    Error::Engine {
        status: Some(status),
        code,
        message,
    }
}

/// Scope URLs mentioned in an error message.
fn scopes_in(text: &str) -> Vec<String> {
    let mut scopes: Vec<String> = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("https://") {
        let candidate = &rest[start..];
        let end = candidate
            .find(|c: char| c.is_whitespace() || matches!(c, '\'' | '"' | ',' | ']' | ')' | '\\'))
            .unwrap_or(candidate.len());
        let scope = candidate[..end].trim_end_matches('.');
        if !scopes.iter().any(|s| s == scope) {
            scopes.push(scope.to_string());
        }
        rest = &candidate[end..];
    }
    scopes
}
