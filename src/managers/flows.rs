//! Deploying, updating and running one flow.
//!
//! The manager stores the flow's id, its checksum and its scope in the
//! client's general storage section. A checksum change updates the remote
//! flow; a flow that vanished remotely is deployed again unless the caller
//! pinned its id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::auth::{self, Authorizer, SharedLogin};
use crate::flow::definition::FlowDefinition;
use crate::run::RunRecord;
use crate::service::{FlowEngine, FlowRequest, RunRequest};
use crate::storage::Storage;
use crate::{Error, Result};

pub use crate::service::FlowPermissions;

/// Scope for deploying and updating flows.
pub const MANAGE_FLOWS_SCOPE: &str =
    "https://auth.globus.org/scopes/eec9b274-0c81-4334-bdc2-54e90e689b9a/manage_flows";
/// Scope for reading run status.
pub const RUN_STATUS_SCOPE: &str =
    "https://auth.globus.org/scopes/eec9b274-0c81-4334-bdc2-54e90e689b9a/run_status";

const FLOW_ID_KEY: &str = "flow_id";
const FLOW_CHECKSUM_KEY: &str = "flow_checksum";
const FLOW_SCOPE_KEY: &str = "flow_scope";

/// Longest label the flow service accepts.
pub const MAX_LABEL_LEN: usize = 64;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// The scope a flow with `flow_id` is run under.
pub fn flow_scope_for(flow_id: &str) -> String {
    format!(
        "https://auth.globus.org/scopes/{flow_id}/flow_{}_user",
        flow_id.replace('-', "_")
    )
}

/// Cut `label` to at most [`MAX_LABEL_LEN`] characters, marking the cut with `..`.
pub fn truncate_label(label: &str) -> String {
    if label.chars().count() <= MAX_LABEL_LEN {
        return label.to_string();
    }
    let kept: String = label.chars().take(MAX_LABEL_LEN - 2).collect();
    format!("{kept}..")
}

/// Deployments keyed by flow checksum, so an identical flow is deployed once.
pub trait FlowIdCache: Send + Sync {
    fn get(&self, checksum: &str) -> Option<String>;
    fn put(&self, checksum: &str, flow_id: &str);
    /// Drop every entry pointing at `flow_id`.
    fn forget(&self, flow_id: &str);
}

#[derive(Debug, Default)]
pub struct MemoryFlowIdCache {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryFlowIdCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FlowIdCache for MemoryFlowIdCache {
    fn get(&self, checksum: &str) -> Option<String> {
        self.entries.lock().ok()?.get(checksum).cloned()
    }

    fn put(&self, checksum: &str, flow_id: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(checksum.to_string(), flow_id.to_string());
        }
    }

    fn forget(&self, flow_id: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.retain(|_, id| id != flow_id);
        }
    }
}

pub struct FlowManager {
    engine: Arc<dyn FlowEngine>,
    storage: Option<Arc<dyn Storage>>,
    login: Option<SharedLogin>,
    pinned_flow_id: Option<String>,
    redeploy_on_404: bool,
    definition: Option<FlowDefinition>,
    input_schema: Value,
    title: String,
    permissions: FlowPermissions,
    subscription_id: Option<String>,
    cache: Option<Arc<dyn FlowIdCache>>,
    poll_interval: Duration,
}

impl std::fmt::Debug for FlowManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowManager")
            .field("title", &self.title)
            .field("pinned_flow_id", &self.pinned_flow_id)
            .field("redeploy_on_404", &self.redeploy_on_404)
            .finish_non_exhaustive()
    }
}

fn default_input_schema() -> Value {
    json!({"type": "object", "additionalProperties": true})
}

impl FlowManager {
    pub fn new(engine: Arc<dyn FlowEngine>) -> Self {
        Self {
            engine,
            storage: None,
            login: None,
            pinned_flow_id: None,
            redeploy_on_404: true,
            definition: None,
            input_schema: default_input_schema(),
            title: "toolflow".to_string(),
            permissions: FlowPermissions::default(),
            subscription_id: None,
            cache: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_login(mut self, login: SharedLogin) -> Self {
        self.login = Some(login);
        self
    }

    /// Run an existing flow. Pinning disables redeploying it when it is gone.
    pub fn with_flow_id(mut self, flow_id: impl Into<String>) -> Self {
        self.pinned_flow_id = Some(flow_id.into());
        self.redeploy_on_404 = false;
        self
    }

    pub fn with_redeploy_on_404(mut self, enabled: bool) -> Self {
        self.redeploy_on_404 = enabled && self.pinned_flow_id.is_none();
        self
    }

    pub fn with_definition(mut self, definition: FlowDefinition) -> Self {
        self.definition = Some(definition);
        self
    }

    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_permissions(mut self, permissions: FlowPermissions) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn with_subscription_id(mut self, subscription_id: impl Into<String>) -> Self {
        self.subscription_id = Some(subscription_id.into());
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn FlowIdCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn inject_storage(&mut self, storage: Arc<dyn Storage>) {
        if self.storage.is_none() {
            self.storage = Some(storage);
        }
    }

    pub fn inject_login(&mut self, login: SharedLogin) {
        if self.login.is_none() {
            self.login = Some(login);
        }
    }

    pub fn set_definition(&mut self, definition: FlowDefinition) {
        self.definition = Some(definition);
    }

    pub fn definition(&self) -> Option<&FlowDefinition> {
        self.definition.as_ref()
    }

    pub fn redeploy_on_404(&self) -> bool {
        self.redeploy_on_404
    }

    fn storage(&self) -> Result<&Arc<dyn Storage>> {
        self.storage
            .as_ref()
            .ok_or_else(|| Error::Config("flow manager has no storage".into()))
    }

    fn login(&self, scopes: &[String]) -> Result<&SharedLogin> {
        self.login
            .as_ref()
            .ok_or_else(|| Error::auth("flow manager has no login manager", scopes.to_vec()))
    }

    /// The pinned id, or the id stored by the last deploy.
    pub fn flow_id(&self) -> Result<Option<String>> {
        if let Some(id) = &self.pinned_flow_id {
            return Ok(Some(id.clone()));
        }
        self.storage()?.get(FLOW_ID_KEY)
    }

    /// Scope the flow runs under, once its id is known.
    pub fn flow_scope(&self) -> Result<Option<String>> {
        let Some(id) = self.flow_id()? else {
            return Ok(None);
        };
        if self.pinned_flow_id.is_none() {
            if let Some(scope) = self.storage()?.get(FLOW_SCOPE_KEY)? {
                return Ok(Some(scope));
            }
        }
        Ok(Some(flow_scope_for(&id)))
    }

    /// Scopes this manager needs, including the flow scope once known.
    pub fn required_scopes(&self) -> Result<Vec<String>> {
        let mut scopes = vec![MANAGE_FLOWS_SCOPE.to_string(), RUN_STATUS_SCOPE.to_string()];
        scopes.extend(self.flow_scope()?);
        Ok(scopes)
    }

    fn request(&self) -> Result<FlowRequest> {
        let definition = self
            .definition
            .clone()
            .ok_or_else(|| Error::Config("flow manager has no flow definition".into()))?;
        Ok(FlowRequest {
            definition,
            title: self.title.clone(),
            input_schema: self.input_schema.clone(),
            permissions: self.permissions.clone(),
            subscription_id: self.subscription_id.clone(),
        })
    }

    /// Checksum over the definition and the input schema.
    pub fn checksum(&self) -> Result<String> {
        let definition = self
            .definition
            .as_ref()
            .ok_or_else(|| Error::Config("flow manager has no flow definition".into()))?;
        crate::checksum::checksum(&json!({
            "definition": definition,
            "input_schema": self.input_schema,
        }))
    }

    fn authorizer(&self, scope: &str) -> Result<Authorizer> {
        let scopes = [scope.to_string()];
        let mut login = auth::lock(self.login(&scopes)?)?;
        login.add_required([scope]);
        login.ensure()?;
        login.authorizer(scope)
    }

    /// Make the remote flow match the local definition; returns the flow id.
    pub fn sync_flow(&self) -> Result<String> {
        if let (Some(id), None) = (&self.pinned_flow_id, &self.definition) {
            self.require_flow_scope()?;
            return Ok(id.clone());
        }
        let checksum = self.checksum()?;
        let Some(flow_id) = self.flow_id()? else {
            return self.deploy(&checksum);
        };

        let stored = self.storage()?.get(FLOW_CHECKSUM_KEY)?;
        if stored.as_deref() == Some(checksum.as_str()) {
            debug!(%flow_id, "flow is current");
            self.require_flow_scope()?;
            return Ok(flow_id);
        }

        match self.update(&flow_id, &checksum) {
            Ok(()) => Ok(flow_id),
            Err(e) if e.is_not_found() && self.redeploy_on_404 => {
                warn!(%flow_id, "flow no longer exists, deploying it again");
                self.purge()?;
                self.deploy(&checksum)
            }
            Err(e) => Err(e),
        }
    }

    fn require_flow_scope(&self) -> Result<()> {
        if let Some(scope) = self.flow_scope()? {
            let scopes = [scope];
            auth::lock(self.login(&scopes)?)?.add_required(scopes);
        }
        Ok(())
    }

    fn deploy(&self, checksum: &str) -> Result<String> {
        let storage = self.storage()?;

        let cached = self.cache.as_ref().and_then(|cache| cache.get(checksum));
        let (flow_id, scope) = match cached {
            Some(id) => {
                info!(flow_id = %id, "reusing deployment with identical checksum");
                (id, None)
            }
            None => {
                let auth = self.authorizer(MANAGE_FLOWS_SCOPE)?;
                let deployed = self.engine.deploy(&auth, &self.request()?)?;
                info!(flow_id = %deployed.id, title = %self.title, "deployed flow");
                if let Some(cache) = &self.cache {
                    cache.put(checksum, &deployed.id);
                }
                (deployed.id, deployed.scope)
            }
        };

        storage.set(FLOW_ID_KEY, &flow_id)?;
        storage.set(FLOW_CHECKSUM_KEY, checksum)?;
        match &scope {
            Some(scope) => storage.set(FLOW_SCOPE_KEY, scope)?,
            None => storage.delete(FLOW_SCOPE_KEY)?,
        }
        storage.save()?;

        self.require_flow_scope()?;
        Ok(flow_id)
    }

    fn update(&self, flow_id: &str, checksum: &str) -> Result<()> {
        let auth = self.authorizer(MANAGE_FLOWS_SCOPE)?;
        self.engine.update(&auth, flow_id, &self.request()?)?;
        info!(%flow_id, "updated flow");

        let storage = self.storage()?;
        storage.set(FLOW_CHECKSUM_KEY, checksum)?;
        storage.save()?;
        self.require_flow_scope()
    }

    /// Forget the stored deployment and stop requiring its scope.
    pub fn purge(&self) -> Result<()> {
        let stale_scope = match self.pinned_flow_id {
            Some(_) => None,
            None => self.flow_scope()?,
        };
        let storage = self.storage()?;
        if let (Some(cache), Some(id)) = (&self.cache, storage.get(FLOW_ID_KEY)?) {
            cache.forget(&id);
        }
        for key in [FLOW_ID_KEY, FLOW_CHECKSUM_KEY, FLOW_SCOPE_KEY] {
            storage.delete(key)?;
        }
        storage.save()?;

        if let (Some(scope), Some(login)) = (stale_scope, &self.login) {
            auth::lock(login)?.remove_required(&scope);
        }
        Ok(())
    }

    fn flow_authorizer(&self) -> Result<(String, Authorizer)> {
        let flow_id = self.flow_id()?.ok_or_else(|| {
            Error::NotFound(format!("no flow has been deployed for '{}'", self.title))
        })?;
        let scope = self
            .flow_scope()?
            .unwrap_or_else(|| flow_scope_for(&flow_id));
        let auth = self.authorizer(&scope)?;
        Ok((flow_id, auth))
    }

    /// Start a run of the flow with `body` as its input document.
    ///
    /// A dependent-scope rejection triggers one login and one retry; a missing
    /// flow (when redeploying is allowed) triggers one redeploy and one retry.
    pub fn run_flow(&self, body: Value, label: Option<&str>, tags: Vec<String>) -> Result<RunRecord> {
        let request = RunRequest {
            body,
            label: truncate_label(label.unwrap_or(&self.title)),
            tags,
            run_managers: self.permissions.run_managers.clone(),
            run_monitors: self.permissions.run_monitors.clone(),
        };

        if self.flow_id()?.is_none() {
            self.sync_flow()?;
        }
        let mut logged_in = false;
        let mut redeployed = false;
        loop {
            let (flow_id, authorizer) = self.flow_authorizer()?;
            let outcome = self.engine.run(&authorizer, &flow_id, &request);
            match outcome {
                Ok(record) if record.failed() => {
                    return Err(Error::Config(format!(
                        "flow run {} failed immediately: {}",
                        record.run_id,
                        record.description()
                    )));
                }
                Ok(record) => {
                    info!(%flow_id, run_id = %record.run_id, label = %request.label, "started run");
                    return Ok(record);
                }
                Err(Error::ScopeChange { scopes, message }) if !logged_in => {
                    logged_in = true;
                    warn!(%flow_id, ?scopes, %message, "run needs new consent, logging in again");
                    let scopes = if scopes.is_empty() {
                        vec![authorizer.scope.clone()]
                    } else {
                        scopes
                    };
                    let mut login = auth::lock(self.login(&scopes)?)?;
                    login.add_scope_change(scopes);
                    login.ensure()?;
                }
                Err(e) if e.is_not_found() && self.redeploy_on_404 && !redeployed => {
                    redeployed = true;
                    warn!(%flow_id, "flow not found when starting run, deploying it again");
                    self.purge()?;
                    self.sync_flow()?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Status of `run_id`. Never deploys; a flow that was never deployed is
    /// [`Error::NotFound`].
    pub fn get_status(&self, run_id: &str) -> Result<RunRecord> {
        let (flow_id, auth) = self.flow_authorizer()?;
        self.engine.status(&auth, &flow_id, run_id)
    }

    /// Poll until the run finishes, calling `on_poll` after every poll.
    ///
    /// An error from `on_poll` stops polling and is returned.
    pub fn progress<F>(&self, run_id: &str, mut on_poll: F) -> Result<RunRecord>
    where
        F: FnMut(&RunRecord) -> Result<()>,
    {
        loop {
            let record = self.get_status(run_id)?;
            on_poll(&record)?;
            if record.is_terminal() {
                return Ok(record);
            }
            thread::sleep(self.poll_interval);
        }
    }

    /// Output details of `state` in run `run_id`.
    pub fn get_details(&self, run_id: &str, state: &str) -> Result<Value> {
        self.get_status(run_id)?.state_details(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_scope_for() {
        assert_eq!(
            flow_scope_for("ab-cd-12"),
            "https://auth.globus.org/scopes/ab-cd-12/flow_ab_cd_12_user"
        );
    }

    #[test]
    fn test_truncate_label() {
        assert_eq!(truncate_label("short"), "short");
        let exact = "x".repeat(64);
        assert_eq!(truncate_label(&exact), exact);

        let long = "y".repeat(100);
        let cut = truncate_label(&long);
        assert_eq!(cut.chars().count(), 64);
        assert!(cut.ends_with(".."));
        assert_eq!(&cut[..62], &long[..62]);
    }

    #[test]
    fn test_memory_cache() {
        let cache = MemoryFlowIdCache::new();
        cache.put("sum", "flow-1");
        assert_eq!(cache.get("sum").as_deref(), Some("flow-1"));
        cache.forget("flow-1");
        assert_eq!(cache.get("sum"), None);
    }

    #[test]
    fn test_pinned_id_disables_redeploy() {
        struct Unused;
        impl FlowEngine for Unused {
            fn deploy(&self, _: &Authorizer, _: &FlowRequest) -> Result<crate::service::DeployedFlow> {
                unreachable!()
            }
            fn update(&self, _: &Authorizer, _: &str, _: &FlowRequest) -> Result<()> {
                unreachable!()
            }
            fn run(&self, _: &Authorizer, _: &str, _: &RunRequest) -> Result<RunRecord> {
                unreachable!()
            }
            fn status(&self, _: &Authorizer, _: &str, _: &str) -> Result<RunRecord> {
                unreachable!()
            }
        }

        let manager = FlowManager::new(Arc::new(Unused))
            .with_flow_id("F")
            .with_redeploy_on_404(true);
        assert!(!manager.redeploy_on_404());
        assert_eq!(manager.flow_id().unwrap().as_deref(), Some("F"));
    }
}
