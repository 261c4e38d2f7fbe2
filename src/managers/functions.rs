//! Keeps registered function ids in step with local function bodies.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::auth::{self, SharedLogin};
use crate::naming::{function_checksum_key, function_id_key};
use crate::service::FunctionService;
use crate::storage::Storage;
use crate::tool::{RemoteFunction, Tool};
use crate::{Error, Result};

/// Scope for registering functions with the compute service.
pub const COMPUTE_SCOPE: &str =
    "https://auth.globus.org/scopes/facd7ccc-c5f4-42aa-916b-a0e270e2c2a9/all";

/// What needs to happen for one function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// Stored id is current.
    Current(String),
    /// Never registered (or the checksum was lost).
    Missing,
    /// Registered, but the body changed since.
    Obsolete,
}

pub struct FunctionManager {
    service: Arc<dyn FunctionService>,
    storage: Option<Arc<dyn Storage>>,
    login: Option<SharedLogin>,
    group: Option<String>,
    auto_registration: bool,
}

impl std::fmt::Debug for FunctionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionManager")
            .field("group", &self.group)
            .field("auto_registration", &self.auto_registration)
            .finish_non_exhaustive()
    }
}

impl FunctionManager {
    pub fn new(service: Arc<dyn FunctionService>) -> Self {
        Self {
            service,
            storage: None,
            login: None,
            group: None,
            auto_registration: true,
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

    /// Share registered functions with `group`.
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_auto_registration(mut self, enabled: bool) -> Self {
        self.auto_registration = enabled;
        self
    }

    /// Use `storage` unless one was given explicitly.
    pub fn inject_storage(&mut self, storage: Arc<dyn Storage>) {
        if self.storage.is_none() {
            self.storage = Some(storage);
        }
    }

    /// Use `login` unless one was given explicitly.
    pub fn inject_login(&mut self, login: SharedLogin) {
        if self.login.is_none() {
            self.login = Some(login);
        }
    }

    pub fn required_scopes(&self) -> Vec<String> {
        vec![COMPUTE_SCOPE.to_string()]
    }

    fn storage(&self) -> Result<&Arc<dyn Storage>> {
        self.storage
            .as_ref()
            .ok_or_else(|| Error::Config("function manager has no storage".into()))
    }

    /// Compare stored id and checksum against the current function body.
    pub fn check(&self, function: &RemoteFunction) -> Result<Registration> {
        let storage = self.storage()?;
        let id = storage.get(&function_id_key(&function.name))?;
        let stored = storage.get(&function_checksum_key(&function.name))?;
        let current = function.checksum()?;

        Ok(match (id, stored) {
            (Some(id), Some(stored)) if stored == current => Registration::Current(id),
            (Some(_), Some(_)) => Registration::Obsolete,
            _ => Registration::Missing,
        })
    }

    /// The registered id of `function`, registering it first if needed.
    pub fn validate_function(&self, function: &RemoteFunction) -> Result<String> {
        match self.check(function)? {
            Registration::Current(id) => {
                debug!(function = %function.name, %id, "function registration is current");
                Ok(id)
            }
            Registration::Missing if !self.auto_registration => Err(Error::RegistrationNeeded(
                format!("function '{}' has not been registered", function.name),
            )),
            Registration::Obsolete if !self.auto_registration => Err(Error::Obsolete(format!(
                "function '{}' changed since it was registered",
                function.name
            ))),
            state => {
                info!(function = %function.name, ?state, "registering function");
                self.register(function)
            }
        }
    }

    /// Validate every function of `tool`, returning `{<fn>_function_id: id}`.
    pub fn validate_tool(&self, tool: &Tool) -> Result<BTreeMap<String, String>> {
        tool.functions()
            .iter()
            .map(|function| {
                let id = self.validate_function(function).map_err(|e| match e {
                    Error::RegistrationNeeded(m) => {
                        Error::RegistrationNeeded(format!("tool '{}': {m}", tool.label()))
                    }
                    Error::Obsolete(m) => Error::Obsolete(format!("tool '{}': {m}", tool.label())),
                    other => other,
                })?;
                Ok((function_id_key(&function.name), id))
            })
            .collect()
    }

    fn authorizer(&self) -> Result<auth::Authorizer> {
        let login = self
            .login
            .as_ref()
            .ok_or_else(|| Error::auth("function manager has no login manager", [COMPUTE_SCOPE.to_string()]))?;
        let mut login = auth::lock(login)?;
        login.add_required([COMPUTE_SCOPE]);
        login.ensure()?;
        login.authorizer(COMPUTE_SCOPE)
    }

    fn register(&self, function: &RemoteFunction) -> Result<String> {
        let authorizer = self.authorizer()?;
        let id = self
            .service
            .register(&authorizer, function, self.group.as_deref())?;

        let storage = self.storage()?;
        storage.set(&function_id_key(&function.name), &id)?;
        storage.set(&function_checksum_key(&function.name), &function.checksum()?)?;
        storage.save()?;
        Ok(id)
    }
}
