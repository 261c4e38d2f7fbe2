//! The client facade: tools in, runs out.
//!
//! A [`Client`] owns the storage sections, the shared login manager and both
//! registration managers. [`Client::run_flow`] registers functions, syncs the
//! flow, checks inputs and starts a run, in that order.
//!
//! # Example
//!
//! ```no_run
//! use serde_json::json;
//! use toolflow::tool::{RemoteFunction, Tool};
//! use toolflow::Client;
//!
//! # fn main() -> toolflow::Result<()> {
//! let hello = Tool::builder("hello")
//!     .compute_function(RemoteFunction::new(
//!         "hello",
//!         "def hello(message, **data):\n    return message\n",
//!     ))
//!     .required_input(["message", "compute_endpoint"])
//!     .build();
//!
//! let client = Client::builder("HelloClient").tool(hello).build()?;
//! let run = client.run_flow(json!({"input": {"message": "hi", "compute_endpoint": "EP"}}))?;
//! let done = client.progress(&run.run_id, |record| {
//!     println!("{}", record.status);
//!     Ok(())
//! })?;
//! println!("{}", client.get_details(&done.run_id, "Hello")?);
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::auth::callback::CallbackLogin;
use crate::auth::confidential::ConfidentialLogin;
use crate::auth::native::NativeLogin;
use crate::auth::{self, LoginBackend, LoginManager, SharedLogin, DEFAULT_AUTH_URL};
use crate::flow::builder::check_function_names;
use crate::flow::chain::{chain, ChainLink};
use crate::flow::definition::FlowDefinition;
use crate::managers::flows::{FlowIdCache, FlowManager, FlowPermissions};
use crate::managers::functions::FunctionManager;
use crate::naming::{function_id_key, snake_case};
use crate::run::RunRecord;
use crate::service::compute::{ComputeClient, DEFAULT_COMPUTE_URL};
use crate::service::flows::{FlowsClient, DEFAULT_FLOWS_URL};
use crate::service::{FlowEngine, FunctionService};
use crate::storage::{default_config_path, tokens_section_name, ConfigFile, Storage};
use crate::tool::Tool;
use crate::{Error, Result};

/// Public native-app client id used when none is configured.
pub const DEFAULT_CLIENT_ID: &str = "e6c75d97-532a-4c88-b031-8584a319fa3e";

pub use crate::storage::INPUT_DEFAULT_PREFIX;

/// Endpoints, identities and paths a client is built with.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Storage file; `None` means [`default_config_path`].
    pub config_path: Option<PathBuf>,
    pub client_id: String,
    /// Set for confidential clients, which then log in with client credentials.
    #[serde(skip)]
    pub client_secret: Option<SecretString>,
    pub flows_url: String,
    pub compute_url: String,
    pub auth_url: String,
    /// Group that functions are shared with and that may view, start and
    /// monitor the flow.
    pub group: Option<String>,
    pub subscription_id: Option<String>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            config_path: None,
            client_id: DEFAULT_CLIENT_ID.to_string(),
            client_secret: None,
            flows_url: DEFAULT_FLOWS_URL.to_string(),
            compute_url: DEFAULT_COMPUTE_URL.to_string(),
            auth_url: DEFAULT_AUTH_URL.to_string(),
            group: None,
            subscription_id: None,
        }
    }
}

impl ClientSettings {
    /// Defaults overridden by `TOOLFLOW_*` environment variables.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Ok(path) = std::env::var("TOOLFLOW_CONFIG") {
            settings.config_path = Some(PathBuf::from(path));
        }
        if let Ok(id) = std::env::var("TOOLFLOW_CLIENT_ID") {
            settings.client_id = id;
        }
        if let Ok(secret) = std::env::var("TOOLFLOW_CLIENT_SECRET") {
            settings.client_secret = Some(SecretString::from(secret));
        }
        if let Ok(url) = std::env::var("TOOLFLOW_FLOWS_URL") {
            settings.flows_url = url;
        }
        if let Ok(url) = std::env::var("TOOLFLOW_COMPUTE_URL") {
            settings.compute_url = url;
        }
        if let Ok(url) = std::env::var("TOOLFLOW_AUTH_URL") {
            settings.auth_url = url;
        }
        settings
    }

    fn login_backend(&self) -> Box<dyn LoginBackend> {
        match &self.client_secret {
            Some(secret) => Box::new(
                ConfidentialLogin::new(self.client_id.clone(), secret.expose_secret())
                    .with_auth_url(self.auth_url.clone()),
            ),
            None => Box::new(
                NativeLogin::new(self.client_id.clone()).with_auth_url(self.auth_url.clone()),
            ),
        }
    }
}

/// Builder for [`Client`].
pub struct ClientBuilder {
    name: String,
    settings: ClientSettings,
    tools: Vec<Tool>,
    definition: Option<FlowDefinition>,
    storage: Option<Arc<dyn Storage>>,
    token_storage: Option<Arc<dyn Storage>>,
    login: Option<Box<dyn LoginBackend>>,
    engine: Option<Arc<dyn FlowEngine>>,
    function_service: Option<Arc<dyn FunctionService>>,
    flow_id: Option<String>,
    auto_registration: bool,
    redeploy_on_404: bool,
    poll_interval: Option<Duration>,
    cache: Option<Arc<dyn FlowIdCache>>,
    title: Option<String>,
    input_schema: Option<Value>,
}

impl ClientBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            settings: ClientSettings::from_env(),
            tools: Vec::new(),
            definition: None,
            storage: None,
            token_storage: None,
            login: None,
            engine: None,
            function_service: None,
            flow_id: None,
            auto_registration: true,
            redeploy_on_404: true,
            poll_interval: None,
            cache: None,
            title: None,
            input_schema: None,
        }
    }

    pub fn settings(mut self, settings: ClientSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Append a tool; the flow chains tools in the order they are added.
    pub fn tool(mut self, tool: Tool) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn tools(mut self, tools: impl IntoIterator<Item = Tool>) -> Self {
        self.tools.extend(tools);
        self
    }

    /// Use a hand-written flow instead of chaining the tools' fragments.
    pub fn flow_definition(mut self, definition: FlowDefinition) -> Self {
        self.definition = Some(definition);
        self
    }

    /// General section storage. Without [`token_storage`](Self::token_storage)
    /// tokens are then kept in memory only.
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn token_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.token_storage = Some(storage);
        self
    }

    pub fn login(mut self, backend: impl LoginBackend + 'static) -> Self {
        self.login = Some(Box::new(backend));
        self
    }

    /// Log in through `callback` instead of interactively.
    pub fn login_callback<F>(self, callback: F) -> Self
    where
        F: FnMut(&[String]) -> Result<std::collections::BTreeMap<String, auth::TokenBundle>>
            + Send
            + 'static,
    {
        self.login(CallbackLogin::new(callback))
    }

    pub fn flow_engine(mut self, engine: Arc<dyn FlowEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn function_service(mut self, service: Arc<dyn FunctionService>) -> Self {
        self.function_service = Some(service);
        self
    }

    /// Run an already deployed flow. The flow is never redeployed.
    pub fn flow_id(mut self, flow_id: impl Into<String>) -> Self {
        self.flow_id = Some(flow_id.into());
        self
    }

    pub fn auto_registration(mut self, enabled: bool) -> Self {
        self.auto_registration = enabled;
        self
    }

    pub fn redeploy_on_404(mut self, enabled: bool) -> Self {
        self.redeploy_on_404 = enabled;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn flow_cache(mut self, cache: Arc<dyn FlowIdCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn input_schema(mut self, schema: Value) -> Self {
        self.input_schema = Some(schema);
        self
    }

    pub fn build(self) -> Result<Client> {
        let section = snake_case(&self.name);
        if section.is_empty() {
            return Err(Error::Config(format!("invalid client name '{}'", self.name)));
        }
        let settings = self.settings;

        let (storage, token_storage) = match self.storage {
            Some(storage) => (storage, self.token_storage),
            None => {
                let path = settings.config_path.clone().unwrap_or_else(default_config_path);
                let file = ConfigFile::open(path)?;
                let general: Arc<dyn Storage> = Arc::new(file.section(section.clone()));
                let tokens: Arc<dyn Storage> =
                    Arc::new(file.section(tokens_section_name(&settings.client_id)));
                (general, Some(self.token_storage.unwrap_or(tokens)))
            }
        };
        if storage.get("client_id")?.as_deref() != Some(settings.client_id.as_str()) {
            storage.set("client_id", &settings.client_id)?;
            storage.save()?;
        }

        let backend = self.login.unwrap_or_else(|| settings.login_backend());
        let mut login = LoginManager::from_boxed(backend);
        if let Some(tokens) = token_storage {
            login.attach_storage(tokens)?;
        }
        let login = login.into_shared();

        let service = self
            .function_service
            .unwrap_or_else(|| Arc::new(ComputeClient::new(settings.compute_url.clone())));
        let mut functions = FunctionManager::new(service).with_auto_registration(self.auto_registration);
        if let Some(group) = &settings.group {
            functions = functions.with_group(group.clone());
        }
        functions.inject_storage(storage.clone());
        functions.inject_login(login.clone());

        let engine = self
            .engine
            .unwrap_or_else(|| Arc::new(FlowsClient::new(settings.flows_url.clone())));
        let mut flows = FlowManager::new(engine)
            .with_title(self.title.unwrap_or_else(|| self.name.clone()))
            .with_redeploy_on_404(self.redeploy_on_404);
        if let Some(id) = self.flow_id {
            flows = flows.with_flow_id(id);
        }
        if let Some(group) = &settings.group {
            flows = flows.with_permissions(FlowPermissions::for_group(group));
        }
        if let Some(subscription) = &settings.subscription_id {
            flows = flows.with_subscription_id(subscription.clone());
        }
        if let Some(schema) = self.input_schema {
            flows = flows.with_input_schema(schema);
        }
        if let Some(cache) = self.cache {
            flows = flows.with_cache(cache);
        }
        if let Some(interval) = self.poll_interval {
            flows = flows.with_poll_interval(interval);
        }
        flows.inject_storage(storage.clone());
        flows.inject_login(login.clone());

        let mut client = Client {
            name: self.name,
            tools: self.tools,
            preset: self.definition,
            storage,
            login,
            functions,
            flows,
        };
        if client.preset.is_some() || !client.tools.is_empty() {
            let definition = client.get_flow_definition()?;
            client.flows.set_definition(definition);
        }

        {
            let mut login = auth::lock(&client.login)?;
            login.add_required(client.functions.required_scopes());
            login.add_required(client.flows.required_scopes()?);
        }
        debug!(client = %client.name, tools = client.tools.len(), "client ready");
        Ok(client)
    }
}

/// Assembles tools into one flow and drives it through registration and runs.
pub struct Client {
    name: String,
    tools: Vec<Tool>,
    preset: Option<FlowDefinition>,
    storage: Arc<dyn Storage>,
    login: SharedLogin,
    functions: FunctionManager,
    flows: FlowManager,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("name", &self.name)
            .field("tools", &self.tools.iter().map(Tool::label).collect::<Vec<_>>())
            .field("flows", &self.flows)
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn builder(name: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tools(&self) -> &[Tool] {
        &self.tools
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn login_manager(&self) -> &SharedLogin {
        &self.login
    }

    pub fn function_manager(&self) -> &FunctionManager {
        &self.functions
    }

    pub fn flow_manager(&self) -> &FlowManager {
        &self.flows
    }

    /// The deployed flow's id, if any.
    pub fn flow_id(&self) -> Result<Option<String>> {
        self.flows.flow_id()
    }

    /// The hand-written flow, or the tools' fragments chained in order.
    pub fn get_flow_definition(&self) -> Result<FlowDefinition> {
        check_function_names(&self.tools)?;
        if let Some(preset) = &self.preset {
            return Ok(preset.clone());
        }
        if self.tools.is_empty() {
            return Err(Error::Config(format!(
                "client '{}' has neither tools nor a flow definition",
                self.name
            )));
        }

        let links = self
            .tools
            .iter()
            .map(|tool| {
                let link = ChainLink::new(tool.label(), tool.flow_fragment()?);
                Ok(match tool.transition_states() {
                    Some(states) => link.with_transition_states(states),
                    None => link,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        chain(links)
    }

    /// Deploy or update the flow; returns its id.
    pub fn sync_flow(&self) -> Result<String> {
        self.flows.sync_flow()
    }

    /// `{"input": ...}` with tool defaults, stored overrides and function ids.
    pub fn get_input(&self) -> Result<Value> {
        let mut input = Map::new();
        for tool in &self.tools {
            for (name, value) in tool.defaults() {
                input.insert(name, value);
            }
        }

        for key in self.storage.keys()? {
            let Some(var) = key.strip_prefix(INPUT_DEFAULT_PREFIX) else {
                continue;
            };
            if let Some(raw) = self.storage.get(&key)? {
                let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
                input.insert(var.to_string(), value);
            }
        }

        for tool in &self.tools {
            for function in tool.functions() {
                let key = function_id_key(&function.name);
                if let Some(id) = self.storage.get(&key)? {
                    input.insert(key, Value::String(id));
                }
            }
        }
        Ok(json!({ "input": input }))
    }

    /// Store a default for input variable `name`, used by every later run.
    pub fn set_input_default(&self, name: &str, value: &Value) -> Result<()> {
        self.storage
            .set(&format!("{INPUT_DEFAULT_PREFIX}{name}"), &value.to_string())?;
        self.storage.save()
    }

    pub fn run_flow(&self, input: Value) -> Result<RunRecord> {
        self.run_flow_with(input, None, Vec::new())
    }

    /// Register functions, sync the flow, check inputs and start a run.
    pub fn run_flow_with(&self, input: Value, label: Option<&str>, tags: Vec<String>) -> Result<RunRecord> {
        let supplied = match input {
            Value::Object(mut top) if top.len() == 1 => match top.remove("input") {
                Some(Value::Object(inner)) => inner,
                Some(_) => return Err(Error::Config("'input' must be an object".into())),
                None => {
                    return Err(Error::Config(
                        "flow input must have the single top-level key 'input'".into(),
                    ))
                }
            },
            _ => {
                return Err(Error::Config(
                    "flow input must have the single top-level key 'input'".into(),
                ))
            }
        };

        for tool in &self.tools {
            self.functions.validate_tool(tool)?;
        }
        let flow_id = self.flows.sync_flow()?;

        let mut merged = match self.get_input()? {
            Value::Object(mut top) => match top.remove("input") {
                Some(Value::Object(defaults)) => defaults,
                _ => Map::new(),
            },
            _ => Map::new(),
        };
        merged.extend(supplied);

        for tool in &self.tools {
            for var in tool.required_input() {
                if !merged.contains_key(&var) {
                    return Err(Error::Config(format!(
                        "tool '{}' requires input '{var}'",
                        tool.label()
                    )));
                }
            }
        }

        info!(client = %self.name, %flow_id, "running flow");
        self.flows
            .run_flow(json!({ "input": merged }), label, tags)
    }

    pub fn get_status(&self, run_id: &str) -> Result<RunRecord> {
        self.flows.get_status(run_id)
    }

    /// Poll run `run_id` until it finishes. See [`FlowManager::progress`].
    pub fn progress<F>(&self, run_id: &str, on_poll: F) -> Result<RunRecord>
    where
        F: FnMut(&RunRecord) -> Result<()>,
    {
        self.flows.progress(run_id, on_poll)
    }

    pub fn get_details(&self, run_id: &str, state: &str) -> Result<Value> {
        self.flows.get_details(run_id, state)
    }

    /// Revoke and forget every token of this client.
    pub fn logout(&self) -> Result<()> {
        auth::lock(&self.login)?.logout()
    }
}
