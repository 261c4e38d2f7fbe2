//! In-memory fakes of the remote services shared by the integration tests.
#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use toolflow::auth::callback::CallbackLogin;
use toolflow::auth::{Authorizer, TokenBundle};
use toolflow::flow::{Condition, FlowDefinition, State};
use toolflow::run::{RunRecord, STATUS_ACTIVE, STATUS_SUCCEEDED};
use toolflow::service::{DeployedFlow, FlowEngine, FlowRequest, FunctionService, RunRequest};
use toolflow::storage::{MemoryStorage, Storage};
use toolflow::tool::{RemoteFunction, Tool};
use toolflow::{Client, ClientBuilder, ClientSettings, Error, Result};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// =============================================================================
// FLOW ENGINE
// =============================================================================

/// A failure the next `run` call reports instead of starting.
#[derive(Debug, Clone)]
pub enum RunFailure {
    ScopeChange(String),
    Failed(String),
}

#[derive(Default)]
pub struct FakeEngine {
    pub deploys: AtomicUsize,
    pub updates: AtomicUsize,
    pub runs: AtomicUsize,
    pub statuses: AtomicUsize,
    /// Every run deletes its flow and reports it missing.
    pub forget_on_run: AtomicBool,
    live: Mutex<BTreeSet<String>>,
    next_id: AtomicUsize,
    run_failures: Mutex<VecDeque<RunFailure>>,
    pending_statuses: Mutex<VecDeque<String>>,
    details: Mutex<Value>,
    pub deployed_requests: Mutex<Vec<FlowRequest>>,
    pub run_requests: Mutex<Vec<(String, RunRequest)>>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Pretend `flow_id` was deployed earlier.
    pub fn adopt(&self, flow_id: &str) {
        self.live.lock().unwrap().insert(flow_id.to_string());
    }

    /// Delete `flow_id` behind the client's back.
    pub fn delete(&self, flow_id: &str) {
        self.live.lock().unwrap().remove(flow_id);
    }

    pub fn fail_next_run(&self, failure: RunFailure) {
        self.run_failures.lock().unwrap().push_back(failure);
    }

    /// Statuses returned by successive `status` calls before `SUCCEEDED`.
    pub fn script_statuses<I: IntoIterator<Item = &'static str>>(&self, statuses: I) {
        let mut pending = self.pending_statuses.lock().unwrap();
        pending.extend(statuses.into_iter().map(str::to_string));
    }

    pub fn set_details(&self, details: Value) {
        *self.details.lock().unwrap() = details;
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    fn not_found(flow_id: &str) -> Error {
        Error::NotFound(format!("flow {flow_id} does not exist"))
    }
}

impl FlowEngine for FakeEngine {
    fn deploy(&self, _auth: &Authorizer, request: &FlowRequest) -> Result<DeployedFlow> {
        self.deploys.fetch_add(1, Ordering::SeqCst);
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("flow-{n}");
        self.live.lock().unwrap().insert(id.clone());
        self.deployed_requests.lock().unwrap().push(request.clone());
        Ok(DeployedFlow { id, scope: None })
    }

    fn update(&self, _auth: &Authorizer, flow_id: &str, request: &FlowRequest) -> Result<()> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        if !self.live.lock().unwrap().contains(flow_id) {
            return Err(Self::not_found(flow_id));
        }
        self.deployed_requests.lock().unwrap().push(request.clone());
        Ok(())
    }

    fn run(&self, auth: &Authorizer, flow_id: &str, request: &RunRequest) -> Result<RunRecord> {
        let n = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        if self.forget_on_run.load(Ordering::SeqCst) {
            self.delete(flow_id);
        }
        if !self.live.lock().unwrap().contains(flow_id) {
            return Err(Self::not_found(flow_id));
        }
        self.run_requests
            .lock()
            .unwrap()
            .push((flow_id.to_string(), request.clone()));

        match self.run_failures.lock().unwrap().pop_front() {
            Some(RunFailure::ScopeChange(scope)) => Err(Error::ScopeChange {
                message: format!("Unable to get tokens for scopes ['{scope}'] ({})", auth.scope),
                scopes: vec![scope],
            }),
            Some(RunFailure::Failed(description)) => {
                let mut record = RunRecord::new(format!("run-{n}"), "FAILED")
                    .with_details(json!({ "description": description }));
                record.flow_id = Some(flow_id.to_string());
                Ok(record)
            }
            None => {
                let mut record = RunRecord::new(format!("run-{n}"), STATUS_ACTIVE);
                record.flow_id = Some(flow_id.to_string());
                record.label = Some(request.label.clone());
                Ok(record)
            }
        }
    }

    fn status(&self, _auth: &Authorizer, flow_id: &str, run_id: &str) -> Result<RunRecord> {
        self.statuses.fetch_add(1, Ordering::SeqCst);
        let status = self
            .pending_statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| STATUS_SUCCEEDED.to_string());
        let mut record =
            RunRecord::new(run_id, status).with_details(self.details.lock().unwrap().clone());
        record.flow_id = Some(flow_id.to_string());
        Ok(record)
    }
}

// =============================================================================
// FUNCTION SERVICE
// =============================================================================

#[derive(Default)]
pub struct FakeFunctionService {
    pub registrations: AtomicUsize,
    pub groups: Mutex<Vec<Option<String>>>,
}

impl FakeFunctionService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }
}

impl FunctionService for FakeFunctionService {
    fn register(
        &self,
        _auth: &Authorizer,
        function: &RemoteFunction,
        group: Option<&str>,
    ) -> Result<String> {
        let n = self.registrations.fetch_add(1, Ordering::SeqCst) + 1;
        self.groups.lock().unwrap().push(group.map(str::to_string));
        Ok(format!("{}-id-{n}", function.name))
    }
}

// =============================================================================
// LOGIN
// =============================================================================

/// Login calls observed by a [`counting_login`] backend.
#[derive(Clone, Default)]
pub struct LoginLog {
    pub calls: Arc<AtomicUsize>,
    pub requested: Arc<Mutex<Vec<Vec<String>>>>,
}

impl LoginLog {
    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// A callback login granting every requested scope.
pub fn counting_login() -> (CallbackLogin, LoginLog) {
    let log = LoginLog::default();
    let seen = log.clone();
    let login = CallbackLogin::new(move |scopes: &[String]| {
        seen.calls.fetch_add(1, Ordering::SeqCst);
        seen.requested.lock().unwrap().push(scopes.to_vec());
        Ok(scopes
            .iter()
            .map(|scope| (scope.clone(), TokenBundle::new(scope.clone(), format!("token-for-{scope}"))))
            .collect::<BTreeMap<_, _>>())
    });
    (login, log)
}

// =============================================================================
// CLIENTS
// =============================================================================

pub fn hello_tool() -> Tool {
    Tool::builder("hello")
        .compute_function(RemoteFunction::new(
            "hello",
            "def hello(message, **data):\n    return message\n",
        ))
        .required_input(["message", "compute_endpoint"])
        .build()
}

/// Fakes and stores a client under test talks to.
pub struct Harness {
    pub engine: Arc<FakeEngine>,
    pub functions: Arc<FakeFunctionService>,
    pub storage: Arc<MemoryStorage>,
    pub tokens: Arc<MemoryStorage>,
    pub login: LoginLog,
}

impl Harness {
    pub fn new() -> Self {
        init_tracing();
        Self {
            engine: FakeEngine::new(),
            functions: FakeFunctionService::new(),
            storage: Arc::new(MemoryStorage::new()),
            tokens: Arc::new(MemoryStorage::new()),
            login: LoginLog::default(),
        }
    }

    /// A client builder wired to this harness, with a fresh counting login.
    pub fn builder(&mut self, name: &str) -> ClientBuilder {
        let (login, log) = counting_login();
        self.login = log;
        Client::builder(name)
            .settings(ClientSettings::default())
            .storage(self.storage.clone())
            .token_storage(self.tokens.clone())
            .flow_engine(self.engine.clone())
            .function_service(self.functions.clone())
            .login(login)
            .poll_interval(Duration::from_millis(1))
    }

    /// Store valid tokens for `scopes` so no login is needed for them.
    pub fn preload_tokens(&self, scopes: &[String]) {
        for scope in scopes {
            let bundle = TokenBundle::new(scope.clone(), format!("stored-{scope}"))
                .with_expires_at(u64::MAX / 2);
            toolflow::auth::tokens::store_bundles(self.tokens.as_ref(), [&bundle]).unwrap();
        }
        self.tokens.save().unwrap();
    }
}

// =============================================================================
// FLOW WALKING
// =============================================================================

fn lookup<'a>(input: &'a Value, path: &str) -> Option<&'a Value> {
    let pointer = path
        .strip_prefix("$.")?
        .split('.')
        .fold(String::new(), |acc, part| format!("{acc}/{part}"));
    input.pointer(&pointer)
}

fn holds(condition: &Condition, input: &Value) -> bool {
    match condition {
        Condition::And(items) => items.iter().all(|c| holds(c, input)),
        Condition::Or(items) => items.iter().any(|c| holds(c, input)),
        Condition::Not(inner) => !holds(inner, input),
        Condition::Compare {
            variable,
            operator,
            value,
        } => {
            let actual = lookup(input, variable);
            match operator.as_str() {
                "IsPresent" => actual.is_some() == value.as_bool().unwrap_or(false),
                "NumericGreaterThan" => match (actual.and_then(Value::as_f64), value.as_f64()) {
                    (Some(a), Some(b)) => a > b,
                    _ => false,
                },
                "NumericLessThan" => match (actual.and_then(Value::as_f64), value.as_f64()) {
                    (Some(a), Some(b)) => a < b,
                    _ => false,
                },
                "NumericEquals" | "StringEquals" | "BooleanEquals" => actual == Some(value),
                other => panic!("walker does not evaluate {other}"),
            }
        }
    }
}

/// States visited when running `flow` on `input`, evaluating choice rules.
pub fn walk(flow: &FlowDefinition, input: &Value) -> Vec<String> {
    let mut path = Vec::new();
    let mut current = Some(flow.start_at.clone());
    while let Some(name) = current {
        assert!(path.len() <= flow.states.len() * 2, "flow does not terminate: {path:?}");
        let state = &flow.states[&name];
        path.push(name);
        current = match state {
            State::Choice(choice) => choice
                .choices
                .iter()
                .find(|rule| holds(&rule.condition, input))
                .map(|rule| rule.next.clone())
                .or_else(|| choice.default.clone()),
            other => other.next().map(str::to_string),
        };
    }
    path
}

pub fn memory_storage() -> Arc<dyn Storage> {
    Arc::new(MemoryStorage::new())
}
