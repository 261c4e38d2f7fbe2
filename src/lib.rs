//! toolflow: assemble, register and run tool-based flows
//!
//! Flows are built from reusable **tools**. A tool bundles remote functions
//! (registered with a hosted function-execution service) and the flow
//! fragment that calls them. A [`Client`] chains its tools' fragments into
//! one flow, keeps registered function ids and the deployed flow in step with
//! the local code, logs in for exactly the scopes it is missing, and runs the
//! flow on the hosted flow engine.
//!
//! # Key Features
//!
//! - **Deterministic flows**: generated state names, aliasing for repeated
//!   tools, validated chaining with choice branches
//! - **Content-addressed registration**: functions and flows are only
//!   (re)registered when their checksum changes
//! - **Scope-driven login**: native PKCE, callback or confidential-client
//!   logins, with a single retry on dependent-scope rejections
//! - **Recoverable runs**: a flow deleted remotely is redeployed and the run
//!   retried once
//!
//! # Example: Compile a Flow
//!
//! ```
//! use toolflow::tool::{RemoteFunction, Tool};
//! use toolflow::Client;
//! use toolflow::storage::MemoryStorage;
//! use std::sync::Arc;
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
//! let client = Client::builder("Greeter")
//!     .tool(hello.aliased("First"))
//!     .tool(hello.aliased("Second"))
//!     .storage(Arc::new(MemoryStorage::new()))
//!     .build()?;
//!
//! let flow = client.get_flow_definition()?;
//! assert_eq!(flow.ordered_state_names(), vec!["HelloFirst", "HelloSecond"]);
//! # Ok(())
//! # }
//! ```

// Flow model and assembly
pub mod flow;
pub mod naming;
pub mod tool;

// Persistence and identity
pub mod auth;
pub mod checksum;
pub mod storage;

// Remote services and registration
pub mod managers;
pub mod run;
pub mod service;

pub mod client;
pub mod error;

// Re-exports for convenience
pub use client::{Client, ClientBuilder, ClientSettings};
pub use error::{Error, Result};
pub use flow::definition::FlowDefinition;
pub use run::RunRecord;
pub use tool::{RemoteFunction, Tool, ToolRegistry};

// Prelude for common imports
pub mod prelude {
    pub use crate::auth::{LoginBackend, LoginManager, TokenBundle};
    pub use crate::client::{Client, ClientBuilder, ClientSettings};
    pub use crate::error::{Error, Result};
    pub use crate::flow::{ChoiceRule, Condition, FlowDefinition, State};
    pub use crate::run::RunRecord;
    pub use crate::storage::{MemoryStorage, Storage};
    pub use crate::tool::{ComputeSchema, RemoteFunction, Tool, ToolRegistry};
}
