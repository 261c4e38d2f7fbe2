//! Registration managers.
//!
//! [`FunctionManager`] keeps remote function ids current; [`FlowManager`]
//! deploys, updates and runs the flow. Both persist through a
//! [`Storage`](crate::storage::Storage) section and authorize through a shared
//! [`LoginManager`](crate::auth::LoginManager).

pub mod flows;
pub mod functions;

pub use flows::{
    flow_scope_for, truncate_label, FlowIdCache, FlowManager, FlowPermissions,
    MemoryFlowIdCache, MANAGE_FLOWS_SCOPE, RUN_STATUS_SCOPE,
};
pub use functions::{FunctionManager, Registration, COMPUTE_SCOPE};
