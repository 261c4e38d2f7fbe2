//! Flow definitions and how they are assembled from tools.
//!
//! - [`definition`]: the state graph and its validation
//! - [`choice`]: rules of `Choice` states
//! - [`builder`] and [`modifiers`]: fragments generated from compute functions
//! - [`alias`]: renaming a fragment for one tool instance
//! - [`chain`]: joining fragments into a single flow

pub mod alias;
pub mod builder;
pub mod chain;
pub mod choice;
pub mod definition;
pub mod modifiers;

pub use alias::{alias_definition, Alias};
pub use builder::{
    build_fragment, builder_for, check_function_names, ComputeV2Builder, ComputeV3Builder,
    FlowBuilder,
};
pub use chain::{chain, ChainLink};
pub use choice::{ChoiceRule, Condition};
pub use definition::{
    ActionState, ChoiceState, ExpressionEvalState, FailState, FlowDefinition, PassState, State,
    SucceedState, WaitState,
};
pub use modifiers::Modifiers;
