//! Node implementations.
//!
//! Nodes are the building blocks of workflows. Each node type declares its
//! inputs, outputs and execution mode through a [`NodeDescriptor`] and is
//! looked up by type name in the [`NodeRegistry`].

pub mod condition;
mod filter;
mod http;
mod if_node;
mod merge;
mod noop;
mod registry;
mod set;
pub mod split_in_batches;
mod stop_and_error;
mod switch;
mod trigger;
mod types;
mod wait;

pub use filter::FilterNode;
pub use http::HttpNode;
pub use if_node::{IfNode, FALSE_BRANCH, TRUE_BRANCH};
pub use merge::MergeNode;
pub use noop::NoOpNode;
pub use registry::NodeRegistry;
pub use set::SetNode;
pub use split_in_batches::SplitInBatchesNode;
pub use stop_and_error::StopAndErrorNode;
pub use switch::SwitchNode;
pub use trigger::{ErrorTriggerNode, ManualTriggerNode};
pub use types::{
    items_from_json, BinaryRef, DataItem, ExecutionMode, InputPolicy, ItemList, ItemOutput, Node,
    NodeContext, NodeDescriptor, NodeOutput, StateChange, Suspend,
};
pub use wait::WaitNode;
