//! The Unified Tool Executor (§4.5): routes a tool call by its fully
//! qualified name to a backend "factory cluster", applies the one
//! documented parameter-rename normalization, and reports success/failure
//! back to the caller uniformly.

pub mod executor;
pub mod truncate;

pub use executor::{
    dispatch_tool, normalize_parameters, resolve_cluster, ToolBackend, ToolDispatch, ToolRegistry,
};
