//! Provider abstraction.
//!
//! This module defines the capability contract every provider implements,
//! the registry that resolves provider names, resource schemas and the
//! built-in implementations:
//! - `local`: resources persisted as JSON files
//! - `memory`: in-process resources with scriptable failures
//! - `http`: out-of-process plugins speaking JSON over HTTP

mod contract;
mod http;
mod local;
mod memory;
mod registry;
mod schema;

#[cfg(test)]
pub use contract::MockProvider;
pub use contract::{Provider, ProviderMetadata, Resource};
pub use http::HttpProvider;
pub use local::LocalProvider;
pub use memory::{MemoryProvider, Operation};
pub use registry::ProviderRegistry;
pub use schema::{builtin_schemas, FieldSchema, ResourceSchema};
