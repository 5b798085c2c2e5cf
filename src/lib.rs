//! Evalboard: metric reconciliation and caching layer for LLM evaluation
//! run dashboards.
//!
//! The library side is driven through [`EvalSession`]; the `evalboard`
//! binary is a thin CLI over it.

pub mod annotations;
pub mod api;
pub mod batch;
pub mod config;
pub mod errors;
pub mod metrics;
pub mod models;
pub mod resolver;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{EvalBackend, HttpBackend};
pub use config::{Config, SessionConfig};
pub use errors::{AnnotationError, BackendError, LoadError};
pub use resolver::{ColumnDescriptor, ColumnResolver, ColumnValue, StepType};
pub use store::EvalSession;
