//! Activities: the persisted units of non-deterministic work
//!
//! This module provides:
//! - [`ActivityError`] and the handler/invocation types
//! - [`DependencyScope`] for non-serialized handler dependencies

mod definition;
mod scope;

pub use definition::{ActivityError, ActivityHandler, ActivityInvocation, ActivityResult};
pub use scope::{DependencyScope, ScopeFactory};
