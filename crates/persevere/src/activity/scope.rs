//! Dependency scope for activity invocations
//!
//! Activity arguments that should not be serialized (database pools, HTTP
//! clients) are resolved from a [`DependencyScope`] instead. The engine
//! builds one scope per invocation through the registered scope factory.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// Type-keyed bag of shared dependencies
///
/// # Example
///
/// ```
/// use persevere::activity::DependencyScope;
///
/// #[derive(Debug, PartialEq)]
/// struct MailClient(&'static str);
///
/// let mut scope = DependencyScope::new();
/// scope.provide(MailClient("smtp.internal"));
///
/// let client = scope.get::<MailClient>().unwrap();
/// assert_eq!(*client, MailClient("smtp.internal"));
/// ```
#[derive(Default, Clone)]
pub struct DependencyScope {
    entries: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl DependencyScope {
    /// Create an empty scope
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dependency by its type
    pub fn provide<T: Send + Sync + 'static>(&mut self, value: T) -> &mut Self {
        self.entries.insert(TypeId::of::<T>(), Arc::new(value));
        self
    }

    /// Register an already shared dependency
    pub fn provide_arc<T: Send + Sync + 'static>(&mut self, value: Arc<T>) -> &mut Self {
        self.entries.insert(TypeId::of::<T>(), value);
        self
    }

    /// Resolve a dependency by type
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.entries
            .get(&TypeId::of::<T>())
            .and_then(|entry| Arc::clone(entry).downcast::<T>().ok())
    }

    /// Number of registered dependencies
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the scope is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for DependencyScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyScope")
            .field("entries", &self.entries.len())
            .finish()
    }
}

/// Factory invoked once per activity run to build its scope
pub type ScopeFactory = Arc<dyn Fn() -> DependencyScope + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    struct Pool {
        dsn: String,
    }

    #[test]
    fn test_provide_and_get() {
        let mut scope = DependencyScope::new();
        scope.provide(Pool {
            dsn: "postgres://localhost".to_string(),
        });

        let pool = scope.get::<Pool>().unwrap();
        assert_eq!(pool.dsn, "postgres://localhost");
    }

    #[test]
    fn test_missing_dependency() {
        let scope = DependencyScope::new();
        assert!(scope.get::<Pool>().is_none());
        assert!(scope.is_empty());
    }

    #[test]
    fn test_provide_arc_shares() {
        let shared = Arc::new(Pool {
            dsn: "postgres://replica".to_string(),
        });

        let mut scope = DependencyScope::new();
        scope.provide_arc(Arc::clone(&shared));

        let resolved = scope.get::<Pool>().unwrap();
        assert!(Arc::ptr_eq(&resolved, &shared));
    }
}
