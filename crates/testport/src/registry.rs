use std::collections::HashMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, warn};
use uuid::Uuid;

/// Lifetime a synthetic entity is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceScope {
    /// Removed when the current test method's scope ends.
    MethodScoped,
    /// Removed when the framework closes.
    FrameworkScoped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CleanupReport {
    pub removed: usize,
    pub failed: usize,
}

impl CleanupReport {
    pub fn attempted(&self) -> usize {
        self.removed + self.failed
    }
}

/// Scope bookkeeping for entities created through the framework.
#[derive(Debug, Default)]
pub struct ScopeRegistry {
    entries: Mutex<HashMap<Uuid, ResourceScope>>,
    poison_logged: AtomicBool,
}

impl ScopeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-registering an id replaces its scope.
    pub fn register(&self, id: Uuid, scope: ResourceScope) {
        self.lock().insert(id, scope);
        debug!(%id, ?scope, "registry_entity_registered");
    }

    pub fn unregister(&self, id: Uuid) -> Option<ResourceScope> {
        self.lock().remove(&id)
    }

    pub fn scope_of(&self, id: Uuid) -> Option<ResourceScope> {
        self.lock().get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Removes every method-scoped entity, whoever registered it.
    pub fn end_method_scope<F, E>(&self, remover: F) -> CleanupReport
    where
        F: FnMut(Uuid) -> Result<(), E>,
        E: Display,
    {
        let ids = {
            let mut entries = self.lock();
            let ids: Vec<Uuid> = entries
                .iter()
                .filter(|(_, scope)| **scope == ResourceScope::MethodScoped)
                .map(|(id, _)| *id)
                .collect();
            for id in &ids {
                entries.remove(id);
            }
            ids
        };
        remove_each(ids, remover)
    }

    pub fn cleanup_all<F, E>(&self, remover: F) -> CleanupReport
    where
        F: FnMut(Uuid) -> Result<(), E>,
        E: Display,
    {
        let ids: Vec<Uuid> = self.lock().drain().map(|(id, _)| id).collect();
        remove_each(ids, remover)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, ResourceScope>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                if !self.poison_logged.swap(true, Ordering::Relaxed) {
                    warn!("registry_lock_poisoned_recovered");
                }
                poisoned.into_inner()
            }
        }
    }
}

fn remove_each<F, E>(ids: Vec<Uuid>, mut remover: F) -> CleanupReport
where
    F: FnMut(Uuid) -> Result<(), E>,
    E: Display,
{
    let mut report = CleanupReport::default();
    for id in ids {
        match remover(id) {
            Ok(()) => report.removed += 1,
            Err(error) => {
                warn!(%id, error = %error, "registry_cleanup_failed");
                report.failed += 1;
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn method_scope_removes_only_method_entities() {
        let registry = ScopeRegistry::new();
        let method = Uuid::new_v4();
        let framework = Uuid::new_v4();
        registry.register(method, ResourceScope::MethodScoped);
        registry.register(framework, ResourceScope::FrameworkScoped);

        let mut removed = Vec::new();
        let report = registry.end_method_scope(|id| {
            removed.push(id);
            Ok::<(), String>(())
        });
        assert_eq!(report, CleanupReport { removed: 1, failed: 0 });
        assert_eq!(removed, vec![method]);
        assert_eq!(registry.scope_of(method), None);
        assert_eq!(registry.scope_of(framework), Some(ResourceScope::FrameworkScoped));
    }

    #[test]
    fn method_scope_spans_registering_threads() {
        let registry = Arc::new(ScopeRegistry::new());
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || registry.register(Uuid::new_v4(), ResourceScope::MethodScoped))
            })
            .collect();
        for worker in workers {
            worker.join().expect("worker");
        }
        let report = registry.end_method_scope(|_| Ok::<(), String>(()));
        assert_eq!(report.removed, 4);
        assert!(registry.is_empty());
    }

    #[test]
    fn failures_are_counted_and_cleanup_continues() {
        let registry = ScopeRegistry::new();
        let broken = Uuid::new_v4();
        registry.register(broken, ResourceScope::MethodScoped);
        registry.register(Uuid::new_v4(), ResourceScope::FrameworkScoped);
        registry.register(Uuid::new_v4(), ResourceScope::FrameworkScoped);

        let report = registry.cleanup_all(|id| {
            if id == broken {
                Err("player already gone")
            } else {
                Ok(())
            }
        });
        assert_eq!(report, CleanupReport { removed: 2, failed: 1 });
        assert_eq!(report.attempted(), 3);
        assert!(registry.is_empty());
    }

    #[test]
    fn unregister_and_rescope() {
        let registry = ScopeRegistry::new();
        let id = Uuid::new_v4();
        registry.register(id, ResourceScope::MethodScoped);
        registry.register(id, ResourceScope::FrameworkScoped);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.unregister(id), Some(ResourceScope::FrameworkScoped));
        assert_eq!(registry.unregister(id), None);
    }

    #[test]
    fn recovers_from_poisoned_lock() {
        let registry = Arc::new(ScopeRegistry::new());
        let poisoner = Arc::clone(&registry);
        let _ = thread::spawn(move || {
            let _guard = poisoner.entries.lock().expect("lock");
            panic!("poison the registry");
        })
        .join();

        let id = Uuid::new_v4();
        registry.register(id, ResourceScope::MethodScoped);
        assert_eq!(registry.scope_of(id), Some(ResourceScope::MethodScoped));
    }
}
