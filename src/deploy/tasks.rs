//! Background-task registry
//!
//! Long-running work registers itself under a key while it runs so the
//! shutdown sequence can wait for it.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Registry of in-flight background tasks
#[derive(Debug, Default)]
pub struct BackgroundTasks {
    tasks: RwLock<HashMap<String, bool>>,
}

impl BackgroundTasks {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a task active
    pub fn begin(&self, key: &str) {
        self.write().insert(key.to_string(), true);
    }

    /// Mark a task finished; unknown keys are ignored
    pub fn end(&self, key: &str) {
        self.write().remove(key);
    }

    /// Whether no task is active
    pub fn is_quiescent(&self) -> bool {
        !self.read().values().any(|active| *active)
    }

    /// Mark a task active unless it already is
    ///
    /// The task ends when the returned guard drops.
    pub fn try_begin(self: &Arc<Self>, key: &str) -> Option<TaskGuard> {
        let mut tasks = self.write();
        if tasks.get(key).copied().unwrap_or(false) {
            return None;
        }

        tasks.insert(key.to_string(), true);
        Some(TaskGuard {
            tasks: Arc::clone(self),
            key: key.to_string(),
        })
    }

    /// Keys of active tasks, sorted
    pub fn active(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .read()
            .iter()
            .filter(|(_, active)| **active)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    // Entries are plain flags, a poisoned map is still consistent
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, bool>> {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, bool>> {
        self.tasks.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Active task; ends the task when dropped
#[derive(Debug)]
pub struct TaskGuard {
    tasks: Arc<BackgroundTasks>,
    key: String,
}

impl TaskGuard {
    /// Registry key of the task
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.tasks.end(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quiescence() {
        let tasks = BackgroundTasks::new();
        assert!(tasks.is_quiescent());

        tasks.begin("a");
        assert!(!tasks.is_quiescent());

        tasks.begin("b");
        tasks.end("a");
        assert!(!tasks.is_quiescent());

        tasks.end("b");
        assert!(tasks.is_quiescent());

        tasks.end("b");
        tasks.end("never-started");
        assert!(tasks.is_quiescent());
    }

    #[test]
    fn test_try_begin_guard() {
        let tasks = Arc::new(BackgroundTasks::new());

        let guard = tasks.try_begin("blog").unwrap();
        assert_eq!(guard.key(), "blog");
        assert!(tasks.try_begin("blog").is_none());
        assert_eq!(tasks.active(), vec!["blog"]);

        let other = tasks.try_begin("shop").unwrap();
        assert_eq!(tasks.active(), vec!["blog", "shop"]);

        drop(guard);
        drop(other);
        assert!(tasks.is_quiescent());
        assert!(tasks.try_begin("blog").is_some());
    }

    #[test]
    fn test_guard_ends_on_panic() {
        let tasks = Arc::new(BackgroundTasks::new());

        let registry = Arc::clone(&tasks);
        let result = std::thread::spawn(move || {
            let _guard = registry.try_begin("blog");
            panic!("deployment panicked");
        })
        .join();

        assert!(result.is_err());
        assert!(tasks.is_quiescent());
    }

    #[test]
    fn test_concurrent_registration() {
        let tasks = Arc::new(BackgroundTasks::new());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let tasks = Arc::clone(&tasks);
                std::thread::spawn(move || {
                    let key = format!("task-{}", i);
                    tasks.begin(&key);
                    tasks.end(&key);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(tasks.is_quiescent());
    }
}
