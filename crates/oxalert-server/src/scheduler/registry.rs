use super::task::{TaskHandle, TaskState};
use oxalert_common::types::RuleKey;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Evaluation tasks by rule. The lock is never held across an await.
#[derive(Default)]
pub struct RuleRegistry {
    tasks: Mutex<HashMap<RuleKey, Arc<TaskHandle>>>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RuleKey, Arc<TaskHandle>>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Task of `key`, spawned with `spawn` when there is none yet. A task
    /// that stopped on its own is replaced.
    pub fn get_or_create(&self, key: &RuleKey, spawn: impl FnOnce() -> TaskHandle) -> Arc<TaskHandle> {
        let mut tasks = self.lock();
        if let Some(handle) = tasks.get(key) {
            if handle.state() != TaskState::Stopped {
                return Arc::clone(handle);
            }
            tracing::warn!(rule = %key, "Registered evaluation task already stopped, replacing it");
        }
        let handle = Arc::new(spawn());
        tasks.insert(key.clone(), Arc::clone(&handle));
        handle
    }

    pub fn get(&self, key: &RuleKey) -> Option<Arc<TaskHandle>> {
        self.lock().get(key).cloned()
    }

    pub fn contains(&self, key: &RuleKey) -> bool {
        self.lock().contains_key(key)
    }

    pub fn keys(&self) -> Vec<RuleKey> {
        self.lock().keys().cloned().collect()
    }

    pub fn remove(&self, key: &RuleKey) -> Option<Arc<TaskHandle>> {
        let removed = self.lock().remove(key);
        if removed.is_none() {
            tracing::warn!(rule = %key, "No evaluation task registered for rule");
        }
        removed
    }

    /// Removes and returns every task.
    pub fn drain(&self) -> Vec<Arc<TaskHandle>> {
        self.lock().drain().map(|(_, handle)| handle).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
