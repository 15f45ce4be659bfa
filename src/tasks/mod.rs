//! Command tasks and the bounded registry that tracks them.
//!
//! [`TaskRegistry`] is the single authority for which tasks are outstanding.
//! It enforces the configured capacity and hands out `Arc<Task>` handles. A
//! task is inserted when a command is submitted and removed by its watcher
//! when the process terminates.
//!
//! ## Concurrency
//!
//! The map sits behind one `Mutex`. `set` holds it across the limit check and
//! the insert so two concurrent submissions cannot both take the last slot.
//! No I/O happens while the lock is held.

pub mod buffer;
pub mod task;

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;

use task::Task;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("task limit reached (max {capacity})")]
    Full { capacity: usize },
}

/// Bounded id → task map.
///
/// Cloneable; all clones share the same inner `Arc<Mutex<...>>`.
#[derive(Clone)]
pub struct TaskRegistry {
    tasks: Arc<Mutex<HashMap<String, Arc<Task>>>>,
    capacity: usize,
}

impl TaskRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            tasks: Arc::new(Mutex::new(HashMap::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Insert or replace. Fails only when the registry is full and `id` is new.
    pub async fn set(&self, id: &str, task: Arc<Task>) -> Result<(), RegistryError> {
        let mut tasks = self.tasks.lock().await;
        if tasks.len() >= self.capacity && !tasks.contains_key(id) {
            return Err(RegistryError::Full {
                capacity: self.capacity,
            });
        }
        tasks.insert(id.to_string(), task);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Task>> {
        self.tasks.lock().await.get(id).cloned()
    }

    /// Remove `id`. Removing an absent id is a no-op.
    pub async fn delete(&self, id: &str) {
        self.tasks.lock().await.remove(id);
    }

    /// Snapshot of outstanding ids, in no particular order.
    pub async fn all(&self) -> Vec<String> {
        self.tasks.lock().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn task(id: &str) -> Arc<Task> {
        Arc::new(Task::new(id.to_string(), PathBuf::from("/bin/sh"), "true".into()))
    }

    #[tokio::test]
    async fn test_get_absent_is_none() {
        let reg = TaskRegistry::new(2);
        assert!(reg.get("nope").await.is_none());
    }

    #[tokio::test]
    async fn test_capacity_counts_distinct_ids() {
        let reg = TaskRegistry::new(3);
        for id in ["a", "b", "c"] {
            reg.set(id, task(id)).await.unwrap();
        }
        assert_eq!(
            reg.set("d", task("d")).await,
            Err(RegistryError::Full { capacity: 3 })
        );
        // Overwriting a present id is an update, not growth.
        reg.set("b", task("b")).await.unwrap();
        assert_eq!(reg.len().await, 3);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent_and_frees_a_slot() {
        let reg = TaskRegistry::new(1);
        reg.set("a", task("a")).await.unwrap();
        reg.delete("a").await;
        reg.delete("a").await;
        assert!(reg.is_empty().await);
        reg.set("b", task("b")).await.unwrap();
        let mut ids = reg.all().await;
        ids.sort();
        assert_eq!(ids, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_concurrent_sets_never_exceed_capacity() {
        let reg = TaskRegistry::new(4);
        let mut handles = Vec::new();
        for i in 0..16 {
            let reg = reg.clone();
            handles.push(tokio::spawn(async move {
                let id = format!("t{i}");
                reg.set(&id, task(&id)).await.is_ok()
            }));
        }
        let mut ok = 0;
        for h in handles {
            if h.await.unwrap() {
                ok += 1;
            }
        }
        assert_eq!(ok, 4);
        assert_eq!(reg.len().await, 4);
    }
}
