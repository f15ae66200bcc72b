use std::collections::HashMap;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// The control handle of a running task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    token: CancellationToken,
    generation: u64,
}

impl TaskHandle {
    /// The token the task polls for cancellation.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Asks the task to stop at its next round or client boundary.
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

#[derive(Debug, Default)]
struct Tasks {
    handles: HashMap<u64, TaskHandle>,
    next_generation: u64,
}

/// The running tasks of a node, by task id.
///
/// Every registration gets its own generation so that a finished task only ever removes its
/// own entry, even after the same id was stopped and started again.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: Mutex<Tasks>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new task.
    ///
    /// # Returns
    /// The task's handle or `None` if the id is already registered.
    pub fn register(&self, task_id: u64) -> Option<TaskHandle> {
        let mut tasks = self.tasks.lock();
        if tasks.handles.contains_key(&task_id) {
            return None;
        }

        tasks.next_generation += 1;
        let handle = TaskHandle {
            token: CancellationToken::new(),
            generation: tasks.next_generation,
        };
        tasks.handles.insert(task_id, handle.clone());
        Some(handle)
    }

    pub fn contains(&self, task_id: u64) -> bool {
        self.tasks.lock().handles.contains_key(&task_id)
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unregisters a task whatever its generation.
    pub fn remove(&self, task_id: u64) -> Option<TaskHandle> {
        self.tasks.lock().handles.remove(&task_id)
    }

    /// Unregisters a task only if it is still the registration `handle` came from.
    pub fn release(&self, task_id: u64, handle: &TaskHandle) -> bool {
        let mut tasks = self.tasks.lock();
        match tasks.handles.get(&task_id) {
            Some(h) if h.generation == handle.generation => {
                tasks.handles.remove(&task_id);
                true
            }
            _ => false,
        }
    }
}
