use std::collections::HashMap;

use crate::protocol::{JobHandle, ProtocolError, ResponseCommand};
use crate::task::TaskHandle;

/// Tasks waiting on server events, keyed by job handle. Several tasks share a
/// handle when the server merges duplicate submissions; their order is
/// registration order. A key never maps to an empty list.
#[derive(Debug, Default)]
pub struct HandleRegistry {
    tasks: HashMap<JobHandle, Vec<TaskHandle>>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handle: JobHandle, task: TaskHandle) {
        self.tasks.entry(handle).or_default().push(task);
    }

    /// With `consume`, the whole entry is removed; terminal events use this
    /// since nothing more is expected for the handle.
    pub fn lookup(
        &mut self,
        command: ResponseCommand,
        handle: &JobHandle,
        consume: bool,
    ) -> Result<Vec<TaskHandle>, ProtocolError> {
        let tasks = if consume {
            self.tasks.remove(handle)
        } else {
            self.tasks.get(handle).cloned()
        };

        tasks.ok_or_else(|| ProtocolError::UnknownHandle {
            command,
            handle: handle.clone(),
        })
    }

    pub fn contains(&self, handle: &JobHandle) -> bool {
        self.tasks.contains_key(handle)
    }

    pub fn tasks_for(&self, handle: &JobHandle) -> Option<&[TaskHandle]> {
        self.tasks.get(handle).map(Vec::as_slice)
    }

    pub fn handles(&self) -> Vec<JobHandle> {
        let mut handles: Vec<JobHandle> = self.tasks.keys().cloned().collect();
        handles.sort();
        handles
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn drain_all(&mut self) -> Vec<TaskHandle> {
        self.tasks.drain().flat_map(|(_, tasks)| tasks).collect()
    }
}
