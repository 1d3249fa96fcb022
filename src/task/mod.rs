use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::protocol::RequestCommand;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DERIVE_FROM_PAYLOAD_KEY: &str = "-";

type PayloadCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;
type SignalCallback = Arc<dyn Fn() + Send + Sync>;
type RetryCallback = Arc<dyn Fn(u32) + Send + Sync>;
type StatusCallback = Arc<dyn Fn(&[u8], &[u8]) + Send + Sync>;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct TaskId(Uuid);

impl TaskId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Priority {
    #[default]
    Normal,
    High,
    Low,
}

impl Priority {
    pub fn from_config_value(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

/// De-duplication hint sent with a submission. Jobs with the same key may be
/// merged by the server onto a single handle.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UniqueKey {
    FromPayload,
    Key(String),
}

impl UniqueKey {
    /// `""` means no key, `"-"` derives the key from the payload.
    pub fn from_config_value(value: &str) -> Option<Self> {
        match value {
            "" => None,
            DERIVE_FROM_PAYLOAD_KEY => Some(Self::FromPayload),
            other => Some(Self::Key(other.to_owned())),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TaskState {
    Idle,
    Queued,
    AwaitingHandle,
    InProgress,
    Completed,
    FailedFinal,
    BackgroundFired,
    Abandoned,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::FailedFinal | Self::BackgroundFired | Self::Abandoned
        )
    }

    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Queued | Self::AwaitingHandle | Self::InProgress)
    }
}

#[derive(Clone, Debug)]
pub struct TaskOptions {
    pub priority: Priority,
    pub background: bool,
    pub retry_budget: u32,
    /// Recorded for callers; nothing enforces it.
    pub timeout: Duration,
    pub unique: Option<UniqueKey>,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            priority: Priority::Normal,
            background: false,
            retry_budget: 0,
            timeout: DEFAULT_TIMEOUT,
            unique: None,
        }
    }
}

#[derive(Clone, Default)]
struct TaskCallbacks {
    on_complete: Option<PayloadCallback>,
    on_fail: Option<SignalCallback>,
    on_retry: Option<RetryCallback>,
    on_exception: Option<PayloadCallback>,
    on_status: Option<StatusCallback>,
    on_warning: Option<PayloadCallback>,
    on_data: Option<PayloadCallback>,
    on_connection_lost: Option<SignalCallback>,
}

/// A unit of work for the job server. Holds no network state; the
/// connection drives it through [`TaskHandle`].
pub struct Task {
    id: TaskId,
    function: String,
    payload: Vec<u8>,
    options: TaskOptions,
    uniq_hash: OnceLock<String>,
    retries_done: u32,
    successful: bool,
    state: TaskState,
    callbacks: TaskCallbacks,
}

impl Task {
    pub fn new(function: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: TaskId::new(),
            function: function.into(),
            payload: payload.into(),
            options: TaskOptions::default(),
            uniq_hash: OnceLock::new(),
            retries_done: 0,
            successful: false,
            state: TaskState::Idle,
            callbacks: TaskCallbacks::default(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.set_priority(priority);
        self
    }

    pub fn with_background(mut self, background: bool) -> Self {
        self.set_background(background);
        self
    }

    pub fn with_retries(mut self, retry_budget: u32) -> Self {
        self.set_retry_budget(retry_budget);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.set_timeout(timeout);
        self
    }

    pub fn with_unique(mut self, unique: UniqueKey) -> Self {
        self.set_unique(Some(unique));
        self
    }

    pub fn on_complete(mut self, callback: impl Fn(&[u8]) + Send + Sync + 'static) -> Self {
        self.callbacks.on_complete = Some(Arc::new(callback));
        self
    }

    pub fn on_fail(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.callbacks.on_fail = Some(Arc::new(callback));
        self
    }

    /// Receives the attempt number, starting at 1.
    pub fn on_retry(mut self, callback: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.callbacks.on_retry = Some(Arc::new(callback));
        self
    }

    pub fn on_exception(mut self, callback: impl Fn(&[u8]) + Send + Sync + 'static) -> Self {
        self.callbacks.on_exception = Some(Arc::new(callback));
        self
    }

    /// Receives numerator and denominator exactly as the worker reported them.
    pub fn on_status(mut self, callback: impl Fn(&[u8], &[u8]) + Send + Sync + 'static) -> Self {
        self.callbacks.on_status = Some(Arc::new(callback));
        self
    }

    pub fn on_warning(mut self, callback: impl Fn(&[u8]) + Send + Sync + 'static) -> Self {
        self.callbacks.on_warning = Some(Arc::new(callback));
        self
    }

    pub fn on_data(mut self, callback: impl Fn(&[u8]) + Send + Sync + 'static) -> Self {
        self.callbacks.on_data = Some(Arc::new(callback));
        self
    }

    /// Fires when the connection closes while this task is still in flight.
    /// No further events will arrive for it on that connection.
    pub fn on_connection_lost(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.callbacks.on_connection_lost = Some(Arc::new(callback));
        self
    }

    pub fn set_priority(&mut self, priority: Priority) {
        self.options.priority = priority;
    }

    pub fn set_background(&mut self, background: bool) {
        self.options.background = background;
    }

    pub fn set_retry_budget(&mut self, retry_budget: u32) {
        self.options.retry_budget = retry_budget;
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.options.timeout = timeout;
    }

    /// Has no effect on the hash once it has been computed.
    pub fn set_unique(&mut self, unique: Option<UniqueKey>) {
        self.options.unique = unique;
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn options(&self) -> &TaskOptions {
        &self.options
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn retries_done(&self) -> u32 {
        self.retries_done
    }

    pub fn is_successful(&self) -> bool {
        self.successful
    }

    /// Memoized on first call.
    pub fn uniq_hash(&self) -> &str {
        self.uniq_hash.get_or_init(|| match &self.options.unique {
            None => String::new(),
            Some(UniqueKey::FromPayload) => stable_hash(&self.payload),
            Some(UniqueKey::Key(key)) => stable_hash(key.as_bytes()),
        })
    }

    pub fn submit_command(&self) -> RequestCommand {
        match (self.options.priority, self.options.background) {
            (Priority::Normal, false) => RequestCommand::SubmitJob,
            (Priority::Normal, true) => RequestCommand::SubmitJobBg,
            (Priority::High, false) => RequestCommand::SubmitJobHigh,
            (Priority::High, true) => RequestCommand::SubmitJobHighBg,
            (Priority::Low, false) => RequestCommand::SubmitJobLow,
            (Priority::Low, true) => RequestCommand::SubmitJobLowBg,
        }
    }

    /// `function \0 uniq-hash \0 payload`
    pub fn submit_body(&self) -> Vec<u8> {
        let uniq = self.uniq_hash();
        let mut body =
            Vec::with_capacity(self.function.len() + uniq.len() + self.payload.len() + 2);
        body.extend_from_slice(self.function.as_bytes());
        body.push(0);
        body.extend_from_slice(uniq.as_bytes());
        body.push(0);
        body.extend_from_slice(&self.payload);
        body
    }

    fn reset_state(&mut self) {
        self.retries_done = 0;
        self.successful = false;
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("function", &self.function)
            .field("payload_len", &self.payload.len())
            .field("options", &self.options)
            .field("retries_done", &self.retries_done)
            .field("successful", &self.successful)
            .field("state", &self.state)
            .finish()
    }
}

fn stable_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut prefix = [0_u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix).to_string()
}

/// Server-originated events, already split from the packet body.
#[derive(Clone, Copy, Debug)]
pub(crate) enum TaskEvent<'a> {
    Complete(&'a [u8]),
    Fail,
    Exception(&'a [u8]),
    Status(&'a [u8], &'a [u8]),
    Warning(&'a [u8]),
    Data(&'a [u8]),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum TaskTransition {
    Unchanged,
    Finished,
    Resubmit,
}

/// Shared handle to a [`Task`]. The caller keeps one; the connection keeps
/// clones only while the task is in flight or waiting in the finished list.
#[derive(Clone)]
pub struct TaskHandle {
    id: TaskId,
    inner: Arc<Mutex<Task>>,
}

impl TaskHandle {
    pub fn new(task: Task) -> Self {
        Self {
            id: task.id,
            inner: Arc::new(Mutex::new(task)),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Do not hold the guard across calls into the connection.
    pub fn lock(&self) -> MutexGuard<'_, Task> {
        self.inner.lock().expect("task lock poisoned")
    }

    pub fn state(&self) -> TaskState {
        self.lock().state
    }

    pub fn retries_done(&self) -> u32 {
        self.lock().retries_done
    }

    pub fn is_successful(&self) -> bool {
        self.lock().successful
    }

    pub fn ptr_eq(&self, other: &TaskHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn mark_queued(&self, reset_state: bool) {
        let mut task = self.lock();
        if reset_state {
            task.reset_state();
        }
        task.state = TaskState::Queued;
    }

    /// Returns the submit packet parts for the sequencer.
    pub(crate) fn begin_submission(&self) -> (RequestCommand, Vec<u8>) {
        let mut task = self.lock();
        task.state = TaskState::AwaitingHandle;
        (task.submit_command(), task.submit_body())
    }

    /// Returns true when the task is a background task and is now finished.
    pub(crate) fn accept_handle(&self) -> bool {
        let mut task = self.lock();
        if task.options.background {
            task.state = TaskState::BackgroundFired;
            true
        } else {
            task.state = TaskState::InProgress;
            false
        }
    }

    pub(crate) fn abandon(&self) {
        let callback = {
            let mut task = self.lock();
            task.state = TaskState::Abandoned;
            task.callbacks.on_connection_lost.clone()
        };
        if let Some(callback) = callback {
            callback();
        }
    }

    // Callbacks run after the lock is released so they may inspect the task.
    pub(crate) fn deliver(&self, event: TaskEvent<'_>) -> TaskTransition {
        let mut task = self.lock();
        match event {
            TaskEvent::Complete(payload) => {
                task.successful = true;
                task.state = TaskState::Completed;
                let callback = task.callbacks.on_complete.clone();
                drop(task);
                if let Some(callback) = callback {
                    callback(payload);
                }
                TaskTransition::Finished
            }
            TaskEvent::Fail => {
                if task.retries_done >= task.options.retry_budget {
                    task.state = TaskState::FailedFinal;
                    let callback = task.callbacks.on_fail.clone();
                    drop(task);
                    if let Some(callback) = callback {
                        callback();
                    }
                    return TaskTransition::Finished;
                }

                task.retries_done += 1;
                task.state = TaskState::Queued;
                let attempt = task.retries_done;
                let callback = task.callbacks.on_retry.clone();
                drop(task);
                if let Some(callback) = callback {
                    callback(attempt);
                }
                TaskTransition::Resubmit
            }
            TaskEvent::Exception(message) => {
                let callback = task.callbacks.on_exception.clone();
                drop(task);
                if let Some(callback) = callback {
                    callback(message);
                }
                TaskTransition::Unchanged
            }
            TaskEvent::Status(numerator, denominator) => {
                let callback = task.callbacks.on_status.clone();
                drop(task);
                if let Some(callback) = callback {
                    callback(numerator, denominator);
                }
                TaskTransition::Unchanged
            }
            TaskEvent::Warning(message) => {
                let callback = task.callbacks.on_warning.clone();
                drop(task);
                if let Some(callback) = callback {
                    callback(message);
                }
                TaskTransition::Unchanged
            }
            TaskEvent::Data(chunk) => {
                let callback = task.callbacks.on_data.clone();
                drop(task);
                if let Some(callback) = callback {
                    callback(chunk);
                }
                TaskTransition::Unchanged
            }
        }
    }
}

impl From<Task> for TaskHandle {
    fn from(task: Task) -> Self {
        Self::new(task)
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TaskHandle").field(&self.id).finish()
    }
}
