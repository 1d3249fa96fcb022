use std::fmt;
use std::mem;

use serde_json::json;

use crate::engine::registry::HandleRegistry;
use crate::engine::sequencer::SubmissionSequencer;
use crate::logging::{LogLevel, Logger};
use crate::protocol::{
    split_body, JobHandle, Packet, PacketCodec, ProtocolError, ResponseCommand,
};
use crate::task::{TaskEvent, TaskHandle, TaskTransition};
use crate::transport::{Transport, TransportError};

const LOG_CONTEXT: &str = "gearwire::connection";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Connecting,
    Ready,
    Closed,
}

#[derive(Debug)]
pub enum ConnectionError {
    Protocol(ProtocolError),
    Transport(TransportError),
    Closed,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(source) => write!(f, "connection aborted: {source}"),
            Self::Transport(source) => write!(f, "connection transport error: {source}"),
            Self::Closed => write!(f, "connection is closed"),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<ProtocolError> for ConnectionError {
    fn from(value: ProtocolError) -> Self {
        Self::Protocol(value)
    }
}

impl From<TransportError> for ConnectionError {
    fn from(value: TransportError) -> Self {
        Self::Transport(value)
    }
}

/// Client side of one job server connection.
///
/// Driven entirely by its owner: `on_open`, `on_bytes` and `on_close` are the
/// transport notifications, `queue` submits work. Nothing here blocks, and
/// all state is touched only from those calls, in arrival order.
///
/// A [`ProtocolError`] closes the connection; the read buffer is discarded
/// since it can no longer be trusted. Call `on_close` afterwards to release
/// in-flight tasks.
pub struct Connection<T: Transport> {
    transport: T,
    codec: PacketCodec,
    logger: Logger,
    state: ConnectionState,
    read_buffer: Vec<u8>,
    deferred_writes: Vec<Vec<u8>>,
    sequencer: SubmissionSequencer,
    registry: HandleRegistry,
    finished: Vec<TaskHandle>,
}

impl<T: Transport> Connection<T> {
    pub fn new(transport: T, codec: PacketCodec, logger: Logger) -> Self {
        Self {
            transport,
            codec,
            logger,
            state: ConnectionState::Connecting,
            read_buffer: Vec::new(),
            deferred_writes: Vec::new(),
            sequencer: SubmissionSequencer::new(),
            registry: HandleRegistry::new(),
            finished: Vec::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Starts a fresh run of `task`: its retry counter and success flag are
    /// reset. Allowed before the connection is open; the submission is sent
    /// once `on_open` is called.
    pub fn queue(&mut self, task: &TaskHandle) -> Result<(), ConnectionError> {
        if self.state == ConnectionState::Closed {
            return Err(ConnectionError::Closed);
        }

        task.mark_queued(true);
        self.sequencer.enqueue(task.clone());
        self.pump()
    }

    pub fn on_open(&mut self) -> Result<(), ConnectionError> {
        if self.state != ConnectionState::Connecting {
            return Ok(());
        }

        self.state = ConnectionState::Ready;
        let deferred = mem::take(&mut self.deferred_writes);
        self.logger.log(
            LogLevel::Debug,
            Some(LOG_CONTEXT),
            "connection ready",
            Some(json!({ "deferred_writes": deferred.len() })),
        );
        for packet in deferred {
            self.write(&packet)?;
        }
        self.pump()
    }

    pub fn on_bytes(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        if self.state == ConnectionState::Closed {
            return Err(ConnectionError::Closed);
        }

        self.logger.verbose(
            Some(LOG_CONTEXT),
            &format!("received {} byte(s) from job server", bytes.len()),
        );
        self.read_buffer.extend_from_slice(bytes);

        loop {
            let packet = match self.codec.try_decode(&mut self.read_buffer) {
                Ok(Some(packet)) => packet,
                Ok(None) => return Ok(()),
                Err(error) => return Err(self.abort(error)),
            };

            if let Err(error) = self.dispatch(packet) {
                return Err(match error {
                    ConnectionError::Protocol(error) if self.state != ConnectionState::Closed => {
                        self.abort(error)
                    }
                    other => other,
                });
            }
        }
    }

    /// Marks the connection closed and hands back every task that was still
    /// queued, awaiting a handle or in progress. Each one is moved to
    /// `Abandoned` and its connection-lost callback fires; nothing is retried.
    pub fn on_close(&mut self) -> Vec<TaskHandle> {
        self.state = ConnectionState::Closed;
        self.read_buffer.clear();
        self.deferred_writes.clear();

        let mut abandoned = self.sequencer.drain_all();
        abandoned.extend(self.registry.drain_all());
        self.logger.log(
            LogLevel::Info,
            Some(LOG_CONTEXT),
            "connection closed",
            Some(json!({ "abandoned_tasks": abandoned.len() })),
        );
        for task in &abandoned {
            task.abandon();
        }
        abandoned
    }

    /// Completed, finally failed and background tasks, in finishing order.
    pub fn take_finished(&mut self) -> Vec<TaskHandle> {
        mem::take(&mut self.finished)
    }

    pub fn finished_len(&self) -> usize {
        self.finished.len()
    }

    pub fn awaiting_handle(&self) -> Option<&TaskHandle> {
        self.sequencer.awaiting()
    }

    pub fn pending_submissions(&self) -> usize {
        self.sequencer.pending_len()
    }

    pub fn registered_handles(&self) -> Vec<JobHandle> {
        self.registry.handles()
    }

    pub fn is_registered(&self, handle: &JobHandle) -> bool {
        self.registry.contains(handle)
    }

    /// True when no task is queued, awaiting a handle or in progress.
    pub fn is_idle(&self) -> bool {
        self.sequencer.is_idle() && self.registry.is_empty()
    }

    fn abort(&mut self, error: ProtocolError) -> ConnectionError {
        self.logger.error(Some(LOG_CONTEXT), &error.to_string());
        self.state = ConnectionState::Closed;
        self.read_buffer.clear();
        ConnectionError::Protocol(error)
    }

    // A lost submit packet would leave the awaiting slot occupied forever, so
    // any failed write closes the connection.
    fn write(&mut self, packet: &[u8]) -> Result<(), ConnectionError> {
        if let Err(error) = self.transport.send(packet) {
            self.logger.error(
                Some(LOG_CONTEXT),
                &format!("failed to write to job server: {error}"),
            );
            self.state = ConnectionState::Closed;
            return Err(error.into());
        }
        Ok(())
    }

    fn pump(&mut self) -> Result<(), ConnectionError> {
        let submission = match self.sequencer.next_submission() {
            Ok(Some(submission)) => submission,
            Ok(None) => return Ok(()),
            Err(error) => return Err(self.abort(error)),
        };

        self.logger.log(
            LogLevel::Debug,
            Some(LOG_CONTEXT),
            "submitting task",
            Some(json!({
                "task_id": submission.task.id().to_string(),
                "bytes": submission.packet.len(),
                "deferred": self.state == ConnectionState::Connecting,
            })),
        );

        match self.state {
            ConnectionState::Ready => self.write(&submission.packet)?,
            ConnectionState::Connecting => self.deferred_writes.push(submission.packet),
            ConnectionState::Closed => {}
        }
        Ok(())
    }

    fn dispatch(&mut self, packet: Packet) -> Result<(), ConnectionError> {
        match packet.command {
            ResponseCommand::JobCreated => self.handle_job_created(&packet.body),
            ResponseCommand::WorkComplete => self.handle_work_complete(&packet.body),
            ResponseCommand::WorkFail => self.handle_work_fail(&packet.body),
            ResponseCommand::WorkException => self.handle_work_exception(&packet.body),
            ResponseCommand::WorkStatus => self.handle_work_status(&packet.body),
            ResponseCommand::WorkWarning => self.handle_work_warning(&packet.body),
            ResponseCommand::WorkData => self.handle_work_data(&packet.body),
        }
    }

    fn handle_job_created(&mut self, body: &[u8]) -> Result<(), ConnectionError> {
        if body.is_empty() {
            return Err(ProtocolError::MalformedBody {
                command: ResponseCommand::JobCreated,
                reason: "empty job handle",
            }
            .into());
        }

        let handle = JobHandle::new(body);
        self.logger.debug(
            Some(LOG_CONTEXT),
            &format!("got job_created with handle {handle}"),
        );

        let task = self.sequencer.resolve_job_created(&handle)?;
        if task.accept_handle() {
            self.finished.push(task);
        } else {
            self.registry.register(handle, task);
        }
        self.pump()
    }

    fn handle_work_complete(&mut self, body: &[u8]) -> Result<(), ConnectionError> {
        let fields = split_body(body, 2);
        let handle = JobHandle::new(fields[0]);
        self.log_event(ResponseCommand::WorkComplete, &handle, fields[1].len());

        for task in self.tasks_in_progress(ResponseCommand::WorkComplete, &handle, true)? {
            task.deliver(TaskEvent::Complete(fields[1]));
            self.finished.push(task);
        }
        Ok(())
    }

    fn handle_work_fail(&mut self, body: &[u8]) -> Result<(), ConnectionError> {
        let handle = JobHandle::new(body);
        self.log_event(ResponseCommand::WorkFail, &handle, 0);

        for task in self.tasks_in_progress(ResponseCommand::WorkFail, &handle, true)? {
            match task.deliver(TaskEvent::Fail) {
                TaskTransition::Resubmit => {
                    self.logger.info(
                        Some(LOG_CONTEXT),
                        &format!(
                            "resubmitting task {} after failure (attempt {})",
                            task.id(),
                            task.retries_done()
                        ),
                    );
                    self.sequencer.enqueue(task);
                }
                TaskTransition::Finished | TaskTransition::Unchanged => self.finished.push(task),
            }
        }
        self.pump()
    }

    fn handle_work_exception(&mut self, body: &[u8]) -> Result<(), ConnectionError> {
        let fields = split_body(body, 2);
        let handle = JobHandle::new(fields[0]);
        self.log_event(ResponseCommand::WorkException, &handle, fields[1].len());

        for task in self.tasks_in_progress(ResponseCommand::WorkException, &handle, false)? {
            task.deliver(TaskEvent::Exception(fields[1]));
        }
        Ok(())
    }

    fn handle_work_status(&mut self, body: &[u8]) -> Result<(), ConnectionError> {
        let fields = split_body(body, 3);
        let handle = JobHandle::new(fields[0]);
        self.logger.debug(
            Some(LOG_CONTEXT),
            &format!(
                "got work_status with handle {handle} : {}/{}",
                String::from_utf8_lossy(fields[1]),
                String::from_utf8_lossy(fields[2])
            ),
        );

        for task in self.tasks_in_progress(ResponseCommand::WorkStatus, &handle, false)? {
            task.deliver(TaskEvent::Status(fields[1], fields[2]));
        }
        Ok(())
    }

    fn handle_work_warning(&mut self, body: &[u8]) -> Result<(), ConnectionError> {
        let fields = split_body(body, 2);
        let handle = JobHandle::new(fields[0]);
        self.log_event(ResponseCommand::WorkWarning, &handle, fields[1].len());

        for task in self.tasks_in_progress(ResponseCommand::WorkWarning, &handle, false)? {
            task.deliver(TaskEvent::Warning(fields[1]));
        }
        Ok(())
    }

    fn handle_work_data(&mut self, body: &[u8]) -> Result<(), ConnectionError> {
        let fields = split_body(body, 2);
        let handle = JobHandle::new(fields[0]);
        self.log_event(ResponseCommand::WorkData, &handle, fields[1].len());

        for task in self.tasks_in_progress(ResponseCommand::WorkData, &handle, false)? {
            task.deliver(TaskEvent::Data(fields[1]));
        }
        Ok(())
    }

    fn tasks_in_progress(
        &mut self,
        command: ResponseCommand,
        handle: &JobHandle,
        consume: bool,
    ) -> Result<Vec<TaskHandle>, ProtocolError> {
        // Also reached by servers that repeat a terminal event or report on a
        // background job; both end the connection.
        self.registry.lookup(command, handle, consume).inspect_err(|_| {
            self.logger.warn(
                Some(LOG_CONTEXT),
                &format!("got {command} for handle {handle} with no task registered"),
            );
        })
    }

    fn log_event(&self, command: ResponseCommand, handle: &JobHandle, data_len: usize) {
        self.logger.log(
            LogLevel::Debug,
            Some(LOG_CONTEXT),
            &format!("got {command} with handle {handle}"),
            Some(json!({ "data_bytes": data_len })),
        );
    }
}

impl<T: Transport + fmt::Debug> fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("transport", &self.transport)
            .field("state", &self.state)
            .field("buffered_bytes", &self.read_buffer.len())
            .field("pending_submissions", &self.sequencer.pending_len())
            .field("awaiting_handle", &self.sequencer.awaiting().is_some())
            .field("registered_handles", &self.registry.len())
            .field("finished", &self.finished.len())
            .finish()
    }
}
