use std::collections::VecDeque;

use crate::protocol::codec::encode_request;
use crate::protocol::{JobHandle, ProtocolError};
use crate::task::TaskHandle;

/// `job_created` carries no echo of the request it answers, so correlation is
/// positional: at most one submission is outstanding per connection and the
/// next one is released only after the previous handle arrives.
#[derive(Debug, Default)]
pub struct SubmissionSequencer {
    pending: VecDeque<TaskHandle>,
    awaiting_handle: Option<TaskHandle>,
}

#[derive(Debug)]
pub struct Submission {
    pub task: TaskHandle,
    pub packet: Vec<u8>,
}

impl SubmissionSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, task: TaskHandle) {
        self.pending.push_back(task);
    }

    /// Moves the FIFO head into the awaiting slot and returns its submit
    /// packet. `None` while the slot is occupied or nothing is pending. A task
    /// whose packet cannot be framed stays at the head of the FIFO.
    pub fn next_submission(&mut self) -> Result<Option<Submission>, ProtocolError> {
        if self.awaiting_handle.is_some() {
            return Ok(None);
        }

        let Some(task) = self.pending.pop_front() else {
            return Ok(None);
        };
        let (command, body) = task.begin_submission();
        let packet = match encode_request(command, &body) {
            Ok(packet) => packet,
            Err(error) => {
                self.pending.push_front(task);
                return Err(error);
            }
        };
        self.awaiting_handle = Some(task.clone());
        Ok(Some(Submission { task, packet }))
    }

    pub fn resolve_job_created(&mut self, handle: &JobHandle) -> Result<TaskHandle, ProtocolError> {
        self.awaiting_handle
            .take()
            .ok_or_else(|| ProtocolError::UnexpectedJobCreated {
                handle: handle.clone(),
            })
    }

    pub fn awaiting(&self) -> Option<&TaskHandle> {
        self.awaiting_handle.as_ref()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_idle(&self) -> bool {
        self.awaiting_handle.is_none() && self.pending.is_empty()
    }

    /// Awaiting task first, then the FIFO in order.
    pub fn drain_all(&mut self) -> Vec<TaskHandle> {
        self.awaiting_handle
            .take()
            .into_iter()
            .chain(self.pending.drain(..))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::SubmissionSequencer;
    use crate::protocol::{JobHandle, ProtocolError};
    use crate::task::{Priority, Task, TaskHandle, TaskState};

    #[test]
    fn releases_one_submission_per_job_created() {
        let mut sequencer = SubmissionSequencer::new();
        let tasks: Vec<TaskHandle> = (0..3)
            .map(|index| TaskHandle::new(Task::new("f", format!("{index}"))))
            .collect();
        for task in &tasks {
            sequencer.enqueue(task.clone());
        }

        let first = sequencer
            .next_submission()
            .expect("encodes")
            .expect("first submission");
        assert!(first.task.ptr_eq(&tasks[0]));
        assert_eq!(tasks[0].state(), TaskState::AwaitingHandle);
        assert!(sequencer.next_submission().expect("encodes").is_none());
        assert_eq!(sequencer.pending_len(), 2);

        let resolved = sequencer
            .resolve_job_created(&JobHandle::from("H:1"))
            .expect("awaiting task");
        assert!(resolved.ptr_eq(&tasks[0]));

        let second = sequencer
            .next_submission()
            .expect("encodes")
            .expect("second submission");
        assert!(second.task.ptr_eq(&tasks[1]));
        assert!(sequencer.next_submission().expect("encodes").is_none());
    }

    #[test]
    fn submit_packet_uses_task_command_and_body() {
        let mut sequencer = SubmissionSequencer::new();
        sequencer.enqueue(TaskHandle::new(
            Task::new("reverse", "hello").with_priority(Priority::Low),
        ));

        let submission = sequencer
            .next_submission()
            .expect("encodes")
            .expect("submission");
        assert_eq!(&submission.packet[0..4], b"\0REQ");
        assert_eq!(&submission.packet[4..8], &33_u32.to_be_bytes());
        assert_eq!(&submission.packet[12..], b"reverse\0\0hello");
    }

    #[test]
    fn job_created_without_submission_is_rejected() {
        let mut sequencer = SubmissionSequencer::new();

        let error = sequencer
            .resolve_job_created(&JobHandle::from("H:1"))
            .expect_err("nothing is awaiting a handle");
        assert!(matches!(error, ProtocolError::UnexpectedJobCreated { .. }));
    }

    #[test]
    fn drain_all_returns_awaiting_then_pending() {
        let mut sequencer = SubmissionSequencer::new();
        let first = TaskHandle::new(Task::new("a", ""));
        let second = TaskHandle::new(Task::new("b", ""));
        sequencer.enqueue(first.clone());
        sequencer.enqueue(second.clone());
        sequencer.next_submission().expect("encodes");

        let drained = sequencer.drain_all();
        assert_eq!(drained.len(), 2);
        assert!(drained[0].ptr_eq(&first));
        assert!(drained[1].ptr_eq(&second));
        assert!(sequencer.is_idle());
    }
}
