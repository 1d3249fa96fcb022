use std::thread;
use std::time::Duration;

use crate::config::WireConfig;
use crate::engine::connection::Connection;
use crate::error::GearmanError;
use crate::task::TaskHandle;
use crate::transport::{ReadOutcome, TcpTransport};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionEnd {
    Stopped,
    PeerClosed,
}

#[derive(Debug)]
pub struct SessionReport {
    pub end: SessionEnd,
    pub finished: Vec<TaskHandle>,
    pub abandoned: Vec<TaskHandle>,
}

/// Polls the socket into `connection` until `should_stop` returns true or the
/// job server hangs up.
///
/// Every exit path shuts the socket down and closes the connection, so tasks
/// still in flight are abandoned and their connection-lost callbacks fire
/// before a read, write or protocol error is returned.
pub fn run_session(
    connection: &mut Connection<TcpTransport>,
    wire: &WireConfig,
    mut should_stop: impl FnMut() -> bool,
) -> Result<SessionReport, GearmanError> {
    let outcome = poll_until(connection, wire, &mut should_stop);
    let _ = connection.transport().shutdown();
    let abandoned = connection.on_close();
    let finished = connection.take_finished();

    outcome.map(|end| SessionReport {
        end,
        finished,
        abandoned,
    })
}

fn poll_until(
    connection: &mut Connection<TcpTransport>,
    wire: &WireConfig,
    should_stop: &mut impl FnMut() -> bool,
) -> Result<SessionEnd, GearmanError> {
    let poll_interval = Duration::from_millis(wire.poll_interval_ms);
    let mut read_buffer = vec![0_u8; wire.read_chunk_bytes.max(1)];

    loop {
        if should_stop() {
            return Ok(SessionEnd::Stopped);
        }

        match connection.transport_mut().try_read(&mut read_buffer)? {
            ReadOutcome::Data(size) => connection.on_bytes(&read_buffer[..size])?,
            ReadOutcome::WouldBlock => {
                connection.transport_mut().flush_pending()?;
                thread::sleep(poll_interval);
            }
            ReadOutcome::Closed => return Ok(SessionEnd::PeerClosed),
        }
    }
}
