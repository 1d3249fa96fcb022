//! Client for the Gearman job-queue protocol.
//!
//! [`engine::Connection`] owns the protocol state for one job server stream:
//! it frames packets with [`protocol::PacketCodec`], releases one submission
//! at a time so `job_created` replies can be matched by position, and routes
//! later events to every [`task::Task`] registered under the job handle.
//! The caller owns the socket and feeds the connection bytes and open/close
//! notifications; [`transport::TcpTransport`] is a ready-made adapter.

pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod shutdown;
pub mod task;
pub mod transport;

pub use engine::{Connection, ConnectionError, ConnectionState};
pub use error::GearmanError;
pub use task::{Priority, Task, TaskHandle, TaskState, UniqueKey};
