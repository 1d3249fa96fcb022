pub mod connection;
pub mod registry;
pub mod sequencer;
pub mod session;

pub use connection::{Connection, ConnectionError, ConnectionState};
pub use registry::HandleRegistry;
pub use sequencer::{Submission, SubmissionSequencer};
pub use session::{run_session, SessionEnd, SessionReport};
