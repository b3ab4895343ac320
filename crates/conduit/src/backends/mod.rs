pub mod base;
pub mod limits;
pub mod mock;
pub mod protocol;
pub mod streaming;
pub mod subprocess;

pub use base::{Backend, BackendRun, RunOutcome, ToolDecision};
pub use limits::TurnCounter;
pub use streaming::{StreamingBackend, StreamingConfig};
pub use subprocess::{SubprocessBackend, SubprocessConfig};
