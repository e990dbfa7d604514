/// Session module - lifecycle state machine, frame pacing and end-of-frame composition

pub mod session_state;
pub mod layer;
pub mod async_submission;
pub mod session;

pub use session_state::{SessionEvent, SessionInputs, SessionState, SessionStateMachine};
pub use layer::{validate_layers, CompositionLayer, DepthInfo, FrameEndInfo, ProjectionView, SubImage, MAX_LAYERS};
pub use async_submission::{AsyncSubmission, SubmissionJob, WorkerIdle};
pub use session::{FrameCounters, FrameState, Session, SessionCreateInfo, ViewConfiguration};
