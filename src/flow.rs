// src/flow.rs

pub mod dispatcher;
pub mod queue;
pub mod registry;
pub mod session;

pub use dispatcher::{ContinuationMode, DispatchError, NodeDispatcher, Outcome};
pub use queue::{Drain, ExecutionQueue, TaskHandler};
pub use registry::{SessionHandle, SessionRegistry};
pub use session::{Conversation, Session, SessionSnapshot};

use crate::message::InboundEvent;

/// One unit of work on a session queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Task {
    /// An event delivered by the transport.
    Inbound(InboundEvent),
    /// Step the current node again; scheduled at the head of the queue.
    Continue,
}
