/*
┌──────────────────────────────────────────────┐
│                 transport                    │
│   inbound events ─┐        ┌─▶ commands      │
└───────────────────┼────────┼─────────────────┘
                    │        │
   stdio::pump_events        │ OutboundGateway::send
                    ▼        │
┌─────────────────────────────┴────────────────┐
│           SessionRegistry                     │
│  contact → ExecutionQueue<Task> → Dispatcher  │
└──────────────────────────────────────────────┘
*/
pub mod memory;
pub mod stdio;

pub use memory::MemoryGateway;
pub use stdio::{LineGateway, pump_events};

use async_trait::async_trait;
use thiserror::Error;

use crate::message::OutboundCommand;

/// Acknowledgment of a delivered command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ack;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway is closed")]
    Closed,
    #[error("command rejected: {0}")]
    Rejected(String),
    #[error("gateway I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not encode command: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Where the interpreter sends its effects. `send` resolves once the platform acknowledged.
#[async_trait]
pub trait OutboundGateway: Send + Sync {
    async fn send(&self, command: OutboundCommand) -> Result<Ack, GatewayError>;
}
