use std::sync::{Mutex, MutexGuard, PoisonError};
use async_trait::async_trait;
use tokio::sync::Notify;

use crate::{
    channel::{Ack, GatewayError, OutboundGateway},
    message::{ContactId, OutboundCommand},
};

/// Keeps every command in memory. Used by tests and by embedders that poll for output.
#[derive(Debug, Default)]
pub struct MemoryGateway {
    sent: Mutex<Vec<OutboundCommand>>,
    // commands left to reject before accepting again
    failures: Mutex<usize>,
    closed: Mutex<bool>,
    changed: Notify,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn sent_lock(&self) -> MutexGuard<'_, Vec<OutboundCommand>> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Rejects the next `count` commands.
    pub fn fail_next(&self, count: usize) {
        *self.failures.lock().unwrap_or_else(PoisonError::into_inner) = count;
    }

    pub fn close(&self) {
        *self.closed.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }

    pub fn sent(&self) -> Vec<OutboundCommand> {
        self.sent_lock().clone()
    }

    pub fn sent_to(&self, contact: ContactId) -> Vec<OutboundCommand> {
        self.sent_lock()
            .iter()
            .filter(|c| c.contact_id() == contact)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sent_lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn take(&self) -> Vec<OutboundCommand> {
        std::mem::take(&mut *self.sent_lock())
    }

    /// Waits until at least `count` commands have been recorded.
    pub async fn wait_for(&self, count: usize) {
        loop {
            let changed = self.changed.notified();
            if self.len() >= count {
                return;
            }
            changed.await;
        }
    }
}

#[async_trait]
impl OutboundGateway for MemoryGateway {
    async fn send(&self, command: OutboundCommand) -> Result<Ack, GatewayError> {
        if *self.closed.lock().unwrap_or_else(PoisonError::into_inner) {
            return Err(GatewayError::Closed);
        }
        {
            let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
            if *failures > 0 {
                *failures -= 1;
                return Err(GatewayError::Rejected(format!("{} refused", command.kind())));
            }
        }
        self.sent_lock().push(command);
        self.changed.notify_waiters();
        Ok(Ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn continuation(id: i64) -> OutboundCommand {
        OutboundCommand::Continuation {
            contact_id: ContactId(id),
        }
    }

    #[tokio::test]
    async fn test_records_commands() {
        let gateway = MemoryGateway::new();
        gateway.send(continuation(1)).await.unwrap();
        gateway.send(continuation(2)).await.unwrap();
        assert_eq!(gateway.len(), 2);
        assert_eq!(gateway.sent_to(ContactId(2)), vec![continuation(2)]);
        assert_eq!(gateway.take().len(), 2);
        assert!(gateway.is_empty());
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let gateway = MemoryGateway::new();
        gateway.fail_next(1);
        assert!(matches!(
            gateway.send(continuation(1)).await,
            Err(GatewayError::Rejected(_))
        ));
        assert!(gateway.send(continuation(1)).await.is_ok());

        gateway.close();
        assert!(matches!(gateway.send(continuation(1)).await, Err(GatewayError::Closed)));
        assert_eq!(gateway.len(), 1);
    }
}
