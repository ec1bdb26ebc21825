use async_trait::async_trait;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};
use tracing::{debug, warn};

use crate::{
    channel::{Ack, GatewayError, OutboundGateway},
    flow::SessionRegistry,
    message::{InboundEvent, OutboundCommand},
};

/// Writes every command as one line of JSON.
pub struct LineGateway<W> {
    writer: Mutex<W>,
}

impl<W> LineGateway<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait]
impl<W> OutboundGateway for LineGateway<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&self, command: OutboundCommand) -> Result<Ack, GatewayError> {
        let mut line = serde_json::to_vec(&command)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;
        debug!(contact = %command.contact_id(), kind = command.kind(), "command written");
        Ok(Ack)
    }
}

/// Feeds newline-delimited JSON events into the registry until the reader hits EOF.
///
/// Blank lines are ignored and malformed ones are logged and skipped.
/// Returns the number of events a session accepted.
pub async fn pump_events<R>(registry: &SessionRegistry, reader: R) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut accepted = 0;
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<InboundEvent>(line) {
            Ok(event) => {
                if registry.on_inbound_event(event) {
                    accepted += 1;
                }
            }
            Err(err) => warn!(error = %err, "skipping malformed event"),
        }
    }
    Ok(accepted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ContactId;

    #[tokio::test]
    async fn test_line_gateway_writes_ndjson() {
        let gateway = LineGateway::new(Vec::new());
        gateway
            .send(OutboundCommand::Continuation { contact_id: ContactId(4) })
            .await
            .unwrap();
        gateway
            .send(OutboundCommand::AssignTag {
                contact_id: ContactId(4),
                tag_id: 2,
            })
            .await
            .unwrap();

        let out = String::from_utf8(gateway.into_inner()).unwrap();
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], r#"{"type":"Continuation","contactId":4}"#);
        assert_eq!(lines[1], r#"{"type":"AssignTag","contactId":4,"tagId":2}"#);
    }
}
