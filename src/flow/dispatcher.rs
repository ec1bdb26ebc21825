use std::sync::Arc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{Span, debug, info, instrument, warn};

use crate::{
    channel::{GatewayError, OutboundGateway},
    condition,
    flow::{Task, queue::ExecutionQueue, session::Session},
    graph::{Graph, Node, NodeId, NodeKind, ValidationKind},
    message::{
        Assignee, ButtonOption, ButtonType, ChannelMeta, ContactStatus, InboundEvent,
        InboundMessage, OutboundCommand,
    },
    service::{ServiceClient, ServiceRequest},
    state::StateValue,
};

/// How a node that finished its step asks for the next one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ContinuationMode {
    /// Schedule `Task::Continue` at the head of the session queue.
    #[default]
    InProcess,
    /// Send `OutboundCommand::Continuation`; the transport echoes it back as an inbound event.
    RoundTrip,
}

/// Where a session stands after one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A continuation was signalled.
    Continue,
    /// Waiting for the contact or for a retry.
    Suspend,
    /// The flow ended; the session can go.
    Finished,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("session points to unknown node `{0}`")]
    MissingNode(NodeId),
}

/// Executes one step of a session against the graph.
pub struct NodeDispatcher {
    graph: Arc<Graph>,
    gateway: Arc<dyn OutboundGateway>,
    services: Arc<dyn ServiceClient>,
    continuation: ContinuationMode,
}

impl NodeDispatcher {
    pub fn new(
        graph: Arc<Graph>,
        gateway: Arc<dyn OutboundGateway>,
        services: Arc<dyn ServiceClient>,
    ) -> Self {
        Self {
            graph,
            gateway,
            services,
            continuation: ContinuationMode::default(),
        }
    }

    pub fn with_continuation(mut self, mode: ContinuationMode) -> Self {
        self.continuation = mode;
        self
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    pub fn continuation(&self) -> ContinuationMode {
        self.continuation
    }

    /// Runs the session's current node for `task`.
    ///
    /// The node pointer moves before the node's effect is sent, so a failing
    /// gateway leaves the session on the next node.
    #[instrument(
        name = "dispatch",
        skip_all,
        fields(contact = %session.contact_id(), session = %session.id, node = tracing::field::Empty)
    )]
    pub async fn dispatch(
        &self,
        session: &mut Session,
        task: Task,
        queue: &ExecutionQueue<Task>,
    ) -> Result<Outcome, DispatchError> {
        let reply = match task {
            Task::Inbound(InboundEvent::InboundMessage(msg)) => {
                if msg.channel != ChannelMeta::default() {
                    session.conversation.channel = msg.channel.clone();
                }
                session.last_message = Some(msg.clone());
                Some(msg)
            }
            Task::Inbound(InboundEvent::NewConversation(_))
            | Task::Inbound(InboundEvent::Continuation { .. })
            | Task::Continue => None,
        };

        let Some(node_id) = session.current.clone() else {
            return Ok(Outcome::Finished);
        };
        let Some(node) = self.graph.node(&node_id) else {
            session.current = None;
            return Err(DispatchError::MissingNode(node_id));
        };
        Span::current().record("node", node_id.as_str());
        debug!(kind = node.kind.name(), "dispatching");

        match &node.kind {
            NodeKind::Start { next, .. } => {
                self.advance(session, next.as_deref());
                self.proceed(session, queue).await
            }

            NodeKind::SendMessage {
                text,
                attachments,
                next,
            } => {
                self.advance(session, next.as_deref());
                self.send(OutboundCommand::CreateMessage {
                    contact_id: session.contact_id(),
                    channel: session.conversation.channel.clone(),
                    text: Some(text.clone()),
                    attachments: attachments.clone(),
                    buttons: Vec::new(),
                })
                .await?;
                self.proceed(session, queue).await
            }

            NodeKind::CollectInput {
                text,
                variable,
                validation,
                next,
                ..
            } => {
                if !session.awaiting_reply {
                    // an undelivered prompt is sent again on the next event
                    self.prompt(session, text, Vec::new()).await?;
                    session.awaiting_reply = true;
                    return Ok(Outcome::Suspend);
                }
                let Some(msg) = reply else {
                    return Ok(Outcome::Suspend);
                };
                let Some(value) = self.validate(node, *validation, &msg) else {
                    debug!(validation = ?validation, "reply rejected, still waiting");
                    return Ok(Outcome::Suspend);
                };
                session.set(variable.clone(), value);
                session.awaiting_reply = false;
                self.advance(session, next.as_deref());
                self.proceed(session, queue).await
            }

            NodeKind::Buttons { text, options } => {
                if !session.awaiting_reply {
                    self.prompt(session, text, options.clone()).await?;
                    session.awaiting_reply = true;
                    return Ok(Outcome::Suspend);
                }
                let Some(answer) = reply.as_ref().and_then(InboundMessage::reply) else {
                    return Ok(Outcome::Suspend);
                };
                let Some(option) = options
                    .iter()
                    .find(|o| o.kind == ButtonType::QuickReply && o.label == answer)
                else {
                    debug!(answer, "no button matches, still waiting");
                    return Ok(Outcome::Suspend);
                };
                session.awaiting_reply = false;
                self.advance(session, option.target.as_deref());
                self.proceed(session, queue).await
            }

            NodeKind::Branch { items, default } => {
                let target = condition::select(items, default.as_ref(), &session.variables);
                self.advance(session, target.map(String::as_str));
                self.proceed(session, queue).await
            }

            NodeKind::ServiceCall {
                method,
                url,
                headers,
                body,
                capture,
                next,
                error,
            } => {
                if session.stalled && reply.is_none() {
                    return Ok(Outcome::Suspend);
                }
                session.stalled = false;

                let request = ServiceRequest {
                    method: method.clone(),
                    url: url.clone(),
                    headers: headers.clone(),
                    body: body.clone(),
                };
                match self.services.call(request).await {
                    Ok(response) => {
                        if let Some(variable) = capture {
                            session.set(variable.clone(), response.capture());
                        }
                        self.advance(session, next.as_deref());
                    }
                    Err(err) => match error {
                        Some(edge) => {
                            warn!(error = %err, "service call failed, taking error edge");
                            self.advance(session, Some(edge.as_str()));
                        }
                        None => {
                            warn!(error = %err, "service call failed, session stalled");
                            session.stalled = true;
                        }
                    },
                }
                self.proceed(session, queue).await
            }

            NodeKind::Reassign { assignee, next } => {
                self.advance(session, next.as_deref());
                self.send(OutboundCommand::UpdateContact {
                    contact_id: session.contact_id(),
                    assignee: Some(Assignee::from(*assignee)),
                    tags: Vec::new(),
                    status: Some(ContactStatus::Open),
                })
                .await?;
                self.proceed(session, queue).await
            }

            NodeKind::AssignTag { tag_id, next } => {
                self.advance(session, next.as_deref());
                self.send(OutboundCommand::AssignTag {
                    contact_id: session.contact_id(),
                    tag_id: *tag_id,
                })
                .await?;
                self.proceed(session, queue).await
            }

            NodeKind::Close { next } => {
                self.advance(session, next.as_deref());
                self.send(OutboundCommand::UpdateContact {
                    contact_id: session.contact_id(),
                    assignee: Some(Assignee::Nobody),
                    tags: Vec::new(),
                    status: Some(ContactStatus::Closed),
                })
                .await?;
                self.proceed(session, queue).await
            }
        }
    }

    // Absent or unknown targets end the flow.
    fn advance(&self, session: &mut Session, target: Option<&str>) {
        session.current = self.graph.resolve(target).map(|n| n.id.clone());
        if session.current.is_none() {
            info!(edge = target.unwrap_or_default(), "reached the end of the flow");
        }
    }

    // Asks for the next step, unless the flow is over.
    async fn proceed(
        &self,
        session: &Session,
        queue: &ExecutionQueue<Task>,
    ) -> Result<Outcome, DispatchError> {
        if session.is_finished() {
            return Ok(Outcome::Finished);
        }
        match self.continuation {
            ContinuationMode::InProcess => {
                queue.push_front(Task::Continue);
            }
            ContinuationMode::RoundTrip => {
                self.send(OutboundCommand::Continuation {
                    contact_id: session.contact_id(),
                })
                .await?;
            }
        }
        Ok(Outcome::Continue)
    }

    async fn prompt(
        &self,
        session: &Session,
        text: &str,
        buttons: Vec<ButtonOption>,
    ) -> Result<(), DispatchError> {
        self.send(OutboundCommand::CreateMessage {
            contact_id: session.contact_id(),
            channel: session.conversation.channel.clone(),
            text: Some(text.to_string()),
            attachments: Vec::new(),
            buttons,
        })
        .await
    }

    async fn send(&self, command: OutboundCommand) -> Result<(), DispatchError> {
        let kind = command.kind();
        self.gateway.send(command).await?;
        debug!(kind, "command acknowledged");
        Ok(())
    }

    // The channel only carries text, so Number and Boolean never pass.
    fn validate(&self, node: &Node, kind: ValidationKind, msg: &InboundMessage) -> Option<StateValue> {
        let value = StateValue::String(msg.text.clone()?);
        let valid = match kind {
            ValidationKind::String => value.as_str().is_some(),
            ValidationKind::Number => value.as_number().is_some(),
            ValidationKind::Boolean => value.as_bool().is_some(),
            ValidationKind::Email | ValidationKind::Phone => true,
            ValidationKind::Regex => match (self.graph.pattern(&node.id), value.as_str()) {
                (Some(pattern), Some(text)) => pattern.is_match(text),
                _ => false,
            },
        };
        valid.then_some(value)
    }
}
