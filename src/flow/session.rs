use std::sync::Arc;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    flow::{
        Task,
        dispatcher::{NodeDispatcher, Outcome},
        queue::{Drain, ExecutionQueue, TaskHandler},
    },
    graph::{Graph, NodeId},
    message::{ChannelMeta, ContactId, InboundEvent, InboundMessage},
    state::{StateValue, Variables},
};

/// Who the session is talking to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub contact_id: ContactId,
    #[serde(default)]
    pub channel: ChannelMeta,
}

/// State of one contact walking the graph. Only its queue's worker ever touches it.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub conversation: Conversation,
    /// `None` once the flow has ended.
    pub current: Option<NodeId>,
    pub variables: Variables,
    pub awaiting_reply: bool,
    /// A service call failed without an error edge; retried on the next message.
    pub stalled: bool,
    pub last_message: Option<InboundMessage>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// A fresh session positioned on the graph's Start node.
    pub fn new(graph: &Graph, conversation: Conversation) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            conversation,
            current: Some(graph.start_id().to_string()),
            variables: graph.initial_variables(),
            awaiting_reply: false,
            stalled: false,
            last_message: None,
            started_at: now,
            updated_at: now,
        }
    }

    pub fn contact_id(&self) -> ContactId {
        self.conversation.contact_id
    }

    pub fn is_finished(&self) -> bool {
        self.current.is_none()
    }

    pub fn get(&self, name: &str) -> Option<&StateValue> {
        self.variables.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: StateValue) {
        self.variables.insert(name.into(), value);
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            contact_id: self.contact_id(),
            current: self.current.clone(),
            variables: self.variables.clone(),
            awaiting_reply: self.awaiting_reply,
            stalled: self.stalled,
            finished: self.is_finished(),
            started_at: self.started_at,
            updated_at: self.updated_at,
        }
    }
}

/// Read-only view of a session, published after every task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub contact_id: ContactId,
    pub current: Option<NodeId>,
    pub variables: Variables,
    pub awaiting_reply: bool,
    pub stalled: bool,
    pub finished: bool,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Drains a session's queue: each task is one dispatcher step.
pub struct SessionWorker {
    session: Session,
    dispatcher: Arc<NodeDispatcher>,
    snapshot: watch::Sender<SessionSnapshot>,
    on_terminal: Option<Box<dyn FnOnce(Vec<InboundEvent>) + Send>>,
}

impl SessionWorker {
    pub fn new(session: Session, dispatcher: Arc<NodeDispatcher>) -> (Self, watch::Receiver<SessionSnapshot>) {
        let (snapshot, rx) = watch::channel(session.snapshot());
        (
            Self {
                session,
                dispatcher,
                snapshot,
                on_terminal: None,
            },
            rx,
        )
    }

    /// Called once when the session's queue has closed, with the inbound events
    /// that were accepted but arrived after the flow ended.
    pub fn on_terminal(mut self, f: impl FnOnce(Vec<InboundEvent>) + Send + 'static) -> Self {
        self.on_terminal = Some(Box::new(f));
        self
    }

    fn publish(&mut self) {
        self.session.touch();
        self.snapshot.send_replace(self.session.snapshot());
    }
}

#[async_trait]
impl TaskHandler<Task> for SessionWorker {
    async fn handle(&mut self, task: Task, queue: &ExecutionQueue<Task>) -> anyhow::Result<Drain> {
        let result = self.dispatcher.dispatch(&mut self.session, task, queue).await;
        self.publish();

        match result {
            Ok(Outcome::Finished) => Ok(Drain::Close),
            Ok(Outcome::Continue | Outcome::Suspend) => Ok(Drain::Continue),
            Err(err) if self.session.is_finished() => {
                warn!(contact = %self.session.contact_id(), error = %err, "flow ended with an error");
                Ok(Drain::Close)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn finished(&mut self, leftovers: Vec<Task>) {
        let unhandled: Vec<InboundEvent> = leftovers
            .into_iter()
            .filter_map(|task| match task {
                Task::Inbound(event) => Some(event),
                Task::Continue => None,
            })
            .collect();
        info!(
            contact = %self.session.contact_id(),
            session = %self.session.id,
            unhandled = unhandled.len(),
            "session finished"
        );
        self.publish();
        if let Some(f) = self.on_terminal.take() {
            f(unhandled);
        }
    }
}
