use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, Ordering},
};
use dashmap::{DashMap, mapref::entry::Entry};
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    flow::{
        Task,
        dispatcher::NodeDispatcher,
        queue::ExecutionQueue,
        session::{Conversation, Session, SessionSnapshot, SessionWorker},
    },
    graph::{Graph, Trigger},
    message::{ContactId, ContactStatus, InboundEvent},
};

/// What the registry keeps per live session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: Uuid,
    pub queue: ExecutionQueue<Task>,
    pub snapshot: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    pub fn current(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }
}

struct RegistryInner {
    graph: Arc<Graph>,
    dispatcher: Arc<NodeDispatcher>,
    sessions: DashMap<ContactId, SessionHandle>,
    agent_id: Option<i64>,
    stopped: AtomicBool,
}

/// One session per contact, created when the Start trigger accepts an event.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(dispatcher: Arc<NodeDispatcher>) -> Self {
        Self::with_agent(dispatcher, None)
    }

    /// `agent_id` is the operator id the `NewAssignment` trigger waits for.
    pub fn with_agent(dispatcher: Arc<NodeDispatcher>, agent_id: Option<i64>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                graph: dispatcher.graph().clone(),
                dispatcher,
                sessions: DashMap::new(),
                agent_id,
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Routes an event to its contact's session, creating the session if the
    /// Start trigger accepts it. Returns `false` if the event was dropped.
    pub fn on_inbound_event(&self, event: InboundEvent) -> bool {
        if self.inner.stopped.load(Ordering::Acquire) {
            debug!(contact = %event.contact_id(), "registry stopped, event dropped");
            return false;
        }
        // a session that just finished may still sit in the map; retry once on a fresh slot
        for _ in 0..2 {
            match self.route(&event) {
                Routed::Queued => return true,
                Routed::Dropped => return false,
                Routed::Stale(id) => {
                    self.inner
                        .sessions
                        .remove_if(&event.contact_id(), |_, handle| handle.id == id);
                }
            }
        }
        false
    }

    fn route(&self, event: &InboundEvent) -> Routed {
        let contact = event.contact_id();
        let handle = match self.inner.sessions.entry(contact) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                if !self.accepts(event) {
                    debug!(contact = %contact, kind = event.kind(), "event dropped, no session");
                    return Routed::Dropped;
                }
                let handle = self.spawn_session(event);
                info!(contact = %contact, session = %handle.id, "session started");
                entry.insert(handle.clone());
                handle
            }
        };

        let queued = match event {
            InboundEvent::Continuation { .. } => handle.queue.push_front(Task::Continue),
            _ => handle.queue.push(Task::Inbound(event.clone())),
        };
        if queued {
            Routed::Queued
        } else {
            Routed::Stale(handle.id)
        }
    }

    fn accepts(&self, event: &InboundEvent) -> bool {
        match (self.inner.graph.trigger(), event) {
            (_, InboundEvent::Continuation { .. }) => false,
            (Trigger::NewConversation, InboundEvent::NewConversation(e)) => e.is_new,
            (Trigger::Webhook, _) => true,
            (Trigger::NewAssignment, InboundEvent::NewConversation(e)) => {
                e.via_flow
                    && e.assigned_to.is_some()
                    && e.assigned_to == self.inner.agent_id
                    && e.status == Some(ContactStatus::Open)
            }
            _ => false,
        }
    }

    fn spawn_session(&self, event: &InboundEvent) -> SessionHandle {
        let channel = match event {
            InboundEvent::NewConversation(e) => e.channel.clone(),
            InboundEvent::InboundMessage(m) => m.channel.clone(),
            InboundEvent::Continuation { .. } => Default::default(),
        };
        let contact = event.contact_id();
        let session = Session::new(
            &self.inner.graph,
            Conversation {
                contact_id: contact,
                channel,
            },
        );
        let id = session.id;

        let registry = Arc::downgrade(&self.inner);
        let (worker, snapshot) = SessionWorker::new(session, self.inner.dispatcher.clone());
        let worker = worker.on_terminal(move |unhandled| {
            remove_finished(&registry, contact, id);
            reroute(&registry, unhandled);
        });

        SessionHandle {
            id,
            queue: ExecutionQueue::spawn(worker),
            snapshot,
        }
    }

    /// Forgets a finished session, unless the contact already has a newer one.
    pub fn on_terminal(&self, contact: ContactId, session_id: Uuid) {
        remove_finished(&Arc::downgrade(&self.inner), contact, session_id);
    }

    pub fn get(&self, contact: ContactId) -> Option<SessionHandle> {
        self.inner.sessions.get(&contact).map(|h| h.clone())
    }

    pub fn contains(&self, contact: ContactId) -> bool {
        self.inner.sessions.contains_key(&contact)
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    pub fn contacts(&self) -> Vec<ContactId> {
        let mut contacts: Vec<_> = self.inner.sessions.iter().map(|e| *e.key()).collect();
        contacts.sort();
        contacts
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.inner.graph
    }

    /// Waits until every live session has worked off its queue.
    pub async fn settled(&self) {
        let handles: Vec<SessionHandle> = self.inner.sessions.iter().map(|e| e.value().clone()).collect();
        for handle in handles {
            handle.queue.settled().await;
        }
    }

    /// Closes every session queue and empties the registry. Later events are dropped.
    pub fn shutdown(&self) -> usize {
        self.inner.stopped.store(true, Ordering::Release);
        let handles: Vec<SessionHandle> = self.inner.sessions.iter().map(|e| e.value().clone()).collect();
        self.inner.sessions.clear();
        for handle in &handles {
            handle.queue.close();
        }
        info!(sessions = handles.len(), "registry shut down");
        handles.len()
    }
}

enum Routed {
    Queued,
    Dropped,
    Stale(Uuid),
}

fn remove_finished(registry: &Weak<RegistryInner>, contact: ContactId, session_id: Uuid) {
    let Some(inner) = registry.upgrade() else {
        return;
    };
    if inner
        .sessions
        .remove_if(&contact, |_, handle| handle.id == session_id)
        .is_some()
    {
        debug!(contact = %contact, session = %session_id, "session removed");
    }
}

// Events that reached a session after its flow ended get a fresh trigger check.
fn reroute(registry: &Weak<RegistryInner>, unhandled: Vec<InboundEvent>) {
    let Some(inner) = registry.upgrade() else {
        return;
    };
    let registry = SessionRegistry { inner };
    for event in unhandled {
        let contact = event.contact_id();
        let accepted = registry.on_inbound_event(event);
        debug!(contact = %contact, accepted, "rerouted event from finished session");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::MemoryGateway,
        message::{ChannelMeta, InboundMessage, NewConversation, OutboundCommand},
        service::{ServiceClient, ServiceError, ServiceRequest, ServiceResponse},
    };
    use crate::channel::{Ack, GatewayError, OutboundGateway};
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Notify;

    struct NoServices;

    #[async_trait]
    impl ServiceClient for NoServices {
        async fn call(&self, _request: ServiceRequest) -> Result<ServiceResponse, ServiceError> {
            Err(ServiceError::Transport("offline".into()))
        }
    }

    fn name_flow(trigger: &str) -> Arc<Graph> {
        let graph = Graph::from_value(json!({"nodes": [
            {"id": "s", "type": "Start", "trigger": trigger, "next": "q"},
            {"id": "q", "type": "CollectInput", "text": "Name?", "variable": "name",
             "validation": "String", "next": "bye"},
            {"id": "bye", "type": "Close"}
        ]}))
        .unwrap();
        Arc::new(graph)
    }

    fn registry(trigger: &str, agent_id: Option<i64>) -> (SessionRegistry, Arc<MemoryGateway>) {
        let gateway = Arc::new(MemoryGateway::new());
        let dispatcher = NodeDispatcher::new(name_flow(trigger), gateway.clone(), Arc::new(NoServices));
        (SessionRegistry::with_agent(Arc::new(dispatcher), agent_id), gateway)
    }

    /// Holds every `UpdateContact` until released.
    #[derive(Default)]
    struct HeldUpdates {
        inner: MemoryGateway,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl OutboundGateway for HeldUpdates {
        async fn send(&self, command: OutboundCommand) -> Result<Ack, GatewayError> {
            if matches!(command, OutboundCommand::UpdateContact { .. }) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.send(command).await
        }
    }

    fn new_conversation(contact: i64, is_new: bool) -> InboundEvent {
        InboundEvent::NewConversation(NewConversation {
            contact_id: ContactId(contact),
            is_new,
            ..Default::default()
        })
    }

    fn message(contact: i64, text: &str) -> InboundEvent {
        InboundEvent::InboundMessage(InboundMessage::text(contact, text))
    }

    async fn settle(registry: &SessionRegistry, contact: i64) {
        if let Some(handle) = registry.get(ContactId(contact)) {
            handle.queue.settled().await;
        }
    }

    #[tokio::test]
    async fn test_new_conversation_trigger() {
        let (registry, gateway) = registry("NewConversation", None);
        assert!(!registry.on_inbound_event(new_conversation(1, false)));
        assert!(!registry.on_inbound_event(message(1, "hi")));
        assert!(registry.is_empty());

        assert!(registry.on_inbound_event(new_conversation(1, true)));
        settle(&registry, 1).await;
        assert!(registry.contains(ContactId(1)));
        assert_eq!(gateway.len(), 1);
    }

    #[tokio::test]
    async fn test_repeated_new_conversation_keeps_session() {
        let (registry, gateway) = registry("NewConversation", None);
        registry.on_inbound_event(new_conversation(1, true));
        settle(&registry, 1).await;
        let first = registry.get(ContactId(1)).unwrap();

        assert!(registry.on_inbound_event(new_conversation(1, true)));
        settle(&registry, 1).await;
        let second = registry.get(ContactId(1)).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.current().current.as_deref(), Some("q"));
        assert!(second.current().awaiting_reply);
        // the prompt was not sent again
        assert_eq!(gateway.len(), 1);
    }

    #[tokio::test]
    async fn test_webhook_trigger_accepts_messages() {
        let (registry, _) = registry("Webhook", None);
        assert!(registry.on_inbound_event(message(5, "hello")));
        settle(&registry, 5).await;
        let snapshot = registry.get(ContactId(5)).unwrap().current();
        assert_eq!(snapshot.current.as_deref(), Some("q"));
        // the opening message is not taken as the answer
        assert!(snapshot.awaiting_reply);
    }

    #[tokio::test]
    async fn test_new_assignment_trigger() {
        let (registry, _) = registry("NewAssignment", Some(77));
        let assigned = |to: Option<i64>, via_flow: bool, status: ContactStatus| {
            InboundEvent::NewConversation(NewConversation {
                contact_id: ContactId(2),
                assigned_to: to,
                via_flow,
                status: Some(status),
                channel: ChannelMeta::default(),
                is_new: false,
            })
        };
        assert!(!registry.on_inbound_event(assigned(Some(77), false, ContactStatus::Open)));
        assert!(!registry.on_inbound_event(assigned(Some(8), true, ContactStatus::Open)));
        assert!(!registry.on_inbound_event(assigned(Some(77), true, ContactStatus::Closed)));
        assert!(registry.on_inbound_event(assigned(Some(77), true, ContactStatus::Open)));
    }

    #[tokio::test]
    async fn test_continuation_for_unknown_contact_is_dropped() {
        let (registry, _) = registry("Webhook", None);
        assert!(!registry.on_inbound_event(InboundEvent::Continuation {
            contact_id: ContactId(3)
        }));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_finished_session_is_removed_and_can_restart() {
        let (registry, gateway) = registry("Webhook", None);
        registry.on_inbound_event(message(4, "start"));
        settle(&registry, 4).await;
        let handle = registry.get(ContactId(4)).unwrap();

        registry.on_inbound_event(message(4, "Ann"));
        handle.queue.settled().await;
        assert!(handle.queue.is_closed());
        assert!(!registry.contains(ContactId(4)));
        assert_eq!(
            handle.current().variables.get("name"),
            Some(&crate::state::StateValue::String("Ann".into()))
        );
        assert!(matches!(
            gateway.sent().last(),
            Some(OutboundCommand::UpdateContact { .. })
        ));

        // a new message opens a fresh session
        assert!(registry.on_inbound_event(message(4, "again")));
        let again = registry.get(ContactId(4)).unwrap();
        assert_ne!(again.id, handle.id);
    }

    #[tokio::test]
    async fn test_message_during_close_opens_new_session() {
        let gateway = Arc::new(HeldUpdates::default());
        let dispatcher = NodeDispatcher::new(name_flow("Webhook"), gateway.clone(), Arc::new(NoServices));
        let registry = SessionRegistry::new(Arc::new(dispatcher));

        registry.on_inbound_event(message(4, "start"));
        settle(&registry, 4).await;
        let first = registry.get(ContactId(4)).unwrap();

        registry.on_inbound_event(message(4, "Ann"));
        gateway.entered.notified().await;
        // the Close node is waiting for its acknowledgment
        assert!(registry.on_inbound_event(message(4, "second")));
        gateway.release.notify_one();
        first.queue.settled().await;
        assert!(first.queue.is_closed());

        let second = registry.get(ContactId(4)).expect("event was rerouted");
        assert_ne!(second.id, first.id);
        second.queue.settled().await;
        let snapshot = second.current();
        assert_eq!(snapshot.current.as_deref(), Some("q"));
        assert!(snapshot.awaiting_reply);

        let prompts = gateway
            .inner
            .sent()
            .iter()
            .filter(|c| matches!(c, OutboundCommand::CreateMessage { .. }))
            .count();
        assert_eq!(prompts, 2);
    }

    #[tokio::test]
    async fn test_events_after_shutdown_are_dropped() {
        let (registry, _) = registry("Webhook", None);
        registry.shutdown();
        assert!(!registry.on_inbound_event(message(1, "late")));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_on_terminal_ignores_newer_session() {
        let (registry, _) = registry("Webhook", None);
        registry.on_inbound_event(message(6, "hi"));
        let handle = registry.get(ContactId(6)).unwrap();
        registry.on_terminal(ContactId(6), Uuid::new_v4());
        assert!(registry.contains(ContactId(6)));
        registry.on_terminal(ContactId(6), handle.id);
        assert!(!registry.contains(ContactId(6)));
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let (registry, _) = registry("Webhook", None);
        registry.on_inbound_event(message(1, "a"));
        registry.on_inbound_event(message(2, "b"));
        assert_eq!(registry.contacts(), vec![ContactId(1), ContactId(2)]);
        let handle = registry.get(ContactId(1)).unwrap();

        assert_eq!(registry.shutdown(), 2);
        assert!(registry.is_empty());
        assert!(handle.queue.is_closed());
    }
}
