use std::fmt;
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};

use crate::graph::NodeId;

/// Identifier of a contact on the messaging platform. One session per contact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct ContactId(pub i64);

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ContactId {
    fn from(value: i64) -> Self {
        ContactId(value)
    }
}

/// Where a conversation lives on the platform. Echoed back on every created message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ContactStatus {
    Open,
    Closed,
}

/// Who handles a contact after an update. Serialized as the operator id, or `null`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum Assignee {
    Operator(i64),
    Nobody,
}

// A present `assignedTo: null` means "unassign", only an absent key means "leave as is".
fn present_assignee<'de, D>(deserializer: D) -> Result<Option<Assignee>, D::Error>
where
    D: Deserializer<'de>,
{
    Assignee::deserialize(deserializer).map(Some)
}

impl From<Option<i64>> for Assignee {
    fn from(value: Option<i64>) -> Self {
        match value {
            Some(id) => Assignee::Operator(id),
            None => Assignee::Nobody,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum AttachmentType {
    Audio,
    Document,
    Image,
    Video,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: AttachmentType,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ButtonType {
    #[default]
    QuickReply,
    Url,
    Phone,
}

/// One option of a `Buttons` node. Only quick replies can route the flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ButtonOption {
    #[serde(rename = "type", default)]
    pub kind: ButtonType,
    #[serde(rename = "text")]
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(rename = "next", default, skip_serializing_if = "Option::is_none")]
    pub target: Option<NodeId>,
}

/// Fired by the platform when a conversation is opened or handed to the agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NewConversation {
    pub contact_id: ContactId,
    #[serde(default)]
    pub is_new: bool,
    #[serde(default)]
    pub channel: ChannelMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ContactStatus>,
    /// The conversation was routed to the agent by another flow.
    #[serde(default)]
    pub via_flow: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub contact_id: ContactId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub button_replies: Vec<String>,
    #[serde(default)]
    pub channel: ChannelMeta,
}

impl InboundMessage {
    pub fn text(contact_id: impl Into<ContactId>, text: impl Into<String>) -> Self {
        Self {
            contact_id: contact_id.into(),
            text: Some(text.into()),
            ..Default::default()
        }
    }

    /// The reply a `Buttons` node matches against: a pressed button wins over typed text.
    pub fn reply(&self) -> Option<&str> {
        self.button_replies
            .first()
            .map(String::as_str)
            .or(self.text.as_deref())
    }
}

/// Everything the transport can deliver to the interpreter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type")]
pub enum InboundEvent {
    NewConversation(NewConversation),
    InboundMessage(InboundMessage),
    #[serde(rename_all = "camelCase")]
    Continuation { contact_id: ContactId },
}

impl InboundEvent {
    pub fn contact_id(&self) -> ContactId {
        match self {
            InboundEvent::NewConversation(e) => e.contact_id,
            InboundEvent::InboundMessage(m) => m.contact_id,
            InboundEvent::Continuation { contact_id } => *contact_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InboundEvent::NewConversation(_) => "NewConversation",
            InboundEvent::InboundMessage(_) => "InboundMessage",
            InboundEvent::Continuation { .. } => "Continuation",
        }
    }
}

/// Commands sent to the platform through the outbound gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum OutboundCommand {
    CreateMessage {
        contact_id: ContactId,
        #[serde(default)]
        channel: ChannelMeta,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<Attachment>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        buttons: Vec<ButtonOption>,
    },
    UpdateContact {
        contact_id: ContactId,
        #[serde(
            rename = "assignedTo",
            default,
            skip_serializing_if = "Option::is_none",
            deserialize_with = "present_assignee"
        )]
        assignee: Option<Assignee>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tags: Vec<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<ContactStatus>,
    },
    AssignTag {
        contact_id: ContactId,
        tag_id: i64,
    },
    Continuation {
        contact_id: ContactId,
    },
}

impl OutboundCommand {
    pub fn contact_id(&self) -> ContactId {
        match self {
            OutboundCommand::CreateMessage { contact_id, .. }
            | OutboundCommand::UpdateContact { contact_id, .. }
            | OutboundCommand::AssignTag { contact_id, .. }
            | OutboundCommand::Continuation { contact_id } => *contact_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OutboundCommand::CreateMessage { .. } => "CreateMessage",
            OutboundCommand::UpdateContact { .. } => "UpdateContact",
            OutboundCommand::AssignTag { .. } => "AssignTag",
            OutboundCommand::Continuation { .. } => "Continuation",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_inbound_event_from_wire() {
        let event: InboundEvent = serde_json::from_value(json!({
            "type": "NewConversation",
            "contactId": 7,
            "isNew": true,
            "channel": {"channelId": "wa-1"}
        }))
        .unwrap();

        match &event {
            InboundEvent::NewConversation(e) => {
                assert!(e.is_new);
                assert_eq!(e.channel.channel_id.as_deref(), Some("wa-1"));
                assert!(!e.via_flow);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(event.contact_id(), ContactId(7));

        let cont: InboundEvent =
            serde_json::from_value(json!({"type": "Continuation", "contactId": 3})).unwrap();
        assert_eq!(cont, InboundEvent::Continuation { contact_id: ContactId(3) });
    }

    #[test]
    fn test_close_update_serializes_null_assignee() {
        let cmd = OutboundCommand::UpdateContact {
            contact_id: ContactId(1),
            assignee: Some(Assignee::Nobody),
            tags: vec![],
            status: Some(ContactStatus::Closed),
        };
        assert_eq!(
            serde_json::to_value(&cmd).unwrap(),
            json!({"type": "UpdateContact", "contactId": 1, "assignedTo": null, "status": "Closed"})
        );
    }

    #[test]
    fn test_update_contact_keeps_null_assignee_apart_from_absent() {
        let unassign: OutboundCommand = serde_json::from_value(
            json!({"type": "UpdateContact", "contactId": 1, "assignedTo": null, "status": "Closed"}),
        )
        .unwrap();
        assert!(matches!(
            unassign,
            OutboundCommand::UpdateContact { assignee: Some(Assignee::Nobody), .. }
        ));

        let untouched: OutboundCommand =
            serde_json::from_value(json!({"type": "UpdateContact", "contactId": 1, "tags": [4]}))
                .unwrap();
        assert!(matches!(
            untouched,
            OutboundCommand::UpdateContact { assignee: None, .. }
        ));

        let reassign: OutboundCommand =
            serde_json::from_value(json!({"type": "UpdateContact", "contactId": 1, "assignedTo": 9}))
                .unwrap();
        assert!(matches!(
            reassign,
            OutboundCommand::UpdateContact { assignee: Some(Assignee::Operator(9)), .. }
        ));
    }

    #[test]
    fn test_reply_prefers_button() {
        let mut msg = InboundMessage::text(1, "typed");
        assert_eq!(msg.reply(), Some("typed"));
        msg.button_replies.push("Yes".into());
        assert_eq!(msg.reply(), Some("Yes"));
    }
}
