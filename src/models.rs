use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CHAT_MESSAGE_TYPE: &str = "#Microsoft.Graph.chatMessage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Created,
    Updated,
    Deleted,
}

impl ChangeType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeType::Created => "created",
            ChangeType::Updated => "updated",
            ChangeType::Deleted => "deleted",
        }
    }

    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "created" => Some(ChangeType::Created),
            "updated" => Some(ChangeType::Updated),
            "deleted" => Some(ChangeType::Deleted),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: String,
    pub resource: String,
    #[serde(default)]
    pub change_type: String,
    #[serde(default)]
    pub notification_url: Option<String>,
    #[serde(default)]
    pub lifecycle_notification_url: Option<String>,
    pub expiration_date_time: DateTime<Utc>,
    #[serde(default)]
    pub client_state: Option<String>,
    #[serde(default)]
    pub encryption_certificate: Option<String>,
    #[serde(default)]
    pub encryption_certificate_id: Option<String>,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct NewSubscription {
    pub change_type: String,
    pub notification_url: String,
    pub lifecycle_notification_url: String,
    pub resource: String,
    pub expiration_date_time: DateTime<Utc>,
    pub client_state: String,
    pub include_resource_data: bool,
    pub encryption_certificate: String,
    pub encryption_certificate_id: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedContent {
    pub data: String,
    pub data_signature: String,
    pub data_key: String,
    #[serde(default)]
    pub encryption_certificate_id: Option<String>,
    #[serde(default)]
    pub encryption_certificate_thumbprint: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ResourceData {
    #[serde(rename = "@odata.type", default)]
    pub odata_type: Option<String>,
    #[serde(rename = "@odata.id", default)]
    pub odata_id: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub subscription_id: String,
    #[serde(default)]
    pub client_state: Option<String>,
    #[serde(default)]
    pub change_type: String,
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub resource_data: Option<ResourceData>,
    #[serde(default)]
    pub encrypted_content: Option<EncryptedContent>,
    #[serde(default)]
    pub tenant_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum LifecycleEvent {
    ReauthorizationRequired,
    SubscriptionRemoved,
    Missed,
    Other(String),
}

impl From<String> for LifecycleEvent {
    fn from(value: String) -> Self {
        match value.as_str() {
            "reauthorizationRequired" => LifecycleEvent::ReauthorizationRequired,
            "subscriptionRemoved" => LifecycleEvent::SubscriptionRemoved,
            "missed" => LifecycleEvent::Missed,
            _ => LifecycleEvent::Other(value),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleNotification {
    pub subscription_id: String,
    #[serde(default)]
    pub client_state: Option<String>,
    pub lifecycle_event: LifecycleEvent,
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub subscription_expiration_date_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct NotificationBatch {
    #[serde(default)]
    pub validation_tokens: Option<Vec<String>>,
    // Parsed item by item in the dispatcher.
    #[serde(default)]
    pub value: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize, Default)]
pub struct LifecycleBatch {
    #[serde(default)]
    pub value: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
pub struct HandshakeQuery {
    #[serde(rename = "validationToken")]
    pub validation_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ResourceQuery {
    pub resource_id: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    #[serde(default)]
    pub from: Option<ChatMessageFrom>,
    #[serde(default)]
    pub body: Option<ItemBody>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatMessageFrom {
    #[serde(default)]
    pub user: Option<Identity>,
    #[serde(default)]
    pub application: Option<Identity>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ItemBody {
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

impl ChatMessage {
    pub fn sender(&self) -> Option<&str> {
        let from = self.from.as_ref()?;
        from.user
            .as_ref()
            .or(from.application.as_ref())
            .and_then(|identity| identity.display_name.as_deref())
    }

    pub fn sender_id(&self) -> Option<&str> {
        let from = self.from.as_ref()?;
        from.user
            .as_ref()
            .or(from.application.as_ref())
            .and_then(|identity| identity.id.as_deref())
    }

    pub fn content(&self) -> Option<&str> {
        self.body.as_ref().and_then(|body| body.content.as_deref())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.body
            .as_ref()
            .and_then(|body| body.content_type.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_batch_parses_graph_payload() {
        let raw = r##"{
            "validationTokens": ["a.b.c"],
            "value": [{
                "subscriptionId": "sub-1",
                "clientState": "state",
                "changeType": "created",
                "resource": "chats('19:abc')/messages('1')",
                "resourceData": {"@odata.type": "#Microsoft.Graph.chatMessage", "id": "1"},
                "encryptedContent": {
                    "data": "ZGF0YQ==",
                    "dataSignature": "c2ln",
                    "dataKey": "a2V5",
                    "encryptionCertificateId": "cert-1"
                },
                "tenantId": "t"
            }]
        }"##;
        let batch: NotificationBatch = serde_json::from_str(raw).unwrap();
        assert_eq!(batch.validation_tokens.unwrap(), vec!["a.b.c".to_string()]);
        let value = batch.value.unwrap();
        assert_eq!(value.len(), 1);
        let notification: Notification = serde_json::from_value(value[0].clone()).unwrap();
        let data = notification.resource_data.as_ref().unwrap();
        assert_eq!(data.odata_type.as_deref(), Some(CHAT_MESSAGE_TYPE));
        assert!(notification.encrypted_content.is_some());
    }

    #[test]
    fn lifecycle_event_keeps_unknown_tags() {
        let raw = r#"{"value": [
            {"subscriptionId": "s1", "clientState": "x", "lifecycleEvent": "reauthorizationRequired"},
            {"subscriptionId": "s2", "clientState": "x", "lifecycleEvent": "somethingNew"}
        ]}"#;
        let batch: LifecycleBatch = serde_json::from_str(raw).unwrap();
        let value: Vec<LifecycleNotification> = batch
            .value
            .unwrap()
            .into_iter()
            .map(|item| serde_json::from_value(item).unwrap())
            .collect();
        assert_eq!(value[0].lifecycle_event, LifecycleEvent::ReauthorizationRequired);
        assert_eq!(
            value[1].lifecycle_event,
            LifecycleEvent::Other("somethingNew".to_string())
        );
    }

    #[test]
    fn subscription_accepts_graph_timestamp_precision() {
        let raw = r#"{
            "id": "sub-1",
            "resource": "/chats/1/messages",
            "changeType": "created,updated",
            "expirationDateTime": "2026-10-18T10:30:00.1234567Z"
        }"#;
        let sub: Subscription = serde_json::from_str(raw).unwrap();
        assert_eq!(sub.change_type, "created,updated");
    }

    #[test]
    fn chat_message_prefers_user_sender() {
        let raw = r#"{
            "id": "m1",
            "from": {"user": {"id": "u1", "displayName": "Ada"}},
            "body": {"contentType": "text", "content": "hello"}
        }"#;
        let message: ChatMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(message.sender(), Some("Ada"));
        assert_eq!(message.sender_id(), Some("u1"));
        assert_eq!(message.content(), Some("hello"));
        assert_eq!(message.content_type(), Some("text"));
    }
}
