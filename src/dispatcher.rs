use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::{
    envelope::EnvelopeDecoder,
    error::EnvelopeError,
    gate::NotificationGate,
    graph::GraphApi,
    models::{
        ChangeType, ChatMessage, LifecycleEvent, LifecycleNotification, Notification,
        CHAT_MESSAGE_TYPE,
    },
    subscriptions::SubscriptionManager,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered,
    Rejected,
    Dropped,
    Renewed,
    Recreated,
    Ignored,
    Failed,
}

#[derive(Debug, Clone)]
pub enum ChangeContent {
    None,
    ChatMessage(ChatMessage),
    Resource(Value),
}

#[derive(Debug, Clone)]
pub struct ResourceChange {
    pub subscription_id: String,
    pub change_type: String,
    pub resource: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub content: ChangeContent,
}

pub trait ChangeSink: Send + Sync {
    fn resource_changed(&self, change: &ResourceChange);
}

// Logs identifiers only; message bodies stay out of the logs.
pub struct TracingSink;

impl ChangeSink for TracingSink {
    fn resource_changed(&self, change: &ResourceChange) {
        let resource = change.resource.as_deref().unwrap_or("");
        match &change.content {
            ChangeContent::ChatMessage(message) => info!(
                subscription_id = %change.subscription_id,
                resource,
                message_id = %message.id,
                sender = message.sender().unwrap_or("unknown"),
                sender_id = message.sender_id().unwrap_or("unknown"),
                content_type = message.content_type().unwrap_or("unknown"),
                content_len = message.content().map(str::len).unwrap_or(0),
                "chat message received"
            ),
            ChangeContent::Resource(value) => info!(
                subscription_id = %change.subscription_id,
                change_type = %change.change_type,
                resource,
                resource_type = change.resource_type.as_deref().unwrap_or("unknown"),
                resource_id = change.resource_id.as_deref().unwrap_or("unknown"),
                fields = value.as_object().map(|object| object.len()).unwrap_or(0),
                "resource changed"
            ),
            ChangeContent::None => info!(
                subscription_id = %change.subscription_id,
                change_type = %change.change_type,
                resource,
                resource_type = change.resource_type.as_deref().unwrap_or("unknown"),
                resource_id = change.resource_id.as_deref().unwrap_or("unknown"),
                "resource changed"
            ),
        }
    }
}

pub struct Dispatcher {
    gate: Arc<NotificationGate>,
    decoder: Arc<EnvelopeDecoder>,
    subscriptions: Arc<SubscriptionManager>,
    api: Arc<dyn GraphApi>,
    sink: Arc<dyn ChangeSink>,
    recreate_on_removed: bool,
}

impl Dispatcher {
    pub fn new(
        gate: Arc<NotificationGate>,
        decoder: Arc<EnvelopeDecoder>,
        subscriptions: Arc<SubscriptionManager>,
        api: Arc<dyn GraphApi>,
        sink: Arc<dyn ChangeSink>,
        recreate_on_removed: bool,
    ) -> Self {
        Self {
            gate,
            decoder,
            subscriptions,
            api,
            sink,
            recreate_on_removed,
        }
    }

    pub async fn handle(&self, items: &[Value]) -> Vec<DispatchOutcome> {
        join_all(items.iter().enumerate().map(|(index, item)| async move {
            match serde_json::from_value::<Notification>(item.clone()) {
                Ok(notification) => self.handle_one(&notification).await,
                Err(err) => {
                    warn!(index, error = %err, "malformed notification; dropping");
                    DispatchOutcome::Dropped
                }
            }
        }))
        .await
    }

    pub async fn handle_lifecycle(&self, items: &[Value]) -> Vec<DispatchOutcome> {
        join_all(items.iter().enumerate().map(|(index, item)| async move {
            match serde_json::from_value::<LifecycleNotification>(item.clone()) {
                Ok(notification) => self.handle_lifecycle_one(&notification).await,
                Err(err) => {
                    warn!(index, error = %err, "malformed lifecycle notification; dropping");
                    DispatchOutcome::Dropped
                }
            }
        }))
        .await
    }

    async fn handle_one(&self, notification: &Notification) -> DispatchOutcome {
        let subscription_id = notification.subscription_id.as_str();
        if !self
            .gate
            .client_state_matches(notification.client_state.as_deref())
        {
            warn!(subscription_id, "invalid client state; dropping notification");
            return DispatchOutcome::Rejected;
        }

        let data = notification.resource_data.clone().unwrap_or_default();
        let is_chat_message = data.odata_type.as_deref() == Some(CHAT_MESSAGE_TYPE);
        if is_chat_message {
            info!(
                subscription_id,
                change_type = %notification.change_type,
                message_id = data.id.as_deref().unwrap_or("unknown"),
                "chat message notification"
            );
        } else {
            info!(
                subscription_id,
                change_type = %notification.change_type,
                resource = notification.resource.as_deref().unwrap_or(""),
                "graph notification"
            );
        }

        let content = match &notification.encrypted_content {
            Some(encrypted) => match self.decoder.decode(encrypted) {
                Ok(plaintext) => match parse_content(&plaintext, is_chat_message) {
                    Some(content) => content,
                    None => {
                        warn!(subscription_id, "decrypted payload is not valid JSON; dropping");
                        return DispatchOutcome::Dropped;
                    }
                },
                Err(EnvelopeError::Integrity) => {
                    warn!(subscription_id, "data signature mismatch; dropping notification");
                    return DispatchOutcome::Dropped;
                }
                Err(err) => {
                    warn!(subscription_id, error = %err, "cannot decrypt notification; dropping");
                    return DispatchOutcome::Dropped;
                }
            },
            None if is_chat_message => self.fetch_message(notification).await,
            None => ChangeContent::None,
        };

        self.sink.resource_changed(&ResourceChange {
            subscription_id: notification.subscription_id.clone(),
            change_type: notification.change_type.clone(),
            resource: notification.resource.clone(),
            resource_type: data.odata_type,
            resource_id: data.id,
            content,
        });
        DispatchOutcome::Delivered
    }

    async fn fetch_message(&self, notification: &Notification) -> ChangeContent {
        if ChangeType::from_wire(&notification.change_type) == Some(ChangeType::Deleted) {
            return ChangeContent::None;
        }
        let Some(resource) = notification.resource.as_deref() else {
            return ChangeContent::None;
        };

        match self.api.get_resource(resource).await {
            Ok(value) => match serde_json::from_value::<ChatMessage>(value) {
                Ok(message) => ChangeContent::ChatMessage(message),
                Err(err) => {
                    warn!(resource, error = %err, "unexpected chat message shape");
                    ChangeContent::None
                }
            },
            Err(err) => {
                warn!(resource, error = %err, "failed to fetch changed resource");
                ChangeContent::None
            }
        }
    }

    async fn handle_lifecycle_one(&self, notification: &LifecycleNotification) -> DispatchOutcome {
        let subscription_id = notification.subscription_id.as_str();
        if !self
            .gate
            .client_state_matches(notification.client_state.as_deref())
        {
            warn!(subscription_id, "invalid client state; dropping lifecycle notification");
            return DispatchOutcome::Rejected;
        }

        match &notification.lifecycle_event {
            LifecycleEvent::ReauthorizationRequired => {
                info!(
                    subscription_id,
                    expires = ?notification.subscription_expiration_date_time,
                    "reauthorization required"
                );
                match self.subscriptions.renew(subscription_id).await {
                    Ok(Some(_)) => DispatchOutcome::Renewed,
                    Ok(None) => DispatchOutcome::Ignored,
                    Err(err) => {
                        error!(subscription_id, error = %err, "failed to renew subscription");
                        DispatchOutcome::Failed
                    }
                }
            }
            LifecycleEvent::SubscriptionRemoved => self.subscription_removed(notification).await,
            LifecycleEvent::Missed => {
                warn!(subscription_id, "graph reports missed notifications");
                DispatchOutcome::Ignored
            }
            LifecycleEvent::Other(event) => {
                info!(subscription_id, event = %event, "unhandled lifecycle event");
                DispatchOutcome::Ignored
            }
        }
    }

    async fn subscription_removed(&self, notification: &LifecycleNotification) -> DispatchOutcome {
        let subscription_id = notification.subscription_id.as_str();
        let resource = match (self.recreate_on_removed, notification.resource.as_deref()) {
            (true, Some(resource)) => resource,
            _ => {
                warn!(subscription_id, "subscription removed by graph; not recreating");
                return DispatchOutcome::Ignored;
            }
        };

        match self.subscriptions.create(resource, ChangeType::Created).await {
            Ok(created) => {
                info!(
                    subscription_id,
                    new_subscription_id = %created.id,
                    "recreated removed subscription"
                );
                DispatchOutcome::Recreated
            }
            Err(err) => {
                error!(subscription_id, error = %err, "failed to recreate subscription");
                DispatchOutcome::Failed
            }
        }
    }
}

fn parse_content(plaintext: &str, is_chat_message: bool) -> Option<ChangeContent> {
    if is_chat_message {
        serde_json::from_str::<ChatMessage>(plaintext)
            .ok()
            .map(ChangeContent::ChatMessage)
    } else {
        serde_json::from_str::<Value>(plaintext)
            .ok()
            .map(ChangeContent::Resource)
    }
}
