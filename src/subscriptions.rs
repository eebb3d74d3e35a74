use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::info;

use crate::{
    config::Config,
    error::GraphError,
    graph::GraphApi,
    models::{ChangeType, NewSubscription, Subscription},
};

pub fn chat_messages_resource(chat_id: &str) -> String {
    format!("/chats/{chat_id}/messages")
}

#[derive(Clone)]
pub struct SubscriptionSettings {
    pub notification_url: String,
    pub lifecycle_url: String,
    pub lifetime: chrono::Duration,
    pub client_state: String,
    pub encryption_certificate: String,
    pub encryption_certificate_id: String,
}

impl SubscriptionSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            notification_url: cfg.notification_url(),
            lifecycle_url: cfg.lifecycle_url(),
            lifetime: cfg.notification_lifetime(),
            client_state: cfg.client_state.clone(),
            encryption_certificate: cfg.encryption_certificate.clone(),
            encryption_certificate_id: cfg.encryption_certificate_id.clone(),
        }
    }
}

// Keeps at most one subscription per resource path alive on the Graph side.
pub struct SubscriptionManager {
    api: Arc<dyn GraphApi>,
    settings: SubscriptionSettings,
    // Serializes list-then-create per resource path within this process.
    creating: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SubscriptionManager {
    pub fn new(api: Arc<dyn GraphApi>, settings: SubscriptionSettings) -> Self {
        Self {
            api,
            settings,
            creating: Mutex::new(HashMap::new()),
        }
    }

    pub async fn create(
        &self,
        resource: &str,
        change_type: ChangeType,
    ) -> Result<Subscription, GraphError> {
        let key = normalize(resource).to_string();
        let lock = {
            let mut creating = self.creating.lock().await;
            creating.entry(key.clone()).or_default().clone()
        };

        let result = {
            let _guard = lock.lock().await;
            self.create_locked(resource, change_type).await
        };

        let mut creating = self.creating.lock().await;
        // Map entry plus our clone: nobody else is waiting on this path.
        if Arc::strong_count(&lock) == 2 {
            creating.remove(&key);
        }
        result
    }

    async fn create_locked(
        &self,
        resource: &str,
        change_type: ChangeType,
    ) -> Result<Subscription, GraphError> {
        if let Some(existing) = self.find(resource).await? {
            info!(subscription_id = %existing.id, resource, "subscription already exists");
            return Ok(existing);
        }

        let request = NewSubscription {
            change_type: change_type.as_str().to_string(),
            notification_url: self.settings.notification_url.clone(),
            lifecycle_notification_url: self.settings.lifecycle_url.clone(),
            resource: resource.to_string(),
            expiration_date_time: Utc::now() + self.settings.lifetime,
            client_state: self.settings.client_state.clone(),
            include_resource_data: true,
            encryption_certificate: self.settings.encryption_certificate.clone(),
            encryption_certificate_id: self.settings.encryption_certificate_id.clone(),
        };
        let created = self.api.create_subscription(&request).await?;
        info!(
            subscription_id = %created.id,
            resource,
            expires = %created.expiration_date_time,
            "created subscription"
        );
        Ok(created)
    }

    pub async fn delete(&self, resource: &str) -> Result<bool, GraphError> {
        let Some(existing) = self.find(resource).await? else {
            info!(resource, "no subscription to delete");
            return Ok(false);
        };
        self.api.delete_subscription(&existing.id).await?;
        info!(subscription_id = %existing.id, resource, "deleted subscription");
        Ok(true)
    }

    pub async fn find(&self, resource: &str) -> Result<Option<Subscription>, GraphError> {
        let wanted = normalize(resource);
        let found = self
            .api
            .list_subscriptions()
            .await?
            .into_iter()
            .find(|sub| normalize(&sub.resource) == wanted);
        Ok(found)
    }

    pub async fn renew(&self, id: &str) -> Result<Option<Subscription>, GraphError> {
        let Some(existing) = self.api.get_subscription(id).await? else {
            info!(subscription_id = id, "subscription to renew no longer exists");
            return Ok(None);
        };

        let expiration = Utc::now() + self.settings.lifetime;
        let renewed = self
            .api
            .update_subscription_expiration(&existing.id, expiration)
            .await?;
        info!(
            subscription_id = %renewed.id,
            previous = %existing.expiration_date_time,
            expires = %renewed.expiration_date_time,
            "renewed subscription"
        );
        Ok(Some(renewed))
    }
}

// Graph echoes resources back without the leading slash.
fn normalize(resource: &str) -> &str {
    resource.trim_start_matches('/')
}

#[cfg(test)]
pub(crate) fn test_settings() -> SubscriptionSettings {
    SubscriptionSettings::from_config(&crate::config::test_config())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::fake::FakeGraph;

    fn manager() -> (Arc<FakeGraph>, SubscriptionManager) {
        let fake = Arc::new(FakeGraph::default());
        let manager = SubscriptionManager::new(fake.clone(), test_settings());
        (fake, manager)
    }

    #[tokio::test]
    async fn create_sends_subscription_settings() {
        let (fake, manager) = manager();
        let before = Utc::now();
        let created = manager
            .create(&chat_messages_resource("19:abc"), ChangeType::Created)
            .await
            .unwrap();

        assert_eq!(created.resource, "/chats/19:abc/messages");
        assert_eq!(created.change_type, "created");
        assert_eq!(created.client_state.as_deref(), Some("shared-client-state"));
        assert_eq!(created.encryption_certificate_id.as_deref(), Some("cert-1"));
        assert_eq!(
            created.notification_url.as_deref(),
            Some("https://hooks.example.com/notifications")
        );
        assert_eq!(
            created.lifecycle_notification_url.as_deref(),
            Some("https://hooks.example.com/notifications/lifecycle")
        );
        let lifetime = created.expiration_date_time - before;
        assert!(lifetime >= chrono::Duration::seconds(1800));
        assert!(lifetime < chrono::Duration::seconds(1810));
        assert_eq!(FakeGraph::count(&fake.create_calls), 1);
    }

    #[tokio::test]
    async fn create_is_idempotent_per_resource() {
        let (fake, manager) = manager();
        let resource = chat_messages_resource("19:abc");
        let first = manager.create(&resource, ChangeType::Created).await.unwrap();
        let second = manager.create(&resource, ChangeType::Created).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(FakeGraph::count(&fake.create_calls), 1);
    }

    #[tokio::test]
    async fn concurrent_creates_issue_one_remote_create() {
        let (fake, manager) = manager();
        let resource = chat_messages_resource("19:abc");
        let (a, b, c) = tokio::join!(
            manager.create(&resource, ChangeType::Created),
            manager.create(&resource, ChangeType::Created),
            manager.create(&resource, ChangeType::Created),
        );

        let ids = [a.unwrap().id, b.unwrap().id, c.unwrap().id];
        assert!(ids.iter().all(|id| id == &ids[0]));
        assert_eq!(FakeGraph::count(&fake.create_calls), 1);
        assert!(manager.creating.lock().await.is_empty());
    }

    #[tokio::test]
    async fn matches_resource_without_leading_slash() {
        let (fake, manager) = manager();
        fake.insert(Subscription {
            id: "existing".to_string(),
            resource: "chats/19:abc/messages".to_string(),
            change_type: "created".to_string(),
            notification_url: None,
            lifecycle_notification_url: None,
            expiration_date_time: Utc::now(),
            client_state: None,
            encryption_certificate: None,
            encryption_certificate_id: None,
        });

        let found = manager.find("/chats/19:abc/messages").await.unwrap();
        assert_eq!(found.unwrap().id, "existing");
    }

    #[tokio::test]
    async fn delete_without_subscription_is_negative() {
        let (fake, manager) = manager();
        assert!(!manager.delete(&chat_messages_resource("none")).await.unwrap());
        assert_eq!(FakeGraph::count(&fake.delete_calls), 0);
    }

    #[tokio::test]
    async fn delete_removes_subscription() {
        let (fake, manager) = manager();
        let resource = chat_messages_resource("19:abc");
        manager.create(&resource, ChangeType::Created).await.unwrap();

        assert!(manager.delete(&resource).await.unwrap());
        assert_eq!(FakeGraph::count(&fake.delete_calls), 1);
        assert!(manager.find(&resource).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn renew_extends_expiration() {
        let (fake, manager) = manager();
        let previous = Utc::now() + chrono::Duration::seconds(30);
        fake.insert(Subscription {
            id: "sub-near-expiry".to_string(),
            resource: chat_messages_resource("19:abc"),
            change_type: "created".to_string(),
            notification_url: None,
            lifecycle_notification_url: None,
            expiration_date_time: previous,
            client_state: None,
            encryption_certificate: None,
            encryption_certificate_id: None,
        });

        let renewed = manager.renew("sub-near-expiry").await.unwrap().unwrap();
        let extension = renewed.expiration_date_time - previous;
        assert!(renewed.expiration_date_time > previous);
        assert!(extension > chrono::Duration::seconds(1760));
        assert!(extension <= chrono::Duration::seconds(1800));
        assert_eq!(FakeGraph::count(&fake.update_calls), 1);
    }

    #[tokio::test]
    async fn renew_missing_subscription_is_absent() {
        let (fake, manager) = manager();
        assert!(manager.renew("gone").await.unwrap().is_none());
        assert_eq!(FakeGraph::count(&fake.update_calls), 0);
    }

    #[tokio::test]
    async fn remote_failure_surfaces_as_error() {
        let (fake, manager) = manager();
        fake.unavailable
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let err = manager
            .create(&chat_messages_resource("19:abc"), ChangeType::Created)
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::Timeout));
    }
}
