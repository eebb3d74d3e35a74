use std::sync::Arc;

use crate::{
    dispatcher::Dispatcher, gate::NotificationGate, subscriptions::SubscriptionManager,
};

#[derive(Clone)]
pub struct AppState {
    pub subscriptions: Arc<SubscriptionManager>,
    pub gate: Arc<NotificationGate>,
    pub dispatcher: Arc<Dispatcher>,
}
