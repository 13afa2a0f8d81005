//! Notifications and pipeline handoff
//!
//! Both are fire and forget: the executor publishes and moves on. The bus
//! implementations put the messages on the `notify` and `pipeline` topics
//! where the relay and the processing pipeline pick them up.

use crate::bus::{MessageBus, Topic};
use crate::store::Observation;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

/// Sends messages to observers and operators
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn email(&self, to: &str, subject: &str, message: &str);

    /// Operator chat channel
    async fn slack(&self, message: &str);
}

/// Hands completed observations to post-processing
#[async_trait]
pub trait PipelineTrigger: Send + Sync {
    async fn process(&self, location: &str);
}

pub struct BusNotifier {
    bus: Arc<MessageBus>,
}

impl BusNotifier {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl Notifier for BusNotifier {
    async fn email(&self, to: &str, subject: &str, message: &str) {
        self.bus.publish(
            Topic::Notify,
            json!({
                "action": "email",
                "to": to,
                "subject": subject,
                "message": message,
            }),
        );
    }

    async fn slack(&self, message: &str) {
        self.bus.publish(
            Topic::Notify,
            json!({
                "action": "slack",
                "message": message,
            }),
        );
    }
}

pub struct BusPipeline {
    bus: Arc<MessageBus>,
}

impl BusPipeline {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl PipelineTrigger for BusPipeline {
    async fn process(&self, location: &str) {
        info!("Requesting processing of {}", location);
        self.bus.publish(
            Topic::Pipeline,
            json!({
                "type": "process",
                "location": location,
            }),
        );
    }
}

/// Completed targets grouped by owner email, in order of first completion
pub fn group_by_owner(completed: &[Observation]) -> Vec<(String, Vec<String>)> {
    let mut groups: Vec<(String, Vec<String>)> = Vec::new();
    for observation in completed {
        let email = &observation.owner.email;
        if email.is_empty() {
            continue;
        }
        match groups.iter_mut().find(|(e, _)| e == email) {
            Some((_, targets)) => targets.push(observation.target.clone()),
            None => groups.push((email.clone(), vec![observation.target.clone()])),
        }
    }
    groups
}

/// Email body listing a user's completed targets
pub fn completion_message(site: &str, targets: &[String]) -> String {
    format!(
        "{} completed the following observations tonight: {}. \
         Your data will be available once it has been processed.",
        site,
        targets.join(", ")
    )
}
