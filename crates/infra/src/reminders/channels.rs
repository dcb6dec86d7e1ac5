//! Channel senders and the channel -> sender dispatch table.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value as JsonValue, json};
use tracing::info;
use uuid::Uuid;

use taskpulse_reminders::{Channel, InAppNotification, ReminderRule, TaskSnapshot, UserSnapshot};

use super::store::ReminderStore;

/// Everything a sender needs for one delivery.
#[derive(Debug, Clone, Copy)]
pub struct Delivery<'a> {
    pub rule: &'a ReminderRule,
    pub task: &'a TaskSnapshot,
    pub user: &'a UserSnapshot,
}

impl Delivery<'_> {
    pub fn subject(&self) -> String {
        format!("Reminder: {}", self.task.title)
    }

    pub fn body(&self) -> String {
        match self.task.due_date {
            Some(due) => format!(
                "Hi {}, \"{}\" is due at {}.",
                self.user.name,
                self.task.title,
                due.format("%Y-%m-%d %H:%M UTC")
            ),
            None => format!("Hi {}, \"{}\" needs your attention.", self.user.name, self.task.title),
        }
    }
}

/// Sender metadata merged into the delivery log on success.
#[derive(Debug, Clone, PartialEq)]
pub struct SendReceipt {
    pub metadata: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("recipient rejected: {0}")]
    Rejected(String),
    #[error("storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait ChannelSender: Send + Sync {
    async fn send(&self, delivery: &Delivery<'_>) -> Result<SendReceipt, SendError>;
}

/// Channel -> sender. Channels without a sender are unsupported.
#[derive(Clone, Default)]
pub struct ChannelDispatcher {
    senders: HashMap<Channel, Arc<dyn ChannelSender>>,
}

impl std::fmt::Debug for ChannelDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelDispatcher")
            .field("channels", &self.channels())
            .finish()
    }
}

impl ChannelDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, channel: Channel, sender: Arc<dyn ChannelSender>) -> Self {
        self.register(channel, sender);
        self
    }

    pub fn register(&mut self, channel: Channel, sender: Arc<dyn ChannelSender>) {
        self.senders.insert(channel, sender);
    }

    pub fn sender(&self, channel: Channel) -> Option<&Arc<dyn ChannelSender>> {
        self.senders.get(&channel)
    }

    pub fn channels(&self) -> Vec<Channel> {
        let mut channels: Vec<_> = self.senders.keys().copied().collect();
        channels.sort_by_key(|c| c.as_str());
        channels
    }
}

/// An outgoing email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub text: String,
}

/// Hands a message to a mail system and returns its message id.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn deliver(&self, message: &MailMessage) -> Result<String, SendError>;
}

/// Writes mail to the log instead of sending it.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMailTransport;

#[async_trait]
impl MailTransport for LogMailTransport {
    async fn deliver(&self, message: &MailMessage) -> Result<String, SendError> {
        let message_id = format!("<{}@taskpulse.local>", Uuid::now_v7());
        info!(to = %message.to, subject = %message.subject, message_id = %message_id, "mail delivered to log");
        Ok(message_id)
    }
}

pub struct EmailSender {
    transport: Arc<dyn MailTransport>,
    from: String,
}

impl EmailSender {
    pub fn new(transport: Arc<dyn MailTransport>, from: impl Into<String>) -> Self {
        Self {
            transport,
            from: from.into(),
        }
    }

    pub fn compose(&self, delivery: &Delivery<'_>) -> MailMessage {
        MailMessage {
            from: self.from.clone(),
            to: delivery.user.email.clone(),
            subject: delivery.subject(),
            text: delivery.body(),
        }
    }
}

#[async_trait]
impl ChannelSender for EmailSender {
    async fn send(&self, delivery: &Delivery<'_>) -> Result<SendReceipt, SendError> {
        if delivery.user.email.trim().is_empty() {
            return Err(SendError::Rejected(format!("user {} has no email address", delivery.user.id)));
        }
        let message = self.compose(delivery);
        let message_id = self.transport.deliver(&message).await?;
        Ok(SendReceipt {
            metadata: json!({ "message_id": message_id, "to": message.to }),
        })
    }
}

/// Writes the reminder to the user's in-app inbox.
pub struct InAppSender {
    store: Arc<dyn ReminderStore>,
}

impl InAppSender {
    pub fn new(store: Arc<dyn ReminderStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ChannelSender for InAppSender {
    async fn send(&self, delivery: &Delivery<'_>) -> Result<SendReceipt, SendError> {
        let notification = InAppNotification::new(delivery.rule, delivery.subject(), delivery.body(), Utc::now());
        self.store
            .insert_in_app(&notification)
            .await
            .map_err(|e| SendError::Storage(e.to_string()))?;
        Ok(SendReceipt {
            metadata: json!({ "notification_id": notification.id }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reminders::store::InMemoryReminderStore;
    use std::sync::Mutex;
    use taskpulse_core::{TaskId, UserId};
    use taskpulse_reminders::{NewRule, OffsetUnit, ReminderDefaults};

    #[derive(Default)]
    struct CapturingTransport {
        sent: Mutex<Vec<MailMessage>>,
    }

    #[async_trait]
    impl MailTransport for CapturingTransport {
        async fn deliver(&self, message: &MailMessage) -> Result<String, SendError> {
            self.sent.lock().unwrap().push(message.clone());
            Ok("m-1".into())
        }
    }

    fn fixture() -> (ReminderRule, TaskSnapshot, UserSnapshot) {
        let user = UserSnapshot {
            id: UserId::new(),
            email: "grace@example.com".into(),
            name: "Grace".into(),
            reminder_defaults: ReminderDefaults::default(),
        };
        let task = TaskSnapshot {
            id: TaskId::new(),
            user_id: user.id,
            title: "Ship release".into(),
            due_date: Some(Utc::now()),
        };
        let rule = ReminderRule::create(
            NewRule {
                user_id: user.id,
                task_id: task.id,
                channel: Channel::Email,
                offset: 1,
                unit: OffsetUnit::Hours,
                enabled: true,
            },
            Utc::now(),
        )
        .unwrap();
        (rule, task, user)
    }

    #[tokio::test]
    async fn email_goes_to_the_user_address() {
        let (rule, task, user) = fixture();
        let transport = Arc::new(CapturingTransport::default());
        let sender = EmailSender::new(transport.clone(), "noreply@example.com");
        let delivery = Delivery {
            rule: &rule,
            task: &task,
            user: &user,
        };

        let receipt = sender.send(&delivery).await.unwrap();
        assert_eq!(receipt.metadata["message_id"], "m-1");

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent[0].to, "grace@example.com");
        assert_eq!(sent[0].subject, "Reminder: Ship release");
    }

    #[tokio::test]
    async fn in_app_writes_the_inbox() {
        let (rule, task, user) = fixture();
        let store = InMemoryReminderStore::arc();
        let sender = InAppSender::new(store.clone());
        let delivery = Delivery {
            rule: &rule,
            task: &task,
            user: &user,
        };

        sender.send(&delivery).await.unwrap();
        let inbox = store.in_app_for_user(user.id).await.unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].task_id, task.id);
    }

    #[test]
    fn dispatcher_reports_unsupported_channels() {
        let dispatcher = ChannelDispatcher::new().with(Channel::Email, Arc::new(EmailSender::new(Arc::new(LogMailTransport), "a@b.c")));
        assert!(dispatcher.sender(Channel::Email).is_some());
        assert!(dispatcher.sender(Channel::Push).is_none());
        assert_eq!(dispatcher.channels(), vec![Channel::Email]);
    }
}
