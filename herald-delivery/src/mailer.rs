//! Producer helpers: fire-and-forget mail and notice submission

use std::{collections::BTreeMap, sync::Arc};

use herald_store::{ItemId, MessageQueue, Notice, NoticeQueue, OutgoingMessage, Priority, UserId};
use serde::Deserialize;

use crate::{
    error::DeliveryError,
    notice::{NoticeDispatcher, NoticeOutcome},
};

/// Addresses and defaults used by [`Mailer`]
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MailerConfig {
    /// Sender used when a caller passes `None`
    pub default_from: String,
    pub admins: Vec<String>,
    pub managers: Vec<String>,
    /// Prepended to the subject of admin and manager mail
    pub subject_prefix: String,
}

/// Queues mail; never delivers it synchronously
#[derive(Debug, Clone)]
pub struct Mailer {
    queue: MessageQueue,
    config: MailerConfig,
}

impl Mailer {
    pub const fn new(queue: MessageQueue, config: MailerConfig) -> Self {
        Self { queue, config }
    }

    #[must_use]
    pub const fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    /// Queue one item per recipient
    ///
    /// Blank recipients are ignored. Returns the ids in recipient order.
    ///
    /// # Errors
    /// Fails on the first recipient that cannot be stored; items queued
    /// before it stay queued.
    pub async fn send_mail(
        &self,
        subject: &str,
        body: &str,
        from: Option<&str>,
        recipients: &[impl AsRef<str>],
        priority: Priority,
    ) -> Result<Vec<ItemId>, DeliveryError> {
        let from = from.unwrap_or(&self.config.default_from);
        let mut ids = Vec::with_capacity(recipients.len());

        for recipient in recipients.iter().map(AsRef::as_ref) {
            let recipient = recipient.trim();
            if recipient.is_empty() {
                continue;
            }

            let message = OutgoingMessage::new(recipient, from, subject, body);
            ids.push(self.queue.enqueue(message, priority).await?);
        }

        Ok(ids)
    }

    /// Queue a High priority mail to every configured admin
    ///
    /// # Errors
    /// See [`Mailer::send_mail`].
    pub async fn mail_admins(&self, subject: &str, body: &str) -> Result<Vec<ItemId>, DeliveryError> {
        let subject = format!("{}{subject}", self.config.subject_prefix);
        self.send_mail(&subject, body, None, &self.config.admins, Priority::High)
            .await
    }

    /// Queue a High priority mail to every configured manager
    ///
    /// # Errors
    /// See [`Mailer::send_mail`].
    pub async fn mail_managers(
        &self,
        subject: &str,
        body: &str,
    ) -> Result<Vec<ItemId>, DeliveryError> {
        let subject = format!("{}{subject}", self.config.subject_prefix);
        self.send_mail(&subject, body, None, &self.config.managers, Priority::High)
            .await
    }
}

/// How [`Notifier::send`] should treat a notice
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SendMode {
    /// Store a batch for the notice worker
    Queue,
    /// Dispatch right away
    Now,
    /// Queue when `queue_all` is set, otherwise dispatch right away
    #[default]
    Default,
}

/// Notice producer
#[derive(Debug, Clone)]
pub struct Notifier {
    notices: NoticeQueue,
    dispatcher: Arc<dyn NoticeDispatcher>,
    queue_all: bool,
}

impl Notifier {
    pub fn new(notices: NoticeQueue, dispatcher: Arc<dyn NoticeDispatcher>) -> Self {
        Self {
            notices,
            dispatcher,
            queue_all: false,
        }
    }

    #[must_use]
    pub const fn with_queue_all(mut self, queue_all: bool) -> Self {
        self.queue_all = queue_all;
        self
    }

    fn build(users: &[UserId], label: &str, context: &BTreeMap<String, String>, on_site: bool) -> Vec<Notice> {
        users
            .iter()
            .map(|&recipient| Notice {
                recipient,
                label: label.to_string(),
                context: context.clone(),
                on_site,
            })
            .collect()
    }

    /// Store one batch holding a notice per user
    ///
    /// Returns `None` when `users` is empty.
    ///
    /// # Errors
    /// Returns an error if the batch cannot be encoded or stored.
    pub async fn queue(
        &self,
        users: &[UserId],
        label: &str,
        context: &BTreeMap<String, String>,
        on_site: bool,
    ) -> Result<Option<ItemId>, DeliveryError> {
        let notices = Self::build(users, label, context, on_site);
        Ok(self.notices.enqueue(&notices).await?)
    }

    /// Dispatch a notice per user immediately, bypassing the batch queue
    ///
    /// Transient failures are logged and do not stop the remaining users.
    /// Returns how many notices were sent.
    ///
    /// # Errors
    /// A permanent dispatch failure stops and is returned.
    pub async fn send_now(
        &self,
        users: &[UserId],
        label: &str,
        context: &BTreeMap<String, String>,
        on_site: bool,
    ) -> Result<usize, DeliveryError> {
        let mut sent = 0;

        for notice in Self::build(users, label, context, on_site) {
            match self.dispatcher.dispatch(&notice).await {
                NoticeOutcome::Sent => sent += 1,
                NoticeOutcome::Skipped => {}
                NoticeOutcome::Transient(detail) => {
                    tracing::warn!(
                        user = %notice.recipient,
                        label,
                        "Notice not sent: {detail}"
                    );
                }
                NoticeOutcome::Permanent(detail) => {
                    return Err(DeliveryError::Dispatch {
                        label: notice.label,
                        user: notice.recipient,
                        detail,
                    });
                }
            }
        }

        Ok(sent)
    }

    /// Queue or dispatch according to `mode` and `queue_all`
    ///
    /// Returns `true` when the notice was queued rather than sent.
    ///
    /// # Errors
    /// See [`Notifier::queue`] and [`Notifier::send_now`].
    pub async fn send(
        &self,
        users: &[UserId],
        label: &str,
        context: &BTreeMap<String, String>,
        on_site: bool,
        mode: SendMode,
    ) -> Result<bool, DeliveryError> {
        let queue = match mode {
            SendMode::Queue => true,
            SendMode::Now => false,
            SendMode::Default => self.queue_all,
        };

        if queue {
            self.queue(users, label, context, on_site).await?;
        } else {
            self.send_now(users, label, context, on_site).await?;
        }

        Ok(queue)
    }
}
