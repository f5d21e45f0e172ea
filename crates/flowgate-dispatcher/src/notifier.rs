// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flow notifications.
//!
//! A [`MailCreator`] turns a [`FlowSummary`] into a [`Mail`]; a [`Mailer`]
//! delivers it. Creators are looked up by the `mail_creator` submission
//! option in a [`MailCreatorRegistry`] that is built once at startup and
//! immutable afterwards. Delivery failures are logged and never affect the
//! execution.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowgate_core::{Execution, FailureAction, Status};
use tracing::{error, info, warn};

/// Name of the built-in mail creator.
pub const DEFAULT_MAIL_CREATOR: &str = "default";

/// Facts about an execution used to format notifications.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowSummary {
    /// Execution id.
    pub execution_id: i64,
    /// Flow name.
    pub flow_id: String,
    /// Status at the time of notification.
    pub status: Status,
    /// Start time.
    pub start_time: Option<DateTime<Utc>>,
    /// End time.
    pub end_time: Option<DateTime<Utc>>,
    /// Failure policy.
    pub failure_action: FailureAction,
    /// Nodes that failed or were killed.
    pub failed_nodes: Vec<String>,
    /// Reason recorded with the terminal status.
    pub reason: Option<String>,
}

impl FlowSummary {
    /// Summarize an execution record.
    pub fn from_execution(execution: &Execution) -> Self {
        Self {
            execution_id: execution.id,
            flow_id: execution.flow_id.clone(),
            status: execution.status,
            start_time: execution.start_time,
            end_time: execution.end_time,
            failure_action: execution.options.failure_action,
            failed_nodes: execution.dag.failed_nodes(),
            reason: execution.failure_reason.clone(),
        }
    }

    fn duration(&self) -> String {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => {
                let secs = (end - start).num_seconds().max(0);
                format!("{}m {}s", secs / 60, secs % 60)
            }
            _ => "-".to_string(),
        }
    }

    fn time(at: Option<DateTime<Utc>>) -> String {
        at.map(|t| t.format("%Y/%m/%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "-".to_string())
    }

    fn table(&self) -> String {
        format!(
            "Start Time: {}\nEnd Time: {}\nDuration: {}\nStatus: {}\n",
            Self::time(self.start_time),
            Self::time(self.end_time),
            self.duration(),
            self.status
        )
    }
}

/// An outgoing notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mail {
    /// Recipients.
    pub to: Vec<String>,
    /// Subject line.
    pub subject: String,
    /// Plain-text body.
    pub body: String,
}

/// Formats notifications. Each method returns `None` when there is nothing
/// to send.
pub trait MailCreator: Send + Sync {
    /// First node failure while the flow is still running.
    fn first_failure(&self, summary: &FlowSummary, to: &[String]) -> Option<Mail>;

    /// Flow finished in a failed or killed state.
    fn failure(&self, summary: &FlowSummary, to: &[String]) -> Option<Mail>;

    /// Flow succeeded.
    fn success(&self, summary: &FlowSummary, to: &[String]) -> Option<Mail>;
}

/// Plain-text mails naming the failed nodes.
#[derive(Debug, Clone)]
pub struct DefaultMailCreator {
    instance_name: String,
}

impl DefaultMailCreator {
    /// `instance_name` is shown in subjects.
    pub fn new(instance_name: impl Into<String>) -> Self {
        Self {
            instance_name: instance_name.into(),
        }
    }

    fn failed_list(summary: &FlowSummary) -> String {
        let mut out = String::new();
        for job_id in &summary.failed_nodes {
            out.push_str(&format!("  - Failed job '{}'\n", job_id));
        }
        if let Some(reason) = &summary.reason {
            out.push_str(&format!("  - {}\n", reason));
        }
        out
    }
}

impl Default for DefaultMailCreator {
    fn default() -> Self {
        Self::new("flowgate")
    }
}

impl MailCreator for DefaultMailCreator {
    fn first_failure(&self, summary: &FlowSummary, to: &[String]) -> Option<Mail> {
        if to.is_empty() {
            return None;
        }
        Some(Mail {
            to: to.to_vec(),
            subject: format!(
                "Flow '{}' has encountered a failure on {}",
                summary.flow_id, self.instance_name
            ),
            body: format!(
                "Execution '{}' of flow '{}' has encountered a failure on {}.\n{}\n\n{}\nReason:\n{}",
                summary.execution_id,
                summary.flow_id,
                self.instance_name,
                summary.failure_action.description(),
                summary.table(),
                Self::failed_list(summary)
            ),
        })
    }

    fn failure(&self, summary: &FlowSummary, to: &[String]) -> Option<Mail> {
        if to.is_empty() {
            return None;
        }
        Some(Mail {
            to: to.to_vec(),
            subject: format!(
                "Flow '{}' has failed on {}",
                summary.flow_id, self.instance_name
            ),
            body: format!(
                "Execution '{}' of flow '{}' has failed on {}.\n\n{}\nReason:\n{}",
                summary.execution_id,
                summary.flow_id,
                self.instance_name,
                summary.table(),
                Self::failed_list(summary)
            ),
        })
    }

    fn success(&self, summary: &FlowSummary, to: &[String]) -> Option<Mail> {
        if to.is_empty() {
            return None;
        }
        Some(Mail {
            to: to.to_vec(),
            subject: format!(
                "Flow '{}' has succeeded on {}",
                summary.flow_id, self.instance_name
            ),
            body: format!(
                "Execution '{}' of flow '{}' has succeeded on {}.\n\n{}",
                summary.execution_id,
                summary.flow_id,
                self.instance_name,
                summary.table()
            ),
        })
    }
}

/// Builder for [`MailCreatorRegistry`].
pub struct MailCreatorRegistryBuilder {
    creators: HashMap<String, Arc<dyn MailCreator>>,
}

impl MailCreatorRegistryBuilder {
    /// Register a creator under `name`, replacing any previous one.
    pub fn register(mut self, name: impl Into<String>, creator: Arc<dyn MailCreator>) -> Self {
        self.creators.insert(name.into(), creator);
        self
    }

    /// Freeze the registry.
    pub fn build(self) -> MailCreatorRegistry {
        MailCreatorRegistry {
            creators: self.creators,
        }
    }
}

/// Read-only lookup of mail creators by name.
pub struct MailCreatorRegistry {
    creators: HashMap<String, Arc<dyn MailCreator>>,
}

impl Default for MailCreatorRegistry {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl MailCreatorRegistry {
    /// Start a registry containing the default creator.
    pub fn builder() -> MailCreatorRegistryBuilder {
        let mut creators: HashMap<String, Arc<dyn MailCreator>> = HashMap::new();
        creators.insert(
            DEFAULT_MAIL_CREATOR.to_string(),
            Arc::new(DefaultMailCreator::default()),
        );
        MailCreatorRegistryBuilder { creators }
    }

    /// Creator for `name`, falling back to the default one.
    pub fn get(&self, name: &str) -> Arc<dyn MailCreator> {
        if let Some(creator) = self.creators.get(name) {
            return creator.clone();
        }
        warn!(mail_creator = %name, "Unknown mail creator, using default");
        self.creators
            .get(DEFAULT_MAIL_CREATOR)
            .cloned()
            .unwrap_or_else(|| Arc::new(DefaultMailCreator::default()))
    }
}

/// Delivery failure.
#[derive(Debug, thiserror::Error)]
#[error("mail delivery failed: {0}")]
pub struct MailError(pub String);

/// Sends mails.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Deliver one mail.
    async fn send(&self, mail: &Mail) -> Result<(), MailError>;
}

/// Writes mails to the log instead of sending them.
#[derive(Debug, Default, Clone)]
pub struct LoggingMailer;

#[async_trait]
impl Mailer for LoggingMailer {
    async fn send(&self, mail: &Mail) -> Result<(), MailError> {
        info!(to = ?mail.to, subject = %mail.subject, "Notification");
        Ok(())
    }
}

/// Sends flow notifications according to submission options.
pub struct Notifier {
    creators: MailCreatorRegistry,
    mailer: Arc<dyn Mailer>,
}

impl Notifier {
    /// Create a notifier.
    pub fn new(creators: MailCreatorRegistry, mailer: Arc<dyn Mailer>) -> Self {
        Self { creators, mailer }
    }

    /// Notify about the first failed node, if the execution asked for it.
    pub async fn notify_first_failure(&self, execution: &Execution) {
        let options = &execution.options;
        if !options.notify_on_first_failure {
            return;
        }
        let summary = FlowSummary::from_execution(execution);
        let mail = self
            .creators
            .get(&options.mail_creator)
            .first_failure(&summary, &options.failure_emails);
        self.deliver(execution.id, mail).await;
    }

    /// Notify about a finished execution.
    pub async fn notify_finished(&self, execution: &Execution) {
        let options = &execution.options;
        let summary = FlowSummary::from_execution(execution);
        let creator = self.creators.get(&options.mail_creator);
        let mail = match execution.status {
            Status::Succeeded => creator.success(&summary, &options.success_emails),
            Status::Failed | Status::Killed if options.notify_on_last_failure => {
                creator.failure(&summary, &options.failure_emails)
            }
            _ => None,
        };
        self.deliver(execution.id, mail).await;
    }

    async fn deliver(&self, execution_id: i64, mail: Option<Mail>) {
        let Some(mail) = mail else {
            return;
        };
        if let Err(e) = self.mailer.send(&mail).await {
            error!(execution_id, error = %e, "Failed to send notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgate_core::{DagNode, ExecutionOptions, FlowDag, NodeStatus};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingMailer {
        sent: Mutex<Vec<Mail>>,
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send(&self, mail: &Mail) -> Result<(), MailError> {
            self.sent.lock().await.push(mail.clone());
            Ok(())
        }
    }

    struct FailingMailer;

    #[async_trait]
    impl Mailer for FailingMailer {
        async fn send(&self, _mail: &Mail) -> Result<(), MailError> {
            Err(MailError("smtp down".to_string()))
        }
    }

    struct ShoutingCreator;

    impl MailCreator for ShoutingCreator {
        fn first_failure(&self, _s: &FlowSummary, _to: &[String]) -> Option<Mail> {
            None
        }
        fn failure(&self, s: &FlowSummary, to: &[String]) -> Option<Mail> {
            Some(Mail {
                to: to.to_vec(),
                subject: format!("{} FAILED", s.flow_id.to_uppercase()),
                body: String::new(),
            })
        }
        fn success(&self, _s: &FlowSummary, _to: &[String]) -> Option<Mail> {
            None
        }
    }

    fn execution(status: Status, options: ExecutionOptions) -> Execution {
        let mut failed = DagNode::new("b", &["a"]);
        failed.status = NodeStatus::Failed;
        let mut ok = DagNode::new("a", &[]);
        ok.status = NodeStatus::Succeeded;
        let now = Utc::now();
        Execution {
            id: 5,
            flow_id: "nightly".to_string(),
            dag: FlowDag::new(vec![ok, failed]).unwrap(),
            status,
            executor_id: Some(1),
            options,
            submit_time: now,
            start_time: Some(now),
            end_time: Some(now + chrono::Duration::seconds(75)),
            update_time: now,
            dispatch_attempts: 0,
            update_version: 1,
            failure_reason: None,
        }
    }

    fn options() -> ExecutionOptions {
        ExecutionOptions {
            failure_emails: vec!["ops@example.com".to_string()],
            success_emails: vec!["team@example.com".to_string()],
            ..ExecutionOptions::default()
        }
    }

    #[tokio::test]
    async fn test_failure_mail_lists_failed_nodes() {
        let mailer = Arc::new(RecordingMailer::default());
        let notifier = Notifier::new(MailCreatorRegistry::default(), mailer.clone());

        notifier
            .notify_finished(&execution(Status::Failed, options()))
            .await;

        let sent = mailer.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, vec!["ops@example.com".to_string()]);
        assert_eq!(sent[0].subject, "Flow 'nightly' has failed on flowgate");
        assert!(sent[0].body.contains("Failed job 'b'"));
        assert!(sent[0].body.contains("Duration: 1m 15s"));
    }

    #[tokio::test]
    async fn test_success_mail_goes_to_success_recipients() {
        let mailer = Arc::new(RecordingMailer::default());
        let notifier = Notifier::new(MailCreatorRegistry::default(), mailer.clone());

        notifier
            .notify_finished(&execution(Status::Succeeded, options()))
            .await;

        let sent = mailer.sent.lock().await;
        assert_eq!(sent[0].to, vec!["team@example.com".to_string()]);
    }

    #[tokio::test]
    async fn test_notification_flags_and_empty_recipients() {
        let mailer = Arc::new(RecordingMailer::default());
        let notifier = Notifier::new(MailCreatorRegistry::default(), mailer.clone());

        notifier
            .notify_first_failure(&execution(Status::Running, options()))
            .await;
        let quiet = ExecutionOptions {
            notify_on_last_failure: false,
            ..options()
        };
        notifier
            .notify_finished(&execution(Status::Failed, quiet))
            .await;
        notifier
            .notify_finished(&execution(Status::Succeeded, ExecutionOptions::default()))
            .await;

        assert!(mailer.sent.lock().await.is_empty());

        let eager = ExecutionOptions {
            notify_on_first_failure: true,
            ..options()
        };
        notifier
            .notify_first_failure(&execution(Status::Running, eager))
            .await;
        let sent = mailer.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].subject.contains("encountered a failure"));
    }

    #[tokio::test]
    async fn test_named_creator_with_default_fallback() {
        let mailer = Arc::new(RecordingMailer::default());
        let registry = MailCreatorRegistry::builder()
            .register("shout", Arc::new(ShoutingCreator))
            .build();
        let notifier = Notifier::new(registry, mailer.clone());

        let shout = ExecutionOptions {
            mail_creator: "shout".to_string(),
            ..options()
        };
        notifier
            .notify_finished(&execution(Status::Failed, shout))
            .await;
        let unknown = ExecutionOptions {
            mail_creator: "missing".to_string(),
            ..options()
        };
        notifier
            .notify_finished(&execution(Status::Failed, unknown))
            .await;

        let sent = mailer.sent.lock().await;
        assert_eq!(sent[0].subject, "NIGHTLY FAILED");
        assert_eq!(sent[1].subject, "Flow 'nightly' has failed on flowgate");
    }

    #[tokio::test]
    async fn test_delivery_errors_are_swallowed() {
        let notifier = Notifier::new(MailCreatorRegistry::default(), Arc::new(FailingMailer));
        notifier
            .notify_finished(&execution(Status::Failed, options()))
            .await;
    }
}
