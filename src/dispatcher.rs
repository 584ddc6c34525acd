use crate::classifier::{classify, ClassifiedRecipient};
use crate::queue::{JobQueue, QueueError};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Serialize, Serializer};
use std::borrow::Cow;
use std::sync::Arc;
use tokio::task::JoinSet;
use uuid::Uuid;

pub const KIND_MEMBER_VIEW: &str = "mail.member_view";
pub const KIND_VISITOR_VIEW: &str = "mail.visitor_view";

/// Consumption order hint for the downstream queue. Lower rank is consumed
/// first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JobPriority {
    Highest,
    High,
}

impl JobPriority {
    pub fn rank(self) -> u8 {
        match self {
            JobPriority::Highest => 1,
            JobPriority::High => 2,
        }
    }
}

impl Serialize for JobPriority {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.rank())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobPayload {
    MemberView {
        slug: String,
        username: String,
        domain: String,
        raw_mail: Arc<[u8]>,
    },
    VisitorView {
        slug: String,
        domain: String,
        raw_mail: Arc<[u8]>,
    },
}

impl JobPayload {
    /// Build the payload for an accepted recipient; `None` when the
    /// classification carries no domain.
    pub fn for_recipient(recipient: &ClassifiedRecipient, raw_mail: Arc<[u8]>) -> Option<Self> {
        let domain = recipient.domain.clone()?;
        let payload = match (&recipient.username, recipient.is_member) {
            (Some(username), true) => JobPayload::MemberView {
                slug: recipient.slug.clone(),
                username: username.clone(),
                domain,
                raw_mail,
            },
            _ => JobPayload::VisitorView {
                slug: recipient.slug.clone(),
                domain,
                raw_mail,
            },
        };
        Some(payload)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            JobPayload::MemberView { .. } => KIND_MEMBER_VIEW,
            JobPayload::VisitorView { .. } => KIND_VISITOR_VIEW,
        }
    }

    pub fn priority(&self) -> JobPriority {
        match self {
            JobPayload::MemberView { .. } => JobPriority::Highest,
            JobPayload::VisitorView { .. } => JobPriority::High,
        }
    }

    pub fn slug(&self) -> &str {
        match self {
            JobPayload::MemberView { slug, .. } | JobPayload::VisitorView { slug, .. } => slug,
        }
    }

    pub fn domain(&self) -> &str {
        match self {
            JobPayload::MemberView { domain, .. } | JobPayload::VisitorView { domain, .. } => {
                domain
            }
        }
    }

    pub fn username(&self) -> Option<&str> {
        match self {
            JobPayload::MemberView { username, .. } => Some(username),
            JobPayload::VisitorView { .. } => None,
        }
    }

    pub fn raw_mail(&self) -> &[u8] {
        match self {
            JobPayload::MemberView { raw_mail, .. } | JobPayload::VisitorView { raw_mail, .. } => {
                raw_mail
            }
        }
    }
}

/// A payload together with its priority tier, as handed to the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    payload: JobPayload,
    priority: JobPriority,
}

impl Job {
    pub fn new(payload: JobPayload) -> Self {
        let priority = payload.priority();
        Self { payload, priority }
    }

    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }

    pub fn payload(&self) -> &JobPayload {
        &self.payload
    }

    pub fn priority(&self) -> JobPriority {
        self.priority
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireData<'a> {
    slug: &'a str,
    domain: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<&'a str>,
    raw_mail: Cow<'a, str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    raw_mail_encoding: Option<&'static str>,
}

#[derive(Serialize)]
struct WireJob<'a> {
    kind: &'static str,
    data: WireData<'a>,
    priority: JobPriority,
}

impl Serialize for Job {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let raw = self.payload.raw_mail();
        // bodies that are not UTF-8 travel as base64 so no byte is altered
        let (raw_mail, raw_mail_encoding) = match std::str::from_utf8(raw) {
            Ok(text) => (Cow::Borrowed(text), None),
            Err(_) => (Cow::Owned(STANDARD.encode(raw)), Some("base64")),
        };

        WireJob {
            kind: self.kind(),
            data: WireData {
                slug: self.payload.slug(),
                domain: self.payload.domain(),
                username: self.payload.username(),
                raw_mail,
                raw_mail_encoding,
            },
            priority: self.priority,
        }
        .serialize(serializer)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub members: usize,
    pub visitors: usize,
}

impl DispatchReport {
    pub fn total(&self) -> usize {
        self.members + self.visitors
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("recipients outside the allowed domains: {}", .0.join(", "))]
    Unclassified(Vec<String>),

    #[error("{failed} of {total} job submissions failed: {first}")]
    Submit {
        total: usize,
        failed: usize,
        first: QueueError,
    },
}

/// Turns a received message into one queue job per recipient.
pub struct Dispatcher {
    queue: Arc<dyn JobQueue>,
    allowed_domains: Arc<[String]>,
}

impl Dispatcher {
    pub fn new(queue: Arc<dyn JobQueue>, allowed_domains: &[String]) -> Self {
        Self {
            queue,
            allowed_domains: allowed_domains.into(),
        }
    }

    pub fn classify(&self, address: &str) -> ClassifiedRecipient {
        classify(address, &self.allowed_domains)
    }

    /// Classify every recipient, then submit all jobs and wait for every
    /// submission to resolve.
    ///
    /// No job is submitted when any recipient fails classification. Jobs
    /// already accepted by the queue stay there when a sibling submission
    /// fails.
    pub async fn dispatch(
        &self,
        session_id: Uuid,
        recipients: &[String],
        raw_mail: Vec<u8>,
    ) -> Result<DispatchReport, DispatchError> {
        let raw_mail: Arc<[u8]> = raw_mail.into();
        let classified: Vec<ClassifiedRecipient> =
            recipients.iter().map(|r| self.classify(r)).collect();

        let rejected: Vec<String> = classified
            .iter()
            .filter(|c| !c.is_accepted())
            .map(|c| c.raw_address.clone())
            .collect();
        if !rejected.is_empty() {
            log::warn!("{session_id} Invalid recipients: {}", rejected.join(", "));
            return Err(DispatchError::Unclassified(rejected));
        }

        let mut report = DispatchReport::default();
        let mut submissions = JoinSet::new();

        for recipient in &classified {
            let Some(payload) = JobPayload::for_recipient(recipient, raw_mail.clone()) else {
                continue;
            };
            let job = Job::new(payload);
            match job.payload() {
                JobPayload::MemberView { .. } => {
                    report.members += 1;
                    log::debug!("{session_id} triggering job for handling member view mail");
                }
                JobPayload::VisitorView { .. } => {
                    report.visitors += 1;
                    log::debug!("{session_id} triggering job for handling visitor view mail");
                }
            }

            let queue = self.queue.clone();
            submissions.spawn(async move { queue.submit(&job).await });
        }

        let total = report.total();
        let mut failed = 0;
        let mut first_error = None;

        while let Some(joined) = submissions.join_next().await {
            let outcome = joined.unwrap_or_else(|e| Err(QueueError::Unavailable(e.to_string())));
            if let Err(e) = outcome {
                log::error!("{session_id} Job submission failed: {e}");
                failed += 1;
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(first) => Err(DispatchError::Submit {
                total,
                failed,
                first,
            }),
            None => {
                log::info!(
                    "{session_id} Submitted {total} job(s): {} member, {} visitor",
                    report.members,
                    report.visitors
                );
                Ok(report)
            }
        }
    }
}
