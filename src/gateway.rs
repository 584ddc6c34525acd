use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::queue;
use crate::staging::StagingArea;
use crate::validation::Validator;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Protocol limits and policies applied by every session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub hostname: String,
    pub max_message_size: usize,
    pub max_recipients: usize,
    pub reject_unknown_at_rcpt: bool,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            hostname: config.server.hostname.clone(),
            max_message_size: config.server.max_message_size,
            max_recipients: config.server.max_recipients,
            reject_unknown_at_rcpt: config.server.reject_unknown_at_rcpt,
        }
    }
}

/// Everything shared between connections. All parts are safe to use from
/// many connection tasks at once.
pub struct Gateway {
    pub settings: SessionSettings,
    pub validator: Validator,
    pub dispatcher: Dispatcher,
    pub staging: StagingArea,
    spools: Arc<Semaphore>,
}

impl Gateway {
    pub fn new(
        settings: SessionSettings,
        validator: Validator,
        dispatcher: Dispatcher,
        staging: StagingArea,
        max_concurrent_spools: usize,
    ) -> Self {
        Self {
            settings,
            validator,
            dispatcher,
            staging,
            spools: Arc::new(Semaphore::new(max_concurrent_spools)),
        }
    }

    /// Wire up the configured queue, validators and staging directory.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let staging = StagingArea::new(config.staging.dir.clone());
        staging.prepare().await?;

        let queue = queue::from_config(&config.queue).await?;
        let dispatcher = Dispatcher::new(queue, &config.domains.allowed);
        let validator = Validator::from_config(&config.validation)?;

        Ok(Self::new(
            SessionSettings::from_config(config),
            validator,
            dispatcher,
            staging,
            config.server.max_concurrent_spools,
        ))
    }

    /// Reserve a body-spooling slot without waiting.
    pub fn try_reserve_spool(&self) -> Option<OwnedSemaphorePermit> {
        self.spools.clone().try_acquire_owned().ok()
    }

    pub fn available_spools(&self) -> usize {
        self.spools.available_permits()
    }
}
