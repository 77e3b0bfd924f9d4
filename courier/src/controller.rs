use std::sync::Arc;

use courier_common::{internal, logging};
use courier_delivery::{
    BatchProcessor, EmailProvider, InAppProvider, Inbox, MessageService, NotificationService,
    RateLimiter, RuleEngine, SmartFilter, TemplateRegistry,
    repository::{
        MemoryAttemptRepository, MemoryDigestRepository, MemoryMessageRepository,
        MemoryNotificationRepository, MemoryPreferenceRepository, MemoryRuleSource,
    },
};
use courier_metrics::{InMemoryTelemetry, init_metrics};
use tokio_util::sync::CancellationToken;

use crate::config::Config;

/// The assembled engine: services, providers and the in-memory stores behind
/// them.
pub struct Courier {
    config: Config,
    messages: Arc<MessageService>,
    batch: Arc<BatchProcessor>,
    notifications: Arc<NotificationService>,
    inbox: Arc<Inbox>,
    rules: Arc<MemoryRuleSource>,
    preferences: Arc<MemoryPreferenceRepository>,
    telemetry: Arc<InMemoryTelemetry>,
}

impl std::fmt::Debug for Courier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Courier")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

async fn shutdown_signal() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            internal!(level = INFO, "CTRL+C entered, shutting down");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate Signal received, shutting down");
        }
    }

    Ok(())
}

impl Courier {
    /// Builds every component from `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if a configured template does not compile.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let templates = Arc::new(TemplateRegistry::from_config(&config.templates)?);
        let telemetry = Arc::new(InMemoryTelemetry::default());

        let messages = Arc::new(MessageService::new(
            config.service.clone(),
            Arc::new(MemoryMessageRepository::new()),
            Arc::new(MemoryAttemptRepository::new()),
            RateLimiter::in_memory(config.rate_limits.clone()),
            telemetry.clone(),
        ));

        let inbox = Arc::new(Inbox::default());
        messages.register_provider(Arc::new(EmailProvider::new(
            config.smtp.clone(),
            config.timeouts.clone(),
            templates.clone(),
        )));
        messages.register_provider(Arc::new(InAppProvider::new(inbox.clone())));

        let preferences = Arc::new(MemoryPreferenceRepository::new());
        let notification_store = Arc::new(MemoryNotificationRepository::new());
        let rules = Arc::new(MemoryRuleSource::new());

        let batch = Arc::new(BatchProcessor::new(
            config.batch.clone(),
            messages.clone(),
            Arc::new(MemoryDigestRepository::new()),
            notification_store.clone(),
            preferences.clone(),
            templates,
        ));

        let notifications = Arc::new(NotificationService::new(
            preferences.clone(),
            notification_store,
            SmartFilter::new(config.filter.clone()),
            RuleEngine::new(rules.clone()),
            messages.clone(),
            batch.clone(),
        ));

        Ok(Self {
            config,
            messages,
            batch,
            notifications,
            inbox,
            rules,
            preferences,
            telemetry,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub const fn messages(&self) -> &Arc<MessageService> {
        &self.messages
    }

    #[must_use]
    pub const fn notifications(&self) -> &Arc<NotificationService> {
        &self.notifications
    }

    #[must_use]
    pub const fn batch(&self) -> &Arc<BatchProcessor> {
        &self.batch
    }

    #[must_use]
    pub const fn inbox(&self) -> &Arc<Inbox> {
        &self.inbox
    }

    #[must_use]
    pub const fn rules(&self) -> &Arc<MemoryRuleSource> {
        &self.rules
    }

    #[must_use]
    pub const fn preferences(&self) -> &Arc<MemoryPreferenceRepository> {
        &self.preferences
    }

    #[must_use]
    pub const fn telemetry(&self) -> &Arc<InMemoryTelemetry> {
        &self.telemetry
    }

    /// Runs the background loops until `token` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if a loop panicked.
    pub async fn serve(&self, token: CancellationToken) -> anyhow::Result<()> {
        let sweeper = tokio::spawn(self.batch.clone().run(token.clone()));
        let scheduler = tokio::spawn(self.messages.clone().run_scheduler(token.clone()));

        token.cancelled().await;

        sweeper.await?;
        scheduler.await?;
        Ok(())
    }

    /// Initialises logging and metrics, then serves until SIGINT or SIGTERM.
    ///
    /// # Errors
    ///
    /// Returns an error if metrics cannot be initialised or the signal
    /// handlers cannot be installed.
    #[tracing::instrument(level = "trace", skip_all, err)]
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init();
        init_metrics(&self.config.metrics)?;

        internal!(level = INFO, "Controller running");
        let available = self.messages.available_channels().await;
        internal!(level = INFO, "Available channels: {available:?}");

        let token = CancellationToken::new();
        let signalled = {
            let token = token.clone();
            async move {
                let result = shutdown_signal().await;
                token.cancel();
                result
            }
        };

        let (served, signalled) = tokio::join!(self.serve(token), signalled);

        internal!(level = INFO, "Shutdown complete");
        signalled.and(served)
    }
}
