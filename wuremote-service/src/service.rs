//! Service facade.
//!
//! [`WuRemoteService`] is the surface the hosting layer talks to. It owns
//! the [`UpdateController`], the [`ObserverRegistry`] and the relay task
//! that forwards controller events to observers.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};
use wuremote_agent::{UpdateAgent, DEFAULT_SEARCH_CRITERIA};

use crate::broadcast::{CallbackEvent, Observer, ObserverRegistry};
use crate::config::Config;
use crate::update::{
    Phase, ProgressSnapshot, Result, Settings, UpdateController, UpdateDescriptor, WuState,
    WuStatus,
};

/// Construction parameters of a [`WuRemoteService`].
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub settings: Settings,
    pub search_criteria: String,
    /// Overrides the detected host name
    pub fqdn: Option<String>,
    pub delivery_timeout: Duration,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            settings: Settings::default(),
            search_criteria: DEFAULT_SEARCH_CRITERIA.to_string(),
            fqdn: None,
            delivery_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&Config> for ServiceOptions {
    fn from(config: &Config) -> Self {
        Self {
            settings: config.settings.clone(),
            search_criteria: config.agent.search_criteria.clone(),
            fqdn: config.node.fqdn.clone(),
            delivery_timeout: Duration::from_millis(config.observers.delivery_timeout_ms),
        }
    }
}

/// Remote control surface of the update pipeline.
pub struct WuRemoteService {
    controller: UpdateController,
    observers: Arc<ObserverRegistry>,
    fqdn: Option<String>,
    relay: JoinHandle<()>,
    flush: mpsc::UnboundedSender<oneshot::Sender<()>>,
}

impl WuRemoteService {
    /// Create the service. Must be called inside a tokio runtime.
    pub fn new(agent: Arc<dyn UpdateAgent>, options: ServiceOptions) -> Self {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let controller = UpdateController::new(
            agent,
            options.settings,
            options.search_criteria,
            events_tx,
        );

        let observers = Arc::new(ObserverRegistry::new(options.delivery_timeout));
        let (flush, mut flush_rx) = mpsc::unbounded_channel::<oneshot::Sender<()>>();
        let relay_observers = observers.clone();
        let relay = tokio::spawn(async move {
            loop {
                tokio::select! {
                    // Queued events go out before a flush is acknowledged.
                    biased;
                    event = events_rx.recv() => match event {
                        Some(event) => {
                            relay_observers.broadcast(CallbackEvent::from(event));
                        }
                        None => break,
                    },
                    Some(ack) = flush_rx.recv() => {
                        let _ = ack.send(());
                    }
                }
            }
            debug!("Event relay stopped");
        });

        Self {
            controller,
            observers,
            fqdn: options.fqdn,
            relay,
            flush,
        }
    }

    // =========================================================================
    // Phase Control
    // =========================================================================

    pub async fn begin_search_updates(&self) -> Result<WuState> {
        self.controller.begin(Phase::Search).await
    }

    pub async fn begin_download_updates(&self) -> Result<WuState> {
        self.controller.begin(Phase::Download).await
    }

    pub async fn begin_install_updates(&self) -> Result<WuState> {
        self.controller.begin(Phase::Install).await
    }

    pub async fn abort_search_updates(&self) -> Result<WuState> {
        self.controller.abort(Phase::Search).await
    }

    pub async fn abort_download_updates(&self) -> Result<WuState> {
        self.controller.abort(Phase::Download).await
    }

    pub async fn abort_install_updates(&self) -> Result<WuState> {
        self.controller.abort(Phase::Install).await
    }

    // =========================================================================
    // Status
    // =========================================================================

    pub fn get_wu_status(&self) -> WuStatus {
        self.controller.status()
    }

    pub fn get_current_progress(&self) -> Option<ProgressSnapshot> {
        self.controller.current_progress()
    }

    pub fn get_available_updates(&self) -> Vec<UpdateDescriptor> {
        self.controller.available_updates()
    }

    // =========================================================================
    // Settings
    // =========================================================================

    pub fn get_settings(&self) -> Settings {
        self.controller.settings()
    }

    pub fn set_search_timeout(&self, secs: i32) -> Result<Settings> {
        self.controller.set_timeout(Phase::Search, i64::from(secs))
    }

    pub fn set_download_timeout(&self, secs: i32) -> Result<Settings> {
        self.controller.set_timeout(Phase::Download, i64::from(secs))
    }

    pub fn set_install_timeout(&self, secs: i32) -> Result<Settings> {
        self.controller.set_timeout(Phase::Install, i64::from(secs))
    }

    pub fn set_auto_accept_eulas(&self, enabled: bool) -> Settings {
        self.controller.set_auto_accept_eulas(enabled)
    }

    pub fn set_auto_select_updates(&self, enabled: bool) -> Settings {
        self.controller.set_auto_select_updates(enabled)
    }

    // =========================================================================
    // Selection
    // =========================================================================

    pub async fn select_update(&self, update_id: &str) -> Result<()> {
        self.controller.select_update(update_id).await
    }

    pub async fn unselect_update(&self, update_id: &str) -> Result<()> {
        self.controller.unselect_update(update_id).await
    }

    pub async fn accept_eula(&self, update_id: &str) -> Result<()> {
        self.controller.accept_eula(update_id).await
    }

    pub async fn select_all_updates(&self) -> usize {
        self.controller.select_all_updates().await
    }

    pub async fn unselect_all_updates(&self) {
        self.controller.unselect_all_updates().await
    }

    // =========================================================================
    // Host
    // =========================================================================

    pub async fn reset_service(&self) -> Result<WuState> {
        self.controller.reset().await
    }

    pub async fn reboot_host(&self) -> Result<WuState> {
        self.controller.reboot_host().await
    }

    /// Configured FQDN, else the detected host name.
    pub fn get_fqdn(&self) -> String {
        self.fqdn.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string())
        })
    }

    pub fn get_service_version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    // =========================================================================
    // Observers
    // =========================================================================

    /// Add an observer to the broadcast set. Registering twice is a no-op.
    pub fn register_for_callback(&self, observer: Arc<dyn Observer>) -> bool {
        self.observers.register(observer)
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Tell every observer the service is going away. Returns the number of
    /// deliveries started.
    #[instrument(skip(self))]
    pub fn send_shutdown_signal(&self) -> usize {
        let notified = self.observers.broadcast(CallbackEvent::shutdown());
        info!(observers = notified, "Shutdown signal sent");
        notified
    }

    /// Wait until every event emitted so far has been handed to the
    /// registry.
    async fn flush_relay(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.flush.send(ack_tx).is_err() || ack_rx.await.is_err() {
            debug!("Event relay gone, nothing to flush");
        }
    }

    /// Dispose the controller and drop all observers.
    ///
    /// Observers still receive the final `Disposed` state change.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> WuState {
        let state = self.controller.dispose().await;
        self.flush_relay().await;
        self.observers.close();
        info!("Service shut down");
        state
    }
}

impl Drop for WuRemoteService {
    fn drop(&mut self) {
        self.relay.abort();
    }
}
