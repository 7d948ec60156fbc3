//! Observer broadcast
//!
//! Fans controller events out to registered observers. Each delivery runs
//! on its own task bounded by a timeout, so a slow or broken observer never
//! holds up the others or the caller. Observers that are no longer open
//! are pruned at the start of every broadcast.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::update::{ControllerEvent, Phase, ProgressSnapshot, WuState};

/// Event delivered to observers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CallbackEvent {
    StateChanged {
        state: WuState,
        timestamp: DateTime<Utc>,
    },
    ProgressChanged {
        phase: Phase,
        progress: ProgressSnapshot,
        timestamp: DateTime<Utc>,
    },
    AsyncOperationCompleted {
        phase: Phase,
        state: WuState,
        timestamp: DateTime<Utc>,
    },
    ServiceShutdown {
        timestamp: DateTime<Utc>,
    },
}

impl CallbackEvent {
    pub fn shutdown() -> Self {
        CallbackEvent::ServiceShutdown {
            timestamp: Utc::now(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CallbackEvent::StateChanged { .. } => "state_changed",
            CallbackEvent::ProgressChanged { .. } => "progress_changed",
            CallbackEvent::AsyncOperationCompleted { .. } => "async_operation_completed",
            CallbackEvent::ServiceShutdown { .. } => "service_shutdown",
        }
    }
}

impl From<ControllerEvent> for CallbackEvent {
    fn from(event: ControllerEvent) -> Self {
        let timestamp = Utc::now();
        match event {
            ControllerEvent::StateChanged(state) => CallbackEvent::StateChanged { state, timestamp },
            ControllerEvent::ProgressChanged { phase, progress } => CallbackEvent::ProgressChanged {
                phase,
                progress,
                timestamp,
            },
            ControllerEvent::AsyncOperationCompleted { phase, state } => {
                CallbackEvent::AsyncOperationCompleted {
                    phase,
                    state,
                    timestamp,
                }
            }
        }
    }
}

/// Connection state of an observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    Created,
    Open,
    Closing,
    Closed,
    Faulted,
}

impl Liveness {
    /// Whether the observer stays registered.
    pub fn is_deliverable(self) -> bool {
        matches!(self, Liveness::Created | Liveness::Open)
    }
}

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("Observer disconnected")]
    Disconnected,

    #[error("Delivery failed: {0}")]
    Failed(String),
}

/// A registered listener for [`CallbackEvent`]s.
#[async_trait]
pub trait Observer: Send + Sync {
    /// Identifier used in logs.
    fn id(&self) -> &str;

    fn liveness(&self) -> Liveness;

    async fn deliver(&self, event: CallbackEvent) -> Result<(), DeliveryError>;
}

/// Set of observers, unique by instance.
pub struct ObserverRegistry {
    observers: Mutex<Vec<Arc<dyn Observer>>>,
    delivery_timeout: Duration,
    closed: AtomicBool,
}

impl ObserverRegistry {
    pub fn new(delivery_timeout: Duration) -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
            delivery_timeout,
            closed: AtomicBool::new(false),
        }
    }

    /// Add `observer` unless the same instance is already registered.
    ///
    /// Returns `true` when it was added.
    pub fn register(&self, observer: Arc<dyn Observer>) -> bool {
        if self.closed.load(Ordering::Acquire) {
            debug!(observer = observer.id(), "Registry closed, observer not added");
            return false;
        }

        let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
        if observers.iter().any(|known| same_observer(known, &observer)) {
            debug!(observer = observer.id(), "Observer already registered");
            return false;
        }

        info!(observer = observer.id(), total = observers.len() + 1, "Observer registered");
        observers.push(observer);
        true
    }

    pub fn len(&self) -> usize {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop observers that are no longer open. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = observers.len();
        observers.retain(|observer| {
            let liveness = observer.liveness();
            if !liveness.is_deliverable() {
                debug!(observer = observer.id(), ?liveness, "Pruning observer");
            }
            liveness.is_deliverable()
        });
        before - observers.len()
    }

    /// Prune, then start one delivery task per remaining observer.
    ///
    /// Returns once every delivery has been spawned. Must be called inside a
    /// tokio runtime.
    pub fn broadcast(&self, event: CallbackEvent) -> usize {
        self.prune();

        let targets: Vec<Arc<dyn Observer>> = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let timeout = self.delivery_timeout;
        for observer in &targets {
            let observer = observer.clone();
            let event = event.clone();
            tokio::spawn(async move {
                let name = event.name();
                match tokio::time::timeout(timeout, observer.deliver(event)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(observer = observer.id(), event = name, error = %e, "Observer delivery failed");
                    }
                    Err(_) => {
                        warn!(
                            observer = observer.id(),
                            event = name,
                            timeout_ms = timeout.as_millis() as u64,
                            "Observer delivery timed out"
                        );
                    }
                }
            });
        }

        debug!(event = event.name(), observers = targets.len(), "Broadcast dispatched");
        targets.len()
    }

    /// Remove every observer and refuse new ones.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let removed = {
            let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *observers).len()
        };
        info!(removed, "Observer registry closed");
    }
}

fn same_observer(a: &Arc<dyn Observer>, b: &Arc<dyn Observer>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
