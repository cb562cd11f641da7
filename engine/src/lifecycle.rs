//! Session-bound background work.
//!
//! Syncing only happens while someone is signed in. [`LifecycleController::start`]
//! binds the reconcile cadence and the connectivity listener to a session;
//! [`LifecycleController::stop`] unbinds them.

use crate::{flush::Flusher, origin::Origin, reconcile::Reconciler, CollectionName};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// An authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub user_id: String,
    /// Bearer token for origin requests
    pub token: String,
}

impl Session {
    pub fn new(user_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            token: token.into(),
        }
    }
}

/// Shared connectivity flag.
///
/// The platform layer reports reachability with
/// [`set_online`](Self::set_online); the engine reacts to every change.
#[derive(Debug, Clone)]
pub struct NetworkStatus {
    online: Arc<watch::Sender<bool>>,
}

impl NetworkStatus {
    pub fn new(online: bool) -> Self {
        let (online, _) = watch::channel(online);
        Self {
            online: Arc::new(online),
        }
    }

    /// Report connectivity. Returns whether the flag changed.
    pub fn set_online(&self, online: bool) -> bool {
        self.online.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        })
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }
}

struct SessionBinding {
    session: Session,
    shutdown: watch::Sender<bool>,
}

/// Starts and stops syncing with the session.
pub struct LifecycleController {
    reconciler: Arc<Reconciler>,
    flusher: Arc<Flusher>,
    origin: Arc<dyn Origin>,
    network: NetworkStatus,
    collections: Arc<Vec<CollectionName>>,
    interval: Duration,
    binding: Mutex<Option<SessionBinding>>,
}

impl LifecycleController {
    pub fn new(
        reconciler: Arc<Reconciler>,
        flusher: Arc<Flusher>,
        origin: Arc<dyn Origin>,
        network: NetworkStatus,
        collections: Vec<CollectionName>,
        interval: Duration,
    ) -> Self {
        Self {
            reconciler,
            flusher,
            origin,
            network,
            collections: Arc::new(collections),
            interval,
            binding: Mutex::new(None),
        }
    }

    /// Bind syncing to `session`.
    ///
    /// Pulls every collection right away, then on the cadence. Returns false
    /// when a session was already running; its credentials are refreshed
    /// but no second cadence is started.
    pub async fn start(&self, session: Session) -> bool {
        let mut binding = self.binding.lock().await;
        self.origin.authenticate(Some(&session));

        if let Some(current) = binding.as_mut() {
            debug!(user_id = %session.user_id, "sync session already running");
            current.session = session;
            return false;
        }

        let (shutdown, _) = watch::channel(false);
        self.spawn_cadence(shutdown.subscribe());
        self.spawn_connectivity_listener(shutdown.subscribe());

        if self.network.is_online() {
            self.flusher.signal();
        }

        info!(
            user_id = %session.user_id,
            interval_secs = self.interval.as_secs_f64(),
            "sync session started"
        );
        *binding = Some(SessionBinding { session, shutdown });
        true
    }

    /// Unbind syncing. In-flight calls finish; nothing new is scheduled.
    /// Returns false when no session was running.
    pub async fn stop(&self) -> bool {
        let Some(binding) = self.binding.lock().await.take() else {
            return false;
        };
        let _ = binding.shutdown.send(true);
        self.origin.authenticate(None);
        info!(user_id = %binding.session.user_id, "sync session stopped");
        true
    }

    pub async fn is_active(&self) -> bool {
        self.binding.lock().await.is_some()
    }

    /// The running session.
    pub async fn session(&self) -> Option<Session> {
        self.binding
            .lock()
            .await
            .as_ref()
            .map(|b| b.session.clone())
    }

    fn spawn_cadence(&self, mut shutdown: watch::Receiver<bool>) {
        let reconciler = self.reconciler.clone();
        let network = self.network.clone();
        let collections = self.collections.clone();
        // `interval` panics on a zero period.
        let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        if !network.is_online() {
                            debug!("offline, skipping scheduled pull");
                            continue;
                        }
                        reconciler.reconcile_all(&collections).await;
                    }
                }
            }
            debug!("reconcile cadence stopped");
        });
    }

    fn spawn_connectivity_listener(&self, mut shutdown: watch::Receiver<bool>) {
        let reconciler = self.reconciler.clone();
        let flusher = self.flusher.clone();
        let collections = self.collections.clone();
        let mut online = self.network.subscribe();
        online.borrow_and_update();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    changed = online.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        // Only flips are published, so seeing `true` here means
                        // the connection came back, however briefly it was gone.
                        if !*online.borrow_and_update() {
                            info!("connectivity lost, working offline");
                            continue;
                        }

                        info!("connectivity restored, syncing");
                        flusher.signal();
                        reconciler.reconcile_all(&collections).await;
                    }
                }
            }
            debug!("connectivity listener stopped");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_status_reports_changes_only() {
        let network = NetworkStatus::new(false);
        assert!(!network.is_online());
        assert!(network.set_online(true));
        assert!(!network.set_online(true));
        assert!(network.is_online());
    }

    #[tokio::test]
    async fn network_status_wakes_subscribers() {
        let network = NetworkStatus::new(false);
        let mut rx = network.subscribe();

        network.set_online(true);
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[test]
    fn session_serializes_camel_case() {
        let session = Session::new("u-1", "secret");
        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["userId"], "u-1");
    }
}
