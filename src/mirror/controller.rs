//! Replication Controller
//!
//! Public state machine for one mirrored volume. Serializes start and stop,
//! runs bootstrap, supervises the replay task and decides between resuming,
//! re-bootstrapping and giving up after a fault.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::bootstrap::{BootstrapCoordinator, Bootstrapped};
use super::commit::CommitTracker;
use super::replay::{ReplayCommand, ReplayEngine, ReplayExit};
use super::retry::RetryBudget;
use super::{ControllerState, MirrorEvent, MirrorStatus, Peer, StateCell};
use crate::config::ReplayerSettings;
use crate::error::{Error, Result};
use crate::volume::LocalPool;

/// Queue depth for flush requests
const COMMAND_CHANNEL_CAPACITY: usize = 16;

/// Handle to the supervised replay task
struct RunningReplay {
    cancel: CancellationToken,
    commands: mpsc::Sender<ReplayCommand>,
    task: JoinHandle<()>,
}

/// Replication controller for a single volume
pub struct ReplicationController {
    /// Remote side
    peer: Peer,
    /// Local pool holding the replica
    pool: Arc<dyn LocalPool>,
    /// Settings applied at the next bootstrap
    settings: RwLock<ReplayerSettings>,
    /// Current state and event fan-out
    state: Arc<StateCell>,
    /// Serializes start and stop
    transition: Mutex<()>,
    /// Cancellation for the in-flight start or the running replay
    cancel: Mutex<Option<CancellationToken>>,
    /// Running replay task
    running: Mutex<Option<RunningReplay>>,
    /// Global id learned at bootstrap
    global_id: RwLock<Option<String>>,
    /// Commit tracker of the last bootstrap
    tracker: RwLock<Option<Arc<CommitTracker>>>,
    /// Last failure, cleared by a successful start
    last_error: RwLock<Option<Error>>,
    /// Automatic recovery budget for replay faults
    fault_budget: Mutex<RetryBudget>,
}

impl ReplicationController {
    /// Create a stopped controller
    pub fn new(peer: Peer, pool: Arc<dyn LocalPool>, settings: ReplayerSettings) -> Arc<Self> {
        let fault_budget = RetryBudget::new(settings.fault_retry_limit, settings.fault_retry_window);
        Arc::new(Self {
            state: Arc::new(StateCell::new(peer.remote.name())),
            peer,
            pool,
            settings: RwLock::new(settings),
            transition: Mutex::new(()),
            cancel: Mutex::new(None),
            running: Mutex::new(None),
            global_id: RwLock::new(None),
            tracker: RwLock::new(None),
            last_error: RwLock::new(None),
            fault_budget: Mutex::new(fault_budget),
        })
    }

    /// Name of the mirrored volume
    pub fn volume_name(&self) -> &str {
        self.peer.remote.name()
    }

    /// Current state
    pub fn state(&self) -> ControllerState {
        self.state.get()
    }

    pub fn is_replaying(&self) -> bool {
        self.state.get().is_replaying()
    }

    pub fn is_stopped(&self) -> bool {
        self.state.get() == ControllerState::Stopped
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ControllerState> {
        self.state.subscribe_state()
    }

    /// Receive status events
    pub fn subscribe_events(&self) -> broadcast::Receiver<MirrorEvent> {
        self.state.subscribe_events()
    }

    /// Last failure surfaced by start or by the replay task
    pub async fn last_error(&self) -> Option<Error> {
        self.last_error.read().await.clone()
    }

    /// Replace the settings used from the next start on
    pub async fn update_settings(&self, settings: ReplayerSettings) {
        *self.fault_budget.lock().await =
            RetryBudget::new(settings.fault_retry_limit, settings.fault_retry_window);
        *self.settings.write().await = settings;
    }

    /// Commit tracker of the current replica, once bootstrapped
    pub async fn commit_tracker(&self) -> Option<Arc<CommitTracker>> {
        self.tracker.read().await.clone()
    }

    /// Begin or resume replication
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let _transition = self.transition.lock().await;

        {
            let mut running = self.running.lock().await;
            if let Some(current) = running.as_ref() {
                if !current.task.is_finished() && self.state.get() != ControllerState::Stopped {
                    tracing::debug!("Volume '{}' is already replaying", self.volume_name());
                    return Ok(());
                }
            }
            // a replay task that ended on its own
            if let Some(stale) = running.take() {
                stale.cancel.cancel();
                if let Err(e) = stale.task.await {
                    tracing::warn!("Replay task of '{}' failed: {}", self.volume_name(), e);
                }
            }
        }

        let cancel = CancellationToken::new();
        *self.cancel.lock().await = Some(cancel.clone());
        *self.last_error.write().await = None;
        self.fault_budget.lock().await.reset();
        self.state.set(ControllerState::Starting);
        tracing::info!(
            "Starting replication of '{}' from {}",
            self.volume_name(),
            self.peer.cluster_name
        );

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = self.bootstrap() => result,
        };

        let boot = match result {
            Ok(boot) => boot,
            Err(e) => {
                self.cancel.lock().await.take();
                if e.is_cancelled() {
                    tracing::info!("Start of '{}' cancelled by stop", self.volume_name());
                } else {
                    tracing::error!("Start of '{}' failed: {}", self.volume_name(), e);
                    *self.last_error.write().await = Some(e.clone());
                }
                self.state.set(ControllerState::Stopped);
                return Err(e);
            }
        };

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        self.state.set(ControllerState::Replaying);
        let task = tokio::spawn(Arc::clone(self).supervise(boot, cancel.clone(), commands_rx));
        *self.running.lock().await = Some(RunningReplay {
            cancel,
            commands: commands_tx,
            task,
        });
        Ok(())
    }

    /// Stop replication; always succeeds
    pub async fn stop(&self) -> Result<()> {
        // cancel first so an in-flight start gives up the transition lock
        if let Some(cancel) = self.cancel.lock().await.take() {
            cancel.cancel();
        }

        let _transition = self.transition.lock().await;
        let running = self.running.lock().await.take();
        if let Some(running) = running {
            if !running.task.is_finished() {
                self.state.set(ControllerState::Stopping);
            }
            running.cancel.cancel();
            if let Err(e) = running.task.await {
                tracing::warn!("Replay task of '{}' failed: {}", self.volume_name(), e);
            }
        }

        self.state.set(ControllerState::Stopped);
        Ok(())
    }

    /// Commit everything applied so far, ignoring the mirroring delay
    pub async fn flush(&self) -> Result<()> {
        let commands = match self.running.lock().await.as_ref() {
            Some(running) => running.commands.clone(),
            None => return Ok(()),
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if commands.send(ReplayCommand::Flush(reply_tx)).await.is_err() {
            return Ok(());
        }
        // a dropped reply means replay ended and there is nothing to flush
        reply_rx.await.unwrap_or(Ok(()))
    }

    /// True when the replica has committed everything the primary acknowledged
    pub async fn caught_up(&self) -> Result<bool> {
        match self.commit_tracker().await {
            Some(tracker) => tracker.caught_up().await,
            None => Ok(false),
        }
    }

    /// Point-in-time status
    pub async fn status(&self) -> MirrorStatus {
        let last_error = self.last_error().await;
        let lag = match self.commit_tracker().await {
            Some(tracker) => tracker.lag().await.ok(),
            None => None,
        };

        MirrorStatus {
            volume: self.volume_name().to_string(),
            peer: self.peer.cluster_name.clone(),
            global_id: self.global_id.read().await.clone(),
            state: self.state.get(),
            last_error: last_error.as_ref().map(|e| e.to_string()),
            last_error_kind: last_error.as_ref().map(|e| e.kind()),
            replica_position: lag.map(|l| l.replica),
            primary_position: lag.map(|l| l.primary),
            entries_behind: lag.map(|l| l.entries_behind),
        }
    }

    async fn bootstrap(&self) -> Result<Bootstrapped> {
        if !self.state.set_unless_stopping(ControllerState::Bootstrapping) {
            return Err(Error::Cancelled);
        }
        let resync_after_disconnect = self.settings.read().await.resync_after_disconnect;

        let coordinator = BootstrapCoordinator::new(
            Arc::clone(&self.peer.remote),
            Arc::clone(&self.pool),
            &self.peer.local_mirror_uuid,
            resync_after_disconnect,
        );
        let boot = coordinator.run().await?;

        *self.global_id.write().await = Some(boot.global_id.clone());
        *self.tracker.write().await = Some(Arc::clone(&boot.tracker));
        if boot.resynced {
            self.state.emit(MirrorEvent::Resynced {
                global_id: boot.global_id.clone(),
            });
        }
        Ok(boot)
    }

    /// Run replay, recovering from faults within the retry budget
    async fn supervise(
        self: Arc<Self>,
        mut boot: Bootstrapped,
        cancel: CancellationToken,
        mut commands: mpsc::Receiver<ReplayCommand>,
    ) {
        loop {
            let settings = self.settings.read().await.clone();
            let engine = ReplayEngine::new(
                Arc::clone(&boot.volume),
                Arc::clone(&boot.journal),
                Arc::clone(&boot.tracker),
                boot.start_position,
                settings.clone(),
                Arc::clone(&self.state),
                cancel.clone(),
            );

            match engine.run(&mut commands).await {
                ReplayExit::Stopped => return,
                ReplayExit::ResyncRequested => {
                    tracing::info!(
                        "Replay of '{}' stopped for resync, next start rebuilds the replica",
                        self.volume_name()
                    );
                    self.finish(None).await;
                    return;
                }
                ReplayExit::Disconnected => {
                    self.finish(Some(Error::NotConnected(format!(
                        "registration '{}' for volume '{}' was disconnected",
                        self.peer.local_mirror_uuid,
                        self.volume_name()
                    ))))
                    .await;
                    return;
                }
                ReplayExit::Fault(error) => {
                    let recovering = self.fault_budget.lock().await.record_failure(Instant::now());
                    self.state.emit(MirrorEvent::Fault {
                        error: error.clone(),
                        recovering,
                    });
                    if !recovering {
                        tracing::error!(
                            "Replay of '{}' faulted, retry budget exhausted: {}",
                            self.volume_name(),
                            error
                        );
                        self.finish(Some(error)).await;
                        return;
                    }

                    tracing::warn!(
                        "Replay of '{}' faulted, re-bootstrapping: {}",
                        self.volume_name(),
                        error
                    );
                    *self.last_error.write().await = Some(error);

                    let result = tokio::select! {
                        _ = cancel.cancelled() => return,
                        result = async {
                            tokio::time::sleep(settings.fault_retry_delay).await;
                            self.bootstrap().await
                        } => result,
                    };
                    match result {
                        Ok(next) => {
                            if !self.state.set_unless_stopping(ControllerState::Replaying) {
                                return;
                            }
                            boot = next;
                        }
                        Err(e) if e.is_cancelled() => return,
                        Err(e) => {
                            tracing::error!(
                                "Re-bootstrap of '{}' failed: {}",
                                self.volume_name(),
                                e
                            );
                            self.finish(Some(e)).await;
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Record how replay ended and settle in STOPPED
    async fn finish(&self, error: Option<Error>) {
        if let Some(error) = error {
            *self.last_error.write().await = Some(error);
        }
        self.cancel.lock().await.take();
        self.state.set(ControllerState::Stopped);
    }
}
