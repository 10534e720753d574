//! Scheduler daemon
//!
//! Drives [`SyncEngine`] cycles from a fixed-interval timer and from manual
//! commands. Runs as a tokio event loop and shuts down gracefully on
//! SIGTERM/SIGINT or a [`SchedulerCommand::Shutdown`].

use super::engine::{CycleReport, SyncEngine, TenantFailure, Trigger};
use super::metrics;
use crate::ids::TenantId;
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

/// Default poll interval (5 minutes)
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(300);

/// Default event channel capacity
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Time between timer-driven cycles
    pub poll_interval: Duration,

    /// Run a cycle as soon as the daemon starts
    pub run_on_start: bool,

    /// Event broadcast channel capacity
    pub event_channel_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            run_on_start: true,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
        }
    }
}

impl SchedulerConfig {
    /// Set the poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set whether a cycle runs immediately on start
    pub fn with_run_on_start(mut self, run_on_start: bool) -> Self {
        self.run_on_start = run_on_start;
        self
    }
}

/// Events emitted by the scheduler
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    Started,
    Stopped,
    CycleStarted {
        trigger: Trigger,
        tenant: Option<TenantId>,
    },
    CycleCompleted {
        trigger: Trigger,
        report: CycleReport,
    },
    TenantFailed(TenantFailure),
}

/// Commands accepted by a running scheduler
#[derive(Debug)]
pub enum SchedulerCommand {
    /// Run a cycle now, for one tenant or all, without touching the timer
    RunNow {
        tenant: Option<TenantId>,
        reply: Option<oneshot::Sender<CycleReport>>,
    },

    /// Stop the daemon after in-flight cycles finish
    Shutdown,
}

enum CommandResult {
    Continue,
    Stop,
}

/// Handle for talking to a running scheduler
#[derive(Clone)]
pub struct SchedulerHandle {
    command_tx: mpsc::Sender<SchedulerCommand>,
}

impl SchedulerHandle {
    /// Trigger a cycle and wait for its report
    pub async fn run_now(&self, tenant: Option<TenantId>) -> Result<CycleReport> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(SchedulerCommand::RunNow {
                tenant,
                reply: Some(reply),
            })
            .await
            .map_err(|_| crate::HeraldError::Other("Scheduler is not running".to_string()))?;
        rx.await
            .map_err(|_| crate::HeraldError::Other("Scheduler stopped before replying".to_string()))
    }

    /// Ask the scheduler to stop
    pub async fn shutdown(&self) -> Result<()> {
        self.command_tx
            .send(SchedulerCommand::Shutdown)
            .await
            .map_err(|_| crate::HeraldError::Other("Scheduler is not running".to_string()))
    }
}

/// Timer plus manual-trigger driver for the sync engine
pub struct Scheduler {
    config: SchedulerConfig,
    engine: Arc<SyncEngine>,
    event_tx: broadcast::Sender<SchedulerEvent>,
    command_rx: Option<mpsc::Receiver<SchedulerCommand>>,
    command_tx: mpsc::Sender<SchedulerCommand>,
    manual_runs: JoinSet<()>,
    timer_run: JoinSet<()>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, engine: Arc<SyncEngine>) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_channel_capacity.max(1));
        let (command_tx, command_rx) = mpsc::channel(16);

        Self {
            config,
            engine,
            event_tx,
            command_rx: Some(command_rx),
            command_tx,
            manual_runs: JoinSet::new(),
            timer_run: JoinSet::new(),
        }
    }

    /// Get an event subscriber
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.event_tx.subscribe()
    }

    /// Get a handle for manual triggers and shutdown
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            command_tx: self.command_tx.clone(),
        }
    }

    fn send_event(&self, event: SchedulerEvent) {
        if self.event_tx.send(event).is_err() {
            tracing::trace!("Event sent but no receivers subscribed");
        }
    }

    /// Run the event loop until shutdown
    pub async fn run(&mut self) -> Result<()> {
        let mut command_rx = self
            .command_rx
            .take()
            .ok_or_else(|| crate::HeraldError::Other("Scheduler already running".to_string()))?;

        metrics::set_health_status(true);
        self.send_event(SchedulerEvent::Started);
        tracing::info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Scheduler started"
        );

        let mut interval = if self.config.run_on_start {
            tokio::time::interval(self.config.poll_interval)
        } else {
            tokio::time::interval_at(
                tokio::time::Instant::now() + self.config.poll_interval,
                self.config.poll_interval,
            )
        };
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        #[cfg(unix)]
        self.run_with_signals(&mut interval, &mut command_rx).await?;

        #[cfg(not(unix))]
        self.run_without_signals(&mut interval, &mut command_rx).await?;

        tracing::info!(
            in_flight = self.manual_runs.len() + self.timer_run.len(),
            "Waiting for in-flight cycles to finish"
        );
        while let Some(joined) = self.timer_run.join_next().await {
            log_join_error(joined);
        }
        while let Some(joined) = self.manual_runs.join_next().await {
            log_join_error(joined);
        }

        metrics::set_health_status(false);
        self.send_event(SchedulerEvent::Stopped);
        tracing::info!("Scheduler shutdown complete");
        Ok(())
    }

    /// Run event loop with Unix signal handling (SIGTERM/SIGINT)
    #[cfg(unix)]
    async fn run_with_signals(
        &mut self,
        interval: &mut tokio::time::Interval,
        command_rx: &mut mpsc::Receiver<SchedulerCommand>,
    ) -> Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate()).map_err(|e| {
            crate::HeraldError::Other(format!("Failed to set up SIGTERM handler: {}", e))
        })?;
        let mut sigint = signal(SignalKind::interrupt()).map_err(|e| {
            crate::HeraldError::Other(format!("Failed to set up SIGINT handler: {}", e))
        })?;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.spawn_timer_cycle();
                }
                cmd = command_rx.recv() => {
                    match self.handle_command(cmd) {
                        CommandResult::Continue => {}
                        CommandResult::Stop => break,
                    }
                }
                Some(joined) = self.manual_runs.join_next(), if !self.manual_runs.is_empty() => {
                    log_join_error(joined);
                }
                Some(joined) = self.timer_run.join_next(), if !self.timer_run.is_empty() => {
                    log_join_error(joined);
                }
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM, initiating graceful shutdown");
                    break;
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT, initiating graceful shutdown");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Run event loop without signal handling (non-Unix platforms)
    #[cfg(not(unix))]
    async fn run_without_signals(
        &mut self,
        interval: &mut tokio::time::Interval,
        command_rx: &mut mpsc::Receiver<SchedulerCommand>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.spawn_timer_cycle();
                }
                cmd = command_rx.recv() => {
                    match self.handle_command(cmd) {
                        CommandResult::Continue => {}
                        CommandResult::Stop => break,
                    }
                }
                Some(joined) = self.manual_runs.join_next(), if !self.manual_runs.is_empty() => {
                    log_join_error(joined);
                }
                Some(joined) = self.timer_run.join_next(), if !self.timer_run.is_empty() => {
                    log_join_error(joined);
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Received Ctrl-C, initiating graceful shutdown");
                    break;
                }
            }
        }
        Ok(())
    }

    fn handle_command(&mut self, cmd: Option<SchedulerCommand>) -> CommandResult {
        match cmd {
            Some(SchedulerCommand::RunNow { tenant, reply }) => {
                self.spawn_manual_cycle(tenant, reply);
                CommandResult::Continue
            }
            Some(SchedulerCommand::Shutdown) => {
                tracing::info!("Received shutdown command");
                CommandResult::Stop
            }
            // Every handle dropped; the scheduler itself keeps a sender, so this
            // only happens while tearing down
            None => CommandResult::Stop,
        }
    }

    /// Manual cycles run beside the timer; tenant locks keep them from
    /// overlapping a timer cycle on the same tenant
    fn spawn_manual_cycle(
        &mut self,
        tenant: Option<TenantId>,
        reply: Option<oneshot::Sender<CycleReport>>,
    ) {
        let engine = self.engine.clone();
        let event_tx = self.event_tx.clone();

        self.manual_runs.spawn(async move {
            let _ = event_tx.send(SchedulerEvent::CycleStarted {
                trigger: Trigger::Manual,
                tenant: tenant.clone(),
            });

            let report = engine.run_cycle(tenant.as_ref()).await;
            publish_report(&event_tx, Trigger::Manual, &report);

            if let Some(reply) = reply {
                if reply.send(report).is_err() {
                    tracing::debug!("Manual trigger requester went away before the report");
                }
            }
        });
    }

    /// At most one timer cycle is in flight; a tick that finds one running is skipped
    fn spawn_timer_cycle(&mut self) {
        if !self.timer_run.is_empty() {
            tracing::warn!("Previous timer cycle still running; skipping this tick");
            return;
        }

        self.send_event(SchedulerEvent::CycleStarted {
            trigger: Trigger::Timer,
            tenant: None,
        });
        let engine = self.engine.clone();
        let event_tx = self.event_tx.clone();

        self.timer_run.spawn(async move {
            let report = engine.run_scheduled_cycle().await;
            publish_report(&event_tx, Trigger::Timer, &report);
        });
    }
}

fn log_join_error(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        tracing::error!(error = %e, "Cycle task ended abnormally");
    }
}

fn publish_report(
    event_tx: &broadcast::Sender<SchedulerEvent>,
    trigger: Trigger,
    report: &CycleReport,
) {
    for failure in &report.failures {
        let _ = event_tx.send(SchedulerEvent::TenantFailed(failure.clone()));
    }
    let _ = event_tx.send(SchedulerEvent::CycleCompleted {
        trigger,
        report: report.clone(),
    });
}
