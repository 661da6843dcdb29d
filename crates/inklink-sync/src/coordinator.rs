//! Sync coordinator: one sync cycle against the companion device.
//!
//! ```text
//! Idle → Connecting → TimeSyncing → (Pushing) → Pulling → Idle | Failed
//! ```
//!
//! The coordinator never persists anything. It takes the caller's last
//! sync state in `SyncInput` and hands back what to persist in the
//! `SyncReport`. `perform_sync` takes `&mut self`, so two syncs can never
//! overlap on one coordinator.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, FixedOffset, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

use inklink_core::chunk::ChunkAssembler;
use inklink_core::config::InklinkConfig;
use inklink_core::security::{SecurityError, SecurityManager, SecurityMode};
use inklink_core::wire::{self, DataType, ReceivedMessage};

use crate::inbound::{Inbound, InboundRouter};
use crate::link::{DeviceLink, LinkError};
use crate::outbound::{OutboundWriter, SendError};
use crate::policy::SyncPolicy;
use crate::qos::RateLimiter;

// ── Inputs & Report ───────────────────────────────────────────────────────────

/// Everything a sync needs from its caller.
#[derive(Debug, Clone)]
pub struct SyncInput {
    /// Local wall-clock time. Drives the time-sync payload and the cadence.
    pub now: DateTime<FixedOffset>,
    /// Encoded day pack to push when it differs from the last one pushed.
    pub content: Bytes,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_fingerprint: Option<String>,
    pub last_event_log_timestamp: u32,
    /// Bypass the cadence policy.
    pub force: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStage {
    Connect,
    TimeSync,
    Push,
    Pull,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error(transparent)]
    Send(#[from] SendError),

    #[error("no handshake response within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("notification channel closed")]
    ChannelClosed,

    #[error("sync exceeded watchdog timeout of {0:?}")]
    Watchdog(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The policy said no sync was due.
    Skipped,
    Completed,
    Failed { stage: SyncStage, error: SyncError },
}

/// Result of one `perform_sync` call. Whether the sync succeeded and
/// whether content was pushed are reported separately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub outcome: SyncOutcome,
    pub content_pushed: bool,
    /// Some only when the content was pushed.
    pub fingerprint_to_persist: Option<String>,
    /// Some only when the outcome is `Completed`.
    pub completed_at: Option<DateTime<Utc>>,
    pub connect_attempts: u32,
    pub push_attempts: u32,
    /// Messages routed while connected, in arrival order.
    pub received: Vec<ReceivedMessage>,
    /// The device asked for a refresh while connected.
    pub refresh_requested: bool,
}

impl SyncReport {
    fn skipped() -> Self {
        Self {
            outcome: SyncOutcome::Skipped,
            content_pushed: false,
            fingerprint_to_persist: None,
            completed_at: None,
            connect_attempts: 0,
            push_attempts: 0,
            received: Vec::new(),
            refresh_requested: false,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.outcome == SyncOutcome::Completed
    }
}

// ── Options ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    pub watchdog_timeout: Duration,
    pub connect_attempts: u32,
    pub connect_backoff: Vec<Duration>,
    pub push_attempts: u32,
    pub push_backoff: Vec<Duration>,
    pub pull_window: Duration,
    pub handshake_timeout: Duration,
}

impl SyncOptions {
    pub fn from_config(config: &InklinkConfig) -> Self {
        Self {
            watchdog_timeout: config.sync.watchdog_timeout(),
            connect_attempts: config.sync.connect_attempts.max(1),
            connect_backoff: config.sync.connect_backoff(),
            push_attempts: config.sync.push_attempts.max(1),
            push_backoff: config.sync.push_backoff(),
            pull_window: config.sync.pull_window(),
            handshake_timeout: config.security.handshake_timeout(),
        }
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::from_config(&InklinkConfig::default())
    }
}

/// Delay after failed attempt `index` (zero-based). Schedules shorter
/// than the attempt count reuse their last entry.
pub fn backoff_delay(schedule: &[Duration], index: usize) -> Duration {
    schedule
        .get(index)
        .or_else(|| schedule.last())
        .copied()
        .unwrap_or_default()
}

// ── Progress ──────────────────────────────────────────────────────────────────

/// Bookkeeping that must survive the stage future being dropped by the
/// watchdog.
struct Progress {
    stage: SyncStage,
    connect_attempts: u32,
    push_attempts: u32,
    content_pushed: bool,
    received: Vec<ReceivedMessage>,
    refresh_requested: bool,
}

impl Progress {
    fn new() -> Self {
        Self {
            stage: SyncStage::Connect,
            connect_attempts: 0,
            push_attempts: 0,
            content_pushed: false,
            received: Vec::new(),
            refresh_requested: false,
        }
    }

    fn record(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Message(message) => self.received.push(message),
            Inbound::RefreshRequested => self.refresh_requested = true,
            Inbound::HandshakeResponse(_) => {
                tracing::debug!("ignoring unsolicited handshake response");
            }
        }
    }
}

// ── Disconnect guard ──────────────────────────────────────────────────────────

/// Disconnects the link if a sync future is dropped before it finishes.
/// Disarmed once the sync has disconnected normally.
struct DisconnectGuard {
    link: Option<Arc<dyn DeviceLink>>,
}

impl DisconnectGuard {
    fn arm(link: Arc<dyn DeviceLink>) -> Self {
        Self { link: Some(link) }
    }

    fn disarm(mut self) {
        self.link = None;
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!("sync cancelled, disconnecting");
                handle.spawn(async move { link.disconnect().await });
            }
            Err(_) => tracing::warn!("sync cancelled outside a runtime, link left connected"),
        }
    }
}

// ── Coordinator ───────────────────────────────────────────────────────────────

pub struct SyncCoordinator {
    link: Arc<dyn DeviceLink>,
    notifications: mpsc::Receiver<Bytes>,
    writer: OutboundWriter,
    router: InboundRouter,
    security: SecurityManager,
    mode: SecurityMode,
    policy: SyncPolicy,
    options: SyncOptions,
}

impl SyncCoordinator {
    pub fn new(
        link: Arc<dyn DeviceLink>,
        notifications: mpsc::Receiver<Bytes>,
        config: &InklinkConfig,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(
            config.link.max_writes_per_second,
            config.link.refresh_min_interval(),
        ));
        let mode = config.security.mode();
        let security = SecurityManager::new(config.security.shared_secret.as_deref())
            .with_clock_skew(config.security.clock_skew_secs);

        Self {
            writer: OutboundWriter::new(link.clone(), limiter.clone()),
            router: InboundRouter::new(
                ChunkAssembler::with_timeout(config.link.assembly_timeout()),
                limiter,
                mode,
            ),
            link,
            notifications,
            security,
            mode,
            policy: SyncPolicy::from_config(&config.sync),
            options: SyncOptions::from_config(config),
        }
    }

    /// Replace the security manager, e.g. to inject a clock.
    pub fn with_security(mut self, security: SecurityManager) -> Self {
        self.security = security;
        self
    }

    pub fn mode(&self) -> SecurityMode {
        self.mode
    }

    pub fn policy(&self) -> &SyncPolicy {
        &self.policy
    }

    /// Run one sync cycle. Never fails; problems are reported in the
    /// outcome. The link is always disconnected on return.
    pub async fn perform_sync(&mut self, input: SyncInput) -> SyncReport {
        let fingerprint = wire::fingerprint(&input.content);
        let content_changed = input.last_fingerprint.as_deref() != Some(fingerprint.as_str());

        if !self
            .policy
            .should_sync(&input.now, input.last_sync, content_changed, input.force)
        {
            tracing::debug!("sync not due and content unchanged, skipping");
            return SyncReport::skipped();
        }

        tracing::info!(content_changed, force = input.force, "sync starting");
        // A cancelled earlier sync may have left a session behind.
        self.security.reset_session();
        let guard = DisconnectGuard::arm(self.link.clone());
        let started = Instant::now();
        let watchdog = self.options.watchdog_timeout;
        let mut progress = Progress::new();

        // Dropping the sleep cancels the watchdog on every exit path.
        let finished = tokio::select! {
            result = self.run_stages(&input, content_changed, &mut progress) => Some(result),
            _ = tokio::time::sleep(watchdog) => None,
        };

        let outcome = match finished {
            Some(Ok(())) => SyncOutcome::Completed,
            Some(Err((stage, error))) => SyncOutcome::Failed { stage, error },
            None => {
                tracing::warn!(stage = ?progress.stage, ?watchdog, "sync watchdog fired, forcing disconnect");
                SyncOutcome::Failed {
                    stage: progress.stage,
                    error: SyncError::Watchdog(watchdog),
                }
            }
        };

        self.link.disconnect().await;
        self.security.reset_session();
        guard.disarm();

        let elapsed = started.elapsed();
        let completed_at = (outcome == SyncOutcome::Completed).then(|| {
            input.now.with_timezone(&Utc)
                + chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero())
        });

        match &outcome {
            SyncOutcome::Completed => tracing::info!(
                content_pushed = progress.content_pushed,
                received = progress.received.len(),
                elapsed_ms = elapsed.as_millis() as u64,
                "sync completed"
            ),
            SyncOutcome::Failed { stage, error } => {
                tracing::warn!(?stage, error = %error, "sync failed")
            }
            SyncOutcome::Skipped => {}
        }

        SyncReport {
            outcome,
            content_pushed: progress.content_pushed,
            fingerprint_to_persist: progress.content_pushed.then_some(fingerprint),
            completed_at,
            connect_attempts: progress.connect_attempts,
            push_attempts: progress.push_attempts,
            received: progress.received,
            refresh_requested: progress.refresh_requested,
        }
    }

    /// Connect, write the current time and disconnect, bounded by the
    /// watchdog. Used when the device reports waking between syncs.
    pub async fn sync_time(&mut self, now: DateTime<FixedOffset>) -> Result<(), SyncError> {
        self.security.reset_session();
        let guard = DisconnectGuard::arm(self.link.clone());
        let watchdog = self.options.watchdog_timeout;
        let mut progress = Progress::new();

        let result = tokio::time::timeout(watchdog, self.connect_and_send_time(&now, &mut progress))
            .await
            .unwrap_or(Err(SyncError::Watchdog(watchdog)));

        self.link.disconnect().await;
        self.security.reset_session();
        guard.disarm();

        match &result {
            Ok(()) => tracing::info!(attempts = progress.connect_attempts, "time synced"),
            Err(e) => tracing::warn!(error = %e, "time sync failed"),
        }
        result
    }

    async fn connect_and_send_time(
        &mut self,
        now: &DateTime<FixedOffset>,
        progress: &mut Progress,
    ) -> Result<(), SyncError> {
        self.connect_with_retry(progress).await?;
        self.send(DataType::Time, &wire::time_payload(now)).await?;
        Ok(())
    }

    /// Wait for the next routed notification outside a sync, e.g. a
    /// device-initiated refresh. None once the link's channel closes.
    pub async fn next_inbound(&mut self) -> Option<Inbound> {
        loop {
            let notification = self.notifications.recv().await?;
            if let Some(inbound) = self.router.route(&notification, &mut self.security).await {
                return Some(inbound);
            }
        }
    }

    async fn run_stages(
        &mut self,
        input: &SyncInput,
        content_changed: bool,
        progress: &mut Progress,
    ) -> Result<(), (SyncStage, SyncError)> {
        progress.stage = SyncStage::Connect;
        self.connect_with_retry(progress)
            .await
            .map_err(|e| (SyncStage::Connect, e))?;

        progress.stage = SyncStage::TimeSync;
        let time = wire::time_payload(&input.now);
        self.send(DataType::Time, &time)
            .await
            .map_err(|e| (SyncStage::TimeSync, SyncError::from(e)))?;
        tracing::info!("time synced");

        if content_changed {
            progress.stage = SyncStage::Push;
            self.push_with_retry(&input.content, progress).await;
        }

        progress.stage = SyncStage::Pull;
        if let Err(e) = self
            .pull_event_logs(input.last_event_log_timestamp, progress)
            .await
        {
            tracing::warn!(error = %e, "event log pull failed");
        }

        Ok(())
    }

    async fn send(&mut self, data_type: DataType, payload: &[u8]) -> Result<(), SendError> {
        let security = match self.mode {
            SecurityMode::Secure => Some(&self.security),
            SecurityMode::Compatibility => None,
        };
        self.writer.send(data_type, payload, security).await
    }

    async fn connect_with_retry(&mut self, progress: &mut Progress) -> Result<(), SyncError> {
        let attempts = self.options.connect_attempts.max(1);
        let mut last_error = SyncError::Link(LinkError::NotConnected);

        for attempt in 1..=attempts {
            progress.connect_attempts = attempt;
            tracing::info!(attempt, "connecting");

            match self.connect_once(progress).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "connect attempt failed");
                    self.link.disconnect().await;
                    self.security.reset_session();
                    if attempt < attempts {
                        let delay = backoff_delay(&self.options.connect_backoff, (attempt - 1) as usize);
                        tokio::time::sleep(delay).await;
                    }
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    async fn connect_once(&mut self, progress: &mut Progress) -> Result<(), SyncError> {
        self.link.connect().await?;
        if self.mode == SecurityMode::Secure {
            self.handshake(progress).await?;
        }
        Ok(())
    }

    async fn handshake(&mut self, progress: &mut Progress) -> Result<(), SyncError> {
        let request = self.security.make_handshake_request()?;
        self.writer.send_handshake_request(&request).await?;

        let timeout = self.options.handshake_timeout;
        tokio::time::timeout(timeout, self.await_handshake_response(progress))
            .await
            .map_err(|_| SyncError::HandshakeTimeout(timeout))?
    }

    async fn await_handshake_response(&mut self, progress: &mut Progress) -> Result<(), SyncError> {
        loop {
            let notification = self
                .notifications
                .recv()
                .await
                .ok_or(SyncError::ChannelClosed)?;

            match self.router.route(&notification, &mut self.security).await {
                Some(Inbound::HandshakeResponse(response)) => {
                    match self.security.validate_handshake_response(&response) {
                        Ok(()) => return Ok(()),
                        // Left over from an earlier attempt.
                        Err(SecurityError::NonceMismatch) => {
                            tracing::debug!("ignoring stale handshake response");
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                Some(other) => progress.record(other),
                None => {}
            }
        }
    }

    async fn push_with_retry(&mut self, content: &[u8], progress: &mut Progress) {
        let attempts = self.options.push_attempts.max(1);

        for attempt in 1..=attempts {
            progress.push_attempts = attempt;
            match self.send(DataType::DayPack, content).await {
                Ok(()) => {
                    progress.content_pushed = true;
                    tracing::info!(attempt, len = content.len(), "content pushed");
                    return;
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "content push failed");
                    if attempt < attempts {
                        let delay = backoff_delay(&self.options.push_backoff, (attempt - 1) as usize);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        tracing::warn!("content push abandoned, fingerprint not advanced");
    }

    async fn pull_event_logs(&mut self, since: u32, progress: &mut Progress) -> Result<(), SyncError> {
        let request = wire::event_log_request_payload(since);
        self.send(DataType::EventLogRequest, &request).await?;
        tracing::debug!(since, "event log requested");

        let window = self.options.pull_window;
        loop {
            match tokio::time::timeout(window, self.notifications.recv()).await {
                Ok(Some(notification)) => {
                    if let Some(inbound) = self.router.route(&notification, &mut self.security).await {
                        progress.record(inbound);
                    }
                }
                Ok(None) => return Err(SyncError::ChannelClosed),
                Err(_) => return Ok(()),
            }
        }
    }
}
