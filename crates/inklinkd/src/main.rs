//! inklinkd: keeps an E-ink companion device in sync.
//!
//! Usage: `inklinkd [content-file]`. The content file is the encoded day
//! pack; it is re-read before every sync and pushed whenever its
//! fingerprint changes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::{Local, Utc};

use inklink_core::config::InklinkConfig;
use inklink_core::wire::DeviceEvent;
use inklink_sync::{
    Inbound, LoopbackPeripheral, StateStore, SyncCoordinator, SyncInput, SyncOutcome,
};

/// Why the idle wait ended.
#[derive(Debug, PartialEq, Eq)]
enum Wake {
    Shutdown,
    ChannelClosed,
    Timer,
    Refresh,
    DeviceAwake,
}

/// Upper bound on one idle sleep, so content edits are noticed between
/// cadence syncs.
const CONTENT_POLL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = InklinkConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = InklinkConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        InklinkConfig::default()
    });

    let content_path = std::env::args().nth(1).map(PathBuf::from);
    tracing::info!(
        content = ?content_path,
        mode = ?config.security.mode(),
        "inklinkd starting"
    );

    // Persisted sync state
    let store = StateStore::new(&config.storage.state_path);
    let mut state = store.load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load sync state, starting fresh");
        Default::default()
    });
    tracing::info!(path = %store.path().display(), last_sync = ?state.last_sync, "sync state loaded");

    // Device link and coordinator
    let (device, notifications) = LoopbackPeripheral::new(
        config.link.default_max_write_len,
        config.security.shared_secret.as_deref(),
    );
    let device = Arc::new(device);
    let mut coordinator = SyncCoordinator::new(device, notifications, &config);

    // Shutdown signal
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    let mut force = false;
    let mut content: Option<Bytes> = None;
    loop {
        refresh_content(content_path.as_ref(), &mut content).await;

        let wait = match content.clone() {
            Some(content) => {
                let report = coordinator
                    .perform_sync(SyncInput {
                        now: Local::now().fixed_offset(),
                        content,
                        last_sync: state.last_sync,
                        last_fingerprint: state.last_fingerprint.clone(),
                        last_event_log_timestamp: state.last_event_log_timestamp,
                        force,
                    })
                    .await;

                if report.outcome != SyncOutcome::Skipped {
                    for message in &report.received {
                        tracing::info!(
                            type_tag = message.type_tag,
                            len = message.payload.len(),
                            "device event"
                        );
                    }
                    state.apply(&report);
                    if let Err(e) = store.save(&state) {
                        tracing::warn!(error = %e, "failed to persist sync state");
                    }
                }
                force = report.refresh_requested;
                if force {
                    tracing::info!("device requested refresh during sync");
                    continue;
                }

                let next = coordinator
                    .policy()
                    .next_sync_time(&Local::now(), state.last_sync);
                tracing::debug!(next = %next, "next cadence sync");
                match report.outcome {
                    SyncOutcome::Failed { .. } => CONTENT_POLL,
                    _ => (next - Utc::now())
                        .to_std()
                        .unwrap_or_default()
                        .min(CONTENT_POLL),
                }
            }
            None => CONTENT_POLL,
        };

        let wake = tokio::select! {
            _ = shutdown_rx.recv() => Wake::Shutdown,
            _ = tokio::time::sleep(wait) => Wake::Timer,
            inbound = coordinator.next_inbound() => classify(inbound),
        };

        match wake {
            Wake::Shutdown => {
                tracing::info!("shutting down");
                break;
            }
            Wake::ChannelClosed => {
                tracing::warn!("notification channel closed");
                break;
            }
            Wake::Timer => {}
            Wake::Refresh => {
                tracing::info!("device requested refresh");
                force = true;
            }
            Wake::DeviceAwake => {
                tracing::info!("device woke, resyncing time");
                // Errors are logged by the coordinator; the cadence sync runs regardless.
                let _ = coordinator.sync_time(Local::now().fixed_offset()).await;
            }
        }
    }

    Ok(())
}

/// Map a notification that arrived while idle to the daemon's next move.
fn classify(inbound: Option<Inbound>) -> Wake {
    match inbound {
        Some(Inbound::RefreshRequested) => Wake::Refresh,
        Some(Inbound::Message(message))
            if DeviceEvent::from_u8(message.type_tag) == Some(DeviceEvent::DeviceWake) =>
        {
            Wake::DeviceAwake
        }
        Some(other) => {
            tracing::debug!(?other, "notification outside sync");
            Wake::Timer
        }
        None => Wake::ChannelClosed,
    }
}

/// Re-read the content file. A failed read keeps the previous content.
async fn refresh_content(path: Option<&PathBuf>, content: &mut Option<Bytes>) {
    match read_content(path).await {
        Ok(latest) => *content = Some(latest),
        Err(e) => tracing::warn!(error = %e, "content unreadable, keeping last good copy"),
    }
}

async fn read_content(path: Option<&PathBuf>) -> Result<Bytes> {
    match path {
        Some(path) => {
            let data = tokio::fs::read(path)
                .await
                .with_context(|| format!("failed to read content file {}", path.display()))?;
            Ok(Bytes::from(data))
        }
        None => Ok(Bytes::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inklink_core::wire::ReceivedMessage;

    #[test]
    fn device_wake_triggers_time_sync() {
        let wake = Inbound::Message(ReceivedMessage::new(DeviceEvent::DeviceWake as u8, Bytes::new()));
        assert_eq!(classify(Some(wake)), Wake::DeviceAwake);
        assert_eq!(classify(Some(Inbound::RefreshRequested)), Wake::Refresh);
        let sleep = Inbound::Message(ReceivedMessage::new(DeviceEvent::DeviceSleep as u8, Bytes::new()));
        assert_eq!(classify(Some(sleep)), Wake::Timer);
        assert_eq!(classify(None), Wake::ChannelClosed);
    }

    #[tokio::test]
    async fn unreadable_content_keeps_last_copy() {
        let dir = std::env::temp_dir().join(format!("inklinkd-content-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("pack.bin");
        std::fs::write(&path, b"day pack v1").unwrap();

        let mut content = None;
        refresh_content(Some(&path), &mut content).await;
        assert_eq!(content.as_deref(), Some(&b"day pack v1"[..]));

        std::fs::remove_file(&path).unwrap();
        refresh_content(Some(&path), &mut content).await;
        assert_eq!(content.as_deref(), Some(&b"day pack v1"[..]));

        let missing = dir.join("never-written.bin");
        let mut fresh = None;
        refresh_content(Some(&missing), &mut fresh).await;
        assert_eq!(fresh, None);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
