//! Multi-sync scenarios: cadence, content changes, persisted state.

use anyhow::{Context, Result};
use bytes::Bytes;
use inklink_core::wire::{self, DeviceEvent};
use inklink_sync::{SyncOutcome, SyncState};

use crate::*;

const PACK_A: &[u8] = b"07:30 stretch | 09:00 standup | 13:00 lunch with Ada";
const PACK_B: &[u8] = b"07:30 stretch | 09:00 standup | 15:00 dentist";

/// A day of syncing: content changes push immediately, unchanged content
/// follows the hourly cadence by day and four-hourly by night.
#[tokio::test(start_paused = true)]
async fn test_cadence_over_a_day() -> Result<()> {
    let mut rig = Rig::new(None);

    let report = rig.sync(local(1, 10, 0)?, PACK_A, false).await;
    assert!(report.is_completed());
    assert!(report.content_pushed);

    let report = rig.sync(local(1, 10, 20)?, PACK_A, false).await;
    assert_eq!(report.outcome, SyncOutcome::Skipped);

    let report = rig.sync(local(1, 10, 25)?, PACK_B, false).await;
    assert!(report.content_pushed, "changed content bypasses cadence");

    let report = rig.sync(local(1, 11, 30)?, PACK_B, false).await;
    assert!(report.is_completed(), "hourly sync is due");
    assert!(!report.content_pushed);

    let report = rig.sync(local(1, 23, 30)?, PACK_B, false).await;
    assert!(report.is_completed());

    let report = rig.sync(local(2, 1, 0)?, PACK_B, false).await;
    assert_eq!(report.outcome, SyncOutcome::Skipped, "night interval is four hours");

    let report = rig.sync(local(2, 3, 31)?, PACK_B, false).await;
    assert!(report.is_completed());

    let pushed: Vec<_> = rig
        .device
        .received()
        .into_iter()
        .filter(|m| m.type_tag == 0x10)
        .map(|m| m.payload)
        .collect();
    assert_eq!(pushed, vec![Bytes::from_static(PACK_A), Bytes::from_static(PACK_B)]);
    assert_eq!(rig.state.last_fingerprint, Some(wire::fingerprint(PACK_B)));
    Ok(())
}

/// State saved after a sync keeps a restarted daemon from re-pushing.
#[tokio::test(start_paused = true)]
async fn test_state_survives_restart() -> Result<()> {
    let store = temp_store("restart");
    let mut rig = Rig::new(None);
    let report = rig.sync(local(3, 9, 0)?, PACK_A, false).await;
    assert!(report.content_pushed);
    store.save(&rig.state).context("saving state")?;

    let mut restarted = Rig::new(None);
    restarted.state = store.load().context("loading state")?;
    assert_eq!(restarted.state, rig.state);

    let report = restarted.sync(local(3, 9, 10)?, PACK_A, false).await;
    assert_eq!(report.outcome, SyncOutcome::Skipped);
    assert_eq!(restarted.device.connect_count(), 0);

    if let Some(dir) = store.path().parent() {
        let _ = std::fs::remove_dir_all(dir);
    }
    Ok(())
}

/// The event-log cursor advances only after the device returned a batch,
/// and the next request carries it.
#[tokio::test(start_paused = true)]
async fn test_event_log_cursor() -> Result<()> {
    let mut rig = Rig::new(None);

    rig.sync(local(4, 12, 0)?, PACK_A, false).await;
    assert_eq!(rig.state.last_event_log_timestamp, 0);

    rig.device
        .queue_event(DeviceEvent::EventLogBatch, vec![0x11, 0x00, 0x2a]);
    let report = rig.sync(local(4, 12, 5)?, PACK_A, true).await;
    let completed_at = report.completed_at.context("sync did not complete")?;
    assert_eq!(
        rig.state.last_event_log_timestamp,
        u32::try_from(completed_at.timestamp())?
    );

    rig.sync(local(4, 12, 10)?, PACK_A, true).await;
    let requests: Vec<_> = rig
        .device
        .received()
        .into_iter()
        .filter(|m| m.type_tag == 0x20)
        .collect();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[0].payload.as_ref(), &0u32.to_be_bytes());
    assert_eq!(
        requests[2].payload.as_ref(),
        &rig.state.last_event_log_timestamp.to_be_bytes()
    );
    Ok(())
}

/// A refresh requested mid-sync is reported so the caller can force the
/// next sync.
#[tokio::test(start_paused = true)]
async fn test_refresh_forces_follow_up_sync() -> Result<()> {
    let mut rig = Rig::new(None);
    rig.device.queue_event(DeviceEvent::RequestRefresh, Bytes::new());

    let report = rig.sync(local(5, 8, 30)?, PACK_A, false).await;
    assert!(report.refresh_requested);

    let follow_up = rig.sync(local(5, 8, 31)?, PACK_A, report.refresh_requested).await;
    assert!(follow_up.is_completed());
    assert!(!follow_up.content_pushed);
    assert_eq!(rig.device.connect_count(), 2);
    Ok(())
}

/// Failed syncs leave the persisted state untouched.
#[tokio::test(start_paused = true)]
async fn test_failed_sync_keeps_state() -> Result<()> {
    let mut rig = Rig::new(None);
    rig.device.refuse_connects(true);

    let report = rig.sync(local(6, 14, 0)?, PACK_A, false).await;
    assert!(matches!(report.outcome, SyncOutcome::Failed { .. }));
    assert_eq!(rig.state, SyncState::default());

    rig.device.refuse_connects(false);
    let report = rig.sync(local(6, 14, 1)?, PACK_A, false).await;
    assert!(report.content_pushed);
    Ok(())
}
