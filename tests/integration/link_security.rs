//! Secure-mode behaviour end to end and at the manager boundary.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::Result;
use inklink_core::config::InklinkConfig;
use inklink_core::security::{SecurityError, SecurityManager, SecurityMode};
use inklink_core::wire::DeviceEvent;
use inklink_sync::{LoopbackPeripheral, SyncCoordinator, SyncOutcome, SyncStage};

use crate::*;

fn established() -> Result<(SecurityManager, SecurityManager)> {
    let mut phone = SecurityManager::new(Some(SECRET));
    let mut device = SecurityManager::new(Some(SECRET));
    let request = phone.make_handshake_request()?;
    let response = device.accept_handshake_request(&request)?;
    phone.validate_handshake_response(&response)?;
    Ok((phone, device))
}

/// With a shared secret every message crosses the link sealed and the
/// device still sees the original types and payloads.
#[tokio::test(start_paused = true)]
async fn test_secure_sync() -> Result<()> {
    let mut rig = Rig::new(Some(SECRET));
    assert_eq!(rig.coordinator.mode(), SecurityMode::Secure);
    rig.device.queue_event(DeviceEvent::CompleteTask, &b"task-7"[..]);

    let content = b"secure pack: 10:00 review, 16:00 gym";
    let report = rig.sync(local(10, 10, 0)?, content, false).await;

    assert_eq!(report.outcome, SyncOutcome::Completed);
    assert!(report.content_pushed);
    assert_eq!(rig.device.received_types(), vec![0x05, 0x10, 0x20]);
    assert_eq!(rig.device.received()[1].payload.as_ref(), content);
    assert_eq!(report.received.len(), 1);
    assert_eq!(report.received[0].type_tag, DeviceEvent::CompleteTask as u8);
    assert_eq!(report.received[0].payload.as_ref(), b"task-7");
    Ok(())
}

/// A device holding a different key never establishes a session, so no
/// application data is sent.
#[tokio::test(start_paused = true)]
async fn test_mismatched_secrets_never_connect() -> Result<()> {
    let mut config = InklinkConfig::default();
    config.security.shared_secret = Some(SECRET.into());
    let (device, notifications) = LoopbackPeripheral::new(17, Some("a-different-secret"));
    let device = Arc::new(device);
    let mut coordinator = SyncCoordinator::new(device.clone(), notifications, &config);

    let report = coordinator
        .perform_sync(inklink_sync::SyncInput {
            now: local(11, 9, 0)?,
            content: bytes::Bytes::from_static(b"pack"),
            last_sync: None,
            last_fingerprint: None,
            last_event_log_timestamp: 0,
            force: false,
        })
        .await;

    assert!(matches!(
        report.outcome,
        SyncOutcome::Failed {
            stage: SyncStage::Connect,
            ..
        }
    ));
    assert_eq!(report.connect_attempts, 3);
    assert!(!report.content_pushed);
    assert!(device.received().is_empty());
    Ok(())
}

#[test]
fn test_replayed_envelope_rejected() -> Result<()> {
    let (mut phone, device) = established()?;
    let sealed = device.secure_payload(DeviceEvent::LowBattery as u8, &[18])?;

    let opened = phone.open_secure_payload(&sealed)?;
    assert_eq!(opened.payload.as_ref(), &[18]);
    assert_eq!(
        phone.open_secure_payload(&sealed),
        Err(SecurityError::ReplayDetected)
    );
    Ok(())
}

#[test]
fn test_tampered_envelope_rejected() -> Result<()> {
    let (mut phone, device) = established()?;
    let mut sealed = device.secure_payload(0x11, b"task-3")?.to_vec();
    // Flip a payload byte; the header still parses.
    sealed[16] ^= 0x01;
    assert_eq!(
        phone.open_secure_payload(&sealed),
        Err(SecurityError::SignatureMismatch)
    );
    Ok(())
}

#[test]
fn test_skewed_device_clock_rejects_handshake() -> Result<()> {
    let phone_clock = Arc::new(AtomicU32::new(1_800_000_000));
    let device_clock = Arc::new(AtomicU32::new(1_800_000_000 + 600));

    let mut phone = SecurityManager::new(Some(SECRET)).with_clock({
        let c = phone_clock.clone();
        move || c.load(Ordering::SeqCst)
    });
    let mut device = SecurityManager::new(Some(SECRET)).with_clock({
        let c = device_clock.clone();
        move || c.load(Ordering::SeqCst)
    });

    let request = phone.make_handshake_request()?;
    assert!(matches!(
        device.accept_handshake_request(&request),
        Err(SecurityError::TimestampOutOfWindow { .. })
    ));

    // Within the window the same pair succeeds.
    device_clock.store(1_800_000_000 + 60, Ordering::SeqCst);
    let request = phone.make_handshake_request()?;
    let response = device.accept_handshake_request(&request)?;
    phone.validate_handshake_response(&response)?;
    assert!(phone.is_session_established());
    Ok(())
}

#[test]
fn test_compatibility_mode_without_secret() {
    assert_eq!(SecurityMode::from_secret(None), SecurityMode::Compatibility);
    assert_eq!(SecurityMode::from_secret(Some("")), SecurityMode::Compatibility);
    assert_eq!(SecurityMode::from_secret(Some(SECRET)), SecurityMode::Secure);
    let manager = SecurityManager::new(None);
    assert_eq!(
        manager.secure_payload(0x05, &[0; 6]),
        Err(SecurityError::SessionNotEstablished)
    );
}
