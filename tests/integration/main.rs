//! inklink integration test harness.
//!
//! Every test drives the real sync stack against the in-process
//! `LoopbackPeripheral`, so nothing here needs a radio:
//!
//!   cargo test --test integration
//!
//! Tests that involve backoff or timeouts run on a paused tokio clock.

use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::{DateTime, FixedOffset, TimeZone};

use inklink_core::config::InklinkConfig;
use inklink_sync::{LoopbackPeripheral, StateStore, SyncCoordinator, SyncInput, SyncState};

// ── Harness ───────────────────────────────────────────────────────────────────

pub const SECRET: &str = "aW5rbGluay1pbnRlZ3JhdGlvbi1rZXk=";

/// A coordinator wired to a fresh loopback device.
pub struct Rig {
    pub device: Arc<LoopbackPeripheral>,
    pub coordinator: SyncCoordinator,
    pub state: SyncState,
}

impl Rig {
    pub fn new(secret: Option<&str>) -> Self {
        let mut config = InklinkConfig::default();
        config.security.shared_secret = secret.map(String::from);
        let (device, notifications) =
            LoopbackPeripheral::new(config.link.default_max_write_len, secret);
        let device = Arc::new(device);
        let coordinator = SyncCoordinator::new(device.clone(), notifications, &config);
        Self {
            device,
            coordinator,
            state: SyncState::default(),
        }
    }

    /// Run one sync at `now` from the rig's current state and fold the
    /// report back into it.
    pub async fn sync(
        &mut self,
        now: DateTime<FixedOffset>,
        content: &[u8],
        force: bool,
    ) -> inklink_sync::SyncReport {
        let report = self
            .coordinator
            .perform_sync(SyncInput {
                now,
                content: Bytes::copy_from_slice(content),
                last_sync: self.state.last_sync,
                last_fingerprint: self.state.last_fingerprint.clone(),
                last_event_log_timestamp: self.state.last_event_log_timestamp,
                force,
            })
            .await;
        self.state.apply(&report);
        report
    }
}

/// Local time in a UTC+2 zone.
pub fn local(day: u32, hour: u32, minute: u32) -> Result<DateTime<FixedOffset>> {
    FixedOffset::east_opt(2 * 3600)
        .context("bad offset")?
        .with_ymd_and_hms(2026, 7, day, hour, minute, 0)
        .single()
        .context("ambiguous local time")
}

/// A state file under the system temp dir, unique per test and process.
pub fn temp_store(name: &str) -> StateStore {
    StateStore::new(
        std::env::temp_dir()
            .join(format!("inklink-it-{}-{}", name, std::process::id()))
            .join("state.json"),
    )
}

// ── Tests ─────────────────────────────────────────────────────────────────────

mod framing_paths;
mod link_security;
mod sync_cycle;
