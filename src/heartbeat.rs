//! Daily heartbeat
//!
//! At most once per UTC day, and only when telemetry is enabled and at
//! least one account is connected, a [`HeartbeatReport`] goes out through the
//! [`TelemetrySink`]. The day of the last delivery is kept in the vault.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::directory::SessionDirectory;
use crate::errors::AppResult;
use crate::models::HeartbeatReport;
use crate::vault::{AddressMode, DEFAULT_IMAP_PORT, DEFAULT_SMTP_PORT, Vault};

/// Destination of heartbeat reports
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn send_heartbeat(&self, report: &HeartbeatReport) -> AppResult<()>;
}

pub struct Heartbeat {
    vault: Arc<Vault>,
    directory: Arc<SessionDirectory>,
    sink: Arc<dyn TelemetrySink>,
    trigger: Notify,
}

impl Heartbeat {
    pub(crate) fn new(
        vault: Arc<Vault>,
        directory: Arc<SessionDirectory>,
        sink: Arc<dyn TelemetrySink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            vault,
            directory,
            sink,
            trigger: Notify::new(),
        })
    }

    /// Wake the loop now instead of at the next interval
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    pub async fn build_report(&self) -> HeartbeatReport {
        let settings = self.vault.settings();
        let users = self.directory.list().await;
        HeartbeatReport {
            version: env!("CARGO_PKG_VERSION").to_owned(),
            users: users.len(),
            connected_users: users.iter().filter(|u| u.is_connected()).count(),
            split_mode_users: users
                .iter()
                .filter(|u| u.address_mode() == AddressMode::Split)
                .count(),
            custom_imap_port: settings.imap_port != DEFAULT_IMAP_PORT,
            custom_smtp_port: settings.smtp_port != DEFAULT_SMTP_PORT,
            imap_ssl: settings.imap_ssl,
            smtp_ssl: settings.smtp_ssl,
            auto_update: settings.auto_update,
            update_channel: settings.update_channel,
        }
    }

    /// Send today's heartbeat if it is due
    ///
    /// Returns whether a report was delivered.
    pub async fn send_if_due(&self, today: NaiveDate) -> AppResult<bool> {
        let settings = self.vault.settings();
        if settings.telemetry_disabled {
            debug!("telemetry disabled, skipping heartbeat");
            return Ok(false);
        }
        if settings.last_heartbeat.is_some_and(|last| last >= today) {
            return Ok(false);
        }
        if self.directory.connected_count().await == 0 {
            debug!("no connected user, skipping heartbeat");
            return Ok(false);
        }

        let report = self.build_report().await;
        self.sink.send_heartbeat(&report).await?;
        self.vault
            .update_settings(|s| s.last_heartbeat = Some(today))?;
        info!(users = report.users, "heartbeat sent");
        Ok(true)
    }

    pub(crate) fn spawn(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let heartbeat = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                    _ = heartbeat.trigger.notified() => {}
                }
                if let Err(e) = heartbeat.send_if_due(Utc::now().date_naive()).await {
                    warn!(error = %e, "heartbeat failed");
                }
            }
        })
    }
}
