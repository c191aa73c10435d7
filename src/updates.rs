//! Update checker
//!
//! Polls an [`Updater`] for the latest release on the configured channel
//! and installs it automatically when allowed.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::errors::{AppError, AppResult};
use crate::events::Event;
use crate::vault::{UpdateChannel, Vault};

/// Dotted numeric version, compared component-wise
///
/// Missing trailing components count as zero, so `1.2` equals `1.2.0`.
#[derive(Debug, Clone)]
pub struct Version(Vec<u64>);

impl FromStr for Version {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches('v');
        let core = trimmed.split(['-', '+']).next().unwrap_or_default();
        if core.is_empty() {
            return Err(AppError::invalid(format!("empty version '{s}'")));
        }
        core.split('.')
            .map(|part| {
                part.parse::<u64>()
                    .map_err(|_| AppError::invalid(format!("invalid version '{s}'")))
            })
            .collect::<AppResult<Vec<_>>>()
            .map(Self)
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.0.len().max(other.0.len());
        (0..len)
            .map(|i| {
                let a = self.0.get(i).copied().unwrap_or(0);
                let b = other.0.get(i).copied().unwrap_or(0);
                a.cmp(&b)
            })
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(u64::to_string).collect();
        f.write_str(&parts.join("."))
    }
}

/// Release advertised by the update server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    pub version: String,
    /// Oldest running version allowed to update itself to this release
    pub min_auto: String,
    pub release_notes: String,
}

/// Update server and installer
#[async_trait]
pub trait Updater: Send + Sync {
    async fn latest(&self, channel: UpdateChannel) -> AppResult<VersionInfo>;

    async fn install(&self, info: &VersionInfo) -> AppResult<()>;
}

pub struct UpdateChecker {
    vault: Arc<Vault>,
    bus: EventBus,
    updater: Arc<dyn Updater>,
    current: Version,
    trigger: Notify,
}

impl UpdateChecker {
    pub(crate) fn new(
        vault: Arc<Vault>,
        bus: EventBus,
        updater: Arc<dyn Updater>,
        current: &str,
    ) -> AppResult<Arc<Self>> {
        Ok(Arc::new(Self {
            vault,
            bus,
            updater,
            current: current.parse()?,
            trigger: Notify::new(),
        }))
    }

    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Query the update server and install when allowed
    ///
    /// `explicit` checks also publish `UpdateNotAvailable` when up to date.
    /// Returns the newer release, if any.
    pub async fn check(&self, explicit: bool) -> AppResult<Option<VersionInfo>> {
        let settings = self.vault.settings();
        let info = self.updater.latest(settings.update_channel).await?;
        let latest: Version = info.version.parse()?;
        if latest <= self.current {
            if explicit {
                self.bus.publish(Event::UpdateNotAvailable);
            }
            return Ok(None);
        }

        let min_auto: Version = info.min_auto.parse().unwrap_or_else(|_| latest.clone());
        let can_install = settings.auto_update && self.current >= min_auto;
        info!(current = %self.current, latest = %latest, can_install, "update available");
        self.bus.publish(Event::UpdateAvailable {
            version: info.version.clone(),
            can_install,
        });

        if can_install {
            match self.updater.install(&info).await {
                Ok(()) => {
                    self.vault
                        .update_settings(|s| s.last_version = info.version.clone())?;
                    self.bus.publish(Event::UpdateInstalled {
                        version: info.version.clone(),
                    });
                }
                Err(e) => {
                    warn!(version = %info.version, error = %e, "update install failed");
                    self.bus.publish(Event::UpdateFailed {
                        version: info.version.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        Ok(Some(info))
    }

    pub(crate) fn spawn(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let checker = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let explicit = tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => false,
                    _ = checker.trigger.notified() => true,
                };
                if let Err(e) = checker.check(explicit).await {
                    warn!(error = %e, "update check failed");
                }
            }
        })
    }
}
