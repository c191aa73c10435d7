//! Immutable bus event values
//!
//! Every notification crossing component boundaries is an [`Event`]. The
//! payload-free [`EventKind`] is what subscribers filter on.

use std::fmt;

/// Event published on the [`crate::bus::EventBus`]
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The remote API became reachable
    ConnStatusUp,
    /// The remote API became unreachable
    ConnStatusDown,

    UserLoggedIn { user_id: String },
    UserLoggedOut { user_id: String },
    UserDeleted { user_id: String },
    /// The remote side revoked the session's authorization
    UserDeauth { user_id: String },
    /// A remote event could not be applied; processing is paused until
    /// feedback arrives
    UserBadEvent {
        user_id: String,
        old_event_id: String,
        new_event_id: String,
        event_info: String,
        error: String,
    },
    /// Bad-event feedback was applied
    UserBadEventFeedback { user_id: String, resync: bool },
    UserAddressModeChanged { user_id: String, mode: crate::vault::AddressMode },
    UserAddressCreated { user_id: String, address_id: String, email: String },
    UserAddressUpdated { user_id: String, address_id: String, email: String },
    UserAddressDeleted { user_id: String, address_id: String, email: String },
    UsedSpaceChanged { user_id: String, used_space: u64 },

    ImapServerReady { port: u16 },
    ImapServerStopped,
    ImapServerError { error: String },
    SmtpServerReady { port: u16 },
    SmtpServerStopped,
    SmtpServerError { error: String },

    SyncStarted { user_id: String },
    SyncProgress { user_id: String, progress: f64, remaining: u64 },
    SyncFinished { user_id: String },
    SyncFailed { user_id: String, error: String },

    UpdateAvailable { version: String, can_install: bool },
    UpdateNotAvailable,
    UpdateInstalled { version: String },
    UpdateFailed { version: String, error: String },

    /// The bridge-managed TLS certificate could not be loaded
    TlsIssue { error: String },
}

/// Discriminant used for subscription filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ConnStatusUp,
    ConnStatusDown,
    UserLoggedIn,
    UserLoggedOut,
    UserDeleted,
    UserDeauth,
    UserBadEvent,
    UserBadEventFeedback,
    UserAddressModeChanged,
    UserAddressCreated,
    UserAddressUpdated,
    UserAddressDeleted,
    UsedSpaceChanged,
    ImapServerReady,
    ImapServerStopped,
    ImapServerError,
    SmtpServerReady,
    SmtpServerStopped,
    SmtpServerError,
    SyncStarted,
    SyncProgress,
    SyncFinished,
    SyncFailed,
    UpdateAvailable,
    UpdateNotAvailable,
    UpdateInstalled,
    UpdateFailed,
    TlsIssue,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ConnStatusUp => EventKind::ConnStatusUp,
            Self::ConnStatusDown => EventKind::ConnStatusDown,
            Self::UserLoggedIn { .. } => EventKind::UserLoggedIn,
            Self::UserLoggedOut { .. } => EventKind::UserLoggedOut,
            Self::UserDeleted { .. } => EventKind::UserDeleted,
            Self::UserDeauth { .. } => EventKind::UserDeauth,
            Self::UserBadEvent { .. } => EventKind::UserBadEvent,
            Self::UserBadEventFeedback { .. } => EventKind::UserBadEventFeedback,
            Self::UserAddressModeChanged { .. } => EventKind::UserAddressModeChanged,
            Self::UserAddressCreated { .. } => EventKind::UserAddressCreated,
            Self::UserAddressUpdated { .. } => EventKind::UserAddressUpdated,
            Self::UserAddressDeleted { .. } => EventKind::UserAddressDeleted,
            Self::UsedSpaceChanged { .. } => EventKind::UsedSpaceChanged,
            Self::ImapServerReady { .. } => EventKind::ImapServerReady,
            Self::ImapServerStopped => EventKind::ImapServerStopped,
            Self::ImapServerError { .. } => EventKind::ImapServerError,
            Self::SmtpServerReady { .. } => EventKind::SmtpServerReady,
            Self::SmtpServerStopped => EventKind::SmtpServerStopped,
            Self::SmtpServerError { .. } => EventKind::SmtpServerError,
            Self::SyncStarted { .. } => EventKind::SyncStarted,
            Self::SyncProgress { .. } => EventKind::SyncProgress,
            Self::SyncFinished { .. } => EventKind::SyncFinished,
            Self::SyncFailed { .. } => EventKind::SyncFailed,
            Self::UpdateAvailable { .. } => EventKind::UpdateAvailable,
            Self::UpdateNotAvailable => EventKind::UpdateNotAvailable,
            Self::UpdateInstalled { .. } => EventKind::UpdateInstalled,
            Self::UpdateFailed { .. } => EventKind::UpdateFailed,
            Self::TlsIssue { .. } => EventKind::TlsIssue,
        }
    }

    /// Account the event concerns, if any
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::UserLoggedIn { user_id }
            | Self::UserLoggedOut { user_id }
            | Self::UserDeleted { user_id }
            | Self::UserDeauth { user_id }
            | Self::UserBadEvent { user_id, .. }
            | Self::UserBadEventFeedback { user_id, .. }
            | Self::UserAddressModeChanged { user_id, .. }
            | Self::UserAddressCreated { user_id, .. }
            | Self::UserAddressUpdated { user_id, .. }
            | Self::UserAddressDeleted { user_id, .. }
            | Self::UsedSpaceChanged { user_id, .. }
            | Self::SyncStarted { user_id }
            | Self::SyncProgress { user_id, .. }
            | Self::SyncFinished { user_id }
            | Self::SyncFailed { user_id, .. } => Some(user_id),
            _ => None,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.user_id() {
            Some(user_id) => write!(f, "{:?}(user={user_id})", self.kind()),
            None => write!(f, "{:?}", self.kind()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Event, EventKind};

    #[test]
    fn kind_and_user_id_follow_payload() {
        let event = Event::SyncFinished {
            user_id: "u1".to_owned(),
        };
        assert_eq!(event.kind(), EventKind::SyncFinished);
        assert_eq!(event.user_id(), Some("u1"));
        assert_eq!(event.to_string(), "SyncFinished(user=u1)");

        assert_eq!(Event::ImapServerReady { port: 1143 }.user_id(), None);
    }
}
