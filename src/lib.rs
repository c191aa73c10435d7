//! mail-bridge-core: session and server-lifecycle orchestration for a local
//! IMAP/SMTP mail bridge
//!
//! Desktop mail clients talk IMAP/SMTP to listeners on loopback; the bridge
//! keeps one session per remote account, feeds remote events into the local
//! stores and starts or stops the listeners as accounts and connectivity
//! come and go. Protocol engines, the remote API and the update server are
//! collaborators behind traits.
//!
//! # Architecture
//!
//! - [`bridge`]: Facade front-ends drive (login, settings, queries)
//! - [`bus`] / [`events`]: Typed publish/subscribe of state changes
//! - [`monitor`]: Online/offline tracking with backoff rechecking
//! - [`server_manager`]: Single owner of the IMAP/SMTP listeners and engines
//! - [`directory`] / [`user`]: Account sessions and their state machine
//! - [`user_events`] / [`sync`]: Remote event loop and full synchronisation
//! - [`vault`]: Persisted settings and credentials
//! - [`heartbeat`] / [`updates`]: Periodic telemetry and update checks
//! - [`diagnostics`] / [`imap`]: Local versus remote consistency check

pub mod api;
pub mod bridge;
pub mod bus;
pub mod config;
pub mod diagnostics;
pub mod directory;
pub mod engine;
pub mod errors;
pub mod events;
pub mod heartbeat;
pub mod imap;
pub mod models;
pub mod monitor;
pub mod server_manager;
pub mod sync;
pub mod tls;
pub mod updates;
pub mod user;
pub mod user_events;
pub mod vault;

#[cfg(test)]
mod test_support;

pub use bridge::{Bridge, BridgeDeps, LoginPrompt};
pub use config::BridgeConfig;
pub use errors::{AppError, AppResult};
pub use events::{Event, EventKind};
