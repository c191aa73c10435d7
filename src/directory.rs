//! Authoritative map of known accounts
//!
//! Holds one [`User`] per account ID behind a single reader/writer lock.
//! Network work (resuming sessions) always happens on a snapshot taken
//! under the lock, never while holding it.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{AppError, AppResult};
use crate::events::{Event, EventKind};
use crate::user::{User, UserCommand, UserContext, UserState};
use crate::vault::AddressMode;

pub struct SessionDirectory {
    users: RwLock<HashMap<String, Arc<User>>>,
    ctx: Arc<UserContext>,
}

impl SessionDirectory {
    pub(crate) fn new(ctx: Arc<UserContext>) -> Arc<Self> {
        Arc::new(Self {
            users: RwLock::new(HashMap::new()),
            ctx,
        })
    }

    pub(crate) fn ctx(&self) -> &Arc<UserContext> {
        &self.ctx
    }

    /// Register every vault account and try to connect the authorized ones
    ///
    /// Individual failures are logged; the affected accounts stay signed out
    /// or locked.
    pub async fn load_all(&self) {
        {
            let mut users = self.users.write().await;
            for user_id in self.ctx.vault.get_user_ids() {
                if users.contains_key(&user_id) {
                    continue;
                }
                match self.ctx.vault.get_user(&user_id) {
                    Ok(record) => {
                        users.insert(
                            user_id,
                            User::new_signed_out(&record, Arc::clone(&self.ctx)),
                        );
                    }
                    Err(e) => warn!(user_id = %user_id, error = %e, "cannot read vault user"),
                }
            }
        }
        self.resume_disconnected().await;
    }

    /// Resume every account that is not connected but still has auth
    pub async fn resume_disconnected(&self) {
        let candidates: Vec<Arc<User>> = {
            let users = self.users.read().await;
            users
                .values()
                .filter(|u| u.state() != UserState::Connected)
                .filter(|u| {
                    self.ctx
                        .vault
                        .get_user(u.id())
                        .map(|r| r.has_auth())
                        .unwrap_or(false)
                })
                .cloned()
                .collect()
        };
        if candidates.is_empty() {
            return;
        }

        debug!(count = candidates.len(), "resuming disconnected users");
        let results = join_all(candidates.iter().map(|user| user.resume())).await;
        for (user, result) in candidates.iter().zip(results) {
            match result {
                Ok(()) => info!(user_id = %user.id(), "user resumed"),
                Err(e) => warn!(user_id = %user.id(), state = ?user.state(), error = %e, "failed to resume user"),
            }
        }
    }

    pub async fn get(&self, user_id: &str) -> AppResult<Arc<User>> {
        self.users
            .read()
            .await
            .get(user_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("user '{user_id}'")))
    }

    /// First account whose ID, name or address matches `query`, ignoring case
    pub async fn find(&self, query: &str) -> AppResult<Arc<User>> {
        let users = self.users.read().await;
        let mut ids: Vec<&String> = users.keys().collect();
        // Vault order is the only stable order there is.
        let order = self.ctx.vault.get_user_ids();
        ids.sort_by_key(|id| order.iter().position(|o| o == *id).unwrap_or(usize::MAX));
        ids.into_iter()
            .filter_map(|id| users.get(id))
            .find(|u| u.matches(query))
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("no user matches '{query}'")))
    }

    /// # Errors
    ///
    /// Returns `Conflict` if a session with the same account ID exists.
    pub async fn add(&self, user: Arc<User>) -> AppResult<()> {
        let mut users = self.users.write().await;
        if users.contains_key(user.id()) {
            return Err(AppError::Conflict(format!(
                "user '{}' is already known",
                user.id()
            )));
        }
        users.insert(user.id().to_owned(), user);
        Ok(())
    }

    /// Existing session for `user_id`, or one inserted by `create`
    pub(crate) async fn get_or_insert_with(
        &self,
        user_id: &str,
        create: impl FnOnce() -> Arc<User>,
    ) -> Arc<User> {
        let mut users = self.users.write().await;
        Arc::clone(users.entry(user_id.to_owned()).or_insert_with(create))
    }

    pub async fn remove(&self, user_id: &str) -> Option<Arc<User>> {
        self.users.write().await.remove(user_id)
    }

    pub async fn list(&self) -> Vec<Arc<User>> {
        let users = self.users.read().await;
        self.ctx
            .vault
            .get_user_ids()
            .iter()
            .filter_map(|id| users.get(id).cloned())
            .collect()
    }

    pub async fn connected_count(&self) -> usize {
        self.users
            .read()
            .await
            .values()
            .filter(|u| u.is_connected())
            .count()
    }

    /// Change an account's address mode with no other mutation in between
    pub async fn set_address_mode(&self, user_id: &str, mode: AddressMode) -> AppResult<()> {
        let users = self.users.write().await;
        let user = users
            .get(user_id)
            .ok_or_else(|| AppError::NotFound(format!("user '{user_id}'")))?;
        user.set_address_mode(mode).await
    }

    /// Stop every event loop
    pub async fn shutdown(&self) {
        let users: Vec<Arc<User>> = self.users.read().await.values().cloned().collect();
        join_all(users.iter().map(|u| u.stop_event_loop())).await;
    }

    /// React to connectivity and to requests raised by event loops
    pub(crate) fn spawn_watcher(
        self: &Arc<Self>,
        mut commands: mpsc::UnboundedReceiver<UserCommand>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let directory = Arc::clone(self);
        let mut conn = self.ctx.bus.subscribe(&[EventKind::ConnStatusUp]);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    Some(event) = conn.recv() => {
                        if event == Event::ConnStatusUp {
                            directory.resume_disconnected().await;
                        }
                    }
                    Some(command) = commands.recv() => match command {
                        UserCommand::Deauth { user_id } => match directory.get(&user_id).await {
                            Ok(user) => user.deauth().await,
                            Err(e) => debug!(user_id = %user_id, error = %e, "deauth for unknown user"),
                        },
                    },
                }
            }
        })
    }
}
