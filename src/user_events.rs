//! Per-account remote event loop
//!
//! Runs while a session is connected. Each pass makes sure the local stores
//! are fully synced, then applies every remote event after the persisted
//! event ID, strictly in stream order. A failing event is retried with a
//! fixed backoff; after the configured number of attempts the loop raises a
//! bad event and pauses until the user answers it.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::{AddressEvent, ApiClient, ApiEvent, LabelEvent, MessageEvent};
use crate::engine::ConnectorUpdate;
use crate::errors::{AppError, AppResult};
use crate::events::Event;
use crate::user::{Feedback, User, UserCommand};
use crate::vault::{BadEventMarker, SyncStatus};

/// What the loop should do after a step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    /// Restart the pass from the sync check
    Restart,
    Stop,
}

impl User {
    pub(crate) async fn run_event_loop(
        self: Arc<Self>,
        cancel: CancellationToken,
        mut feedback: mpsc::Receiver<Feedback>,
    ) {
        let client = match self.client() {
            Ok(client) => client,
            Err(e) => {
                error!(user_id = %self.id(), error = %e, "event loop started without a client");
                return;
            }
        };
        info!(user_id = %self.id(), "event loop started");

        if self.resume_outstanding_bad_event(&client, &cancel, &mut feedback).await == Flow::Stop {
            return;
        }

        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self.sync_step(&client, &cancel).await {
                Flow::Stop => break,
                Flow::Restart => continue,
                Flow::Continue => {}
            }
            match self.poll_events(&client, &cancel, &mut feedback).await {
                Flow::Stop => break,
                Flow::Restart => continue,
                Flow::Continue => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.ctx().config.event_poll()) => {}
                _ = self.poll.notified() => {}
            }
        }
        info!(user_id = %self.id(), "event loop stopped");
    }

    /// `Continue` only once the stores are fully synced
    ///
    /// Remote events are never applied on top of an incomplete sync; a
    /// failed sync is retried after the backoff.
    async fn sync_step(&self, client: &Arc<dyn ApiClient>, cancel: &CancellationToken) -> Flow {
        let Err(e) = self.ensure_synced(client, cancel).await else {
            return Flow::Continue;
        };
        match self.react_to_failure(&e, cancel).await {
            Flow::Stop => Flow::Stop,
            Flow::Restart => Flow::Restart,
            Flow::Continue => {
                warn!(user_id = %self.id(), error = %e, "sync failed, retrying later");
                if self.backoff(cancel).await {
                    Flow::Restart
                } else {
                    Flow::Stop
                }
            }
        }
    }

    /// Common reaction to network and authorization failures
    ///
    /// Returns `Stop` when the loop must exit, `Restart` after waiting out a
    /// network outage and `Continue` when the failure is neither.
    async fn react_to_failure(&self, e: &AppError, cancel: &CancellationToken) -> Flow {
        if e.is_auth() {
            warn!(user_id = %self.id(), error = %e, "authorization revoked");
            let _ = self.ctx().commands.send(UserCommand::Deauth {
                user_id: self.id().to_owned(),
            });
            return Flow::Stop;
        }
        if e.is_network() {
            self.ctx().monitor.report_down();
            if !self.ctx().monitor.wait_until_up(cancel).await {
                return Flow::Stop;
            }
            return Flow::Restart;
        }
        Flow::Continue
    }

    /// Sleep the bad-event backoff; `false` if cancelled
    async fn backoff(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.ctx().config.bad_event_backoff()) => true,
        }
    }

    async fn poll_events(
        &self,
        client: &Arc<dyn ApiClient>,
        cancel: &CancellationToken,
        feedback: &mut mpsc::Receiver<Feedback>,
    ) -> Flow {
        let since = match self.ctx().vault.get_user(self.id()) {
            Ok(record) => record.event_id,
            Err(e) => {
                error!(user_id = %self.id(), error = %e, "user vanished from vault");
                return Flow::Stop;
            }
        };
        let events = match client.get_events(&since).await {
            Ok(events) => {
                self.ctx().monitor.report_up();
                events
            }
            Err(e) => {
                return match self.react_to_failure(&e, cancel).await {
                    Flow::Continue => {
                        warn!(user_id = %self.id(), error = %e, "event poll failed");
                        Flow::Continue
                    }
                    flow => flow,
                };
            }
        };

        let mut previous = since;
        for event in events {
            match self
                .handle_event(client, &previous, &event, cancel, feedback)
                .await
            {
                Flow::Continue => previous = event.event_id.clone(),
                flow => return flow,
            }
        }
        Flow::Continue
    }

    /// Apply one event with retries, escalating to a bad event
    async fn handle_event(
        &self,
        client: &Arc<dyn ApiClient>,
        previous_id: &str,
        event: &ApiEvent,
        cancel: &CancellationToken,
        feedback: &mut mpsc::Receiver<Feedback>,
    ) -> Flow {
        let retries = self.ctx().config.bad_event_retries.max(1);
        let mut failures = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Flow::Stop;
            }
            let result = {
                let _events = self.event_lock.lock().await;
                let applied = self.apply_event(client, event).await;
                match applied {
                    Ok(()) => self.commit_event_id(&event.event_id).await,
                    Err(e) => Err(e),
                }
            };
            let e = match result {
                Ok(()) => return Flow::Continue,
                Err(e) => e,
            };

            if e.is_unprocessable() {
                warn!(user_id = %self.id(), event = %event, error = %e, "skipping unprocessable event");
                return match self.commit_event_id(&event.event_id).await {
                    Ok(()) => Flow::Continue,
                    Err(e) => {
                        error!(user_id = %self.id(), error = %e, "failed to persist event ID");
                        Flow::Stop
                    }
                };
            }
            match self.react_to_failure(&e, cancel).await {
                Flow::Stop => return Flow::Stop,
                // A network outage is not the event's fault.
                Flow::Restart => continue,
                Flow::Continue => {}
            }

            failures += 1;
            warn!(user_id = %self.id(), event = %event, attempt = failures, error = %e, "failed to apply event");
            if failures >= retries {
                return self
                    .raise_bad_event(client, previous_id, event, &e, cancel, feedback)
                    .await;
            }
            if !self.backoff(cancel).await {
                return Flow::Stop;
            }
        }
    }

    async fn commit_event_id(&self, event_id: &str) -> AppResult<()> {
        let event_id = event_id.to_owned();
        self.ctx()
            .vault
            .update_user_async(self.id(), |r| r.event_id = event_id)
            .await
    }

    async fn raise_bad_event(
        &self,
        client: &Arc<dyn ApiClient>,
        previous_id: &str,
        event: &ApiEvent,
        error: &AppError,
        cancel: &CancellationToken,
        feedback: &mut mpsc::Receiver<Feedback>,
    ) -> Flow {
        let marker = BadEventMarker {
            event_id: event.event_id.clone(),
            error: error.to_string(),
        };
        if let Err(e) = self
            .ctx()
            .vault
            .update_user(self.id(), |r| r.bad_event = Some(marker))
        {
            error!(user_id = %self.id(), error = %e, "failed to persist bad event marker");
        }
        error!(user_id = %self.id(), event = %event, error = %error, "bad event, pausing event processing");
        self.ctx().bus.publish(Event::UserBadEvent {
            user_id: self.id().to_owned(),
            old_event_id: previous_id.to_owned(),
            new_event_id: event.event_id.clone(),
            event_info: event.to_string(),
            error: error.to_string(),
        });
        self.await_feedback(client, cancel, feedback).await
    }

    async fn await_feedback(
        &self,
        client: &Arc<dyn ApiClient>,
        cancel: &CancellationToken,
        feedback: &mut mpsc::Receiver<Feedback>,
    ) -> Flow {
        loop {
            let answer = tokio::select! {
                _ = cancel.cancelled() => return Flow::Stop,
                answer = feedback.recv() => answer,
            };
            match answer {
                Some(Feedback::Resync) => match self.resync(client).await {
                    Ok(()) => return Flow::Restart,
                    Err(e) => {
                        // Stay paused; the user can answer again.
                        error!(user_id = %self.id(), error = %e, "resync after bad event failed");
                    }
                },
                None => return Flow::Stop,
            }
        }
    }

    /// Pause on a marker left by a previous run
    async fn resume_outstanding_bad_event(
        &self,
        client: &Arc<dyn ApiClient>,
        cancel: &CancellationToken,
        feedback: &mut mpsc::Receiver<Feedback>,
    ) -> Flow {
        let record = match self.ctx().vault.get_user(self.id()) {
            Ok(record) => record,
            Err(_) => return Flow::Stop,
        };
        let Some(marker) = record.bad_event else {
            return Flow::Continue;
        };
        warn!(user_id = %self.id(), event_id = %marker.event_id, "bad event still outstanding");
        self.ctx().bus.publish(Event::UserBadEvent {
            user_id: self.id().to_owned(),
            old_event_id: record.event_id,
            new_event_id: marker.event_id.clone(),
            event_info: format!("event {}", marker.event_id),
            error: marker.error,
        });
        self.await_feedback(client, cancel, feedback).await
    }

    /// Drop local state and restart from the latest remote event
    async fn resync(&self, client: &Arc<dyn ApiClient>) -> AppResult<()> {
        let _events = self.event_lock.lock().await;
        let latest = client.get_latest_event_id().await?;
        self.sync_generation.fetch_add(1, Ordering::SeqCst);

        self.ctx().manager.remove_imap_user(self.id(), true).await?;
        self.ctx().vault.update_user(self.id(), |r| {
            r.bad_event = None;
            r.event_id = latest;
            r.sync_status = SyncStatus::default();
        })?;
        self.ctx().manager.add_imap_user(self.imap_user()?).await?;

        info!(user_id = %self.id(), "bad event resolved by resync");
        self.ctx().bus.publish(Event::UserBadEventFeedback {
            user_id: self.id().to_owned(),
            resync: true,
        });
        Ok(())
    }

    /// Translate one remote event into connector updates and bus events
    async fn apply_event(&self, client: &Arc<dyn ApiClient>, event: &ApiEvent) -> AppResult<()> {
        debug!(user_id = %self.id(), event = %event, "applying event");

        if event.refresh {
            info!(user_id = %self.id(), "server requested a full refresh");
            self.ctx().vault.update_user(self.id(), |r| {
                r.sync_status = SyncStatus::default();
            })?;
            self.sync_generation.fetch_add(1, Ordering::SeqCst);
            self.ctx().manager.remove_imap_user(self.id(), true).await?;
            self.ctx().manager.add_imap_user(self.imap_user()?).await?;
            return Ok(());
        }

        if let Some(user) = &event.user {
            self.apply_user_info(user);
        }
        if !event.addresses.is_empty() {
            self.apply_address_events(&event.addresses).await?;
        }
        for label_event in &event.labels {
            let update = match label_event {
                LabelEvent::Created(label) => ConnectorUpdate::MailboxCreated(label.clone()),
                LabelEvent::Updated(label) => ConnectorUpdate::MailboxUpdated(label.clone()),
                LabelEvent::Deleted { id } => ConnectorUpdate::MailboxDeleted { id: id.clone() },
            };
            for connector in self.connectors() {
                connector.publish(update.clone());
            }
        }
        for message_event in &event.messages {
            self.apply_message_event(client, message_event).await?;
        }
        if let Some(used_space) = event.used_space {
            self.set_used_space(used_space);
            self.ctx().bus.publish(Event::UsedSpaceChanged {
                user_id: self.id().to_owned(),
                used_space,
            });
        }
        Ok(())
    }

    async fn apply_address_events(&self, events: &[AddressEvent]) -> AppResult<()> {
        let mut addresses = self.addresses();
        let mut published = Vec::new();
        for event in events {
            match event {
                AddressEvent::Created(address) => {
                    addresses.retain(|a| a.id != address.id);
                    addresses.push(address.clone());
                    published.push(Event::UserAddressCreated {
                        user_id: self.id().to_owned(),
                        address_id: address.id.clone(),
                        email: address.email.clone(),
                    });
                }
                AddressEvent::Updated(address) => {
                    if let Some(existing) = addresses.iter_mut().find(|a| a.id == address.id) {
                        *existing = address.clone();
                    } else {
                        addresses.push(address.clone());
                    }
                    published.push(Event::UserAddressUpdated {
                        user_id: self.id().to_owned(),
                        address_id: address.id.clone(),
                        email: address.email.clone(),
                    });
                }
                AddressEvent::Deleted { id } => {
                    let email = addresses
                        .iter()
                        .find(|a| &a.id == id)
                        .map(|a| a.email.clone())
                        .unwrap_or_default();
                    addresses.retain(|a| &a.id != id);
                    published.push(Event::UserAddressDeleted {
                        user_id: self.id().to_owned(),
                        address_id: id.clone(),
                        email,
                    });
                }
            }
        }
        self.set_addresses(addresses);
        self.reconfigure_bindings().await?;
        for event in published {
            self.ctx().bus.publish(event);
        }
        Ok(())
    }

    async fn apply_message_event(
        &self,
        client: &Arc<dyn ApiClient>,
        event: &MessageEvent,
    ) -> AppResult<()> {
        match event {
            MessageEvent::Created(metadata) => {
                let Some(connector) = self.connector_for(&metadata.address_id) else {
                    debug!(user_id = %self.id(), message_id = %metadata.id, "message for unbound address ignored");
                    return Ok(());
                };
                let message = client.get_full_message(&metadata.id).await?;
                connector.publish(ConnectorUpdate::MessagesCreated(vec![message]));
            }
            MessageEvent::Updated(metadata) => {
                if let Some(connector) = self.connector_for(&metadata.address_id) {
                    connector.publish(ConnectorUpdate::MessageUpdated(metadata.clone()));
                }
            }
            MessageEvent::Deleted { id } => {
                // The address is unknown once deleted.
                for connector in self.connectors() {
                    connector.publish(ConnectorUpdate::MessageDeleted { id: id.clone() });
                }
            }
        }
        Ok(())
    }
}
