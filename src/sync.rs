//! Full synchronisation of an account into its local stores
//!
//! Labels are pushed first, then message metadata is paged in ID order and
//! each message body is fetched and routed to the connector of its address.
//! Progress is checkpointed in the vault after every page so an interrupted
//! sync resumes where it stopped.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{ApiClient, FullMessage};
use crate::engine::{Connector, ConnectorUpdate};
use crate::errors::AppResult;
use crate::events::Event;
use crate::user::User;

/// How a sync pass ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncOutcome {
    Finished,
    /// Cancelled, or the stores were rebuilt underneath it
    Aborted,
}

impl User {
    /// Run a full sync unless the vault says one already completed
    ///
    /// Publishes `SyncStarted`, `SyncProgress` per page and `SyncFinished`;
    /// a failure publishes `SyncFailed` and is returned.
    pub(crate) async fn ensure_synced(
        &self,
        client: &Arc<dyn ApiClient>,
        cancel: &CancellationToken,
    ) -> AppResult<()> {
        let status = self.ctx().vault.get_user(self.id())?.sync_status;
        if status.is_complete() {
            return Ok(());
        }

        info!(user_id = %self.id(), "starting full sync");
        self.ctx().bus.publish(Event::SyncStarted {
            user_id: self.id().to_owned(),
        });
        let generation = self.sync_generation.load(Ordering::SeqCst);
        match self.run_sync(client, cancel, generation).await {
            Ok(SyncOutcome::Finished) => {
                info!(user_id = %self.id(), "full sync finished");
                self.ctx().bus.publish(Event::SyncFinished {
                    user_id: self.id().to_owned(),
                });
                Ok(())
            }
            Ok(SyncOutcome::Aborted) => {
                debug!(user_id = %self.id(), "full sync aborted");
                Ok(())
            }
            Err(e) => {
                warn!(user_id = %self.id(), error = %e, "full sync failed");
                self.ctx().bus.publish(Event::SyncFailed {
                    user_id: self.id().to_owned(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn sync_is_current(&self, generation: u64) -> bool {
        self.sync_generation.load(Ordering::SeqCst) == generation
    }

    async fn run_sync(
        &self,
        client: &Arc<dyn ApiClient>,
        cancel: &CancellationToken,
        generation: u64,
    ) -> AppResult<SyncOutcome> {
        let status = self.ctx().vault.get_user(self.id())?.sync_status;

        if !status.has_labels {
            let labels = client.get_labels().await?;
            let _events = self.event_lock.lock().await;
            if !self.sync_is_current(generation) {
                return Ok(SyncOutcome::Aborted);
            }
            for connector in self.connectors() {
                for label in &labels {
                    connector.publish(ConnectorUpdate::MailboxCreated(label.clone()));
                }
            }
            self.ctx()
                .vault
                .update_user(self.id(), |r| r.sync_status.has_labels = true)?;
            debug!(user_id = %self.id(), labels = labels.len(), "labels synced");
        }

        if status.has_messages {
            return Ok(SyncOutcome::Finished);
        }

        let page_size = self.ctx().config.sync_page_size.max(1);
        let total = client.get_message_count().await?;
        let mut after = status.last_message_id.clone();
        let mut done: u64 = 0;
        loop {
            if cancel.is_cancelled() {
                return Ok(SyncOutcome::Aborted);
            }
            let page = client
                .get_message_metadata(after.as_deref(), page_size)
                .await?;
            let Some(last) = page.last().map(|m| m.id.clone()) else {
                break;
            };

            let mut messages = Vec::with_capacity(page.len());
            let mut failed = Vec::new();
            for metadata in &page {
                match client.get_full_message(&metadata.id).await {
                    Ok(message) => messages.push(message),
                    // Retried with the whole page on the next pass.
                    Err(e) if e.is_retryable() || e.is_auth() => return Err(e),
                    Err(e) => {
                        warn!(user_id = %self.id(), message_id = %metadata.id, error = %e, "skipping message during sync");
                        failed.push(metadata.id.clone());
                    }
                }
            }

            {
                let _events = self.event_lock.lock().await;
                if !self.sync_is_current(generation) {
                    return Ok(SyncOutcome::Aborted);
                }
                let written = messages.len() as u64;
                self.route_messages(messages);
                let checkpoint = last.clone();
                self.ctx()
                    .vault
                    .update_user_async(self.id(), move |r| {
                        r.sync_status.last_message_id = Some(checkpoint);
                        r.sync_status.message_count += written;
                        r.sync_status.failed_message_ids.extend(failed);
                    })
                    .await?;
            }

            done += page.len() as u64;
            let progress = if total == 0 {
                1.0
            } else {
                (done as f64 / total as f64).min(1.0)
            };
            self.ctx().bus.publish(Event::SyncProgress {
                user_id: self.id().to_owned(),
                progress,
                remaining: total.saturating_sub(done),
            });

            let short_page = page.len() < page_size;
            after = Some(last);
            if short_page {
                break;
            }
        }

        let _events = self.event_lock.lock().await;
        if !self.sync_is_current(generation) {
            return Ok(SyncOutcome::Aborted);
        }
        self.ctx().vault.update_user(self.id(), |r| {
            r.sync_status.has_messages = true;
            r.sync_status.last_message_id = None;
        })?;
        Ok(SyncOutcome::Finished)
    }

    /// Group messages by connector and push one batch to each
    fn route_messages(&self, messages: Vec<FullMessage>) {
        let mut batches: BTreeMap<String, (Arc<Connector>, Vec<FullMessage>)> = BTreeMap::new();
        for message in messages {
            match self.connector_for(&message.metadata.address_id) {
                Some(connector) => {
                    batches
                        .entry(connector.binding_id().to_owned())
                        .or_insert_with(|| (connector, Vec::new()))
                        .1
                        .push(message);
                }
                None => {
                    debug!(user_id = %self.id(), message_id = %message.metadata.id, "no binding for message address");
                }
            }
        }
        for (_, (connector, batch)) in batches {
            connector.publish(ConnectorUpdate::MessagesCreated(batch));
        }
    }
}
