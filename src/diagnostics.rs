//! Local versus remote consistency check
//!
//! Logs into the running IMAP listener as each connected account, reads
//! back every message of the all-mail view and compares it with the remote
//! metadata.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tokio_rustls::TlsConnector;
use tracing::{info, warn};

use crate::api::{ApiClient, MessageMetadata};
use crate::errors::AppResult;
use crate::imap::{self, LocalMessage};
use crate::models::UserConsistency;
use crate::user::User;

/// Mailbox every local store exposes with all messages
pub const ALL_MAIL: &str = "All Mail";

/// Where and how to reach the local IMAP listener
pub struct LocalEndpoint {
    pub port: u16,
    pub tls: Option<TlsConnector>,
    pub timeout: Duration,
}

/// Every remote message's metadata, following pages to the end
pub async fn remote_metadata(
    client: &Arc<dyn ApiClient>,
    page_size: usize,
) -> AppResult<Vec<MessageMetadata>> {
    let page_size = page_size.max(1);
    let mut all = Vec::new();
    let mut after: Option<String> = None;
    loop {
        let page = client.get_message_metadata(after.as_deref(), page_size).await?;
        let short = page.len() < page_size;
        after = page.last().map(|m| m.id.clone());
        all.extend(page);
        if short || after.is_none() {
            break;
        }
    }
    Ok(all)
}

/// Compare remote metadata with what the local stores serve
pub fn compare(
    user_id: &str,
    remote: &[MessageMetadata],
    local: &[LocalMessage],
) -> UserConsistency {
    let local_by_id: BTreeMap<&str, &LocalMessage> = local
        .iter()
        .filter_map(|m| m.internal_id.as_deref().map(|id| (id, m)))
        .collect();
    let remote_ids: BTreeSet<&str> = remote.iter().map(|m| m.id.as_str()).collect();

    let mut report = UserConsistency {
        user_id: user_id.to_owned(),
        remote_count: remote.len(),
        local_count: local.len(),
        ..UserConsistency::default()
    };
    for metadata in remote {
        match local_by_id.get(metadata.id.as_str()) {
            None => report.missing.push(metadata.id.clone()),
            Some(local) => {
                if local.seen == metadata.unread || local.flagged != metadata.starred {
                    report.flag_mismatches.push(metadata.id.clone());
                }
            }
        }
    }
    for message in local {
        match message.internal_id.as_deref() {
            Some(id) if remote_ids.contains(id) => {}
            Some(id) => report.unexpected.push(id.to_owned()),
            None => report.unexpected.push(format!("uid:{}", message.uid)),
        }
    }
    report
}

/// Read back every binding of `user` from the local listener
async fn local_messages(
    user: &User,
    endpoint: &LocalEndpoint,
) -> AppResult<Vec<LocalMessage>> {
    let bridge_pass = user.ctx().vault.get_user(user.id())?.bridge_pass.to_secret();
    let mut all = Vec::new();
    for connector in user.connectors() {
        let Some(login) = connector.addresses().into_iter().next() else {
            continue;
        };
        let mut session = imap::connect_local(
            endpoint.port,
            endpoint.tls.as_ref(),
            &login,
            &bridge_pass,
            endpoint.timeout,
        )
        .await?;
        let exists = imap::examine(&mut session, ALL_MAIL, endpoint.timeout).await?;
        if exists > 0 {
            all.extend(imap::fetch_all(&mut session, endpoint.timeout).await?);
        }
        if let Err(e) = imap::logout(&mut session, endpoint.timeout).await {
            warn!(user_id = %user.id(), error = %e, "diagnostic logout failed");
        }
    }
    Ok(all)
}

/// Check one connected account
pub async fn check_user(user: &User, endpoint: &LocalEndpoint) -> AppResult<UserConsistency> {
    let client = user.client()?;
    let remote = remote_metadata(&client, user.ctx().config.sync_page_size).await?;
    let local = local_messages(user, endpoint).await?;
    let report = compare(user.id(), &remote, &local);
    info!(
        user_id = %user.id(),
        remote = report.remote_count,
        local = report.local_count,
        missing = report.missing.len(),
        "consistency check finished"
    );
    Ok(report)
}
