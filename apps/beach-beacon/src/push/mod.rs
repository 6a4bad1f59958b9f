//! Out-of-band wake-up for responders whose app is not connected.
//!
//! The router never waits on a push: [`trigger`] spawns the delivery and
//! the outcome only reaches the logs and metrics.

mod fcm;

use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::signaling::ConnectionId;

pub use fcm::{FcmConfig, FcmNotifier, ServiceAccount, ServiceAccountError};

/// Provider acknowledgement of an accepted notification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReceipt {
    pub message_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum PushError {
    #[error("push notifications are disabled")]
    Disabled,
    #[error("failed to sign oauth assertion: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("oauth token exchange failed with status {status}: {body}")]
    TokenExchange { status: u16, body: String },
    #[error("provider rejected notification with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[async_trait]
pub trait PushNotifier: Send + Sync {
    /// Attempt one delivery to the device identified by `token`.
    async fn send_push_notification(&self, token: &str) -> Result<PushReceipt, PushError>;
}

/// Used when no provider credentials are configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledNotifier;

#[async_trait]
impl PushNotifier for DisabledNotifier {
    async fn send_push_notification(&self, _token: &str) -> Result<PushReceipt, PushError> {
        Err(PushError::Disabled)
    }
}

/// Fire a push for `target` in the background.
pub fn trigger(
    notifier: Arc<dyn PushNotifier>,
    target: ConnectionId,
    token: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match notifier.send_push_notification(&token).await {
            Ok(receipt) => {
                counter!("beach_beacon_push_attempts_total", 1, "outcome" => "delivered");
                info!(
                    target_id = %target,
                    token_prefix = token_prefix(&token),
                    message_id = ?receipt.message_id,
                    "push notification accepted"
                );
            }
            Err(PushError::Disabled) => {
                counter!("beach_beacon_push_attempts_total", 1, "outcome" => "disabled");
                info!(
                    target_id = %target,
                    "push notification skipped; no provider configured"
                );
            }
            Err(err) => {
                counter!("beach_beacon_push_attempts_total", 1, "outcome" => "failed");
                warn!(
                    target_id = %target,
                    token_prefix = token_prefix(&token),
                    error = %err,
                    "push notification failed"
                );
            }
        }
    })
}

fn token_prefix(token: &str) -> &str {
    match token.char_indices().nth(8) {
        Some((idx, _)) => &token[..idx],
        None => token,
    }
}
