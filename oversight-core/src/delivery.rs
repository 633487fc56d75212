//! Delivery Log: tracks notification dispatch per (approver, channel),
//! drives jittered retry, and falls back to the next preferred channel
//! after exhausting retries on the current one. Delivery outcomes never
//! affect the Timer Wheel: a tier's timeout proceeds on schedule whether
//! or not its notifications were ever delivered.

use crate::types::{DeliveryAttempt, DeliveryStatus};
use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Channel adapter boundary. The core never parses channel-native
/// payloads; adapters translate to/from this contract.
#[async_trait::async_trait]
pub trait ChannelAdapter: Send + Sync {
    async fn send(&self, recipient: &str, request_id: Uuid, summary: &str) -> Result<(), String>;
}

/// Base retry schedule: 10s, 30s, 90s, per tier activation.
pub const RETRY_SCHEDULE_SECS: [u64; 3] = [10, 30, 90];

pub struct DeliveryLog {
    adapters: std::collections::HashMap<String, Arc<dyn ChannelAdapter>>,
}

impl DeliveryLog {
    pub fn new(adapters: std::collections::HashMap<String, Arc<dyn ChannelAdapter>>) -> Self {
        Self { adapters }
    }

    /// Dispatch one notification attempt for `recipient` over `channel`,
    /// retrying up to `RETRY_SCHEDULE_SECS.len()` times with jittered
    /// backoff before falling through to the next preferred channel.
    pub async fn notify(
        &self,
        request_id: Uuid,
        tier_index: usize,
        recipient: &str,
        preferred_channels: &[String],
        summary: &str,
    ) -> Vec<DeliveryAttempt> {
        let mut attempts = Vec::new();

        for channel in preferred_channels {
            let Some(adapter) = self.adapters.get(channel) else {
                continue;
            };

            let mut delivered = false;
            for (retry_count, base_delay) in RETRY_SCHEDULE_SECS.iter().enumerate() {
                if retry_count > 0 {
                    let jitter_ms = rand::thread_rng().gen_range(0..1000);
                    tokio::time::sleep(std::time::Duration::from_millis(
                        base_delay * 1000 + jitter_ms,
                    ))
                    .await;
                }

                match adapter.send(recipient, request_id, summary).await {
                    Ok(()) => {
                        attempts.push(DeliveryAttempt {
                            tier_index,
                            channel: channel.clone(),
                            recipient: recipient.to_string(),
                            status: DeliveryStatus::Delivered,
                            error: None,
                            retry_count: retry_count as u32,
                            attempted_at: Utc::now(),
                        });
                        delivered = true;
                        break;
                    }
                    Err(err) => {
                        warn!(channel = %channel, recipient, error = %err, "delivery attempt failed");
                        attempts.push(DeliveryAttempt {
                            tier_index,
                            channel: channel.clone(),
                            recipient: recipient.to_string(),
                            status: if retry_count + 1 < RETRY_SCHEDULE_SECS.len() {
                                DeliveryStatus::Retrying
                            } else {
                                DeliveryStatus::Failed
                            },
                            error: Some(err),
                            retry_count: retry_count as u32,
                            attempted_at: Utc::now(),
                        });
                    }
                }
            }

            if delivered {
                return attempts;
            }
        }

        attempts
    }
}
