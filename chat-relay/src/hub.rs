use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nanoid::nanoid;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::{
    message::ChatMessage,
    registry::{Identity, Registry},
};

/// Outcome of one fan-out, mostly useful for tests and logging.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// Stamps inbound messages and fans them out to every registered session.
pub struct Hub {
    registry: Registry,
    delivery_timeout: Duration,
}

impl Hub {
    pub fn new(delivery_timeout: Duration) -> Self {
        Self {
            registry: Registry::new(),
            delivery_timeout,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Stamps `message` as coming from `sender` and delivers a copy to every
    /// session in the current registry snapshot, the sender included.
    ///
    /// Returns once every delivery has either landed in its session's queue or
    /// failed. A failed target is asked to close; the other targets are not
    /// affected.
    pub async fn broadcast(&self, sender: Identity, mut message: ChatMessage) -> BroadcastReport {
        stamp(&mut message, sender);
        info!(
            user_id = %message.user_id,
            user_name = %message.user_name,
            message_id = %message.message_id,
            content = %message.content,
            "relaying message"
        );

        let recipients = self.registry.snapshot();
        let mut report = BroadcastReport {
            attempted: recipients.len(),
            ..BroadcastReport::default()
        };

        let mut deliveries = JoinSet::new();
        for (recipient, handle) in recipients {
            let message = message.clone();
            let limit = self.delivery_timeout;
            deliveries.spawn(async move {
                let result = handle.deliver(message, limit).await;
                if result.is_err() {
                    handle.close();
                }
                (recipient, result)
            });
        }

        while let Some(joined) = deliveries.join_next().await {
            match joined {
                Ok((_, Ok(()))) => report.delivered += 1,
                Ok((recipient, Err(error))) => {
                    debug!(%recipient, %error, "dropping delivery to unreachable client");
                    report.failed += 1;
                }
                Err(error) => {
                    warn!(?error, "delivery task failed");
                    report.failed += 1;
                }
            }
        }

        report
    }
}

fn stamp(message: &mut ChatMessage, sender: Identity) {
    message.user_id = sender.to_string();
    message.message_id = nanoid!();
    message.timestamp = unix_seconds();
}

pub(crate) fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}
