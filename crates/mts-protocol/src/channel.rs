/// The seam between the outbound queue and the routing decision.
///
/// A deliverer worker never knows how a message reaches its receiver: it
/// hands the queued message back to the channel it was enqueued with.
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

use crate::error::DeliveryError;
use crate::message::{Message, SingleMessage};
use crate::types::AgentId;

/// Outcome of one delivery, counted per constituent message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failed: usize,
}

impl DeliveryReport {
    pub fn delivered(count: usize) -> Self {
        Self {
            delivered: count,
            failed: 0,
        }
    }

    pub fn failed(count: usize) -> Self {
        Self {
            delivered: 0,
            failed: count,
        }
    }

    pub fn merge(&mut self, other: DeliveryReport) {
        self.delivered += other.delivered;
        self.failed += other.failed;
    }

    pub fn settled(&self) -> usize {
        self.delivered + self.failed
    }
}

/// Constituents of an in-flight delivery settled so far, in order.
///
/// The channel records each constituent as soon as it is delivered or
/// reported failed. If the delivery is cut short, everything past
/// [`settled`](Self::settled) is still owed a notification.
#[derive(Debug, Default)]
pub struct DeliveryProgress {
    delivered: AtomicUsize,
    failed: AtomicUsize,
}

impl DeliveryProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered_one(&self) {
        self.delivered.fetch_add(1, Ordering::AcqRel);
    }

    /// Record a failure. Call before notifying the sender.
    pub fn failed_one(&self) {
        self.failed.fetch_add(1, Ordering::AcqRel);
    }

    pub fn settled(&self) -> usize {
        self.report().settled()
    }

    pub fn report(&self) -> DeliveryReport {
        DeliveryReport {
            delivered: self.delivered.load(Ordering::Acquire),
            failed: self.failed.load(Ordering::Acquire),
        }
    }
}

#[async_trait::async_trait]
pub trait Channel: Send + Sync {
    /// Deliver every constituent of `message` to `receiver`, in order.
    ///
    /// Must not fail: a constituent that cannot be delivered is reported to
    /// its sender through [`notify_failure_to_sender`](Self::notify_failure_to_sender).
    /// Every constituent is recorded in `progress` once settled.
    async fn deliver_now(
        &self,
        message: &Message,
        receiver: &AgentId,
        progress: &DeliveryProgress,
    );

    /// Tell the sender of `message` that it could not reach `receiver`.
    async fn notify_failure_to_sender(
        &self,
        message: &SingleMessage,
        receiver: &AgentId,
        error: &DeliveryError,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_merge() {
        let mut report = DeliveryReport::delivered(2);
        report.merge(DeliveryReport::failed(1));
        report.merge(DeliveryReport::delivered(1));
        assert_eq!(
            report,
            DeliveryReport {
                delivered: 3,
                failed: 1
            }
        );
        assert_eq!(report.settled(), 4);
    }

    #[test]
    fn progress_counts_settled_constituents() {
        let progress = DeliveryProgress::new();
        assert_eq!(progress.settled(), 0);
        progress.delivered_one();
        progress.failed_one();
        progress.delivered_one();
        assert_eq!(
            progress.report(),
            DeliveryReport {
                delivered: 2,
                failed: 1
            }
        );
        assert_eq!(progress.settled(), 3);
    }
}
