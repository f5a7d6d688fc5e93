//! Outbound dispatch governor.
//!
//! Drains a batch of pending campaign contacts through concurrent sender
//! workers. The token bucket limiter is the single pacing point; the
//! throughput controller decides what rate the limiter should converge to,
//! fed by the batch outcome (any provider throughput rejection versus a
//! clean batch).

pub mod provider;

use anyhow::Result;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use log::{debug, info, warn};
use sqlx::{Row, SqlitePool};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::apply::mark_send_failed;
use crate::config::{RateConfig, DISPATCH_PROGRESS_INTERVAL};
use crate::limiter::TokenBucketLimiter;
use crate::status_event::now_ms;
use crate::throttle::ThroughputController;

pub use provider::HttpProviderClient;

/// One pending contact drained from the campaign queue.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub contact_id: i64,
    pub campaign_id: String,
    pub phone: String,
}

/// Provider response to one send, already classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Accepted; the provider message id keys all later status callbacks.
    Sent { message_id: String },
    /// The provider's throughput-limit rejection. The contact stays
    /// pending and the batch reports it to the controller.
    ThroughputExceeded,
    /// Any other rejection or transport error.
    Failed { reason: String },
}

/// Sends one message to the provider.
pub trait ProviderClient: Send + Sync + 'static {
    fn send(&self, message: OutboundMessage) -> impl Future<Output = SendOutcome> + Send;
}

/// Per-batch accounting.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub attempted: usize,
    pub sent: usize,
    pub failed: usize,
    pub throughput_exceeded: bool,
    /// Controller target after the batch outcome was recorded.
    pub target_mps: u32,
}

/// Orchestrates batches of sends for one sender identity.
pub struct DispatchGovernor<P> {
    pool: Arc<SqlitePool>,
    provider: Arc<P>,
    config: RateConfig,
    sender_id: String,
}

impl<P: ProviderClient> DispatchGovernor<P> {
    pub fn new(
        pool: Arc<SqlitePool>,
        provider: Arc<P>,
        config: RateConfig,
        sender_id: impl Into<String>,
    ) -> Self {
        DispatchGovernor {
            pool,
            provider,
            config,
            sender_id: sender_id.into(),
        }
    }

    /// Drains one batch of pending contacts, optionally scoped to a
    /// campaign, and reports the outcome to the throughput controller.
    pub async fn run_batch(&self, campaign_id: Option<&str>) -> Result<DispatchReport> {
        let batch = next_batch(&self.pool, campaign_id, self.config.batch_size).await?;
        if batch.is_empty() {
            debug!("No pending contacts to dispatch");
            return Ok(DispatchReport::default());
        }

        let controller = ThroughputController::new(
            self.pool.clone(),
            self.sender_id.clone(),
            self.config.clone(),
        );
        let limiter = if self.config.enabled {
            let target = controller.current_target().await?;
            Some(Arc::new(TokenBucketLimiter::new(
                target,
                self.config.min_mps,
                self.config.max_mps,
            )?))
        } else {
            None
        };

        let semaphore = Arc::new(Semaphore::new(self.config.send_concurrency));
        let sent = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));
        let throughput_exceeded = Arc::new(AtomicBool::new(false));
        let floor_delay = Duration::from_millis(self.config.send_floor_delay_ms);

        let attempted = batch.len();
        let mut tasks = FuturesUnordered::new();
        for message in batch {
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    warn!("Semaphore closed, skipping contact {}", message.contact_id);
                    continue;
                }
            };

            let pool = self.pool.clone();
            let provider = Arc::clone(&self.provider);
            let limiter = limiter.clone();
            let sent = Arc::clone(&sent);
            let failed = Arc::clone(&failed);
            let throughput_exceeded = Arc::clone(&throughput_exceeded);

            tasks.push(tokio::spawn(async move {
                let _permit = permit;

                if let Some(ref limiter) = limiter {
                    limiter.acquire().await;
                }

                let contact_id = message.contact_id;
                let campaign_id = message.campaign_id.clone();
                let outcome = provider.send(message).await;
                match outcome {
                    SendOutcome::Sent { message_id } => {
                        if let Err(e) = persist_sent(&pool, contact_id, &message_id).await {
                            warn!("Failed to persist send for contact {contact_id}: {e}");
                        } else {
                            sent.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                    SendOutcome::ThroughputExceeded => {
                        // Contact stays pending for the next batch
                        throughput_exceeded.store(true, Ordering::SeqCst);
                    }
                    SendOutcome::Failed { reason } => {
                        failed.fetch_add(1, Ordering::SeqCst);
                        if let Err(e) =
                            mark_send_failed(&pool, contact_id, &campaign_id, &reason, now_ms())
                                .await
                        {
                            warn!("Failed to record send failure for contact {contact_id}: {e}");
                        }
                    }
                }

                if !floor_delay.is_zero() {
                    tokio::time::sleep(floor_delay).await;
                }
            }));
        }

        let mut completed = 0usize;
        while let Some(result) = tasks.next().await {
            if let Err(e) = result {
                warn!("Sender task panicked: {e}");
            }
            completed += 1;
            if completed % DISPATCH_PROGRESS_INTERVAL == 0 {
                info!(
                    "Dispatch progress: {completed}/{attempted} ({} sent, {} failed)",
                    sent.load(Ordering::SeqCst),
                    failed.load(Ordering::SeqCst)
                );
            }
        }

        let exceeded = throughput_exceeded.load(Ordering::SeqCst);
        let target_mps = if self.config.enabled {
            let target = if exceeded {
                controller.record_throughput_exceeded().await?
            } else {
                controller.record_stable_batch().await?
            };
            if let Some(ref limiter) = limiter {
                limiter.update_rate(target)?;
                limiter.stop();
            }
            target
        } else {
            0
        };

        let report = DispatchReport {
            attempted,
            sent: sent.load(Ordering::SeqCst),
            failed: failed.load(Ordering::SeqCst),
            throughput_exceeded: exceeded,
            target_mps,
        };
        info!(
            "Dispatch batch: {} attempted, {} sent, {} failed{}",
            report.attempted,
            report.sent,
            report.failed,
            if exceeded {
                ", throughput exceeded"
            } else {
                ""
            }
        );
        Ok(report)
    }
}

/// Pending contacts that have never been handed to the provider.
async fn next_batch(
    pool: &SqlitePool,
    campaign_id: Option<&str>,
    limit: i64,
) -> Result<Vec<OutboundMessage>, sqlx::Error> {
    let rows = match campaign_id {
        Some(campaign_id) => {
            sqlx::query(
                "SELECT id, campaign_id, phone FROM campaign_contacts
                 WHERE status = 'pending' AND message_id IS NULL AND campaign_id = ?
                 ORDER BY id LIMIT ?",
            )
            .bind(campaign_id)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query(
                "SELECT id, campaign_id, phone FROM campaign_contacts
                 WHERE status = 'pending' AND message_id IS NULL
                 ORDER BY id LIMIT ?",
            )
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
    };
    Ok(rows
        .into_iter()
        .map(|row| OutboundMessage {
            contact_id: row.get(0),
            campaign_id: row.get(1),
            phone: row.get(2),
        })
        .collect())
}

/// Stamps the provider message id onto the contact row. The status callback
/// pipeline takes over from here.
async fn persist_sent(
    pool: &SqlitePool,
    contact_id: i64,
    message_id: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE campaign_contacts SET status = 'sent', message_id = ?
         WHERE id = ? AND status = 'pending'",
    )
    .bind(message_id)
    .bind(contact_id)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_helpers::{campaign_counts, create_test_pool, seed_contact};
    use crate::throttle::ThroughputController;
    use std::sync::Mutex;

    /// Scripted provider: pops the next outcome per send, records calls.
    struct FakeProvider {
        outcomes: Mutex<Vec<SendOutcome>>,
        calls: AtomicUsize,
    }

    impl FakeProvider {
        fn new(mut outcomes: Vec<SendOutcome>) -> Arc<Self> {
            outcomes.reverse();
            Arc::new(FakeProvider {
                outcomes: Mutex::new(outcomes),
                calls: AtomicUsize::new(0),
            })
        }

        fn always_sent() -> Arc<Self> {
            Arc::new(FakeProvider {
                outcomes: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl ProviderClient for FakeProvider {
        async fn send(&self, message: OutboundMessage) -> SendOutcome {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcomes
                .lock()
                .expect("Outcomes lock poisoned")
                .pop()
                .unwrap_or(SendOutcome::Sent {
                    message_id: format!("wamid.fake{}.{}", message.contact_id, call),
                })
        }
    }

    fn test_config() -> RateConfig {
        RateConfig {
            enabled: true,
            send_concurrency: 3,
            batch_size: 10,
            start_mps: 50,
            max_mps: 100,
            min_mps: 1,
            cooldown_secs: 30,
            min_increase_gap_secs: 10,
            send_floor_delay_ms: 0,
        }
    }

    fn governor_with(
        pool: &Arc<SqlitePool>,
        provider: Arc<FakeProvider>,
        config: RateConfig,
    ) -> DispatchGovernor<FakeProvider> {
        DispatchGovernor::new(pool.clone(), provider, config, "sender-1")
    }

    #[tokio::test]
    async fn test_clean_batch_sends_everything_and_ramps_up() {
        let pool = Arc::new(create_test_pool().await);
        for i in 0..4 {
            seed_contact(&pool, "camp-1", None, &format!("1555000{i}"), "pending").await;
        }

        let provider = FakeProvider::always_sent();
        let governor = governor_with(&pool, provider.clone(), test_config());
        let report = governor.run_batch(Some("camp-1")).await.expect("Batch failed");

        assert_eq!(report.attempted, 4);
        assert_eq!(report.sent, 4);
        assert_eq!(report.failed, 0);
        assert!(!report.throughput_exceeded);
        // 50 + max(1, round(50 * 0.05)) = 53
        assert_eq!(report.target_mps, 53);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 4);

        let remaining: i64 = sqlx::query(
            "SELECT COUNT(*) FROM campaign_contacts WHERE status = 'pending'",
        )
        .fetch_one(pool.as_ref())
        .await
        .expect("Count failed")
        .get(0);
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn test_throughput_rejection_cuts_target_and_leaves_contact_pending() {
        let pool = Arc::new(create_test_pool().await);
        seed_contact(&pool, "camp-1", None, "15550001", "pending").await;

        let provider = FakeProvider::new(vec![SendOutcome::ThroughputExceeded]);
        let mut config = test_config();
        config.send_concurrency = 1;
        let governor = governor_with(&pool, provider, config.clone());
        let report = governor.run_batch(None).await.expect("Batch failed");

        assert!(report.throughput_exceeded);
        assert_eq!(report.sent, 0);
        // floor(50 * 0.6) = 30
        assert_eq!(report.target_mps, 30);

        let controller = ThroughputController::new(pool.clone(), "sender-1".to_string(), config);
        assert_eq!(controller.current_target().await.expect("Target failed"), 30);

        let status: String =
            sqlx::query("SELECT status FROM campaign_contacts WHERE phone = '15550001'")
                .fetch_one(pool.as_ref())
                .await
                .expect("Fetch failed")
                .get(0);
        assert_eq!(status, "pending");
    }

    #[tokio::test]
    async fn test_send_failure_marks_contact_failed_and_counts_it() {
        let pool = Arc::new(create_test_pool().await);
        seed_contact(&pool, "camp-1", None, "15550001", "pending").await;

        let provider = FakeProvider::new(vec![SendOutcome::Failed {
            reason: "invalid recipient".to_string(),
        }]);
        let governor = governor_with(&pool, provider, test_config());
        let report = governor.run_batch(None).await.expect("Batch failed");

        assert_eq!(report.failed, 1);
        assert_eq!(campaign_counts(&pool, "camp-1").await, (0, 0, 1));

        let status: String =
            sqlx::query("SELECT status FROM campaign_contacts WHERE phone = '15550001'")
                .fetch_one(pool.as_ref())
                .await
                .expect("Fetch failed")
                .get(0);
        assert_eq!(status, "failed");
    }

    #[tokio::test]
    async fn test_disabled_config_bypasses_pacing() {
        let pool = Arc::new(create_test_pool().await);
        seed_contact(&pool, "camp-1", None, "15550001", "pending").await;

        let mut config = test_config();
        config.enabled = false;
        let governor = governor_with(&pool, FakeProvider::always_sent(), config);
        let report = governor.run_batch(None).await.expect("Batch failed");

        assert_eq!(report.sent, 1);
        assert_eq!(report.target_mps, 0);

        // No rate state was touched
        let rows: i64 = sqlx::query("SELECT COUNT(*) FROM rate_state")
            .fetch_one(pool.as_ref())
            .await
            .expect("Count failed")
            .get(0);
        assert_eq!(rows, 0);
    }

    #[tokio::test]
    async fn test_empty_queue_is_a_noop() {
        let pool = Arc::new(create_test_pool().await);
        let governor = governor_with(&pool, FakeProvider::always_sent(), test_config());
        let report = governor.run_batch(None).await.expect("Batch failed");
        assert_eq!(report, DispatchReport::default());
    }

    #[tokio::test]
    async fn test_batch_respects_batch_size_and_campaign_scope() {
        let pool = Arc::new(create_test_pool().await);
        for i in 0..5 {
            seed_contact(&pool, "camp-1", None, &format!("1555000{i}"), "pending").await;
        }
        seed_contact(&pool, "camp-2", None, "15551000", "pending").await;

        let mut config = test_config();
        config.batch_size = 3;
        let governor = governor_with(&pool, FakeProvider::always_sent(), config);
        let report = governor.run_batch(Some("camp-1")).await.expect("Batch failed");

        assert_eq!(report.attempted, 3);
        let other: String =
            sqlx::query("SELECT status FROM campaign_contacts WHERE campaign_id = 'camp-2'")
                .fetch_one(pool.as_ref())
                .await
                .expect("Fetch failed")
                .get(0);
        assert_eq!(other, "pending");
    }
}
