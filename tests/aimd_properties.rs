// Property-style tests for the adaptive throughput control loop: the
// controller's persisted target must stay in bounds, ramp slowly, and cut
// fast, across any interleaving of stable batches and violations.

mod helpers;

use std::sync::Arc;

use delivery_governor::throttle::ThroughputController;
use delivery_governor::RateConfig;
use helpers::create_test_pool;

const T0: i64 = 1_724_800_000_000;

fn config(start: u32, min: u32, max: u32) -> RateConfig {
    RateConfig {
        start_mps: start,
        min_mps: min,
        max_mps: max,
        cooldown_secs: 30,
        min_increase_gap_secs: 10,
        ..Default::default()
    }
}

fn controller(pool: &Arc<sqlx::SqlitePool>, config: RateConfig) -> ThroughputController {
    ThroughputController::new(pool.clone(), "sender-1", config)
}

#[tokio::test]
async fn test_target_never_leaves_configured_bounds() {
    let pool = Arc::new(create_test_pool().await);
    let controller = controller(&pool, config(10, 5, 40));

    // Alternate violations and stable batches, each step past all gating
    let mut now = T0;
    for i in 0..50 {
        now += 120_000;
        let target = if i % 3 == 0 {
            controller
                .record_throughput_exceeded_at(now)
                .await
                .expect("Decrease failed")
        } else {
            controller
                .record_stable_batch_at(now)
                .await
                .expect("Increase failed")
        };
        assert!((5..=40).contains(&target), "target {target} out of bounds");
    }
}

#[tokio::test]
async fn test_ramp_up_is_additive_and_gated() {
    let pool = Arc::new(create_test_pool().await);
    let controller = controller(&pool, config(100, 1, 1000));

    // 100 * 0.05 = 5
    let target = controller
        .record_stable_batch_at(T0)
        .await
        .expect("Increase failed");
    assert_eq!(target, 105);

    // Inside the 10s gap: no further increase
    let target = controller
        .record_stable_batch_at(T0 + 5_000)
        .await
        .expect("Increase failed");
    assert_eq!(target, 105);

    // Past the gap: next additive step from the new target
    let target = controller
        .record_stable_batch_at(T0 + 15_000)
        .await
        .expect("Increase failed");
    assert_eq!(target, 110);
}

#[tokio::test]
async fn test_violation_always_wins_over_ramp_up() {
    let pool = Arc::new(create_test_pool().await);
    let controller = controller(&pool, config(100, 1, 1000));

    // Decrease applies even though an increase just happened
    controller
        .record_stable_batch_at(T0)
        .await
        .expect("Increase failed");
    let target = controller
        .record_throughput_exceeded_at(T0 + 100)
        .await
        .expect("Decrease failed");
    assert_eq!(target, 63); // floor(105 * 0.6)

    // During the cooldown a stable batch changes nothing
    let target = controller
        .record_stable_batch_at(T0 + 15_000)
        .await
        .expect("Increase failed");
    assert_eq!(target, 63);

    // A second violation inside the cooldown still cuts
    let target = controller
        .record_throughput_exceeded_at(T0 + 20_000)
        .await
        .expect("Decrease failed");
    assert_eq!(target, 37); // floor(63 * 0.6)
}

#[tokio::test]
async fn test_recovery_resumes_after_cooldown() {
    let pool = Arc::new(create_test_pool().await);
    let controller = controller(&pool, config(100, 1, 1000));

    controller
        .record_throughput_exceeded_at(T0)
        .await
        .expect("Decrease failed");
    assert_eq!(controller.current_target().await.expect("Target failed"), 60);

    // 30s cooldown elapsed: additive increase resumes
    let target = controller
        .record_stable_batch_at(T0 + 31_000)
        .await
        .expect("Increase failed");
    assert_eq!(target, 63);
}

#[tokio::test]
async fn test_step_is_at_least_one_at_the_floor() {
    let pool = Arc::new(create_test_pool().await);
    let controller = controller(&pool, config(2, 1, 1000));

    // round(2 * 0.05) = 0, but the step is clamped to at least 1
    let target = controller
        .record_stable_batch_at(T0)
        .await
        .expect("Increase failed");
    assert_eq!(target, 3);
}

#[tokio::test]
async fn test_state_survives_across_controller_instances() {
    let pool = Arc::new(create_test_pool().await);
    let cfg = config(100, 1, 1000);

    let first = controller(&pool, cfg.clone());
    first
        .record_throughput_exceeded_at(T0)
        .await
        .expect("Decrease failed");
    drop(first);

    // A fresh controller sees the persisted target and the live cooldown
    let second = controller(&pool, cfg);
    assert_eq!(second.current_target().await.expect("Target failed"), 60);
    let target = second
        .record_stable_batch_at(T0 + 5_000)
        .await
        .expect("Increase failed");
    assert_eq!(target, 60);
}

#[tokio::test]
async fn test_senders_are_throttled_independently() {
    let pool = Arc::new(create_test_pool().await);
    let cfg = config(100, 1, 1000);

    let a = ThroughputController::new(pool.clone(), "sender-a", cfg.clone());
    let b = ThroughputController::new(pool.clone(), "sender-b", cfg);

    a.record_throughput_exceeded_at(T0).await.expect("Decrease failed");

    assert_eq!(a.current_target().await.expect("Target failed"), 60);
    assert_eq!(b.current_target().await.expect("Target failed"), 100);
}
