//! EventBatcher behavior tests.
//!
//! These tests verify:
//! - Timeout, size, burst, priority and manual flush triggers
//! - Ordering within batches and exactly-once delivery
//! - Listener fault isolation and re-entrancy
//! - Metrics, health and lifecycle (reset / destroy)

#[cfg(test)]
pub mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use crate::bus::{registry, EventBatcher, EventType, FlushReason};
    use crate::config::{BatcherConfig, BatcherConfigPatch};
    use crate::error::ListenerError;
    use crate::tests::{event_at, ids, raw_event, recorder};

    fn batcher(config: BatcherConfig) -> EventBatcher {
        EventBatcher::new(config).unwrap()
    }

    /// No timer, no burst: only size and manual flush.
    fn quiet_config() -> BatcherConfig {
        BatcherConfig {
            flush_on_idle: false,
            burst_threshold: 1_000,
            ..BatcherConfig::default()
        }
    }

    // ====================================================================================
    // FLUSH TRIGGERS
    // ====================================================================================

    #[tokio::test]
    async fn test_single_event_flushes_after_window() {
        let batcher = batcher(BatcherConfig {
            window_ms: 50,
            ..BatcherConfig::default()
        });
        let (seen, listener) = recorder();
        batcher.subscribe(listener);

        batcher.add_event(event_at("only", "s1", 0));
        assert!(seen.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(ids(&seen[0]), vec!["only"]);
        assert_eq!(seen[0].reason, FlushReason::Timeout);
    }

    #[tokio::test]
    async fn test_size_trigger_flushes_synchronously() {
        let batcher = batcher(BatcherConfig {
            max_batch_size: 3,
            window_ms: 60_000,
            ..BatcherConfig::default()
        });
        let (seen, listener) = recorder();
        batcher.subscribe(listener);

        for i in 0..3 {
            batcher.add_event(event_at(&format!("e{i}"), "s1", i));
        }

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].len(), 3);
        assert_eq!(seen[0].reason, FlushReason::Size);
        assert_eq!(batcher.metrics().current_batch_size, 0);
    }

    #[tokio::test]
    async fn test_burst_flushes_without_waiting_for_window() {
        let batcher = batcher(BatcherConfig {
            burst_threshold: 10,
            window_ms: 60_000,
            ..BatcherConfig::default()
        });
        let (seen, listener) = recorder();
        batcher.subscribe(listener);

        batcher.add_events((0..15).map(|i| event_at(&format!("e{i}"), "s1", i)));

        let seen = seen.lock().unwrap();
        assert!(!seen.is_empty());
        assert_eq!(seen[0].reason, FlushReason::Burst);
        assert_eq!(seen[0].len(), 11);
        assert_eq!(batcher.metrics().current_batch_size, 4);
    }

    #[tokio::test]
    async fn test_priority_type_flushes_buffer_with_it() {
        let batcher = batcher(BatcherConfig {
            priority_types: vec![EventType::Error],
            ..quiet_config()
        });
        let (seen, listener) = recorder();
        batcher.subscribe(listener);

        batcher.add_event(event_at("a", "s1", 0));
        let mut failure = event_at("b", "s1", 1);
        failure.event_type = EventType::Error;
        batcher.add_event(failure);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].reason, FlushReason::Priority);
        assert_eq!(ids(&seen[0]), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_manual_flush_and_empty_noop() {
        let batcher = batcher(quiet_config());
        let (seen, listener) = recorder();
        batcher.subscribe(listener);

        batcher.flush();
        assert!(seen.lock().unwrap().is_empty());

        batcher.add_event(event_at("a", "s1", 0));
        batcher.flush();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].reason, FlushReason::Manual);
    }

    #[tokio::test]
    async fn test_window_is_anchored_to_first_event_of_cycle() {
        let batcher = batcher(BatcherConfig {
            window_ms: 100,
            ..BatcherConfig::default()
        });
        let (seen, listener) = recorder();
        batcher.subscribe(listener);

        batcher.add_event(event_at("first", "s1", 0));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(seen.lock().unwrap().is_empty());

        // A later arrival must not push the deadline out.
        batcher.add_event(event_at("second", "s1", 1));
        tokio::time::sleep(Duration::from_millis(70)).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(ids(&seen[0]), vec!["first", "second"]);
        assert_eq!(seen[0].reason, FlushReason::Timeout);
    }

    #[tokio::test]
    async fn test_idle_flush_disabled_keeps_buffer() {
        let batcher = batcher(BatcherConfig {
            window_ms: 20,
            ..quiet_config()
        });
        let (seen, listener) = recorder();
        batcher.subscribe(listener);

        batcher.add_event(event_at("a", "s1", 0));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(batcher.metrics().current_batch_size, 1);
    }

    // ====================================================================================
    // ORDERING / DELIVERY
    // ====================================================================================

    #[tokio::test]
    async fn test_preserve_order_sorts_stably() {
        let batcher = batcher(quiet_config());
        let (seen, listener) = recorder();
        batcher.subscribe(listener);

        batcher.add_event(event_at("late", "s1", 30));
        batcher.add_event(event_at("tie-1", "s1", 10));
        batcher.add_event(event_at("early", "s1", 0));
        batcher.add_event(event_at("tie-2", "s1", 10));
        batcher.flush();

        let seen = seen.lock().unwrap();
        assert_eq!(ids(&seen[0]), vec!["early", "tie-1", "tie-2", "late"]);
        for pair in seen[0].events.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }

    #[tokio::test]
    async fn test_arrival_order_without_preserve_order() {
        let batcher = batcher(BatcherConfig {
            preserve_order: false,
            ..quiet_config()
        });
        let (seen, listener) = recorder();
        batcher.subscribe(listener);

        batcher.add_event(event_at("late", "s1", 30));
        batcher.add_event(event_at("early", "s1", 0));
        batcher.flush();

        assert_eq!(ids(&seen.lock().unwrap()[0]), vec!["late", "early"]);
    }

    #[tokio::test]
    async fn test_every_event_delivered_exactly_once() {
        let batcher = batcher(BatcherConfig {
            max_batch_size: 7,
            burst_threshold: 5,
            window_ms: 20,
            ..BatcherConfig::default()
        });
        let (seen, listener) = recorder();
        batcher.subscribe(listener);

        for i in 0..40 {
            batcher.add_event(event_at(&format!("e{i}"), "s1", 40 - i));
            if i % 13 == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
        tokio::time::sleep(Duration::from_millis(150)).await;

        let seen = seen.lock().unwrap();
        let mut counts: HashMap<String, usize> = HashMap::new();
        for batch in seen.iter() {
            assert!(batch.len() <= 7);
            for id in ids(batch) {
                *counts.entry(id).or_default() += 1;
            }
        }
        assert_eq!(counts.len(), 40);
        assert!(counts.values().all(|n| *n == 1));
        assert_eq!(batcher.metrics().processed_count, 40);
    }

    #[tokio::test]
    async fn test_shrinking_max_batch_size_splits_buffer() {
        let batcher = batcher(quiet_config());
        let (seen, listener) = recorder();
        batcher.subscribe(listener);

        for i in 0..5 {
            batcher.add_event(event_at(&format!("e{i}"), "s1", i));
        }
        batcher
            .update_config(&BatcherConfigPatch {
                max_batch_size: Some(2),
                ..Default::default()
            })
            .unwrap();
        batcher.add_event(event_at("e5", "s1", 5));

        let seen = seen.lock().unwrap();
        let sizes: Vec<_> = seen.iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![2, 2, 2]);
        assert!(seen.iter().all(|b| b.reason == FlushReason::Size));
    }

    #[tokio::test]
    async fn test_split_flush_reports_one_throughput_sample() {
        let batcher = batcher(quiet_config());
        let (seen, listener) = recorder();
        batcher.subscribe(listener);

        for i in 0..5 {
            batcher.add_event(event_at(&format!("e{i}"), "s1", i));
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        batcher
            .update_config(&BatcherConfigPatch {
                max_batch_size: Some(2),
                ..Default::default()
            })
            .unwrap();
        batcher.add_event(event_at("e5", "s1", 5));

        assert_eq!(seen.lock().unwrap().len(), 3);
        let metrics = batcher.metrics();
        assert_eq!(metrics.batches_flushed, 3);
        assert_eq!(metrics.processed_count, 6);
        // Six events over roughly half a second, not two events over zero time.
        assert!(metrics.throughput > 0.0 && metrics.throughput < 100.0, "{}", metrics.throughput);
    }

    // ====================================================================================
    // LISTENERS
    // ====================================================================================

    #[tokio::test]
    async fn test_failing_listener_does_not_block_others() {
        let batcher = batcher(quiet_config());
        batcher.subscribe(|_| Err(ListenerError::new("storage unavailable")));
        batcher.subscribe(|_| panic!("listener bug"));
        let (seen, listener) = recorder();
        batcher.subscribe(listener);

        for round in 0..3 {
            batcher.add_event(event_at(&format!("e{round}"), "s1", round));
            batcher.flush();
        }

        assert_eq!(seen.lock().unwrap().len(), 3);
        let metrics = batcher.metrics();
        assert_eq!(metrics.listener_errors, 6);
        assert_eq!(metrics.processed_count, 3);
        assert_eq!(metrics.queue_length, 0);
        assert!(batcher.is_healthy());
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_only_that_listener() {
        let batcher = batcher(quiet_config());
        let (first_seen, first) = recorder();
        let (second_seen, second) = recorder();
        let first_sub = batcher.subscribe(first);
        batcher.subscribe(second);

        assert!(first_sub.unsubscribe());
        assert_eq!(batcher.listener_count(), 1);

        batcher.add_event(event_at("a", "s1", 0));
        batcher.flush();
        assert!(first_seen.lock().unwrap().is_empty());
        assert_eq!(second_seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_listeners_run_in_subscription_order() {
        let batcher = batcher(quiet_config());
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for name in ["first", "second", "third"] {
            let order = order.clone();
            batcher.subscribe(move |_| {
                order.lock().unwrap().push(name);
                Ok(())
            });
        }

        batcher.add_event(event_at("a", "s1", 0));
        batcher.flush();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_reentrant_flush_from_listener_is_queued() {
        let batcher = batcher(quiet_config());
        let (seen, recorder_listener) = recorder();
        let calls = Arc::new(AtomicUsize::new(0));

        let inner = batcher.clone();
        let counter = calls.clone();
        batcher.subscribe(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                inner.add_event(event_at("follow-up", "s1", 1));
                inner.flush();
            }
            Ok(())
        });
        batcher.subscribe(recorder_listener);

        batcher.add_event(event_at("first", "s1", 0));
        batcher.flush();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(ids(&seen[0]), vec!["first"]);
        assert_eq!(ids(&seen[1]), vec!["follow-up"]);
        drop(seen);
        batcher.destroy();
    }

    // ====================================================================================
    // METRICS / HEALTH / LIFECYCLE
    // ====================================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_flush_and_settle_waits_for_timer_delivery() {
        let batcher = batcher(BatcherConfig {
            window_ms: 20,
            ..BatcherConfig::default()
        });
        let (seen, record) = recorder();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        batcher.subscribe(move |batch| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                std::thread::sleep(Duration::from_millis(100));
            }
            record(batch)
        });

        batcher.add_event(event_at("a", "s1", 0));
        // The timer task is now stuck inside the slow first delivery.
        tokio::time::sleep(Duration::from_millis(40)).await;
        batcher.add_event(event_at("b", "s1", 1));

        batcher.flush_and_settle().await;
        assert_eq!(batcher.metrics().queue_length, 0);
        batcher.destroy();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(ids(&seen[0]), vec!["a"]);
        assert_eq!(ids(&seen[1]), vec!["b"]);
        assert_eq!(seen[1].reason, FlushReason::Manual);
    }

    #[tokio::test]
    async fn test_invalid_events_counted_not_buffered() {
        let batcher = batcher(quiet_config());
        batcher.add_event(event_at("", "s1", 0));
        batcher.add_event(event_at("ok", " ", 0));
        batcher.add_raw(&raw_event("r1", "s1", "not_a_hook"));
        batcher.add_raw(&raw_event("r2", "s1", "stop"));

        let metrics = batcher.metrics();
        assert_eq!(metrics.error_count, 3);
        assert_eq!(metrics.current_batch_size, 1);
        assert_eq!(batcher.processor_metrics().success_count, 1);
    }

    #[tokio::test]
    async fn test_high_water_mark_drives_health() {
        let batcher = batcher(BatcherConfig {
            high_water_mark: 5,
            ..quiet_config()
        });
        for i in 0..5 {
            batcher.add_event(event_at(&format!("e{i}"), "s1", i));
        }
        assert!(batcher.is_healthy());
        batcher.add_event(event_at("e5", "s1", 5));
        assert!(!batcher.is_healthy());

        batcher.flush();
        assert!(batcher.is_healthy());
    }

    #[tokio::test]
    async fn test_reset_zeroes_counters_but_keeps_subscribers() {
        let batcher = batcher(BatcherConfig {
            max_batch_size: 9,
            ..quiet_config()
        });
        let (seen, listener) = recorder();
        batcher.subscribe(listener);
        batcher.add_event(event_at("a", "s1", 0));
        batcher.add_event(event_at("", "s1", 0));
        batcher.flush();

        batcher.reset();
        let metrics = batcher.metrics();
        assert_eq!(metrics.processed_count, 0);
        assert_eq!(metrics.error_count, 0);
        assert!(metrics.last_processed_at.is_none());
        assert_eq!(batcher.config().max_batch_size, 9);

        batcher.add_event(event_at("b", "s1", 0));
        batcher.flush();
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_destroy_drops_later_input() {
        let batcher = batcher(BatcherConfig {
            window_ms: 20,
            ..BatcherConfig::default()
        });
        let (seen, listener) = recorder();
        batcher.subscribe(listener);
        batcher.add_event(event_at("before", "s1", 0));

        batcher.destroy();
        batcher.add_event(event_at("after", "s1", 0));
        batcher.flush();

        let metrics = batcher.metrics();
        assert_eq!(metrics.queue_length, 0);
        assert_eq!(metrics.current_batch_size, 0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(seen.lock().unwrap().is_empty());
        assert!(batcher.is_destroyed());
        assert!(!batcher.is_healthy());
        assert_eq!(batcher.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_update_config_rejects_misuse() {
        let batcher = batcher(BatcherConfig::default());
        let err = batcher.update_config(&BatcherConfigPatch {
            window_ms: Some(0),
            ..Default::default()
        });
        assert!(err.is_err());
        assert_eq!(batcher.config(), BatcherConfig::default());

        let updated = batcher
            .update_config(&BatcherConfigPatch {
                burst_threshold: Some(3),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(updated.burst_threshold, 3);
        assert_eq!(updated.window_ms, 100);
    }

    #[test]
    fn test_registry_instance_is_shared() {
        let _guard = registry::REGISTRY_TEST_MUTEX
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        registry::reset_instance();

        let batcher = registry::get_instance();
        let (seen, listener) = recorder();
        batcher.subscribe(listener);

        registry::get_instance().add_event(event_at("via-registry", "s1", 0));
        registry::get_instance().flush();
        assert_eq!(ids(&seen.lock().unwrap()[0]), vec!["via-registry"]);

        registry::reset_instance();
        assert!(batcher.is_destroyed());
    }

    #[test]
    fn test_registry_instance_built_outside_runtime_still_times_out() {
        let _guard = registry::REGISTRY_TEST_MUTEX
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        registry::reset_instance();

        let batcher = registry::get_instance();
        let (seen, listener) = recorder();
        batcher.subscribe(listener);

        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            registry::get_instance().add_event(event_at("late-runtime", "s1", 0));
            tokio::time::sleep(Duration::from_millis(400)).await;
        });

        {
            let seen = seen.lock().unwrap();
            assert_eq!(seen.len(), 1);
            assert_eq!(ids(&seen[0]), vec!["late-runtime"]);
            assert_eq!(seen[0].reason, FlushReason::Timeout);
        }
        registry::reset_instance();
    }
}
