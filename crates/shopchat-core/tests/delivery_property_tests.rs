//! Property-based tests for delivery invariants
//!
//! These tests verify the reconnect backoff formula, fingerprint determinism,
//! queue deduplication, and FIFO ordering across arbitrary inputs.

use proptest::prelude::*;
use shopchat_core::config::{ConnectionConfig, SendConfig};
use shopchat_core::connection::reconnect_delay;
use shopchat_core::queue::{DraftBody, DrainStep, Fingerprint, SendDraft, SendQueue};
use shopchat_core::types::{ConversationId, Timestamp};

/// Generate arbitrary draft content
fn arb_content() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z0-9 .,!?]{0,100}").unwrap()
}

fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
    (0u64..=1_700_000_000_000u64).prop_map(Timestamp::new)
}

fn draft(content: &str, created_at: Timestamp) -> SendDraft {
    SendDraft::new(
        ConversationId::from("conv"),
        DraftBody::Text {
            content: content.to_string(),
        },
        created_at,
        &SendConfig::default(),
    )
}

proptest! {
    /// Property: reconnect delay is base * 2^(n-1) capped at max, never zero
    /// for a non-zero base, and monotonically non-decreasing in the attempt
    #[test]
    fn reconnect_delay_monotonic_and_capped(
        base in 1u64..10_000,
        max in 1u64..120_000,
        attempt in 1u32..100,
    ) {
        let config = ConnectionConfig {
            base_delay_ms: base,
            max_delay_ms: max,
            ..ConnectionConfig::default()
        };
        let delay = reconnect_delay(&config, attempt).as_millis() as u64;
        prop_assert!(delay <= max);
        prop_assert!(delay >= base.min(max));

        let next = reconnect_delay(&config, attempt + 1).as_millis() as u64;
        prop_assert!(next >= delay);

        // Exact formula below the cap
        if attempt <= 30 && base.checked_shl(attempt - 1).map(|v| v <= max).unwrap_or(false) {
            prop_assert_eq!(delay, base << (attempt - 1));
        }
    }

    /// Property: retry delay doubles per attempt until the optional cap
    #[test]
    fn retry_delay_doubles(base in 1u64..10_000, attempt in 1u32..20) {
        let config = SendConfig {
            base_retry_delay_ms: base,
            max_retry_delay_ms: None,
            ..SendConfig::default()
        };
        prop_assert_eq!(config.retry_delay_ms(attempt), base << (attempt - 1));
    }

    /// Property: fingerprints are deterministic and depend only on the
    /// truncated content prefix
    #[test]
    fn fingerprint_deterministic(content in arb_content(), at in arb_timestamp()) {
        let conv = ConversationId::from("conv");
        let body = DraftBody::Text { content: content.clone() };
        let a = Fingerprint::compute(&conv, &body, at, 32);
        let b = Fingerprint::compute(&conv, &body, at, 32);
        prop_assert_eq!(&a, &b);

        // Anything appended past the prefix cannot change the fingerprint
        if content.chars().count() >= 32 {
            let extended = DraftBody::Text { content: format!("{content}-tail") };
            prop_assert_eq!(a, Fingerprint::compute(&conv, &extended, at, 32));
        }
    }

    /// Property: enqueuing the same draft twice while the first is live
    /// resolves to the same queue id and a single stored item
    #[test]
    fn dedup_absorbs_duplicates(content in arb_content(), at in arb_timestamp()) {
        let mut queue = SendQueue::new(SendConfig::default());
        let first = queue.enqueue(draft(&content, at), at);
        let second = queue.enqueue(draft(&content, at), at);
        prop_assert_eq!(first.queue_id(), second.queue_id());
        prop_assert_eq!(queue.len(), 1);
    }

    /// Property: the drain always yields items in enqueue order
    #[test]
    fn drain_is_fifo(count in 1usize..10) {
        let mut queue = SendQueue::new(SendConfig::default());
        let now = Timestamp::new(1_000);
        let mut expected = Vec::new();
        for n in 0..count {
            let outcome = queue.enqueue(draft(&format!("msg {n}"), now), now);
            expected.push(outcome.queue_id().clone());
        }

        let mut drained = Vec::new();
        while let DrainStep::Ready(id) = queue.next_ready(now) {
            queue.mark_sending(&id);
            queue.mark_sent(&id, now);
            drained.push(id);
        }
        prop_assert_eq!(drained, expected);
    }
}
