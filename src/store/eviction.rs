//! Eviction candidate ordering
//!
//! Every policy shares two preconditions handled by the caller: expired
//! items go first, and eviction stops once usage drops under the target.

use super::models::{EvictionPolicy, ItemMeta, SmartWeights};
use std::cmp::Ordering;

/// Sort live (non-expired) items into eviction order for a policy. The item
/// at index 0 is evicted first.
pub fn order_candidates(
    items: &mut Vec<ItemMeta>,
    policy: EvictionPolicy,
    now: i64,
    weights: &SmartWeights,
) {
    match policy {
        EvictionPolicy::Lru => items.sort_by_key(|item| item.last_accessed),
        EvictionPolicy::Lfu => {
            items.sort_by(|a, b| {
                a.access_count
                    .cmp(&b.access_count)
                    .then(a.last_accessed.cmp(&b.last_accessed))
            });
        }
        EvictionPolicy::Fifo => items.sort_by_key(|item| item.created_at),
        EvictionPolicy::Expire => {
            // Soonest expiry first; unexpiring items are last resorts
            items.sort_by(|a, b| match (a.expire_at, b.expire_at) {
                (Some(a_at), Some(b_at)) => a_at.cmp(&b_at),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => a.last_accessed.cmp(&b.last_accessed),
            });
        }
        EvictionPolicy::Size => {
            items.sort_by(|a, b| b.size.cmp(&a.size).then(a.last_accessed.cmp(&b.last_accessed)));
        }
        EvictionPolicy::Priority => {
            items.sort_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then(a.last_accessed.cmp(&b.last_accessed))
            });
        }
        EvictionPolicy::Smart => {
            items.sort_by(|a, b| {
                let score_a = a.smart_score(now, weights);
                let score_b = b.smart_score(now, weights);
                score_b.partial_cmp(&score_a).unwrap_or(Ordering::Equal)
            });
        }
    }
}
