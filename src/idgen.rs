//! Process-wide unique id generation.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

/// Number of ids handed to a thread at a time. Large enough to keep threads
/// off the shared counter, small enough that a pathological thread-per-id
/// workload cannot meaningfully dent the 64-bit space.
const RANGE_SIZE: u64 = 2048;

const _: () = assert!(RANGE_SIZE.is_power_of_two());

static GLOBAL_COUNTER: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static LOCAL_COUNTER: Cell<u64> = const { Cell::new(0) };
}

/// Returns a strictly positive id, unique for the lifetime of the process.
///
/// Ids handed to a single thread are strictly increasing. Allocating one id
/// per nanosecond would take over 500 years to wrap, so exhaustion is not a
/// practical concern.
pub fn generate_unique_id() -> u64 {
    LOCAL_COUNTER.with(|local| {
        let mut current = local.get();
        if current % RANGE_SIZE == 0 {
            current = GLOBAL_COUNTER.fetch_add(RANGE_SIZE, Ordering::Relaxed);
        }
        current += 1;
        local.set(current);
        current
    })
}

#[cfg(test)]
mod tests {
    use super::generate_unique_id;

    #[test]
    fn ids_are_positive_and_increasing() {
        let mut previous = 0;
        for _ in 0..10_000 {
            let id = generate_unique_id();
            assert!(id > 0);
            assert!(id > previous);
            previous = id;
        }
    }

    #[test]
    fn ids_are_distinct_across_threads() {
        use std::collections::HashSet;
        use std::thread;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                thread::spawn(|| {
                    (0..RANGE_COUNT).map(|_| generate_unique_id()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "id {id} handed out twice");
            }
        }
    }

    // Enough to force several range refills per thread.
    const RANGE_COUNT: usize = 10_000;
}
