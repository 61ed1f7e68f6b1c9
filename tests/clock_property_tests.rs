//! Property tests for the vector-clock partial order and the resolver's
//! determinism guarantees.

use meshdb::{ClockOrdering, VectorClock};
use proptest::prelude::*;

fn arb_clock() -> impl Strategy<Value = VectorClock> {
    proptest::collection::hash_map("[a-d]", 0u64..8, 0..4).prop_map(|clocks| {
        let mut clock = VectorClock::new();
        for (peer, n) in clocks {
            clock.clocks.insert(peer, n);
        }
        clock
    })
}

proptest! {
    #[test]
    fn compare_is_antisymmetric(a in arb_clock(), b in arb_clock()) {
        let forward = a.compare(&b);
        let backward = b.compare(&a);
        match forward {
            ClockOrdering::Equal => prop_assert_eq!(backward, ClockOrdering::Equal),
            ClockOrdering::Before => prop_assert_eq!(backward, ClockOrdering::After),
            ClockOrdering::After => prop_assert_eq!(backward, ClockOrdering::Before),
            ClockOrdering::Concurrent => prop_assert_eq!(backward, ClockOrdering::Concurrent),
        }
    }

    #[test]
    fn merge_is_commutative(a in arb_clock(), b in arb_clock()) {
        prop_assert_eq!(a.merge(&b), b.merge(&a));
    }

    #[test]
    fn merge_is_idempotent(a in arb_clock(), b in arb_clock()) {
        let merged = a.merge(&b);
        prop_assert_eq!(merged.merge(&b), merged.clone());
        prop_assert_eq!(merged.merge(&a), merged);
    }

    #[test]
    fn merge_dominates_inputs(a in arb_clock(), b in arb_clock()) {
        let merged = a.merge(&b);
        prop_assert!(matches!(
            a.compare(&merged),
            ClockOrdering::Equal | ClockOrdering::Before
        ));
        prop_assert!(matches!(
            b.compare(&merged),
            ClockOrdering::Equal | ClockOrdering::Before
        ));
    }

    #[test]
    fn increment_strictly_advances(a in arb_clock(), peer in "[a-d]") {
        let mut bumped = a.clone();
        bumped.increment(&peer);
        prop_assert_eq!(a.compare(&bumped), ClockOrdering::Before);
        prop_assert!(a.happens_before(&bumped));
    }

    #[test]
    fn self_comparison_is_equal(a in arb_clock()) {
        prop_assert_eq!(a.compare(&a), ClockOrdering::Equal);
        prop_assert!(a.happens_before(&a));
    }
}
