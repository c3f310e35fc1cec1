//! Model-based conservation check for the pointer ring.
//!
//! Sequential operation mixes are compared against a bounded VecDeque
//! oracle: same acceptance, same elements out, same order, nothing lost
//! or duplicated.

use std::collections::VecDeque;
use std::ptr::NonNull;

use proptest::prelude::*;

use blackbox::PtrRing;

fn fake(i: usize) -> NonNull<u8> {
    NonNull::new(i as *mut u8).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    #[test]
    fn sequential_ops_match_bounded_queue_model(
        capacity in 1usize..32,
        ops in prop::collection::vec(any::<bool>(), 0..256),
    ) {
        let ring: PtrRing<u8> = PtrRing::new(capacity);
        let mut model: VecDeque<usize> = VecDeque::new();
        let mut next = 1usize;

        for enqueue in ops {
            if enqueue {
                if ring.try_enqueue(fake(next)).is_ok() {
                    prop_assert!(model.len() < capacity, "accepted while model full");
                    model.push_back(next);
                    next += 1;
                } else {
                    prop_assert_eq!(model.len(), capacity, "rejected while model had room");
                }
            } else {
                let got = ring.try_dequeue().map(|p| p.as_ptr() as usize);
                prop_assert_eq!(got, model.pop_front());
            }
        }

        // Drain: everything the model still holds comes out, in order,
        // and then the ring is empty.
        while let Some(expected) = model.pop_front() {
            prop_assert_eq!(
                ring.try_dequeue().map(|p| p.as_ptr() as usize),
                Some(expected)
            );
        }
        prop_assert!(ring.try_dequeue().is_none());
    }

    #[test]
    fn refilling_never_wedges(capacity in 1usize..16, laps in 1usize..8) {
        let ring: PtrRing<u8> = PtrRing::new(capacity);
        let mut next = 1usize;

        // Fill to the brim and drain completely, several laps: cursor
        // wraparound over the slot array must not strand a slot.
        for _ in 0..laps {
            for _ in 0..capacity {
                prop_assert!(ring.try_enqueue(fake(next)).is_ok());
                next += 1;
            }
            prop_assert!(ring.try_enqueue(fake(usize::MAX)).is_err());
            for _ in 0..capacity {
                prop_assert!(ring.try_dequeue().is_some());
            }
            prop_assert!(ring.try_dequeue().is_none());
        }
    }
}
