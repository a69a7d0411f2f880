//! Order-convergence properties of the view buffer: any arrival
//! permutation of a finite event set, including duplicated delivery,
//! settles into the same final view as sequence-order delivery.

use core::time::Duration;

use liveboard_primitives::event::{Event, SequenceNo};
use rand::seq::SliceRandom;

use crate::buffer::ViewBuffer;
use crate::test_utils::{delete, insert, topic, update, Note};

/// Apply events in the given order to a fresh buffer; the window is long
/// enough that nothing deferred is ever evicted mid-test.
fn final_state(events: Vec<Event<Note>>) -> (Vec<Note>, SequenceNo) {
    let mut buffer = ViewBuffer::new(topic(), Duration::from_secs(60));
    let mut sink = Vec::new();

    for event in events {
        let _outcome = buffer.apply(event, &mut sink);
    }

    (buffer.snapshot(), buffer.last_accepted())
}

fn permutations<T: Clone>(items: &[T]) -> Vec<Vec<T>> {
    if items.len() <= 1 {
        return vec![items.to_vec()];
    }

    let mut out = Vec::new();

    for index in 0..items.len() {
        let mut rest = items.to_vec();
        let head = rest.remove(index);

        for mut tail in permutations(&rest) {
            let mut permutation = Vec::with_capacity(items.len());
            permutation.push(head.clone());
            permutation.append(&mut tail);
            out.push(permutation);
        }
    }

    out
}

/// Two records, one full lifecycle each: insert/update/re-update for one,
/// insert/delete for the other. Timestamps are consistent with sequence
/// assignment, as the backend guarantees.
fn lifecycle() -> Vec<Event<Note>> {
    vec![
        insert("d-1", "first", 100, 1),
        update("d-1", "second", 105, 2),
        insert("d-2", "other", 106, 3),
        delete("d-2", 110, 4),
        update("d-1", "third", 112, 5),
    ]
}

fn sequence_numbers(events: &[Event<Note>]) -> Vec<u64> {
    events.iter().map(|event| event.sequence_no.get()).collect()
}

#[test]
fn every_permutation_of_a_lifecycle_converges() {
    let canonical = final_state(lifecycle());

    for permutation in permutations(&lifecycle()) {
        let order = sequence_numbers(&permutation);

        assert_eq!(
            final_state(permutation),
            canonical,
            "arrival order {order:?} diverged from sequence order"
        );
    }
}

#[test]
fn reversed_arrival_converges() {
    let canonical = final_state(lifecycle());

    let mut reversed = lifecycle();
    reversed.reverse();

    assert_eq!(
        final_state(reversed),
        canonical,
        "fully reversed delivery diverged"
    );
}

#[test]
fn duplicated_delivery_in_any_order_converges() {
    let canonical = final_state(lifecycle());

    for permutation in permutations(&lifecycle()) {
        // Every event delivered twice, back to back.
        let doubled: Vec<Event<Note>> = permutation
            .into_iter()
            .flat_map(|event| [event.clone(), event])
            .collect();

        let order = sequence_numbers(&doubled);

        assert_eq!(
            final_state(doubled),
            canonical,
            "doubled arrival order {order:?} diverged"
        );
    }
}

#[test]
fn random_shuffles_of_interleaved_records_converge() {
    let events = vec![
        insert("d-1", "a1", 100, 1),
        insert("d-2", "b1", 101, 2),
        update("d-2", "b2", 103, 3),
        insert("d-3", "c1", 104, 4),
        update("d-1", "a2", 106, 5),
        delete("d-3", 108, 6),
        update("d-2", "b3", 109, 7),
        insert("d-4", "e1", 111, 8),
        delete("d-1", 113, 9),
        insert("d-1", "a3", 115, 10),
    ];

    let canonical = final_state(events.clone());
    let mut rng = rand::thread_rng();

    for round in 0..200 {
        let mut shuffled = events.clone();
        shuffled.shuffle(&mut rng);

        let order = sequence_numbers(&shuffled);

        assert_eq!(
            final_state(shuffled),
            canonical,
            "round {round}: arrival order {order:?} diverged"
        );
    }
}
