//! Property-based tests for command queue ordering
//!
//! These tests drive the queue with arbitrary interleavings of submissions,
//! acknowledgements, expiries and resets, and check that dispatch order
//! matches submission order with never more than one command in flight.

use blecentral_core::queue::{CommandId, CommandKind, CommandQueue, Completion};
use proptest::prelude::*;
use std::time::Duration;

#[derive(Debug, Clone)]
enum Step {
    Submit,
    Ack,
    Expire,
    LateAck,
    Reset,
}

fn arb_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => Just(Step::Submit),
        3 => Just(Step::Ack),
        1 => Just(Step::Expire),
        1 => Just(Step::LateAck),
        1 => Just(Step::Reset),
    ]
}

/// Generate an arbitrary command kind
fn arb_kind() -> impl Strategy<Value = CommandKind> {
    prop_oneof![
        Just(CommandKind::Read),
        Just(CommandKind::Write),
        Just(CommandKind::WriteWithoutResponse),
        Just(CommandKind::Subscribe),
        Just(CommandKind::Unsubscribe),
    ]
}

proptest! {
    /// Property: commands reach the backend in submission order, one at a time
    #[test]
    fn dispatch_follows_submission_order(
        steps in prop::collection::vec(arb_step(), 1..200),
        kind in arb_kind(),
    ) {
        let mut queue: CommandQueue<u64> = CommandQueue::new(1);
        let mut submitted = Vec::new();
        let mut dispatched = Vec::new();
        let mut retired: Vec<CommandId> = Vec::new();
        let mut counter = 0u64;

        for step in steps {
            match step {
                Step::Submit => {
                    queue.enqueue(kind, Some(Duration::from_millis(5)), counter);
                    submitted.push(counter);
                    counter += 1;
                }
                Step::Ack => {
                    if let Some(id) = queue.in_flight().map(|c| c.id) {
                        let resolved = matches!(queue.complete(id), Completion::Resolved(_));
                        prop_assert!(resolved);
                        retired.push(id);
                    }
                }
                Step::Expire => {
                    if let Some(id) = queue.in_flight().map(|c| c.id) {
                        prop_assert!(queue.expire(id).is_some());
                        retired.push(id);
                    }
                }
                Step::LateAck => {
                    if let Some(id) = retired.last().copied() {
                        let stale = matches!(queue.complete(id), Completion::Stale);
                        prop_assert!(stale);
                    }
                }
                Step::Reset => {
                    let next_generation = queue.generation() + 1;
                    for command in queue.reset(next_generation) {
                        retired.push(command.id);
                        // Drained commands count as dispatched-and-cancelled
                        dispatched.push(command.payload);
                    }
                }
            }

            if let Some(command) = queue.start_next() {
                dispatched.push(command.payload);
            }
            // A second promotion while one is in flight must be refused
            prop_assert!(queue.start_next().is_none());
            prop_assert!(queue.len() <= submitted.len());
        }

        for command in queue.reset(queue.generation() + 1) {
            dispatched.push(command.payload);
        }

        dispatched.dedup();
        prop_assert_eq!(dispatched, submitted);
    }

    /// Property: an id the queue never issued is always reported as unknown
    #[test]
    fn unissued_ids_are_unknown(submissions in 0usize..20, offset in 0u64..1000) {
        let mut queue: CommandQueue<()> = CommandQueue::new(7);
        for _ in 0..submissions {
            queue.enqueue(CommandKind::Read, None, ());
        }
        let bogus = CommandId { generation: 7, seq: submissions as u64 + offset };
        let unknown = matches!(queue.complete(bogus), Completion::Unknown);
        prop_assert!(unknown);
    }
}
