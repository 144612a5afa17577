//! Command Queue
//!
//! FIFO of pending GATT commands for one session with at most one command in
//! flight. The queue is generic over the payload the runtime attaches (reply
//! channels, operation arguments) and only tracks identity and ordering.
//!
//! Every command is identified by a [`CommandId`] carrying the session
//! generation it was created under and a sequence number. Completions are
//! classified against the queue so that late acks for timed-out commands and
//! continuations from an earlier connection are recognised and ignored.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use crate::errors::GattOperation;

// ----------------------------------------------------------------------------
// Command Identity
// ----------------------------------------------------------------------------

/// Generation + sequence number of one command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId {
    pub generation: u64,
    pub seq: u64,
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}#{}", self.generation, self.seq)
    }
}

/// Operation a command performs on the link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Read,
    Write,
    WriteWithoutResponse,
    Subscribe,
    Unsubscribe,
    ReadDescriptor,
    WriteDescriptor,
    Discover,
}

impl CommandKind {
    /// Error category used when the backend rejects this command
    pub fn operation(&self) -> GattOperation {
        match self {
            CommandKind::Read => GattOperation::Read,
            CommandKind::Write | CommandKind::WriteWithoutResponse => GattOperation::Write,
            CommandKind::Subscribe => GattOperation::Subscribe,
            CommandKind::Unsubscribe => GattOperation::Unsubscribe,
            CommandKind::ReadDescriptor => GattOperation::ReadDescriptor,
            CommandKind::WriteDescriptor => GattOperation::WriteDescriptor,
            CommandKind::Discover => GattOperation::Discover,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandKind::WriteWithoutResponse => f.write_str("write without response"),
            other => write!(f, "{}", other.operation()),
        }
    }
}

/// A command owned by the queue
#[derive(Debug)]
pub struct QueuedCommand<T> {
    pub id: CommandId,
    pub kind: CommandKind,
    /// Deadline measured from dispatch
    pub timeout: Option<Duration>,
    pub payload: T,
}

/// Classification of a completion reported for a command id
#[derive(Debug)]
pub enum Completion<T> {
    /// The in-flight command; it is removed and returned for resolution
    Resolved(QueuedCommand<T>),
    /// Already resolved (timed out or cancelled) or from an earlier generation
    Stale,
    /// Never issued by this queue: an adapter contract violation
    Unknown,
}

// ----------------------------------------------------------------------------
// Queue
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct CommandQueue<T> {
    generation: u64,
    next_seq: u64,
    pending: VecDeque<QueuedCommand<T>>,
    in_flight: Option<QueuedCommand<T>>,
}

impl<T> CommandQueue<T> {
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            next_seq: 0,
            pending: VecDeque::new(),
            in_flight: None,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Append a command and return its id
    pub fn enqueue(&mut self, kind: CommandKind, timeout: Option<Duration>, payload: T) -> CommandId {
        let id = CommandId {
            generation: self.generation,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.pending.push_back(QueuedCommand {
            id,
            kind,
            timeout,
            payload,
        });
        id
    }

    /// Promote the oldest pending command to in flight.
    ///
    /// Returns `None` while another command is in flight or nothing is queued.
    pub fn start_next(&mut self) -> Option<&mut QueuedCommand<T>> {
        if self.in_flight.is_some() {
            return None;
        }
        self.in_flight = self.pending.pop_front();
        self.in_flight.as_mut()
    }

    /// Resolve the in-flight command if `id` names it
    pub fn complete(&mut self, id: CommandId) -> Completion<T> {
        if self.in_flight.as_ref().is_some_and(|c| c.id == id) {
            return match self.in_flight.take() {
                Some(command) => Completion::Resolved(command),
                None => Completion::Stale,
            };
        }
        if id.generation < self.generation || (id.generation == self.generation && id.seq < self.next_seq) {
            Completion::Stale
        } else {
            Completion::Unknown
        }
    }

    /// Remove the in-flight command because its deadline expired.
    ///
    /// Returns `None` when the command already resolved; the timer lost the race.
    pub fn expire(&mut self, id: CommandId) -> Option<QueuedCommand<T>> {
        match self.complete(id) {
            Completion::Resolved(command) => Some(command),
            Completion::Stale | Completion::Unknown => None,
        }
    }

    /// Remove every command, in-flight first then submission order, and move
    /// the queue to `generation`
    pub fn reset(&mut self, generation: u64) -> Vec<QueuedCommand<T>> {
        let mut drained = Vec::with_capacity(self.len());
        drained.extend(self.in_flight.take());
        drained.extend(self.pending.drain(..));
        self.generation = generation;
        drained
    }

    pub fn in_flight(&self) -> Option<&QueuedCommand<T>> {
        self.in_flight.as_ref()
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len() + usize::from(self.in_flight.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for CommandQueue<T> {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_in_flight_fifo() {
        let mut queue = CommandQueue::new(1);
        let a = queue.enqueue(CommandKind::Read, None, "a");
        let b = queue.enqueue(CommandKind::Write, None, "b");

        assert_eq!(queue.start_next().map(|c| c.id), Some(a));
        assert!(queue.start_next().is_none());

        assert!(matches!(queue.complete(a), Completion::Resolved(c) if c.payload == "a"));
        assert_eq!(queue.start_next().map(|c| c.id), Some(b));
    }

    #[test]
    fn test_late_ack_after_expiry_is_stale() {
        let mut queue = CommandQueue::new(1);
        let a = queue.enqueue(CommandKind::Read, Some(Duration::from_millis(10)), ());
        queue.start_next();

        assert!(queue.expire(a).is_some());
        assert!(matches!(queue.complete(a), Completion::Stale));
        assert!(queue.expire(a).is_none());
    }

    #[test]
    fn test_unknown_and_old_generation_ids() {
        let mut queue: CommandQueue<()> = CommandQueue::new(2);
        let bogus = CommandId {
            generation: 2,
            seq: 40,
        };
        assert!(matches!(queue.complete(bogus), Completion::Unknown));

        let old = CommandId {
            generation: 1,
            seq: 0,
        };
        assert!(matches!(queue.complete(old), Completion::Stale));
    }

    #[test]
    fn test_reset_drains_everything() {
        let mut queue = CommandQueue::new(1);
        let a = queue.enqueue(CommandKind::Read, None, 1);
        queue.enqueue(CommandKind::Read, None, 2);
        queue.enqueue(CommandKind::Read, None, 3);
        queue.start_next();

        let drained = queue.reset(2);
        assert_eq!(drained.iter().map(|c| c.payload).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(queue.is_idle());
        assert_eq!(queue.generation(), 2);
        assert!(matches!(queue.complete(a), Completion::Stale));
    }
}
