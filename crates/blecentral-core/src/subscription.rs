//! Subscription registry
//!
//! Maps characteristic handles to registered notification handlers in
//! insertion order. With fan-out disabled a characteristic holds at most one
//! handler and a second registration replaces the first.

use std::collections::HashMap;
use std::fmt;

use smallvec::SmallVec;

use crate::gatt::AttributeHandle;

/// Identity of one registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// What a registration did to the characteristic's handler set
#[derive(Debug, PartialEq, Eq)]
pub enum Registration<H> {
    /// First handler; the native notify mechanism must be enabled
    First,
    /// Added beside existing handlers (fan-out)
    Added,
    /// Replaced the previous handler, which is returned
    Replaced(H),
}

/// Handler set of one characteristic
pub type HandlerSet<H> = SmallVec<[(SubscriptionId, H); 1]>;

#[derive(Debug)]
pub struct SubscriptionRegistry<H> {
    allow_fan_out: bool,
    next_id: u64,
    entries: HashMap<AttributeHandle, HandlerSet<H>>,
}

impl<H> SubscriptionRegistry<H> {
    pub fn new(allow_fan_out: bool) -> Self {
        Self {
            allow_fan_out,
            next_id: 0,
            entries: HashMap::new(),
        }
    }

    pub fn register(&mut self, handle: AttributeHandle, handler: H) -> (SubscriptionId, Registration<H>) {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;

        let set = self.entries.entry(handle).or_default();
        let registration = if set.is_empty() {
            set.push((id, handler));
            Registration::First
        } else if self.allow_fan_out {
            set.push((id, handler));
            Registration::Added
        } else {
            let (_, previous) = std::mem::replace(&mut set[0], (id, handler));
            Registration::Replaced(previous)
        };
        (id, registration)
    }

    /// Remove every handler for `handle`
    pub fn remove_all(&mut self, handle: AttributeHandle) -> HandlerSet<H> {
        self.entries.remove(&handle).unwrap_or_default()
    }

    /// Remove one registration. Returns the handler and whether the
    /// characteristic has no handlers left.
    pub fn remove(&mut self, handle: AttributeHandle, id: SubscriptionId) -> Option<(H, bool)> {
        let set = self.entries.get_mut(&handle)?;
        let position = set.iter().position(|(sid, _)| *sid == id)?;
        let (_, handler) = set.remove(position);
        let now_empty = set.is_empty();
        if now_empty {
            self.entries.remove(&handle);
        }
        Some((handler, now_empty))
    }

    pub fn handlers(&self, handle: AttributeHandle) -> impl Iterator<Item = &H> {
        self.entries
            .get(&handle)
            .into_iter()
            .flat_map(|set| set.iter().map(|(_, h)| h))
    }

    pub fn is_subscribed(&self, handle: AttributeHandle) -> bool {
        self.entries.contains_key(&handle)
    }

    /// Drop every registration, returning the handlers
    pub fn clear(&mut self) -> Vec<H> {
        self.entries
            .drain()
            .flat_map(|(_, set)| set.into_iter().map(|(_, h)| h))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
