//! Cooperative task engine
//!
//! A [`Task`] is resumable work advanced one round at a time by the node that
//! owns it. Composite tasks own their sub-tasks and step them from their own
//! `step`. Results flow back either through a [`Producer`] queried once the
//! task is over, or through an [`Inbox`] filled by a round-trip callback and
//! polled on the next step.

mod combinator;
mod enr;
mod regular;
mod search;
mod topic;

pub use combinator::{Immediate, Parallel, ParallelQueue, StopCondition, UnionSearch};
pub use enr::{EnrSearch, FindEnrsOnPeer};
pub use regular::{LivenessVisit, NodeUpdate, PingShower, ReplyCallback, RoundTrip, TableVisit};
pub use search::{IdSearch, ParallelIdSearch};
pub use topic::{
    AdSearch, AdvertiseCallback, AdvertiseOnMedia, FindAdOnMedia, FindCallback, MediaDiscovery,
    TopicAdvertise, TopicFind,
};

use crate::error::Result;
use crate::node::Node;
use discsim_dht::{NodeId, Record};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Unit of work advanced once per round
pub trait Task {
    /// Advance by one round
    fn step(&mut self, node: &mut Node) -> Result<()>;

    /// Finished tasks are dropped by their owner
    fn is_over(&self) -> bool {
        false
    }

    /// Identifier this task is re-validating, if it is a corrective lookup
    fn revalidation_target(&self) -> Option<NodeId> {
        None
    }
}

/// Task with a result available once it is over
pub trait Producer: Task {
    type Output;

    /// Get the result, [`crate::SimError::ResultNotReady`] before the task is over
    fn result(&self) -> Result<Self::Output>;
}

impl<T: Task + ?Sized> Task for Box<T> {
    fn step(&mut self, node: &mut Node) -> Result<()> {
        (**self).step(node)
    }

    fn is_over(&self) -> bool {
        (**self).is_over()
    }

    fn revalidation_target(&self) -> Option<NodeId> {
        (**self).revalidation_target()
    }
}

impl<T: Producer + ?Sized> Producer for Box<T> {
    type Output = T::Output;

    fn result(&self) -> Result<Self::Output> {
        (**self).result()
    }
}

/// Single-slot mailbox between a round-trip callback and the task awaiting it
///
/// Clones share the slot. The callback may fire after the awaiting task was
/// dropped; the value is then simply discarded.
#[derive(Debug)]
pub struct Inbox<T>(Rc<RefCell<Option<T>>>);

impl<T> Inbox<T> {
    pub fn new() -> Self {
        Inbox(Rc::new(RefCell::new(None)))
    }

    /// Store a value, replacing any unread one
    pub fn put(&self, value: T) {
        *self.0.borrow_mut() = Some(value);
    }

    /// Take the value if it arrived
    pub fn take(&self) -> Option<T> {
        self.0.borrow_mut().take()
    }

    pub fn is_filled(&self) -> bool {
        self.0.borrow().is_some()
    }
}

impl<T> Default for Inbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Inbox<T> {
    fn clone(&self) -> Self {
        Inbox(Rc::clone(&self.0))
    }
}

/// Shared queue of start records for ID searches
///
/// Every search of one parallel lookup draws its seed, and any replacement
/// seed after a silent first hop, from the same pool.
#[derive(Debug, Clone, Default)]
pub struct SeedPool(Rc<RefCell<VecDeque<Record>>>);

impl SeedPool {
    pub fn new<I: IntoIterator<Item = Record>>(seeds: I) -> Self {
        SeedPool(Rc::new(RefCell::new(seeds.into_iter().collect())))
    }

    /// Pop the next seed, `None` once exhausted
    pub fn next_seed(&self) -> Option<Record> {
        self.0.borrow_mut().pop_front()
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }
}
