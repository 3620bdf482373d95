//! Task combinators

use super::{Producer, Task};
use crate::error::{Result, SimError};
use crate::node::Node;
use discsim_dht::NodeId;
use std::collections::{HashSet, VecDeque};

/// Producer whose result is known up front
#[derive(Debug, Clone)]
pub struct Immediate<T> {
    value: T,
}

impl<T> Immediate<T> {
    pub fn new(value: T) -> Self {
        Immediate { value }
    }
}

impl<T> Task for Immediate<T> {
    fn step(&mut self, _node: &mut Node) -> Result<()> {
        Ok(())
    }

    fn is_over(&self) -> bool {
        true
    }
}

impl<T: Clone> Producer for Immediate<T> {
    type Output = T;

    fn result(&self) -> Result<T> {
        Ok(self.value.clone())
    }
}

/// Steps every sub-task each round; over when all of them are
pub struct Parallel<P> {
    tasks: Vec<P>,
}

impl<P: Task> Parallel<P> {
    pub fn new(tasks: Vec<P>) -> Self {
        Parallel { tasks }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl<P: Task> Task for Parallel<P> {
    fn step(&mut self, node: &mut Node) -> Result<()> {
        for task in self.tasks.iter_mut() {
            task.step(node)?;
        }
        Ok(())
    }

    fn is_over(&self) -> bool {
        self.tasks.iter().all(Task::is_over)
    }
}

impl<P: Producer> Producer for Parallel<P> {
    type Output = Vec<P::Output>;

    fn result(&self) -> Result<Self::Output> {
        if !self.is_over() {
            return Err(SimError::ResultNotReady("parallel"));
        }
        self.tasks.iter().map(Producer::result).collect()
    }
}

/// Early stop condition over the finished sub-tasks of a queue
pub type StopCondition<P> = Box<dyn Fn(&[&P]) -> bool>;

/// Bounded-parallel queue
///
/// Each round tops the in-flight set up to `parallelism` from the backlog,
/// steps every in-flight task, and retires the ones that finished. Results
/// come back in backlog order regardless of completion order.
///
/// With a stop condition the queue is also over as soon as the condition
/// holds for the retired tasks. In-flight and backlog tasks are then
/// abandoned and only retired tasks contribute to the result.
pub struct ParallelQueue<P> {
    backlog: VecDeque<(usize, P)>,
    in_flight: Vec<(usize, P)>,
    done: Vec<(usize, P)>,
    parallelism: usize,
    stop: Option<StopCondition<P>>,
}

impl<P: Task> ParallelQueue<P> {
    pub fn new<I: IntoIterator<Item = P>>(tasks: I, parallelism: usize) -> Self {
        ParallelQueue {
            backlog: tasks.into_iter().enumerate().collect(),
            in_flight: Vec::new(),
            done: Vec::new(),
            parallelism: parallelism.max(1),
            stop: None,
        }
    }

    /// Stop early once `stop` holds for the retired tasks
    pub fn stop_when<F>(mut self, stop: F) -> Self
    where
        F: Fn(&[&P]) -> bool + 'static,
    {
        self.stop = Some(Box::new(stop));
        self
    }

    /// Queue running one sub-task at a time, in order
    pub fn sequential<I: IntoIterator<Item = P>>(tasks: I) -> Self {
        Self::new(tasks, 1)
    }

    /// Number of sub-tasks currently being stepped
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Number of sub-tasks not started yet
    pub fn backlog(&self) -> usize {
        self.backlog.len()
    }

    fn stopped(&self) -> bool {
        match &self.stop {
            Some(stop) => {
                let retired: Vec<&P> = self.done.iter().map(|(_, task)| task).collect();
                stop(&retired)
            }
            None => false,
        }
    }
}

impl<P: Task> Task for ParallelQueue<P> {
    fn step(&mut self, node: &mut Node) -> Result<()> {
        if self.is_over() {
            return Ok(());
        }

        while self.in_flight.len() < self.parallelism {
            match self.backlog.pop_front() {
                Some(entry) => self.in_flight.push(entry),
                None => break,
            }
        }

        for (_, task) in self.in_flight.iter_mut() {
            task.step(node)?;
        }

        let (finished, running): (Vec<_>, Vec<_>) = self
            .in_flight
            .drain(..)
            .partition(|(_, task)| task.is_over());
        self.in_flight = running;
        self.done.extend(finished);
        Ok(())
    }

    fn is_over(&self) -> bool {
        (self.backlog.is_empty() && self.in_flight.is_empty()) || self.stopped()
    }
}

impl<P: Producer> Producer for ParallelQueue<P> {
    type Output = Vec<P::Output>;

    fn result(&self) -> Result<Self::Output> {
        if !self.is_over() {
            return Err(SimError::ResultNotReady("parallel queue"));
        }

        let mut ordered: Vec<&(usize, P)> = self.done.iter().collect();
        ordered.sort_by_key(|(index, _)| *index);
        ordered.into_iter().map(|(_, task)| task.result()).collect()
    }
}

/// Distinct peers found by sub-tasks reporting sets of identifiers
fn union_of<'a, P, I>(tasks: I) -> HashSet<NodeId>
where
    P: Producer<Output = HashSet<NodeId>> + 'a,
    I: IntoIterator<Item = &'a P>,
{
    tasks
        .into_iter()
        .filter_map(|task| task.result().ok())
        .flatten()
        .collect()
}

/// Queue of peer searches that stops once `required` distinct peers are known
///
/// Used for topic ad queries and metadata walks. The result is the union of
/// what the retired searches found.
pub struct UnionSearch<P> {
    queue: ParallelQueue<P>,
}

impl<P> UnionSearch<P>
where
    P: Producer<Output = HashSet<NodeId>> + 'static,
{
    pub fn new<I>(tasks: I, required: usize, parallelism: usize) -> Self
    where
        I: IntoIterator<Item = P>,
    {
        let queue = ParallelQueue::new(tasks, parallelism)
            .stop_when(move |retired: &[&P]| union_of(retired.iter().copied()).len() >= required);
        UnionSearch { queue }
    }

    pub fn in_flight(&self) -> usize {
        self.queue.in_flight()
    }
}

impl<P: Producer<Output = HashSet<NodeId>>> Task for UnionSearch<P> {
    fn step(&mut self, node: &mut Node) -> Result<()> {
        self.queue.step(node)
    }

    fn is_over(&self) -> bool {
        self.queue.is_over()
    }
}

impl<P: Producer<Output = HashSet<NodeId>>> Producer for UnionSearch<P> {
    type Output = HashSet<NodeId>;

    fn result(&self) -> Result<HashSet<NodeId>> {
        if !self.is_over() {
            return Err(SimError::ResultNotReady("union search"));
        }
        Ok(self.queue.result()?.into_iter().flatten().collect())
    }
}
