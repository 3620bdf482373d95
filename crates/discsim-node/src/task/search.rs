//! Iterative ID search
//!
//! An [`IdSearch`] converges on the peers closest to a target identifier. It
//! asks its seed for the neighborhood of the target, then keeps re-querying
//! the candidates it learned, `alpha` replies at a time, until a batch of
//! replies brings nothing closer than what it already holds.
//!
//! A seed that answers with nothing is replaced: the search hands over to a
//! fresh search started from the next seed of its [`SeedPool`] and delegates
//! to it from then on.

use super::{Inbox, Parallel, Producer, SeedPool, Task};
use crate::config::SimConfig;
use crate::error::{Result, SimError};
use crate::node::Node;
use discsim_dht::{filter_neighborhood, log_distance, NodeId, Record};
use rand::seq::SliceRandom;
use std::collections::VecDeque;
use tracing::debug;

/// Search phase
enum SearchState {
    /// First hop not sent yet
    Seeded(Record),

    /// Waiting for the seed's answer
    AwaitingSeed(Inbox<Vec<Record>>),

    /// Re-querying candidates
    Searching,

    /// Seed stayed silent, a child search carries on
    Replaced(Box<IdSearch>),

    Done,
}

/// Kademlia-style iterative search for the peers closest to `target`
pub struct IdSearch {
    target: NodeId,

    /// Replies collected before the candidate set is recomputed
    alpha: usize,

    /// Size of the recomputed candidate set
    bucket_size: usize,

    /// Upper bound on re-queries
    max_queries: usize,

    queries: usize,
    seeds: SeedPool,
    state: SearchState,

    /// Candidates, re-queried round-robin
    candidates: VecDeque<Record>,

    /// Non-empty replies of the current batch
    replies: Vec<Vec<Record>>,

    /// Answer of the outstanding re-query, if any
    pending: Option<Inbox<Vec<Record>>>,
}

impl IdSearch {
    /// Create a search from `seed`; without a seed the search is over at once
    pub fn new(target: NodeId, seed: Option<Record>, seeds: SeedPool, config: &SimConfig) -> Self {
        let state = match seed {
            Some(seed) => SearchState::Seeded(seed),
            None => SearchState::Done,
        };

        IdSearch {
            target,
            alpha: config.parallelism.max(1),
            bucket_size: config.bucket_size,
            max_queries: config.lookup_max_queries,
            queries: 0,
            seeds,
            state,
            candidates: VecDeque::new(),
            replies: Vec::new(),
            pending: None,
        }
    }

    pub fn target(&self) -> &NodeId {
        &self.target
    }

    /// Current candidates of the active search in the replacement chain
    pub fn candidates(&self) -> Vec<Record> {
        match &self.state {
            SearchState::Replaced(child) => child.candidates(),
            _ => self.candidates.iter().cloned().collect(),
        }
    }

    fn query(&self, node: &mut Node, record: &Record) -> Inbox<Vec<Record>> {
        let inbox = Inbox::new();
        let sender = inbox.clone();
        let target = self.target;
        node.find_nodes(record, &target, move |_, records| sender.put(records));
        inbox
    }

    fn flatten_replies(&self) -> Vec<Record> {
        self.replies.iter().flatten().cloned().collect()
    }

    /// Seed answered: keep its records in random order, or hand over
    fn on_seed_reply(&mut self, node: &mut Node, records: Vec<Record>) {
        if records.is_empty() {
            let seed = self.seeds.next_seed();
            debug!(
                "Node {}: search for {} got no seed reply, replacing with {:?}",
                node.id(),
                self.target,
                seed
            );
            let child = self.sibling(seed);
            self.state = SearchState::Replaced(Box::new(child));
            return;
        }

        let mut records = records;
        records.shuffle(node.rng_mut());
        self.candidates.extend(records);
        self.state = SearchState::Searching;
    }

    /// Fresh search with the same target, parameters and seed pool
    fn sibling(&self, seed: Option<Record>) -> IdSearch {
        IdSearch {
            target: self.target,
            alpha: self.alpha,
            bucket_size: self.bucket_size,
            max_queries: self.max_queries,
            queries: 0,
            seeds: self.seeds.clone(),
            state: match seed {
                Some(seed) => SearchState::Seeded(seed),
                None => SearchState::Done,
            },
            candidates: VecDeque::new(),
            replies: Vec::new(),
            pending: None,
        }
    }

    /// Re-query answered; finish once a full batch brings nothing closer
    fn on_query_reply(&mut self, records: Vec<Record>) {
        if !records.is_empty() {
            self.replies.push(records);
        }
        if self.replies.len() < self.alpha {
            return;
        }

        let best_new = filter_neighborhood(&self.target, self.flatten_replies(), 1);
        let best_held = filter_neighborhood(&self.target, self.candidates.iter().cloned(), 1);
        match (best_new.first(), best_held.first()) {
            (None, _) => self.state = SearchState::Done,
            (Some(new), Some(held))
                if log_distance(new.id(), &self.target) < log_distance(held.id(), &self.target) => {}
            _ => {
                self.candidates = self.flatten_replies().into();
                self.state = SearchState::Done;
            }
        }
    }

    fn search(&mut self, node: &mut Node) {
        if self.pending.is_some() {
            match self.pending.as_ref().and_then(Inbox::take) {
                Some(records) => {
                    self.pending = None;
                    self.on_query_reply(records);
                    if matches!(self.state, SearchState::Done) {
                        return;
                    }
                }
                None => return,
            }
        }

        if self.replies.len() >= self.alpha || self.candidates.is_empty() {
            self.candidates =
                filter_neighborhood(&self.target, self.flatten_replies(), self.bucket_size).into();
            self.replies.clear();
        }

        if self.candidates.is_empty() || self.queries >= self.max_queries {
            debug!(
                "Node {}: search for {} stopped after {} queries",
                node.id(),
                self.target,
                self.queries
            );
            self.state = SearchState::Done;
            return;
        }

        if let Some(next) = self.candidates.pop_front() {
            self.candidates.push_back(next.clone());
            self.queries += 1;
            self.pending = Some(self.query(node, &next));
        }
    }
}

impl Task for IdSearch {
    fn step(&mut self, node: &mut Node) -> Result<()> {
        match std::mem::replace(&mut self.state, SearchState::Done) {
            SearchState::Seeded(seed) => {
                let inbox = self.query(node, &seed);
                self.state = SearchState::AwaitingSeed(inbox);
            }
            SearchState::AwaitingSeed(inbox) => match inbox.take() {
                Some(records) => {
                    self.on_seed_reply(node, records);
                    if matches!(self.state, SearchState::Searching) {
                        self.search(node);
                    }
                }
                None => self.state = SearchState::AwaitingSeed(inbox),
            },
            SearchState::Searching => {
                self.state = SearchState::Searching;
                self.search(node);
            }
            SearchState::Replaced(mut child) => {
                child.step(node)?;
                self.state = SearchState::Replaced(child);
            }
            SearchState::Done => {}
        }
        Ok(())
    }

    fn is_over(&self) -> bool {
        match &self.state {
            SearchState::Replaced(child) => child.is_over(),
            SearchState::Done => true,
            _ => false,
        }
    }
}

impl Producer for IdSearch {
    type Output = Vec<Record>;

    fn result(&self) -> Result<Vec<Record>> {
        if !self.is_over() {
            return Err(SimError::ResultNotReady("id search"));
        }
        Ok(self.candidates())
    }
}

/// Several ID searches toward one target, merged to the closest `radius`
pub struct ParallelIdSearch {
    target: NodeId,
    radius: usize,
    searches: Parallel<IdSearch>,
}

impl ParallelIdSearch {
    /// Start `config.parallelism` searches, each seeded from `seeds`
    pub fn new(target: NodeId, seeds: SeedPool, radius: usize, config: &SimConfig) -> Self {
        let searches = (0..config.parallelism.max(1))
            .map(|_| IdSearch::new(target, seeds.next_seed(), seeds.clone(), config))
            .collect();

        ParallelIdSearch {
            target,
            radius,
            searches: Parallel::new(searches),
        }
    }
}

impl Task for ParallelIdSearch {
    fn step(&mut self, node: &mut Node) -> Result<()> {
        self.searches.step(node)
    }

    fn is_over(&self) -> bool {
        self.searches.is_over()
    }
}

impl Producer for ParallelIdSearch {
    type Output = Vec<Record>;

    fn result(&self) -> Result<Vec<Record>> {
        let found = self.searches.result()?;
        Ok(filter_neighborhood(
            &self.target,
            found.into_iter().flatten(),
            self.radius,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkBuilder;
    use discsim_dht::NODE_ID_SIZE;

    #[test]
    fn test_search_without_seed_is_over() {
        let search = IdSearch::new(
            NodeId::from_bytes([1; NODE_ID_SIZE]),
            None,
            SeedPool::default(),
            &SimConfig::default(),
        );
        assert!(search.is_over());
        assert!(search.result().unwrap().is_empty());
    }

    #[test]
    fn test_result_not_ready() {
        let seed = Record::new("peer", NodeId::from_bytes([2; NODE_ID_SIZE]));
        let search = IdSearch::new(
            NodeId::from_bytes([1; NODE_ID_SIZE]),
            Some(seed),
            SeedPool::default(),
            &SimConfig::default(),
        );
        assert!(!search.is_over());
        assert_eq!(search.result(), Err(SimError::ResultNotReady("id search")));
    }

    #[test]
    fn test_unreachable_seeds_end_in_empty_result() {
        let network = NetworkBuilder::new(1).with_seed(3).build().unwrap();
        let node = network.node(0);
        let ghosts: Vec<Record> = (1..=4)
            .map(|i| Record::new(format!("ghost-{}", i), NodeId::from_bytes([i; NODE_ID_SIZE])))
            .collect();
        let seeds = SeedPool::new(ghosts);
        let mut search = IdSearch::new(
            NodeId::from_bytes([9; NODE_ID_SIZE]),
            seeds.next_seed(),
            seeds.clone(),
            &SimConfig::default(),
        );

        for _ in 0..40 {
            search.step(&mut node.borrow_mut()).unwrap();
            node.borrow_mut().step().unwrap();
            if search.is_over() {
                break;
            }
        }

        assert!(search.is_over());
        assert!(search.result().unwrap().is_empty());
        assert!(seeds.is_empty());
    }

    #[test]
    fn test_parallel_search_converges() {
        let mut network = NetworkBuilder::new(40).with_seed(11).build().unwrap();
        network.prefill_tables(1.0);
        let node = network.node(0);
        let target = NodeId::from_bytes([0x5A; NODE_ID_SIZE]);
        let config = SimConfig::default();
        let seeds = SeedPool::new(node.borrow().table().find_neighbors(&target, config.bucket_size));
        let mut search = ParallelIdSearch::new(target, seeds, 5, &config);

        for _ in 0..200 {
            if search.is_over() {
                break;
            }
            search.step(&mut node.borrow_mut()).unwrap();
            network.round().unwrap();
        }

        assert!(search.is_over());
        let found = search.result().unwrap();
        assert!(!found.is_empty());
        assert!(found.len() <= 5);
        let distances: Vec<usize> = found.iter().map(|r| log_distance(r.id(), &target)).collect();
        let mut sorted = distances.clone();
        sorted.sort_unstable();
        assert_eq!(distances, sorted);
    }
}
