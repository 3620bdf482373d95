//! Simulation harness
//!
//! A [`Network`] is a set of peers sharing one [`Router`]. It builds them from
//! a single seed so that a run is fully reproducible, and drives rounds by
//! stepping every node in creation order.

use crate::config::SimConfig;
use crate::error::Result;
use crate::node::Node;
use crate::router::Router;
use discsim_dht::{NodeId, NodeKey, PendingEviction, Record};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::info;

/// Traffic totals over all nodes of a network
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrafficStats {
    pub outgoing_messages: usize,
    pub outgoing_bytes: usize,
    pub incoming_messages: usize,
    pub incoming_bytes: usize,

    /// Hops booked for requests and reply batches
    pub roundtrip_hops: usize,
}

/// Builder for a [`Network`]
#[derive(Debug, Clone)]
pub struct NetworkBuilder {
    size: usize,
    seed: u64,
    config: SimConfig,
    churn_percent: u8,
}

impl NetworkBuilder {
    /// Network of `size` peers with the default config and no churn
    pub fn new(size: usize) -> Self {
        NetworkBuilder {
            size,
            seed: 0,
            config: SimConfig::default(),
            churn_percent: 0,
        }
    }

    /// Seed of every random draw of the run
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_config(mut self, config: SimConfig) -> Self {
        self.config = config;
        self
    }

    /// Message loss percentage, checked on build
    pub fn with_churn_percent(mut self, percent: u8) -> Self {
        self.churn_percent = percent;
        self
    }

    pub fn build(self) -> Result<Network> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let router = Rc::new(Router::new(StdRng::seed_from_u64(rng.gen())));
        router.set_churn_percent(self.churn_percent)?;

        let mut nodes = Vec::with_capacity(self.size);
        for index in 0..self.size {
            let key = NodeKey::generate(&mut rng);
            let record = Record::new(peer_address(index), key.node_id());
            let node_rng = StdRng::seed_from_u64(rng.gen());
            let node = Node::new(record, key, self.config.clone(), node_rng, Rc::clone(&router))?;

            let node = Rc::new(RefCell::new(node));
            router.register(&node);
            nodes.push(node);
        }

        info!(
            "Network built: {} peers, seed {}, churn {}%",
            nodes.len(),
            self.seed,
            self.churn_percent
        );

        Ok(Network {
            router,
            nodes,
            rng,
            rounds: 0,
        })
    }
}

/// Synthetic transport address of the `index`-th peer
fn peer_address(index: usize) -> String {
    format!(
        "/ip4/10.{}.{}.{}/udp/30303",
        (index >> 16) & 0xFF,
        (index >> 8) & 0xFF,
        index & 0xFF
    )
}

/// Peers of one simulation run
pub struct Network {
    router: Rc<Router>,
    nodes: Vec<Rc<RefCell<Node>>>,

    /// Draws for setup helpers such as table prefill
    rng: StdRng,

    rounds: u64,
}

impl Network {
    /// Node by creation index
    ///
    /// Panics if `index` is out of range.
    pub fn node(&self, index: usize) -> Rc<RefCell<Node>> {
        Rc::clone(&self.nodes[index])
    }

    pub fn nodes(&self) -> &[Rc<RefCell<Node>>] {
        &self.nodes
    }

    /// Node by identifier
    pub fn find(&self, id: &NodeId) -> Option<Rc<RefCell<Node>>> {
        self.router.resolve(id)
    }

    pub fn router(&self) -> &Rc<Router> {
        &self.router
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Rounds run since build or the last reset
    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    /// Insert peers into every table without any traffic
    ///
    /// Each peer learns each other peer with probability `fill` (clamped to
    /// 0.0 - 1.0). Full buckets keep their head.
    pub fn prefill_tables(&mut self, fill: f64) {
        let fill = fill.clamp(0.0, 1.0);
        let records: Vec<Record> = self
            .nodes
            .iter()
            .map(|node| node.borrow().record().clone())
            .collect();

        for node in &self.nodes {
            let mut node = node.borrow_mut();
            for record in &records {
                if record.id() == node.id() || !self.rng.gen_bool(fill) {
                    continue;
                }
                node.table_mut()
                    .put(record.clone(), &mut |_: PendingEviction| {});
            }
        }

        info!("Tables prefilled: {} peers, fill {:.2}", records.len(), fill);
    }

    /// Install the background tasks on every node
    pub fn init_tasks(&self) -> Result<()> {
        for node in &self.nodes {
            node.borrow_mut().init_tasks()?;
        }
        Ok(())
    }

    /// Step every node once, in creation order
    pub fn round(&mut self) -> Result<()> {
        for node in &self.nodes {
            node.borrow_mut().step()?;
        }
        self.rounds += 1;
        Ok(())
    }

    pub fn run_rounds(&mut self, rounds: usize) -> Result<()> {
        for _ in 0..rounds {
            self.round()?;
        }
        info!("Ran {} rounds, {} total", rounds, self.rounds);
        Ok(())
    }

    /// Reset tasks and counters of every node and of the router
    pub fn reset_all(&mut self) -> Result<()> {
        for node in &self.nodes {
            node.borrow_mut().reset_all()?;
        }
        self.router.reset_stats();
        self.rounds = 0;
        info!("Network reset: {} peers", self.nodes.len());
        Ok(())
    }

    pub fn stats(&self) -> TrafficStats {
        let mut stats = TrafficStats::default();
        for node in &self.nodes {
            let node = node.borrow();
            stats.outgoing_messages += node.outgoing_messages().len();
            stats.outgoing_bytes += node.outgoing_messages().iter().sum::<usize>();
            stats.incoming_messages += node.incoming_messages().len();
            stats.incoming_bytes += node.incoming_messages().iter().sum::<usize>();
            stats.roundtrip_hops += node.roundtrip_latency().iter().sum::<usize>();
        }
        stats
    }
}
