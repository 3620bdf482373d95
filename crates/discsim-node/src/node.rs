//! Simulated discovery peer
//!
//! A [`Node`] owns its record, a routing table keyed to it, its open tasks
//! and the ads it hosts per topic. Inbound messages go through
//! [`Node::handle`]; outbound protocol actions are queued as tasks and
//! advanced by [`Node::step`], once per round.

use crate::config::SimConfig;
use crate::error::{Result, SimError};
use crate::router::Router;
use crate::task::{
    EnrSearch, FindEnrsOnPeer, Immediate, LivenessVisit, MediaDiscovery, NodeUpdate,
    ParallelIdSearch, PingShower, RoundTrip, SeedPool, TableVisit, Task, TopicAdvertise,
    TopicFind, UnionSearch,
};
use discsim_dht::messages::AVERAGE_TICKET_SIZE;
use discsim_dht::{
    filter_neighborhood, sim_distance, topic_id, Message, MetaKey, NodeId, NodeKey, PendingEviction,
    Record, RoutingTable,
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::mem;
use std::rc::Rc;
use tracing::{debug, trace};

/// An ad hosted on behalf of an advertiser
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicAd {
    pub advertiser: Record,

    /// Rounds until the ad expires
    pub remaining: usize,
}

/// Simulated discovery peer
pub struct Node {
    /// Own record, replaced wholesale on update
    record: Record,

    key: NodeKey,
    config: SimConfig,
    rng: StdRng,
    router: Rc<Router>,
    table: RoutingTable,

    /// Open tasks, stepped in insertion order
    tasks: Vec<Box<dyn Task>>,

    /// Hosted ads: topic -> advertiser -> ad
    topics: HashMap<NodeId, HashMap<NodeId, TopicAd>>,

    /// Peers with a corrective lookup already queued
    pending_updates: HashSet<NodeId>,

    initialized: bool,

    /// Estimated size of every message sent
    outgoing_messages: Vec<usize>,

    /// Estimated size of every message received
    incoming_messages: Vec<usize>,

    /// Hops per request and per reply batch
    roundtrip_latency: Vec<usize>,
}

impl Node {
    /// Create a node; it still needs to be registered with `router`
    pub fn new(
        record: Record,
        key: NodeKey,
        config: SimConfig,
        rng: StdRng,
        router: Rc<Router>,
    ) -> Result<Self> {
        let table = RoutingTable::new(record.clone(), config.table_config())?;

        Ok(Node {
            record,
            key,
            config,
            rng,
            router,
            table,
            tasks: Vec::new(),
            topics: HashMap::new(),
            pending_updates: HashSet::new(),
            initialized: false,
            outgoing_messages: Vec::new(),
            incoming_messages: Vec::new(),
            roundtrip_latency: Vec::new(),
        })
    }

    pub fn id(&self) -> &NodeId {
        self.record.id()
    }

    pub fn record(&self) -> &Record {
        &self.record
    }

    pub fn key(&self) -> &NodeKey {
        &self.key
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    /// Direct table access for setup and probe callbacks
    pub fn table_mut(&mut self) -> &mut RoutingTable {
        &mut self.table
    }

    pub fn router(&self) -> &Rc<Router> {
        &self.router
    }

    pub(crate) fn rng_mut(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn outgoing_messages(&self) -> &[usize] {
        &self.outgoing_messages
    }

    pub fn incoming_messages(&self) -> &[usize] {
        &self.incoming_messages
    }

    pub fn roundtrip_latency(&self) -> &[usize] {
        &self.roundtrip_latency
    }

    pub(crate) fn record_outgoing(&mut self, size: usize) {
        self.outgoing_messages.push(size);
    }

    pub(crate) fn record_incoming(&mut self, size: usize) {
        self.incoming_messages.push(size);
    }

    pub(crate) fn record_latency(&mut self, hops: usize) {
        self.roundtrip_latency.push(hops);
    }

    /// Queue a task; it is first stepped in the next round
    pub fn add_task(&mut self, task: Box<dyn Task>) {
        self.tasks.push(task);
    }

    /// Install the table visit and liveness visit background tasks
    pub fn init_tasks(&mut self) -> Result<()> {
        if self.initialized {
            return Err(SimError::AlreadyInitialized);
        }

        self.add_task(Box::new(TableVisit::new()));
        self.add_task(Box::new(LivenessVisit::new()));
        self.initialized = true;
        Ok(())
    }

    /// Advance every task by one round and age hosted ads
    ///
    /// Tasks queued while stepping are first stepped in the next round.
    pub fn step(&mut self) -> Result<()> {
        let before = self.tasks.len();
        self.tasks.retain(|task| !task.is_over());
        if self.tasks.len() < before {
            trace!("Node {}: removed {} finished tasks", self.id(), before - self.tasks.len());
        }

        let mut seen = HashSet::new();
        self.tasks
            .retain(|task| task.revalidation_target().map_or(true, |id| seen.insert(id)));
        self.pending_updates = seen;

        let mut current = mem::take(&mut self.tasks);
        let mut outcome = Ok(());
        for task in current.iter_mut() {
            outcome = task.step(self);
            if outcome.is_err() {
                break;
            }
        }
        current.append(&mut self.tasks);
        self.tasks = current;
        outcome?;

        self.age_ads();
        Ok(())
    }

    fn age_ads(&mut self) {
        for ads in self.topics.values_mut() {
            ads.retain(|_, ad| {
                ad.remaining = ad.remaining.saturating_sub(1);
                ad.remaining > 0
            });
        }
        self.topics.retain(|_, ads| !ads.is_empty());
    }

    /// Drop all tasks and counters, then reinstall the background tasks
    pub fn reset_all(&mut self) -> Result<()> {
        self.tasks.clear();
        self.pending_updates.clear();
        self.outgoing_messages.clear();
        self.incoming_messages.clear();
        self.roundtrip_latency.clear();
        self.initialized = false;
        self.init_tasks()
    }

    /// Publish a new version of the own record and re-home the table
    ///
    /// `seq` must be above the current sequence, otherwise peers holding the
    /// current record would never replace it.
    pub fn update_enr(&mut self, seq: u64, meta: BTreeMap<Vec<u8>, Vec<u8>>) -> Result<()> {
        let current = self.record.seq();
        if seq <= current {
            return Err(SimError::StaleSequence {
                current,
                requested: seq,
            });
        }
        let record = self.record.with_update(seq, meta);
        self.table.update_home(record.clone())?;
        debug!("Node {}: record updated to seq {}", self.id(), record.seq());
        self.record = record;
        Ok(())
    }

    /// Send `message` to `to` through the router right away
    pub fn route(&mut self, to: &Record, message: Message) -> Vec<Message> {
        let router = Rc::clone(&self.router);
        router.route(self, to, message)
    }

    /// Insert a record into the table, probing a full bucket's head with PING
    pub fn put_record(&mut self, record: Record) {
        let mut evictions = Vec::new();
        self.table
            .put(record, &mut |eviction: PendingEviction| evictions.push(eviction));

        for eviction in evictions {
            let head = eviction.head.clone();
            self.ping(&head, move |node, alive| {
                node.table.resolve_eviction(eviction, alive);
            });
        }
    }

    /// Bucket distances to ask `target` for when searching around `center`
    ///
    /// Starts at `distance(target, center)` and widens outward, up to the
    /// configured limit.
    pub fn neighbor_distances(&self, target: &NodeId, center: &NodeId) -> Vec<usize> {
        let limit = self.config.neighbor_distances_limit;
        let top_limit = self.table.bucket_count();
        let start = sim_distance(target, center, self.config.distance_divisor);
        let mut distances: Vec<usize> = Vec::with_capacity(limit);
        let mut radius = 0;

        while distances.len() < limit {
            let top = start + radius;
            let bottom = start.checked_sub(radius);
            if top > top_limit && bottom.map_or(true, |b| b < 1) {
                break;
            }

            if top <= top_limit && !distances.contains(&top) {
                distances.push(top);
                if distances.len() == limit {
                    break;
                }
            }
            if let Some(bottom) = bottom.filter(|&b| b >= 1 && b < top) {
                if !distances.contains(&bottom) {
                    distances.push(bottom);
                }
            }
            radius += 1;
        }
        distances
    }

    /// Ask `target` for the peers around `center`
    ///
    /// Queues a FINDNODE round-trip; the replies are fed to the table and the
    /// flattened records handed to `callback`.
    pub fn find_nodes<F>(&mut self, target: &Record, center: &NodeId, callback: F)
    where
        F: FnOnce(&mut Node, Vec<Record>) + 'static,
    {
        let distances = self.neighbor_distances(target.id(), center);
        let sender = target.clone();
        trace!("Node {}: FINDNODE {:?} to {}", self.id(), distances, target.id());

        let task = RoundTrip::with_callback(
            target.clone(),
            Message::FindNode { distances },
            move |node, replies| {
                let records = nodes_records(&replies);
                node.handle_all(replies, &sender);
                callback(node, records);
            },
        );
        self.add_task(Box::new(task));
    }

    /// Fetch the current record of `target` with a synchronous FINDNODE([0])
    pub fn update_node(&mut self, target: &Record) -> Option<Record> {
        let replies = self.route(target, Message::FindNode { distances: vec![0] });
        let records = nodes_records(&replies);
        self.handle_all(replies, target);
        records.into_iter().next()
    }

    /// Queue a PING round-trip; `callback` learns whether `target` answered
    pub fn ping<F>(&mut self, target: &Record, callback: F)
    where
        F: FnOnce(&mut Node, bool) + 'static,
    {
        let seq = self.record.seq();
        let sender = target.clone();
        let task = RoundTrip::with_callback(
            target.clone(),
            Message::Ping { seq },
            move |node, replies| {
                let alive = !replies.is_empty();
                node.handle_all(replies, &sender);
                callback(node, alive);
            },
        );
        self.add_task(Box::new(task));
    }

    /// Handle a batch of messages from `sender`, concatenating the replies
    pub fn handle_all(&mut self, messages: Vec<Message>, sender: &Record) -> Vec<Message> {
        messages
            .into_iter()
            .flat_map(|message| self.handle(message, sender))
            .collect()
    }

    /// Handle one inbound message and return the replies
    pub fn handle(&mut self, message: Message, sender: &Record) -> Vec<Message> {
        match message {
            Message::FindNode { distances } => self.handle_find_node(&distances),
            Message::Nodes { records } => self.handle_nodes(records, sender),
            Message::Ping { seq } => self.handle_ping(seq, sender),
            Message::Pong { seq } => self.handle_pong(seq, sender),
            Message::RegTopic { topic, record, .. } => self.handle_reg_topic(topic, &record, sender),
            // Ticket and confirmation are consumed by the advertising task
            Message::Ticket { .. } | Message::RegConfirmation { .. } => Vec::new(),
            Message::TopicQuery { topic } => self.handle_topic_query(&topic),
        }
    }

    fn handle_find_node(&self, distances: &[usize]) -> Vec<Message> {
        let records: Vec<Record> = self
            .table
            .find_many(distances)
            .into_iter()
            .take(self.config.bucket_size)
            .collect();
        Message::nodes_chunked(records, self.config.nodes_per_message)
    }

    fn handle_nodes(&mut self, records: Vec<Record>, sender: &Record) -> Vec<Message> {
        self.put_record(sender.clone());
        for record in records {
            self.put_record(record);
        }
        Vec::new()
    }

    fn handle_ping(&mut self, seq: u64, sender: &Record) -> Vec<Message> {
        let forget = self.config.effective_forget_chance();
        if self.rng.gen_bool(forget) {
            trace!("Node {}: ignoring PING from {}", self.id(), sender.id());
            return Vec::new();
        }

        if self.is_stale(sender.id(), seq) {
            self.schedule_update(sender, seq, "PING");
        }
        vec![Message::Pong {
            seq: self.record.seq(),
        }]
    }

    fn handle_pong(&mut self, seq: u64, sender: &Record) -> Vec<Message> {
        if sender.seq() == seq {
            self.put_record(sender.clone());
        } else {
            self.schedule_update(sender, seq, "PONG");
        }
        Vec::new()
    }

    fn handle_reg_topic(
        &mut self,
        topic: NodeId,
        advertised: &Record,
        sender: &Record,
    ) -> Vec<Message> {
        if self.is_stale(sender.id(), advertised.seq()) {
            self.schedule_update(sender, advertised.seq(), "REGTOPIC");
        }

        let ticket = vec![0; AVERAGE_TICKET_SIZE];
        let hosted = self.ad(&topic, sender.id()).map(|ad| ad.remaining);
        if let Some(wait_steps) = hosted {
            return vec![Message::Ticket { ticket, wait_steps }];
        }

        self.place_ad(topic, sender.clone());
        debug!("Node {}: hosting ad for {} by {}", self.id(), topic, sender.id());
        vec![
            Message::Ticket {
                ticket,
                wait_steps: 0,
            },
            Message::RegConfirmation { topic },
        ]
    }

    fn handle_topic_query(&self, topic: &NodeId) -> Vec<Message> {
        let advertisers = self.advertisers(topic);
        Message::nodes_chunked(advertisers, self.config.nodes_per_message)
    }

    /// True if the table holds `id` with a sequence other than `seq`
    fn is_stale(&self, id: &NodeId, seq: u64) -> bool {
        self.table
            .find_one(id)
            .map_or(false, |known| known.seq() != seq)
    }

    /// Queue one corrective lookup per peer and round
    fn schedule_update(&mut self, target: &Record, seq: u64, cause: &str) {
        if !self.pending_updates.insert(*target.id()) {
            return;
        }
        debug!(
            "Node {}: {} from {} shows seq {}, updating",
            self.id(),
            cause,
            target.id(),
            seq
        );
        self.add_task(Box::new(NodeUpdate::new(target.clone())));
    }

    /// Host an ad directly, bypassing REGTOPIC
    pub fn place_ad(&mut self, topic: NodeId, advertiser: Record) {
        let remaining = self.config.ad_lifetime_rounds;
        self.topics.entry(topic).or_default().insert(
            *advertiser.id(),
            TopicAd {
                advertiser,
                remaining,
            },
        );
    }

    /// Advertisers hosted for `topic`
    pub fn advertisers(&self, topic: &NodeId) -> Vec<Record> {
        self.topics
            .get(topic)
            .map(|ads| ads.values().map(|ad| ad.advertiser.clone()).collect())
            .unwrap_or_default()
    }

    /// Hosted ad of `advertiser` for `topic`
    pub fn ad(&self, topic: &NodeId, advertiser: &NodeId) -> Option<&TopicAd> {
        self.topics.get(topic)?.get(advertiser)
    }

    /// Number of topics with at least one hosted ad
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    /// Search seeds around `topic`: its bucket if full, else the closest known
    fn media_seeds(&self, topic: &NodeId) -> SeedPool {
        let distance = self.table.distance_to(topic);
        let mut candidates = self.table.find(distance);
        if candidates.len() < self.config.bucket_size {
            candidates = filter_neighborhood(topic, self.table.find_all(), self.config.bucket_size);
        }
        SeedPool::new(candidates)
    }

    /// Place ads for `topic` on `radius` media
    ///
    /// Media are either a random sample of the table or the result of a
    /// parallel ID search around the topic hash. `callback` receives
    /// `(medium, placed)` for every medium tried.
    pub fn register_topic<F>(&mut self, topic: &[u8], radius: usize, random: bool, callback: F)
    where
        F: FnOnce(&mut Node, Vec<(Record, bool)>) + 'static,
    {
        let topic = topic_id(topic);
        let discovery: MediaDiscovery = if random {
            let mut media = self.table.find_all();
            media.shuffle(&mut self.rng);
            media.truncate(radius);
            Box::new(Immediate::new(media))
        } else {
            let seeds = self.media_seeds(&topic);
            Box::new(ParallelIdSearch::new(topic, seeds, radius, &self.config))
        };

        debug!("Node {}: registering topic {}", self.id(), topic);
        let task = TopicAdvertise::new(
            topic,
            discovery,
            self.config.ad_retry_max_rounds,
            self.config.parallelism,
            Box::new(callback),
        );
        self.add_task(Box::new(task));
    }

    /// Collect up to `required` advertisers of `topic` from `radius` media
    pub fn find_topic<F>(&mut self, topic: &[u8], radius: usize, required: usize, callback: F)
    where
        F: FnOnce(&mut Node, HashSet<NodeId>) + 'static,
    {
        let topic = topic_id(topic);
        let seeds = self.media_seeds(&topic);
        let discovery = ParallelIdSearch::new(topic, seeds, radius, &self.config);

        debug!("Node {}: searching topic {}", self.id(), topic);
        let task = TopicFind::new(
            topic,
            Box::new(discovery),
            required,
            self.config.parallelism,
            Box::new(callback),
        );
        self.add_task(Box::new(task));
    }

    /// Collect up to `required` peers whose record is on `subnet`
    ///
    /// Walks the tables of up to `radius` known peers, farthest buckets
    /// first, and hands the matching identifiers to `callback`.
    pub fn find_enr_subnet<F>(&mut self, subnet: &[u8], radius: usize, required: usize, callback: F)
    where
        F: FnOnce(&mut Node, HashSet<NodeId>) + 'static,
    {
        let media = self.table.find_down(self.table.bucket_count(), radius);
        debug!(
            "Node {}: searching subnet {:02x?} on {} peers",
            self.id(),
            subnet,
            media.len()
        );
        let tasks: Vec<FindEnrsOnPeer> = media
            .into_iter()
            .map(|medium| FindEnrsOnPeer::new(medium, MetaKey::Subnet, subnet.to_vec(), &self.config))
            .collect();
        let search = UnionSearch::new(tasks, required, self.config.parallelism);
        self.add_task(Box::new(EnrSearch::new(search, Box::new(callback))));
    }

    /// Ping the whole table once, dropping every peer that stays silent
    pub fn ping_all(&mut self) {
        self.add_task(Box::new(PingShower::new()));
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("record", &self.record)
            .field("table", &self.table.len())
            .field("tasks", &self.tasks.len())
            .field("topics", &self.topics.len())
            .finish()
    }
}

/// Records carried by the NODES messages among `messages`
pub(crate) fn nodes_records(messages: &[Message]) -> Vec<Record> {
    messages
        .iter()
        .filter_map(|message| match message {
            Message::Nodes { records } => Some(records.iter().cloned()),
            _ => None,
        })
        .flatten()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use discsim_dht::{MessageType, NODE_ID_SIZE};
    use rand::SeedableRng;
    use std::cell::RefCell;

    fn create_test_node(router: &Rc<Router>, seed: u64, config: SimConfig) -> Rc<RefCell<Node>> {
        let mut rng = StdRng::seed_from_u64(seed);
        let key = NodeKey::generate(&mut rng);
        let record = Record::new(format!("/ip4/10.0.2.{}/udp/30303", seed), key.node_id());
        let node = Node::new(record, key, config, rng, Rc::clone(router)).unwrap();
        let node = Rc::new(RefCell::new(node));
        router.register(&node);
        node
    }

    fn create_test_router() -> Rc<Router> {
        Rc::new(Router::new(StdRng::seed_from_u64(7)))
    }

    fn always_alive() -> impl FnMut(PendingEviction) {
        |_| {}
    }

    #[test]
    fn test_init_tasks_twice_fails() {
        let router = create_test_router();
        let node = create_test_node(&router, 1, SimConfig::default());
        let mut node = node.borrow_mut();

        node.init_tasks().unwrap();
        assert_eq!(node.task_count(), 2);
        assert_eq!(node.init_tasks(), Err(SimError::AlreadyInitialized));
    }

    #[test]
    fn test_reset_all_reinstalls_tasks() {
        let router = create_test_router();
        let node = create_test_node(&router, 1, SimConfig::default());
        let mut node = node.borrow_mut();
        node.init_tasks().unwrap();
        node.record_outgoing(10);

        node.reset_all().unwrap();

        assert_eq!(node.task_count(), 2);
        assert!(node.outgoing_messages().is_empty());
    }

    #[test]
    fn test_update_enr_rehomes_table() {
        let router = create_test_router();
        let node = create_test_node(&router, 1, SimConfig::default());
        let mut node = node.borrow_mut();
        let mut meta = BTreeMap::new();
        meta.insert(vec![1], vec![0xFF]);

        node.update_enr(2, meta.clone()).unwrap();

        assert_eq!(node.record().seq(), 2);
        assert_eq!(node.record().meta(), &meta);
        assert_eq!(node.table().home(), node.record());
    }

    #[test]
    fn test_update_enr_rejects_non_increasing_seq() {
        let router = create_test_router();
        let node = create_test_node(&router, 1, SimConfig::default());
        let mut node = node.borrow_mut();
        node.update_enr(3, BTreeMap::new()).unwrap();

        for seq in [0, 2, 3] {
            assert_eq!(
                node.update_enr(seq, BTreeMap::new()),
                Err(SimError::StaleSequence {
                    current: 3,
                    requested: seq
                })
            );
        }
        assert_eq!(node.record().seq(), 3);
        assert_eq!(node.table().home().seq(), 3);
    }

    #[test]
    fn test_neighbor_distances() {
        let router = create_test_router();
        let node = create_test_node(&router, 1, SimConfig::default());
        let node = node.borrow();
        let zero = NodeId::from_bytes([0; NODE_ID_SIZE]);
        let mut bytes = [0u8; NODE_ID_SIZE];

        bytes[0] = 0x80;
        assert_eq!(node.neighbor_distances(&NodeId::from_bytes(bytes), &zero), vec![256, 255, 254]);

        bytes[0] = 0x01;
        assert_eq!(node.neighbor_distances(&NodeId::from_bytes(bytes), &zero), vec![249, 250, 248]);

        assert_eq!(node.neighbor_distances(&zero, &zero), vec![0, 1, 2]);
    }

    #[test]
    fn test_find_node_reply_is_chunked_and_limited() {
        let router = create_test_router();
        let node = create_test_node(&router, 1, SimConfig::default());
        let mut node = node.borrow_mut();
        let home = *node.id();
        let mut rng = StdRng::seed_from_u64(99);
        while node.table().len() < 40 {
            let id = NodeKey::generate(&mut rng).node_id();
            let record = Record::new("peer", id);
            node.table_mut().put(record, &mut always_alive());
        }
        let all: Vec<usize> = (1..=256).collect();

        let replies = node.handle(Message::FindNode { distances: all }, &Record::new("x", home));

        let total: usize = replies
            .iter()
            .map(|m| match m {
                Message::Nodes { records } => {
                    assert!(records.len() <= 4);
                    records.len()
                }
                other => panic!("unexpected {}", other.message_type()),
            })
            .sum();
        assert_eq!(total, 16);
        assert_eq!(replies.len(), 4);
    }

    #[test]
    fn test_nodes_handling_is_idempotent() {
        let router = create_test_router();
        let a = create_test_node(&router, 1, SimConfig::default());
        let b = create_test_node(&router, 2, SimConfig::default());
        let b_record = b.borrow().record().clone();
        let mut a = a.borrow_mut();

        a.handle(Message::Nodes { records: vec![] }, &b_record);
        let once = a.table().find_all();
        a.handle(Message::Nodes { records: vec![] }, &b_record);

        assert_eq!(a.table().find_all(), once);
        assert_eq!(once, vec![b_record]);
    }

    #[test]
    fn test_ping_reply_and_forget() {
        let router = create_test_router();
        let alive = create_test_node(&router, 1, SimConfig::default().with_forget_chance(0.0));
        let silent = create_test_node(&router, 2, SimConfig::default().with_forget_chance(1.0));
        let sender = create_test_node(&router, 3, SimConfig::default());
        let sender_record = sender.borrow().record().clone();

        let replies = alive.borrow_mut().handle(Message::Ping { seq: 1 }, &sender_record);
        assert_eq!(replies, vec![Message::Pong { seq: 1 }]);

        let replies = silent.borrow_mut().handle(Message::Ping { seq: 1 }, &sender_record);
        assert!(replies.is_empty());
    }

    #[test]
    fn test_nan_forget_chance_always_answers() {
        let router = create_test_router();
        let config = SimConfig {
            forget_chance: f64::NAN,
            ..SimConfig::default()
        };
        let host = create_test_node(&router, 1, config);
        let sender = create_test_node(&router, 2, SimConfig::default());
        let sender_record = sender.borrow().record().clone();

        for _ in 0..20 {
            let replies = host.borrow_mut().handle(Message::Ping { seq: 1 }, &sender_record);
            assert_eq!(replies, vec![Message::Pong { seq: 1 }]);
        }
    }

    #[test]
    fn test_stale_sequence_schedules_single_update() {
        let router = create_test_router();
        let a = create_test_node(&router, 1, SimConfig::default().with_forget_chance(0.0));
        let b = create_test_node(&router, 2, SimConfig::default());
        let b_record = b.borrow().record().clone();
        let mut a = a.borrow_mut();
        a.table_mut().put(b_record.clone(), &mut always_alive());

        a.handle(Message::Ping { seq: 3 }, &b_record);
        a.handle(Message::Ping { seq: 3 }, &b_record);
        a.handle(Message::Pong { seq: 3 }, &b_record);

        assert_eq!(a.task_count(), 1);
    }

    #[test]
    fn test_pong_with_matching_seq_inserts_sender() {
        let router = create_test_router();
        let a = create_test_node(&router, 1, SimConfig::default());
        let b = create_test_node(&router, 2, SimConfig::default());
        let b_record = b.borrow().record().clone();
        let mut a = a.borrow_mut();

        a.handle(Message::Pong { seq: 1 }, &b_record);

        assert!(a.table().exists(&b_record));
        assert_eq!(a.task_count(), 0);
    }

    #[test]
    fn test_reg_topic_then_duplicate_gets_wait() {
        let router = create_test_router();
        let host = create_test_node(&router, 1, SimConfig::default());
        let advertiser = create_test_node(&router, 2, SimConfig::default());
        let advertiser_record = advertiser.borrow().record().clone();
        let topic = topic_id(b"eth2");
        let request = Message::RegTopic {
            topic,
            record: advertiser_record.clone(),
            ticket: vec![0],
        };
        let mut host = host.borrow_mut();

        let first = host.handle(request.clone(), &advertiser_record);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].message_type(), MessageType::Ticket);
        assert_eq!(first[1], Message::RegConfirmation { topic });

        host.step().unwrap();
        let second = host.handle(request, &advertiser_record);
        assert_eq!(second.len(), 1);
        match &second[0] {
            Message::Ticket { wait_steps, .. } => assert_eq!(*wait_steps, 59),
            other => panic!("unexpected {}", other.message_type()),
        }
    }

    #[test]
    fn test_topic_query_returns_advertisers() {
        let router = create_test_router();
        let host = create_test_node(&router, 1, SimConfig::default());
        let topic = topic_id(b"eth2");
        let advertisers: Vec<Record> = (1..=5)
            .map(|i| Record::new(format!("adv-{}", i), NodeId::from_bytes([i; NODE_ID_SIZE])))
            .collect();
        let mut host = host.borrow_mut();
        for advertiser in &advertisers {
            host.place_ad(topic, advertiser.clone());
        }
        let asker = Record::new("asker", NodeId::from_bytes([9; NODE_ID_SIZE]));

        let replies = host.handle(Message::TopicQuery { topic }, &asker);
        assert_eq!(nodes_records(&replies).len(), 5);
        assert_eq!(replies.len(), 2);

        let unknown = host.handle(Message::TopicQuery { topic: topic_id(b"other") }, &asker);
        assert!(unknown.is_empty());
    }

    #[test]
    fn test_ads_expire() {
        let router = create_test_router();
        let host = create_test_node(&router, 1, SimConfig::default().with_ad_lifetime_rounds(2));
        let topic = topic_id(b"eth2");
        let advertiser = Record::new("adv", NodeId::from_bytes([1; NODE_ID_SIZE]));
        let mut host = host.borrow_mut();
        host.place_ad(topic, advertiser.clone());

        host.step().unwrap();
        assert_eq!(host.ad(&topic, advertiser.id()).map(|ad| ad.remaining), Some(1));

        host.step().unwrap();
        assert!(host.ad(&topic, advertiser.id()).is_none());
        assert_eq!(host.topic_count(), 0);
    }

    #[test]
    fn test_full_bucket_probe_evicts_silent_head() {
        let router = create_test_router();
        let a = create_test_node(&router, 1, SimConfig::default().with_bucket_size(1));
        let silent = create_test_node(&router, 2, SimConfig::default().with_forget_chance(1.0));
        let silent_record = silent.borrow().record().clone();

        // Find a live peer landing in the same bucket as the silent one
        let distance = a.borrow().table().distance_to(silent_record.id());
        let mut seed = 3;
        let candidate = loop {
            let node = create_test_node(&router, seed, SimConfig::default());
            let record = node.borrow().record().clone();
            if a.borrow().table().distance_to(record.id()) == distance {
                break (node, record);
            }
            seed += 1;
        };
        let (_candidate_node, candidate_record) = candidate;

        a.borrow_mut().put_record(silent_record.clone());
        a.borrow_mut().put_record(candidate_record.clone());
        assert_eq!(a.borrow().table().find(distance), vec![silent_record.clone()]);
        assert_eq!(a.borrow().task_count(), 1);

        a.borrow_mut().step().unwrap();
        a.borrow_mut().step().unwrap();

        assert_eq!(a.borrow().table().find(distance), vec![candidate_record]);
    }
}
