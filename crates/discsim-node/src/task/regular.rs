//! Round-trips and background maintenance tasks

use super::{Producer, Task};
use crate::error::{Result, SimError};
use crate::node::Node;
use discsim_dht::{Message, NodeId, Record};
use std::collections::VecDeque;
use tracing::debug;

/// Callback run on the requesting node with the replies of a round-trip
pub type ReplyCallback = Box<dyn FnOnce(&mut Node, Vec<Message>)>;

/// Two-round request/response exchange
///
/// Round 1 models delivery. Round 2 routes the message, the recipient handles
/// it, and the replies (possibly none) go to the callback or are kept as the
/// task result.
pub struct RoundTrip {
    recipient: Record,
    message: Option<Message>,
    delivered: bool,
    finished: bool,
    replies: Vec<Message>,
    callback: Option<ReplyCallback>,
}

impl RoundTrip {
    /// Round-trip whose replies are read back through [`Producer::result`]
    pub fn new(recipient: Record, message: Message) -> Self {
        RoundTrip {
            recipient,
            message: Some(message),
            delivered: false,
            finished: false,
            replies: Vec::new(),
            callback: None,
        }
    }

    /// Round-trip that hands its replies to `callback`
    pub fn with_callback<F>(recipient: Record, message: Message, callback: F) -> Self
    where
        F: FnOnce(&mut Node, Vec<Message>) + 'static,
    {
        RoundTrip {
            callback: Some(Box::new(callback)),
            ..RoundTrip::new(recipient, message)
        }
    }

    pub fn recipient(&self) -> &Record {
        &self.recipient
    }

    /// Move the replies out once over
    pub fn take_replies(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.replies)
    }
}

impl Task for RoundTrip {
    fn step(&mut self, node: &mut Node) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        if !self.delivered {
            self.delivered = true;
            return Ok(());
        }

        let replies = match self.message.take() {
            Some(message) => node.route(&self.recipient, message),
            None => Vec::new(),
        };
        self.finished = true;
        match self.callback.take() {
            Some(callback) => callback(node, replies),
            None => self.replies = replies,
        }
        Ok(())
    }

    fn is_over(&self) -> bool {
        self.finished
    }
}

impl Producer for RoundTrip {
    type Output = Vec<Message>;

    fn result(&self) -> Result<Vec<Message>> {
        if !self.finished {
            return Err(SimError::ResultNotReady("round-trip"));
        }
        Ok(self.replies.clone())
    }
}

/// Looks up one table record per round, refilling from the table when the
/// queue runs dry
#[derive(Debug, Default)]
pub struct TableVisit {
    queue: VecDeque<Record>,
}

impl TableVisit {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Task for TableVisit {
    fn step(&mut self, node: &mut Node) -> Result<()> {
        if self.queue.is_empty() {
            self.queue.extend(node.table().find_all());
        }

        if let Some(record) = self.queue.pop_front() {
            let center = *node.id();
            node.find_nodes(&record, &center, |_, _| {});
        }
        Ok(())
    }
}

/// Pings one table record per round and drops it from the table if it stays
/// silent
#[derive(Debug, Default)]
pub struct LivenessVisit {
    queue: VecDeque<Record>,
}

impl LivenessVisit {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Task for LivenessVisit {
    fn step(&mut self, node: &mut Node) -> Result<()> {
        if self.queue.is_empty() {
            self.queue.extend(node.table().find_all());
        }

        if let Some(record) = self.queue.pop_front() {
            let id = *record.id();
            node.ping(&record, move |node, alive| {
                if !alive && node.table_mut().remove(&id).is_some() {
                    debug!("Node {}: dropped silent peer {}", node.id(), id);
                }
            });
        }
        Ok(())
    }
}

/// Pings every table record at once and drops the ones that stay silent
///
/// Over after one step; the PING round-trips it queues run on their own.
#[derive(Debug, Default)]
pub struct PingShower {
    done: bool,
}

impl PingShower {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Task for PingShower {
    fn step(&mut self, node: &mut Node) -> Result<()> {
        if self.done {
            return Ok(());
        }

        let records = node.table().find_all();
        debug!("Node {}: pinging {} peers", node.id(), records.len());
        for record in records {
            let id = *record.id();
            node.ping(&record, move |node, alive| {
                if !alive && node.table_mut().remove(&id).is_some() {
                    debug!("Node {}: dropped silent peer {}", node.id(), id);
                }
            });
        }
        self.done = true;
        Ok(())
    }

    fn is_over(&self) -> bool {
        self.done
    }
}

/// Fetches the current record of a peer seen with a mismatching sequence
///
/// Sends FINDNODE([0]) synchronously and feeds the reply to the table. Over
/// after one step.
#[derive(Debug)]
pub struct NodeUpdate {
    target: Record,
    done: bool,
}

impl NodeUpdate {
    pub fn new(target: Record) -> Self {
        NodeUpdate { target, done: false }
    }
}

impl Task for NodeUpdate {
    fn step(&mut self, node: &mut Node) -> Result<()> {
        if self.done {
            return Ok(());
        }

        node.update_node(&self.target);
        self.done = true;
        Ok(())
    }

    fn is_over(&self) -> bool {
        self.done
    }

    fn revalidation_target(&self) -> Option<NodeId> {
        if self.done {
            None
        } else {
            Some(*self.target.id())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;
    use crate::router::Router;
    use discsim_dht::{MessageType, NodeKey, PendingEviction};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::cell::{Cell, RefCell};
    use std::collections::BTreeMap;
    use std::rc::Rc;

    fn create_test_node(router: &Rc<Router>, seed: u64, config: SimConfig) -> Rc<RefCell<Node>> {
        let mut rng = StdRng::seed_from_u64(seed);
        let key = NodeKey::generate(&mut rng);
        let record = Record::new(format!("/ip4/10.0.1.{}/udp/30303", seed), key.node_id());
        let node = Node::new(record, key, config, rng, Rc::clone(router)).unwrap();
        let node = Rc::new(RefCell::new(node));
        router.register(&node);
        node
    }

    fn create_test_router() -> Rc<Router> {
        Rc::new(Router::new(StdRng::seed_from_u64(42)))
    }

    #[test]
    fn test_round_trip_two_steps() {
        let router = create_test_router();
        let a = create_test_node(&router, 1, SimConfig::default());
        let b = create_test_node(&router, 2, SimConfig::default());
        let b_record = b.borrow().record().clone();

        let calls = Rc::new(Cell::new(0));
        let seen = Rc::clone(&calls);
        let mut task = RoundTrip::with_callback(
            b_record.clone(),
            Message::FindNode { distances: vec![0] },
            move |_, replies| {
                assert_eq!(replies.len(), 1);
                seen.set(seen.get() + 1);
            },
        );

        task.step(&mut a.borrow_mut()).unwrap();
        assert!(!task.is_over());
        assert_eq!(calls.get(), 0);
        assert!(b.borrow().incoming_messages().is_empty());

        task.step(&mut a.borrow_mut()).unwrap();
        assert!(task.is_over());
        assert_eq!(calls.get(), 1);

        task.step(&mut a.borrow_mut()).unwrap();
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_round_trip_result() {
        let router = create_test_router();
        let a = create_test_node(&router, 1, SimConfig::default());
        let b = create_test_node(&router, 2, SimConfig::default().with_forget_chance(0.0));
        let b_record = b.borrow().record().clone();

        let mut task = RoundTrip::new(b_record, Message::Ping { seq: 1 });
        assert_eq!(task.result(), Err(SimError::ResultNotReady("round-trip")));

        task.step(&mut a.borrow_mut()).unwrap();
        task.step(&mut a.borrow_mut()).unwrap();

        let replies = task.result().unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].message_type(), MessageType::Pong);
        assert_eq!(task.take_replies().len(), 1);
    }

    #[test]
    fn test_liveness_visit_drops_silent_peer() {
        let router = create_test_router();
        let a = create_test_node(&router, 1, SimConfig::default());
        let b = create_test_node(&router, 2, SimConfig::default().with_forget_chance(1.0));
        let b_record = b.borrow().record().clone();
        a.borrow_mut()
            .table_mut()
            .put(b_record.clone(), &mut |_: PendingEviction| {});

        a.borrow_mut().add_task(Box::new(LivenessVisit::new()));
        for _ in 0..3 {
            a.borrow_mut().step().unwrap();
        }

        assert!(a.borrow().table().find_one(b_record.id()).is_none());
    }

    #[test]
    fn test_liveness_visit_keeps_live_peer() {
        let router = create_test_router();
        let a = create_test_node(&router, 1, SimConfig::default());
        let b = create_test_node(&router, 2, SimConfig::default().with_forget_chance(0.0));
        let b_record = b.borrow().record().clone();
        a.borrow_mut()
            .table_mut()
            .put(b_record.clone(), &mut |_: PendingEviction| {});

        a.borrow_mut().add_task(Box::new(LivenessVisit::new()));
        for _ in 0..3 {
            a.borrow_mut().step().unwrap();
        }

        assert!(a.borrow().table().find_one(b_record.id()).is_some());
    }

    #[test]
    fn test_ping_shower_sorts_live_from_silent() {
        let router = create_test_router();
        let a = create_test_node(&router, 1, SimConfig::default());
        let live = create_test_node(&router, 2, SimConfig::default().with_forget_chance(0.0));
        let silent = create_test_node(&router, 3, SimConfig::default().with_forget_chance(1.0));
        let live_record = live.borrow().record().clone();
        let silent_record = silent.borrow().record().clone();
        for record in [&live_record, &silent_record] {
            a.borrow_mut()
                .table_mut()
                .put(record.clone(), &mut |_: PendingEviction| {});
        }

        let mut shower = PingShower::new();
        shower.step(&mut a.borrow_mut()).unwrap();
        assert!(shower.is_over());
        assert_eq!(a.borrow().task_count(), 2);

        shower.step(&mut a.borrow_mut()).unwrap();
        assert_eq!(a.borrow().task_count(), 2);

        for _ in 0..3 {
            a.borrow_mut().step().unwrap();
        }

        assert_eq!(a.borrow().table().find_all(), vec![live_record]);
        assert_eq!(router.delivered(MessageType::Ping), 2);
    }

    #[test]
    fn test_table_visit_on_empty_table_is_idle() {
        let router = create_test_router();
        let a = create_test_node(&router, 1, SimConfig::default());

        a.borrow_mut().add_task(Box::new(TableVisit::new()));
        a.borrow_mut().step().unwrap();
        a.borrow_mut().step().unwrap();

        assert!(a.borrow().outgoing_messages().is_empty());
        assert_eq!(a.borrow().task_count(), 1);
    }

    #[test]
    fn test_node_update_fetches_newer_record() {
        let router = create_test_router();
        let a = create_test_node(&router, 1, SimConfig::default());
        let b = create_test_node(&router, 2, SimConfig::default());
        let stale = b.borrow().record().clone();
        a.borrow_mut()
            .table_mut()
            .put(stale.clone(), &mut |_: PendingEviction| {});
        b.borrow_mut().update_enr(5, BTreeMap::new()).unwrap();

        let mut task = NodeUpdate::new(stale.clone());
        assert_eq!(task.revalidation_target(), Some(*stale.id()));

        task.step(&mut a.borrow_mut()).unwrap();

        assert!(task.is_over());
        assert_eq!(task.revalidation_target(), None);
        assert_eq!(a.borrow().table().find_one(stale.id()).unwrap().seq(), 5);
    }
}
