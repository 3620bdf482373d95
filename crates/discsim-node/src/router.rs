//! Simulated message router
//!
//! The router is the only path between two peers. It resolves a recipient
//! record to its node, optionally drops the request or the replies to model
//! churn, and books the traffic on both ends.

use crate::error::{Result, SimError};
use crate::node::Node;
use discsim_dht::{Message, MessageType, NodeId, Record};
use rand::rngs::StdRng;
use rand::Rng;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use tracing::{trace, warn};

/// Router statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterStats {
    /// Requests handed to a recipient
    pub messages_routed: u64,

    /// Requests or reply batches lost to churn
    pub messages_dropped: u64,

    /// Requests whose recipient is not registered
    pub unresolved: u64,

    /// Delivered requests per message type
    pub by_type: HashMap<MessageType, u64>,
}

/// Identifier to node registry with churn
pub struct Router {
    /// Registered peers; weak so nodes holding the router do not form a cycle
    peers: RefCell<HashMap<NodeId, Weak<RefCell<Node>>>>,

    /// Message loss percentage (0-100)
    churn_percent: Cell<u8>,

    rng: RefCell<StdRng>,

    stats: RefCell<RouterStats>,
}

impl Router {
    /// Create a router drawing churn samples from `rng`
    pub fn new(rng: StdRng) -> Self {
        Router {
            peers: RefCell::new(HashMap::new()),
            churn_percent: Cell::new(0),
            rng: RefCell::new(rng),
            stats: RefCell::new(RouterStats::default()),
        }
    }

    /// Register a node; the first registration of an identifier wins
    pub fn register(&self, node: &Rc<RefCell<Node>>) {
        let id = *node.borrow().id();
        self.peers
            .borrow_mut()
            .entry(id)
            .or_insert_with(|| Rc::downgrade(node));
    }

    /// Number of registered nodes
    pub fn len(&self) -> usize {
        self.peers.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.borrow().is_empty()
    }

    /// Look up a live node by identifier
    pub fn resolve(&self, id: &NodeId) -> Option<Rc<RefCell<Node>>> {
        self.peers.borrow().get(id).and_then(Weak::upgrade)
    }

    pub fn churn_percent(&self) -> u8 {
        self.churn_percent.get()
    }

    /// Set the message loss percentage
    pub fn set_churn_percent(&self, percent: u8) -> Result<()> {
        if percent > 100 {
            return Err(SimError::ChurnOutOfRange(percent));
        }
        self.churn_percent.set(percent);
        Ok(())
    }

    pub fn stats(&self) -> RouterStats {
        self.stats.borrow().clone()
    }

    pub fn reset_stats(&self) {
        *self.stats.borrow_mut() = RouterStats::default();
    }

    /// Delivered requests of one type
    pub fn delivered(&self, message_type: MessageType) -> u64 {
        self.stats
            .borrow()
            .by_type
            .get(&message_type)
            .copied()
            .unwrap_or(0)
    }

    /// Deliver `message` from `from` to the node behind `to` and return its replies
    ///
    /// Unknown recipients and churn losses yield no replies. A message addressed
    /// to `from` itself is handled on `from` directly.
    pub fn route(&self, from: &mut Node, to: &Record, message: Message) -> Vec<Message> {
        let size = message.size();
        let message_type = message.message_type();
        from.record_outgoing(size);
        from.record_latency(1);

        if to.id() == from.id() {
            self.count_routed(message_type);
            let sender = from.record().clone();
            from.record_incoming(size);
            let replies = from.handle(message, &sender);
            for reply in &replies {
                from.record_outgoing(reply.size());
            }
            self.book_replies(from, &replies);
            return replies;
        }

        let target = match self.resolve(to.id()) {
            Some(target) => target,
            None => {
                trace!("{} -> {}: {} unresolved", from.id(), to.id(), message_type);
                self.stats.borrow_mut().unresolved += 1;
                return Vec::new();
            }
        };

        if self.drop_by_churn() {
            trace!("{} -> {}: {} lost", from.id(), to.id(), message_type);
            return Vec::new();
        }

        let mut recipient = match target.try_borrow_mut() {
            Ok(recipient) => recipient,
            Err(_) => {
                warn!(
                    "{} -> {}: recipient busy, {} not delivered",
                    from.id(),
                    to.id(),
                    message_type
                );
                return Vec::new();
            }
        };

        self.count_routed(message_type);
        recipient.record_incoming(size);
        let replies = recipient.handle(message, from.record());
        trace!(
            "{} -> {}: {} answered with {} messages",
            from.id(),
            to.id(),
            message_type,
            replies.len()
        );

        for reply in &replies {
            recipient.record_outgoing(reply.size());
        }
        if self.drop_by_churn() {
            trace!("{} <- {}: replies lost", from.id(), to.id());
            return Vec::new();
        }

        self.book_replies(from, &replies);
        replies
    }

    /// Book the reply side of a round-trip on the requester
    fn book_replies(&self, from: &mut Node, replies: &[Message]) {
        from.record_latency(replies.len());
        for reply in replies {
            from.record_incoming(reply.size());
        }
    }

    fn count_routed(&self, message_type: MessageType) {
        let mut stats = self.stats.borrow_mut();
        stats.messages_routed += 1;
        *stats.by_type.entry(message_type).or_insert(0) += 1;
    }

    fn drop_by_churn(&self) -> bool {
        let churn = self.churn_percent.get();
        if churn == 0 {
            return false;
        }

        let dropped = self.rng.borrow_mut().gen_range(0..100) < churn;
        if dropped {
            self.stats.borrow_mut().messages_dropped += 1;
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;
    use discsim_dht::NodeKey;
    use rand::SeedableRng;

    fn create_test_node(router: &Rc<Router>, seed: u64) -> Rc<RefCell<Node>> {
        let mut rng = StdRng::seed_from_u64(seed);
        let key = NodeKey::generate(&mut rng);
        let record = Record::new(format!("/ip4/10.0.0.{}/udp/30303", seed), key.node_id());
        let node = Node::new(record, key, SimConfig::default(), rng, Rc::clone(router)).unwrap();
        let node = Rc::new(RefCell::new(node));
        router.register(&node);
        node
    }

    fn create_test_router() -> Rc<Router> {
        Rc::new(Router::new(StdRng::seed_from_u64(0)))
    }

    #[test]
    fn test_churn_out_of_range() {
        let router = create_test_router();
        assert_eq!(router.set_churn_percent(101), Err(SimError::ChurnOutOfRange(101)));
        assert!(router.set_churn_percent(100).is_ok());
        assert_eq!(router.churn_percent(), 100);
    }

    #[test]
    fn test_register_and_resolve() {
        let router = create_test_router();
        let node = create_test_node(&router, 1);
        let id = *node.borrow().id();

        assert_eq!(router.len(), 1);
        assert!(router.resolve(&id).is_some());

        drop(node);
        assert!(router.resolve(&id).is_none());
    }

    #[test]
    fn test_route_findnode_books_traffic() {
        let router = create_test_router();
        let a = create_test_node(&router, 1);
        let b = create_test_node(&router, 2);
        let b_record = b.borrow().record().clone();

        let replies = router.route(
            &mut a.borrow_mut(),
            &b_record,
            Message::FindNode { distances: vec![0] },
        );

        assert_eq!(replies, vec![Message::Nodes { records: vec![b_record] }]);
        let a = a.borrow();
        let b = b.borrow();
        assert_eq!(a.outgoing_messages(), &[73]);
        assert_eq!(a.incoming_messages(), &[74 + 168]);
        assert_eq!(a.roundtrip_latency(), &[1, 1]);
        assert_eq!(b.incoming_messages(), &[73]);
        assert_eq!(b.outgoing_messages(), &[74 + 168]);
        assert_eq!(router.delivered(MessageType::FindNode), 1);
    }

    #[test]
    fn test_route_unknown_recipient() {
        let router = create_test_router();
        let a = create_test_node(&router, 1);
        let stranger = Record::new("/ip4/10.9.9.9/udp/30303", NodeKey::from_bytes([9; 32]).node_id());

        let replies = router.route(&mut a.borrow_mut(), &stranger, Message::Ping { seq: 1 });

        assert!(replies.is_empty());
        assert_eq!(a.borrow().outgoing_messages(), &[76]);
        assert_eq!(router.stats().unresolved, 1);
    }

    #[test]
    fn test_full_churn_drops_everything() {
        let router = create_test_router();
        router.set_churn_percent(100).unwrap();
        let a = create_test_node(&router, 1);
        let b = create_test_node(&router, 2);
        let b_record = b.borrow().record().clone();

        let replies = router.route(
            &mut a.borrow_mut(),
            &b_record,
            Message::FindNode { distances: vec![0] },
        );

        assert!(replies.is_empty());
        assert!(b.borrow().incoming_messages().is_empty());
        assert_eq!(router.stats().messages_dropped, 1);
    }

    #[test]
    fn test_route_to_self() {
        let router = create_test_router();
        let a = create_test_node(&router, 1);
        let own = a.borrow().record().clone();

        let replies = router.route(
            &mut a.borrow_mut(),
            &own,
            Message::FindNode { distances: vec![0] },
        );

        assert_eq!(replies, vec![Message::Nodes { records: vec![own] }]);
    }

    #[test]
    fn test_nodes_reply_feeds_recipient_table() {
        let router = create_test_router();
        let a = create_test_node(&router, 1);
        let b = create_test_node(&router, 2);
        let b_record = b.borrow().record().clone();
        let a_id = *a.borrow().id();

        router.route(
            &mut a.borrow_mut(),
            &b_record,
            Message::Nodes { records: vec![] },
        );

        assert!(b.borrow().table().find_one(&a_id).is_some());
    }
}
