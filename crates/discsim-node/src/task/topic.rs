//! Topic advertisement and topic search
//!
//! Both run in two phases. A discovery producer (random table sample or
//! parallel ID search) yields the media, then a bounded-parallel set of
//! per-medium tasks places ads (REGTOPIC/TICKET) or queries them
//! (TOPICQUERY). Per-medium tasks own their round-trip, so a request placed
//! in round `n` is answered in round `n + 1`.

use super::{ParallelQueue, Producer, RoundTrip, Task, UnionSearch};
use crate::error::{Result, SimError};
use crate::node::Node;
use discsim_dht::messages::AVERAGE_TICKET_SIZE;
use discsim_dht::{Message, NodeId, Record};
use std::collections::HashSet;
use tracing::debug;

/// Size of the empty ticket sent with a first REGTOPIC
const FIRST_TICKET_SIZE: usize = 1;

/// Callback receiving `(medium, ad placed)` for every medium tried
pub type AdvertiseCallback = Box<dyn FnOnce(&mut Node, Vec<(Record, bool)>)>;

/// Callback receiving the advertisers found for a topic
pub type FindCallback = Box<dyn FnOnce(&mut Node, HashSet<NodeId>)>;

/// Discovery phase of a topic task
pub type MediaDiscovery = Box<dyn Producer<Output = Vec<Record>>>;

/// Places one ad on one medium, following its tickets
pub struct AdvertiseOnMedia {
    media: Record,
    topic: NodeId,

    /// Longest ticket wait accepted
    retry_max: usize,

    attempt: Option<RoundTrip>,

    /// Rounds left before the next attempt
    wait: usize,

    retrying: bool,
    outcome: Option<bool>,
}

impl AdvertiseOnMedia {
    pub fn new(media: Record, topic: NodeId, retry_max: usize) -> Self {
        AdvertiseOnMedia {
            media,
            topic,
            retry_max,
            attempt: None,
            wait: 0,
            retrying: false,
            outcome: None,
        }
    }

    fn place(&mut self, node: &mut Node) -> Result<()> {
        let ticket_size = if self.retrying {
            AVERAGE_TICKET_SIZE
        } else {
            FIRST_TICKET_SIZE
        };
        let message = Message::RegTopic {
            topic: self.topic,
            record: node.record().clone(),
            ticket: vec![0; ticket_size],
        };

        let mut attempt = RoundTrip::new(self.media.clone(), message);
        attempt.step(node)?;
        self.attempt = Some(attempt);
        Ok(())
    }

    fn on_answer(&mut self, node: &mut Node, replies: Vec<Message>) -> Result<()> {
        let wait_steps = replies.iter().find_map(|message| match message {
            Message::Ticket { wait_steps, .. } => Some(*wait_steps),
            _ => None,
        });
        node.handle_all(replies, &self.media);

        match wait_steps {
            None => self.place(node)?,
            Some(0) => self.outcome = Some(true),
            Some(wait) if wait <= self.retry_max => {
                self.wait = wait;
                self.retrying = true;
            }
            Some(wait) => {
                debug!(
                    "Node {}: medium {} saturated for {} ({} rounds)",
                    node.id(),
                    self.media.short_id(),
                    self.topic,
                    wait
                );
                self.outcome = Some(false);
            }
        }
        Ok(())
    }
}

impl Task for AdvertiseOnMedia {
    fn step(&mut self, node: &mut Node) -> Result<()> {
        if self.outcome.is_some() {
            return Ok(());
        }

        if let Some(mut attempt) = self.attempt.take() {
            attempt.step(node)?;
            if !attempt.is_over() {
                self.attempt = Some(attempt);
                return Ok(());
            }
            return self.on_answer(node, attempt.take_replies());
        }

        if self.wait > 0 {
            self.wait -= 1;
            return Ok(());
        }
        self.place(node)
    }

    fn is_over(&self) -> bool {
        self.outcome.is_some()
    }
}

impl Producer for AdvertiseOnMedia {
    type Output = (Record, bool);

    fn result(&self) -> Result<(Record, bool)> {
        match self.outcome {
            Some(placed) => Ok((self.media.clone(), placed)),
            None => Err(SimError::ResultNotReady("advertise on media")),
        }
    }
}

/// Asks one medium for the advertisers of a topic
pub struct FindAdOnMedia {
    media: Record,
    topic: NodeId,
    attempt: Option<RoundTrip>,
    found: Option<HashSet<NodeId>>,
}

impl FindAdOnMedia {
    pub fn new(media: Record, topic: NodeId) -> Self {
        FindAdOnMedia {
            media,
            topic,
            attempt: None,
            found: None,
        }
    }
}

impl Task for FindAdOnMedia {
    fn step(&mut self, node: &mut Node) -> Result<()> {
        if self.found.is_some() {
            return Ok(());
        }

        let mut attempt = match self.attempt.take() {
            Some(attempt) => attempt,
            None => RoundTrip::new(
                self.media.clone(),
                Message::TopicQuery { topic: self.topic },
            ),
        };
        attempt.step(node)?;
        if !attempt.is_over() {
            self.attempt = Some(attempt);
            return Ok(());
        }

        let replies = attempt.take_replies();
        let found = replies
            .iter()
            .filter_map(|message| match message {
                Message::Nodes { records } => Some(records),
                _ => None,
            })
            .flatten()
            .map(|record| *record.id())
            .collect();
        node.handle_all(replies, &self.media);
        self.found = Some(found);
        Ok(())
    }

    fn is_over(&self) -> bool {
        self.found.is_some()
    }
}

impl Producer for FindAdOnMedia {
    type Output = HashSet<NodeId>;

    fn result(&self) -> Result<HashSet<NodeId>> {
        self.found
            .clone()
            .ok_or(SimError::ResultNotReady("find ad on media"))
    }
}

/// Queries media in bounded parallel until enough advertisers are known
pub type AdSearch = UnionSearch<FindAdOnMedia>;

/// Finds media for a topic and places an ad on each of them
pub struct TopicAdvertise {
    topic: NodeId,
    discovery: MediaDiscovery,
    advertise: Option<ParallelQueue<AdvertiseOnMedia>>,
    retry_max: usize,
    parallelism: usize,
    callback: Option<AdvertiseCallback>,
}

impl TopicAdvertise {
    pub fn new(
        topic: NodeId,
        discovery: MediaDiscovery,
        retry_max: usize,
        parallelism: usize,
        callback: AdvertiseCallback,
    ) -> Self {
        TopicAdvertise {
            topic,
            discovery,
            advertise: None,
            retry_max,
            parallelism,
            callback: Some(callback),
        }
    }
}

impl Task for TopicAdvertise {
    fn step(&mut self, node: &mut Node) -> Result<()> {
        if self.callback.is_none() {
            return Ok(());
        }

        if self.advertise.is_none() {
            if !self.discovery.is_over() {
                return self.discovery.step(node);
            }
            let media = self.discovery.result()?;
            debug!(
                "Node {}: advertising {} on {} media",
                node.id(),
                self.topic,
                media.len()
            );
            let tasks = media
                .into_iter()
                .map(|medium| AdvertiseOnMedia::new(medium, self.topic, self.retry_max));
            self.advertise = Some(ParallelQueue::new(tasks, self.parallelism));
        }

        if let Some(queue) = self.advertise.as_mut() {
            if !queue.is_over() {
                queue.step(node)?;
            }
            if queue.is_over() {
                let placements = queue.result()?;
                if let Some(callback) = self.callback.take() {
                    callback(node, placements);
                }
            }
        }
        Ok(())
    }

    fn is_over(&self) -> bool {
        self.callback.is_none()
    }
}

/// Finds media for a topic and collects the advertisers they host
pub struct TopicFind {
    topic: NodeId,
    discovery: MediaDiscovery,
    search: Option<AdSearch>,
    required: usize,
    parallelism: usize,
    callback: Option<FindCallback>,
}

impl TopicFind {
    pub fn new(
        topic: NodeId,
        discovery: MediaDiscovery,
        required: usize,
        parallelism: usize,
        callback: FindCallback,
    ) -> Self {
        TopicFind {
            topic,
            discovery,
            search: None,
            required,
            parallelism,
            callback: Some(callback),
        }
    }
}

impl Task for TopicFind {
    fn step(&mut self, node: &mut Node) -> Result<()> {
        if self.callback.is_none() {
            return Ok(());
        }

        if self.search.is_none() {
            if !self.discovery.is_over() {
                return self.discovery.step(node);
            }
            let media = self.discovery.result()?;
            let tasks = media
                .into_iter()
                .map(|medium| FindAdOnMedia::new(medium, self.topic));
            self.search = Some(AdSearch::new(tasks, self.required, self.parallelism));
        }

        if let Some(search) = self.search.as_mut() {
            if !search.is_over() {
                search.step(node)?;
            }
            if search.is_over() {
                let found = search.result()?;
                debug!(
                    "Node {}: found {} advertisers for {}",
                    node.id(),
                    found.len(),
                    self.topic
                );
                if let Some(callback) = self.callback.take() {
                    callback(node, found);
                }
            }
        }
        Ok(())
    }

    fn is_over(&self) -> bool {
        self.callback.is_none()
    }
}
