//! Record metadata search
//!
//! A [`FindEnrsOnPeer`] walks one peer's table from its farthest bucket down,
//! a few distances per FINDNODE, and keeps the records whose metadata holds a
//! wanted value. An [`EnrSearch`] runs such walks over many peers in bounded
//! parallel until enough distinct matches are known.

use super::{FindCallback, Producer, RoundTrip, Task, UnionSearch};
use crate::config::SimConfig;
use crate::error::{Result, SimError};
use crate::node::{nodes_records, Node};
use discsim_dht::{Message, MetaKey, NodeId, Record};
use std::collections::HashSet;
use tracing::debug;

/// Walks the table of one peer for records carrying `key = value`
pub struct FindEnrsOnPeer {
    media: Record,
    key: MetaKey,
    value: Vec<u8>,

    /// Farthest distance of the next FINDNODE
    distance: usize,

    /// Distances per FINDNODE
    span: usize,

    /// A reply shorter than this ends the walk
    bucket_size: usize,

    attempt: Option<RoundTrip>,
    found: HashSet<NodeId>,
    finished: bool,
}

impl FindEnrsOnPeer {
    pub fn new(media: Record, key: MetaKey, value: Vec<u8>, config: &SimConfig) -> Self {
        FindEnrsOnPeer {
            media,
            key,
            value,
            distance: config
                .buckets_count
                .div_ceil(config.distance_divisor.max(1)),
            span: config.neighbor_distances_limit.max(1),
            bucket_size: config.bucket_size,
            attempt: None,
            found: HashSet::new(),
            finished: false,
        }
    }

    /// Distances of the next FINDNODE, bucket 1 at the lowest
    fn window(&self) -> Vec<usize> {
        (0..self.span)
            .filter_map(|offset| self.distance.checked_sub(offset))
            .filter(|distance| *distance > 0)
            .collect()
    }

    fn on_answer(&mut self, node: &mut Node, replies: Vec<Message>) {
        let records = nodes_records(&replies);
        node.handle_all(replies, &self.media);

        let (key, value) = (self.key, self.value.as_slice());
        let matching: Vec<NodeId> = records
            .iter()
            .filter(|record| record.meta_value(key) == Some(value))
            .map(|record| *record.id())
            .collect();
        self.found.extend(matching);

        if records.len() < self.bucket_size || self.distance <= 1 {
            self.finished = true;
        }
        self.distance -= 1;
    }
}

impl Task for FindEnrsOnPeer {
    fn step(&mut self, node: &mut Node) -> Result<()> {
        if self.finished {
            return Ok(());
        }

        if let Some(mut attempt) = self.attempt.take() {
            attempt.step(node)?;
            if !attempt.is_over() {
                self.attempt = Some(attempt);
                return Ok(());
            }
            self.on_answer(node, attempt.take_replies());
            return Ok(());
        }

        let distances = self.window();
        if distances.is_empty() {
            self.finished = true;
            return Ok(());
        }
        let mut attempt = RoundTrip::new(self.media.clone(), Message::FindNode { distances });
        attempt.step(node)?;
        self.attempt = Some(attempt);
        Ok(())
    }

    fn is_over(&self) -> bool {
        self.finished
    }
}

impl Producer for FindEnrsOnPeer {
    type Output = HashSet<NodeId>;

    fn result(&self) -> Result<HashSet<NodeId>> {
        if !self.finished {
            return Err(SimError::ResultNotReady("find enrs on peer"));
        }
        Ok(self.found.clone())
    }
}

/// Runs metadata walks over many peers and reports the matches found
pub struct EnrSearch {
    search: UnionSearch<FindEnrsOnPeer>,
    callback: Option<FindCallback>,
}

impl EnrSearch {
    pub fn new(search: UnionSearch<FindEnrsOnPeer>, callback: FindCallback) -> Self {
        EnrSearch {
            search,
            callback: Some(callback),
        }
    }
}

impl Task for EnrSearch {
    fn step(&mut self, node: &mut Node) -> Result<()> {
        if self.callback.is_none() {
            return Ok(());
        }

        if !self.search.is_over() {
            self.search.step(node)?;
        }
        if self.search.is_over() {
            let found = self.search.result()?;
            debug!("Node {}: metadata search found {} peers", node.id(), found.len());
            if let Some(callback) = self.callback.take() {
                callback(node, found);
            }
        }
        Ok(())
    }

    fn is_over(&self) -> bool {
        self.callback.is_none()
    }
}
