//! Discovery message set (FINDNODE, NODES, PING, PONG, REGTOPIC, TICKET,
//! REGCONFIRMATION, TOPICQUERY)
//!
//! Messages are in-memory values passed between simulated peers. The sizes
//! below are estimates of the encoded datagram and only feed traffic
//! accounting.

use crate::node_id::NodeId;
use crate::record::Record;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Average size of a filled ticket in bytes
pub const AVERAGE_TICKET_SIZE: usize = 48;

/// Estimated size of an encoded record inside a message
pub const RECORD_SIZE: usize = 168;

/// Message type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    FindNode,
    Nodes,
    Ping,
    Pong,
    RegTopic,
    Ticket,
    RegConfirmation,
    TopicQuery,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::FindNode => "FINDNODE",
            MessageType::Nodes => "NODES",
            MessageType::Ping => "PING",
            MessageType::Pong => "PONG",
            MessageType::RegTopic => "REGTOPIC",
            MessageType::Ticket => "TICKET",
            MessageType::RegConfirmation => "REGCONFIRMATION",
            MessageType::TopicQuery => "TOPICQUERY",
        };
        f.write_str(name)
    }
}

/// Discovery protocol message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Request the records held at the given bucket distances
    FindNode { distances: Vec<usize> },

    /// Records, at most a handful per message
    Nodes { records: Vec<Record> },

    /// Liveness probe carrying the sender's sequence
    Ping { seq: u64 },

    /// Liveness reply carrying the responder's sequence
    Pong { seq: u64 },

    /// Ask the recipient to host an ad for `topic`
    RegTopic {
        topic: NodeId,
        record: Record,
        ticket: Vec<u8>,
    },

    /// Retry hint, `wait_steps == 0` means the ad was placed
    Ticket { ticket: Vec<u8>, wait_steps: usize },

    /// Confirms a successful ad placement
    RegConfirmation { topic: NodeId },

    /// Request the advertisers known for `topic`
    TopicQuery { topic: NodeId },
}

impl Message {
    /// Get the type tag
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::FindNode { .. } => MessageType::FindNode,
            Message::Nodes { .. } => MessageType::Nodes,
            Message::Ping { .. } => MessageType::Ping,
            Message::Pong { .. } => MessageType::Pong,
            Message::RegTopic { .. } => MessageType::RegTopic,
            Message::Ticket { .. } => MessageType::Ticket,
            Message::RegConfirmation { .. } => MessageType::RegConfirmation,
            Message::TopicQuery { .. } => MessageType::TopicQuery,
        }
    }

    /// Estimated encoded size in bytes
    pub fn size(&self) -> usize {
        match self {
            Message::FindNode { distances } => 72 + distances.len(),
            Message::Nodes { records } => 74 + RECORD_SIZE * records.len(),
            Message::Ping { .. } => 76,
            Message::Pong { .. } => 80,
            Message::RegTopic { ticket, .. } => 90 + ticket.len() + RECORD_SIZE,
            Message::Ticket { ticket, .. } => 78 + ticket.len(),
            Message::RegConfirmation { .. } => 72,
            Message::TopicQuery { .. } => 72,
        }
    }

    /// Split records into NODES messages of at most `per_message` each
    ///
    /// No records yield no messages.
    pub fn nodes_chunked(records: Vec<Record>, per_message: usize) -> Vec<Message> {
        records
            .chunks(per_message.max(1))
            .map(|chunk| Message::Nodes {
                records: chunk.to_vec(),
            })
            .collect()
    }
}
