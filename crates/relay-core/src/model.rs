use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{CommentId, LevelId};

/// Origin tag used when a structured comment does not name its client type.
pub const DEFAULT_ORIGIN: &str = "web";

/// Origin tag for comments synthesized from non-JSON input.
pub const PLAIN_TEXT_ORIGIN: &str = "plain_text";

/// A comment in the shared, ordered comment list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: CommentId,
    pub content: String,
    /// Unix epoch milliseconds.
    pub timestamp: i64,
    #[serde(default = "default_origin")]
    pub origin: String,
    #[serde(default)]
    pub upvotes: u64,
    #[serde(default)]
    pub downvotes: u64,
}

fn default_origin() -> String {
    DEFAULT_ORIGIN.to_string()
}

/// A shared item ("level"). Any fields besides `id` and `name` are opaque
/// and carried through unchanged.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Level {
    pub id: LevelId,
    pub name: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

/// Aggregate votes for one level.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteTally {
    pub up: u64,
    pub down: u64,
}

impl VoteTally {
    pub fn record(&mut self, direction: VoteDirection) {
        match direction {
            VoteDirection::Up => self.up += 1,
            VoteDirection::Down => self.down += 1,
        }
    }
}

/// Point-in-time copy of every collection. Sent to joining clients and
/// used as the persisted document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(default)]
    pub comments: Vec<Comment>,
    #[serde(default)]
    pub items: Vec<Level>,
    #[serde(default)]
    pub vote_tallies: BTreeMap<LevelId, VoteTally>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.comments.is_empty() && self.items.is_empty() && self.vote_tallies.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VoteDirection {
    Up,
    Down,
}

impl VoteDirection {
    /// Map a wire `value` to a direction. Only the number `1` is an upvote;
    /// every other value (or none at all) is a downvote.
    pub fn from_wire(value: Option<&Value>) -> Self {
        match value.and_then(Value::as_f64) {
            Some(v) if v == 1.0 => Self::Up,
            _ => Self::Down,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
        }
    }
}

impl Comment {
    pub fn record_vote(&mut self, direction: VoteDirection) {
        match direction {
            VoteDirection::Up => self.upvotes += 1,
            VoteDirection::Down => self.downvotes += 1,
        }
    }
}

/// Current time in Unix epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
