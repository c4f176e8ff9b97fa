use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{CommentId, LevelId};
use crate::model::{Comment, Level, Snapshot, VoteDirection, VoteTally};

/// A validated client request, ready to be applied to the state store.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientEvent {
    Comment {
        content: String,
        origin: String,
        id: Option<String>,
        timestamp: Option<i64>,
    },
    NewLevel {
        id: Option<String>,
        name: Option<String>,
        payload: Map<String, Value>,
    },
    DeleteMessage {
        message_id: String,
    },
    DeleteLevel {
        level_id: String,
    },
    VoteComment {
        message_id: String,
        direction: VoteDirection,
        value: Value,
    },
    VoteLevel {
        level_id: String,
        direction: VoteDirection,
        value: Value,
    },
}

impl ClientEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Comment { .. } => "comment",
            Self::NewLevel { .. } => "new_level",
            Self::DeleteMessage { .. } => "delete_message",
            Self::DeleteLevel { .. } => "delete_level",
            Self::VoteComment { .. } => "vote_comment",
            Self::VoteLevel { .. } => "vote_level",
        }
    }
}

/// Events sent from the server to clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    Init {
        comments: Vec<Comment>,
        items: Vec<Level>,
        vote_tallies: BTreeMap<LevelId, VoteTally>,
    },
    Comment(Comment),
    NewLevel {
        level: Level,
    },
    DeleteMessage {
        message_id: CommentId,
    },
    DeleteLevel {
        level_id: LevelId,
    },
    VoteComment {
        message_id: CommentId,
        value: Value,
        upvotes: u64,
        downvotes: u64,
    },
    VoteLevel {
        level_id: LevelId,
        value: Value,
        votes: VoteTally,
    },
}

impl ServerEvent {
    pub fn init(snapshot: Snapshot) -> Self {
        Self::Init {
            comments: snapshot.comments,
            items: snapshot.items,
            vote_tallies: snapshot.vote_tallies,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::Comment(_) => "comment",
            Self::NewLevel { .. } => "new_level",
            Self::DeleteMessage { .. } => "delete_message",
            Self::DeleteLevel { .. } => "delete_level",
            Self::VoteComment { .. } => "vote_comment",
            Self::VoteLevel { .. } => "vote_level",
        }
    }
}
