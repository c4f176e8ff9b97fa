//! Authoritative in-memory state.
//!
//! `StateStore` has no interior locking: callers hold it behind a single
//! mutex and the engine is the only writer, so every operation sees and
//! leaves a consistent state.

use std::collections::{BTreeMap, HashSet};

use relay_core::model::now_millis;
use relay_core::{
    ClientEvent, Comment, CommentId, Level, LevelId, ServerEvent, Snapshot, StateError,
    VoteDirection, VoteTally,
};
use serde_json::{Map, Value};
use tracing::warn;

/// Whether an accepted operation changed anything.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Changed,
    /// Target already present (create) or absent (delete).
    NoOp,
}

/// Result of a successful state operation: the outcome plus the normalized
/// event describing it.
#[derive(Clone, Debug, PartialEq)]
pub struct Applied {
    pub outcome: Outcome,
    pub event: ServerEvent,
}

impl Applied {
    fn changed(event: ServerEvent) -> Self {
        Self {
            outcome: Outcome::Changed,
            event,
        }
    }

    fn no_op(event: ServerEvent) -> Self {
        Self {
            outcome: Outcome::NoOp,
            event,
        }
    }

    pub fn is_changed(&self) -> bool {
        self.outcome == Outcome::Changed
    }

    /// Whether clients hear about this outcome. A repeated create echoes
    /// the stored copy so a retrying client gets its confirmation; a
    /// delete of something already gone stays silent.
    pub fn is_broadcast(&self) -> bool {
        match self.outcome {
            Outcome::Changed => true,
            Outcome::NoOp => !matches!(
                self.event,
                ServerEvent::DeleteMessage { .. } | ServerEvent::DeleteLevel { .. }
            ),
        }
    }
}

#[derive(Debug, Default)]
pub struct StateStore {
    comments: Vec<Comment>,
    items: Vec<Level>,
    tallies: BTreeMap<LevelId, VoteTally>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild state from a loaded snapshot, repairing anything that breaks
    /// the collection invariants: duplicate ids keep their first entry, every
    /// level gets a tally, and tallies without a level are dropped.
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let mut seen = HashSet::new();
        let comments: Vec<Comment> = snapshot
            .comments
            .into_iter()
            .filter(|c| {
                let fresh = seen.insert(c.id.clone());
                if !fresh {
                    warn!(comment_id = %c.id, "dropping duplicate comment from stored state");
                }
                fresh
            })
            .collect();

        let mut seen = HashSet::new();
        let items: Vec<Level> = snapshot
            .items
            .into_iter()
            .filter(|l| {
                let fresh = seen.insert(l.id.clone());
                if !fresh {
                    warn!(level_id = %l.id, "dropping duplicate level from stored state");
                }
                fresh
            })
            .collect();

        let mut stored_tallies = snapshot.vote_tallies;
        let mut tallies = BTreeMap::new();
        for level in &items {
            let tally = stored_tallies.remove(&level.id).unwrap_or_default();
            tallies.insert(level.id.clone(), tally);
        }
        for orphan in stored_tallies.keys() {
            warn!(level_id = %orphan, "dropping vote tally without a level");
        }

        Self {
            comments,
            items,
            tallies,
        }
    }

    /// Apply one validated client event.
    pub fn apply(&mut self, event: ClientEvent) -> Result<Applied, StateError> {
        match event {
            ClientEvent::Comment {
                content,
                origin,
                id,
                timestamp,
            } => Ok(self.add_comment(content, origin, id, timestamp)),
            ClientEvent::NewLevel { id, name, payload } => self.add_item(id, name, payload),
            ClientEvent::DeleteMessage { message_id } => Ok(self.delete_comment(&message_id)),
            ClientEvent::DeleteLevel { level_id } => Ok(self.delete_item(&level_id)),
            ClientEvent::VoteComment {
                message_id,
                direction,
                value,
            } => self.vote_comment(&message_id, direction, value),
            ClientEvent::VoteLevel {
                level_id,
                direction,
                value,
            } => self.vote_item(&level_id, direction, value),
        }
    }

    /// Append a comment. A missing or empty id is generated here; a missing
    /// timestamp is the current time. Re-submitting an existing id is a
    /// no-op that returns the stored comment.
    pub fn add_comment(
        &mut self,
        content: String,
        origin: String,
        supplied_id: Option<String>,
        supplied_timestamp: Option<i64>,
    ) -> Applied {
        let id = match supplied_id.filter(|id| !id.is_empty()) {
            Some(raw) => CommentId::from_raw(raw),
            None => CommentId::new(),
        };

        if let Some(existing) = self.comments.iter().find(|c| c.id == id) {
            return Applied::no_op(ServerEvent::Comment(existing.clone()));
        }

        let comment = Comment {
            id,
            content,
            timestamp: supplied_timestamp.unwrap_or_else(now_millis),
            origin,
            upvotes: 0,
            downvotes: 0,
        };
        self.comments.push(comment.clone());
        Applied::changed(ServerEvent::Comment(comment))
    }

    pub fn vote_comment(
        &mut self,
        comment_id: &str,
        direction: VoteDirection,
        value: Value,
    ) -> Result<Applied, StateError> {
        let comment = self
            .comments
            .iter_mut()
            .find(|c| c.id.as_str() == comment_id)
            .ok_or_else(|| StateError::not_found("comment", comment_id))?;
        comment.record_vote(direction);
        Ok(Applied::changed(ServerEvent::VoteComment {
            message_id: comment.id.clone(),
            value,
            upvotes: comment.upvotes,
            downvotes: comment.downvotes,
        }))
    }

    pub fn delete_comment(&mut self, comment_id: &str) -> Applied {
        let before = self.comments.len();
        self.comments.retain(|c| c.id.as_str() != comment_id);
        let event = ServerEvent::DeleteMessage {
            message_id: CommentId::from_raw(comment_id),
        };
        if self.comments.len() < before {
            Applied::changed(event)
        } else {
            Applied::no_op(event)
        }
    }

    /// Insert a level with a zeroed tally. Both `id` and `name` must be
    /// non-empty; an existing id is a no-op.
    pub fn add_item(
        &mut self,
        id: Option<String>,
        name: Option<String>,
        payload: Map<String, Value>,
    ) -> Result<Applied, StateError> {
        let id = id
            .filter(|s| !s.is_empty())
            .ok_or_else(|| StateError::InvalidInput("level.id is required".into()))?;
        let name = name
            .filter(|s| !s.is_empty())
            .ok_or_else(|| StateError::InvalidInput("level.name is required".into()))?;
        let id = LevelId::from_raw(id);

        if let Some(existing) = self.items.iter().find(|l| l.id == id) {
            return Ok(Applied::no_op(ServerEvent::NewLevel {
                level: existing.clone(),
            }));
        }

        let level = Level { id, name, payload };
        self.tallies.insert(level.id.clone(), VoteTally::default());
        self.items.push(level.clone());
        Ok(Applied::changed(ServerEvent::NewLevel { level }))
    }

    pub fn vote_item(
        &mut self,
        level_id: &str,
        direction: VoteDirection,
        value: Value,
    ) -> Result<Applied, StateError> {
        let id = LevelId::from_raw(level_id);
        if !self.items.iter().any(|l| l.id == id) {
            return Err(StateError::not_found("level", level_id));
        }
        let tally = self
            .tallies
            .get_mut(&id)
            .ok_or_else(|| StateError::not_found("vote tally", level_id))?;
        tally.record(direction);
        Ok(Applied::changed(ServerEvent::VoteLevel {
            level_id: id,
            value,
            votes: *tally,
        }))
    }

    pub fn delete_item(&mut self, level_id: &str) -> Applied {
        let id = LevelId::from_raw(level_id);
        let before = self.items.len();
        self.items.retain(|l| l.id != id);
        let removed_tally = self.tallies.remove(&id).is_some();
        let event = ServerEvent::DeleteLevel { level_id: id };
        if self.items.len() < before || removed_tally {
            Applied::changed(event)
        } else {
            Applied::no_op(event)
        }
    }

    /// Deep copy of every collection.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            comments: self.comments.clone(),
            items: self.items.clone(),
            vote_tallies: self.tallies.clone(),
        }
    }

    /// `(comments, items)` counts.
    pub fn counts(&self) -> (usize, usize) {
        (self.comments.len(), self.items.len())
    }
}
