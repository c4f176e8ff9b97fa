//! Turns raw inbound text into exactly one state store call.
//!
//! Two stages: try a structured JSON decode, and if the text is not a JSON
//! object, treat the whole text as a plain comment. Structured events with a
//! missing or unknown `type` are dropped.

use relay_core::ids::wire_id;
use relay_core::model::{DEFAULT_ORIGIN, PLAIN_TEXT_ORIGIN};
use relay_core::{ClientEvent, StateError, VoteDirection};
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use crate::state::{Applied, StateStore};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("empty payload")]
    Empty,
    #[error("event has no type")]
    MissingType,
    #[error("unknown event type: {0}")]
    UnknownType(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("admin secret required for {0}")]
    Unauthorized(&'static str),
    #[error(transparent)]
    State(#[from] StateError),
}

impl DispatchError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::MissingType | Self::UnknownType(_) => "unknown_event",
            Self::InvalidInput(_) => "invalid_input",
            Self::Unauthorized(_) => "unauthorized",
            Self::State(e) => e.error_kind(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Dispatcher {
    admin_secret: Option<String>,
}

impl Dispatcher {
    pub fn new(admin_secret: Option<String>) -> Self {
        Self {
            admin_secret: admin_secret.filter(|s| !s.is_empty()),
        }
    }

    /// Parse and apply one inbound payload.
    #[instrument(skip_all, fields(event_type))]
    pub fn dispatch(&self, raw: &str, state: &mut StateStore) -> Result<Applied, DispatchError> {
        let event = self.parse(raw)?;
        tracing::Span::current().record("event_type", event.event_type());
        Ok(state.apply(event)?)
    }

    /// Classify and validate an inbound payload.
    pub fn parse(&self, raw: &str) -> Result<ClientEvent, DispatchError> {
        let mut obj = match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(obj)) => obj,
            Ok(_) | Err(_) => return plain_text(raw),
        };

        let kind = match obj.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            _ => return Err(DispatchError::MissingType),
        };

        match kind.as_str() {
            "comment" => {
                let content = required_text(&obj, "content")?;
                let origin = obj
                    .get("origin")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .unwrap_or(DEFAULT_ORIGIN)
                    .to_string();
                Ok(ClientEvent::Comment {
                    content,
                    origin,
                    id: wire_id(obj.get("id")),
                    timestamp: obj.get("timestamp").and_then(Value::as_i64),
                })
            }
            "new_level" => {
                let mut level = match obj.remove("level") {
                    Some(Value::Object(level)) => level,
                    _ => return Err(DispatchError::InvalidInput("level is required".into())),
                };
                let id = wire_id(level.get("id"));
                let name = level
                    .get("name")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                level.remove("id");
                level.remove("name");
                Ok(ClientEvent::NewLevel {
                    id,
                    name,
                    payload: level,
                })
            }
            "delete_message" => {
                self.authorize(&obj, "delete_message")?;
                Ok(ClientEvent::DeleteMessage {
                    message_id: required_id(&obj, "messageId")?,
                })
            }
            "delete_level" => {
                self.authorize(&obj, "delete_level")?;
                Ok(ClientEvent::DeleteLevel {
                    level_id: required_id(&obj, "levelId")?,
                })
            }
            "vote_comment" => {
                let message_id = required_id(&obj, "messageId")?;
                let value = required_value(&mut obj)?;
                Ok(ClientEvent::VoteComment {
                    message_id,
                    direction: VoteDirection::from_wire(Some(&value)),
                    value,
                })
            }
            "vote_level" => {
                let level_id = required_id(&obj, "levelId")?;
                let value = required_value(&mut obj)?;
                Ok(ClientEvent::VoteLevel {
                    level_id,
                    direction: VoteDirection::from_wire(Some(&value)),
                    value,
                })
            }
            _ => Err(DispatchError::UnknownType(kind)),
        }
    }

    fn authorize(&self, obj: &Map<String, Value>, action: &'static str) -> Result<(), DispatchError> {
        let Some(secret) = &self.admin_secret else {
            return Ok(());
        };
        match obj.get("adminSecret").and_then(Value::as_str) {
            Some(given) if given == secret => Ok(()),
            _ => Err(DispatchError::Unauthorized(action)),
        }
    }
}

fn plain_text(raw: &str) -> Result<ClientEvent, DispatchError> {
    if raw.trim().is_empty() {
        return Err(DispatchError::Empty);
    }
    debug!(len = raw.len(), "unstructured payload, treating as comment");
    Ok(ClientEvent::Comment {
        content: raw.to_string(),
        origin: PLAIN_TEXT_ORIGIN.to_string(),
        id: None,
        timestamp: None,
    })
}

fn required_text(obj: &Map<String, Value>, field: &str) -> Result<String, DispatchError> {
    obj.get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
        .ok_or_else(|| DispatchError::InvalidInput(format!("{field} is required")))
}

fn required_id(obj: &Map<String, Value>, field: &str) -> Result<String, DispatchError> {
    wire_id(obj.get(field)).ok_or_else(|| DispatchError::InvalidInput(format!("{field} is required")))
}

fn required_value(obj: &mut Map<String, Value>) -> Result<Value, DispatchError> {
    obj.remove("value")
        .ok_or_else(|| DispatchError::InvalidInput("value is required".into()))
}
