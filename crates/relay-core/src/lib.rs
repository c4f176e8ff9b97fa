pub mod errors;
pub mod events;
pub mod ids;
pub mod model;

pub use errors::StateError;
pub use events::{ClientEvent, ServerEvent};
pub use ids::{CommentId, LevelId};
pub use model::{Comment, Level, Snapshot, VoteDirection, VoteTally};
