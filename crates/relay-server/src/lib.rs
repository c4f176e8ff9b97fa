//! WebSocket relay: authoritative state, event dispatch, connection registry
//! and the serialized engine tying them to a persistent store.

pub mod dispatcher;
pub mod engine;
pub mod registry;
pub mod server;
pub mod session;
pub mod state;

pub use dispatcher::{DispatchError, Dispatcher};
pub use engine::{Command, Engine};
pub use registry::{BroadcastPolicy, ClientId, ConnectionRegistry};
pub use server::{build_router, start, AppState, ServerConfig, ServerError, ServerHandle};
pub use state::{Applied, Outcome, StateStore};
