//! Serialized mutation path.
//!
//! One task consumes every command in arrival order. A message is fully
//! dispatched, committed and broadcast before the next command is looked at,
//! so every client sees mutations in the same order they were applied.

use std::sync::Arc;

use parking_lot::Mutex;
use relay_core::{ServerEvent, Snapshot};
use relay_store::PersistentStore;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::dispatcher::{DispatchError, Dispatcher};
use crate::registry::{BroadcastPolicy, ClientId, ConnectionRegistry};
use crate::state::StateStore;

/// Work submitted by sessions.
#[derive(Debug)]
pub enum Command {
    /// Send the current snapshot and start receiving broadcasts.
    Join(ClientId),
    /// One inbound text frame.
    Message { client_id: ClientId, text: String },
}

/// What the engine did with one command.
#[derive(Debug, PartialEq)]
pub enum Handled {
    Joined,
    /// Connection went away before its snapshot could be queued.
    JoinFailed,
    /// Event reached this many connections. Repeated creates land here
    /// too, carrying the stored copy.
    Broadcast(usize),
    /// Accepted, but nothing changed.
    Unchanged,
    Dropped(DispatchError),
}

pub struct Engine {
    state: Arc<Mutex<StateStore>>,
    dispatcher: Dispatcher,
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn PersistentStore>,
    policy: BroadcastPolicy,
}

impl Engine {
    pub fn new(
        state: Arc<Mutex<StateStore>>,
        dispatcher: Dispatcher,
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn PersistentStore>,
        policy: BroadcastPolicy,
    ) -> Self {
        Self {
            state,
            dispatcher,
            registry,
            store,
            policy,
        }
    }

    /// Start the consumer task. The task ends once every sender is dropped.
    pub fn spawn(self, queue: usize) -> (mpsc::Sender<Command>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(queue.max(1));
        let handle = tokio::spawn(self.run(rx));
        (tx, handle)
    }

    pub async fn run(self, mut rx: mpsc::Receiver<Command>) {
        while let Some(command) = rx.recv().await {
            self.handle(command).await;
        }
        debug!("command queue closed, engine stopping");
    }

    pub async fn handle(&self, command: Command) -> Handled {
        match command {
            Command::Join(client_id) => self.join(&client_id),
            Command::Message { client_id, text } => self.message(&client_id, &text).await,
        }
    }

    fn join(&self, client_id: &ClientId) -> Handled {
        let init = ServerEvent::init(self.state.lock().snapshot());
        if !self.registry.send_to(client_id, &init) {
            debug!(client_id = %client_id, "connection gone before init");
            return Handled::JoinFailed;
        }
        self.registry.mark_open(client_id);
        info!(client_id = %client_id, "client joined");
        Handled::Joined
    }

    async fn message(&self, client_id: &ClientId, text: &str) -> Handled {
        let (applied, snapshot) = {
            let mut state = self.state.lock();
            match self.dispatcher.dispatch(text, &mut state) {
                Ok(applied) => {
                    let snapshot = applied.is_changed().then(|| state.snapshot());
                    (applied, snapshot)
                }
                Err(e) => {
                    warn!(
                        client_id = %client_id,
                        error_kind = e.error_kind(),
                        error = %e,
                        "dropping event"
                    );
                    return Handled::Dropped(e);
                }
            }
        };

        if !applied.is_broadcast() {
            debug!(
                client_id = %client_id,
                event_type = applied.event.event_type(),
                "event changed nothing"
            );
            return Handled::Unchanged;
        }

        // a repeated create leaves state as it was, nothing to commit
        if let Some(snapshot) = snapshot {
            self.commit(snapshot).await;
        }

        let recipients = self
            .registry
            .broadcast(&applied.event, self.policy.exclusion(client_id));
        debug!(
            client_id = %client_id,
            event_type = applied.event.event_type(),
            recipients,
            "broadcast"
        );
        Handled::Broadcast(recipients)
    }

    /// Failures are logged only. Memory keeps the change and the next
    /// successful commit carries it.
    async fn commit(&self, snapshot: Snapshot) {
        let store = Arc::clone(&self.store);
        match tokio::task::spawn_blocking(move || store.commit(&snapshot)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(store = self.store.name(), error = %e, "commit failed"),
            Err(e) => error!(store = self.store.name(), error = %e, "commit task failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_store::MemoryStore;
    use serde_json::Value;

    struct Harness {
        engine: Engine,
        state: Arc<Mutex<StateStore>>,
        registry: Arc<ConnectionRegistry>,
        store: Arc<MemoryStore>,
    }

    fn harness(policy: BroadcastPolicy) -> Harness {
        let state = Arc::new(Mutex::new(StateStore::new()));
        let registry = Arc::new(ConnectionRegistry::new(32));
        let store = Arc::new(MemoryStore::new());
        let engine = Engine::new(
            Arc::clone(&state),
            Dispatcher::default(),
            Arc::clone(&registry),
            store.clone(),
            policy,
        );
        Harness {
            engine,
            state,
            registry,
            store,
        }
    }

    fn frame(rx: &mut mpsc::Receiver<Arc<str>>) -> Value {
        let raw = rx.try_recv().expect("frame queued");
        serde_json::from_str(&raw).unwrap()
    }

    fn message(client_id: &ClientId, text: &str) -> Command {
        Command::Message {
            client_id: client_id.clone(),
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn join_sends_init_then_opens() {
        let h = harness(BroadcastPolicy::EchoToSender);
        let (id, mut rx) = h.registry.register();

        assert_eq!(h.engine.handle(Command::Join(id.clone())).await, Handled::Joined);
        let init = frame(&mut rx);
        assert_eq!(init["type"], "init");
        assert_eq!(init["comments"], serde_json::json!([]));
        assert_eq!(init["items"], serde_json::json!([]));
        assert_eq!(init["voteTallies"], serde_json::json!({}));
        assert_eq!(h.registry.open_count(), 1);
    }

    #[tokio::test]
    async fn join_of_departed_connection_fails() {
        let h = harness(BroadcastPolicy::EchoToSender);
        let (id, _rx) = h.registry.register();
        h.registry.unregister(&id);
        assert_eq!(h.engine.handle(Command::Join(id)).await, Handled::JoinFailed);
    }

    #[tokio::test]
    async fn comment_is_committed_and_broadcast() {
        let h = harness(BroadcastPolicy::EchoToSender);
        let (a, mut rx_a) = h.registry.register();
        let (b, mut rx_b) = h.registry.register();
        h.engine.handle(Command::Join(a.clone())).await;
        h.engine.handle(Command::Join(b.clone())).await;
        frame(&mut rx_a);
        frame(&mut rx_b);

        let handled = h
            .engine
            .handle(message(&a, r#"{"type":"comment","content":"hello"}"#))
            .await;
        assert_eq!(handled, Handled::Broadcast(2));

        for rx in [&mut rx_a, &mut rx_b] {
            let event = frame(rx);
            assert_eq!(event["type"], "comment");
            assert_eq!(event["content"], "hello");
            assert!(!event["id"].as_str().unwrap().is_empty());
            assert!(event["timestamp"].as_i64().is_some());
        }
        assert_eq!(h.store.commit_count(), 1);
        assert_eq!(h.store.stored().comments[0].content, "hello");
    }

    #[tokio::test]
    async fn exclude_sender_policy() {
        let h = harness(BroadcastPolicy::ExcludeSender);
        let (a, mut rx_a) = h.registry.register();
        let (b, mut rx_b) = h.registry.register();
        h.engine.handle(Command::Join(a.clone())).await;
        h.engine.handle(Command::Join(b.clone())).await;
        frame(&mut rx_a);
        frame(&mut rx_b);

        let handled = h.engine.handle(message(&a, "hi there")).await;
        assert_eq!(handled, Handled::Broadcast(1));
        assert!(rx_a.try_recv().is_err());
        assert_eq!(frame(&mut rx_b)["content"], "hi there");
    }

    #[tokio::test]
    async fn no_op_skips_commit_and_broadcast() {
        let h = harness(BroadcastPolicy::EchoToSender);
        let (a, mut rx) = h.registry.register();
        h.engine.handle(Command::Join(a.clone())).await;
        frame(&mut rx);

        let handled = h
            .engine
            .handle(message(&a, r#"{"type":"delete_level","levelId":"missing"}"#))
            .await;
        assert_eq!(handled, Handled::Unchanged);
        assert_eq!(h.store.commit_count(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn repeated_level_echoes_first_copy() {
        let h = harness(BroadcastPolicy::EchoToSender);
        let (a, mut rx) = h.registry.register();
        h.engine.handle(Command::Join(a.clone())).await;
        frame(&mut rx);

        let first = r#"{"type":"new_level","level":{"id":"L","name":"First"}}"#;
        let second = r#"{"type":"new_level","level":{"id":"L","name":"Second"}}"#;
        assert_eq!(h.engine.handle(message(&a, first)).await, Handled::Broadcast(1));
        assert_eq!(frame(&mut rx)["level"]["name"], "First");

        assert_eq!(h.engine.handle(message(&a, second)).await, Handled::Broadcast(1));
        let retry = frame(&mut rx);
        assert_eq!(retry["type"], "new_level");
        assert_eq!(retry["level"]["name"], "First");

        let snapshot = h.state.lock().snapshot();
        assert_eq!(snapshot.items.len(), 1);
        assert_eq!(snapshot.items[0].name, "First");
        assert_eq!(h.store.commit_count(), 1);
    }

    #[tokio::test]
    async fn retried_comment_is_confirmed_without_commit() {
        let h = harness(BroadcastPolicy::EchoToSender);
        let (a, mut rx) = h.registry.register();
        h.engine.handle(Command::Join(a.clone())).await;
        frame(&mut rx);

        let text = r#"{"type":"comment","content":"hello","id":"c1"}"#;
        assert_eq!(h.engine.handle(message(&a, text)).await, Handled::Broadcast(1));
        let original = frame(&mut rx);

        let retry = r#"{"type":"comment","content":"edited","id":"c1"}"#;
        assert_eq!(h.engine.handle(message(&a, retry)).await, Handled::Broadcast(1));
        let echoed = frame(&mut rx);
        assert_eq!(echoed, original);
        assert_eq!(echoed["content"], "hello");

        assert_eq!(h.state.lock().counts(), (1, 0));
        assert_eq!(h.store.commit_count(), 1);
    }

    #[tokio::test]
    async fn invalid_events_are_dropped() {
        let h = harness(BroadcastPolicy::EchoToSender);
        let (a, mut rx) = h.registry.register();
        h.engine.handle(Command::Join(a.clone())).await;
        frame(&mut rx);

        let handled = h.engine.handle(message(&a, r#"{"type":"explode"}"#)).await;
        assert_eq!(handled, Handled::Dropped(DispatchError::UnknownType("explode".into())));
        let handled = h
            .engine
            .handle(message(&a, r#"{"type":"vote_comment","messageId":"nope","value":1}"#))
            .await;
        assert!(matches!(handled, Handled::Dropped(DispatchError::State(_))));

        assert_eq!(h.store.commit_count(), 0);
        assert!(rx.try_recv().is_err());
        // connection survives processing errors
        assert_eq!(h.registry.open_count(), 1);
    }

    #[tokio::test]
    async fn failed_commit_keeps_memory_and_broadcasts() {
        let h = harness(BroadcastPolicy::EchoToSender);
        let (a, mut rx) = h.registry.register();
        h.engine.handle(Command::Join(a.clone())).await;
        frame(&mut rx);

        h.store.set_fail_commits(true);
        let handled = h.engine.handle(message(&a, "first")).await;
        assert_eq!(handled, Handled::Broadcast(1));
        assert_eq!(h.state.lock().counts(), (1, 0));
        assert!(h.store.stored().is_empty());

        h.store.set_fail_commits(false);
        h.engine.handle(message(&a, "second")).await;
        let stored = h.store.stored();
        assert_eq!(stored.comments.len(), 2);
        assert_eq!(stored.comments[0].content, "first");
    }

    #[tokio::test]
    async fn spawned_engine_preserves_order() {
        let h = harness(BroadcastPolicy::EchoToSender);
        let (a, mut rx) = h.registry.register();
        let Harness { engine, .. } = h;
        let (tx, handle) = engine.spawn(16);

        tx.send(Command::Join(a.clone())).await.unwrap();
        for i in 0..5 {
            tx.send(message(&a, &format!("msg {i}"))).await.unwrap();
        }
        drop(tx);
        handle.await.unwrap();

        assert_eq!(frame(&mut rx)["type"], "init");
        for i in 0..5 {
            assert_eq!(frame(&mut rx)["content"], format!("msg {i}"));
        }
    }
}
