//! Client synchronization state machine.
//!
//! A client owns one connection and folds the ordered entry stream into its
//! application state through a pure reducer:
//!
//! ```text
//! connecting ──open──► connected(initial, 0)
//!     │                    │── entry i == expected ──► connected(apply(s, u), i+1)
//!     │                    │── entry i != expected ──► sync-error (socket closed)
//!     │                    │── undecodable payload ──► sync-error (socket closed)
//!     └──transport error──►┴── transport error ──────► connection-error
//! ```
//!
//! `connection-error` and `sync-error` are terminal: a fresh client (and a
//! fresh connection) is required to resume. All transitions happen in
//! [`StateMachine`], which is independent of the transport so tests can feed
//! it entries directly; the observer callback runs only after a transition
//! has completed.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ClientMessage, LogEntry};

/// Observable client state.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientState<S> {
    /// Connection handshake in progress.
    Connecting,
    /// Synchronized up to (but not including) `next_index`.
    Connected { app_state: S, next_index: u64 },
    /// The transport failed or closed. Terminal.
    ConnectionError,
    /// The entry stream desynchronized from the expected sequence. Terminal.
    SyncError,
}

impl<S> ClientState<S> {
    /// True for the two terminal states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ConnectionError | Self::SyncError)
    }
}

/// What [`StateMachine::handle_entry`] did with an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOutcome {
    /// The entry matched the expected index and was folded into the state.
    Applied,
    /// The entry desynchronized the client; the connection must be closed.
    Desync,
    /// The machine was not in a state that consumes entries.
    Ignored,
}

/// Reducer folding one update into the application state.
pub type Reducer<S, U> = Box<dyn Fn(S, U) -> S + Send>;

/// Observer invoked after every completed state transition.
pub type ChangeObserver<S> = Box<dyn FnMut(&ClientState<S>) + Send>;

/// The transition core: owns the current state, the reducer, and the
/// expected-next-index counter. One event entry point per event kind; the
/// observer fires after the transition, never during.
pub struct StateMachine<S, U> {
    state: ClientState<S>,
    initial_state: Option<S>,
    apply: Reducer<S, U>,
    on_change: ChangeObserver<S>,
    closed: bool,
}

impl<S, U> StateMachine<S, U>
where
    U: DeserializeOwned,
{
    /// Create a machine in `Connecting`.
    pub fn new(initial_state: S, apply: Reducer<S, U>, on_change: ChangeObserver<S>) -> Self {
        Self {
            state: ClientState::Connecting,
            initial_state: Some(initial_state),
            apply,
            on_change,
            closed: false,
        }
    }

    /// Current state.
    pub fn state(&self) -> &ClientState<S> {
        &self.state
    }

    /// True while entries can be consumed and updates submitted.
    pub fn is_connected(&self) -> bool {
        matches!(self.state, ClientState::Connected { .. })
    }

    /// The connection handshake completed.
    pub fn handle_open(&mut self) {
        if self.closed || !matches!(self.state, ClientState::Connecting) {
            return;
        }
        let Some(initial) = self.initial_state.take() else {
            return;
        };
        self.state = ClientState::Connected {
            app_state: initial,
            next_index: 0,
        };
        self.notify();
    }

    /// One inbound entry arrived.
    ///
    /// An index other than the expected one — lower (duplicate) or higher
    /// (gap) — is unrecoverable desynchronization, as is a payload that does
    /// not decode as an update. The desynchronizing entry is never applied.
    pub fn handle_entry(&mut self, entry: LogEntry) -> EntryOutcome {
        if self.closed {
            return EntryOutcome::Ignored;
        }

        let current = std::mem::replace(&mut self.state, ClientState::Connecting);
        match current {
            ClientState::Connected {
                app_state,
                next_index,
            } => {
                if entry.index != next_index {
                    log::warn!("expected entry {next_index}, received {}", entry.index);
                    self.state = ClientState::SyncError;
                    self.notify();
                    return EntryOutcome::Desync;
                }

                match serde_json::from_value::<U>(entry.payload) {
                    Ok(update) => {
                        let next_state = (self.apply)(app_state, update);
                        self.state = ClientState::Connected {
                            app_state: next_state,
                            next_index: next_index + 1,
                        };
                        self.notify();
                        EntryOutcome::Applied
                    }
                    Err(e) => {
                        log::warn!("undecodable payload at entry {}: {e}", entry.index);
                        self.state = ClientState::SyncError;
                        self.notify();
                        EntryOutcome::Desync
                    }
                }
            }
            other => {
                self.state = other;
                EntryOutcome::Ignored
            }
        }
    }

    /// An inbound frame was not a log entry at all.
    pub fn handle_decode_failure(&mut self, detail: &str) -> EntryOutcome {
        if self.closed || !self.is_connected() {
            return EntryOutcome::Ignored;
        }
        log::warn!("undecodable frame: {detail}");
        self.state = ClientState::SyncError;
        self.notify();
        EntryOutcome::Desync
    }

    /// The transport errored or closed. No-op once terminal.
    pub fn handle_transport_error(&mut self) {
        if self.closed || self.state.is_terminal() {
            return;
        }
        self.state = ClientState::ConnectionError;
        self.notify();
    }

    /// Stop the machine: no further transitions or observer callbacks.
    pub fn shutdown(&mut self) {
        self.closed = true;
    }

    fn notify(&mut self) {
        if !self.closed {
            (self.on_change)(&self.state);
        }
    }
}

/// Everything needed to start a client.
pub struct ConnectOptions<S, U> {
    /// WebSocket URI, e.g. `ws://127.0.0.1:8080/ws`
    pub uri: String,
    /// State before any entry has been applied
    pub initial_state: S,
    /// Pure reducer folding updates into state
    pub apply: Reducer<S, U>,
    /// Invoked after every state change
    pub on_change: ChangeObserver<S>,
}

/// Handle to a running client. Owns the connection it created.
pub struct SyncClient<S, U> {
    machine: Arc<Mutex<StateMachine<S, U>>>,
    outgoing: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
}

/// Start a client: the machine begins in `Connecting` and the connection is
/// dialed in the background. Must be called from within a tokio runtime.
pub fn connect<S, U>(options: ConnectOptions<S, U>) -> SyncClient<S, U>
where
    S: Send + 'static,
    U: Serialize + DeserializeOwned + Send + 'static,
{
    let ConnectOptions {
        uri,
        initial_state,
        apply,
        on_change,
    } = options;

    let machine = Arc::new(Mutex::new(StateMachine::new(initial_state, apply, on_change)));
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Message>();

    let reader = tokio::spawn(run_connection(
        uri,
        Arc::clone(&machine),
        out_rx,
        out_tx.clone(),
    ));

    SyncClient {
        machine,
        outgoing: out_tx,
        reader,
    }
}

impl<S, U> SyncClient<S, U>
where
    U: Serialize + DeserializeOwned,
{
    /// Submit an update. Fire-and-forget: the update comes back as a normal
    /// broadcast entry and is applied through the same reducer path as on
    /// every other client.
    pub fn submit(&self, update: &U) -> Result<(), ClientError> {
        if !lock(&self.machine).is_connected() {
            return Err(ClientError::NotConnected);
        }

        let payload = serde_json::to_value(update)
            .map_err(|e| ClientError::Serialization(e.to_string()))?;
        let frame = ClientMessage::update(payload)
            .encode()
            .map_err(|e| ClientError::Serialization(e.to_string()))?;

        self.outgoing
            .send(Message::text(frame))
            .map_err(|_| ClientError::NotConnected)
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> ClientState<S>
    where
        S: Clone,
    {
        lock(&self.machine).state().clone()
    }

    /// Release the connection. Observer callbacks stop before this returns.
    pub fn close(&self) {
        lock(&self.machine).shutdown();
        let _ = self.outgoing.send(Message::Close(None));
        self.reader.abort();
    }
}

/// Dial the server and pump the connection until it ends.
async fn run_connection<S, U>(
    uri: String,
    machine: Arc<Mutex<StateMachine<S, U>>>,
    mut out_rx: mpsc::UnboundedReceiver<Message>,
    out_tx: mpsc::UnboundedSender<Message>,
) where
    S: Send + 'static,
    U: DeserializeOwned + Send + 'static,
{
    let ws_stream = match tokio_tungstenite::connect_async(uri.as_str()).await {
        Ok((ws_stream, _)) => ws_stream,
        Err(e) => {
            log::warn!("connect to {uri} failed: {e}");
            lock(&machine).handle_transport_error();
            return;
        }
    };

    let (mut ws_sender, mut ws_reader) = ws_stream.split();

    // Writer task: drain the outgoing queue into the socket. Ends after a
    // close frame or a write failure.
    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let closing = matches!(frame, Message::Close(_));
            if ws_sender.send(frame).await.is_err() || closing {
                break;
            }
        }
    });

    lock(&machine).handle_open();

    // Strictly sequential: each frame is fully processed — reducer applied,
    // observer notified — before the next is read.
    while let Some(frame) = ws_reader.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                let outcome = {
                    let mut machine = lock(&machine);
                    match LogEntry::decode(text.as_str()) {
                        Ok(entry) => machine.handle_entry(entry),
                        Err(e) => machine.handle_decode_failure(&e.to_string()),
                    }
                };
                if outcome == EntryOutcome::Desync {
                    // Desynchronization is locally unrecoverable; actively
                    // release the connection.
                    let _ = out_tx.send(Message::Close(None));
                    return;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                log::warn!("websocket error: {e}");
                break;
            }
        }
    }

    lock(&machine).handle_transport_error();
}

fn lock<S, U>(machine: &Arc<Mutex<StateMachine<S, U>>>) -> MutexGuard<'_, StateMachine<S, U>> {
    machine.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Client errors.
#[derive(Debug, Clone)]
pub enum ClientError {
    /// The client is not in the `Connected` state.
    NotConnected,
    /// The update could not be serialized.
    Serialization(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConnected => write!(f, "client is not connected"),
            Self::Serialization(e) => write!(f, "update serialization error: {e}"),
        }
    }
}

impl std::error::Error for ClientError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", rename_all = "lowercase")]
    enum CounterUpdate {
        Increment,
        Decrement,
    }

    type States = Arc<Mutex<Vec<ClientState<i64>>>>;

    fn machine(states: &States) -> StateMachine<i64, CounterUpdate> {
        let states = Arc::clone(states);
        StateMachine::new(
            0,
            Box::new(|state, update| match update {
                CounterUpdate::Increment => state + 1,
                CounterUpdate::Decrement => state - 1,
            }),
            Box::new(move |state| {
                states.lock().unwrap().push(state.clone());
            }),
        )
    }

    fn entry(index: u64, update: &str) -> LogEntry {
        LogEntry::new(index, json!({"type": update}))
    }

    #[test]
    fn test_open_transitions_to_connected_at_index_zero() {
        let states: States = Arc::default();
        let mut m = machine(&states);
        assert_eq!(*m.state(), ClientState::Connecting);

        m.handle_open();
        assert_eq!(
            *m.state(),
            ClientState::Connected {
                app_state: 0,
                next_index: 0
            }
        );
        assert_eq!(states.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_entries_fold_through_the_reducer() {
        let states: States = Arc::default();
        let mut m = machine(&states);
        m.handle_open();

        assert_eq!(m.handle_entry(entry(0, "increment")), EntryOutcome::Applied);
        assert_eq!(m.handle_entry(entry(1, "increment")), EntryOutcome::Applied);
        assert_eq!(m.handle_entry(entry(2, "decrement")), EntryOutcome::Applied);

        assert_eq!(
            *m.state(),
            ClientState::Connected {
                app_state: 1,
                next_index: 3
            }
        );
    }

    #[test]
    fn test_index_gap_is_sync_error_and_skipped_entry_never_applied() {
        let states: States = Arc::default();
        let mut m = machine(&states);
        m.handle_open();

        assert_eq!(m.handle_entry(entry(0, "increment")), EntryOutcome::Applied);
        // Index 1 skipped.
        assert_eq!(m.handle_entry(entry(2, "increment")), EntryOutcome::Desync);
        assert_eq!(*m.state(), ClientState::SyncError);

        // Only the entry at index 0 was applied.
        let observed = states.lock().unwrap();
        assert!(observed.contains(&ClientState::Connected {
            app_state: 1,
            next_index: 1
        }));
        assert!(!observed.iter().any(|s| matches!(
            s,
            ClientState::Connected { app_state: 2, .. }
        )));
    }

    #[test]
    fn test_duplicate_index_is_sync_error() {
        let states: States = Arc::default();
        let mut m = machine(&states);
        m.handle_open();

        m.handle_entry(entry(0, "increment"));
        assert_eq!(m.handle_entry(entry(0, "increment")), EntryOutcome::Desync);
        assert_eq!(*m.state(), ClientState::SyncError);
    }

    #[test]
    fn test_undecodable_payload_is_sync_error() {
        let states: States = Arc::default();
        let mut m = machine(&states);
        m.handle_open();

        let bad = LogEntry::new(0, json!({"type": "reset"}));
        assert_eq!(m.handle_entry(bad), EntryOutcome::Desync);
        assert_eq!(*m.state(), ClientState::SyncError);
    }

    #[test]
    fn test_undecodable_frame_is_sync_error() {
        let states: States = Arc::default();
        let mut m = machine(&states);
        m.handle_open();

        assert_eq!(m.handle_decode_failure("not json"), EntryOutcome::Desync);
        assert_eq!(*m.state(), ClientState::SyncError);
    }

    #[test]
    fn test_entries_before_open_are_ignored() {
        let states: States = Arc::default();
        let mut m = machine(&states);

        assert_eq!(m.handle_entry(entry(0, "increment")), EntryOutcome::Ignored);
        assert_eq!(*m.state(), ClientState::Connecting);
        assert!(states.lock().unwrap().is_empty());
    }

    #[test]
    fn test_transport_error_while_connecting() {
        let states: States = Arc::default();
        let mut m = machine(&states);

        m.handle_transport_error();
        assert_eq!(*m.state(), ClientState::ConnectionError);
    }

    #[test]
    fn test_transport_error_while_connected() {
        let states: States = Arc::default();
        let mut m = machine(&states);
        m.handle_open();

        m.handle_transport_error();
        assert_eq!(*m.state(), ClientState::ConnectionError);
    }

    #[test]
    fn test_terminal_states_absorb_all_events() {
        let states: States = Arc::default();
        let mut m = machine(&states);
        m.handle_open();
        m.handle_entry(entry(5, "increment")); // -> SyncError

        let changes_so_far = states.lock().unwrap().len();

        // The close that follows a sync error must not overwrite it.
        m.handle_transport_error();
        assert_eq!(*m.state(), ClientState::SyncError);
        assert_eq!(m.handle_entry(entry(0, "increment")), EntryOutcome::Ignored);
        m.handle_open();
        assert_eq!(*m.state(), ClientState::SyncError);
        assert_eq!(states.lock().unwrap().len(), changes_so_far);
    }

    #[test]
    fn test_shutdown_stops_observer_callbacks() {
        let states: States = Arc::default();
        let mut m = machine(&states);
        m.handle_open();

        m.shutdown();
        m.handle_entry(entry(0, "increment"));
        m.handle_transport_error();

        assert_eq!(states.lock().unwrap().len(), 1); // only the open
    }

    #[test]
    fn test_observer_sees_completed_transitions_in_order() {
        let states: States = Arc::default();
        let mut m = machine(&states);
        m.handle_open();
        m.handle_entry(entry(0, "increment"));
        m.handle_entry(entry(1, "decrement"));

        let observed = states.lock().unwrap();
        assert_eq!(
            *observed,
            vec![
                ClientState::Connected {
                    app_state: 0,
                    next_index: 0
                },
                ClientState::Connected {
                    app_state: 1,
                    next_index: 1
                },
                ClientState::Connected {
                    app_state: 0,
                    next_index: 2
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_connect_failure_reports_connection_error() {
        let states: States = Arc::default();
        let observer = Arc::clone(&states);
        let client: SyncClient<i64, CounterUpdate> = connect(ConnectOptions {
            uri: "ws://127.0.0.1:1/ws".to_string(), // nothing listens here
            initial_state: 0,
            apply: Box::new(|state, _| state),
            on_change: Box::new(move |state| {
                observer.lock().unwrap().push(state.clone());
            }),
        });

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                if client.state() == ClientState::ConnectionError {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("client should reach connection-error");

        assert!(client.submit(&CounterUpdate::Increment).is_err());
    }

    #[tokio::test]
    async fn test_submit_before_connected_is_rejected() {
        let client: SyncClient<i64, CounterUpdate> = connect(ConnectOptions {
            uri: "ws://127.0.0.1:1/ws".to_string(),
            initial_state: 0,
            apply: Box::new(|state, _| state),
            on_change: Box::new(|_| {}),
        });

        // Still connecting (or already failed): either way, not connected.
        assert!(matches!(
            client.submit(&CounterUpdate::Increment),
            Err(ClientError::NotConnected)
        ));
        client.close();
    }
}
