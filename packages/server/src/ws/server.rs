//! The `WsServer` actor.
//!
//! All session state lives in one task. WebSocket handlers and progress
//! timers talk to it by sending [`Command`]s, so sessions are never mutated
//! concurrently and the events of one connection leave in the order they
//! were produced.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use pulseform_models::{FormData, FormDataSavedPayload, InboundMessagePayload, OutboundPayload};
use pulseform_store::RecordStore;
use rand::{Rng as _, SeedableRng as _, rngs::StdRng};
use strum_macros::AsRefStr;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::{
    progress::{ProgressState, ProgressTimer, TickOutcome},
    ws::{ConnId, Msg},
};

#[derive(Debug, Error)]
pub enum WsServerError {
    #[error("WsServer is not running")]
    Stopped,
    #[error("WsServer dropped the response: {0}")]
    Response(#[from] oneshot::error::RecvError),
}

/// A command received by the [`WsServer`].
#[derive(Debug, AsRefStr)]
pub enum Command {
    Connect {
        conn_tx: mpsc::UnboundedSender<Msg>,
        res_tx: oneshot::Sender<ConnId>,
    },

    Disconnect {
        conn: ConnId,
    },

    /// A text frame received from a client.
    Message {
        msg: Msg,
        conn: ConnId,
    },

    /// Posted by a session's progress timer.
    Tick {
        conn: ConnId,
        generation: u64,
    },
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

fn send_payload(sender: &mpsc::UnboundedSender<Msg>, payload: &OutboundPayload) {
    let msg = match serde_json::to_string(payload) {
        Ok(msg) => msg,
        Err(e) => {
            log::error!("Failed to serialize {payload}: {e:?}");
            return;
        }
    };

    // errors if the client disconnected and the handler already exited
    if sender.send(msg).is_err() {
        log::debug!("Dropping {payload}: connection closed");
    }
}

async fn save_form(
    store: &RecordStore,
    connection_id: &str,
    form: FormData,
) -> FormDataSavedPayload {
    match store.submit(connection_id, form).await {
        Ok(outcome) => {
            log::info!(
                "{} form data for connection_id={connection_id}",
                outcome.as_ref()
            );
            FormDataSavedPayload::saved()
        }
        Err(e) => {
            log::error!("Failed to save form data for connection_id={connection_id}: {e:?}");
            FormDataSavedPayload::failed(e.client_message())
        }
    }
}

/// Stores forms for one connection sequentially. The task ends once the
/// returned sender is dropped and the queued forms are handled.
fn spawn_submit_worker(
    store: Arc<RecordStore>,
    connection_id: String,
    sender: mpsc::UnboundedSender<Msg>,
) -> mpsc::UnboundedSender<FormData> {
    let (tx, mut rx) = mpsc::unbounded_channel::<FormData>();

    tokio::spawn(async move {
        while let Some(form) = rx.recv().await {
            let payload = save_form(&store, &connection_id, form).await;
            send_payload(&sender, &OutboundPayload::FormDataSaved(payload));
        }

        log::trace!("Submit queue finished connection_id={connection_id}");
    });

    tx
}

#[derive(Debug)]
struct Session {
    /// Opaque id the store files this connection's record under.
    connection_id: String,
    progress: ProgressState,
    timer: Option<ProgressTimer>,
    sender: mpsc::UnboundedSender<Msg>,
    /// Feeds the task that stores this connection's forms one at a time.
    /// Started on the first submit.
    submits: Option<mpsc::UnboundedSender<FormData>>,
}

impl Session {
    fn send(&self, payload: &OutboundPayload) {
        send_payload(&self.sender, payload);
    }
}

/// Sessions of the currently open connections.
#[derive(Debug, Default)]
struct SessionRegistry {
    sessions: BTreeMap<ConnId, Session>,
}

impl SessionRegistry {
    fn contains(&self, conn: ConnId) -> bool {
        self.sessions.contains_key(&conn)
    }

    fn insert(&mut self, conn: ConnId, session: Session) {
        self.sessions.insert(conn, session);
    }

    /// Removing a session drops its timer, which stops the ticks.
    fn remove(&mut self, conn: ConnId) -> Option<Session> {
        self.sessions.remove(&conn)
    }

    fn get(&self, conn: ConnId) -> Option<&Session> {
        self.sessions.get(&conn)
    }

    fn get_mut(&mut self, conn: ConnId) -> Option<&mut Session> {
        self.sessions.get_mut(&conn)
    }

    fn len(&self) -> usize {
        self.sessions.len()
    }

    fn clear(&mut self) {
        self.sessions.clear();
    }
}

/// Owns every connection's session, progress simulator and form handling.
///
/// Call and spawn [`run`](Self::run) to start processing commands.
#[allow(clippy::module_name_repetitions)]
#[derive(Debug)]
pub struct WsServer {
    sessions: SessionRegistry,
    store: Arc<RecordStore>,
    progress_interval: Duration,
    next_generation: u64,
    rng: StdRng,
    cmd_tx: flume::Sender<Command>,
    cmd_rx: flume::Receiver<Command>,
    token: CancellationToken,
}

impl WsServer {
    #[must_use]
    pub fn new(store: Arc<RecordStore>, progress_interval: Duration) -> (Self, WsServerHandle) {
        let (cmd_tx, cmd_rx) = flume::unbounded();
        let token = CancellationToken::new();
        let handle = WsServerHandle {
            cmd_tx: cmd_tx.clone(),
            token: token.clone(),
        };

        (
            Self {
                sessions: SessionRegistry::default(),
                store,
                progress_interval,
                next_generation: 0,
                rng: StdRng::from_os_rng(),
                cmd_tx,
                cmd_rx,
                token,
            },
            handle,
        )
    }

    /// Register new session and assign unique ID to this session
    fn connect(&mut self, sender: mpsc::UnboundedSender<Msg>) -> ConnId {
        let conn = loop {
            let id = self.rng.random::<u64>();
            if !self.sessions.contains(id) {
                break id;
            }
        };
        let connection_id = uuid::Uuid::new_v4().to_string();

        log::debug!("Connected conn={conn} connection_id={connection_id}");

        self.sessions.insert(
            conn,
            Session {
                connection_id,
                progress: ProgressState::default(),
                timer: None,
                sender,
                submits: None,
            },
        );

        log::debug!("Active connections: {}", self.sessions.len());

        self.start_progress(conn);

        conn
    }

    fn disconnect(&mut self, conn: ConnId) {
        if let Some(session) = self.sessions.remove(conn) {
            log::debug!(
                "Disconnected conn={conn} connection_id={}",
                session.connection_id
            );
            log::debug!("Active connections: {}", self.sessions.len());
        } else {
            log::trace!("Disconnect for unknown conn={conn}");
        }
    }

    /// Replaces the session's timer with a fresh one. The old timer is
    /// stopped before the new one starts.
    fn start_progress(&mut self, conn: ConnId) {
        let Some(session) = self.sessions.get_mut(conn) else {
            return;
        };

        session.timer = None;

        self.next_generation += 1;
        let generation = self.next_generation;
        let cmd_tx = self.cmd_tx.clone();

        session.timer = Some(ProgressTimer::start(
            generation,
            self.progress_interval,
            move || cmd_tx.send(Command::Tick { conn, generation }).is_ok(),
        ));

        log::trace!("Started progress timer conn={conn} generation={generation}");
    }

    fn on_tick(&mut self, conn: ConnId, generation: u64) {
        let Some(session) = self.sessions.get_mut(conn) else {
            log::trace!("Tick for closed conn={conn}");
            return;
        };

        if session.timer.as_ref().map(ProgressTimer::generation) != Some(generation) {
            log::trace!("Ignoring stale tick conn={conn} generation={generation}");
            return;
        }

        match session.progress.tick(&mut self.rng) {
            TickOutcome::Progress(progress) => {
                log::trace!("conn={conn} progress={progress}");
                session.send(&OutboundPayload::upload_progress(progress));
            }
            TickOutcome::Complete => {
                session.timer = None;
                log::debug!("Upload complete conn={conn}");
                session.send(&OutboundPayload::upload_complete());
            }
        }
    }

    fn reset_progress(&mut self, conn: ConnId) {
        let Some(session) = self.sessions.get_mut(conn) else {
            return;
        };

        session.progress.reset();
        session.send(&OutboundPayload::upload_progress(0));

        self.start_progress(conn);
    }

    /// Queues the form on the connection's submit task, which stores forms
    /// in the order they arrived and acknowledges each one straight to the
    /// connection.
    fn submit_form_data(&mut self, conn: ConnId, form: FormData) {
        let Some(session) = self.sessions.get_mut(conn) else {
            return;
        };

        if session.submits.is_none() {
            session.submits = Some(spawn_submit_worker(
                self.store.clone(),
                session.connection_id.clone(),
                session.sender.clone(),
            ));
        }

        if let Some(submits) = &session.submits
            && submits.send(form).is_err()
        {
            log::error!("Submit queue closed for conn={conn}");
        }
    }

    fn on_message(&mut self, conn: ConnId, msg: &str) {
        if !self.sessions.contains(conn) {
            log::debug!("Message for closed conn={conn}");
            return;
        }

        let payload = match msg.parse::<InboundMessagePayload>() {
            Ok(payload) => payload,
            Err(e) => {
                pulseform_logging::debug_or_trace!(
                    ("Dropping message from conn={conn}: {e}"),
                    ("Dropping message from conn={conn}: {e} ({msg:?})")
                );
                return;
            }
        };

        log::debug!("Received {payload} from conn={conn}");

        match payload {
            InboundMessagePayload::ResetProgress => self.reset_progress(conn),
            InboundMessagePayload::SubmitFormData(form) => self.submit_form_data(conn, form),
        }
    }

    fn process_command(&mut self, cmd: Command) {
        if log::log_enabled!(log::Level::Trace) {
            log::trace!("process_command: cmd={cmd:?}");
        }

        match cmd {
            Command::Connect { conn_tx, res_tx } => {
                let conn = self.connect(conn_tx);
                if res_tx.send(conn).is_err() {
                    log::debug!("Connect response dropped, closing conn={conn}");
                    self.disconnect(conn);
                }
            }
            Command::Disconnect { conn } => self.disconnect(conn),
            Command::Message { msg, conn } => self.on_message(conn, &msg),
            Command::Tick { conn, generation } => self.on_tick(conn, generation),
        }
    }

    pub async fn run(mut self) {
        let token = self.token.clone();
        let cmd_rx = self.cmd_rx.clone();

        while let Ok(cmd) = tokio::select!(
            () = token.cancelled() => {
                log::debug!("WsServer was cancelled");
                Err(flume::RecvError::Disconnected)
            }
            cmd = cmd_rx.recv_async() => cmd
        ) {
            self.process_command(cmd);
        }

        self.sessions.clear();

        log::debug!("Stopped WsServer");
    }
}

/// Handle and command sender for ws server.
#[derive(Debug, Clone)]
pub struct WsServerHandle {
    cmd_tx: flume::Sender<Command>,
    token: CancellationToken,
}

impl WsServerHandle {
    async fn send_command(&self, cmd: Command) -> Result<(), WsServerError> {
        log::trace!("Sending {cmd} command");

        self.cmd_tx
            .send_async(cmd)
            .await
            .map_err(|_| WsServerError::Stopped)
    }

    /// Register client message sender and obtain connection ID.
    ///
    /// # Errors
    ///
    /// * If the `WsServer` is no longer running
    pub async fn connect(
        &self,
        conn_tx: mpsc::UnboundedSender<Msg>,
    ) -> Result<ConnId, WsServerError> {
        let (res_tx, res_rx) = oneshot::channel();

        self.send_command(Command::Connect { conn_tx, res_tx }).await?;

        Ok(res_rx.await?)
    }

    /// Forwards a text frame received from `conn`.
    ///
    /// # Errors
    ///
    /// * If the `WsServer` is no longer running
    pub async fn send_message(
        &self,
        conn: ConnId,
        msg: impl Into<String> + Send,
    ) -> Result<(), WsServerError> {
        self.send_command(Command::Message {
            msg: msg.into(),
            conn,
        })
        .await
    }

    /// Removes the session of `conn` and stops its timer. Unknown connections
    /// are ignored.
    ///
    /// # Errors
    ///
    /// * If the `WsServer` is no longer running
    pub async fn disconnect(&self, conn: ConnId) -> Result<(), WsServerError> {
        self.send_command(Command::Disconnect { conn }).await
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use pulseform_models::{
        FORM_SAVED_MESSAGE, FORM_WRITE_ERROR_MESSAGE, UPLOAD_COMPLETE_MESSAGE,
        UploadCompletePayload, UploadProgressPayload,
    };
    use tokio::task::JoinHandle;

    use super::*;

    const INTERVAL: Duration = Duration::from_secs(1);

    struct TestServer {
        handle: WsServerHandle,
        join: JoinHandle<()>,
        store: Arc<RecordStore>,
        _dir: tempfile::TempDir,
    }

    impl TestServer {
        fn start() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store = Arc::new(RecordStore::in_dir(dir.path()));
            Self::with_store(store, dir)
        }

        fn with_store(store: Arc<RecordStore>, dir: tempfile::TempDir) -> Self {
            let (server, handle) = WsServer::new(store.clone(), INTERVAL);
            let join = tokio::spawn(server.run());
            Self {
                handle,
                join,
                store,
                _dir: dir,
            }
        }

        async fn connect(&self) -> (ConnId, mpsc::UnboundedReceiver<Msg>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let conn = self.handle.connect(tx).await.unwrap();
            (conn, rx)
        }
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Msg>) -> OutboundPayload {
        let msg = rx.recv().await.expect("connection closed");
        serde_json::from_str(&msg).unwrap()
    }

    async fn recv_progress(rx: &mut mpsc::UnboundedReceiver<Msg>) -> u8 {
        match recv(rx).await {
            OutboundPayload::UploadProgress(UploadProgressPayload { progress }) => progress,
            other => panic!("expected uploadProgress, got {other:?}"),
        }
    }

    async fn recv_form_saved(rx: &mut mpsc::UnboundedReceiver<Msg>) -> FormDataSavedPayload {
        loop {
            if let OutboundPayload::FormDataSaved(payload) = recv(rx).await {
                return payload;
            }
        }
    }

    fn submit(message: &str) -> String {
        InboundMessagePayload::SubmitFormData(FormData::new(message))
            .to_message_string()
            .unwrap()
    }

    fn reset() -> String {
        InboundMessagePayload::ResetProgress
            .to_message_string()
            .unwrap()
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn first_progress_arrives_after_one_interval() {
        let server = TestServer::start();
        let (_conn, mut rx) = server.connect().await;

        let early = tokio::time::timeout(INTERVAL - Duration::from_millis(1), rx.recv()).await;
        assert!(early.is_err());

        let progress = recv_progress(&mut rx).await;
        assert!((1..=10).contains(&progress));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn progress_saturates_then_completes_exactly_once() {
        let server = TestServer::start();
        let (_conn, mut rx) = server.connect().await;

        let mut last = 0;
        let complete = loop {
            match recv(&mut rx).await {
                OutboundPayload::UploadProgress(UploadProgressPayload { progress }) => {
                    assert!(progress >= last);
                    assert!(progress <= 100);
                    last = progress;
                }
                OutboundPayload::UploadComplete(payload) => break payload,
                other => panic!("unexpected {other:?}"),
            }
        };

        assert_eq!(last, 100);
        assert_eq!(
            complete,
            UploadCompletePayload {
                message: UPLOAD_COMPLETE_MESSAGE.to_string()
            }
        );

        let after = tokio::time::timeout(INTERVAL * 10, rx.recv()).await;
        assert!(after.is_err());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn reset_reports_zero_immediately_and_restarts() {
        let server = TestServer::start();
        let (conn, mut rx) = server.connect().await;
        recv_progress(&mut rx).await;
        recv_progress(&mut rx).await;

        server.handle.send_message(conn, reset()).await.unwrap();

        assert_eq!(recv_progress(&mut rx).await, 0);
        let restarted = recv_progress(&mut rx).await;
        assert!((1..=10).contains(&restarted));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn reset_after_completion_restarts_progress() {
        let server = TestServer::start();
        let (conn, mut rx) = server.connect().await;
        while !matches!(recv(&mut rx).await, OutboundPayload::UploadComplete(_)) {}

        server.handle.send_message(conn, reset()).await.unwrap();

        assert_eq!(recv_progress(&mut rx).await, 0);
        assert!((1..=10).contains(&recv_progress(&mut rx).await));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn repeated_resets_keep_a_single_timer() {
        let server = TestServer::start();
        let (conn, mut rx) = server.connect().await;

        for _ in 0..5 {
            server.handle.send_message(conn, reset()).await.unwrap();
        }
        for _ in 0..5 {
            assert_eq!(recv_progress(&mut rx).await, 0);
        }

        let early = tokio::time::timeout(INTERVAL - Duration::from_millis(1), rx.recv()).await;
        assert!(early.is_err());
        recv_progress(&mut rx).await;
        let gap = tokio::time::timeout(INTERVAL - Duration::from_millis(1), rx.recv()).await;
        assert!(gap.is_err());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn malformed_and_unknown_messages_are_dropped() {
        let server = TestServer::start();
        let (conn, mut rx) = server.connect().await;

        server.handle.send_message(conn, "not json").await.unwrap();
        server
            .handle
            .send_message(conn, r#"{"type":"launchRocket"}"#)
            .await
            .unwrap();
        server.handle.send_message(conn, reset()).await.unwrap();

        assert_eq!(recv_progress(&mut rx).await, 0);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn submit_saves_record_and_acknowledges() {
        let server = TestServer::start();
        let (conn, mut rx) = server.connect().await;

        server.handle.send_message(conn, submit("hello")).await.unwrap();

        let saved = recv_form_saved(&mut rx).await;
        assert_eq!(
            saved,
            FormDataSavedPayload {
                success: true,
                message: FORM_SAVED_MESSAGE.to_string(),
            }
        );

        let records = server.store.read_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "hello");
        assert!(!records[0].connection_id.is_empty());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn resubmitting_updates_the_same_record() {
        let server = TestServer::start();
        let (conn, mut rx) = server.connect().await;

        server.handle.send_message(conn, submit("first")).await.unwrap();
        recv_form_saved(&mut rx).await;
        server.handle.send_message(conn, submit("second")).await.unwrap();
        recv_form_saved(&mut rx).await;

        let records = server.store.read_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "second");
    }

    #[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 8))]
    async fn back_to_back_submits_are_stored_in_order() {
        let server = TestServer::start();
        let (conn, mut rx) = server.connect().await;

        for i in 0..20 {
            server
                .handle
                .send_message(conn, submit(&i.to_string()))
                .await
                .unwrap();
        }
        for _ in 0..20 {
            assert!(recv_form_saved(&mut rx).await.success);
        }

        let records = server.store.read_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "19");
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn submit_without_payload_stores_empty_message() {
        let server = TestServer::start();
        let (conn, mut rx) = server.connect().await;

        server
            .handle
            .send_message(conn, r#"{"type":"submitFormData"}"#)
            .await
            .unwrap();

        assert!(recv_form_saved(&mut rx).await.success);
        assert_eq!(server.store.read_all().await.unwrap()[0].message, "");
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn connections_are_stored_under_distinct_ids() {
        let server = TestServer::start();
        let (conn_a, mut rx_a) = server.connect().await;
        let (conn_b, mut rx_b) = server.connect().await;

        assert_ne!(conn_a, conn_b);

        server.handle.send_message(conn_a, submit("a")).await.unwrap();
        recv_form_saved(&mut rx_a).await;
        server.handle.send_message(conn_b, submit("b")).await.unwrap();
        recv_form_saved(&mut rx_b).await;

        let records = server.store.read_all().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_ne!(records[0].connection_id, records[1].connection_id);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn store_failure_is_reported_to_the_client() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RecordStore::in_dir(dir.path().join("missing")));
        let server = TestServer::with_store(store, dir);
        let (conn, mut rx) = server.connect().await;

        server.handle.send_message(conn, submit("hello")).await.unwrap();

        assert_eq!(
            recv_form_saved(&mut rx).await,
            FormDataSavedPayload::failed(FORM_WRITE_ERROR_MESSAGE)
        );
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn disconnect_stops_progress_and_is_idempotent() {
        let server = TestServer::start();
        let (conn, mut rx) = server.connect().await;

        server.handle.disconnect(conn).await.unwrap();
        server.handle.disconnect(conn).await.unwrap();

        assert_eq!(rx.recv().await, None);

        let (_other, mut other_rx) = server.connect().await;
        assert!((1..=10).contains(&recv_progress(&mut other_rx).await));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn messages_for_unknown_connections_are_ignored() {
        let server = TestServer::start();
        let (conn, mut rx) = server.connect().await;

        server.handle.send_message(conn.wrapping_add(1), reset()).await.unwrap();
        server.handle.send_message(conn, reset()).await.unwrap();

        assert_eq!(recv_progress(&mut rx).await, 0);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn shutdown_stops_the_server() {
        let server = TestServer::start();
        let (_conn, mut rx) = server.connect().await;

        server.handle.shutdown();
        server.join.await.unwrap();

        assert_eq!(rx.recv().await, None);
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(server.handle.connect(tx).await.is_err());
    }
}
