//! Connection establishment, the protocol state machine, and the public
//! query API.
//!
//! A [`Connection`] is a cheap handle. The protocol itself runs on a
//! driver task spawned at connect time: the task owns the framed stream
//! and serializes every state transition, so server messages for one
//! connection are always processed in wire order. The handle talks to
//! the driver over a command channel and receives each query's outcome
//! through a oneshot.
//!
//! At most one query is in flight per connection. The pending-query slot
//! is a single compare-and-set claimed by the handle before a command is
//! sent and released by the driver when the query completes; a failed
//! claim is a caller error, never a retry condition.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::Framed;

use crate::auth;
use crate::codec::MySqlCodec;
use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::messages::backend::{
    AuthSwitchRequest, Handshake, ServerMessage, ServerVersion, StmtPrepareOk, status,
};
use crate::messages::frontend::{self, ClientMessage};
use crate::resultset::{QueryResult, ResultSetAccumulator};
use crate::types::{self, Value};

/// Process-wide instance counter; every connection gets a strictly
/// increasing count embedded in its diagnostic id.
static CONNECTION_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Primary states of the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    AwaitingHandshake = 2,
    AwaitingHandshakeResult = 3,
    Ready = 4,
    Querying = 5,
    Closed = 6,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Disconnected,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::AwaitingHandshake,
            3 => ConnectionState::AwaitingHandshakeResult,
            4 => ConnectionState::Ready,
            5 => ConnectionState::Querying,
            _ => ConnectionState::Closed,
        }
    }
}

/// The single-place pending-query register.
///
/// `claim` is the only cross-task mutation on the hot path; everything
/// else the handle reads is published snapshots.
#[derive(Debug, Default)]
struct QuerySlot {
    claimed: AtomicBool,
}

impl QuerySlot {
    /// Claims the slot. On failure the boolean reports whether the slot
    /// was observed empty but lost the compare-and-set race.
    fn claim(&self) -> std::result::Result<(), bool> {
        if self.claimed.load(Ordering::Acquire) {
            return Err(false);
        }
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| true)
    }

    fn release(&self) {
        self.claimed.store(false, Ordering::Release);
    }

    fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }
}

/// State shared between the handle and the driver task.
#[derive(Debug)]
struct Shared {
    id: String,
    count: usize,
    state: AtomicU8,
    connected: AtomicBool,
    timed_out: AtomicBool,
    status_flags: AtomicU16,
    slot: QuerySlot,
    version: OnceLock<ServerVersion>,
    last_error: Mutex<Option<Error>>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn record_error(&self, error: Error) {
        let mut slot = self.last_error.lock().expect("last_error lock");
        *slot = Some(error);
    }
}

type QueryReply = oneshot::Sender<Result<QueryResult>>;

enum Command {
    Query { sql: String, reply: QueryReply },
    PreparedStatement {
        sql: String,
        values: Vec<Value>,
        reply: QueryReply,
    },
    Ping { reply: QueryReply },
    Close { reply: oneshot::Sender<()> },
}

/// One-shot deadline for the pending query.
#[derive(Debug, Default)]
struct QueryDeadline {
    sleep: Option<Pin<Box<tokio::time::Sleep>>>,
}

impl QueryDeadline {
    fn arm(&mut self, timeout: Duration) {
        self.sleep = Some(Box::pin(tokio::time::sleep(timeout)));
    }

    fn disarm(&mut self) {
        self.sleep = None;
    }

    fn is_armed(&self) -> bool {
        self.sleep.is_some()
    }

    async fn fired(&mut self) {
        match self.sleep.as_mut() {
            Some(sleep) => sleep.as_mut().await,
            None => std::future::pending().await,
        }
    }
}

/// Metadata collection in progress after a prepare command.
///
/// The execute command must not be sent before the codec has consumed
/// the trailing EOF of the prepare metadata, so completion is driven by
/// the EOF markers rather than by the column counts alone. The
/// definitions themselves are not kept: the execute response carries its
/// own column metadata for the accumulator.
struct PrepareCollect {
    sql: String,
    values: Vec<Value>,
    statement_id: u32,
    params_done: bool,
    columns_done: bool,
}

impl PrepareCollect {
    fn is_complete(&self) -> bool {
        self.params_done && self.columns_done
    }

    fn on_eof(&mut self) {
        if !self.params_done {
            self.params_done = true;
        } else {
            self.columns_done = true;
        }
    }
}

/// Which flavor of response the pending query expects.
enum QueryPhase {
    Idle,
    Text,
    Preparing(Box<PrepareCollect>),
    Executing { sql: String },
}

/// An asynchronous connection to a MySQL server.
///
/// Handles are cheap to clone and share the underlying connection; at
/// most one query can be in flight across all clones.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    closed_rx: watch::Receiver<bool>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Opens a TCP connection and drives the handshake to completion.
    ///
    /// Fails with [`Error::UnknownCharset`] before any I/O when the
    /// configured charset does not resolve, with [`Error::Protocol`]
    /// when the server rejects authentication, and with [`Error::Io`]
    /// on transport failures.
    pub async fn connect(config: ConnectionConfig) -> Result<Connection> {
        let charset_id = config.charset_id()?;

        let count = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
        let shared = Arc::new(Shared {
            id: format!("mysql-connection-{count}"),
            count,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            connected: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
            status_flags: AtomicU16::new(0),
            slot: QuerySlot::default(),
            version: OnceLock::new(),
            last_error: Mutex::new(None),
        });

        let stream = TcpStream::connect((config.host.clone(), config.port)).await?;
        stream.set_nodelay(true).ok();

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (connect_tx, connect_rx) = oneshot::channel();
        let (closed_tx, closed_rx) = watch::channel(false);

        shared.set_state(ConnectionState::AwaitingHandshake);
        let driver = Driver {
            shared: shared.clone(),
            framed: Framed::new(stream, MySqlCodec::new()),
            cmd_rx,
            state: ConnectionState::AwaitingHandshake,
            config,
            charset_id,
            connect_reply: Some(connect_tx),
            pending: None,
            deadline: QueryDeadline::default(),
            accumulator: ResultSetAccumulator::new(),
            phase: QueryPhase::Idle,
            statements: HashMap::new(),
            closed_tx,
            close_replies: Vec::new(),
        };
        tokio::spawn(driver.run());

        let connection = Connection {
            shared,
            cmd_tx,
            closed_rx,
        };
        match connect_rx.await {
            Ok(Ok(())) => Ok(connection),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(connection.teardown_error()),
        }
    }

    /// Sends a text-protocol query and waits for its result.
    pub async fn send_query(&self, sql: impl Into<String>) -> Result<QueryResult> {
        self.ensure_ready()?;
        self.claim_slot()?;
        self.run_command(|reply| Command::Query {
            sql: sql.into(),
            reply,
        })
        .await
    }

    /// Prepares (or reuses) a server-side statement and executes it with
    /// the given values.
    ///
    /// The number of `?` placeholders in `sql` must equal `values.len()`;
    /// the count is a literal byte scan, so question marks inside string
    /// literals count too. Validation happens before any network I/O.
    pub async fn send_prepared_statement(
        &self,
        sql: impl Into<String>,
        values: Vec<Value>,
    ) -> Result<QueryResult> {
        let sql = sql.into();
        let expected = frontend::placeholder_count(&sql);
        if expected != values.len() {
            return Err(Error::InsufficientParameters {
                expected,
                actual: values.len(),
            });
        }
        self.ensure_ready()?;
        self.claim_slot()?;
        self.run_command(|reply| Command::PreparedStatement { sql, values, reply })
            .await
    }

    /// Round-trips a COM_PING as a liveness check.
    pub async fn ping(&self) -> Result<()> {
        self.ensure_ready()?;
        self.claim_slot()?;
        self.run_command(|reply| Command::Ping { reply })
            .await
            .map(|_| ())
    }

    /// Runs `body` inside a transaction: `BEGIN` before, `COMMIT` after
    /// a successful body, `ROLLBACK` after a failed one. The body's
    /// outcome is propagated either way.
    ///
    /// Nesting is not supported; an inner call simply competes for the
    /// pending-query slot like any other query.
    pub async fn in_transaction<T, Fut>(
        &self,
        body: impl FnOnce(Connection) -> Fut,
    ) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        self.send_query("BEGIN").await?;
        match body(self.clone()).await {
            Ok(value) => {
                self.send_query("COMMIT").await?;
                Ok(value)
            }
            Err(error) => {
                if self.is_connected() {
                    let _ = self.send_query("ROLLBACK").await;
                }
                Err(error)
            }
        }
    }

    /// Sends `Quit` (when still connected) and closes the transport.
    ///
    /// Never fails: any underlying teardown failure is recorded and
    /// available through [`Connection::last_error`]. Repeated calls
    /// await the same teardown.
    pub async fn close(&self) -> Result<()> {
        let (reply, done) = oneshot::channel();
        if self.cmd_tx.send(Command::Close { reply }).is_err() {
            // Driver already gone; the connection is closed.
            return Ok(());
        }
        let _ = done.await;
        Ok(())
    }

    /// Alias of [`Connection::close`].
    pub async fn disconnect(&self) -> Result<()> {
        self.close().await
    }

    /// Resolves once the connection has reached its terminal state.
    ///
    /// Completes exactly once per connection lifetime; when teardown was
    /// not clean the failure is available via [`Connection::last_error`].
    pub async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Whether a query is currently in flight.
    pub fn is_querying(&self) -> bool {
        self.shared.slot.is_claimed()
    }

    /// Whether any armed query deadline has fired on this connection.
    pub fn is_timeout(&self) -> bool {
        self.shared.timed_out.load(Ordering::Acquire)
    }

    /// Whether the server reports an open transaction.
    pub fn in_transaction_now(&self) -> bool {
        self.shared.status_flags.load(Ordering::Acquire) & status::SERVER_STATUS_IN_TRANS != 0
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Server version negotiated during the handshake.
    pub fn version(&self) -> Option<ServerVersion> {
        self.shared.version.get().copied()
    }

    /// The most recent fatal or teardown error, if any.
    pub fn last_error(&self) -> Option<Error> {
        self.shared.last_error.lock().expect("last_error lock").clone()
    }

    /// This instance's position in the process-wide connection count.
    pub fn count(&self) -> usize {
        self.shared.count
    }

    /// Stable diagnostic identifier, e.g. `mysql-connection-3`.
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    fn ensure_ready(&self) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        Ok(())
    }

    fn claim_slot(&self) -> Result<()> {
        self.shared.slot.claim().map_err(|race_lost| Error::StillRunningQuery {
            connection_id: self.shared.id.clone(),
            race_lost,
        })
    }

    async fn run_command(
        &self,
        make: impl FnOnce(QueryReply) -> Command,
    ) -> Result<QueryResult> {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(make(reply)).is_err() {
            self.shared.slot.release();
            return Err(Error::NotConnected);
        }
        match rx.await {
            Ok(result) => result,
            // The driver died between accepting the command and
            // completing it; surface the recorded failure.
            Err(_) => Err(self.teardown_error()),
        }
    }

    fn teardown_error(&self) -> Error {
        self.last_error().unwrap_or(Error::ConnectionBeingClosed)
    }
}

/// The delegate: owns the framed stream and the state machine, and is
/// the only place connection state changes.
struct Driver {
    shared: Arc<Shared>,
    framed: Framed<TcpStream, MySqlCodec>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    state: ConnectionState,
    config: ConnectionConfig,
    charset_id: u8,
    connect_reply: Option<oneshot::Sender<Result<()>>>,
    pending: Option<QueryReply>,
    deadline: QueryDeadline,
    accumulator: ResultSetAccumulator,
    phase: QueryPhase,
    /// Server-side statement ids cached by SQL text.
    statements: HashMap<String, u32>,
    closed_tx: watch::Sender<bool>,
    close_replies: Vec<oneshot::Sender<()>>,
}

impl Driver {
    async fn run(mut self) {
        while self.state != ConnectionState::Closed {
            tokio::select! {
                command = self.cmd_rx.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    // Every handle dropped: tear down quietly.
                    None => self.shutdown(None).await,
                },
                frame = self.framed.next() => match frame {
                    Some(Ok(message)) => {
                        if let Err(error) = self.on_message(message).await {
                            self.fatal(error).await;
                        }
                    }
                    Some(Err(error)) => self.fatal(error).await,
                    None => {
                        let error = Error::from(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "connection closed by server",
                        ));
                        self.fatal(error).await;
                    }
                },
                () = self.deadline.fired(), if self.deadline.is_armed() => {
                    self.on_timeout().await;
                }
            }
        }
        self.finish();
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.shared.set_state(state);
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Query { sql, reply } => {
                self.start_query(ClientMessage::Query { sql }, QueryPhase::Text, reply)
                    .await;
            }
            Command::Ping { reply } => {
                self.start_query(ClientMessage::Ping, QueryPhase::Text, reply)
                    .await;
            }
            Command::PreparedStatement { sql, values, reply } => {
                if let Some(&statement_id) = self.statements.get(&sql) {
                    let message = execute_message(statement_id, values);
                    self.start_query(message, QueryPhase::Executing { sql }, reply)
                        .await;
                } else {
                    let message = ClientMessage::PrepareStatement { sql: sql.clone() };
                    let phase = QueryPhase::Preparing(Box::new(PrepareCollect {
                        sql,
                        values,
                        statement_id: 0,
                        params_done: false,
                        columns_done: false,
                    }));
                    self.start_query(message, phase, reply).await;
                }
            }
            Command::Close { reply } => {
                self.close_replies.push(reply);
                self.shutdown(None).await;
            }
        }
    }

    async fn start_query(&mut self, message: ClientMessage, phase: QueryPhase, reply: QueryReply) {
        if self.state != ConnectionState::Ready {
            self.shared.slot.release();
            let _ = reply.send(Err(Error::NotConnected));
            return;
        }

        self.pending = Some(reply);
        self.phase = phase;
        self.accumulator.reset();
        self.set_state(ConnectionState::Querying);

        if let Err(error) = self.framed.send(message).await {
            self.fatal(error).await;
            return;
        }
        if let Some(timeout) = self.config.effective_query_timeout() {
            self.deadline.arm(timeout);
        }
    }

    async fn on_message(&mut self, message: ServerMessage) -> Result<()> {
        match self.state {
            ConnectionState::AwaitingHandshake => match message {
                ServerMessage::Handshake(handshake) => self.on_handshake(handshake).await,
                other => self.drop_unexpected(other),
            },
            ConnectionState::AwaitingHandshakeResult => match message {
                ServerMessage::Ok(ok) => {
                    self.shared.status_flags.store(ok.status_flags, Ordering::Release);
                    self.shared.connected.store(true, Ordering::Release);
                    self.set_state(ConnectionState::Ready);
                    if let Some(reply) = self.connect_reply.take() {
                        let _ = reply.send(Ok(()));
                    }
                    Ok(())
                }
                ServerMessage::Error(err) => {
                    let error = err.into_error();
                    if let Some(reply) = self.connect_reply.take() {
                        let _ = reply.send(Err(error.clone()));
                    }
                    self.shared.record_error(error);
                    self.shutdown_transport().await;
                    Ok(())
                }
                ServerMessage::AuthSwitchRequest(request) => self.on_auth_switch(request).await,
                other => self.drop_unexpected(other),
            },
            ConnectionState::Querying => self.on_query_message(message).await,
            // Ready, Closed and the pre-handshake states have no
            // legitimate server traffic; log and drop.
            _ => self.drop_unexpected(message),
        }
    }

    async fn on_handshake(&mut self, handshake: Handshake) -> Result<()> {
        let _ = self.shared.version.set(handshake.version);

        let capabilities = self.config.capability_flags() & handshake.capabilities;
        let password = self.config.password.as_deref().unwrap_or("");
        let auth_response = auth::native_password_scramble(password, &handshake.seed);

        let response = ClientMessage::HandshakeResponse {
            capabilities,
            max_packet_size: crate::codec::MAX_PAYLOAD_SIZE as u32,
            charset_id: self.charset_id,
            user: self.config.user.clone(),
            auth_response,
            database: self.config.database.clone(),
            auth_plugin: auth::MYSQL_NATIVE_PASSWORD.to_string(),
            attributes: self.config.connect_attributes(),
        };
        self.framed.send(response).await?;
        self.set_state(ConnectionState::AwaitingHandshakeResult);
        Ok(())
    }

    async fn on_auth_switch(&mut self, request: AuthSwitchRequest) -> Result<()> {
        if request.plugin != auth::MYSQL_NATIVE_PASSWORD {
            return Err(Error::Unexpected(format!(
                "server requested unsupported auth plugin {:?}",
                request.plugin
            )));
        }
        let password = self.config.password.as_deref().unwrap_or("");
        let auth_response = auth::native_password_scramble(password, &request.seed);
        self.framed
            .send(ClientMessage::AuthSwitchResponse { auth_response })
            .await?;
        Ok(())
    }

    async fn on_query_message(&mut self, message: ServerMessage) -> Result<()> {
        match message {
            ServerMessage::Ok(ok) => {
                self.shared.status_flags.store(ok.status_flags, Ordering::Release);
                self.complete_query(Ok(QueryResult::from_ok(ok)));
                Ok(())
            }
            ServerMessage::Error(err) => {
                if let QueryPhase::Executing { sql } = &self.phase {
                    // The server may have discarded the statement; drop
                    // the cache entry so the next call re-prepares.
                    self.statements.remove(sql.as_str());
                }
                self.complete_query(Err(err.into_error()));
                Ok(())
            }
            ServerMessage::ColumnDefinition(column) => {
                match &self.phase {
                    // Prepare metadata is not kept; the EOF markers
                    // drive completion.
                    QueryPhase::Preparing(_) => Ok(()),
                    _ => {
                        self.accumulator.on_column_definition(column);
                        Ok(())
                    }
                }
            }
            ServerMessage::Eof(_) => {
                match &mut self.phase {
                    QueryPhase::Preparing(collect) => {
                        collect.on_eof();
                        self.continue_prepare().await
                    }
                    // End of column definitions; rows follow.
                    _ => Ok(()),
                }
            }
            ServerMessage::Row(values) => self.accumulator.on_text_row(values),
            ServerMessage::BinaryRow(payload) => self.accumulator.on_binary_row(payload),
            ServerMessage::ResultSetComplete(eof) => {
                self.shared.status_flags.store(eof.status_flags, Ordering::Release);
                let result_set = self.accumulator.finish();
                self.complete_query(Ok(QueryResult::from_result_set(result_set, eof)));
                Ok(())
            }
            ServerMessage::PreparedStatementPrepared(ok) => {
                match &mut self.phase {
                    QueryPhase::Preparing(collect) => {
                        let StmtPrepareOk {
                            statement_id,
                            num_columns,
                            num_params,
                            ..
                        } = ok;
                        collect.statement_id = statement_id;
                        collect.params_done = num_params == 0;
                        collect.columns_done = num_columns == 0;
                        self.continue_prepare().await
                    }
                    _ => self.drop_unexpected(ServerMessage::PreparedStatementPrepared(ok)),
                }
            }
            other => self.drop_unexpected(other),
        }
    }

    /// Once the prepare metadata is complete, caches the statement and
    /// sends the execute command.
    async fn continue_prepare(&mut self) -> Result<()> {
        let QueryPhase::Preparing(collect) = &self.phase else {
            return Ok(());
        };
        if !collect.is_complete() {
            return Ok(());
        }

        let QueryPhase::Preparing(collect) =
            std::mem::replace(&mut self.phase, QueryPhase::Idle)
        else {
            unreachable!("phase checked above");
        };
        self.phase = QueryPhase::Executing {
            sql: collect.sql.clone(),
        };
        let message = execute_message(collect.statement_id, collect.values);
        self.statements.insert(collect.sql, collect.statement_id);
        self.accumulator.reset();
        self.framed.send(message).await?;
        Ok(())
    }

    fn complete_query(&mut self, result: Result<QueryResult>) {
        self.deadline.disarm();
        self.phase = QueryPhase::Idle;
        self.set_state(ConnectionState::Ready);
        // Release the slot before waking the caller, or its next query
        // could observe the slot still held.
        self.shared.slot.release();
        if let Some(reply) = self.pending.take() {
            let _ = reply.send(result);
        }
    }

    fn drop_unexpected(&self, message: ServerMessage) -> Result<()> {
        tracing::warn!(
            connection = %self.shared.id,
            state = ?self.state,
            message = message.name(),
            "dropping unexpected server message"
        );
        Ok(())
    }

    async fn on_timeout(&mut self) {
        self.shared.timed_out.store(true, Ordering::Release);
        self.deadline.disarm();
        tracing::warn!(
            connection = %self.shared.id,
            "query exceeded its deadline, disconnecting"
        );
        self.fail_pending(Error::TimedOut);
        self.shared.record_error(Error::TimedOut);
        self.shutdown_transport().await;
    }

    /// Transport-level or protocol-drift failure: fail everything that
    /// is waiting and tear the connection down.
    async fn fatal(&mut self, error: Error) {
        tracing::debug!(
            connection = %self.shared.id,
            error = %error,
            "fatal connection error"
        );
        self.shared.record_error(error.clone());
        if let Some(reply) = self.connect_reply.take() {
            let _ = reply.send(Err(error.clone()));
        }
        self.fail_pending(error);
        self.shutdown_transport().await;
    }

    /// User-initiated teardown. Sends `Quit` when the session is still
    /// healthy; failures are recorded, never raised.
    async fn shutdown(&mut self, error: Option<Error>) {
        if self.state == ConnectionState::Closed {
            return;
        }
        if let Some(error) = error {
            self.shared.record_error(error);
        }
        self.fail_pending(Error::ConnectionBeingClosed);
        if let Some(reply) = self.connect_reply.take() {
            let _ = reply.send(Err(Error::ConnectionBeingClosed));
        }

        if self.shared.connected.load(Ordering::Acquire) {
            // Release cached server-side statements; COM_STMT_CLOSE has
            // no response, so these are fire-and-forget.
            for statement_id in std::mem::take(&mut self.statements).into_values() {
                let _ = self
                    .framed
                    .send(ClientMessage::CloseStatement { statement_id })
                    .await;
            }
            if let Err(error) = self.framed.send(ClientMessage::Quit).await {
                self.shared.record_error(error);
            }
        }
        self.shutdown_transport().await;
    }

    fn fail_pending(&mut self, error: Error) {
        self.deadline.disarm();
        self.framed.codec_mut().clear_query_state();
        self.accumulator.reset();
        self.phase = QueryPhase::Idle;
        self.shared.slot.release();
        if let Some(reply) = self.pending.take() {
            let _ = reply.send(Err(error));
        }
    }

    async fn shutdown_transport(&mut self) {
        self.shared.connected.store(false, Ordering::Release);
        let _ = self.framed.get_mut().shutdown().await;
        self.set_state(ConnectionState::Closed);
    }

    /// Terminal bookkeeping: completes the disconnect notification
    /// exactly once and answers anything still queued.
    fn finish(&mut self) {
        self.closed_tx.send_replace(true);
        for reply in self.close_replies.drain(..) {
            let _ = reply.send(());
        }
        while let Ok(command) = self.cmd_rx.try_recv() {
            match command {
                Command::Query { reply, .. }
                | Command::PreparedStatement { reply, .. }
                | Command::Ping { reply } => {
                    let _ = reply.send(Err(Error::NotConnected));
                }
                Command::Close { reply } => {
                    let _ = reply.send(());
                }
            }
        }
        self.cmd_rx.close();
    }
}

fn execute_message(statement_id: u32, values: Vec<Value>) -> ClientMessage {
    let types = values.iter().map(types::field_type_for).collect();
    ClientMessage::Execute {
        statement_id,
        params: values,
        types,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_slot_claim_and_release() {
        let slot = QuerySlot::default();
        assert!(!slot.is_claimed());
        slot.claim().unwrap();
        assert!(slot.is_claimed());
        assert_eq!(slot.claim(), Err(false));
        slot.release();
        assert!(slot.claim().is_ok());
    }

    #[test]
    fn test_connection_state_round_trip() {
        for state in [
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::AwaitingHandshake,
            ConnectionState::AwaitingHandshakeResult,
            ConnectionState::Ready,
            ConnectionState::Querying,
            ConnectionState::Closed,
        ] {
            assert_eq!(ConnectionState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn test_prepare_collect_completion() {
        let mut collect = PrepareCollect {
            sql: "SELECT ?".into(),
            values: vec![Value::Int(1)],
            statement_id: 1,
            params_done: false,
            columns_done: false,
        };
        assert!(!collect.is_complete());

        // EOF after the parameter definitions.
        collect.on_eof();
        assert!(!collect.is_complete());

        // Final EOF after the column definitions.
        collect.on_eof();
        assert!(collect.is_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fires_once_armed() {
        let mut deadline = QueryDeadline::default();
        assert!(!deadline.is_armed());

        deadline.arm(Duration::from_millis(100));
        assert!(deadline.is_armed());
        deadline.fired().await; // paused clock auto-advances
        deadline.disarm();
        assert!(!deadline.is_armed());
    }
}
