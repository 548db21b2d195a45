//! Callback-driven streaming protocol session.
//!
//! `AsyncWebSocket` never blocks on the network. Every entry point starts
//! a transport stage and returns a result object carrying a
//! [`CompletionSignal`]; the transport reports progress through its status
//! callback, which drives the session state machine:
//!
//! ```text
//! connect ─► RequestSent ─► HeadersAvailable(101) ─► UpgradeComplete ─► Connected
//!                                 │ 3xx: logged, left pending
//!                                 └ other: Error
//! receive ─► ReadComplete(fragment)* ─► ReadComplete(message | close)
//! send    ─► WriteComplete
//! close   ─► CloseComplete ─► Closed
//! RequestError (any stage) ─► Error, every waiter released
//! ```
//!
//! All state changes happen inside `SessionShared::update`, under one
//! mutex. Transport calls are made after the lock is released.

use crate::handshake::{is_redirect, SWITCHING_PROTOCOLS};
use crate::registry::{SessionRegistry, SessionToken};
use crate::settings::SessionSettings;
use crate::transport::{AsyncHttpTransport, BufferType, RequestStage, StatusEvent};

use ovio_core::error::{OvioError, Result};
use ovio_core::signal::CompletionSignal;
use ovio_core::state::{ReadState, SessionStatus, WriteState};

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How long dropping a session waits for its close handshake.
const DROP_CLOSE_WAIT: Duration = Duration::from_secs(5);

/// Outcome of `connect`.
#[derive(Debug)]
pub struct ConnectionResult {
    complete: CompletionSignal,
    connected: AtomicBool,
    error: Mutex<Option<OvioError>>,
}

impl ConnectionResult {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            complete: CompletionSignal::manual(),
            connected: AtomicBool::new(false),
            error: Mutex::new(None),
        })
    }

    /// Block until the handshake finished or failed. `Ok(false)` on timeout.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        self.complete.wait(timeout, false)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn error(&self) -> Option<OvioError> {
        self.error.lock().clone()
    }

    pub fn signal(&self) -> &CompletionSignal {
        &self.complete
    }

    fn finish(&self, outcome: std::result::Result<(), OvioError>) {
        match outcome {
            Ok(()) => self.connected.store(true, Ordering::Release),
            Err(err) => {
                self.connected.store(false, Ordering::Release);
                *self.error.lock() = Some(err);
            }
        }
        if let Err(err) = self.complete.signal() {
            log::error!("session: connection signal failed: {}", err);
        }
    }
}

#[derive(Debug)]
struct ReadInner {
    status: ReadState,
    data: Vec<u8>,
    history: Vec<ReadState>,
    close: bool,
    error: Option<OvioError>,
}

/// Outcome of one `receive`: a whole message, reassembled from fragments.
#[derive(Debug)]
pub struct ReadResult {
    complete: CompletionSignal,
    inner: Mutex<ReadInner>,
}

impl ReadResult {
    fn with_status(status: ReadState) -> Arc<Self> {
        Arc::new(Self {
            complete: CompletionSignal::manual(),
            inner: Mutex::new(ReadInner {
                status,
                data: Vec::new(),
                history: vec![status],
                close: false,
                error: None,
            }),
        })
    }

    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        self.complete.wait(timeout, false)
    }

    pub fn status(&self) -> ReadState {
        self.inner.lock().status
    }

    /// Every state this read has been in, oldest first.
    pub fn history(&self) -> Vec<ReadState> {
        self.inner.lock().history.clone()
    }

    /// Bytes received so far; the whole message once `Finished`.
    pub fn data(&self) -> Vec<u8> {
        self.inner.lock().data.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The read finished because the peer closed the session.
    pub fn is_close(&self) -> bool {
        self.inner.lock().close
    }

    pub fn error(&self) -> Option<OvioError> {
        self.inner.lock().error.clone()
    }

    pub fn signal(&self) -> &CompletionSignal {
        &self.complete
    }

    fn set(&self, inner: &mut ReadInner, status: ReadState) {
        inner.status = status;
        inner.history.push(status);
        if matches!(status, ReadState::Finished | ReadState::Error) {
            if let Err(err) = self.complete.signal() {
                log::error!("session: read signal failed: {}", err);
            }
        }
    }

    /// Append one chunk. Returns true when more fragments must be read.
    fn append(&self, data: &[u8], kind: BufferType) -> bool {
        let mut inner = self.inner.lock();
        if !inner.status.is_in_flight() {
            log::warn!("session: {} bytes arrived with no receive in flight", data.len());
            return false;
        }
        inner.data.extend_from_slice(data);
        if kind == BufferType::Close {
            inner.close = true;
            self.set(&mut inner, ReadState::Finished);
            false
        } else if kind.is_fragment() {
            self.set(&mut inner, ReadState::PartialRead);
            true
        } else {
            self.set(&mut inner, ReadState::Finished);
            false
        }
    }

    fn fail(&self, err: &OvioError) {
        let mut inner = self.inner.lock();
        inner.data.clear();
        inner.error = Some(err.clone());
        self.set(&mut inner, ReadState::Error);
    }
}

#[derive(Debug)]
struct WriteInner {
    status: WriteState,
    bytes: usize,
    error: Option<OvioError>,
}

/// Outcome of one `send_*`.
#[derive(Debug)]
pub struct WriteResult {
    complete: CompletionSignal,
    inner: Mutex<WriteInner>,
}

impl WriteResult {
    fn with_status(status: WriteState) -> Arc<Self> {
        Arc::new(Self {
            complete: CompletionSignal::manual(),
            inner: Mutex::new(WriteInner { status, bytes: 0, error: None }),
        })
    }

    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        self.complete.wait(timeout, false)
    }

    pub fn status(&self) -> WriteState {
        self.inner.lock().status
    }

    pub fn bytes_written(&self) -> usize {
        self.inner.lock().bytes
    }

    pub fn error(&self) -> Option<OvioError> {
        self.inner.lock().error.clone()
    }

    pub fn signal(&self) -> &CompletionSignal {
        &self.complete
    }

    fn finish(&self, bytes: usize) {
        let mut inner = self.inner.lock();
        if inner.status != WriteState::Initiated {
            log::warn!("session: write completion with no write in flight");
            return;
        }
        inner.bytes = bytes;
        inner.status = WriteState::Finished;
        drop(inner);
        if let Err(err) = self.complete.signal() {
            log::error!("session: write signal failed: {}", err);
        }
    }

    fn fail(&self, err: &OvioError) {
        let mut inner = self.inner.lock();
        inner.status = WriteState::Error;
        inner.error = Some(err.clone());
        drop(inner);
        if let Err(err) = self.complete.signal() {
            log::error!("session: write signal failed: {}", err);
        }
    }
}

struct SessionState {
    status: SessionStatus,
    connection: Arc<ConnectionResult>,
    read: Arc<ReadResult>,
    write: Arc<WriteResult>,
    /// Set once the session reaches `Closed` or `Error`
    finished: CompletionSignal,
}

impl SessionState {
    /// Move to `next` if the state machine allows it.
    fn advance(&mut self, next: SessionStatus) -> bool {
        if self.status == next {
            return true;
        }
        if !self.status.can_transition_to(next) {
            log::debug!("session: ignoring {} -> {}", self.status, next);
            return false;
        }
        log::debug!("session: {} -> {}", self.status, next);
        self.status = next;
        if next.is_terminal() {
            if let Err(err) = self.finished.signal() {
                log::error!("session: finish signal failed: {}", err);
            }
        }
        true
    }

    fn fail(&mut self, stage: RequestStage, error: OvioError) {
        log::error!("session: {} failed: {}", stage, error);
        self.advance(SessionStatus::Error);
        self.connection.finish(Err(error.clone()));
        self.read.fail(&error);
        self.write.fail(&error);
    }
}

/// What to start on the transport once the lock is released.
enum Next {
    Nothing,
    ReceiveResponse,
    CompleteUpgrade,
    ReceiveMore,
}

/// Session state reachable from transport callbacks.
pub(crate) struct SessionShared {
    settings: SessionSettings,
    transport: Box<dyn AsyncHttpTransport>,
    state: Mutex<SessionState>,
}

impl SessionShared {
    /// Run `f` under the session lock. The only place state is mutated.
    fn update<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let mut state = self.state.lock();
        f(&mut state)
    }

    /// Entry point for transport events.
    pub(crate) fn handle(&self, event: StatusEvent) {
        let next = self.update(|st| Self::transition(st, event));
        let (stage, started) = match next {
            Next::Nothing => return,
            Next::ReceiveResponse => {
                (RequestStage::ReceiveResponse, self.transport.receive_response())
            }
            Next::CompleteUpgrade => (RequestStage::Upgrade, self.transport.complete_upgrade()),
            Next::ReceiveMore => (
                RequestStage::ReadData,
                self.transport.receive(self.settings.buffer_block_size),
            ),
        };
        if let Err(error) = started {
            self.handle(StatusEvent::RequestError { stage, error });
        }
    }

    fn transition(st: &mut SessionState, event: StatusEvent) -> Next {
        match event {
            StatusEvent::RequestSent if st.status == SessionStatus::Connecting => {
                Next::ReceiveResponse
            }
            StatusEvent::HeadersAvailable { status } if st.status == SessionStatus::Connecting => {
                if status == SWITCHING_PROTOCOLS {
                    Next::CompleteUpgrade
                } else if is_redirect(status) {
                    log::warn!("session: upgrade redirected with status {}; not followed", status);
                    Next::Nothing
                } else {
                    st.fail(
                        RequestStage::ReceiveResponse,
                        OvioError::protocol(format!("upgrade refused with status {}", status)),
                    );
                    Next::Nothing
                }
            }
            StatusEvent::UpgradeComplete if st.status == SessionStatus::Connecting => {
                st.advance(SessionStatus::Connected);
                st.connection.finish(Ok(()));
                Next::Nothing
            }
            StatusEvent::ReadComplete { data, buffer_type } => {
                let more = st.read.append(&data, buffer_type);
                if buffer_type == BufferType::Close {
                    st.advance(SessionStatus::Closed);
                }
                if more {
                    Next::ReceiveMore
                } else {
                    Next::Nothing
                }
            }
            StatusEvent::WriteComplete { bytes } => {
                st.write.finish(bytes);
                Next::Nothing
            }
            StatusEvent::CloseComplete => {
                st.advance(SessionStatus::Closed);
                Next::Nothing
            }
            StatusEvent::RequestError { stage, error } => {
                st.fail(stage, error);
                Next::Nothing
            }
            other => {
                log::debug!("session: {:?} ignored in state {}", other, st.status);
                Next::Nothing
            }
        }
    }
}

/// Asynchronous WebSocket-style session.
///
/// # Example
///
/// ```ignore
/// let pool = Arc::new(ThreadPool::new(2, 4)?);
/// let ws = AsyncWebSocket::new(SessionSettings::new("localhost", 9001), PooledTransport::new(pool))?;
/// ws.connect()?.wait(None)?;
/// let read = ws.receive()?;
/// read.wait(None)?;
/// ```
pub struct AsyncWebSocket {
    shared: Arc<SessionShared>,
    registry: Arc<SessionRegistry>,
    token: SessionToken,
}

impl AsyncWebSocket {
    /// Register a session in the process-wide registry.
    pub fn new(settings: SessionSettings, transport: impl AsyncHttpTransport + 'static) -> Result<Self> {
        Self::with_registry(settings, transport, SessionRegistry::global())
    }

    pub fn with_registry(
        settings: SessionSettings,
        transport: impl AsyncHttpTransport + 'static,
        registry: Arc<SessionRegistry>,
    ) -> Result<Self> {
        let shared = Arc::new(SessionShared {
            settings,
            transport: Box::new(transport),
            state: Mutex::new(SessionState {
                status: SessionStatus::NotInitialised,
                connection: ConnectionResult::new(),
                read: ReadResult::with_status(ReadState::NotInitiated),
                write: WriteResult::with_status(WriteState::NotInitiated),
                finished: CompletionSignal::manual(),
            }),
        });
        let token = registry.insert(Arc::clone(&shared))?;

        let weak = Arc::downgrade(&registry);
        shared.transport.set_callback(
            token.to_u64(),
            Arc::new(move |context, event| {
                let Some(registry) = weak.upgrade() else { return };
                match registry.get(SessionToken::from_u64(context)) {
                    Some(session) => session.handle(event),
                    None => log::debug!("session: event for released session dropped"),
                }
            }),
        );
        Ok(Self { shared, registry, token })
    }

    pub fn token(&self) -> SessionToken {
        self.token
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.shared.settings
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.update(|st| st.status)
    }

    /// Start the upgrade handshake at `settings.path`.
    pub fn connect(&self) -> Result<Arc<ConnectionResult>> {
        let path = self.shared.settings.path.clone();
        self.connect_path(&path)
    }

    pub fn connect_path(&self, path: &str) -> Result<Arc<ConnectionResult>> {
        let connection = self.shared.update(|st| {
            if st.status != SessionStatus::NotInitialised {
                return Err(OvioError::invalid_state(format!("connect in state {}", st.status)));
            }
            st.advance(SessionStatus::Connecting);
            Ok(Arc::clone(&st.connection))
        })?;

        let transport = &self.shared.transport;
        let started = self
            .shared
            .settings
            .validate()
            .and_then(|()| transport.open(&self.shared.settings))
            .and_then(|()| transport.send_request(path));
        if let Err(error) = started {
            self.shared.update(|st| st.fail(RequestStage::SendRequest, error.clone()));
            return Err(error);
        }
        Ok(connection)
    }

    /// Start receiving the next whole message.
    pub fn receive(&self) -> Result<Arc<ReadResult>> {
        let read = self.shared.update(|st| {
            if st.status != SessionStatus::Connected {
                return Err(OvioError::invalid_state(format!("receive in state {}", st.status)));
            }
            if st.read.status().is_in_flight() {
                return Err(OvioError::invalid_state("a receive is already in flight"));
            }
            st.read = ReadResult::with_status(ReadState::Initiated);
            Ok(Arc::clone(&st.read))
        })?;

        if let Err(error) = self.shared.transport.receive(self.shared.settings.buffer_block_size) {
            self.shared.update(|st| st.fail(RequestStage::ReadData, error.clone()));
            return Err(error);
        }
        Ok(read)
    }

    pub fn send_string(&self, message: &str) -> Result<Arc<WriteResult>> {
        self.send(BufferType::Utf8Message, message.as_bytes().to_vec())
    }

    pub fn send_buffer(&self, data: &[u8]) -> Result<Arc<WriteResult>> {
        self.send(BufferType::BinaryMessage, data.to_vec())
    }

    fn send(&self, kind: BufferType, data: Vec<u8>) -> Result<Arc<WriteResult>> {
        let write = self.shared.update(|st| {
            if st.status != SessionStatus::Connected {
                return Err(OvioError::invalid_state(format!("send in state {}", st.status)));
            }
            if st.write.status().is_in_flight() {
                return Err(OvioError::invalid_state("a send is already in flight"));
            }
            st.write = WriteResult::with_status(WriteState::Initiated);
            Ok(Arc::clone(&st.write))
        })?;

        if let Err(error) = self.shared.transport.send(kind, data) {
            self.shared.update(|st| st.fail(RequestStage::WriteData, error.clone()));
            return Err(error);
        }
        Ok(write)
    }

    /// Start the close handshake. No-op unless connected.
    pub fn close(&self) -> Result<()> {
        let closing = self.shared.update(|st| {
            st.status == SessionStatus::Connected && st.advance(SessionStatus::Closing)
        });
        if !closing {
            return Ok(());
        }
        if let Err(error) = self.shared.transport.close() {
            self.shared.update(|st| st.fail(RequestStage::Close, error.clone()));
            return Err(error);
        }
        Ok(())
    }

    /// Block until the session is `Closed` or in `Error`.
    pub fn wait_finished(&self, timeout: Option<Duration>) -> Result<bool> {
        let finished = self.shared.update(|st| st.finished.clone());
        finished.wait(timeout, false)
    }

    /// Result object of the current (or last) connect.
    pub fn connection_result(&self) -> Arc<ConnectionResult> {
        self.shared.update(|st| Arc::clone(&st.connection))
    }

    pub fn read_result(&self) -> Arc<ReadResult> {
        self.shared.update(|st| Arc::clone(&st.read))
    }

    pub fn write_result(&self) -> Arc<WriteResult> {
        self.shared.update(|st| Arc::clone(&st.write))
    }
}

impl Drop for AsyncWebSocket {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::debug!("session: close on drop failed: {}", err);
        }
        if self.status() == SessionStatus::Closing {
            match self.wait_finished(Some(DROP_CLOSE_WAIT)) {
                Ok(true) => {}
                Ok(false) => log::warn!("session: close handshake did not finish before drop"),
                Err(err) => log::debug!("session: close wait failed: {}", err),
            }
        }
        self.registry.remove(self.token);
    }
}

impl std::fmt::Debug for AsyncWebSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncWebSocket")
            .field("token", &self.token)
            .field("status", &self.status())
            .finish()
    }
}
