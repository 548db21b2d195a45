//! Blocking streaming protocol session.

use crate::handshake::{is_redirect, SWITCHING_PROTOCOLS};
use crate::settings::SessionSettings;
use crate::tcp::TcpTransport;
use crate::transport::{BufferType, HttpTransport};

use ovio_core::dispatch::Dispatcher;
use ovio_core::error::{OvioError, Result};
use ovio_core::signal::CompletionSignal;
use ovio_core::state::SessionStatus;

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Move `status` to `next` if the state machine allows it.
fn advance(status: &Mutex<SessionStatus>, next: SessionStatus) -> bool {
    let mut current = status.lock();
    if *current == next {
        return true;
    }
    if !current.can_transition_to(next) {
        return false;
    }
    log::debug!("websocket: {} -> {}", *current, next);
    *current = next;
    true
}

/// Read one whole message, growing the buffer one block at a time.
/// `None` when the peer closed the session.
fn receive_message<T: HttpTransport>(
    transport: &T,
    status: &Mutex<SessionStatus>,
    block: usize,
) -> Result<Option<Vec<u8>>> {
    let mut buf = vec![0u8; block];
    let mut total = 0usize;
    loop {
        if total == buf.len() {
            buf.resize(buf.len() + block, 0);
        }
        let (n, kind) = match transport.receive(&mut buf[total..]) {
            Ok(chunk) => chunk,
            Err(err) => {
                advance(status, SessionStatus::Error);
                return Err(err);
            }
        };
        if kind == BufferType::Close {
            advance(status, SessionStatus::Closed);
            if let Err(err) = transport.close() {
                log::debug!("websocket: release after peer close failed: {}", err);
            }
            return Ok(None);
        }
        total += n;
        if kind.is_message() {
            buf.truncate(total);
            return Ok(Some(buf));
        }
    }
}

/// Clears the in-flight receive flag when dropped.
struct ReadingGuard(Arc<AtomicBool>);

impl ReadingGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Result<Self> {
        if flag.swap(true, Ordering::AcqRel) {
            return Err(OvioError::invalid_state("a receive is already in flight"));
        }
        Ok(Self(Arc::clone(flag)))
    }
}

impl Drop for ReadingGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Outcome of [`WebSocket::async_receive`].
#[derive(Debug)]
pub struct ReceiveHandle {
    done: CompletionSignal,
    outcome: Mutex<Option<Result<Option<Vec<u8>>>>>,
}

impl ReceiveHandle {
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        self.done.wait(timeout, false)
    }

    pub fn is_complete(&self) -> bool {
        self.outcome.lock().is_some()
    }

    /// Take the outcome once complete. Later calls return `None`.
    pub fn take(&self) -> Option<Result<Option<Vec<u8>>>> {
        self.outcome.lock().take()
    }

    pub fn signal(&self) -> &CompletionSignal {
        &self.done
    }
}

/// Blocking WebSocket-style session over an [`HttpTransport`].
///
/// `send_*` and `receive` may be called from different threads at the same
/// time; at most one receive runs at once.
pub struct WebSocket<T: HttpTransport + 'static = TcpTransport> {
    settings: SessionSettings,
    transport: Arc<T>,
    status: Arc<Mutex<SessionStatus>>,
    reading: Arc<AtomicBool>,
}

impl WebSocket<TcpTransport> {
    pub fn new(settings: SessionSettings) -> Self {
        Self::with_transport(settings, TcpTransport::new())
    }
}

impl<T: HttpTransport + 'static> WebSocket<T> {
    pub fn with_transport(settings: SessionSettings, transport: T) -> Self {
        Self {
            settings,
            transport: Arc::new(transport),
            status: Arc::new(Mutex::new(SessionStatus::NotInitialised)),
            reading: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.lock()
    }

    /// Upgrade at `settings.path`.
    pub fn connect(&self) -> Result<()> {
        let path = self.settings.path.clone();
        self.connect_path(&path)
    }

    /// Run the whole upgrade handshake. A redirect is reported as
    /// [`OvioError::Redirected`] and not followed.
    pub fn connect_path(&self, path: &str) -> Result<()> {
        {
            let mut status = self.status.lock();
            if *status != SessionStatus::NotInitialised {
                return Err(OvioError::invalid_state(format!("connect in state {}", *status)));
            }
            *status = SessionStatus::Connecting;
        }

        match self.handshake(path) {
            Ok(()) => {
                advance(&self.status, SessionStatus::Connected);
                log::info!("websocket: connected to {}:{}{}", self.settings.host, self.settings.port, path);
                Ok(())
            }
            Err(err) => {
                advance(&self.status, SessionStatus::Error);
                if let Err(close_err) = self.transport.close() {
                    log::debug!("websocket: release after failed connect: {}", close_err);
                }
                Err(err)
            }
        }
    }

    fn handshake(&self, path: &str) -> Result<()> {
        self.settings.validate()?;
        self.transport.open(&self.settings)?;
        self.transport.send_upgrade_request(path)?;
        match self.transport.receive_response()? {
            SWITCHING_PROTOCOLS => self.transport.complete_upgrade(),
            status if is_redirect(status) => Err(OvioError::Redirected { status }),
            status => Err(OvioError::protocol(format!("upgrade refused with status {}", status))),
        }
    }

    fn require_connected(&self) -> Result<()> {
        let status = self.status();
        if status != SessionStatus::Connected {
            return Err(OvioError::invalid_state(format!("session is {}", status)));
        }
        Ok(())
    }

    pub fn send_string(&self, message: &str) -> Result<()> {
        self.send(BufferType::Utf8Message, message.as_bytes())
    }

    pub fn send_buffer(&self, data: &[u8]) -> Result<()> {
        self.send(BufferType::BinaryMessage, data)
    }

    fn send(&self, kind: BufferType, data: &[u8]) -> Result<()> {
        self.require_connected()?;
        self.transport.send(kind, data).inspect_err(|_| {
            advance(&self.status, SessionStatus::Error);
        })
    }

    /// Block for the next whole message. `Ok(None)` once the peer closed.
    pub fn receive(&self) -> Result<Option<Vec<u8>>> {
        self.require_connected()?;
        let _guard = ReadingGuard::acquire(&self.reading)?;
        receive_message(&*self.transport, &self.status, self.settings.buffer_block_size)
    }

    /// Run `receive` on `dispatcher` and return at once.
    pub fn async_receive(&self, dispatcher: &dyn Dispatcher) -> Result<Arc<ReceiveHandle>> {
        self.require_connected()?;
        let guard = ReadingGuard::acquire(&self.reading)?;

        let handle = Arc::new(ReceiveHandle { done: CompletionSignal::manual(), outcome: Mutex::new(None) });
        let job_handle = Arc::clone(&handle);
        let transport = Arc::clone(&self.transport);
        let status = Arc::clone(&self.status);
        let block = self.settings.buffer_block_size;

        dispatcher.dispatch(Box::new(move || {
            let outcome = receive_message(&*transport, &status, block);
            drop(guard);
            *job_handle.outcome.lock() = Some(outcome);
            if let Err(err) = job_handle.done.signal() {
                log::error!("websocket: receive signal failed: {}", err);
            }
        }))?;
        Ok(handle)
    }

    /// Close handshake. No-op unless connected.
    pub fn close(&self) -> Result<()> {
        {
            let mut status = self.status.lock();
            if *status != SessionStatus::Connected {
                return Ok(());
            }
            *status = SessionStatus::Closing;
        }
        match self.transport.close() {
            Ok(()) => {
                advance(&self.status, SessionStatus::Closed);
                Ok(())
            }
            Err(err) => {
                advance(&self.status, SessionStatus::Error);
                Err(err)
            }
        }
    }
}

impl<T: HttpTransport + 'static> Drop for WebSocket<T> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::debug!("websocket: close on drop failed: {}", err);
        }
    }
}

impl<T: HttpTransport + 'static> std::fmt::Debug for WebSocket<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocket")
            .field("host", &self.settings.host)
            .field("port", &self.settings.port)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{self, Opcode, CLOSE_NORMAL};
    use crate::handshake::accept_key;
    use ovio_module::ThreadPool;
    use std::collections::VecDeque;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::mpsc;
    use std::thread;

    const WAIT: Option<Duration> = Some(Duration::from_secs(5));

    /// Hands out scripted chunks, splitting any that exceed the buffer.
    #[derive(Default)]
    struct ScriptTransport {
        status: u16,
        chunks: Mutex<VecDeque<(Vec<u8>, BufferType)>>,
        sent: Mutex<Vec<(BufferType, Vec<u8>)>>,
        closes: Mutex<usize>,
    }

    impl ScriptTransport {
        fn new(status: u16, chunks: &[(&[u8], BufferType)]) -> Self {
            Self {
                status,
                chunks: Mutex::new(chunks.iter().map(|(d, k)| (d.to_vec(), *k)).collect()),
                ..Default::default()
            }
        }
    }

    impl HttpTransport for ScriptTransport {
        fn open(&self, _settings: &SessionSettings) -> Result<()> {
            Ok(())
        }

        fn send_upgrade_request(&self, _path: &str) -> Result<()> {
            Ok(())
        }

        fn receive_response(&self) -> Result<u16> {
            Ok(self.status)
        }

        fn complete_upgrade(&self) -> Result<()> {
            Ok(())
        }

        fn send(&self, kind: BufferType, data: &[u8]) -> Result<()> {
            self.sent.lock().push((kind, data.to_vec()));
            Ok(())
        }

        fn receive(&self, buf: &mut [u8]) -> Result<(usize, BufferType)> {
            let mut chunks = self.chunks.lock();
            let (mut data, kind) = chunks
                .pop_front()
                .ok_or_else(|| OvioError::BrokenChannel("script exhausted".into()))?;
            if data.len() > buf.len() {
                let rest = data.split_off(buf.len());
                chunks.push_front((rest, kind));
                let partial = if kind == BufferType::Utf8Message {
                    BufferType::Utf8Fragment
                } else {
                    BufferType::BinaryFragment
                };
                buf[..data.len()].copy_from_slice(&data);
                return Ok((data.len(), partial));
            }
            buf[..data.len()].copy_from_slice(&data);
            Ok((data.len(), kind))
        }

        fn close(&self) -> Result<()> {
            *self.closes.lock() += 1;
            Ok(())
        }
    }

    fn settings(block: usize) -> SessionSettings {
        SessionSettings::new("localhost", 9001).buffer_block_size(block)
    }

    #[test]
    fn test_receive_grows_buffer() {
        let t = ScriptTransport::new(
            101,
            &[
                (b"0123456789", BufferType::BinaryFragment),
                (b"abcdef", BufferType::BinaryMessage),
            ],
        );
        let ws = WebSocket::with_transport(settings(4), t);
        ws.connect().unwrap();
        assert_eq!(ws.status(), SessionStatus::Connected);
        assert_eq!(ws.receive().unwrap().unwrap(), b"0123456789abcdef");
    }

    #[test]
    fn test_peer_close_returns_none() {
        let t = ScriptTransport::new(101, &[(b"", BufferType::Close)]);
        let ws = WebSocket::with_transport(settings(16), t);
        ws.connect().unwrap();
        assert_eq!(ws.receive().unwrap(), None);
        assert_eq!(ws.status(), SessionStatus::Closed);
        assert_eq!(*ws.transport.closes.lock(), 1);
        assert!(matches!(ws.receive(), Err(OvioError::InvalidState(_))));
    }

    #[test]
    fn test_redirect_reported() {
        let ws = WebSocket::with_transport(settings(16), ScriptTransport::new(302, &[]));
        assert_eq!(ws.connect(), Err(OvioError::Redirected { status: 302 }));
        assert_eq!(ws.status(), SessionStatus::Error);
    }

    #[test]
    fn test_refused_upgrade() {
        let ws = WebSocket::with_transport(settings(16), ScriptTransport::new(403, &[]));
        assert!(matches!(ws.connect(), Err(OvioError::Protocol(_))));
        assert!(matches!(ws.connect(), Err(OvioError::InvalidState(_))));
    }

    #[test]
    fn test_send_requires_connection() {
        let ws = WebSocket::with_transport(settings(16), ScriptTransport::new(101, &[]));
        assert!(matches!(ws.send_string("x"), Err(OvioError::InvalidState(_))));
        ws.close().unwrap();
        assert_eq!(ws.status(), SessionStatus::NotInitialised);

        ws.connect().unwrap();
        ws.send_string("text").unwrap();
        ws.send_buffer(&[1, 2]).unwrap();
        assert_eq!(
            *ws.transport.sent.lock(),
            vec![
                (BufferType::Utf8Message, b"text".to_vec()),
                (BufferType::BinaryMessage, vec![1, 2])
            ]
        );
        ws.close().unwrap();
        assert_eq!(ws.status(), SessionStatus::Closed);
    }

    #[test]
    fn test_async_receive_on_pool() {
        let t = ScriptTransport::new(101, &[(b"pooled", BufferType::Utf8Message)]);
        let ws = WebSocket::with_transport(settings(2), t);
        ws.connect().unwrap();

        let pool = ThreadPool::new(1, 2).unwrap();
        let handle = ws.async_receive(&pool).unwrap();
        assert!(handle.wait(WAIT).unwrap());
        assert!(handle.is_complete());
        assert_eq!(handle.take().unwrap().unwrap(), Some(b"pooled".to_vec()));
        assert!(handle.take().is_none());
    }

    /// Accept one client and answer its upgrade request with 101.
    fn accept_upgrade(listener: &TcpListener) -> (BufReader<TcpStream>, TcpStream) {
        let (stream, _) = listener.accept().unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut writer = stream;

        let mut key = String::new();
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                if name.eq_ignore_ascii_case("sec-websocket-key") {
                    key = value.trim().to_string();
                }
            }
        }
        write!(
            writer,
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\
             Connection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
            accept_key(&key)
        )
        .unwrap();
        (reader, writer)
    }

    /// Minimal RFC 6455 server: echoes one message in fragments with a
    /// ping in the middle, then closes.
    fn echo_server() -> (u16, thread::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (mut reader, mut writer) = accept_upgrade(&listener);

            let header = frame::read_header(&mut reader).unwrap();
            let mask = header.mask.expect("client frames are masked");
            let mut payload = vec![0u8; header.len as usize];
            reader.read_exact(&mut payload).unwrap();
            frame::apply_mask(&mut payload, mask, 0);

            let third = payload.len() / 3;
            let mut out = Vec::new();
            out.extend(frame::encode(Opcode::Text, false, &payload[..third], None));
            out.extend(frame::encode(Opcode::Ping, true, b"p", None));
            out.extend(frame::encode(Opcode::Continuation, false, &payload[third..2 * third], None));
            out.extend(frame::encode(Opcode::Continuation, true, &payload[2 * third..], None));
            out.extend(frame::encode(Opcode::Close, true, &frame::close_payload(CLOSE_NORMAL, "bye"), None));
            writer.write_all(&out).unwrap();

            let pong = frame::read_header(&mut reader).unwrap();
            assert_eq!(pong.opcode, Opcode::Pong);
            let mut skip = vec![0u8; pong.len as usize];
            reader.read_exact(&mut skip).unwrap();
            let close = frame::read_header(&mut reader).unwrap();
            assert_eq!(close.opcode, Opcode::Close);
            payload
        });
        (port, handle)
    }

    #[test]
    fn test_tcp_echo_round_trip() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (port, server) = echo_server();

        let ws = WebSocket::new(SessionSettings::new("127.0.0.1", port).buffer_block_size(2));
        ws.connect().unwrap();
        ws.send_string("hello world").unwrap();
        assert_eq!(ws.receive().unwrap().unwrap(), b"hello world");
        assert_eq!(ws.receive().unwrap(), None);
        assert_eq!(ws.status(), SessionStatus::Closed);

        assert_eq!(server.join().unwrap(), b"hello world");
    }

    #[test]
    fn test_close_while_receive_blocked() {
        let _ = env_logger::builder().is_test(true).try_init();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        // Upgrades, then never sends a frame; reads until the client goes away
        let server = thread::spawn(move || {
            let (mut reader, _writer) = accept_upgrade(&listener);
            let mut sink = Vec::new();
            let _ = reader.read_to_end(&mut sink);
        });

        let ws = Arc::new(WebSocket::new(SessionSettings::new("127.0.0.1", port)));
        ws.connect().unwrap();

        let receiver = {
            let ws = Arc::clone(&ws);
            thread::spawn(move || ws.receive())
        };
        thread::sleep(Duration::from_millis(200));

        let (tx, rx) = mpsc::channel();
        {
            let ws = Arc::clone(&ws);
            thread::spawn(move || {
                let _ = tx.send(ws.close());
            });
        }
        let closed = rx
            .recv_timeout(Duration::from_secs(8))
            .expect("close must not wait on the blocked receive");
        assert!(closed.is_ok());

        // The blocked read is released with an error
        assert!(receiver.join().unwrap().is_err());
        server.join().unwrap();
    }

    #[test]
    fn test_tls_unsupported() {
        let ws = WebSocket::new(SessionSettings::new("127.0.0.1", 1).secure(true));
        assert!(matches!(ws.connect(), Err(OvioError::Unsupported(_))));
        assert_eq!(ws.status(), SessionStatus::Error);
    }
}
