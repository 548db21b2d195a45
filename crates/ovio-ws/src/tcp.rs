//! `TcpTransport`: WebSocket client over plain TCP.
//!
//! The socket is split into a read half and a write half behind separate
//! locks, so one thread may sit in `receive` while another sends. Reads
//! answer pings through the write half; lock order is read, then write.

use crate::frame::{self, Opcode, CLOSE_NORMAL};
use crate::handshake::{self, Response};
use crate::settings::SessionSettings;
use crate::transport::{BufferType, HttpTransport};

use ovio_core::error::{OvioError, Result};

use parking_lot::Mutex;
use std::io::{BufReader, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// How long `close` waits for the peer's close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

struct ReadHalf {
    stream: BufReader<TcpStream>,
    /// Payload bytes left in the current data frame
    remaining: u64,
    fin: bool,
    mask: Option<[u8; 4]>,
    /// Position within the current frame's payload, for unmasking
    offset: usize,
    /// Opcode of the message being delivered
    message: Option<Opcode>,
    closed: bool,
}

struct WriteHalf {
    stream: TcpStream,
    close_sent: bool,
    /// Opcode of an outgoing fragmented message
    fragmenting: Option<Opcode>,
}

impl WriteHalf {
    fn send_frame(&mut self, opcode: Opcode, fin: bool, payload: &[u8]) -> Result<()> {
        let bytes = frame::encode(opcode, fin, payload, Some(rand::random()));
        self.stream.write_all(&bytes)?;
        Ok(())
    }

    fn send_close(&mut self, payload: &[u8]) -> Result<()> {
        if self.close_sent {
            return Ok(());
        }
        self.close_sent = true;
        self.send_frame(Opcode::Close, true, payload)
    }
}

#[derive(Default)]
struct Handshake {
    settings: Option<SessionSettings>,
    key: Option<String>,
    response: Option<Response>,
}

#[derive(Default)]
pub struct TcpTransport {
    reader: Mutex<Option<ReadHalf>>,
    writer: Mutex<Option<WriteHalf>>,
    handshake: Mutex<Handshake>,
    upgraded: AtomicBool,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn require_upgraded(&self) -> Result<()> {
        if !self.upgraded.load(Ordering::Acquire) {
            return Err(OvioError::invalid_state("websocket upgrade not complete"));
        }
        Ok(())
    }

    fn with_writer<R>(&self, f: impl FnOnce(&mut WriteHalf) -> Result<R>) -> Result<R> {
        let mut guard = self.writer.lock();
        let writer = guard
            .as_mut()
            .ok_or_else(|| OvioError::invalid_state("transport is not open"))?;
        f(writer)
    }

    /// Shut the socket down through the write half. A read blocked on
    /// another thread fails and releases the reader lock.
    fn shutdown_socket(&self) {
        if let Some(w) = self.writer.lock().as_ref() {
            if let Err(err) = w.stream.shutdown(Shutdown::Both) {
                log::debug!("websocket: shutdown failed: {}", err);
            }
        }
    }

    /// Read one control frame payload, unmasked.
    fn read_control(reader: &mut ReadHalf, header: &frame::FrameHeader) -> Result<Vec<u8>> {
        let mut payload = vec![0u8; header.len as usize];
        reader.stream.read_exact(&mut payload)?;
        if let Some(mask) = header.mask {
            frame::apply_mask(&mut payload, mask, 0);
        }
        Ok(payload)
    }

    fn next_chunk(&self, reader: &mut ReadHalf, buf: &mut [u8]) -> Result<(usize, BufferType)> {
        if reader.closed {
            return Ok((0, BufferType::Close));
        }
        loop {
            if reader.remaining == 0 {
                let header = frame::read_header(&mut reader.stream)?;
                match header.opcode {
                    Opcode::Ping => {
                        let payload = Self::read_control(reader, &header)?;
                        self.with_writer(|w| {
                            if w.close_sent {
                                return Ok(());
                            }
                            w.send_frame(Opcode::Pong, true, &payload)
                        })?;
                        continue;
                    }
                    Opcode::Pong => {
                        Self::read_control(reader, &header)?;
                        continue;
                    }
                    Opcode::Close => {
                        let payload = Self::read_control(reader, &header)?;
                        reader.closed = true;
                        let echo = if payload.len() >= 2 { payload[..2].to_vec() } else { Vec::new() };
                        self.with_writer(|w| w.send_close(&echo))?;
                        log::debug!("websocket: peer closed ({} byte payload)", payload.len());
                        return Ok((0, BufferType::Close));
                    }
                    Opcode::Text | Opcode::Binary => {
                        if reader.message.is_some() {
                            return Err(OvioError::protocol("new message inside a fragmented one"));
                        }
                        reader.message = Some(header.opcode);
                    }
                    Opcode::Continuation => {
                        if reader.message.is_none() {
                            return Err(OvioError::protocol("continuation without a message"));
                        }
                    }
                }
                reader.remaining = header.len;
                reader.fin = header.fin;
                reader.mask = header.mask;
                reader.offset = 0;

                if header.len == 0 {
                    if !header.fin {
                        continue;
                    }
                    // Empty final frame ends the message
                    let text = reader.message.take() == Some(Opcode::Text);
                    return Ok((0, if text { BufferType::Utf8Message } else { BufferType::BinaryMessage }));
                }
            }

            let text = reader.message == Some(Opcode::Text);
            let n = (buf.len() as u64).min(reader.remaining) as usize;
            reader.stream.read_exact(&mut buf[..n])?;
            if let Some(mask) = reader.mask {
                frame::apply_mask(&mut buf[..n], mask, reader.offset);
            }
            reader.offset += n;
            reader.remaining -= n as u64;

            let last = reader.remaining == 0 && reader.fin;
            if last {
                reader.message = None;
            }
            let kind = match (text, last) {
                (true, true) => BufferType::Utf8Message,
                (true, false) => BufferType::Utf8Fragment,
                (false, true) => BufferType::BinaryMessage,
                (false, false) => BufferType::BinaryFragment,
            };
            return Ok((n, kind));
        }
    }
}

impl HttpTransport for TcpTransport {
    fn open(&self, settings: &SessionSettings) -> Result<()> {
        if settings.secure || settings.client_certificate.is_some() {
            return Err(OvioError::Unsupported(
                "TLS sessions require an external TLS provider".into(),
            ));
        }
        settings.validate()?;
        if settings.ignore_cert_errors {
            log::debug!("websocket: ignore_cert_errors has no effect on plain TCP");
        }

        let mut last_err = None;
        let mut stream = None;
        for addr in (settings.host.as_str(), settings.port).to_socket_addrs()? {
            match TcpStream::connect(addr) {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }
        let stream = match (stream, last_err) {
            (Some(s), _) => s,
            (None, Some(e)) => return Err(e.into()),
            (None, None) => {
                return Err(OvioError::validation(format!("{} did not resolve", settings.host)))
            }
        };
        stream.set_nodelay(true)?;

        let write = stream.try_clone()?;
        *self.reader.lock() = Some(ReadHalf {
            stream: BufReader::new(stream),
            remaining: 0,
            fin: true,
            mask: None,
            offset: 0,
            message: None,
            closed: false,
        });
        *self.writer.lock() = Some(WriteHalf { stream: write, close_sent: false, fragmenting: None });
        self.handshake.lock().settings = Some(settings.clone());
        log::debug!("websocket: connected to {}:{}", settings.host, settings.port);
        Ok(())
    }

    fn send_upgrade_request(&self, path: &str) -> Result<()> {
        let request = {
            let mut hs = self.handshake.lock();
            let settings = hs
                .settings
                .as_ref()
                .ok_or_else(|| OvioError::invalid_state("transport is not open"))?;
            let key = handshake::generate_key();
            let request = handshake::build_request(settings, path, &key);
            hs.key = Some(key);
            request
        };
        self.with_writer(|w| {
            w.stream.write_all(request.as_bytes())?;
            Ok(())
        })
    }

    fn receive_response(&self) -> Result<u16> {
        let response = {
            let mut guard = self.reader.lock();
            let reader = guard
                .as_mut()
                .ok_or_else(|| OvioError::invalid_state("transport is not open"))?;
            handshake::read_response(&mut reader.stream)?
        };
        let status = response.status;
        self.handshake.lock().response = Some(response);
        Ok(status)
    }

    fn complete_upgrade(&self) -> Result<()> {
        let hs = self.handshake.lock();
        match (&hs.response, &hs.key) {
            (Some(response), Some(key)) => response.verify_upgrade(key)?,
            _ => return Err(OvioError::invalid_state("no upgrade response to complete")),
        }
        self.upgraded.store(true, Ordering::Release);
        Ok(())
    }

    fn send(&self, kind: BufferType, data: &[u8]) -> Result<()> {
        self.require_upgraded()?;
        self.with_writer(|w| {
            if w.close_sent {
                return Err(OvioError::invalid_state("close already sent"));
            }
            let (base, fin) = match kind {
                BufferType::Utf8Message => (Opcode::Text, true),
                BufferType::BinaryMessage => (Opcode::Binary, true),
                BufferType::Utf8Fragment => (Opcode::Text, false),
                BufferType::BinaryFragment => (Opcode::Binary, false),
                BufferType::Close => {
                    return w.send_close(&frame::close_payload(CLOSE_NORMAL, ""));
                }
            };
            let opcode = match (w.fragmenting, fin) {
                (Some(_), true) => {
                    w.fragmenting = None;
                    Opcode::Continuation
                }
                (Some(_), false) => Opcode::Continuation,
                (None, true) => base,
                (None, false) => {
                    w.fragmenting = Some(base);
                    base
                }
            };
            w.send_frame(opcode, fin, data)
        })
    }

    fn receive(&self, buf: &mut [u8]) -> Result<(usize, BufferType)> {
        self.require_upgraded()?;
        if buf.is_empty() {
            return Err(OvioError::validation("receive buffer is empty"));
        }
        let mut guard = self.reader.lock();
        let reader = guard
            .as_mut()
            .ok_or_else(|| OvioError::invalid_state("transport is closed"))?;
        self.next_chunk(reader, buf)
    }

    fn close(&self) -> Result<()> {
        if self.upgraded.load(Ordering::Acquire) {
            let sent = {
                let mut guard = self.writer.lock();
                match guard.as_mut() {
                    Some(w) => w.send_close(&frame::close_payload(CLOSE_NORMAL, "")),
                    None => Ok(()),
                }
            };
            if let Err(err) = sent {
                log::debug!("websocket: close frame not sent: {}", err);
            }

            // A receive in flight on another thread will see the reply itself
            match self.reader.try_lock_for(CLOSE_TIMEOUT) {
                Some(mut guard) => {
                    if let Some(reader) = guard.as_mut() {
                        let _ = reader.stream.get_ref().set_read_timeout(Some(CLOSE_TIMEOUT));
                        let mut scratch = [0u8; 512];
                        while !reader.closed {
                            match self.next_chunk(reader, &mut scratch) {
                                Ok((_, BufferType::Close)) => break,
                                Ok(_) => continue,
                                Err(err) => {
                                    log::debug!("websocket: close handshake cut short: {}", err);
                                    break;
                                }
                            }
                        }
                    }
                }
                None => self.shutdown_socket(),
            }
        } else if self.reader.try_lock().is_none() {
            // Handshake read in flight
            self.shutdown_socket();
        }

        let reader = self.reader.lock().take();
        let writer = self.writer.lock().take();
        if let Some(w) = &writer {
            let _ = w.stream.shutdown(Shutdown::Both);
        }
        drop(reader);
        drop(writer);
        self.upgraded.store(false, Ordering::Release);
        Ok(())
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("upgraded", &self.upgraded.load(Ordering::Relaxed))
            .finish()
    }
}
