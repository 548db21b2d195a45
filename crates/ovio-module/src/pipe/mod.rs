//! # Named pipes
//!
//! Message-oriented duplex channels addressed by name (`\\.\pipe\<name>`).
//! A name maps to an `AF_UNIX` `SOCK_SEQPACKET` socket file in the pipe
//! directory, so message boundaries are kept by the kernel: every write is
//! one message and every read returns at most one.
//!
//! Both ends come in two flavours selected by an [`IoStrategy`]:
//!
//! | Strategy       | `connect`          | `read`         | `write`        |
//! |----------------|--------------------|----------------|----------------|
//! | [`Blocking`]   | `()`               | `Vec<u8>`      | `usize`        |
//! | [`Overlapped`] | `PendingOperation` | `OverlappedIo` | `OverlappedIo` |
//!
//! Several server instances may share one name up to the limit given at
//! creation; each accepts one client at a time.

mod channel;
mod client;
mod name;
mod registry;
mod server;
mod strategy;
mod sys;

pub use channel::ChannelCore;
pub use client::NamedPipeClient;
pub use name::{AccessDescriptor, Instances, PipeName, PIPE_PREFIX};
pub use server::{BlockingPipeServer, NamedPipeServer, OverlappedPipeServer, PipeConfig};
pub use strategy::{Blocking, IoStrategy, Overlapped};

pub type BlockingPipeClient = NamedPipeClient<Blocking>;
pub type OverlappedPipeClient = NamedPipeClient<Overlapped>;

#[cfg(test)]
mod tests {
    use super::*;
    use ovio_core::error::OvioError;
    use ovio_core::state::{ChannelState, OpStatus};
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    const WAIT: Option<Duration> = Some(Duration::from_secs(5));

    fn config(dir: &tempfile::TempDir, name: &str) -> PipeConfig {
        PipeConfig::new(name).unwrap().socket_dir(dir.path())
    }

    #[test]
    fn test_blocking_round_trip() {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().unwrap();
        let server = Arc::new(BlockingPipeServer::create(config(&dir, "echo")).unwrap());

        let srv = Arc::clone(&server);
        let handle = thread::spawn(move || {
            srv.connect().unwrap();
            let request = srv.read(64).unwrap();
            srv.write(&request.to_ascii_uppercase()).unwrap();
        });

        let client = BlockingPipeClient::connect_in(dir.path(), r"\\.\pipe\echo", WAIT).unwrap();
        assert_eq!(client.write(b"ping").unwrap(), 4);
        assert_eq!(client.read(64).unwrap(), b"PING");
        handle.join().unwrap();
        assert_eq!(server.state(), ChannelState::Connected);
    }

    #[test]
    fn test_overlapped_connect_write_read() {
        let dir = tempfile::tempdir().unwrap();
        let server = OverlappedPipeServer::create(config(&dir, "ovl")).unwrap();

        let accept = server.connect().unwrap();
        assert_eq!(server.state(), ChannelState::Listening);

        let client = OverlappedPipeClient::connect_in(dir.path(), "ovl", WAIT).unwrap();
        assert!(accept.wait_for_completion(WAIT).unwrap());
        assert_eq!(accept.status(), OpStatus::Complete);
        assert_eq!(server.state(), ChannelState::Connected);

        let read = server.read(64).unwrap();
        let write = client.write(b"hello, pipe").unwrap();
        assert!(write.wait_for_completion(WAIT).unwrap());
        assert_eq!(write.bytes_transferred(), 11);

        assert!(read.wait_for_completion(WAIT).unwrap());
        assert_eq!(read.data(), b"hello, pipe");
        assert!(!read.is_partial());
    }

    #[test]
    fn test_instance_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = BlockingPipeServer::create(config(&dir, "solo")).unwrap();
        let err = BlockingPipeServer::create(config(&dir, "solo")).unwrap_err();
        assert!(matches!(err, OvioError::ChannelBusy(_)));

        first.close();
        first.close();
        assert_eq!(first.state(), ChannelState::Closed);
        assert!(matches!(first.connect(), Err(OvioError::InvalidState(_))));
        let _again = BlockingPipeServer::create(config(&dir, "solo")).unwrap();
    }

    #[test]
    fn test_two_instances_serve_two_clients() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir, "pair").max_instances(Instances::Limited(2));
        let a = BlockingPipeServer::create(cfg.clone()).unwrap();
        let b = BlockingPipeServer::create(cfg).unwrap();

        let c1 = BlockingPipeClient::connect_in(dir.path(), "pair", WAIT).unwrap();
        let c2 = BlockingPipeClient::connect_in(dir.path(), "pair", WAIT).unwrap();
        a.connect().unwrap();
        b.connect().unwrap();

        c1.write(b"one").unwrap();
        c2.write(b"two").unwrap();
        let mut got = vec![a.read(16).unwrap(), b.read(16).unwrap()];
        got.sort();
        assert_eq!(got, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn test_overlapped_partial_read_keeps_remainder() {
        let dir = tempfile::tempdir().unwrap();
        let server = OverlappedPipeServer::create(config(&dir, "partial")).unwrap();
        let accept = server.connect().unwrap();
        let client = BlockingPipeClient::connect_in(dir.path(), "partial", WAIT).unwrap();
        accept.wait_for_completion(WAIT).unwrap();

        client.write(b"abcdefghij").unwrap();
        client.write(b"next").unwrap();

        let first = server.read(4).unwrap();
        assert!(first.wait_for_completion(WAIT).unwrap());
        assert_eq!(first.data(), b"abcd");
        assert!(first.is_partial());
        assert_eq!(server.unread_bytes().unwrap(), 6 + 4);

        let second = server.read(4).unwrap();
        assert!(second.is_complete());
        assert_eq!(second.data(), b"efgh");
        assert!(second.is_partial());

        let third = server.read(4).unwrap();
        assert_eq!(third.data(), b"ij");
        assert!(!third.is_partial());

        let fourth = server.read(64).unwrap();
        assert!(fourth.wait_for_completion(WAIT).unwrap());
        assert_eq!(fourth.data(), b"next");
    }

    #[test]
    fn test_blocking_read_grows_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let server = BlockingPipeServer::create(config(&dir, "grow")).unwrap();
        let client = BlockingPipeClient::connect_in(dir.path(), "grow", WAIT).unwrap();
        server.connect().unwrap();

        let big: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        client.write(&big).unwrap();
        assert_eq!(server.unread_bytes().unwrap(), 5000);
        assert_eq!(server.read(16).unwrap(), big);
    }

    #[test]
    fn test_oversized_message_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let server = BlockingPipeServer::create(config(&dir, "cap").max_message(16)).unwrap();
        let client = BlockingPipeClient::connect_in(dir.path(), "cap", WAIT).unwrap();
        server.connect().unwrap();

        client.write(&[1u8; 32]).unwrap();
        client.write(b"small").unwrap();
        assert!(matches!(server.read(64), Err(OvioError::Capacity(_))));
        assert_eq!(server.read(64).unwrap(), b"small");
        assert!(matches!(server.write(&[0u8; 17]), Err(OvioError::Capacity(_))));
    }

    #[test]
    fn test_empty_write_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let server = BlockingPipeServer::create(config(&dir, "empty")).unwrap();
        let client = BlockingPipeClient::connect_in(dir.path(), "empty", WAIT).unwrap();
        server.connect().unwrap();
        assert!(matches!(client.write(b""), Err(OvioError::Validation(_))));
        assert!(matches!(server.write(b""), Err(OvioError::Validation(_))));
    }

    #[test]
    fn test_disconnect_severs_pending_read() {
        let dir = tempfile::tempdir().unwrap();
        let server = OverlappedPipeServer::create(config(&dir, "sever")).unwrap();
        let accept = server.connect().unwrap();
        let client = BlockingPipeClient::connect_in(dir.path(), "sever", WAIT).unwrap();
        accept.wait_for_completion(WAIT).unwrap();

        let read = server.read(64).unwrap();
        assert_eq!(read.status(), OpStatus::Pending);
        server.disconnect().unwrap();
        assert!(read.wait_for_completion(WAIT).unwrap());
        assert_eq!(read.error(), Some(OvioError::Aborted));
        assert_eq!(server.state(), ChannelState::Disconnected);
        assert!(matches!(server.read(8), Err(OvioError::InvalidState(_))));
        drop(client);

        let accept = server.connect().unwrap();
        let client = BlockingPipeClient::connect_in(dir.path(), "sever", WAIT).unwrap();
        assert!(accept.wait_for_completion(WAIT).unwrap());
        client.write(b"back").unwrap();
        let read = server.read(64).unwrap();
        read.wait_for_completion(WAIT).unwrap();
        assert_eq!(read.data(), b"back");
    }

    #[test]
    fn test_disconnect_aborts_blocking_connect() {
        let dir = tempfile::tempdir().unwrap();
        let server = Arc::new(BlockingPipeServer::create(config(&dir, "abort")).unwrap());
        let srv = Arc::clone(&server);
        let handle = thread::spawn(move || srv.connect());

        while server.state() != ChannelState::Listening {
            thread::sleep(Duration::from_millis(1));
        }
        server.disconnect().unwrap();
        assert_eq!(handle.join().unwrap().unwrap_err(), OvioError::Aborted);
        assert_eq!(server.state(), ChannelState::Disconnected);
    }

    #[test]
    fn test_peer_close_is_broken_channel() {
        let dir = tempfile::tempdir().unwrap();
        let server = BlockingPipeServer::create(config(&dir, "gone")).unwrap();
        let client = BlockingPipeClient::connect_in(dir.path(), "gone", WAIT).unwrap();
        server.connect().unwrap();

        client.close();
        assert_eq!(client.state(), ChannelState::Closed);
        assert!(matches!(server.read(8), Err(OvioError::BrokenChannel(_))));
        assert!(matches!(server.write(b"x"), Err(OvioError::BrokenChannel(_))));
    }

    #[test]
    fn test_access_mode_applied() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir, "perm").access("0640".parse().unwrap());
        let server = BlockingPipeServer::create(cfg).unwrap();

        let path = server.name().socket_path(dir.path()).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o640);

        drop(server);
        assert!(!path.exists());
    }

    #[test]
    fn test_connect_missing_pipe() {
        let dir = tempfile::tempdir().unwrap();
        let err = BlockingPipeClient::connect_in(dir.path(), "nobody", Some(Duration::ZERO)).unwrap_err();
        assert_eq!(err.code(), libc::ENOENT);
    }
}
