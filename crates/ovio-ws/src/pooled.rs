//! `PooledTransport`: callback-driven transport over a dispatcher.
//!
//! Each stage runs the matching blocking [`TcpTransport`] call as a job on
//! the dispatcher (normally a `ThreadPool`), then reports the outcome
//! through the registered [`StatusCallback`]. A pending `receive` holds a
//! worker for as long as the peer is silent, so a pool that must send
//! while receiving needs at least two workers.

use crate::settings::SessionSettings;
use crate::tcp::TcpTransport;
use crate::transport::{
    AsyncHttpTransport, BufferType, HttpTransport, RequestStage, StatusCallback, StatusEvent,
};

use ovio_core::dispatch::Dispatcher;
use ovio_core::error::{OvioError, Result};

use parking_lot::Mutex;
use std::sync::Arc;

pub struct PooledTransport {
    inner: Arc<TcpTransport>,
    dispatcher: Arc<dyn Dispatcher>,
    callback: Mutex<Option<(u64, StatusCallback)>>,
}

impl PooledTransport {
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            inner: Arc::new(TcpTransport::new()),
            dispatcher,
            callback: Mutex::new(None),
        }
    }

    /// Run `work` on the dispatcher and deliver its event.
    fn stage<F>(&self, stage: RequestStage, work: F) -> Result<()>
    where
        F: FnOnce(&TcpTransport) -> Result<StatusEvent> + Send + 'static,
    {
        let (context, callback) = self
            .callback
            .lock()
            .clone()
            .ok_or_else(|| OvioError::invalid_state("no status callback registered"))?;
        let inner = Arc::clone(&self.inner);
        self.dispatcher.dispatch(Box::new(move || {
            let event = work(&inner).unwrap_or_else(|error| {
                log::debug!("pooled transport: {} failed: {}", stage, error);
                StatusEvent::RequestError { stage, error }
            });
            callback(context, event);
        }))
    }
}

impl AsyncHttpTransport for PooledTransport {
    fn set_callback(&self, context: u64, callback: StatusCallback) {
        *self.callback.lock() = Some((context, callback));
    }

    fn open(&self, settings: &SessionSettings) -> Result<()> {
        self.inner.open(settings)
    }

    fn send_request(&self, path: &str) -> Result<()> {
        let path = path.to_string();
        self.stage(RequestStage::SendRequest, move |t| {
            t.send_upgrade_request(&path).map(|()| StatusEvent::RequestSent)
        })
    }

    fn receive_response(&self) -> Result<()> {
        self.stage(RequestStage::ReceiveResponse, |t| {
            t.receive_response().map(|status| StatusEvent::HeadersAvailable { status })
        })
    }

    fn complete_upgrade(&self) -> Result<()> {
        self.stage(RequestStage::Upgrade, |t| {
            t.complete_upgrade().map(|()| StatusEvent::UpgradeComplete)
        })
    }

    fn receive(&self, max_len: usize) -> Result<()> {
        if max_len == 0 {
            return Err(OvioError::validation("receive length must be non-zero"));
        }
        self.stage(RequestStage::ReadData, move |t| {
            let mut data = vec![0u8; max_len];
            let (n, buffer_type) = t.receive(&mut data)?;
            data.truncate(n);
            Ok(StatusEvent::ReadComplete { data, buffer_type })
        })
    }

    fn send(&self, kind: BufferType, data: Vec<u8>) -> Result<()> {
        self.stage(RequestStage::WriteData, move |t| {
            t.send(kind, &data).map(|()| StatusEvent::WriteComplete { bytes: data.len() })
        })
    }

    fn close(&self) -> Result<()> {
        self.stage(RequestStage::Close, |t| t.close().map(|()| StatusEvent::CloseComplete))
    }
}

impl std::fmt::Debug for PooledTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledTransport").field("inner", &self.inner).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ovio_core::dispatch::InlineDispatcher;
    use std::sync::mpsc;

    #[test]
    fn test_stage_without_callback_rejected() {
        let t = PooledTransport::new(Arc::new(InlineDispatcher));
        assert!(matches!(t.receive_response(), Err(OvioError::InvalidState(_))));
    }

    #[test]
    fn test_failed_stage_reports_request_error() {
        let t = PooledTransport::new(Arc::new(InlineDispatcher));
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        t.set_callback(
            42,
            Arc::new(move |ctx, event| {
                let _ = tx.lock().send((ctx, event));
            }),
        );

        // Never opened: the stage starts, then fails
        t.send_request("/").unwrap();
        let (ctx, event) = rx.recv().unwrap();
        assert_eq!(ctx, 42);
        match event {
            StatusEvent::RequestError { stage, error } => {
                assert_eq!(stage, RequestStage::SendRequest);
                assert!(matches!(error, OvioError::InvalidState(_)));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_zero_length_receive_not_started() {
        let t = PooledTransport::new(Arc::new(InlineDispatcher));
        t.set_callback(0, Arc::new(|_, _| panic!("no event expected")));
        assert!(matches!(t.receive(0), Err(OvioError::Validation(_))));
    }
}
