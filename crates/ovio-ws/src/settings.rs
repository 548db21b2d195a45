//! Per-session configuration.

use ovio_core::env::env_get;
use ovio_core::error::{OvioError, Result};

/// Receive buffer growth step when `OVIO_WS_BUFFER_BLOCK` is unset.
pub const DEFAULT_BUFFER_BLOCK: usize = 2048;

pub const DEFAULT_USER_AGENT: &str = concat!("ovio-ws/", env!("CARGO_PKG_VERSION"));

/// Reference to a client certificate held by an external store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCertificate {
    pub store: String,
    pub subject: String,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub user_agent: String,
    pub host: String,
    pub port: u16,
    /// Request path used by `connect()`
    pub path: String,
    pub ignore_cert_errors: bool,
    /// Extra request headers, sent in order
    pub headers: Vec<(String, String)>,
    pub client_certificate: Option<ClientCertificate>,
    /// Receive buffers start at, and grow by, this many bytes
    pub buffer_block_size: usize,
    pub secure: bool,
}

impl SessionSettings {
    /// Plain-TCP session to `host:port` at `/`.
    ///
    /// - `OVIO_WS_BUFFER_BLOCK` - Receive buffer block size
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            host: host.into(),
            port,
            path: "/".to_string(),
            ignore_cert_errors: false,
            headers: Vec::new(),
            client_certificate: None,
            buffer_block_size: env_get("OVIO_WS_BUFFER_BLOCK", DEFAULT_BUFFER_BLOCK),
            secure: false,
        }
    }

    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = agent.into();
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn ignore_cert_errors(mut self, ignore: bool) -> Self {
        self.ignore_cert_errors = ignore;
        self
    }

    pub fn client_certificate(mut self, cert: ClientCertificate) -> Self {
        self.client_certificate = Some(cert);
        self
    }

    pub fn buffer_block_size(mut self, size: usize) -> Self {
        self.buffer_block_size = size;
        self
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(OvioError::validation("session host is empty"));
        }
        if self.buffer_block_size == 0 {
            return Err(OvioError::validation("buffer block size must be non-zero"));
        }
        if let Some((name, _)) = self
            .headers
            .iter()
            .find(|(n, v)| n.is_empty() || n.contains([':', '\r', '\n']) || v.contains(['\r', '\n']))
        {
            return Err(OvioError::validation(format!("malformed header {:?}", name)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_builders() {
        let s = SessionSettings::new("example.net", 8080)
            .path("/chat")
            .header("X-Trace", "1")
            .buffer_block_size(16);
        assert_eq!(s.path, "/chat");
        assert_eq!(s.headers, vec![("X-Trace".to_string(), "1".to_string())]);
        assert!(!s.secure);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_zero_block_rejected() {
        let s = SessionSettings::new("h", 1).buffer_block_size(0);
        assert!(matches!(s.validate(), Err(OvioError::Validation(_))));
    }

    #[test]
    fn test_header_injection_rejected() {
        let s = SessionSettings::new("h", 1).header("X-A", "v\r\nEvil: 1");
        assert!(s.validate().is_err());
        let s = SessionSettings::new("h", 1).header("Bad:Name", "v");
        assert!(s.validate().is_err());
    }
}
