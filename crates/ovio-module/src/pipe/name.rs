//! Pipe names, access descriptors and instance limits.

use ovio_core::error::{OvioError, Result};

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Prefix of fully qualified pipe names.
pub const PIPE_PREFIX: &str = r"\\.\pipe\";

/// `sun_path` capacity, including the terminating NUL.
const SUN_PATH_LEN: usize = 108;

/// Validated pipe name, stored without the `\\.\pipe\` prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipeName(String);

impl PipeName {
    /// Accepts `\\.\pipe\<name>` or a bare `<name>`.
    pub fn parse(raw: &str) -> Result<Self> {
        let bare = raw.strip_prefix(PIPE_PREFIX).unwrap_or(raw);
        if bare.is_empty() {
            return Err(OvioError::validation("pipe name is empty"));
        }
        if let Some(bad) = bare.chars().find(|c| matches!(c, '/' | '\\' | '\0')) {
            return Err(OvioError::validation(format!(
                "pipe name {:?} contains {:?}",
                raw, bad
            )));
        }
        Ok(PipeName(bare.to_string()))
    }

    /// Name without the prefix.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `\\.\pipe\<name>`
    pub fn full_name(&self) -> String {
        format!("{}{}", PIPE_PREFIX, self.0)
    }

    /// Location of the backing socket inside `dir`.
    pub fn socket_path(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(format!("ovio-pipe-{}.sock", self.0));
        if path.as_os_str().len() >= SUN_PATH_LEN {
            return Err(OvioError::validation(format!(
                "socket path for {} is too long ({} bytes)",
                self.full_name(),
                path.as_os_str().len()
            )));
        }
        Ok(path)
    }
}

impl FromStr for PipeName {
    type Err = OvioError;

    fn from_str(s: &str) -> Result<Self> {
        PipeName::parse(s)
    }
}

impl fmt::Display for PipeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", PIPE_PREFIX, self.0)
    }
}

/// Who may open the pipe: permission bits applied to the socket file,
/// written as an octal string such as `"0660"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessDescriptor {
    mode: u32,
}

impl AccessDescriptor {
    /// Owner read/write only.
    pub const fn owner_only() -> Self {
        AccessDescriptor { mode: crate::config::defaults::PIPE_ACCESS_MODE }
    }

    pub fn from_mode(mode: u32) -> Result<Self> {
        if mode > 0o777 {
            return Err(OvioError::validation(format!("access mode {:o} out of range", mode)));
        }
        Ok(AccessDescriptor { mode })
    }

    #[inline]
    pub fn mode(&self) -> u32 {
        self.mode
    }
}

impl Default for AccessDescriptor {
    fn default() -> Self {
        Self::owner_only()
    }
}

impl FromStr for AccessDescriptor {
    type Err = OvioError;

    fn from_str(s: &str) -> Result<Self> {
        let digits = s.trim();
        let digits = digits.strip_prefix("0o").unwrap_or(digits);
        let mode = u32::from_str_radix(digits, 8)
            .map_err(|_| OvioError::validation(format!("bad access descriptor {:?}", s)))?;
        Self::from_mode(mode)
    }
}

/// Maximum number of concurrent server instances sharing one name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instances {
    Limited(usize),
    Unlimited,
}

impl Instances {
    pub(crate) fn validate(self) -> Result<Self> {
        match self {
            Instances::Limited(0) => Err(OvioError::validation("max instances must be at least 1")),
            other => Ok(other),
        }
    }

    #[inline]
    pub(crate) fn admits(self, current: usize) -> bool {
        match self {
            Instances::Limited(max) => current < max,
            Instances::Unlimited => true,
        }
    }

    /// `listen` backlog for the shared socket.
    pub(crate) fn backlog(self) -> libc::c_int {
        match self {
            Instances::Limited(max) => max.min(libc::SOMAXCONN as usize) as libc::c_int,
            Instances::Unlimited => libc::SOMAXCONN,
        }
    }
}

impl fmt::Display for Instances {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instances::Limited(n) => write!(f, "{}", n),
            Instances::Unlimited => f.write_str("unlimited"),
        }
    }
}
