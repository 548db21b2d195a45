//! Shared-memory storage for named signals
//!
//! A named signal is one page under `/dev/shm`, mapped `MAP_SHARED` by
//! every process that opens it. The header records the reset mode so
//! `open_named` can recover it.

use crate::error::{OvioError, Result};
use crate::signal::ResetMode;

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

const MAGIC: u32 = 0x4f56_5347; // "OVSG"
const PAGE: usize = 4096;
const SHM_DIR: &str = "/dev/shm";

#[repr(C)]
struct SharedLayout {
    magic: AtomicU32,
    mode: AtomicU32,
    word: AtomicU32,
}

pub(super) struct SharedMapping {
    ptr: NonNull<SharedLayout>,
    _file: File,
}

// Safety: the mapping only exposes atomics and is unmapped exactly once.
unsafe impl Send for SharedMapping {}
unsafe impl Sync for SharedMapping {}

pub(super) fn shm_path(name: &str) -> Result<PathBuf> {
    if name.is_empty() || name.contains('/') || name.contains('\0') {
        return Err(OvioError::validation(format!("invalid signal name {:?}", name)));
    }
    Ok(PathBuf::from(SHM_DIR).join(format!("ovio-signal-{}", name)))
}

impl SharedMapping {
    /// Create the named page, or attach to it when it already exists.
    pub(super) fn create(name: &str, mode: ResetMode, initially_signaled: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o600)
            .open(shm_path(name)?)?;
        if file.metadata()?.len() < PAGE as u64 {
            file.set_len(PAGE as u64)?;
        }
        let mapping = Self::map(file)?;
        let layout = mapping.layout();
        if layout.magic.load(Ordering::Acquire) != MAGIC {
            layout.mode.store(mode as u32, Ordering::Relaxed);
            layout.word.store(initially_signaled as u32, Ordering::Relaxed);
            layout.magic.store(MAGIC, Ordering::Release);
        }
        Ok(mapping)
    }

    /// Attach to an existing named page.
    pub(super) fn open(name: &str) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(shm_path(name)?)?;
        if file.metadata()?.len() < PAGE as u64 {
            return Err(OvioError::invalid_state(format!("signal {:?} is not initialised", name)));
        }
        let mapping = Self::map(file)?;
        if mapping.layout().magic.load(Ordering::Acquire) != MAGIC {
            return Err(OvioError::invalid_state(format!("signal {:?} is not initialised", name)));
        }
        Ok(mapping)
    }

    fn map(file: File) -> Result<Self> {
        // Safety: fresh shared mapping of a file we hold open.
        let raw = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                PAGE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(OvioError::last_os_error("mmap named signal"));
        }
        let ptr = NonNull::new(raw as *mut SharedLayout)
            .ok_or_else(|| OvioError::last_os_error("mmap named signal"))?;
        Ok(Self { ptr, _file: file })
    }

    #[inline]
    fn layout(&self) -> &SharedLayout {
        // Safety: page-aligned mapping of at least PAGE bytes, live until drop.
        unsafe { self.ptr.as_ref() }
    }

    #[inline]
    pub(super) fn word(&self) -> &AtomicU32 {
        &self.layout().word
    }

    pub(super) fn mode(&self) -> ResetMode {
        ResetMode::from(self.layout().mode.load(Ordering::Relaxed))
    }
}

impl Drop for SharedMapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, PAGE);
        }
    }
}
