//! Named real-time trace sessions.
//!
//! A [`TraceSession`] starts as soon as it is built and stays active until it
//! is closed, explicitly or on drop. A session left behind by a crashed run
//! (same name, still registered with the OS) is stopped and replaced once.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::Level;
use thiserror::Error;

use super::error::{Result, TraceError};
use super::guid::Guid;
use super::native::{ControlHandle, ERROR_ALREADY_EXISTS, ERROR_WMI_INSTANCE_NOT_FOUND, SessionControl};

/// Provider verbosity (`TRACE_LEVEL_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum TraceLevel {
    None = 0,
    Critical = 1,
    Error = 2,
    Warning = 3,
    Information = 4,
    #[default]
    Verbose = 5,
}

impl TraceLevel {
    /// `TRACE_LEVEL_FATAL` is the older name of `Critical`.
    pub const FATAL: TraceLevel = TraceLevel::Critical;

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown trace level '{0}'")]
pub struct ParseLevelError(pub String);

impl FromStr for TraceLevel {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "none" => TraceLevel::None,
            "critical" | "fatal" => TraceLevel::Critical,
            "error" => TraceLevel::Error,
            "warning" => TraceLevel::Warning,
            "information" | "info" => TraceLevel::Information,
            "verbose" => TraceLevel::Verbose,
            _ => return Err(ParseLevelError(s.into())),
        })
    }
}

/// Keyword mask enabling every keyword of a provider.
pub const ALL_KEYWORDS: u64 = u64::MAX;

pub struct TraceSession {
    name: String,
    control: Arc<dyn SessionControl>,
    handle: ControlHandle,
    closed: AtomicBool,
}

impl TraceSession {
    /// Start a real-time session called `name`, replacing a stale one.
    pub fn new(name: impl Into<String>, control: Arc<dyn SessionControl>) -> Result<Self> {
        let name = name.into();
        let handle = match control.start(&name) {
            Ok(handle) => handle,
            Err(ERROR_ALREADY_EXISTS) => {
                etw_log!(Level::Warn, "session", session = name; "already exists, replacing it");
                stop_by_name(control.as_ref(), &name)?;
                control
                    .start(&name)
                    .map_err(|status| TraceError::os("start trace session", status))?
            }
            Err(status) => return Err(TraceError::os("start trace session", status)),
        };

        etw_log!(Level::Info, "session", session = name; "started");
        Ok(Self { name, control, handle, closed: AtomicBool::new(false) })
    }

    /// Start a session backed by the OS controller.
    #[cfg(windows)]
    pub fn start(name: impl Into<String>) -> Result<Self> {
        Self::new(name, Arc::new(super::native::WindowsController::default()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_active(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// Enable `provider` at `level` with every keyword.
    pub fn enable(&self, provider: &Guid, level: TraceLevel) -> Result<()> {
        self.enable_with_keywords(provider, level, ALL_KEYWORDS)
    }

    pub fn enable_with_keywords(&self, provider: &Guid, level: TraceLevel, keywords: u64) -> Result<()> {
        if !self.is_active() {
            return Err(TraceError::SessionClosed(self.name.clone()));
        }
        self.control
            .enable_provider(self.handle, provider, level.as_u8(), keywords)
            .map_err(|status| TraceError::os("enable provider", status))?;
        log::debug!("enabled {provider} on '{}' (level {level:?}, keywords {keywords:#x})", self.name);
        Ok(())
    }

    /// Stop the session. Safe to call more than once; a session the OS no
    /// longer knows counts as closed. A failed stop leaves the session active
    /// so a later `close` (or drop) tries again.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(e) = stop_by_name(self.control.as_ref(), &self.name) {
            self.closed.store(false, Ordering::Release);
            return Err(e);
        }
        etw_log!(Level::Info, "session", session = self.name; "closed");
        Ok(())
    }
}

impl Drop for TraceSession {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            etw_log!(Level::Error, "session", session = self.name; "closing on drop failed: {e}");
        }
    }
}

impl fmt::Debug for TraceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceSession")
            .field("name", &self.name)
            .field("handle", &self.handle)
            .field("active", &self.is_active())
            .finish()
    }
}

fn stop_by_name(control: &dyn SessionControl, name: &str) -> Result<()> {
    match control.stop(name) {
        Ok(()) | Err(ERROR_WMI_INSTANCE_NOT_FOUND) => Ok(()),
        Err(status) => Err(TraceError::os("stop trace session", status)),
    }
}
