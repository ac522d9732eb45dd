// src/etw/error.rs
//! All the ways decoding and trace control can go wrong.
//!
//! Decode errors describe a malformed or mismatched property access and never
//! carry an OS status; they stay local to the access that produced them.
//! OS-operation and delivery errors carry the Win32 status for diagnostics.

use thiserror::Error;

use super::native::Status;

/// Schema / property access failures detected by this crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("incorrect property type {in_type} for {target}")]
    IncorrectType { in_type: u16, target: &'static str },

    #[error("invalid property value size: {actual} bytes for type {in_type}")]
    InvalidSize { in_type: u16, actual: usize },

    #[error("property '{0}' was not found in event")]
    PropertyNotFound(String),

    #[error("expected single-value property, got array of {0} elements")]
    ExpectedSingleValue(u32),

    #[error("expected single-value struct member, got array of {0} elements")]
    ExpectedSingleMember(u32),

    #[error("array index {index} out of bounds (length {len})")]
    IndexOutOfBounds { index: u32, len: u32 },

    #[error("expected struct property, got single-value property")]
    ExpectedStruct,

    #[error("expected single-value property, got struct")]
    UnexpectedStruct,

    #[error("event has no properties, only a unicode string; use event_string()")]
    StringOnly,

    #[error("property index {index} out of range ({count} properties)")]
    IndexOutOfRange { index: u32, count: u32 },

    #[error("invalid FILETIME value {0:#x}")]
    InvalidFileTime(u64),

    #[error("invalid SYSTEMTIME value")]
    InvalidSystemTime,

    #[error("malformed event schema: {0}")]
    MalformedSchema(&'static str),
}

/// Failures surfaced by sessions, traces and OS-backed decoding steps.
#[derive(Debug, Error)]
pub enum TraceError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("{op} failed with status {status}")]
    Os { op: &'static str, status: Status },

    #[error("trace delivery loop terminated with status {0}")]
    Delivery(Status),

    #[error("trace handle is not open")]
    NotOpen,

    #[error("trace session '{0}' is closed")]
    SessionClosed(String),

    #[error("no provider registered as '{0}'")]
    ProviderNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TraceError {
    pub(crate) fn os(op: &'static str, status: Status) -> Self {
        TraceError::Os { op, status }
    }

    /// OS status code attached to this error, if any.
    pub fn status(&self) -> Option<Status> {
        match self {
            TraceError::Os { status, .. } | TraceError::Delivery(status) => Some(*status),
            _ => None,
        }
    }
}

pub type Result<T, E = TraceError> = std::result::Result<T, E>;
