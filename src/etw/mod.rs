//! Real-time ETW consumption with schema-driven decoding.
//!
//! Layers, bottom-up:
//! - `native`     OS seams (record, session control, consumer) + Win32 impl.
//! - `tdh`        parsed `TRACE_EVENT_INFO` blobs.
//! - `schema`     per-record schema, property lookup and typed access.
//! - `property` / `convert`  raw values and their typed conversions.
//! - `render`     human-readable dump of a whole record.
//! - `sessions`   named sessions and provider enabling.
//! - `trace` / `dispatch`  delivery loop lifecycle and listener fan-out.
//! - `providers`  registered provider name ↔ GUID lookup.

pub mod convert;
pub mod dispatch;
pub mod error;
pub mod guid;
pub mod native;
pub mod property;
pub mod providers;
mod render;
pub mod schema;
pub mod sessions;
pub mod tdh;
pub mod trace;

pub use convert::{AnsiChar, AnsiString, FromProperty, Pointer, SizeT, WideChar};
pub use dispatch::{Dispatcher, Subscription};
pub use error::{DecodeError, Result, TraceError};
pub use guid::{EVENT_TRACE_GUID, Guid, GuidParseError};
pub use native::{EventDescriptor, EventHeader, EventRecord, RecordSink, SessionControl, Status, TraceConsumer};
pub use property::PropertyValue;
pub use providers::ProviderList;
pub use schema::{EventSchema, EventStructure};
pub use sessions::{ALL_KEYWORDS, ParseLevelError, TraceLevel, TraceSession};
pub use tdh::InType;
pub use trace::{DEFAULT_JOIN_TIMEOUT, StopHandle, StopOutcome, Trace};
