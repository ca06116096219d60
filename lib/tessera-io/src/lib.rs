//! I/O primitives for shipping encoded payloads to a remote store: admission control, compression, and transports.
#![deny(missing_docs)]

pub mod bulkhead;
pub mod compression;
pub mod net;
pub mod telemetry;
