//! Continuous archiver and query server for a Fast Acquisition BPM
//! telemetry stream: a frame source feeds a circular buffer, a disk
//! writer transforms and archives major blocks, a decimator maintains a
//! second low-rate live buffer, and a socket server answers historical
//! queries and live subscriptions against both (spec.md section 2).

#[macro_use]
extern crate failure_derive;
#[macro_use]
extern crate log;

pub mod archive;
pub mod block;
mod buffer;
mod config;
mod decimate;
mod error;
mod mask;
mod query;
pub mod raw;
mod source;
mod subscribe;
mod sync;
mod transform;

pub use archive::ArchiveContext;
pub use buffer::pool::BufferPool;
pub use buffer::{ReadOutcome, ReadResult, ReaderId, RingBuffer, WriteGuard};
pub use config::{ArchiveConfig, Config};
pub use decimate::{DecimationConfig, Decimator};
pub use error::{Error, ErrorStack, Result};
pub use mask::FilterMask;
pub use server::Server;
pub use source::{DeviceSource, ReplaySource, Source, SourceStatus};
pub use sync::{Shutdown, ShutdownHandle};

pub mod server;
