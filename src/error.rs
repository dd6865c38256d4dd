//! Crate-wide error type and the per-thread error stack used to accumulate
//! failures that are either surfaced to a client (pre-flight only) or logged.

use std::fmt;
use std::io;

use nix;

pub type Result<T> = ::std::result::Result<T, Error>;

/// Error taxonomy for the archiver (see spec.md section 7).
///
/// Each variant corresponds to one of the error "kinds" the specification
/// names: startup configuration errors, archive I/O failures, client
/// request errors, client overrun, and resource exhaustion. Transient
/// source gaps are *not* represented here: they are handled in-band by
/// `transform::reset_block` and friends and never become an `Error`.
#[derive(Debug, Fail)]
pub enum Error {
    #[fail(display = "invalid archive header: {}", reason)]
    InvalidHeader { reason: String },

    #[fail(display = "archive I/O failure: {}", inner)]
    ArchiveIo { inner: io::Error },

    #[fail(display = "failed to lock archive file: {}", inner)]
    ArchiveLock { inner: io::Error },

    #[fail(display = "failed to mmap archive region: {}", inner)]
    Mmap { inner: io::Error },

    #[fail(display = "{}", _0)]
    Nix(nix::Error),

    #[fail(display = "bad request: {}", reason)]
    BadRequest { reason: String },

    #[fail(display = "Only {} contiguous samples available", available)]
    NotContiguous { available: u64 },

    #[fail(display = "Read too busy")]
    ReadTooBusy,

    #[fail(display = "Write underrun to client")]
    WriteUnderrun,

    #[fail(display = "Gap in subscribed data")]
    SubscriptionGap,

    #[fail(display = "client disconnected")]
    ClientDisconnected,

    #[fail(display = "decimator configuration error: {}", reason)]
    DecimatorConfig { reason: String },
}

impl From<io::Error> for Error {
    fn from(inner: io::Error) -> Self {
        Error::ArchiveIo { inner }
    }
}

impl From<nix::Error> for Error {
    fn from(inner: nix::Error) -> Self {
        Error::Nix(inner)
    }
}

impl Error {
    /// The literal line written to a client socket on pre-flight failure.
    /// The wording of these must match spec.md section 8's quoted strings
    /// exactly, since the end-to-end scenarios assert on them verbatim.
    pub fn client_message(&self) -> String {
        format!("{}", self)
    }
}

/// Accumulates errors observed while servicing a single request or running a
/// background thread, mirroring the "structured error-handling scope" design
/// note in spec.md section 7. Every component that can fail pushes onto a
/// stack owned by its caller; the caller decides whether to surface the top
/// error to a client or just log the rest.
#[derive(Default)]
pub struct ErrorStack {
    errors: Vec<Error>,
}

impl ErrorStack {
    pub fn new() -> Self {
        ErrorStack { errors: Vec::new() }
    }

    pub fn push(&mut self, err: Error) {
        self.errors.push(err);
    }

    /// The error that should be reported to a client, if any.
    pub fn first(&self) -> Option<&Error> {
        self.errors.first()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Logs every accumulated error at `error` level and clears the stack.
    pub fn drain_to_log(&mut self, context: &str) {
        for err in self.errors.drain(..) {
            error!("{}: {}", context, err);
        }
    }
}

impl fmt::Debug for ErrorStack {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list()
            .entries(self.errors.iter().map(|e| e.to_string()))
            .finish()
    }
}
