//! The archive file: on-disk layout, the write-priority read/write
//! barrier, and header construction/validation (spec.md section 3 and
//! section 4.2).

pub mod barrier;
pub mod file;
pub mod header;
pub mod writer;

pub use self::file::ArchiveContext;
