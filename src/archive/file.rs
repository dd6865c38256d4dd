//! Archive-file context: the mmap'd header/index/DD areas plus the raw
//! file descriptor used for `pread`/`pwrite` against the major-block data
//! area (spec.md section 3, "Ownership and lifecycle"). Holds the
//! exclusive `flock` the writer takes for the archive's lifetime (spec.md
//! section 5, "Archive lock").

use std::fs::{File, OpenOptions};
use std::io;
use std::mem::size_of;
use std::os::unix::io::AsRawFd;
use std::ptr;

use libc::{self, c_void};
use nix::fcntl::{flock, FlockArg};

use archive::barrier::RwBarrier;
use config::ArchiveConfig;
use error::{Error, Result};
use raw::{DataIndexEntry, DecimatedSample, DiskHeader, HEADER_SIZE, INDEX_ENTRY_SIZE};

/// An mmap'd region, unmapped on drop. Mirrors the way the teacher crate
/// this repo started from wraps a raw `mmap(2)` base pointer and length.
struct MappedRegion {
    base: *mut c_void,
    len: usize,
}

unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    fn map(fd: &File, offset: u64, len: usize, writable: bool) -> Result<Self> {
        let prot = if writable {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_READ
        };
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                prot,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                offset as libc::off_t,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::Mmap {
                inner: io::Error::last_os_error(),
            });
        }
        Ok(MappedRegion { base, len })
    }

    fn as_ptr(&self) -> *const u8 {
        self.base as *const u8
    }

    /// Raw mutable access to the mapping. Takes `&self`, not `&mut self`:
    /// callers (the transform thread) are the only writer by construction
    /// of the archiver's thread model, enforced by `RwBarrier` rather than
    /// by the borrow checker, the same trust boundary `MappedRegion`'s
    /// `Send`/`Sync` impls already rely on.
    fn as_mut_ptr(&self) -> *mut u8 {
        self.base as *mut u8
    }

    fn msync(&self) -> Result<()> {
        let rc = unsafe { libc::msync(self.base, self.len, libc::MS_SYNC) };
        if rc != 0 {
            return Err(Error::ArchiveIo {
                inner: io::Error::last_os_error(),
            });
        }
        Ok(())
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base, self.len);
        }
    }
}

/// Owns the open archive file, its three memory-mapped areas, and the
/// read/write barrier that mediates `pread`s against the writer. One
/// instance is shared (behind an `Arc`) by the transform/writer pair and
/// every query-engine connection thread.
pub struct ArchiveContext {
    file: File,
    header_region: MappedRegion,
    index_region: MappedRegion,
    dd_region: MappedRegion,
    pub barrier: RwBarrier,
    config: ArchiveConfig,
}

impl ArchiveContext {
    /// Initialises a brand-new archive: preallocates the file, zero-fills
    /// it, and writes a fresh header (spec.md section 1: "in scope as a
    /// contract on the file layout but not as an algorithm").
    pub fn create(path: &str, config: ArchiveConfig) -> Result<Self> {
        config.validate()?;
        let header = DiskHeader::from_config(&config);
        let total_size = HEADER_SIZE as u64 + header.total_data_size;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(total_size)?;

        flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock)
            .map_err(|_| Error::ArchiveLock {
                inner: io::Error::new(io::ErrorKind::WouldBlock, "archive already locked"),
            })?;

        let ctx = Self::from_file(file, config)?;
        ctx.write_header(&header)?;
        Ok(ctx)
    }

    /// Opens an existing archive read-only-for-writes-purposes (a query
    /// connection never holds the writer's exclusive lock).
    pub fn open_read_only(path: &str) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        let header = Self::read_header_from(&file)?;
        header.validate()?;
        let config = header_to_config(&header);
        Self::from_file(file, config)
    }

    /// Reopens an existing archive for the writer half of the process:
    /// takes the same exclusive `flock` `create` does, but neither
    /// truncates the file nor rewrites its header, so the disk writer
    /// resumes at `current_major_block` instead of starting over.
    pub fn open_read_write(path: &str) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let header = Self::read_header_from(&file)?;
        header.validate()?;
        flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock)
            .map_err(|_| Error::ArchiveLock {
                inner: io::Error::new(io::ErrorKind::WouldBlock, "archive already locked"),
            })?;
        let config = header_to_config(&header);
        Self::from_file(file, config)
    }

    fn from_file(file: File, config: ArchiveConfig) -> Result<Self> {
        let header_region = MappedRegion::map(&file, 0, HEADER_SIZE, true)?;
        let current = Self::read_header_region(&header_region);
        let index_len = current.index_data_size.max(1) as usize;
        let dd_len = current.dd_data_size.max(1) as usize;
        let index_region = MappedRegion::map(&file, current.index_data_start, index_len, true)?;
        let dd_region = MappedRegion::map(&file, current.dd_data_start, dd_len, true)?;

        Ok(ArchiveContext {
            file,
            header_region,
            index_region,
            dd_region,
            barrier: RwBarrier::new(),
            config,
        })
    }

    fn read_header_from(file: &File) -> Result<DiskHeader> {
        let region = MappedRegion::map(file, 0, HEADER_SIZE, false)?;
        Ok(Self::read_header_region(&region))
    }

    fn read_header_region(region: &MappedRegion) -> DiskHeader {
        unsafe { ptr::read(region.as_ptr() as *const DiskHeader) }
    }

    pub fn header(&self) -> DiskHeader {
        Self::read_header_region(&self.header_region)
    }

    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    /// Overwrites the header in place and `msync`s it (spec.md section
    /// 4.3 step 5: "`msync` header and the affected index page").
    pub fn write_header(&self, header: &DiskHeader) -> Result<()> {
        unsafe {
            ptr::write(self.header_region.as_mut_ptr() as *mut DiskHeader, *header);
        }
        self.header_region.msync()
    }

    pub fn index_entry(&self, block: usize) -> DataIndexEntry {
        let offset = block * INDEX_ENTRY_SIZE;
        let bytes = unsafe {
            ::std::slice::from_raw_parts(self.index_region.as_ptr().add(offset), INDEX_ENTRY_SIZE)
        };
        DataIndexEntry::from_le_bytes(bytes)
    }

    pub fn set_index_entry(&self, block: usize, entry: DataIndexEntry) -> Result<()> {
        let offset = block * INDEX_ENTRY_SIZE;
        let bytes = entry.to_le_bytes();
        unsafe {
            let dst = self.index_region.as_mut_ptr().add(offset);
            ptr::copy_nonoverlapping(bytes.as_ptr(), dst, INDEX_ENTRY_SIZE);
        }
        self.index_region.msync()
    }

    /// Writes one DD sample for `id_slot` at `dd_offset` within that id's
    /// column (spec.md section 4.3 step 4: "emit one DD sample directly
    /// into the memory-mapped DD area").
    pub fn write_dd_sample(&self, id_slot: usize, dd_offset: usize, sample: DecimatedSample) {
        let dd_sample_count = self.config.dd_total_count();
        let offset = (id_slot * dd_sample_count + dd_offset) * size_of::<DecimatedSample>();
        let bytes = sample.to_le_bytes();
        unsafe {
            let dst = self.dd_region.as_mut_ptr().add(offset);
            ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
        }
    }

    pub fn read_dd_sample(&self, id_slot: usize, dd_offset: usize) -> DecimatedSample {
        let dd_sample_count = self.config.dd_total_count();
        let offset = (id_slot * dd_sample_count + dd_offset) * size_of::<DecimatedSample>();
        let bytes = unsafe {
            ::std::slice::from_raw_parts(
                self.dd_region.as_ptr().add(offset),
                size_of::<DecimatedSample>(),
            )
        };
        DecimatedSample::from_le_bytes(bytes)
    }

    pub fn sync_dd(&self) -> Result<()> {
        self.dd_region.msync()
    }

    /// Reads `len` bytes at `offset` within the major-block data area via
    /// `pread` (spec.md section 4.4 step 6: "FA/D paths use `pread`"),
    /// expected to be called while holding a `RwBarrier::request_read`
    /// permit.
    pub fn pread_major(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        use std::os::unix::fs::FileExt;
        let header = self.header();
        Ok(self.file.read_at(buf, header.major_data_start + offset)?)
    }

    /// Writes `buf` at `offset` within the major-block data area via
    /// `pwrite`, used by the disk writer to submit a filled double buffer
    /// (spec.md section 4.2).
    pub fn pwrite_major(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        use std::os::unix::fs::FileExt;
        let header = self.header();
        Ok(self.file.write_at(buf, header.major_data_start + offset)?)
    }
}

fn header_to_config(header: &DiskHeader) -> ArchiveConfig {
    ArchiveConfig {
        fa_entry_count: header.fa_entry_count as usize,
        archive_mask: header.archive_mask(),
        input_block_size: header.input_block_size as usize,
        major_sample_count: header.major_sample_count as usize,
        first_decimation_log2: header.first_decimation_log2,
        second_decimation_log2: header.second_decimation_log2,
        timestamp_iir_weight: header.timestamp_iir_weight,
        events_fa_id: header.events_fa_id,
        max_delta_t_us: header.max_delta_t_us,
        major_block_count: header.major_block_count as usize,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mask::FilterMask;
    use tempfile::NamedTempFile;

    fn tiny_config() -> ArchiveConfig {
        ArchiveConfig {
            fa_entry_count: 8,
            archive_mask: FilterMask::parse("0-3", 8).unwrap(),
            input_block_size: 128,
            major_sample_count: 16,
            first_decimation_log2: 1,
            second_decimation_log2: 1,
            timestamp_iir_weight: 0.1,
            events_fa_id: ::raw::NO_EVENTS_ID,
            max_delta_t_us: ::raw::DEFAULT_MAX_DELTA_T,
            major_block_count: 4,
        }
    }

    #[test]
    fn create_then_reopen_round_trips_header() {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_str().unwrap().to_string();
        drop(tmp);

        {
            let ctx = ArchiveContext::create(&path, tiny_config()).unwrap();
            let header = ctx.header();
            header.validate().unwrap();
        }

        let ctx = ArchiveContext::open_read_only(&path).unwrap();
        let header = ctx.header();
        assert_eq!(header.fa_entry_count, 8);
        assert_eq!(header.archive_mask_count, 4);
        ::std::fs::remove_file(&path).ok();
    }

    #[test]
    fn index_entries_round_trip() {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_str().unwrap().to_string();
        drop(tmp);

        let ctx = ArchiveContext::create(&path, tiny_config()).unwrap();
        let entry = DataIndexEntry {
            timestamp_us: 1_000_000,
            duration_us: 1600,
            id_zero: 42,
        };
        ctx.set_index_entry(0, entry).unwrap();
        assert_eq!(ctx.index_entry(0), entry);
        ::std::fs::remove_file(&path).ok();
    }

    #[test]
    fn dd_samples_round_trip() {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_str().unwrap().to_string();
        drop(tmp);

        let ctx = ArchiveContext::create(&path, tiny_config()).unwrap();
        let sample = DecimatedSample::default();
        ctx.write_dd_sample(0, 0, sample);
        assert_eq!(ctx.read_dd_sample(0, 0), sample);
        ::std::fs::remove_file(&path).ok();
    }
}
