//! On-disk and on-wire binary layouts.
//!
//! These types are `#[repr(C)]` so that their in-memory representation is
//! also their archive-file representation: the disk header, index
//! entries, and DD samples are read and written by reinterpreting mmap'd
//! bytes as these structs directly, the same way the teacher crate this
//! repo started from casts an mmap'd region to `perf_event_mmap_page`
//! (see the historical `sample/ring_buffer.rs`). Every multi-byte field is
//! always produced with an explicit little-endian encode/decode rather
//! than relying on host endianness, because the wire protocol (spec.md
//! section 6) mandates little-endian regardless of host architecture.

use std::mem::size_of;

/// Maximum number of monitored BPM sites a single archive can describe.
pub const MAX_FA_ENTRY_COUNT: usize = 256;

/// Size in bytes of a single (x, y) reading.
pub const FRAME_SIZE: usize = 8;

/// Size in bytes of a `DecimatedSample` (mean, min, max, std).
pub const DECIMATED_SAMPLE_SIZE: usize = 32;

/// Fixed size of the disk header prefix.
pub const HEADER_SIZE: usize = 4096;

/// Size of one `DataIndexEntry` on disk.
pub const INDEX_ENTRY_SIZE: usize = 16;

/// Magic number identifying an FA archive file.
pub const DISK_SIGNATURE: u32 = 0xfa_4a_4956; // "FA archIVe", truncated to 4 bytes

/// Current on-disk format version. Bumped on any layout-incompatible change.
pub const DISK_VERSION: u32 = 2;

/// Default maximum permitted gap (in microseconds) between the end of one
/// major block and the start of the next before the pair is considered
/// discontiguous.
pub const DEFAULT_MAX_DELTA_T: u32 = 1000;

/// Protocol major/minor reported by the `V` status command.
pub const SERVER_MAJOR: u32 = 1;
pub const SERVER_MINOR: u32 = 1;

/// Sentinel `events_fa_id` meaning "no event-code id configured".
pub const NO_EVENTS_ID: i32 = -1;

/// A single (x, y) reading for one monitored site. Frame size = 8 bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Frame {
    pub x: i32,
    pub y: i32,
}

impl Frame {
    pub const ZERO: Frame = Frame { x: 0, y: 0 };

    pub fn new(x: i32, y: i32) -> Self {
        Frame { x, y }
    }

    pub fn to_le_bytes(self) -> [u8; FRAME_SIZE] {
        let mut out = [0u8; FRAME_SIZE];
        out[0..4].copy_from_slice(&self.x.to_le_bytes());
        out[4..8].copy_from_slice(&self.y.to_le_bytes());
        out
    }

    pub fn from_le_bytes(buf: &[u8]) -> Self {
        debug_assert!(buf.len() >= FRAME_SIZE);
        let x = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let y = i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        Frame { x, y }
    }

    /// Bitwise OR of the two frames' components, used for event-code ids
    /// (spec.md section 4.3, "Event-code handling").
    pub fn bitor(self, other: Frame) -> Frame {
        Frame {
            x: self.x | other.x,
            y: self.y | other.y,
        }
    }
}

/// Struct of {mean, min, max, std}, one decimated sample. 32 bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DecimatedSample {
    pub mean: Frame,
    pub min: Frame,
    pub max: Frame,
    pub std: Frame,
}

impl DecimatedSample {
    pub fn to_le_bytes(self) -> [u8; DECIMATED_SAMPLE_SIZE] {
        let mut out = [0u8; DECIMATED_SAMPLE_SIZE];
        out[0..8].copy_from_slice(&self.mean.to_le_bytes());
        out[8..16].copy_from_slice(&self.min.to_le_bytes());
        out[16..24].copy_from_slice(&self.max.to_le_bytes());
        out[24..32].copy_from_slice(&self.std.to_le_bytes());
        out
    }

    pub fn from_le_bytes(buf: &[u8]) -> Self {
        debug_assert!(buf.len() >= DECIMATED_SAMPLE_SIZE);
        DecimatedSample {
            mean: Frame::from_le_bytes(&buf[0..8]),
            min: Frame::from_le_bytes(&buf[8..16]),
            max: Frame::from_le_bytes(&buf[16..24]),
            std: Frame::from_le_bytes(&buf[24..32]),
        }
    }

    /// Replaces every field with the bitwise-OR aggregate of the inputs,
    /// used when `events_fa_id` designates this id as an event-code column
    /// (spec.md section 4.3).
    pub fn event_or(raw_or: Frame) -> Self {
        DecimatedSample {
            mean: raw_or,
            min: raw_or,
            max: raw_or,
            std: raw_or,
        }
    }
}

/// One entry per major block: timestamp of the block's first sample,
/// estimated duration, and the integrity-check value of site 0's x at the
/// start of the block.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DataIndexEntry {
    pub timestamp_us: u64,
    pub duration_us: u32,
    pub id_zero: u32,
}

impl DataIndexEntry {
    pub const INVALID: DataIndexEntry = DataIndexEntry {
        timestamp_us: 0,
        duration_us: 0,
        id_zero: 0,
    };

    /// A block whose duration is zero has never been written, or is the
    /// block currently being filled (spec.md section 3 invariants).
    pub fn is_valid(&self) -> bool {
        self.duration_us != 0
    }

    pub fn to_le_bytes(self) -> [u8; INDEX_ENTRY_SIZE] {
        let mut out = [0u8; INDEX_ENTRY_SIZE];
        out[0..8].copy_from_slice(&self.timestamp_us.to_le_bytes());
        out[8..12].copy_from_slice(&self.duration_us.to_le_bytes());
        out[12..16].copy_from_slice(&self.id_zero.to_le_bytes());
        out
    }

    pub fn from_le_bytes(buf: &[u8]) -> Self {
        debug_assert!(buf.len() >= INDEX_ENTRY_SIZE);
        DataIndexEntry {
            timestamp_us: u64::from_le_bytes([
                buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
            ]),
            duration_us: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            id_zero: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
        }
    }

    /// End timestamp implied by this entry, used for the contiguity check
    /// in spec.md section 3's invariants.
    pub fn end_timestamp_us(&self) -> u64 {
        self.timestamp_us + self.duration_us as u64
    }
}

/// Fixed 4096-byte prefix of the archive file (spec.md section 3, "Disk
/// header"). Stored and mmap'd in native struct layout; every field here
/// is also re-serialized explicitly little-endian when written fresh by
/// the archive initialiser, so the on-disk bytes are portable even though
/// in-process access goes through this struct directly.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct DiskHeader {
    pub signature: u32,
    pub version: u32,
    /// Bitset over site ids, `MAX_FA_ENTRY_COUNT` bits wide regardless of
    /// `fa_entry_count`, so the layout never depends on the site count.
    pub archive_mask: [u8; MAX_FA_ENTRY_COUNT / 8],
    pub fa_entry_count: u32,
    pub archive_mask_count: u32,
    pub input_block_size: u32,
    pub major_block_size: u32,
    pub major_sample_count: u32,
    pub first_decimation_log2: u32,
    pub second_decimation_log2: u32,
    pub d_sample_count: u32,
    pub dd_sample_count: u32,
    pub major_block_count: u32,
    /// IIR weight `alpha` used to smooth `last_duration`.
    pub timestamp_iir_weight: f64,
    pub index_data_start: u64,
    pub index_data_size: u64,
    pub dd_data_start: u64,
    pub dd_data_size: u64,
    pub major_data_start: u64,
    pub total_data_size: u64,
    /// Index of the major block currently being written; not valid for
    /// reads (spec.md section 3 invariants).
    pub current_major_block: u32,
    /// Smoothed estimate of a major block's duration in microseconds.
    pub last_duration: u32,
    /// Site id whose column is event-code data, or `NO_EVENTS_ID`.
    pub events_fa_id: i32,
    pub max_delta_t_us: u32,
    _reserved: [u8; HEADER_SIZE - DiskHeader::PAYLOAD_SIZE],
}

impl DiskHeader {
    // signature, version: 2 u32 fields.
    // archive_mask: MAX_FA_ENTRY_COUNT / 8 bytes.
    // fa_entry_count .. major_block_count: 10 u32 fields.
    // timestamp_iir_weight: 1 f64 field.
    // index_data_start .. total_data_size: 6 u64 fields.
    // current_major_block, last_duration, events_fa_id, max_delta_t_us: 4 u32 fields.
    const PAYLOAD_SIZE: usize =
        4 * 2 + MAX_FA_ENTRY_COUNT / 8 + 4 * 10 + 8 + 8 * 6 + 4 * 4;

    /// `index_data_start` is fixed by spec.md section 3: the header is
    /// always 4096 bytes and every other area starts on a page boundary
    /// immediately afterwards.
    pub const INDEX_DATA_START: u64 = HEADER_SIZE as u64;

    pub fn archive_mask_bits(&self) -> super::mask::FilterMask {
        super::mask::FilterMask::from_le_bytes(&self.archive_mask, self.fa_entry_count as usize)
    }
}

const _ASSERT_HEADER_SIZE: [(); HEADER_SIZE] = [(); size_of::<DiskHeader>()];

/// Rounds `n` up to the next multiple of the OS page size.
pub fn page_align(n: u64) -> u64 {
    let page = page_size::get() as u64;
    (n + page - 1) / page * page
}
