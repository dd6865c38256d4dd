//! Disk header construction and validation (spec.md section 3, "Disk
//! header"; section 4.3 invariants). The archive-file initialiser itself
//! — writing a fresh header and zero-filling the file — is in scope as a
//! contract on layout, not as an algorithm (spec.md section 1).

use config::ArchiveConfig;
use error::{Error, Result};
use mask::FilterMask;
use raw::{page_align, DiskHeader, DECIMATED_SAMPLE_SIZE, DISK_SIGNATURE, DISK_VERSION, FRAME_SIZE, HEADER_SIZE, MAX_FA_ENTRY_COUNT};

impl DiskHeader {
    /// Builds the header for a freshly initialised archive from its
    /// configuration, laying out index, DD, and major-block areas on
    /// page boundaries immediately after the fixed 4096-byte prefix
    /// (spec.md section 3 invariants: "every area starts on a page
    /// boundary").
    pub fn from_config(config: &ArchiveConfig) -> DiskHeader {
        let archive_mask_count = config.archive_mask_count() as u32;
        let d_sample_count = config.d_sample_count() as u32;
        let dd_sample_count = config.dd_sample_count() as u32;
        let major_block_size = config.major_block_size() as u32;

        let index_data_start = DiskHeader::INDEX_DATA_START;
        let index_data_size =
            page_align(config.major_block_count as u64 * ::raw::INDEX_ENTRY_SIZE as u64);

        let dd_data_start = index_data_start + index_data_size;
        let dd_data_size = page_align(
            config.dd_total_count() as u64 * archive_mask_count as u64 * DECIMATED_SAMPLE_SIZE as u64,
        );

        let major_data_start = dd_data_start + dd_data_size;
        let major_data_size = page_align(major_block_size as u64 * config.major_block_count as u64);

        let total_data_size = major_data_start + major_data_size - HEADER_SIZE as u64;

        let mut archive_mask = [0u8; MAX_FA_ENTRY_COUNT / 8];
        archive_mask.copy_from_slice(&config.archive_mask.to_le_bytes(MAX_FA_ENTRY_COUNT));

        DiskHeader {
            signature: DISK_SIGNATURE,
            version: DISK_VERSION,
            archive_mask,
            fa_entry_count: config.fa_entry_count as u32,
            archive_mask_count,
            input_block_size: config.input_block_size as u32,
            major_block_size,
            major_sample_count: config.major_sample_count as u32,
            first_decimation_log2: config.first_decimation_log2,
            second_decimation_log2: config.second_decimation_log2,
            d_sample_count,
            dd_sample_count,
            major_block_count: config.major_block_count as u32,
            timestamp_iir_weight: config.timestamp_iir_weight,
            index_data_start,
            index_data_size,
            dd_data_start,
            dd_data_size,
            major_data_start,
            total_data_size,
            current_major_block: 0,
            last_duration: 0,
            events_fa_id: config.events_fa_id,
            max_delta_t_us: config.max_delta_t_us,
            _reserved: [0u8; HEADER_SIZE - DiskHeader::PAYLOAD_SIZE],
        }
    }

    /// Validates an existing header read off disk: signature, version,
    /// and the derived-size invariants in spec.md section 3.
    pub fn validate(&self) -> Result<()> {
        if self.signature != DISK_SIGNATURE {
            return Err(Error::InvalidHeader {
                reason: format!("bad signature {:#x}", self.signature),
            });
        }
        if self.version != DISK_VERSION {
            return Err(Error::InvalidHeader {
                reason: format!(
                    "unsupported archive version {} (expected {})",
                    self.version, DISK_VERSION
                ),
            });
        }
        if self.fa_entry_count == 0 || self.fa_entry_count as usize > MAX_FA_ENTRY_COUNT {
            return Err(Error::InvalidHeader {
                reason: format!("fa_entry_count {} out of range", self.fa_entry_count),
            });
        }
        let expected_major = self.archive_mask_count as u64
            * (self.major_sample_count as u64 * FRAME_SIZE as u64
                + self.d_sample_count as u64 * DECIMATED_SAMPLE_SIZE as u64);
        if expected_major != self.major_block_size as u64 {
            return Err(Error::InvalidHeader {
                reason: format!(
                    "major_block_size {} does not match derived size {}",
                    self.major_block_size, expected_major
                ),
            });
        }
        if self.index_data_start != DiskHeader::INDEX_DATA_START {
            return Err(Error::InvalidHeader {
                reason: "index_data_start must equal the header size".into(),
            });
        }
        if self.current_major_block as u64 >= self.major_block_count as u64 {
            return Err(Error::InvalidHeader {
                reason: format!(
                    "current_major_block {} out of range for major_block_count {}",
                    self.current_major_block, self.major_block_count
                ),
            });
        }
        Ok(())
    }

    pub fn archive_mask(&self) -> FilterMask {
        self.archive_mask_bits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
    fn header_round_trips_from_config() {
        let cfg = tiny_config();
        let header = DiskHeader::from_config(&cfg);
        header.validate().unwrap();
        assert_eq!(header.archive_mask_count as usize, cfg.archive_mask_count());
        assert_eq!(header.archive_mask(), cfg.archive_mask);
    }

    #[test]
    fn areas_are_page_aligned_and_ordered() {
        let header = DiskHeader::from_config(&tiny_config());
        assert_eq!(header.index_data_start, HEADER_SIZE as u64);
        assert_eq!(header.index_data_start % page_size::get() as u64, 0);
        assert_eq!(header.dd_data_start % page_size::get() as u64, 0);
        assert_eq!(header.major_data_start % page_size::get() as u64, 0);
        assert!(header.dd_data_start > header.index_data_start);
        assert!(header.major_data_start > header.dd_data_start);
    }

    #[test]
    fn rejects_wrong_signature() {
        let mut header = DiskHeader::from_config(&tiny_config());
        header.signature = 0xdead_beef;
        assert!(header.validate().is_err());
    }

    #[test]
    fn rejects_current_major_block_out_of_range() {
        let mut header = DiskHeader::from_config(&tiny_config());
        header.current_major_block = header.major_block_count;
        assert!(header.validate().is_err());
    }
}
