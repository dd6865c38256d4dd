//! Archive configuration: the parameters fixed at archive initialisation
//! (spec.md section 3) plus the process-level CLI contract (spec.md
//! section 6, "Process contract") that wires the whole archiver together.
//! CLI parsing itself is out of scope per spec.md section 1; `Config`
//! exists purely as the typed result that out-of-scope parsing produces.

use error::{Error, Result};
use mask::FilterMask;
use raw::{DEFAULT_MAX_DELTA_T, MAX_FA_ENTRY_COUNT, NO_EVENTS_ID};

/// Parameters that determine the on-disk layout of a fresh archive.
/// Immutable for the lifetime of the archive (spec.md section 1:
/// "no dynamic reconfiguration... after initialisation").
#[derive(Clone, Debug)]
pub struct ArchiveConfig {
    pub fa_entry_count: usize,
    pub archive_mask: FilterMask,
    pub input_block_size: usize,
    pub major_sample_count: usize,
    pub first_decimation_log2: u32,
    pub second_decimation_log2: u32,
    pub timestamp_iir_weight: f64,
    pub events_fa_id: i32,
    pub max_delta_t_us: u32,
    pub major_block_count: usize,
}

impl ArchiveConfig {
    pub fn archive_mask_count(&self) -> usize {
        self.archive_mask.count()
    }

    pub fn row_size(&self) -> usize {
        8 * self.fa_entry_count
    }

    pub fn d_sample_count(&self) -> usize {
        self.major_sample_count >> self.first_decimation_log2
    }

    pub fn dd_sample_count(&self) -> usize {
        self.major_sample_count >> (self.first_decimation_log2 + self.second_decimation_log2)
    }

    pub fn major_block_size(&self) -> usize {
        self.archive_mask_count() * (self.major_sample_count * 8 + self.d_sample_count() * 32)
    }

    pub fn dd_total_count(&self) -> usize {
        self.dd_sample_count() * self.major_block_count
    }

    /// Validates the invariants spec.md section 3 requires of a fresh
    /// configuration: power-of-two sizes, decimation factors that evenly
    /// divide `major_sample_count`, and a non-empty, in-range archive mask.
    pub fn validate(&self) -> Result<()> {
        if self.fa_entry_count == 0 || self.fa_entry_count > MAX_FA_ENTRY_COUNT {
            return Err(Error::InvalidHeader {
                reason: format!("fa_entry_count {} out of range", self.fa_entry_count),
            });
        }
        if !self.fa_entry_count.is_power_of_two() {
            return Err(Error::InvalidHeader {
                reason: "fa_entry_count must be a power of two".into(),
            });
        }
        if self.input_block_size == 0 || self.input_block_size % self.row_size() != 0 {
            return Err(Error::InvalidHeader {
                reason: "input_block_size must be a multiple of the row size".into(),
            });
        }
        if !self.major_sample_count.is_power_of_two() {
            return Err(Error::InvalidHeader {
                reason: "major_sample_count must be a power of two".into(),
            });
        }
        let total_log2 = self.first_decimation_log2 + self.second_decimation_log2;
        if (1usize << total_log2) > self.major_sample_count {
            return Err(Error::InvalidHeader {
                reason: "decimation factors exceed major_sample_count".into(),
            });
        }
        if self.major_sample_count % (1 << total_log2) != 0 {
            return Err(Error::InvalidHeader {
                reason: "major_sample_count not evenly divisible by total decimation".into(),
            });
        }
        let count = self.archive_mask_count();
        if count == 0 || count > self.fa_entry_count {
            return Err(Error::InvalidHeader {
                reason: format!("archive_mask_count {} out of range", count),
            });
        }
        if self.major_block_count == 0 {
            return Err(Error::InvalidHeader {
                reason: "major_block_count must be nonzero".into(),
            });
        }
        Ok(())
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        ArchiveConfig {
            fa_entry_count: 256,
            archive_mask: FilterMask::parse("0-255", 256).unwrap(),
            input_block_size: 256 * 8 * 64,
            major_sample_count: 1 << 17,
            first_decimation_log2: 6,
            second_decimation_log2: 5,
            timestamp_iir_weight: 0.1,
            events_fa_id: NO_EVENTS_ID,
            max_delta_t_us: DEFAULT_MAX_DELTA_T,
            major_block_count: 1024,
        }
    }
}

/// The process-level contract: archive-file path, listening port, buffer
/// geometry, device name, and daemonisation knobs. Out-of-scope CLI
/// parsing populates this struct; nothing downstream cares how it was
/// built.
#[derive(Clone, Debug)]
pub struct Config {
    pub archive_path: String,
    pub port: u16,
    pub fa_block_count: usize,
    pub decimated_block_count: usize,
    pub device_name: String,
    pub pid_file: Option<String>,
    pub daemonize: bool,
    pub decimation_config_path: Option<String>,
}

impl Config {
    /// Minimal argv scan sufficient to satisfy the process contract in
    /// spec.md section 6. CLI ergonomics (flags, `--help`, validation
    /// messages) are explicitly out of scope; this exists only so `main`
    /// has something to call.
    pub fn from_args<I: IntoIterator<Item = String>>(args: I) -> Result<Self> {
        let mut archive_path = None;
        let mut port = 8888u16;
        let mut fa_block_count = 10_000usize;
        let mut decimated_block_count = 10_000usize;
        let mut device_name = "fa-sniffer0".to_string();
        let mut pid_file = None;
        let mut daemonize = false;
        let mut decimation_config_path = None;

        let mut iter = args.into_iter();
        let _argv0 = iter.next();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "-p" | "--port" => port = next_arg(&mut iter)?.parse().map_err(|_| bad_arg("port"))?,
                "-b" | "--blocks" => {
                    fa_block_count = next_arg(&mut iter)?.parse().map_err(|_| bad_arg("blocks"))?
                }
                "-B" | "--decimated-blocks" => {
                    decimated_block_count =
                        next_arg(&mut iter)?.parse().map_err(|_| bad_arg("decimated-blocks"))?
                }
                "-d" | "--device" => device_name = next_arg(&mut iter)?,
                "-P" | "--pid-file" => pid_file = Some(next_arg(&mut iter)?),
                "-D" | "--daemon" => daemonize = true,
                "-c" | "--decimation-config" => decimation_config_path = Some(next_arg(&mut iter)?),
                other if archive_path.is_none() => archive_path = Some(other.to_string()),
                other => return Err(bad_arg(other)),
            }
        }

        let archive_path = archive_path.ok_or_else(|| Error::InvalidHeader {
            reason: "missing archive file path argument".into(),
        })?;

        Ok(Config {
            archive_path,
            port,
            fa_block_count,
            decimated_block_count,
            device_name,
            pid_file,
            daemonize,
            decimation_config_path,
        })
    }
}

fn next_arg<I: Iterator<Item = String>>(iter: &mut I) -> Result<String> {
    iter.next().ok_or_else(|| Error::InvalidHeader {
        reason: "missing value for option".into(),
    })
}

fn bad_arg(what: &str) -> Error {
    Error::InvalidHeader {
        reason: format!("unrecognised argument: {}", what),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_archive_config_validates() {
        ArchiveConfig::default().validate().unwrap();
    }

    #[test]
    fn tiny_archive_config_from_spec_scenarios() {
        let cfg = ArchiveConfig {
            fa_entry_count: 8,
            archive_mask: FilterMask::parse("0-3", 8).unwrap(),
            input_block_size: 128,
            major_sample_count: 16,
            first_decimation_log2: 1,
            second_decimation_log2: 1,
            timestamp_iir_weight: 0.1,
            events_fa_id: NO_EVENTS_ID,
            max_delta_t_us: DEFAULT_MAX_DELTA_T,
            major_block_count: 4,
        };
        cfg.validate().unwrap();
        assert_eq!(cfg.archive_mask_count(), 4);
        assert_eq!(cfg.d_sample_count(), 8);
        assert_eq!(cfg.dd_sample_count(), 4);
        assert_eq!(cfg.major_block_size(), 4 * (16 * 8 + 8 * 32));
    }

    #[test]
    fn rejects_non_power_of_two() {
        let mut cfg = ArchiveConfig::default();
        cfg.fa_entry_count = 200;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parses_minimal_args() {
        let args = vec!["fa-archiverd", "/tmp/archive.dat", "-p", "8889"]
            .into_iter()
            .map(String::from);
        let cfg = Config::from_args(args).unwrap();
        assert_eq!(cfg.archive_path, "/tmp/archive.dat");
        assert_eq!(cfg.port, 8889);
    }
}
