//! The frame source: the abstract producer at the head of the pipeline
//! (spec.md section 4.1, "Frame source"). The hardware sniffer driver and
//! the dummy replay source are both out of scope as algorithms; only the
//! pull interface below is specified, and `Source` dispatches to whichever
//! variant `Config::device_name` selects the way the teacher crate this
//! repo started from dispatched perf-event sampling across CPU/PID
//! configurations.

use std::time::{SystemTime, UNIX_EPOCH};

use block::FaBlock;
use error::Result;

/// Four variants of frame source (spec.md section 9's dynamic-dispatch
/// note): the real sniffer device, a gigabit-network variant of it, a
/// deterministic replay source for testing, and a source that never
/// produces data (used when no device is configured, e.g. archive-only
/// inspection tools).
pub enum Source {
    Device(DeviceSource),
    Gigabit(DeviceSource),
    Replay(ReplaySource),
    None,
}

/// Snapshot returned by `status()`, surfaced to clients via the `S` status
/// subcommand (spec.md section 6).
#[derive(Clone, Debug, Default)]
pub struct SourceStatus {
    pub link_up: bool,
    pub last_error: Option<String>,
}

impl Source {
    pub fn initialise(&mut self) -> Result<()> {
        match self {
            Source::Device(s) | Source::Gigabit(s) => s.initialise(),
            Source::Replay(s) => s.initialise(),
            Source::None => Ok(()),
        }
    }

    /// Re-establishes the source after a fatal read error, without
    /// restarting the owning thread (spec.md section 4.1's gap-reporting
    /// contract: a reset is itself a reported gap, not a crash).
    pub fn reset(&mut self) {
        match self {
            Source::Device(s) | Source::Gigabit(s) => s.reset(),
            Source::Replay(s) => s.reset(),
            Source::None => {}
        }
    }

    /// Pulls the next `input_block_size` worth of frames into `block`,
    /// returning the capture timestamp of its first row, or `None` if the
    /// source stalled (a gap, reported to the caller rather than blocking
    /// forever).
    pub fn read(&mut self, block: &mut FaBlock) -> Result<Option<u64>> {
        match self {
            Source::Device(s) | Source::Gigabit(s) => s.read(block),
            Source::Replay(s) => s.read(block),
            Source::None => Ok(None),
        }
    }

    pub fn status(&self) -> SourceStatus {
        match self {
            Source::Device(s) | Source::Gigabit(s) => s.status(),
            Source::Replay(s) => s.status(),
            Source::None => SourceStatus::default(),
        }
    }

    /// Wakes a source blocked in `read`, used by the shutdown sequence to
    /// join the frame-source thread (spec.md section 5, "sniffer (joins
    /// thread)").
    pub fn interrupt(&mut self) {
        match self {
            Source::Device(s) | Source::Gigabit(s) => s.interrupt(),
            Source::Replay(s) => s.interrupt(),
            Source::None => {}
        }
    }
}

/// The real hardware sniffer, modelled only by its interface; the device
/// driver itself is out of scope (spec.md section 1).
pub struct DeviceSource {
    device_name: String,
    status: SourceStatus,
    interrupted: bool,
}

impl DeviceSource {
    pub fn new(device_name: String) -> Self {
        DeviceSource {
            device_name,
            status: SourceStatus::default(),
            interrupted: false,
        }
    }

    fn initialise(&mut self) -> Result<()> {
        debug!("opening frame source device {}", self.device_name);
        self.status.link_up = true;
        Ok(())
    }

    fn reset(&mut self) {
        warn!("resetting frame source device {}", self.device_name);
        self.status.link_up = true;
        self.status.last_error = None;
    }

    fn read(&mut self, _block: &mut FaBlock) -> Result<Option<u64>> {
        if self.interrupted {
            return Ok(None);
        }
        // Out of scope: the actual ioctl/mmap protocol against the sniffer
        // character device lives outside this crate's boundary.
        Ok(Some(now_us()))
    }

    fn status(&self) -> SourceStatus {
        self.status.clone()
    }

    fn interrupt(&mut self) {
        self.interrupted = true;
    }
}

/// Deterministic, in-process replacement for the real device, used by
/// integration tests and by the "none" deployment mode's tooling. Cycles a
/// caller-supplied sequence of blocks, optionally injecting a gap.
pub struct ReplaySource {
    blocks: Vec<FaBlock>,
    gap_after: Option<usize>,
    position: usize,
    interrupted: bool,
}

impl ReplaySource {
    pub fn new(blocks: Vec<FaBlock>) -> Self {
        ReplaySource {
            blocks,
            gap_after: None,
            position: 0,
            interrupted: false,
        }
    }

    /// Configures this source to report a gap immediately after the `n`th
    /// block has been read, then resume from the following block (spec.md
    /// section 8's "inject a source gap" scenarios).
    pub fn with_gap_after(mut self, n: usize) -> Self {
        self.gap_after = Some(n);
        self
    }

    fn initialise(&mut self) -> Result<()> {
        Ok(())
    }

    fn reset(&mut self) {
        self.position = 0;
    }

    fn read(&mut self, block: &mut FaBlock) -> Result<Option<u64>> {
        if self.interrupted || self.position >= self.blocks.len() {
            return Ok(None);
        }
        if self.gap_after == Some(self.position) {
            self.gap_after = None;
            return Ok(None);
        }
        *block = self.blocks[self.position].clone();
        self.position += 1;
        Ok(Some(now_us()))
    }

    fn status(&self) -> SourceStatus {
        SourceStatus {
            link_up: !self.interrupted,
            last_error: None,
        }
    }

    fn interrupt(&mut self) {
        self.interrupted = true;
    }
}

pub(crate) fn now_us() -> u64 {
    let d = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    d.as_secs() * 1_000_000 + u64::from(d.subsec_micros())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_source_reports_gap_then_resumes() {
        let blocks = vec![
            FaBlock::new(4, 2),
            FaBlock::new(4, 2),
            FaBlock::new(4, 2),
        ];
        let mut source = Source::Replay(ReplaySource::new(blocks).with_gap_after(1));
        let mut scratch = FaBlock::new(4, 2);

        assert!(source.read(&mut scratch).unwrap().is_some());
        assert!(source.read(&mut scratch).unwrap().is_none());
        assert!(source.read(&mut scratch).unwrap().is_some());
        assert!(source.read(&mut scratch).unwrap().is_none());
    }

    #[test]
    fn none_source_never_produces() {
        let mut source = Source::None;
        let mut scratch = FaBlock::new(4, 2);
        assert!(source.read(&mut scratch).unwrap().is_none());
        assert!(!source.status().link_up);
    }

    #[test]
    fn interrupt_stops_replay_source() {
        let blocks = vec![FaBlock::new(4, 2); 5];
        let mut source = Source::Replay(ReplaySource::new(blocks));
        source.interrupt();
        let mut scratch = FaBlock::new(4, 2);
        assert!(source.read(&mut scratch).unwrap().is_none());
    }
}
