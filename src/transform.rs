//! Block transform: per incoming input block, transpose into per-id
//! columns, compute the first decimation stage in place in the active
//! major-block buffer, feed the second decimation stage into the
//! memory-mapped DD area, and on major-block completion finalise the
//! index entry by least-squares timestamp regression (spec.md section
//! 4.3).

use archive::ArchiveContext;
use block::FaBlock;
use config::ArchiveConfig;
use raw::{DataIndexEntry, DecimatedSample, Frame, DECIMATED_SAMPLE_SIZE, FRAME_SIZE};

/// Running sum-of-squares accumulator for one id's decimation window.
/// Uses native 128-bit integers for the accumulator rather than the
/// two-`u64` emulation the original device used on 32-bit hosts — see
/// DESIGN.md for why that substitution is safe here.
struct Accumulator {
    sum_x: i128,
    sum_x2: i128,
    sum_y: i128,
    sum_y2: i128,
    min: Frame,
    max: Frame,
    or: Frame,
    count: u32,
}

impl Accumulator {
    fn new() -> Self {
        Accumulator {
            sum_x: 0,
            sum_x2: 0,
            sum_y: 0,
            sum_y2: 0,
            min: Frame::new(i32::max_value(), i32::max_value()),
            max: Frame::new(i32::min_value(), i32::min_value()),
            or: Frame::ZERO,
            count: 0,
        }
    }

    fn add(&mut self, f: Frame) {
        self.sum_x += f.x as i128;
        self.sum_x2 += (f.x as i128) * (f.x as i128);
        self.sum_y += f.y as i128;
        self.sum_y2 += (f.y as i128) * (f.y as i128);
        self.min = Frame::new(self.min.x.min(f.x), self.min.y.min(f.y));
        self.max = Frame::new(self.max.x.max(f.x), self.max.y.max(f.y));
        self.or = self.or.bitor(f);
        self.count += 1;
    }

    /// Per spec.md section 4.3 step 3: `std = round(sqrt(max(0, ssq/N -
    /// mean^2)))`. Event-coded ids replace the statistics with the
    /// bitwise-OR aggregate copied into all four fields.
    fn finish(&self, is_event: bool) -> DecimatedSample {
        if is_event {
            return DecimatedSample::event_or(self.or);
        }
        let n = self.count as f64;
        let mean_x = self.sum_x as f64 / n;
        let mean_y = self.sum_y as f64 / n;
        let std_x = (((self.sum_x2 as f64) / n - mean_x * mean_x).max(0.0)).sqrt();
        let std_y = (((self.sum_y2 as f64) / n - mean_y * mean_y).max(0.0)).sqrt();
        DecimatedSample {
            mean: Frame::new(mean_x.round() as i32, mean_y.round() as i32),
            min: self.min,
            max: self.max,
            std: Frame::new(std_x.round() as i32, std_y.round() as i32),
        }
    }

    fn reset(&mut self) {
        *self = Accumulator::new();
    }
}

pub struct Transform {
    config: ArchiveConfig,
    /// Archive-slot to source-id mapping: `archive_ids[slot]` is the
    /// `fa_entry_count`-space id stored at slot `slot`.
    archive_ids: Vec<usize>,
    is_event: Vec<bool>,
    row_in_block: usize,
    d_index: usize,
    dd_local_index: usize,
    ts_array: Vec<u64>,
    id_zero: Option<i32>,
    d_accum: Vec<Accumulator>,
    dd_accum: Vec<Accumulator>,
}

impl Transform {
    pub fn new(config: ArchiveConfig) -> Self {
        let archive_ids: Vec<usize> = config.archive_mask.ids(config.fa_entry_count).collect();
        let is_event = archive_ids
            .iter()
            .map(|&id| config.events_fa_id >= 0 && id == config.events_fa_id as usize)
            .collect();
        let count = archive_ids.len();
        Transform {
            config,
            archive_ids,
            is_event,
            row_in_block: 0,
            d_index: 0,
            dd_local_index: 0,
            ts_array: Vec::new(),
            id_zero: None,
            d_accum: (0..count).map(|_| Accumulator::new()).collect(),
            dd_accum: (0..count).map(|_| Accumulator::new()).collect(),
        }
    }

    fn raw_segment_size(&self) -> usize {
        self.config.major_sample_count * FRAME_SIZE
    }

    fn d_segment_size(&self) -> usize {
        self.config.d_sample_count() * DECIMATED_SAMPLE_SIZE
    }

    fn segment_size(&self) -> usize {
        self.raw_segment_size() + self.d_segment_size()
    }

    /// Discards all partial accumulators for the current major block
    /// without advancing the index (spec.md section 4.3 step 6, "On
    /// observing a gap").
    pub fn reset_block(&mut self) {
        self.row_in_block = 0;
        self.d_index = 0;
        self.ts_array.clear();
        self.id_zero = None;
        for a in &mut self.d_accum {
            a.reset();
        }
        for a in &mut self.dd_accum {
            a.reset();
        }
    }

    /// Processes one input block into `buf` (the currently active major
    /// block buffer), emitting DD samples directly into `ctx`'s
    /// memory-mapped DD area. Returns the finalised index entry once
    /// `major_sample_count` rows have accumulated.
    pub fn process_block(
        &mut self,
        ctx: &ArchiveContext,
        buf: &mut [u8],
        block: &FaBlock,
        timestamp_us: u64,
        current_major_block: usize,
    ) -> Option<DataIndexEntry> {
        if self.row_in_block == 0 {
            self.id_zero = Some(block.id_at(0, 0).x);
        }
        self.ts_array.push(timestamp_us);

        let first_shift = self.config.first_decimation_log2;
        let total_shift = first_shift + self.config.second_decimation_log2;
        let segment_size = self.segment_size();
        let raw_size = self.raw_segment_size();
        let dd_total = self.config.dd_total_count();

        for r in 0..block.rows() {
            for (slot, &id) in self.archive_ids.iter().enumerate() {
                let frame = block.id_at(r, id);

                let raw_offset =
                    slot * segment_size + self.row_in_block * FRAME_SIZE;
                buf[raw_offset..raw_offset + FRAME_SIZE].copy_from_slice(&frame.to_le_bytes());

                self.d_accum[slot].add(frame);
                self.dd_accum[slot].add(frame);
            }
            self.row_in_block += 1;

            if self.row_in_block % (1 << first_shift) == 0 {
                for slot in 0..self.archive_ids.len() {
                    let sample = self.d_accum[slot].finish(self.is_event[slot]);
                    let d_offset =
                        slot * segment_size + raw_size + self.d_index * DECIMATED_SAMPLE_SIZE;
                    buf[d_offset..d_offset + DECIMATED_SAMPLE_SIZE]
                        .copy_from_slice(&sample.to_le_bytes());
                    self.d_accum[slot].reset();
                }
                self.d_index += 1;
            }

            if self.row_in_block % (1 << total_shift) == 0 {
                let dd_offset =
                    current_major_block * self.config.dd_sample_count() + self.dd_local_index;
                for slot in 0..self.archive_ids.len() {
                    let sample = self.dd_accum[slot].finish(self.is_event[slot]);
                    ctx.write_dd_sample(slot, dd_offset % dd_total, sample);
                    self.dd_accum[slot].reset();
                }
                self.dd_local_index += 1;
            }
        }

        if self.row_in_block >= self.config.major_sample_count {
            let entry = self.finalise_index_entry();
            self.row_in_block = 0;
            self.d_index = 0;
            self.dd_local_index = 0;
            self.ts_array.clear();
            self.id_zero = None;
            return Some(entry);
        }

        None
    }

    /// Least-squares fit of the major block's per-input-block timestamps
    /// (spec.md section 4.3 step 5). Timestamps are centred on the first
    /// sample before the fit since raw Unix-epoch microsecond values
    /// exceed `f64`'s exact-integer range once multiplied by the sample
    /// index.
    fn finalise_index_entry(&self) -> DataIndexEntry {
        let base = self.ts_array[0];
        let n = self.ts_array.len() as f64;
        let mut sum_t2 = 0.0f64;
        let mut sum_x = 0.0f64;
        let mut sum_xt = 0.0f64;
        for (i, &ts) in self.ts_array.iter().enumerate() {
            let t = (i + 1) as f64;
            let x = (ts - base) as f64;
            sum_t2 += t * t;
            sum_x += x;
            sum_xt += x * t;
        }

        let duration = 2.0 * n * sum_xt / sum_t2;
        let timestamp_offset = sum_x / n - (n + 1.0) * sum_xt / sum_t2;

        DataIndexEntry {
            timestamp_us: (base as f64 + timestamp_offset).round() as u64,
            duration_us: duration.round().max(0.0) as u32,
            id_zero: self.id_zero.unwrap_or(0) as u32,
        }
    }
}
