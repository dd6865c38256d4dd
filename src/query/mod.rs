//! The query engine (reader): resolves an `R` request into a contiguous
//! (or deliberately truncated) run of archived data and writes it to a
//! client socket (spec.md section 4.4).
//!
//! Every connection that issues an `R` request runs this engine directly
//! on its own handler thread; there is no dedicated "reader thread" the
//! way there is a disk-writer thread, since reads are bounded, one-shot
//! operations rather than a continuous drain of a live buffer.

pub mod request;

use std::io::Write;

use archive::ArchiveContext;
use buffer::pool::BufferPool;
use error::{Error, Result};
use mask::FilterMask;
use raw::{DataIndexEntry, DecimatedSample, Frame, DECIMATED_SAMPLE_SIZE, FRAME_SIZE};

pub use self::request::{parse, EndSpec, FieldMask, ReadOptions, Request, SourceKind, StartSpec};

/// A major block still carrying a valid index entry, tagged with its
/// physical slot so repeated lookups don't need to re-derive it.
#[derive(Clone, Copy)]
struct Block {
    slot: usize,
    entry: DataIndexEntry,
}

pub struct QueryEngine<'a> {
    ctx: &'a ArchiveContext,
    pool: &'a BufferPool,
}

impl<'a> QueryEngine<'a> {
    pub fn new(ctx: &'a ArchiveContext, pool: &'a BufferPool) -> Self {
        QueryEngine { ctx, pool }
    }

    /// Runs the full seven-step algorithm from spec.md section 4.4 and
    /// writes the framed response to `out`. Errors observed before any
    /// byte is written are the caller's responsibility to render as the
    /// one-line error form; errors discovered mid-stream simply truncate
    /// the connection, matching a real socket write failing partway.
    pub fn execute<W: Write>(&self, req: &Request, out: &mut W) -> Result<()> {
        let config = self.ctx.config().clone();

        if !req.mask.is_subset_of(&config.archive_mask) {
            return Err(Error::BadRequest {
                reason: "requested mask is not a subset of the archive mask".into(),
            });
        }

        // Step 1/2: resolve the start timestamp to a block under the
        // transform lock (the barrier's read permit also protects us
        // against the writer rewriting the index entry we're about to
        // read).
        let _permit = self.ctx.barrier.request_read();
        let blocks = self.valid_blocks();
        if blocks.is_empty() {
            return Err(Error::BadRequest {
                reason: "archive contains no data yet".into(),
            });
        }
        let StartSpec::Timestamp(start_us) = req.start;
        let start_pos = find_start_block(&blocks, start_us).ok_or_else(|| Error::BadRequest {
            reason: "requested start time is not archived".into(),
        })?;

        let level = SampleLevel::of(&req.source);
        let samples_per_block = level.samples_per_block(&config);

        // Step 3: resolve the end specifier into an absolute timestamp,
        // and the number of samples that specifier asked for, used below
        // to decide whether a short result must be rejected or may be
        // silently truncated.
        let first_period = block_period_us(&blocks[start_pos].entry, samples_per_block);
        let end_us = match req.end {
            EndSpec::Timestamp(ts) => ts,
            EndSpec::Samples(n) => start_us + (n as f64 * first_period).round() as u64,
        };
        let requested_samples: u64 = match req.end {
            EndSpec::Samples(n) => n,
            EndSpec::Timestamp(_) => {
                if first_period > 0.0 {
                    ((end_us.saturating_sub(start_us)) as f64 / first_period).round() as u64
                } else {
                    0
                }
            }
        };

        // Step 4: walk forward collecting the run of blocks covering
        // [start_us, end_us), checking contiguity if requested.
        let mut run = Vec::new();
        let mut available_samples: u64 = 0;
        let mut prev_end: Option<u64> = None;
        for &block in &blocks[start_pos..] {
            if let Some(prev_end) = prev_end {
                let gap = block.entry.timestamp_us.saturating_sub(prev_end);
                if gap > config.max_delta_t_us as u64 {
                    if req.options.require_contiguous {
                        return Err(Error::NotContiguous {
                            available: available_samples,
                        });
                    }
                    break;
                }
            }
            prev_end = Some(block.entry.end_timestamp_us());
            available_samples += samples_per_block as u64;
            run.push(block);
            if block.entry.end_timestamp_us() >= end_us {
                break;
            }
        }
        if run.is_empty() {
            return Err(Error::BadRequest {
                reason: "requested range is empty".into(),
            });
        }

        // Step 5: admission. One buffer per requested id, failing
        // immediately rather than blocking behind other readers.
        let ids: Vec<usize> = req.mask.ids(config.fa_entry_count).collect();
        let _lease = self.pool.lock_buffers(ids.len())?;

        // Step 6/7: per-block read, transpose, and frame the response.
        let archive_ids: Vec<usize> = config.archive_mask.ids(config.fa_entry_count).collect();
        let slots: Vec<usize> = ids
            .iter()
            .map(|id| archive_ids.iter().position(|a| a == id).expect("id is in archive mask"))
            .collect();

        let mut rows: Vec<Vec<OutputSample>> = Vec::new();
        for block in &run {
            let (row_start, row_end) = clip_rows(&block.entry, samples_per_block, start_us, end_us);
            for row in row_start..row_end {
                let mut line = Vec::with_capacity(slots.len());
                for &slot in &slots {
                    line.push(self.read_sample(&config, &req.source, block.slot, slot, row));
                }
                rows.push(line);
            }
        }

        // Step 7 (truncation contract, spec.md section 4.4): without `A`
        // a short result is an error, not a silently smaller response.
        if !req.options.accept_truncated && (rows.len() as u64) < requested_samples {
            return Err(Error::BadRequest {
                reason: format!(
                    "requested {} samples but only {} are available; retry with A to accept a truncated read",
                    requested_samples,
                    rows.len()
                ),
            });
        }

        let first_row_offset = clip_rows(&run[0].entry, samples_per_block, start_us, end_us).0;
        self.write_response(out, req, &run, &rows, samples_per_block as u32, first_row_offset as u32)?;
        Ok(())
    }

    fn valid_blocks(&self) -> Vec<Block> {
        let header = self.ctx.header();
        let count = header.major_block_count as usize;
        let current = header.current_major_block as usize;
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            let slot = (current + 1 + i) % count;
            if slot == current {
                continue;
            }
            let entry = self.ctx.index_entry(slot);
            if entry.is_valid() {
                out.push(Block { slot, entry });
            }
        }
        out
    }

    fn read_sample(
        &self,
        config: &::config::ArchiveConfig,
        source: &SourceKind,
        block_slot: usize,
        archive_slot: usize,
        row: usize,
    ) -> OutputSample {
        let header = self.ctx.header();
        let segment_size = raw_segment_size(config) + d_segment_size(config);
        let block_base = block_slot as u64 * header.major_block_size as u64;

        match source {
            SourceKind::Fa => {
                let offset = block_base
                    + (archive_slot * segment_size) as u64
                    + (row * FRAME_SIZE) as u64;
                let mut buf = [0u8; FRAME_SIZE];
                self.ctx.pread_major(offset, &mut buf).ok();
                OutputSample::Frame(Frame::from_le_bytes(&buf))
            }
            SourceKind::D(fields) => {
                let raw_size = raw_segment_size(config);
                let offset = block_base
                    + (archive_slot * segment_size) as u64
                    + raw_size as u64
                    + (row * DECIMATED_SAMPLE_SIZE) as u64;
                let mut buf = [0u8; DECIMATED_SAMPLE_SIZE];
                self.ctx.pread_major(offset, &mut buf).ok();
                OutputSample::Decimated(DecimatedSample::from_le_bytes(&buf), *fields)
            }
            SourceKind::Dd(fields) => {
                let dd_sample_count = config.dd_sample_count();
                let dd_offset = (block_slot * dd_sample_count + row) % config.dd_total_count();
                let sample = self.ctx.read_dd_sample(archive_slot, dd_offset);
                OutputSample::Decimated(sample, *fields)
            }
        }
    }

    /// Frames the response per spec.md section 4.4's socket contract: a
    /// leading zero byte marks success (an error instead renders as a
    /// single text line, handled by the caller before any engine bytes
    /// are written), then the optional pieces in a fixed order:
    /// `[count][timestamp header][id_zero][data][aggregate timestamps]`.
    ///
    /// `block_size`/`first_offset` are the level's samples-per-block and
    /// the clipped starting row of `run[0]`, written as the 8-byte prefix
    /// ahead of the aggregate-timestamp records (spec.md section 6,
    /// "Extended-timestamp record") so a client can reconstruct absolute
    /// sample indices without re-deriving them from the archive's index.
    fn write_response<W: Write>(
        &self,
        out: &mut W,
        req: &Request,
        run: &[Block],
        rows: &[Vec<OutputSample>],
        block_size: u32,
        first_offset: u32,
    ) -> Result<()> {
        out.write_all(&[0u8])?;

        if req.options.prepend_count {
            out.write_all(&(rows.len() as u32).to_le_bytes())?;
        }

        if req.options.include_timestamp {
            let first = &run[0].entry;
            if req.options.extended_timestamp {
                out.write_all(&first.to_le_bytes())?;
            } else {
                out.write_all(&first.timestamp_us.to_le_bytes())?;
            }
        }

        if req.options.include_id_zero {
            out.write_all(&run[0].entry.id_zero.to_le_bytes())?;
        }

        for row in rows {
            for sample in row {
                sample.write_to(out)?;
            }
        }

        if req.options.aggregate_timestamp {
            out.write_all(&block_size.to_le_bytes())?;
            out.write_all(&first_offset.to_le_bytes())?;
            out.write_all(&(run.len() as u32).to_le_bytes())?;
            for block in run {
                out.write_all(&block.entry.to_le_bytes())?;
            }
        }

        Ok(())
    }
}

/// The three rates data can be requested at; each has its own
/// per-major-block sample count and hence its own sample period.
enum SampleLevel {
    Fa,
    D,
    Dd,
}

impl SampleLevel {
    fn of(source: &SourceKind) -> Self {
        match source {
            SourceKind::Fa => SampleLevel::Fa,
            SourceKind::D(_) => SampleLevel::D,
            SourceKind::Dd(_) => SampleLevel::Dd,
        }
    }

    fn samples_per_block(&self, config: &::config::ArchiveConfig) -> usize {
        match self {
            SampleLevel::Fa => config.major_sample_count,
            SampleLevel::D => config.d_sample_count(),
            SampleLevel::Dd => config.dd_sample_count(),
        }
    }
}

fn raw_segment_size(config: &::config::ArchiveConfig) -> usize {
    config.major_sample_count * FRAME_SIZE
}

fn d_segment_size(config: &::config::ArchiveConfig) -> usize {
    config.d_sample_count() * DECIMATED_SAMPLE_SIZE
}

fn block_period_us(entry: &DataIndexEntry, samples_per_block: usize) -> f64 {
    entry.duration_us as f64 / samples_per_block.max(1) as f64
}

/// Which rows of `entry`'s block fall within `[start_us, end_us)`, at the
/// given level's sample rate.
fn clip_rows(entry: &DataIndexEntry, samples_per_block: usize, start_us: u64, end_us: u64) -> (usize, usize) {
    let period = block_period_us(entry, samples_per_block);
    let row_of = |t: u64| -> i64 {
        if period <= 0.0 {
            0
        } else {
            ((t as f64 - entry.timestamp_us as f64) / period).round() as i64
        }
    };
    let start_row = row_of(start_us).max(0) as usize;
    let end_row = row_of(end_us).max(0) as usize;
    (start_row.min(samples_per_block), end_row.min(samples_per_block).max(start_row.min(samples_per_block)))
}

/// Binary search over chronologically ordered blocks for the first one
/// whose span contains (or immediately follows) `start_us`.
fn find_start_block(blocks: &[Block], start_us: u64) -> Option<usize> {
    let mut lo = 0usize;
    let mut hi = blocks.len();
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if blocks[mid].entry.end_timestamp_us() <= start_us {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    if lo < blocks.len() {
        Some(lo)
    } else {
        None
    }
}

enum OutputSample {
    Frame(Frame),
    Decimated(DecimatedSample, FieldMask),
}

impl OutputSample {
    fn write_to<W: Write>(&self, out: &mut W) -> Result<()> {
        match self {
            OutputSample::Frame(f) => out.write_all(&f.to_le_bytes())?,
            OutputSample::Decimated(sample, fields) => {
                if fields.has(FieldMask::MEAN) {
                    out.write_all(&sample.mean.to_le_bytes())?;
                }
                if fields.has(FieldMask::MIN) {
                    out.write_all(&sample.min.to_le_bytes())?;
                }
                if fields.has(FieldMask::MAX) {
                    out.write_all(&sample.max.to_le_bytes())?;
                }
                if fields.has(FieldMask::STD) {
                    out.write_all(&sample.std.to_le_bytes())?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use archive::ArchiveContext;
    use block::FaBlock;
    use buffer::pool::BufferPool;
    use config::ArchiveConfig;
    use raw::{Frame, NO_EVENTS_ID};
    use tempfile::NamedTempFile;
    use transform::Transform;

    fn tiny_config() -> ArchiveConfig {
        ArchiveConfig {
            fa_entry_count: 8,
            archive_mask: FilterMask::parse("0-3", 8).unwrap(),
            input_block_size: 128,
            major_sample_count: 16,
            first_decimation_log2: 2,
            second_decimation_log2: 2,
            timestamp_iir_weight: 0.1,
            events_fa_id: NO_EVENTS_ID,
            max_delta_t_us: ::raw::DEFAULT_MAX_DELTA_T,
            major_block_count: 4,
        }
    }

    fn populate_one_block(path: &str) -> ArchiveContext {
        let ctx = ArchiveContext::create(path, tiny_config()).unwrap();
        let mut xform = Transform::new(tiny_config());
        let mut buf = vec![0u8; tiny_config().major_block_size()];
        let mut ts = 1_000_000u64;
        for row in 0..16i32 {
            let mut block = FaBlock::new(8, 1);
            for id in 0..8usize {
                block.row_mut(0)[id] = Frame::new(row, -row);
            }
            if let Some(entry) = xform.process_block(&ctx, &mut buf, &block, ts, 0) {
                let header = ctx.header();
                let offset = 0u64 * header.major_block_size as u64;
                ctx.pwrite_major(offset, &buf).unwrap();
                ctx.set_index_entry(0, entry).unwrap();
                let mut header = ctx.header();
                header.current_major_block = 1;
                ctx.write_header(&header).unwrap();
            }
            ts += 10;
        }
        ctx
    }

    #[test]
    fn reads_full_fa_range_for_requested_mask() {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_str().unwrap().to_string();
        drop(tmp);
        let ctx = populate_one_block(&path);
        let pool = BufferPool::new(8, 4096);
        let engine = QueryEngine::new(&ctx, &pool);

        let req = parse("FM0-3S1.000000N16NT", 8).unwrap();
        let mut out = Vec::new();
        engine.execute(&req, &mut out).unwrap();

        assert_eq!(out[0], 0);
        let count = u32::from_le_bytes([out[1], out[2], out[3], out[4]]);
        assert_eq!(count, 16);

        ::std::fs::remove_file(&path).ok();
    }

    /// Writes `n` sixteen-row major blocks starting at `base_ts`, spaced
    /// `step_us` apart in wall time, leaving `current_major_block` pointed
    /// past the last one written.
    fn populate_blocks(path: &str, blocks: &[(u64, i32)]) -> ArchiveContext {
        let ctx = ArchiveContext::create(path, tiny_config()).unwrap();
        let mut xform = Transform::new(tiny_config());
        let mut buf = vec![0u8; tiny_config().major_block_size()];

        for (slot, &(base_ts, row_start)) in blocks.iter().enumerate() {
            let mut ts = base_ts;
            for i in 0..16i32 {
                let row = row_start + i;
                let mut block = FaBlock::new(8, 1);
                for id in 0..8usize {
                    block.row_mut(0)[id] = Frame::new(row, -row);
                }
                if let Some(entry) = xform.process_block(&ctx, &mut buf, &block, ts, slot) {
                    let header = ctx.header();
                    let offset = slot as u64 * header.major_block_size as u64;
                    ctx.pwrite_major(offset, &buf).unwrap();
                    ctx.set_index_entry(slot, entry).unwrap();
                    let mut header = ctx.header();
                    header.current_major_block = (slot + 1) as u32;
                    ctx.write_header(&header).unwrap();
                }
                ts += 10;
            }
        }
        ctx
    }

    #[test]
    fn non_contiguous_read_reports_samples_available_before_the_gap() {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_str().unwrap().to_string();
        drop(tmp);

        // Two contiguous blocks (32 raw samples), then a third block whose
        // timestamp jumps far enough ahead to exceed max_delta_t_us.
        let ctx = populate_blocks(
            &path,
            &[(1_000_000, 0), (1_000_160, 16), (1_000_160 + 10_000_000, 32)],
        );
        let pool = BufferPool::new(8, 4096);
        let engine = QueryEngine::new(&ctx, &pool);

        let req = parse("FM0-3S1.000000N64CN", 8).unwrap();
        let mut out = Vec::new();
        match engine.execute(&req, &mut out) {
            Err(Error::NotContiguous { available }) => assert_eq!(available, 32),
            other => panic!("expected NotContiguous, got {:?}", other.err().map(|e| e.to_string())),
        }

        ::std::fs::remove_file(&path).ok();
    }

    #[test]
    fn rejects_mask_outside_archive_mask() {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_str().unwrap().to_string();
        drop(tmp);
        let ctx = populate_one_block(&path);
        let pool = BufferPool::new(8, 4096);
        let engine = QueryEngine::new(&ctx, &pool);

        let req = parse("FM6S1.000000N16", 8).unwrap();
        let mut out = Vec::new();
        assert!(engine.execute(&req, &mut out).is_err());

        ::std::fs::remove_file(&path).ok();
    }

    #[test]
    fn aggregate_timestamp_response_opens_with_block_size_offset_prefix() {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_str().unwrap().to_string();
        drop(tmp);
        let ctx = populate_one_block(&path);
        let pool = BufferPool::new(8, 4096);
        let engine = QueryEngine::new(&ctx, &pool);

        let req = parse("FM0-3S1.000000N16TA", 8).unwrap();
        let mut out = Vec::new();
        engine.execute(&req, &mut out).unwrap();

        assert_eq!(out[0], 0);
        // include_timestamp (plain, not extended) header: 8 bytes.
        let after_header = &out[1 + 8..];
        // block_size = 16 samples/block, offset = 0, one block in the run.
        assert_eq!(&after_header[0..4], &16u32.to_le_bytes());
        assert_eq!(&after_header[4..8], &0u32.to_le_bytes());
        let data_len = 16 * 4 * FRAME_SIZE;
        let aggregate = &after_header[8 + data_len..];
        assert_eq!(&aggregate[0..4], &1u32.to_le_bytes());

        ::std::fs::remove_file(&path).ok();
    }

    #[test]
    fn rejects_truncated_read_without_accept_flag() {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_str().unwrap().to_string();
        drop(tmp);
        let ctx = populate_one_block(&path);
        let pool = BufferPool::new(8, 4096);
        let engine = QueryEngine::new(&ctx, &pool);

        let req = parse("FM0-3S1.000000N64", 8).unwrap();
        let mut out = Vec::new();
        match engine.execute(&req, &mut out) {
            Err(Error::BadRequest { .. }) => {}
            other => panic!("expected BadRequest, got {:?}", other.err().map(|e| e.to_string())),
        }

        ::std::fs::remove_file(&path).ok();
    }

    #[test]
    fn accept_truncated_flag_allows_short_read() {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_str().unwrap().to_string();
        drop(tmp);
        let ctx = populate_one_block(&path);
        let pool = BufferPool::new(8, 4096);
        let engine = QueryEngine::new(&ctx, &pool);

        let req = parse("FM0-3S1.000000N64A", 8).unwrap();
        let mut out = Vec::new();
        engine.execute(&req, &mut out).unwrap();
        assert_eq!(out[0], 0);

        ::std::fs::remove_file(&path).ok();
    }

    #[test]
    fn admission_failure_surfaces_read_too_busy() {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_str().unwrap().to_string();
        drop(tmp);
        let ctx = populate_one_block(&path);
        let pool = BufferPool::new(1, 4096);
        let _lease = pool.lock_buffers(1).unwrap();
        let engine = QueryEngine::new(&ctx, &pool);

        let req = parse("FM0-3S1.000000N16", 8).unwrap();
        let mut out = Vec::new();
        match engine.execute(&req, &mut out) {
            Err(Error::ReadTooBusy) => {}
            other => panic!("expected ReadTooBusy, got {:?}", other.err().map(|e| e.to_string())),
        }

        ::std::fs::remove_file(&path).ok();
    }
}
