//! The subscribe engine: streams live (or decimated) data to a client as
//! it arrives, rather than serving a bounded historical range (spec.md
//! section 4.5).
//!
//! ```text
//! S <mask> [T[E]] [Z] [U] [D]
//! ```
//!
//! Unlike the query engine, a subscriber is a *lossy* reader: if it falls
//! behind by a full buffer's worth of blocks the writer has already
//! overwritten, the connection is torn down rather than made to block the
//! live pipeline (spec.md section 4.1, "lossy readers... observe a gap").

use std::io::Write;

use archive::ArchiveContext;
use block::FaBlock;
use buffer::{ReadOutcome, ReaderId, RingBuffer};
use error::{Error, Result};
use mask::FilterMask;
use raw::DiskHeader;
use sync::ShutdownHandle;

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SubscribeOptions {
    pub include_timestamp: bool,
    pub extended_timestamp: bool,
    pub include_id_zero: bool,
    pub uncork: bool,
    pub decimated: bool,
}

#[derive(Clone, Debug)]
pub struct SubscribeRequest {
    pub mask: FilterMask,
    pub options: SubscribeOptions,
}

pub fn parse(line: &str, fa_entry_count: usize) -> Result<SubscribeRequest> {
    let mask_end = line
        .find(|c: char| !(c.is_ascii_digit() || c == '-' || c == ','))
        .unwrap_or_else(|| line.len());
    let (mask_str, rest) = line.split_at(mask_end);
    let mask = FilterMask::parse(mask_str, fa_entry_count).map_err(|reason| Error::BadRequest { reason })?;

    let mut options = SubscribeOptions::default();
    let mut chars = rest.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            'T' => {
                options.include_timestamp = true;
                if let Some('E') = chars.peek() {
                    options.extended_timestamp = true;
                    chars.next();
                }
            }
            'Z' => options.include_id_zero = true,
            'U' => options.uncork = true,
            'D' => options.decimated = true,
            other => {
                return Err(Error::BadRequest {
                    reason: format!("unknown subscribe option {:?}", other),
                })
            }
        }
    }
    Ok(SubscribeRequest { mask, options })
}

/// The decimation factor to attribute to one row of the subscribed
/// stream when deriving a synthetic per-row duration (spec.md section
/// 4.5: "duration = last_duration * (block_size * decimation) /
/// major_sample_count").
fn decimation_factor(options: &SubscribeOptions, header: &DiskHeader) -> u32 {
    if options.decimated {
        1 << header.first_decimation_log2
    } else {
        1
    }
}

fn block_duration_us(header: &DiskHeader, rows: usize, decimation: u32) -> u32 {
    if header.major_sample_count == 0 {
        return 0;
    }
    (header.last_duration as f64 * (rows as f64 * decimation as f64) / header.major_sample_count as f64).round()
        as u32
}

/// Drives one subscribed connection: reads blocks from `buffer` as a
/// lossy reader, writing the requested ids' frames to `out` until the
/// client disconnects, falls behind (overrun), observes a source gap, or
/// shutdown interrupts the reader.
///
/// `reader` must already be open on `buffer` (`open_reader(false)`) and is
/// closed by the caller, not here: the connection handler that owns it
/// also needs it to call `buffer.interrupt(reader)` from the shutdown
/// thread to wake a blocked read, the same external-interrupt pattern
/// `DiskWriter`/`Decimator` use for their reserved readers.
pub fn run<W: Write>(
    req: &SubscribeRequest,
    ctx: &ArchiveContext,
    buffer: &RingBuffer<FaBlock>,
    reader: ReaderId,
    out: &mut W,
    shutdown: &ShutdownHandle,
) -> Result<()> {
    let fa_entry_count = ctx.config().fa_entry_count;
    let ids: Vec<usize> = req.mask.ids(fa_entry_count).collect();
    run_loop(req, ctx, buffer, reader, &ids, out, shutdown)
}

/// The 8-byte prefix that precedes any stream of extended-timestamp
/// records (spec.md section 6, "Extended-timestamp record"): the row
/// count of each subsequent block and the sample offset of the first one,
/// letting a client reconstruct absolute sample indices without
/// archive-wide metadata. Written once, before the first per-block
/// record, learned from the first block actually read rather than
/// assumed up front since the producing side (raw or decimated) isn't
/// known to this module.
fn write_extended_timestamp_prefix<W: Write>(block: &FaBlock, out: &mut W) -> Result<()> {
    out.write_all(&(block.rows() as u32).to_le_bytes())
        .and_then(|_| out.write_all(&0u32.to_le_bytes()))
        .map_err(Error::from)
}

fn run_loop<W: Write>(
    req: &SubscribeRequest,
    ctx: &ArchiveContext,
    buffer: &RingBuffer<FaBlock>,
    reader: ReaderId,
    ids: &[usize],
    out: &mut W,
    shutdown: &ShutdownHandle,
) -> Result<()> {
    let mut prefix_written = !req.options.extended_timestamp;
    loop {
        if shutdown.is_shutting_down() {
            buffer.interrupt(reader);
        }
        let result = buffer.read(reader);
        match result.outcome {
            ReadOutcome::Interrupted => return Ok(()),
            ReadOutcome::Overrun => {
                buffer.release_read(reader);
                return Err(Error::WriteUnderrun);
            }
            ReadOutcome::Gap => {
                buffer.release_read(reader);
                return Err(Error::SubscriptionGap);
            }
            ReadOutcome::Data(block) => {
                let mut write_result = if prefix_written {
                    Ok(())
                } else {
                    write_extended_timestamp_prefix(&block, out)
                };
                if write_result.is_ok() {
                    write_result = write_block(req, ctx, &block, result.timestamp_us, ids, out);
                }
                buffer.release_read(reader);
                write_result?;
                prefix_written = true;
                if req.options.uncork_flush_needed() {
                    out.flush().map_err(Error::from)?;
                }
            }
        }
    }
}

fn write_block<W: Write>(
    req: &SubscribeRequest,
    ctx: &ArchiveContext,
    block: &FaBlock,
    timestamp_us: u64,
    ids: &[usize],
    out: &mut W,
) -> Result<()> {
    let header = ctx.header();

    if req.options.include_timestamp {
        if req.options.extended_timestamp {
            let duration = block_duration_us(&header, block.rows(), decimation_factor(&req.options, &header));
            out.write_all(&timestamp_us.to_le_bytes())
                .and_then(|_| out.write_all(&duration.to_le_bytes()))
                .map_err(Error::from)?;
        } else {
            out.write_all(&timestamp_us.to_le_bytes()).map_err(Error::from)?;
        }
    }
    if req.options.include_id_zero {
        let id_zero = block.id_at(0, 0).x as u32;
        out.write_all(&id_zero.to_le_bytes()).map_err(Error::from)?;
    }

    for r in 0..block.rows() {
        for &id in ids {
            let frame = block.id_at(r, id);
            out.write_all(&frame.to_le_bytes()).map_err(|e| {
                if e.kind() == ::std::io::ErrorKind::BrokenPipe {
                    Error::ClientDisconnected
                } else {
                    Error::from(e)
                }
            })?;
        }
    }
    Ok(())
}

impl SubscribeOptions {
    /// `U` requests a flush after every block instead of relying on
    /// TCP_NODELAY-style batching, trading throughput for latency (spec.md
    /// section 4.5, "uncork... low latency").
    fn uncork_flush_needed(&self) -> bool {
        self.uncork
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use archive::ArchiveContext;
    use config::ArchiveConfig;
    use raw::{Frame, NO_EVENTS_ID};
    use std::sync::Arc;
    use std::thread;
    use tempfile::NamedTempFile;

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

    #[test]
    fn parses_subscribe_request_with_options() {
        let req = parse("0-3TEZU", 8).unwrap();
        assert_eq!(req.mask.count(), 4);
        assert!(req.options.include_timestamp);
        assert!(req.options.extended_timestamp);
        assert!(req.options.include_id_zero);
        assert!(req.options.uncork);
        assert!(!req.options.decimated);
    }

    #[test]
    fn streams_one_block_then_clean_shutdown() {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_str().unwrap().to_string();
        drop(tmp);
        let ctx = ArchiveContext::create(&path, tiny_config()).unwrap();
        drop(ctx);
        let path_copy = path.clone();
        let fa_buffer = Arc::new(RingBuffer::<FaBlock>::new(4));
        let shutdown = ::sync::Shutdown::new();

        let req = parse("0-3T", 8).unwrap();
        let mut w = fa_buffer.reserve_write();
        *w = FaBlock::new(8, 1);
        for id in 0..8usize {
            w.row_mut(0)[id] = Frame::new(id as i32, -(id as i32));
        }
        fa_buffer.commit_write(w, false, 5_000_000);

        let reader = fa_buffer.open_reader(false);
        let fa_buffer2 = Arc::clone(&fa_buffer);
        let shutdown2 = Arc::clone(&shutdown);
        let handle = thread::spawn(move || {
            let mut out = Vec::new();
            let ctx = ArchiveContext::open_read_only(&path).unwrap();
            let result = run(&req, &ctx, &fa_buffer2, reader, &mut out, &shutdown2);
            (result, out)
        });

        thread::sleep(::std::time::Duration::from_millis(50));
        shutdown.post();
        fa_buffer.interrupt(reader);
        let (result, out) = handle.join().unwrap();
        result.unwrap();
        assert_eq!(&out[0..8], &5_000_000u64.to_le_bytes());

        ::std::fs::remove_file(&path_copy).ok();
    }

    #[test]
    fn extended_timestamp_stream_opens_with_block_size_offset_prefix() {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_str().unwrap().to_string();
        drop(tmp);
        let ctx = ArchiveContext::create(&path, tiny_config()).unwrap();
        drop(ctx);
        let path_copy = path.clone();
        let fa_buffer = Arc::new(RingBuffer::<FaBlock>::new(4));
        let shutdown = ::sync::Shutdown::new();

        let req = parse("0-3TEZU", 8).unwrap();
        let mut w = fa_buffer.reserve_write();
        *w = FaBlock::new(8, 2);
        for row in 0..2usize {
            for id in 0..8usize {
                w.row_mut(row)[id] = Frame::new(id as i32, -(id as i32));
            }
        }
        fa_buffer.commit_write(w, false, 5_000_000);

        let reader = fa_buffer.open_reader(false);
        let fa_buffer2 = Arc::clone(&fa_buffer);
        let shutdown2 = Arc::clone(&shutdown);
        let handle = thread::spawn(move || {
            let mut out = Vec::new();
            let ctx = ArchiveContext::open_read_only(&path).unwrap();
            let result = run(&req, &ctx, &fa_buffer2, reader, &mut out, &shutdown2);
            (result, out)
        });

        thread::sleep(::std::time::Duration::from_millis(50));
        shutdown.post();
        fa_buffer.interrupt(reader);
        let (result, out) = handle.join().unwrap();
        result.unwrap();

        // block_size = 2 rows, offset = 0, ahead of the first per-block
        // {timestamp, duration, id_zero} record.
        assert_eq!(&out[0..4], &2u32.to_le_bytes());
        assert_eq!(&out[4..8], &0u32.to_le_bytes());
        assert_eq!(&out[8..16], &5_000_000u64.to_le_bytes());

        ::std::fs::remove_file(&path_copy).ok();
    }
}
