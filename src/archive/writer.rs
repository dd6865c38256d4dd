//! The disk writer thread: drains the FA circular buffer as a reserved
//! reader, runs each block through the transform, and submits completed
//! major blocks to the archive file (spec.md section 4.2). Owns the
//! page-aligned double buffer the transform fills in place.

use std::sync::Arc;

use archive::ArchiveContext;
use block::FaBlock;
use buffer::{ReadOutcome, ReaderId, RingBuffer};
use error::{Error, ErrorStack, Result};
use sync::ShutdownHandle;
use transform::Transform;

/// Runs on the disk-writer thread until shutdown or a fatal I/O error.
/// Per spec.md section 7, a write error is fatal: the archiver logs and
/// shuts down rather than attempting to recover mid-stream.
pub struct DiskWriter {
    ctx: Arc<ArchiveContext>,
    fa_buffer: Arc<RingBuffer<FaBlock>>,
    reader: ReaderId,
    transform: Transform,
    buffers: [Vec<u8>; 2],
    active: usize,
    current_major_block: usize,
    shutdown: ShutdownHandle,
}

impl DiskWriter {
    pub fn new(
        ctx: Arc<ArchiveContext>,
        fa_buffer: Arc<RingBuffer<FaBlock>>,
        shutdown: ShutdownHandle,
    ) -> Self {
        let reader = fa_buffer.open_reader(true);
        let config = ctx.config().clone();
        let major_block_size = config.major_block_size();
        let current_major_block = ctx.header().current_major_block as usize;
        DiskWriter {
            ctx,
            fa_buffer,
            reader,
            transform: Transform::new(config),
            buffers: [vec![0u8; major_block_size], vec![0u8; major_block_size]],
            active: 0,
            current_major_block,
            shutdown,
        }
    }

    /// The reader id this writer holds on `fa_buffer`, so the shutdown
    /// sequence can wake a blocked `run()` via `fa_buffer.interrupt`
    /// (spec.md section 5, "shutdown terminates... disk writer").
    pub fn reader_id(&self) -> ReaderId {
        self.reader
    }

    /// Runs the blocking read-transform-submit loop. Returns once
    /// `interrupt` wakes a blocked read during orderly shutdown, or
    /// immediately on the first fatal archive I/O error.
    pub fn run(&mut self) {
        let mut errors = ErrorStack::new();
        loop {
            if self.shutdown.is_shutting_down() {
                self.fa_buffer.interrupt(self.reader);
            }

            let result = self.fa_buffer.read(self.reader);
            match result.outcome {
                ReadOutcome::Interrupted => break,
                ReadOutcome::Overrun => {
                    unreachable!("reserved readers are never overrun")
                }
                ReadOutcome::Gap => {
                    self.transform.reset_block();
                    self.fa_buffer.release_read(self.reader);
                }
                ReadOutcome::Data(block) => {
                    let timestamp_us = result.timestamp_us;
                    if let Err(e) = self.submit(block, timestamp_us) {
                        errors.push(e);
                        errors.drain_to_log("disk writer");
                        break;
                    }
                    self.fa_buffer.release_read(self.reader);
                }
            }
        }
        self.fa_buffer.close_reader(self.reader);
    }

    fn submit(&mut self, block: FaBlock, timestamp_us: u64) -> Result<()> {
        let buf = &mut self.buffers[self.active];
        let entry = self.transform.process_block(
            &self.ctx,
            buf,
            &block,
            timestamp_us,
            self.current_major_block,
        );

        let entry = match entry {
            Some(entry) => entry,
            None => return Ok(()),
        };

        // Major block filled: submit it under the write-priority barrier,
        // then switch to the other half of the double buffer so the
        // transform can keep accumulating the next block immediately.
        {
            let _permit = self.ctx.barrier.request_write();
            let header = self.ctx.header();
            let offset = self.current_major_block as u64 * header.major_block_size as u64;
            let written = self.ctx.pwrite_major(offset, buf)?;
            if written != buf.len() {
                return Err(Error::ArchiveIo {
                    inner: ::std::io::Error::new(
                        ::std::io::ErrorKind::WriteZero,
                        "short write of major block",
                    ),
                });
            }
        }

        self.ctx.set_index_entry(self.current_major_block, entry)?;
        self.ctx.sync_dd()?;

        let mut header = self.ctx.header();
        let alpha = header.timestamp_iir_weight;
        header.last_duration = if header.last_duration == 0 {
            entry.duration_us
        } else {
            (alpha * entry.duration_us as f64 + (1.0 - alpha) * header.last_duration as f64)
                .round() as u32
        };
        self.current_major_block = (self.current_major_block + 1) % header.major_block_count as usize;
        header.current_major_block = self.current_major_block as u32;
        self.ctx.write_header(&header)?;

        self.active = 1 - self.active;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::ArchiveConfig;
    use mask::FilterMask;
    use raw::{Frame, NO_EVENTS_ID};
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
    fn writes_one_major_block_and_advances_index() {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_str().unwrap().to_string();
        drop(tmp);

        let ctx = Arc::new(ArchiveContext::create(&path, tiny_config()).unwrap());
        let fa_buffer = Arc::new(RingBuffer::<FaBlock>::new(8));
        let shutdown = ::sync::Shutdown::new();

        let mut writer = DiskWriter::new(Arc::clone(&ctx), Arc::clone(&fa_buffer), Arc::clone(&shutdown));
        let reader_id = writer.reader_id();
        let writer_fa_buffer = Arc::clone(&fa_buffer);

        let handle = ::std::thread::spawn(move || writer.run());

        for row in 0..16i32 {
            let mut w = fa_buffer.reserve_write();
            *w = FaBlock::new(8, 1);
            for id in 0..8usize {
                w.row_mut(0)[id] = Frame::new(row, -row);
            }
            fa_buffer.commit_write(w, false, 1_000_000 + row as u64 * 10);
        }

        // Give the background thread a chance to drain the 16 rows before
        // waking its blocked read on the (now empty) buffer.
        ::std::thread::sleep(::std::time::Duration::from_millis(100));
        writer_fa_buffer.interrupt(reader_id);
        handle.join().unwrap();

        let header = ctx.header();
        assert_eq!(header.current_major_block, 1);
        let entry = ctx.index_entry(0);
        assert!(entry.is_valid());
        assert_eq!(entry.timestamp_us, 1_000_000);

        ::std::fs::remove_file(&path).ok();
    }
}
