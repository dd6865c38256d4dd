//! Drives the archiver through its real socket front door: a disk writer
//! thread drains a ring buffer into an archive file while a bound `Server`
//! answers queries and status requests over TCP, exercising the same path
//! a real client would.

extern crate fa_archiver;
extern crate tempfile;

use std::convert::TryInto;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use fa_archiver::archive::writer::DiskWriter;
use fa_archiver::block::FaBlock;
use fa_archiver::raw::{Frame, NO_EVENTS_ID};
use fa_archiver::server::Server;
use fa_archiver::{ArchiveConfig, ArchiveContext, BufferPool, FilterMask, ReaderId, RingBuffer, Shutdown};
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
        max_delta_t_us: fa_archiver::raw::DEFAULT_MAX_DELTA_T,
        major_block_count: 4,
    }
}

struct Harness {
    server: Arc<Server>,
    server_handle: Option<thread::JoinHandle<()>>,
    disk_writer_handle: Option<thread::JoinHandle<()>>,
    disk_writer_reader: ReaderId,
    fa_buffer: Arc<RingBuffer<FaBlock>>,
    shutdown: fa_archiver::ShutdownHandle,
    port: u16,
    archive_path: String,
}

impl Harness {
    /// Brings up a disk writer and a bound server against a fresh archive,
    /// with no data written yet.
    fn start() -> Harness {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_str().unwrap().to_string();
        drop(tmp);

        let ctx = Arc::new(ArchiveContext::create(&path, tiny_config()).unwrap());
        let pool = Arc::new(BufferPool::new(8, 4096));
        let fa_buffer = Arc::new(RingBuffer::new(4));
        let decimated_buffer = Arc::new(RingBuffer::new(4));
        let shutdown = Shutdown::new();

        let mut disk_writer = DiskWriter::new(Arc::clone(&ctx), Arc::clone(&fa_buffer), Arc::clone(&shutdown));
        let disk_writer_reader = disk_writer.reader_id();
        let disk_writer_handle = thread::spawn(move || disk_writer.run());

        let server = Arc::new(
            Server::bind(
                0,
                ctx,
                pool,
                Arc::clone(&fa_buffer),
                decimated_buffer,
                Arc::clone(&shutdown),
                None,
                0,
            )
            .unwrap(),
        );
        let port = server.local_port().unwrap();
        let server_handle = {
            let server = Arc::clone(&server);
            thread::spawn(move || server.run())
        };

        Harness {
            server,
            server_handle: Some(server_handle),
            disk_writer_handle: Some(disk_writer_handle),
            disk_writer_reader,
            fa_buffer,
            shutdown,
            port,
            archive_path: path,
        }
    }

    fn write_row(&self, x: i32, timestamp_us: u64) {
        let mut w = self.fa_buffer.reserve_write();
        *w = FaBlock::new(8, 1);
        for id in 0..8usize {
            w.row_mut(0)[id] = Frame::new(x, -x);
        }
        self.fa_buffer.commit_write(w, false, timestamp_us);
    }

    /// Waits until the archive's last slot (slot `major_block_count - 1`)
    /// carries a valid index entry, i.e. the writer has gone all the way
    /// around the ring at least once.
    fn wait_for_major_blocks(&self, last_slot: usize) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let ctx = ArchiveContext::open_read_only(&self.archive_path).unwrap();
            if ctx.index_entry(last_slot).is_valid() {
                return;
            }
            assert!(std::time::Instant::now() < deadline, "timed out waiting for major blocks");
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn connect(&self) -> TcpStream {
        TcpStream::connect(("127.0.0.1", self.port)).unwrap()
    }

    fn shutdown(mut self) {
        self.shutdown.post();
        self.server.stop();
        self.server_handle.take().unwrap().join().unwrap();

        self.fa_buffer.interrupt(self.disk_writer_reader);
        self.disk_writer_handle.take().unwrap().join().unwrap();

        ::std::fs::remove_file(&self.archive_path).ok();
    }
}

fn write_scenario_one_block(h: &Harness) {
    let mut ts = 1_000_000u64;
    for row in 0..16i32 {
        h.write_row(row, ts);
        ts += 10;
    }
}

#[test]
fn scenario_two_query_returns_framed_fa_data() {
    let h = Harness::start();
    write_scenario_one_block(&h);
    // Slot 0 stays valid (not yet due for reuse) until the writer wraps
    // all the way back around the ring, so a single block is enough.
    h.wait_for_major_blocks(0);

    let mut stream = h.connect();
    stream.write_all(b"RFM0-3S1.000000N16NT\n").unwrap();

    let mut response = vec![0u8; 1 + 4 + 8 + 4 * 16 * 8];
    stream.read_exact(&mut response).unwrap();

    assert_eq!(response[0], 0);
    let count = u32::from_le_bytes([response[1], response[2], response[3], response[4]]);
    assert_eq!(count, 16);
    let timestamp = u64::from_le_bytes(response[5..13].try_into().unwrap());
    assert_eq!(timestamp, 1_000_000);

    // First frame of the first row: id 0, x = row 0 = 0.
    let first_frame = &response[13..21];
    assert_eq!(i32::from_le_bytes(first_frame[0..4].try_into().unwrap()), 0);
    assert_eq!(i32::from_le_bytes(first_frame[4..8].try_into().unwrap()), 0);

    h.shutdown();
}

#[test]
fn scenario_three_gap_yields_contiguity_error() {
    let h = Harness::start();

    // Two contiguous blocks, then a jump far enough to break contiguity,
    // stopping short of wrapping the four-slot ring back onto slot 0.
    let mut ts = 1_000_000u64;
    for row in 0..32i32 {
        h.write_row(row, ts);
        ts += 10;
    }
    ts += 10_000_000;
    for row in 32..48i32 {
        h.write_row(row, ts);
        ts += 10;
    }
    h.wait_for_major_blocks(2);

    let mut stream = h.connect();
    stream.write_all(b"RFM0-3S1.000000N64CN\n").unwrap();

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    assert_eq!(line.trim_end(), "Only 32 contiguous samples available");

    h.shutdown();
}

#[test]
fn scenario_five_status_batch_reports_one_line_per_subcommand() {
    let h = Harness::start();

    let mut stream = h.connect();
    stream.write_all(b"CFdDVMC\n").unwrap();

    let mut reader = BufReader::new(stream);
    let mut lines = Vec::new();
    for _ in 0..6 {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        lines.push(line.trim_end().to_string());
    }

    // No major block has completed yet, so the IIR-smoothed last_duration
    // is still its initial zero and the mean frame rate reads 0.00.
    assert_eq!(lines[0], "0.00");
    assert_eq!(lines[1], "2");
    assert_eq!(lines[2], "2");
    assert!(lines[3].contains('.'));
    assert_eq!(lines[4].len(), 2); // fa_entry_count=8 -> 8/4=2 hex nibbles
    assert_eq!(lines[5], "0"); // no decimator wired up in this harness

    h.shutdown();
}
