//! Process entry point: wires the frame source, disk writer, decimator,
//! and socket server together and drives the shutdown sequence from
//! spec.md section 5 ("server, then sniffer, then decimator, then disk
//! writer").

extern crate env_logger;
extern crate fa_archiver;
extern crate libc;
extern crate nix;
#[macro_use]
extern crate log;

use std::fs;
use std::io::Write;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use nix::unistd::{fork, setsid, ForkResult};

use fa_archiver::archive::writer::DiskWriter;
use fa_archiver::block::FaBlock;
use fa_archiver::server::Server;
use fa_archiver::{
    ArchiveConfig, ArchiveContext, BufferPool, Config, DecimationConfig, DeviceSource, Decimator,
    Error, RingBuffer, Shutdown, Source,
};

static SIGNAL_RECEIVED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_: libc::c_int) {
    SIGNAL_RECEIVED.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, on_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as libc::sighandler_t);
    }
}

/// Forks into the background and detaches from the controlling terminal,
/// the conventional double-step of `fork` + `setsid` (spec.md section 6,
/// "daemon mode flag").
fn daemonize() -> Result<(), Error> {
    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => process::exit(0),
        Ok(ForkResult::Child) => {
            setsid().ok();
            Ok(())
        }
        Err(_) => Err(Error::InvalidHeader {
            reason: "failed to fork into the background".into(),
        }),
    }
}

fn open_or_create(config: &Config) -> Result<ArchiveContext, Error> {
    match ArchiveContext::open_read_write(&config.archive_path) {
        Ok(ctx) => Ok(ctx),
        Err(_) => ArchiveContext::create(&config.archive_path, ArchiveConfig::default()),
    }
}

fn load_decimation_config(config: &Config) -> Result<DecimationConfig, Error> {
    match &config.decimation_config_path {
        Some(path) => {
            let text = fs::read_to_string(path)?;
            DecimationConfig::parse(&text)
        }
        None => Ok(DecimationConfig::default()),
    }
}

fn run() -> Result<(), Error> {
    let config = Config::from_args(std::env::args())?;

    if config.daemonize {
        daemonize()?;
    }
    if let Some(pid_path) = &config.pid_file {
        if let Ok(mut f) = fs::File::create(pid_path) {
            let _ = writeln!(f, "{}", process::id());
        }
    }

    install_signal_handlers();

    let ctx = Arc::new(open_or_create(&config)?);
    let archive_config = ctx.config().clone();
    let fa_entry_count = archive_config.fa_entry_count;
    let rows_per_block = archive_config.input_block_size / archive_config.row_size();

    let pool = Arc::new(BufferPool::new(
        fa_entry_count,
        archive_config.major_sample_count * 8,
    ));
    let fa_buffer = Arc::new(RingBuffer::new(config.fa_block_count));
    let decimated_buffer = Arc::new(RingBuffer::new(config.decimated_block_count));
    let shutdown = Shutdown::new();

    let decimation_config = load_decimation_config(&config)?;

    let mut source = if config.device_name == "none" {
        Source::None
    } else {
        Source::Device(DeviceSource::new(config.device_name.clone()))
    };
    source.initialise()?;
    let source = Arc::new(Mutex::new(source));

    // Frame source thread: pulls blocks from the device and publishes
    // them to the FA circular buffer (spec.md section 4.1).
    let source_handle = {
        let source = Arc::clone(&source);
        let fa_buffer = Arc::clone(&fa_buffer);
        let shutdown = Arc::clone(&shutdown);
        thread::spawn(move || loop {
            let mut scratch = FaBlock::new(fa_entry_count, rows_per_block);
            let read_result = source.lock().unwrap().read(&mut scratch);
            match read_result {
                Ok(Some(timestamp_us)) => {
                    let mut w = fa_buffer.reserve_write();
                    *w = scratch;
                    fa_buffer.commit_write(w, false, timestamp_us);
                }
                Ok(None) => {
                    if shutdown.is_shutting_down() {
                        return;
                    }
                    let w = fa_buffer.reserve_write();
                    fa_buffer.commit_write(w, true, 0);
                    source.lock().unwrap().reset();
                }
                Err(e) => {
                    error!("frame source read failed: {}", e);
                    source.lock().unwrap().reset();
                }
            }
        })
    };

    // Disk writer thread: the only writer of the archive file.
    let mut disk_writer = DiskWriter::new(Arc::clone(&ctx), Arc::clone(&fa_buffer), Arc::clone(&shutdown));
    let disk_writer_reader = disk_writer.reader_id();
    let disk_writer_handle = thread::spawn(move || disk_writer.run());

    // Decimator thread: an independent reserved consumer of the FA
    // buffer feeding the low-rate live buffer (spec.md section 2 item 5).
    let decimator_fa_ids: Vec<usize> = (0..fa_entry_count).collect();
    let mut decimator = Decimator::new(&decimation_config, decimator_fa_ids);
    let decimator_reader = fa_buffer.open_reader(true);
    let decimator_handle = {
        let fa_buffer = Arc::clone(&fa_buffer);
        let decimated_buffer = Arc::clone(&decimated_buffer);
        let shutdown = Arc::clone(&shutdown);
        thread::spawn(move || decimator.run(&fa_buffer, decimator_reader, &decimated_buffer, &shutdown))
    };

    let server = Arc::new(Server::bind(
        config.port,
        Arc::clone(&ctx),
        Arc::clone(&pool),
        Arc::clone(&fa_buffer),
        Arc::clone(&decimated_buffer),
        Arc::clone(&shutdown),
        Some(Arc::clone(&source)),
        decimation_config.decimation_factor,
    )?);
    let shared = server.shared();
    let server_handle = {
        let server = Arc::clone(&server);
        thread::spawn(move || server.run())
    };

    while !SIGNAL_RECEIVED.load(Ordering::SeqCst) && !shutdown.is_shutting_down() {
        if shutdown.wait_timeout(Duration::from_millis(200)) {
            break;
        }
    }

    // Shutdown ordering per spec.md section 5: server, then sniffer,
    // then decimator, then disk writer.
    shutdown.post();
    shared.interrupt_all_subscribers();
    server.stop();
    server_handle.join().unwrap();

    source.lock().unwrap().interrupt();
    source_handle.join().unwrap();

    fa_buffer.interrupt(decimator_reader);
    decimator_handle.join().unwrap();

    fa_buffer.interrupt(disk_writer_reader);
    disk_writer_handle.join().unwrap();

    Ok(())
}

fn main() {
    env_logger::init();
    if let Err(e) = run() {
        error!("fatal startup error: {}", e);
        process::exit(1);
    }
}
