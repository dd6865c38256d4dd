//! The socket server: a blocking TCP accept loop that hands each
//! connection to its own detached thread (spec.md section 4.6, "Socket
//! server"). Shutdown closes the listening socket first, per the
//! ordering in spec.md section 5.

pub mod protocol;

use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;

use archive::ArchiveContext;
use block::FaBlock;
use buffer::pool::BufferPool;
use buffer::{ReaderId, RingBuffer};
use error::Result;
use source::{self, Source, SourceStatus};
use sync::ShutdownHandle;

/// Which live buffer a registered subscriber reader belongs to, so
/// shutdown can call `interrupt` on the right one.
enum SubscriberBuffer {
    Fa(Arc<RingBuffer<FaBlock>>),
    Decimated(Arc<RingBuffer<FaBlock>>),
}

/// Shared state every connection handler thread needs a clone of.
pub struct Shared {
    pub ctx: Arc<ArchiveContext>,
    pub pool: Arc<BufferPool>,
    pub fa_buffer: Arc<RingBuffer<FaBlock>>,
    pub decimated_buffer: Arc<RingBuffer<FaBlock>>,
    pub shutdown: ShutdownHandle,
    /// The frame source, consulted by the `S` status subcommand. `None`
    /// when the server is wired up without a live producer (e.g.
    /// archive-only inspection tools).
    source: Option<Arc<Mutex<Source>>>,
    /// The decimator's configured decimation factor, or 0 when no
    /// decimator is running, surfaced by the `C` status subcommand.
    decimation_factor: u32,
    subscribers: Mutex<Vec<(SubscriberBuffer, ReaderId, u64)>>,
}

impl Shared {
    fn register_subscriber(&self, decimated: bool, reader: ReaderId) {
        let buf = if decimated {
            SubscriberBuffer::Decimated(Arc::clone(&self.decimated_buffer))
        } else {
            SubscriberBuffer::Fa(Arc::clone(&self.fa_buffer))
        };
        self.subscribers.lock().unwrap().push((buf, reader, source::now_us()));
    }

    fn deregister_subscriber(&self, reader: ReaderId) {
        self.subscribers.lock().unwrap().retain(|(_, r, _)| *r != reader);
    }

    /// Wakes every currently blocked subscriber so their handler threads
    /// observe `Interrupted` and exit (spec.md section 5 shutdown
    /// ordering: the server stops accepting new work before the sniffer,
    /// decimator, and disk writer are torn down).
    pub fn interrupt_all_subscribers(&self) {
        for (buf, reader, _) in self.subscribers.lock().unwrap().iter() {
            match buf {
                SubscriberBuffer::Fa(b) => b.interrupt(*reader),
                SubscriberBuffer::Decimated(b) => b.interrupt(*reader),
            }
        }
    }

    pub(crate) fn source_status(&self) -> SourceStatus {
        match &self.source {
            Some(source) => source.lock().unwrap().status(),
            None => SourceStatus::default(),
        }
    }

    pub(crate) fn decimation_factor(&self) -> u32 {
        self.decimation_factor
    }

    pub(crate) fn subscriber_timestamps(&self) -> Vec<u64> {
        self.subscribers.lock().unwrap().iter().map(|(_, _, ts)| *ts).collect()
    }
}

pub struct Server {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl Server {
    pub fn bind(
        port: u16,
        ctx: Arc<ArchiveContext>,
        pool: Arc<BufferPool>,
        fa_buffer: Arc<RingBuffer<FaBlock>>,
        decimated_buffer: Arc<RingBuffer<FaBlock>>,
        shutdown: ShutdownHandle,
        source: Option<Arc<Mutex<Source>>>,
        decimation_factor: u32,
    ) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        Ok(Server {
            listener,
            shared: Arc::new(Shared {
                ctx,
                pool,
                fa_buffer,
                decimated_buffer,
                shutdown,
                source,
                decimation_factor,
                subscribers: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn local_port(&self) -> Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    pub fn shared(&self) -> Arc<Shared> {
        Arc::clone(&self.shared)
    }

    /// Accepts connections until `stop()` wakes a blocked `accept()` via a
    /// loopback self-connect, the standard trick for breaking a blocking
    /// accept loop without `select`/non-blocking sockets.
    pub fn run(&self) {
        loop {
            let stream = match self.listener.accept() {
                Ok((stream, _addr)) => stream,
                Err(_) => {
                    if self.shared.shutdown.is_shutting_down() {
                        return;
                    }
                    continue;
                }
            };
            if self.shared.shutdown.is_shutting_down() {
                return;
            }
            let shared = Arc::clone(&self.shared);
            thread::spawn(move || {
                protocol::handle_connection(stream, shared);
            });
        }
    }

    /// Closes the listening socket to new work (spec.md section 5,
    /// "server... close listening socket").
    pub fn stop(&self) {
        self.shared.shutdown.post();
        if let Ok(addr) = self.listener.local_addr() {
            let _ = TcpStream::connect(addr);
        }
    }
}
