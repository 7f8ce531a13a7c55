use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::mpsc::{sync_channel, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context as _, Result};
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::{close, read, write};
use parking_lot::Mutex;
use slog::{debug, error, o, trace, warn, Logger};

use crate::wire::{self, Flavor, Frame, Service};

/// Opaque attachment to the transport. The transport never exposes the
/// underlying client id beyond what a caller needs to issue further
/// requests against the same attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle {
    pub(crate) service: Service,
    pub(crate) client_id: u8,
}

pub type IndicationCallback = Box<dyn Fn(&[u8]) + Send + Sync>;

struct PendingTable {
    next_transaction_id: AtomicU16,
    waiters: Mutex<HashMap<(Service, u16), SyncSender<Frame>>>,
}

impl PendingTable {
    fn new() -> Self {
        Self {
            next_transaction_id: AtomicU16::new(1),
            waiters: Mutex::new(HashMap::new()),
        }
    }

    fn next_transaction_id(&self) -> u16 {
        // QMI transaction ids are per-service and must not be 0; wrap
        // around skipping 0.
        loop {
            let id = self.next_transaction_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }
}

struct Shared {
    fd: RawFd,
    log: Logger,
    pending: PendingTable,
    indications: Mutex<HashMap<(Service, u8), IndicationCallback>>,
    next_client_id: Mutex<HashMap<Service, u8>>,
}

/// The control transport handle: exactly one per process, opened before any
/// service attaches, closed only after every service has detached. Owns
/// the reader thread that demultiplexes responses from indications off the
/// single character-device file descriptor.
pub struct Transport {
    shared: Arc<Shared>,
    reader: Option<std::thread::JoinHandle<()>>,
}

impl Transport {
    /// Open `path` in direct-interface mode — i.e. talking to the cdc-wdm
    /// character device directly rather than through a proxy daemon
    /// multiplexing several clients onto one device node.
    pub fn open(path: &str, log: Logger) -> Result<Self> {
        let fd = open(path, OFlag::O_RDWR | OFlag::O_NONBLOCK, Mode::empty())
            .with_context(|| format!("failed to open modem device node {path}"))?;

        let shared = Arc::new(Shared {
            fd,
            log: log.new(o!("component" => "qmi-transport")),
            pending: PendingTable::new(),
            indications: Mutex::new(HashMap::new()),
            next_client_id: Mutex::new(HashMap::new()),
        });

        let reader_shared = Arc::clone(&shared);
        let reader = std::thread::Builder::new()
            .name("qmi-indications".into())
            .spawn(move || reader_loop(reader_shared))
            .context("failed to spawn QMI indication reader thread")?;

        Ok(Self {
            shared,
            reader: Some(reader),
        })
    }

    /// Attach a service, registering an optional indication callback.
    /// `indication` is delivered every raw TLV payload for a packet
    /// addressed to this handle's (service, client_id); it runs on the
    /// reader thread, the only thread internal to this transport.
    pub fn attach(
        &self,
        service: Service,
        indication: Option<IndicationCallback>,
    ) -> Result<Handle> {
        let client_id = {
            let mut alloc = self.shared.next_client_id.lock();
            let next = alloc.entry(service).or_insert(0);
            *next += 1;
            *next
        };
        let handle = Handle { service, client_id };
        if let Some(cb) = indication {
            self.shared.indications.lock().insert((service, client_id), cb);
        }
        debug!(self.shared.log, "attached service"; "service" => ?service, "client_id" => client_id);
        Ok(handle)
    }

    /// Detach a previously attached handle. Every attach must be matched
    /// by a detach before the transport itself is torn down; violating
    /// that order is treated as a programmer error (debug-asserted in
    /// `Drop`, not runtime-handled).
    pub fn detach(&self, handle: Handle) -> Result<()> {
        self.shared
            .indications
            .lock()
            .remove(&(handle.service, handle.client_id));
        debug!(self.shared.log, "detached service"; "service" => ?handle.service, "client_id" => handle.client_id);
        Ok(())
    }

    /// Issue a request and block for the matching response, or time out.
    /// This is the transport's only blocking point from the caller's
    /// perspective.
    pub fn request(
        &self,
        handle: Handle,
        message_id: u16,
        tlvs: &[u8],
        timeout: Duration,
    ) -> Result<Frame> {
        let transaction_id = self.shared.pending.next_transaction_id();
        let (tx, rx) = sync_channel(1);
        self.shared
            .pending
            .waiters
            .lock()
            .insert((handle.service, transaction_id), tx);

        let encoded =
            wire::encode_request(handle.service, handle.client_id, transaction_id, message_id, tlvs);
        if let Err(e) = write(self.shared.fd, &encoded) {
            self.shared
                .pending
                .waiters
                .lock()
                .remove(&(handle.service, transaction_id));
            return Err(anyhow!("write() to modem device failed: {e}"));
        }

        match rx.recv_timeout(timeout) {
            Ok(frame) => Ok(frame),
            Err(RecvTimeoutError::Timeout) => {
                self.shared
                    .pending
                    .waiters
                    .lock()
                    .remove(&(handle.service, transaction_id));
                Err(anyhow!(
                    "timed out waiting for response to message {:#06x} on {:?}",
                    message_id,
                    handle.service
                ))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(anyhow!("QMI transport reader thread exited unexpectedly"))
            }
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        debug_assert!(
            self.shared.indications.lock().is_empty(),
            "Transport dropped with services still attached"
        );
        let _ = close(self.shared.fd);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

fn reader_loop(shared: Arc<Shared>) {
    let mut buf = Vec::with_capacity(4096);
    let mut scratch = [0u8; 4096];
    loop {
        match read(shared.fd, &mut scratch) {
            Ok(0) => {
                trace!(shared.log, "modem device closed, indication reader exiting");
                return;
            }
            Ok(n) => buf.extend_from_slice(&scratch[..n]),
            Err(nix::errno::Errno::EAGAIN) => {
                std::thread::sleep(Duration::from_millis(20));
                continue;
            }
            Err(nix::errno::Errno::EBADF) => return,
            Err(e) => {
                error!(shared.log, "read() from modem device failed"; "error" => %e);
                std::thread::sleep(Duration::from_millis(200));
                continue;
            }
        }

        loop {
            match wire::decode_frame(&buf) {
                Ok(Some((frame, consumed))) => {
                    buf.drain(..consumed);
                    dispatch(&shared, frame);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(shared.log, "dropping malformed QMUX frame"; "error" => %e);
                    buf.clear();
                    break;
                }
            }
        }
    }
}

fn dispatch(shared: &Arc<Shared>, frame: Frame) {
    match frame.flavor {
        Flavor::Response => {
            let key = (frame.service, frame.transaction_id);
            if let Some(tx) = shared.pending.waiters.lock().remove(&key) {
                let _ = tx.send(frame);
            } else {
                warn!(shared.log, "response with no matching request, dropped";
                    "service" => ?key.0, "transaction_id" => key.1);
            }
        }
        Flavor::Indication => {
            let key = (frame.service, frame.client_id);
            let cb = shared.indications.lock().get(&key).map(|_| ());
            if cb.is_some() {
                // Re-lock only for the call itself so the callback can't
                // attempt to attach/detach (which also takes this lock)
                // without deadlocking.
                let indications = shared.indications.lock();
                if let Some(callback) = indications.get(&key) {
                    callback(&frame.tlvs);
                }
            } else {
                trace!(shared.log, "indication for unattached/no-callback handle, ignored";
                    "service" => ?key.0, "client_id" => key.1);
            }
        }
        Flavor::Request => {
            warn!(shared.log, "unexpected request-flavored frame from modem, ignored");
        }
    }
}
