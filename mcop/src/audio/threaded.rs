//! Blocking device I/O on dedicated threads.
//!
//! The writer thread drains `write_queue` into the device and the reader
//! thread fills `read_queue` from it. The cooperative side only ever touches
//! the queues, through [`ThreadedDeviceIO::read`] / [`ThreadedDeviceIO::write`]
//! and the `can_*` queries.
//!
//! A thread that hits a device error stops touching the device but keeps
//! cycling its queue, so the cooperative side never blocks on it. From then
//! on `read`/`write` and the `can_*` queries report nothing for that
//! direction and [`ThreadedDeviceIO::last_error`] says why.

use super::{AudioParams, Device};
use crate::chunk_queue::{Chunk, ChunkQueue};
use crate::error::{device_io_error, device_open_error};
use crate::thread::{Thread, Threads};
use std::io::ErrorKind;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, warn};

struct Shared {
    read_queue: ChunkQueue,
    write_queue: ChunkQueue,
    running: AtomicBool,
    reader_failed: AtomicBool,
    writer_failed: AtomicBool,
    last_error: Mutex<String>,
}

impl Shared {
    fn record(&self, message: String) {
        error!("{message}");
        *self.last_error.lock().expect("device error poisoned") = message;
    }

    fn fail(&self, failed: &AtomicBool, message: String) {
        self.record(message);
        failed.store(true, Ordering::SeqCst);
    }
}

pub struct ThreadedDeviceIO {
    threads: Arc<Threads>,
    params: AudioParams,
    shared: Arc<Shared>,
    device: Option<Arc<dyn Device>>,
    reader: Option<Thread>,
    writer: Option<Thread>,
}

impl std::fmt::Debug for ThreadedDeviceIO {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadedDeviceIO")
            .field("params", &self.params)
            .field("open", &self.device.is_some())
            .field("last_error", &self.last_error())
            .finish()
    }
}

impl ThreadedDeviceIO {
    pub fn new(threads: Arc<Threads>, params: AudioParams) -> Self {
        let shared = Arc::new(Shared {
            read_queue: ChunkQueue::new(&threads, params.fragment_count, params.fragment_size),
            write_queue: ChunkQueue::new(&threads, params.fragment_count, params.fragment_size),
            running: AtomicBool::new(false),
            reader_failed: AtomicBool::new(false),
            writer_failed: AtomicBool::new(false),
            last_error: Mutex::new(String::new()),
        });
        Self {
            threads,
            params,
            shared,
            device: None,
            reader: None,
            writer: None,
        }
    }

    pub fn params(&self) -> &AudioParams {
        &self.params
    }

    pub fn last_error(&self) -> String {
        self.shared
            .last_error
            .lock()
            .expect("device error poisoned")
            .clone()
    }

    /// The reader or the writer gave up after a device error.
    pub fn failed(&self) -> bool {
        self.reader_failed() || self.writer_failed()
    }

    fn reader_failed(&self) -> bool {
        self.shared.reader_failed.load(Ordering::SeqCst)
    }

    fn writer_failed(&self) -> bool {
        self.shared.writer_failed.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        self.device.is_some()
    }

    fn fail(&mut self, message: String) -> bool {
        self.shared.record(message);
        false
    }

    /// Opens the configured OSS device and starts the I/O threads.
    pub fn open(&mut self) -> bool {
        if !self.threads.supported() {
            return self.fail(format!(
                "threaded device I/O needs real threads, '{}' has none",
                self.threads.active().name()
            ));
        }
        match open_device(&self.params) {
            Ok(device) => self.open_with(device),
            Err(err) => self.fail(device_open_error(
                self.params.direction_name(),
                &self.params.device,
                err,
            )),
        }
    }

    /// Same as [`Self::open`] with an already opened device.
    pub fn open_with(&mut self, device: Arc<dyn Device>) -> bool {
        if !self.threads.supported() {
            return self.fail(format!(
                "threaded device I/O needs real threads, '{}' has none",
                self.threads.active().name()
            ));
        }
        if self.device.is_some() {
            return self.fail(format!("{} is already open", self.params.device));
        }
        for queue in [&self.shared.read_queue, &self.shared.write_queue] {
            queue.clear();
            queue.set_chunk_size(self.params.fragment_size);
        }
        self.device = Some(device);
        self.shared
            .last_error
            .lock()
            .expect("device error poisoned")
            .clear();
        self.start_threads()
    }

    /// Starts one thread per configured direction. `open` already does this;
    /// call it again to resume after [`Self::stop_threads`].
    pub fn start_threads(&mut self) -> bool {
        let Some(device) = self.device.clone() else {
            return false;
        };
        if self.writer.is_some() || self.reader.is_some() {
            return true;
        }
        self.shared.reader_failed.store(false, Ordering::SeqCst);
        self.shared.writer_failed.store(false, Ordering::SeqCst);
        self.shared.running.store(true, Ordering::SeqCst);
        if self.params.writes() {
            let shared = self.shared.clone();
            let device = device.clone();
            let mut writer = Thread::new(&self.threads, "arts-writer", move || {
                write_loop(&shared, device.as_ref())
            });
            if let Err(err) = writer.start() {
                self.stop_threads();
                return self.fail(format!("could not start writer thread: {err}"));
            }
            self.writer = Some(writer);
        }
        if self.params.reads() {
            let shared = self.shared.clone();
            let mut reader = Thread::new(&self.threads, "arts-reader", move || {
                read_loop(&shared, device.as_ref())
            });
            if let Err(err) = reader.start() {
                self.stop_threads();
                return self.fail(format!("could not start reader thread: {err}"));
            }
            self.reader = Some(reader);
        }
        debug!(
            "{} running ({})",
            self.params.device,
            self.params.direction_name()
        );
        true
    }

    /// Wakes both threads, joins them and empties the queues.
    pub fn stop_threads(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(mut writer) = self.writer.take() {
            let queue = &self.shared.write_queue;
            if queue.is_producing() {
                queue.produced();
            } else if queue.is_empty() {
                // Zero-length chunk: the writer stops when it sees it
                queue.write(&[]);
            }
            writer.wait_for_termination();
        }
        if let Some(mut reader) = self.reader.take() {
            let queue = &self.shared.read_queue;
            if queue.is_consuming() {
                queue.consumed();
            } else if queue.free_chunks() == 0 {
                queue.wait_produced();
                queue.consumed();
            }
            reader.wait_for_termination();
        }
        self.shared.read_queue.clear();
        self.shared.write_queue.clear();
    }

    pub fn close(&mut self) {
        if self.device.is_none() {
            return;
        }
        self.stop_threads();
        self.device = None;
        debug!("{} closed", self.params.device);
    }

    /// Bytes [`Self::read`] can return without blocking.
    pub fn can_read(&self) -> usize {
        if self.reader.is_none() || self.reader_failed() {
            return 0;
        }
        self.shared.read_queue.readable_bytes()
    }

    /// Bytes [`Self::write`] can take without blocking.
    pub fn can_write(&self) -> usize {
        if self.writer.is_none() || self.writer_failed() {
            return 0;
        }
        self.shared.write_queue.writable_bytes()
    }

    /// Blocks until `buf` is full. Check [`Self::can_read`] first to stay
    /// non-blocking. Stops short once the reader has failed.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        if self.reader.is_none() {
            return 0;
        }
        let queue = &self.shared.read_queue;
        let mut done = 0;
        while done < buf.len() && !self.reader_failed() {
            let chunk = queue.wait_produced();
            let n = chunk.len().min(buf.len() - done);
            buf[done..done + n].copy_from_slice(&chunk.get()[..n]);
            chunk.pop(n);
            done += n;
            if chunk.is_empty() {
                queue.consumed();
            }
        }
        done
    }

    /// Blocks until all of `buf` is queued. A chunk is handed to the writer
    /// once full; use [`Self::flush`] for a trailing partial one. Stops
    /// short once the writer has failed.
    pub fn write(&mut self, buf: &[u8]) -> usize {
        if self.writer.is_none() {
            return 0;
        }
        let queue = &self.shared.write_queue;
        let mut done = 0;
        while done < buf.len() && !self.writer_failed() {
            let chunk = queue.wait_consumed();
            done += chunk.push(&buf[done..]);
            if chunk.is_full() {
                queue.produced();
            }
        }
        done
    }

    pub fn flush(&mut self) {
        let queue = &self.shared.write_queue;
        if self.writer.is_some() && queue.is_producing() {
            queue.produced();
        }
    }

    /// Chunks queued for the device and not yet taken by the writer.
    pub fn buffered_chunks(&self) -> usize {
        self.shared.write_queue.buffered_chunks()
    }

    pub fn free_chunks(&self) -> usize {
        self.shared.write_queue.free_chunks()
    }
}

impl Drop for ThreadedDeviceIO {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(unix)]
fn open_device(params: &AudioParams) -> std::io::Result<Arc<dyn Device>> {
    Ok(Arc::new(super::OssDevice::open(params)?))
}

#[cfg(not(unix))]
fn open_device(_params: &AudioParams) -> std::io::Result<Arc<dyn Device>> {
    Err(std::io::Error::new(
        ErrorKind::Unsupported,
        "OSS devices are only available on unix",
    ))
}

fn write_chunk(device: &dyn Device, chunk: &mut Chunk) -> Result<(), String> {
    while !chunk.is_empty() {
        match device.write(chunk.get()) {
            Ok(0) => {
                return Err(device_io_error("playback", "write", "device accepted nothing"));
            }
            Ok(n) => chunk.pop(n),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(device_io_error("playback", "write", err)),
        }
    }
    Ok(())
}

fn write_loop(shared: &Shared, device: &dyn Device) {
    let queue = &shared.write_queue;
    loop {
        let chunk = queue.wait_produced();
        if chunk.is_empty() {
            queue.consumed();
            break;
        }
        // After a failure chunks are dropped unplayed
        if !shared.writer_failed.load(Ordering::SeqCst)
            && let Err(message) = write_chunk(device, chunk)
        {
            shared.fail(&shared.writer_failed, message);
        }
        queue.consumed();
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }
    }
    debug!("writer thread done");
}

fn read_loop(shared: &Shared, device: &dyn Device) {
    let queue = &shared.read_queue;
    while shared.running.load(Ordering::SeqCst) {
        let chunk = queue.wait_consumed();
        if shared.reader_failed.load(Ordering::SeqCst) {
            // Empty chunks wake a read() that is already waiting
            chunk.set_filled(0);
            queue.produced();
            continue;
        }
        match device.read(chunk.storage_mut()) {
            Ok(0) => {
                warn!("capture device reported end of stream");
                shared.fail(
                    &shared.reader_failed,
                    device_io_error("capture", "read", "end of stream"),
                );
            }
            Ok(n) => {
                chunk.set_filled(n);
                queue.produced();
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => shared.fail(&shared.reader_failed, device_io_error("capture", "read", err)),
        }
    }
    debug!("reader thread done");
}
