//! Timer-driven side of [`ThreadedDeviceIO`]: on every tick it moves exactly
//! as many bytes as the queues accept without blocking.

use super::ThreadedDeviceIO;
use std::time::Duration;
use tracing::debug;

pub trait AudioSource: Send {
    /// Fills the front of `buf`; returns 0 once the stream is over.
    fn fill(&mut self, buf: &mut [u8]) -> usize;
}

pub trait AudioSink: Send {
    fn consume(&mut self, data: &[u8]);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Moved {
    pub read: usize,
    pub written: usize,
}

pub struct AudioPump {
    io: ThreadedDeviceIO,
    source: Option<Box<dyn AudioSource>>,
    sink: Option<Box<dyn AudioSink>>,
    scratch: Vec<u8>,
    exhausted: bool,
}

impl AudioPump {
    pub fn new(io: ThreadedDeviceIO) -> Self {
        Self {
            io,
            source: None,
            sink: None,
            scratch: Vec::new(),
            exhausted: false,
        }
    }

    pub fn with_source(mut self, source: impl AudioSource + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn with_sink(mut self, sink: impl AudioSink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    pub fn io(&self) -> &ThreadedDeviceIO {
        &self.io
    }

    pub fn io_mut(&mut self) -> &mut ThreadedDeviceIO {
        &mut self.io
    }

    pub fn into_io(self) -> ThreadedDeviceIO {
        self.io
    }

    /// The source reported the end of its stream.
    pub fn exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn tick(&mut self) -> Moved {
        let mut moved = Moved::default();
        if let Some(sink) = self.sink.as_mut() {
            let available = self.io.can_read();
            if available > 0 {
                self.scratch.resize(available, 0);
                moved.read = self.io.read(&mut self.scratch[..available]);
                sink.consume(&self.scratch[..moved.read]);
            }
        }
        if let Some(source) = self.source.as_mut()
            && !self.exhausted
        {
            let room = self.io.can_write();
            if room > 0 {
                self.scratch.resize(room, 0);
                let filled = source.fill(&mut self.scratch[..room]);
                moved.written = self.io.write(&self.scratch[..filled]);
                if filled < room {
                    self.io.flush();
                }
                if filled == 0 {
                    debug!("source exhausted");
                    self.exhausted = true;
                }
            }
        }
        moved
    }

    /// Ticks every `period` until the source is exhausted or the device
    /// fails. Without a source only a failure ends it.
    pub async fn run(&mut self, period: Duration) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.tick();
            if self.exhausted || self.io.failed() {
                break;
            }
        }
    }
}
