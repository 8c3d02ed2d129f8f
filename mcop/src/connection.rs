//! Transports a finished message to the peer that owns the target object.

use crate::buffer::Buffer;
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::message;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub trait Connection: Send + Sync {
    /// Queues a complete, length-patched message. Never blocks on the peer.
    fn send_buffer(&self, buffer: Buffer) -> Result<()>;
    fn is_connected(&self) -> bool;
    fn describe(&self) -> String;
}

/// Loops messages back into the dispatcher that owns it. Invocations run
/// their skeleton immediately and the reply comes straight back.
#[derive(Debug)]
pub struct LocalConnection {
    dispatcher: Weak<Dispatcher>,
}

impl LocalConnection {
    pub fn new(dispatcher: Weak<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

impl Connection for LocalConnection {
    fn send_buffer(&self, buffer: Buffer) -> Result<()> {
        let dispatcher = self.dispatcher.upgrade().ok_or(Error::ConnectionClosed)?;
        dispatcher.handle_message(buffer, self);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.dispatcher.strong_count() > 0
    }

    fn describe(&self) -> String {
        "local".to_string()
    }
}

/// One TCP peer. A reader task feeds complete messages to the dispatcher and
/// a writer task drains the outgoing channel, so `send_buffer` only queues.
#[derive(Debug)]
pub struct TcpConnection {
    peer: String,
    outgoing: mpsc::UnboundedSender<Buffer>,
    connected: Arc<AtomicBool>,
}

impl TcpConnection {
    /// Must be called from within a tokio runtime.
    pub fn spawn(stream: TcpStream, dispatcher: Weak<Dispatcher>) -> Arc<Self> {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown peer".to_string());
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        let (outgoing, rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));
        let connection = Arc::new(Self {
            peer,
            outgoing,
            connected: connected.clone(),
        });
        tokio::spawn(write_loop(writer, rx, connected));
        tokio::spawn(read_loop(reader, dispatcher, connection.clone()));
        debug!("connected to {}", connection.peer);
        connection
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

impl Connection for TcpConnection {
    fn send_buffer(&self, buffer: Buffer) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::ConnectionClosed);
        }
        self.outgoing
            .send(buffer)
            .map_err(|_| Error::ConnectionClosed)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn describe(&self) -> String {
        format!("tcp:{}", self.peer)
    }
}

async fn read_message(reader: &mut OwnedReadHalf) -> Result<Buffer> {
    let mut prefix = [0u8; 8];
    reader.read_exact(&mut prefix).await?;
    let length = message::announced_length(&prefix)?
        .ok_or_else(|| Error::BadMessage("short header".to_string()))?;
    let mut contents = vec![0u8; length];
    contents[..8].copy_from_slice(&prefix);
    reader.read_exact(&mut contents[8..]).await?;
    Ok(Buffer::from_bytes(contents))
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    dispatcher: Weak<Dispatcher>,
    connection: Arc<TcpConnection>,
) {
    loop {
        let buffer = match read_message(&mut reader).await {
            Ok(buffer) => buffer,
            Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("{} closed the connection", connection.peer);
                break;
            }
            Err(err) => {
                warn!("dropping connection to {}: {err}", connection.peer);
                break;
            }
        };
        let Some(live) = dispatcher.upgrade() else {
            break;
        };
        live.handle_message(buffer, connection.as_ref());
    }
    connection.connected.store(false, Ordering::Release);
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Buffer>,
    connected: Arc<AtomicBool>,
) {
    while let Some(buffer) = rx.recv().await {
        if let Err(err) = writer.write_all(buffer.as_bytes()).await {
            warn!("write failed: {err}");
            break;
        }
    }
    connected.store(false, Ordering::Release);
    let _ = writer.shutdown().await;
}
