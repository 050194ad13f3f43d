//! A line-framed duplex connection.
//!
//! Each socket is split into a reader task (feeds decoded lines to the
//! coordinator) and a writer task (drains an outbound channel), so a
//! slow or dead peer never blocks state mutation. `send` is
//! non-blocking and reports failure instead of erroring once the
//! connection is closed; `close` is idempotent.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use streamcast_core::Message;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::coordinator::Event;

/// Process-unique connection identifier.
pub type ConnId = u64;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// What the writer task is asked to do next.
#[derive(Debug)]
pub(crate) enum Outbound {
    Line(String),
    Close,
}

/// Handle to a live connection. Cheap to clone; all clones share the
/// closed flag and the outbound channel.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnId,
    addr: SocketAddr,
    tx: mpsc::UnboundedSender<Outbound>,
    closed: Arc<AtomicBool>,
}

impl Connection {
    /// Wrap an accepted or dialed socket, spawning its reader and
    /// writer tasks. Reader EOF or error surfaces as
    /// [`Event::Disconnected`] on `events`.
    pub fn spawn(
        stream: TcpStream,
        events: mpsc::UnboundedSender<Event>,
    ) -> std::io::Result<Connection> {
        let addr = stream.peer_addr()?;
        let (conn, rx) = Connection::channel(addr);
        let (read_half, write_half) = stream.into_split();

        tokio::spawn(write_loop(write_half, rx));
        tokio::spawn(read_loop(read_half, conn.clone(), events));

        Ok(conn)
    }

    /// Build a connection backed only by a channel. The caller owns the
    /// receiving end; used directly by the coordinator tests.
    pub(crate) fn channel(addr: SocketAddr) -> (Connection, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            addr,
            tx,
            closed: Arc::new(AtomicBool::new(false)),
        };
        (conn, rx)
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Queue one line for writing. Returns false iff the connection is
    /// already closed; never blocks.
    pub fn send(&self, line: &str) -> bool {
        if self.is_closed() {
            return false;
        }
        self.tx.send(Outbound::Line(line.to_owned())).is_ok()
    }

    /// Encode and queue a protocol message.
    pub fn send_msg(&self, msg: &Message) -> bool {
        self.send(&msg.encode())
    }

    /// Mark closed and tell the writer to shut the socket down. Safe to
    /// call any number of times.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(Outbound::Close);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

async fn write_loop(
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(out) = rx.recv().await {
        match out {
            Outbound::Line(mut line) => {
                line.push('\n');
                if let Err(e) = write_half.write_all(line.as_bytes()).await {
                    tracing::debug!("write failed: {e}");
                    break;
                }
            }
            Outbound::Close => break,
        }
    }
    let _ = write_half.shutdown().await;
}

async fn read_loop(
    read_half: tokio::net::tcp::OwnedReadHalf,
    conn: Connection,
    events: mpsc::UnboundedSender<Event>,
) {
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.trim_end_matches(['\r', '\n']);
                if events
                    .send(Event::Line {
                        conn: conn.id(),
                        line: trimmed.to_owned(),
                    })
                    .is_err()
                {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!("read failed on {}: {e}", conn.addr());
                break;
            }
        }
    }

    // Notify the coordinator before the socket halves drop, so no
    // registry ever references a dead connection.
    conn.close();
    let _ = events.send(Event::Disconnected(conn.id()));
}
