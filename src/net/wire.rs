//! Connection plumbing: framed readers, writer tasks, one-shot exchanges.
//!
//! Long-lived links get a [`FrameReader`] on the read half and a spawned
//! writer task fed through an `mpsc` channel on the write half, so slow
//! neighbors back-pressure into their own channel instead of stalling the
//! node. Short-lived work (degree probes, liveness probes, seed broadcasts)
//! goes through the one-shot helpers, every step under a timeout.

use super::message::Message;
use crate::types::{MAX_FRAME_LEN, NEIGHBOR_CHANNEL_CAPACITY};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Dial with the configured connect timeout.
pub async fn connect(addr: SocketAddr, connect_timeout: Duration) -> io::Result<TcpStream> {
    match timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(res) => res,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("connect to {addr} timed out"),
        )),
    }
}

/// Write one frame (adds the terminating newline).
pub async fn write_frame<W: AsyncWriteExt + Unpin>(w: &mut W, msg: &Message) -> io::Result<()> {
    let mut line = msg.encode();
    line.push('\n');
    w.write_all(line.as_bytes()).await
}

/// Outcome of pulling one line off the wire.
enum LineRead {
    /// A complete line sits in the accumulator.
    Line,
    /// The line ran past [`MAX_FRAME_LEN`] and was drained without keeping it.
    Oversized,
    /// Clean close.
    Eof,
}

/// Line-framed reader over the read half of a connection.
///
/// The accumulator never holds more than [`MAX_FRAME_LEN`] bytes: input is
/// consumed in buffered chunks and an over-long line is discarded as it
/// streams in, so a peer that withholds the newline cannot grow our memory.
pub struct FrameReader {
    inner: BufReader<OwnedReadHalf>,
    buf: Vec<u8>,
}

impl FrameReader {
    pub fn new(half: OwnedReadHalf) -> Self {
        Self {
            inner: BufReader::new(half),
            buf: Vec::new(),
        }
    }

    /// Next well-formed frame, or `None` on a clean close.
    ///
    /// Malformed and oversized lines are logged and skipped; a single bad
    /// frame never tears down the connection.
    pub async fn next(&mut self) -> io::Result<Option<Message>> {
        loop {
            match self.fill_line().await? {
                LineRead::Eof => return Ok(None),
                LineRead::Oversized => {
                    warn!("dropping oversized frame");
                    continue;
                }
                LineRead::Line => {}
            }
            let Ok(line) = std::str::from_utf8(&self.buf) else {
                warn!("dropping non-utf8 frame");
                continue;
            };
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            match Message::parse(line) {
                Ok(msg) => return Ok(Some(msg)),
                Err(e) => warn!("dropping malformed frame: {e}"),
            }
        }
    }

    /// Accumulate exactly one newline-terminated line, keeping at most
    /// `MAX_FRAME_LEN` bytes of it. The tail of an over-long line is drained
    /// chunk by chunk and thrown away.
    async fn fill_line(&mut self) -> io::Result<LineRead> {
        self.buf.clear();
        let mut oversized = false;
        loop {
            let (consumed, terminated) = {
                let chunk = self.inner.fill_buf().await?;
                if chunk.is_empty() {
                    if !self.buf.is_empty() || oversized {
                        debug!("connection closed mid-frame");
                    }
                    return Ok(LineRead::Eof);
                }
                match chunk.iter().position(|b| *b == b'\n') {
                    Some(pos) => {
                        if !oversized && self.buf.len() + pos <= MAX_FRAME_LEN {
                            self.buf.extend_from_slice(&chunk[..pos]);
                        } else {
                            oversized = true;
                        }
                        (pos + 1, true)
                    }
                    None => {
                        if !oversized && self.buf.len() + chunk.len() <= MAX_FRAME_LEN {
                            self.buf.extend_from_slice(chunk);
                        } else {
                            oversized = true;
                            self.buf.clear();
                        }
                        (chunk.len(), false)
                    }
                }
            };
            self.inner.consume(consumed);
            if terminated {
                return Ok(if oversized {
                    LineRead::Oversized
                } else {
                    LineRead::Line
                });
            }
        }
    }
}

/// Spawn a writer task for a long-lived link; frames queued on the returned
/// channel are written in order until the channel closes or the socket dies.
pub fn spawn_writer(mut half: OwnedWriteHalf) -> mpsc::Sender<Message> {
    let (tx, mut rx) = mpsc::channel::<Message>(NEIGHBOR_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = write_frame(&mut half, &msg).await {
                debug!("link writer closing: {e}");
                break;
            }
        }
    });
    tx
}

/// Fire-and-forget: dial, send one frame, close. Used for seed-to-seed
/// broadcasts and dead-node escalation, where an unreachable target is
/// simply skipped by the caller.
pub async fn send_oneshot(
    addr: SocketAddr,
    msg: &Message,
    connect_timeout: Duration,
) -> io::Result<()> {
    let mut stream = connect(addr, connect_timeout).await?;
    write_frame(&mut stream, msg).await?;
    stream.flush().await?;
    Ok(())
}

/// Dial, send one frame, wait for the first well-formed reply.
///
/// Returns `None` when the far side closes without answering. Used for degree
/// probes, liveness probes, and seed registration.
pub async fn exchange(
    addr: SocketAddr,
    msg: &Message,
    connect_timeout: Duration,
    reply_timeout: Duration,
) -> io::Result<Option<Message>> {
    let stream = connect(addr, connect_timeout).await?;
    let (read_half, mut write_half) = stream.into_split();
    write_frame(&mut write_half, msg).await?;
    write_half.flush().await?;

    let mut reader = FrameReader::new(read_half);
    match timeout(reply_timeout, reader.next()).await {
        Ok(res) => res,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("no reply from {addr}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeId;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn frame_reader_skips_garbage() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream
                .write_all(b"NOT A FRAME\n\nPING 7\n")
                .await
                .unwrap();
        });

        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, _write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);

        let msg = reader.next().await.unwrap().unwrap();
        assert_eq!(msg, Message::Ping { nonce: 7 });
        let eof = reader.next().await.unwrap();
        assert!(eof.is_none());
        client.await.unwrap();
    }

    #[tokio::test]
    async fn oversized_line_is_discarded_without_buffering_it() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            // Twice the frame cap without a newline, then a real frame.
            let huge = vec![b'A'; MAX_FRAME_LEN * 2];
            stream.write_all(&huge).await.unwrap();
            stream.write_all(b"\nPING 5\n").await.unwrap();
        });

        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, _write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);
        let msg = reader.next().await.unwrap().unwrap();
        assert_eq!(msg, Message::Ping { nonce: 5 });
        client.await.unwrap();
    }

    #[tokio::test]
    async fn exchange_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = FrameReader::new(read_half);
            let msg = reader.next().await.unwrap().unwrap();
            assert_eq!(msg, Message::DegQuery);
            write_frame(&mut write_half, &Message::DegReply { degree: 2 })
                .await
                .unwrap();
        });

        let reply = exchange(
            addr,
            &Message::DegQuery,
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(reply, Some(Message::DegReply { degree: 2 }));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn connect_to_dead_target_fails() {
        // Reserve a port, close the listener, dial the corpse.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(connect(addr, Duration::from_millis(500)).await.is_err());
    }

    #[tokio::test]
    async fn writer_task_writes_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer: NodeId = "127.0.0.1:6001".parse().unwrap();

        let stream = TcpStream::connect(addr).await.unwrap();
        let (_read_half, write_half) = stream.into_split();
        let tx = spawn_writer(write_half);
        tx.send(Message::Connect { peer }).await.unwrap();
        tx.send(Message::Ping { nonce: 1 }).await.unwrap();
        drop(tx);

        let (accepted, _) = listener.accept().await.unwrap();
        let (read_half, _write_half) = accepted.into_split();
        let mut reader = FrameReader::new(read_half);
        assert_eq!(
            reader.next().await.unwrap(),
            Some(Message::Connect { peer })
        );
        assert_eq!(reader.next().await.unwrap(), Some(Message::Ping { nonce: 1 }));
    }
}
