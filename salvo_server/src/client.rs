// TCP client for talking to a salvo server.
//
// Architecture:
// - `connect()` opens the socket and spawns a background reader thread.
// - The reader thread calls `read_line()` in a loop, parses each line into a
//   `ServerMessage`, and pushes it into an `mpsc` channel.
// - Heartbeat challenges from the server are answered by the reader thread
//   itself and never reach the inbox, so a client that is slow to poll is not
//   timed out while it still holds an open socket. Echoes of probes this
//   client sent (`heartbeat()`) are delivered like any other message.
// - The writer sits behind a mutex shared with the reader thread, so
//   answers and regular sends never interleave mid-line.
//
// Used by the integration tests and by anything that wants to script a
// player; it does not interpret game state.

use std::collections::VecDeque;
use std::io::{self, BufReader, BufWriter};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use salvo_protocol::{ClientMessage, Coordinate, Direction, ServerMessage, read_line, write_line};
use thiserror::Error;
use tracing::{debug, trace};

/// How many recent heartbeat payloads each side of the bookkeeping remembers.
const HEARTBEAT_MEMORY: usize = 16;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),
    #[error("send failed: {0}")]
    Send(#[from] io::Error),
    #[error("timed out waiting for the server")]
    Timeout,
    #[error("connection closed by the server")]
    Disconnected,
}

/// Heartbeat payloads the reader thread must recognise.
#[derive(Default)]
struct HeartbeatBook {
    /// Probes we sent; their echoes go to the inbox.
    probes: VecDeque<String>,
    /// Challenges already answered; a repeat is dropped instead of answered
    /// again.
    answered: VecDeque<String>,
}

fn remember(queue: &mut VecDeque<String>, payload: String) {
    if queue.len() == HEARTBEAT_MEMORY {
        queue.pop_front();
    }
    queue.push_back(payload);
}

fn forget(queue: &mut VecDeque<String>, payload: &str) -> bool {
    match queue.iter().position(|p| p == payload) {
        Some(index) => {
            queue.remove(index);
            true
        }
        None => false,
    }
}

/// Line client for a salvo server.
pub struct NetClient {
    stream: TcpStream,
    writer: Arc<Mutex<BufWriter<TcpStream>>>,
    heartbeats: Arc<Mutex<HeartbeatBook>>,
    inbox: Receiver<ServerMessage>,
    _reader_thread: Option<JoinHandle<()>>,
}

impl NetClient {
    /// Connect and start the reader thread. The server's `W` greeting is the
    /// first message in the inbox.
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).map_err(ClientError::Connect)?;
        stream.set_nodelay(true).ok();
        let reader = BufReader::new(stream.try_clone().map_err(ClientError::Connect)?);
        let writer = Arc::new(Mutex::new(BufWriter::new(
            stream.try_clone().map_err(ClientError::Connect)?,
        )));
        let heartbeats = Arc::new(Mutex::new(HeartbeatBook::default()));

        let (tx, rx) = mpsc::channel();
        let reader_writer = Arc::clone(&writer);
        let reader_heartbeats = Arc::clone(&heartbeats);
        let reader_thread = thread::Builder::new()
            .name("salvo-client-reader".into())
            .spawn(move || reader_loop(reader, tx, reader_writer, reader_heartbeats))
            .map_err(ClientError::Connect)?;

        Ok(Self {
            stream,
            writer,
            heartbeats,
            inbox: rx,
            _reader_thread: Some(reader_thread),
        })
    }

    pub fn send(&self, message: &ClientMessage) -> Result<(), ClientError> {
        write_line(&mut *self.writer.lock(), &message.encode())?;
        Ok(())
    }

    /// Send a raw line, bypassing the message encoder. Admin console commands
    /// and malformed-input tests use this.
    pub fn send_raw(&self, line: &str) -> Result<(), ClientError> {
        write_line(&mut *self.writer.lock(), line)?;
        Ok(())
    }

    pub fn login(&self, username: &str) -> Result<(), ClientError> {
        self.send(&ClientMessage::Login {
            username: username.into(),
        })
    }

    pub fn join_session(&self, session: &str) -> Result<(), ClientError> {
        self.send(&ClientMessage::Connect {
            session: session.into(),
        })
    }

    pub fn start_location(&self, at: Coordinate) -> Result<(), ClientError> {
        self.send(&ClientMessage::StartLocation(at))
    }

    pub fn fire(&self, target: Coordinate) -> Result<(), ClientError> {
        self.send(&ClientMessage::Fire(target))
    }

    pub fn move_ship(&self, direction: Direction) -> Result<(), ClientError> {
        self.send(&ClientMessage::Move(direction))
    }

    pub fn scan(&self, target: Coordinate) -> Result<(), ClientError> {
        self.send(&ClientMessage::Scan(target))
    }

    /// Send a liveness probe. The server echoes it back into the inbox.
    pub fn heartbeat(&self, payload: &str) -> Result<(), ClientError> {
        remember(&mut self.heartbeats.lock().probes, payload.to_string());
        self.send(&ClientMessage::Heartbeat {
            payload: payload.into(),
        })
    }

    pub fn quit(&self) -> Result<(), ClientError> {
        self.send(&ClientMessage::Quit)
    }

    /// Drain all queued server messages (non-blocking).
    pub fn poll(&self) -> Vec<ServerMessage> {
        self.inbox.try_iter().collect()
    }

    /// Wait up to `timeout` for the next server message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<ServerMessage, ClientError> {
        self.inbox.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => ClientError::Timeout,
            RecvTimeoutError::Disconnected => ClientError::Disconnected,
        })
    }

    /// Close the socket without saying goodbye.
    pub fn close(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

impl Drop for NetClient {
    fn drop(&mut self) {
        self.close();
    }
}

/// Reader thread: parse lines into the inbox, answering server heartbeat
/// challenges on the way.
fn reader_loop(
    mut reader: BufReader<TcpStream>,
    tx: Sender<ServerMessage>,
    writer: Arc<Mutex<BufWriter<TcpStream>>>,
    heartbeats: Arc<Mutex<HeartbeatBook>>,
) {
    loop {
        let line = match read_line(&mut reader) {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(error) => {
                debug!(%error, "client read ended");
                break;
            }
        };
        let message = match ServerMessage::parse(&line) {
            Ok(message) => message,
            Err(error) => {
                debug!(%error, line = %line, "unparseable server line");
                continue;
            }
        };

        if let ServerMessage::Heartbeat { payload } = &message {
            let mut book = heartbeats.lock();
            if !forget(&mut book.probes, payload) {
                if book.answered.contains(payload) {
                    continue;
                }
                remember(&mut book.answered, payload.clone());
                drop(book);
                trace!(payload = %payload, "answering heartbeat challenge");
                let answer = ClientMessage::Heartbeat {
                    payload: payload.clone(),
                };
                if write_line(&mut *writer.lock(), &answer.encode()).is_err() {
                    break;
                }
                continue;
            }
        }

        if tx.send(message).is_err() {
            break; // Receiver dropped
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_memory_is_bounded() {
        let mut queue = VecDeque::new();
        for i in 0..(HEARTBEAT_MEMORY + 4) {
            remember(&mut queue, format!("p{i}"));
        }
        assert_eq!(queue.len(), HEARTBEAT_MEMORY);
        assert!(!forget(&mut queue, "p0"));
        assert!(forget(&mut queue, "p5"));
        assert!(!forget(&mut queue, "p5"));
    }
}
