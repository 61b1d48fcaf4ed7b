// Test-only player for multiplayer integration tests.
//
// Wraps the real `NetClient` (from `salvo_server::client`) with a
// synchronous, test-friendly API: every `wait_for_*` call blocks until the
// matching server line arrives, stashing anything else it reads on the way
// in `skipped` so tests can still inspect it.
//
// The only test-specific code here is the blocking wrappers around
// `NetClient::recv_timeout()`. Networking, framing and heartbeat answering
// use the same code paths as any other client.
//
// See also: `tests/full_pipeline.rs` for the integration test scenarios.

use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use salvo_protocol::{Coordinate, Direction, ServerMessage};
use salvo_server::client::{ClientError, NetClient};

/// Default timeout for blocking waits.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep duration between checks in `eventually`.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A test player wrapping a real NetClient.
pub struct TestPlayer {
    client: NetClient,
    pub name: String,
    /// Messages passed over by `wait_for`, oldest first.
    pub skipped: Vec<ServerMessage>,
}

impl TestPlayer {
    /// Connect and log in as `name`. Panics if the login is refused.
    pub fn connect(addr: SocketAddr, name: &str) -> Self {
        let mut player = Self::connect_anonymous(addr);
        match player.login(name) {
            ServerMessage::SessionList { .. } => {}
            other => panic!("login as {name} failed: {other:?}"),
        }
        player
    }

    /// Connect and consume the welcome line without logging in.
    pub fn connect_anonymous(addr: SocketAddr) -> Self {
        let client = NetClient::connect(addr).expect("TestPlayer::connect failed");
        let mut player = Self {
            client,
            name: String::new(),
            skipped: Vec::new(),
        };
        player.wait_for("welcome", |m| match m {
            ServerMessage::Welcome { lines } => Some(lines.clone()),
            _ => None,
        });
        player
    }

    /// Send a login and return the server's answer (`A...` or `X1`).
    pub fn login(&mut self, name: &str) -> ServerMessage {
        self.client.login(name).expect("send login failed");
        let reply = self.wait_for("login reply", |m| match m {
            ServerMessage::SessionList { .. } | ServerMessage::LoginRejected => Some(m.clone()),
            _ => None,
        });
        if matches!(reply, ServerMessage::SessionList { .. }) {
            self.name = name.to_string();
        }
        reply
    }

    /// Join or create a session; returns `Joined`, `Created` or
    /// `JoinRejected`.
    pub fn join(&mut self, session: &str) -> ServerMessage {
        self.client.join_session(session).expect("send connect failed");
        self.wait_for("join reply", |m| match m {
            ServerMessage::Joined | ServerMessage::Created | ServerMessage::JoinRejected => {
                Some(m.clone())
            }
            _ => None,
        })
    }

    /// Block until the start of game; returns the opponents' names.
    pub fn wait_for_start_of_game(&mut self) -> Vec<String> {
        self.wait_for("start of game", |m| match m {
            ServerMessage::StartOfGame { opponents } => Some(opponents.clone()),
            _ => None,
        })
    }

    pub fn place(&mut self, at: Coordinate) {
        self.client.start_location(at).expect("send start location failed");
    }

    /// Block until a start of turn; returns remaining hit points.
    pub fn wait_for_turn(&mut self) -> i32 {
        self.wait_for("start of turn", |m| match m {
            ServerMessage::StartOfTurn { hit_points } => Some(*hit_points),
            _ => None,
        })
    }

    pub fn fire(&mut self, target: Coordinate) {
        self.client.fire(target).expect("send fire failed");
    }

    pub fn move_ship(&mut self, direction: Direction) {
        self.client.move_ship(direction).expect("send move failed");
    }

    pub fn scan(&mut self, target: Coordinate) {
        self.client.scan(target).expect("send scan failed");
    }

    /// Block until an end of turn; returns (hit flag, scan hits).
    pub fn wait_for_end_of_turn(&mut self) -> (bool, Vec<Coordinate>) {
        self.wait_for("end of turn", |m| match m {
            ServerMessage::EndOfTurn { hit, scan_hits } => Some((*hit, scan_hits.clone())),
            _ => None,
        })
    }

    /// Block until game over; returns true for a win.
    pub fn wait_for_game_over(&mut self) -> bool {
        self.wait_for("game over", |m| match m {
            ServerMessage::GameOver { won } => Some(*won),
            _ => None,
        })
    }

    /// Send a liveness probe and wait for its echo.
    pub fn ping(&mut self, payload: &str) {
        self.client.heartbeat(payload).expect("send heartbeat failed");
        self.wait_for("heartbeat echo", |m| match m {
            ServerMessage::Heartbeat { payload: echoed } if echoed == payload => Some(()),
            _ => None,
        });
    }

    pub fn send_raw(&mut self, line: &str) {
        self.client.send_raw(line).expect("send raw line failed");
    }

    pub fn quit(&mut self) {
        self.client.quit().expect("send quit failed");
    }

    /// Drop the socket without sending `Q`.
    pub fn drop_connection(self) {
        self.client.close();
    }

    /// Block until the server closes the connection. Anything read on the
    /// way is appended to `skipped`.
    pub fn wait_until_closed(&mut self) {
        let start = Instant::now();
        loop {
            let remaining = POLL_TIMEOUT.saturating_sub(start.elapsed());
            match self.client.recv_timeout(remaining) {
                Ok(message) => self.skipped.push(message),
                Err(ClientError::Disconnected) => return,
                Err(e) => panic!("{}: connection still open: {e}", self.name),
            }
        }
    }

    /// Raw poll: return all pending server messages without waiting.
    pub fn poll_raw(&self) -> Vec<ServerMessage> {
        self.client.poll()
    }

    /// Block until `pick` accepts a message, stashing the rest in `skipped`.
    pub fn wait_for<T>(
        &mut self,
        what: &str,
        mut pick: impl FnMut(&ServerMessage) -> Option<T>,
    ) -> T {
        let start = Instant::now();
        loop {
            let remaining = POLL_TIMEOUT.saturating_sub(start.elapsed());
            let message = match self.client.recv_timeout(remaining) {
                Ok(message) => message,
                Err(e) => panic!(
                    "{}: waiting for {what}: {e}; skipped {:?}",
                    self.name, self.skipped
                ),
            };
            if let Some(value) = pick(&message) {
                return value;
            }
            self.skipped.push(message);
        }
    }
}

/// Poll `condition` until it holds, panicking after `POLL_TIMEOUT`.
pub fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(start.elapsed() < POLL_TIMEOUT, "timed out waiting for {what}");
        thread::sleep(POLL_INTERVAL);
    }
}
