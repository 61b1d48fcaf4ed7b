// Per-connection state: the shared `ConnectionLink` and the `ConnectionHandler`
// that owns the read side.
//
// Each accepted socket gets one handler thread, blocked in `read_line`. The
// handler parses every line once into a `ClientMessage` and dispatches on
// (phase, message):
//
//   AwaitingLogin --L--> AwaitingSessionChoice --C--> AwaitingMorePlayers
//                                                 \--> AwaitingStartLocation
//   AwaitingMorePlayers --(session announced)--> AwaitingStartLocation
//   AwaitingStartLocation --S--> AwaitingTurnAction --M/F/P--> (same)
//   any --Q / game over--> GameOver (connection closes)
//   AwaitingLogin --L<admin name>--> AdminConsole --"Shutdown"--> stop server
//
// Everything other threads need to reach lives on the `ConnectionLink`,
// shared via `Arc`: the buffered writer (sessions deliver through it as a
// `LineSink`), the phase (session-list broadcasts check it), and the idle
// timer and heartbeat challenge (the sweeper drives those). The handler's
// `BufReader` is the only thing that stays private to its thread.
//
// Closing: `force_close` shuts the socket down from another thread, which
// wakes the blocked read with an error. The `forced_close` flag lets the
// handler classify that error as expected. Cleanup itself lives in
// `ServerContext::release_connection` and runs once per link no matter how
// many paths ask for it.

use std::fmt;
use std::io::{self, BufReader, BufWriter};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, MutexGuard};
use salvo_protocol::{
    ClientMessage, Coordinate, LIST_SEPARATOR, ServerMessage, read_line, write_line,
};
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::registry::{JoinOutcome, ServerContext};
use crate::session::{GameSession, Gate, LineSink};

/// Process-unique connection number, assigned at accept time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a connection is in the protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    AwaitingLogin,
    AwaitingSessionChoice,
    AwaitingMorePlayers,
    AwaitingStartLocation,
    AwaitingTurnAction,
    GameOver,
    AdminConsole,
}

/// Outcome of one idle check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TimeoutAction {
    /// Heard from recently enough.
    Fresh,
    /// Inside the heartbeat window: send this challenge payload.
    Challenge(String),
    /// Silent for the whole timeout.
    Expired,
}

/// Shared half of a connection.
pub struct ConnectionLink {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    /// Kept for `shutdown`; reads go through the handler's own clone.
    stream: TcpStream,
    writer: Mutex<BufWriter<TcpStream>>,
    phase: Mutex<Phase>,
    username: OnceLock<String>,
    session: OnceLock<Arc<GameSession>>,
    last_message: Mutex<Instant>,
    challenge: Mutex<Option<String>>,
    forced_close: AtomicBool,
    /// Set once cleanup has been claimed. A mutex rather than an atomic so
    /// registration can hold it across a login or join.
    released: Mutex<bool>,
    game_over: AtomicBool,
}

/// Exclusive hold on a link's writer. Sessions delivering to this link block
/// until it is dropped.
pub struct LinkWriter<'a> {
    guard: MutexGuard<'a, BufWriter<TcpStream>>,
}

impl LinkWriter<'_> {
    pub fn send(&mut self, message: &ServerMessage) -> io::Result<()> {
        write_line(&mut *self.guard, &message.encode())
    }
}

impl ConnectionLink {
    pub fn new(id: ConnectionId, stream: TcpStream) -> io::Result<Self> {
        let peer = stream.peer_addr().ok();
        let writer = BufWriter::new(stream.try_clone()?);
        Ok(Self {
            id,
            peer,
            stream,
            writer: Mutex::new(writer),
            phase: Mutex::new(Phase::AwaitingLogin),
            username: OnceLock::new(),
            session: OnceLock::new(),
            last_message: Mutex::new(Instant::now()),
            challenge: Mutex::new(None),
            forced_close: AtomicBool::new(false),
            released: Mutex::new(false),
            game_over: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// A second handle on the socket for the handler's reader.
    pub fn try_clone_stream(&self) -> io::Result<TcpStream> {
        self.stream.try_clone()
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock()
    }

    pub fn set_phase(&self, phase: Phase) {
        *self.phase.lock() = phase;
    }

    pub fn username(&self) -> Option<&str> {
        self.username.get().map(String::as_str)
    }

    /// Bind the logged-in name. Returns false if one was already bound.
    pub fn bind_username(&self, username: String) -> bool {
        self.username.set(username).is_ok()
    }

    pub fn session(&self) -> Option<&Arc<GameSession>> {
        self.session.get()
    }

    pub fn bind_session(&self, session: Arc<GameSession>) -> bool {
        self.session.set(session).is_ok()
    }

    pub fn lock_writer(&self) -> LinkWriter<'_> {
        LinkWriter {
            guard: self.writer.lock(),
        }
    }

    /// Reset the idle timer.
    pub fn touch(&self, now: Instant) {
        *self.last_message.lock() = now;
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_message.lock())
    }

    /// Compare idle time against `timeout`. Inside the last `window` a fresh
    /// challenge (username followed by epoch millis) is recorded and returned
    /// for the caller to send.
    pub fn check_timeout(
        &self,
        now: Instant,
        timeout: Duration,
        window: Duration,
    ) -> TimeoutAction {
        let idle = self.idle_for(now);
        if idle >= timeout {
            return TimeoutAction::Expired;
        }
        if timeout - idle >= window {
            return TimeoutAction::Fresh;
        }
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let payload = format!("{}{millis}", self.username().unwrap_or_default());
        *self.challenge.lock() = Some(payload.clone());
        TimeoutAction::Challenge(payload)
    }

    /// True if `payload` answers the outstanding challenge; the challenge is
    /// consumed.
    pub fn answer_challenge(&self, payload: &str) -> bool {
        let mut challenge = self.challenge.lock();
        if challenge.as_deref() == Some(payload) {
            *challenge = None;
            true
        } else {
            false
        }
    }

    pub fn is_game_over(&self) -> bool {
        self.game_over.load(Ordering::SeqCst)
    }

    pub fn was_force_closed(&self) -> bool {
        self.forced_close.load(Ordering::SeqCst)
    }

    /// Shut the socket down from outside the handler thread. The handler's
    /// blocked read fails and is treated as expected.
    pub fn force_close(&self) {
        self.forced_close.store(true, Ordering::SeqCst);
        self.close();
    }

    pub fn close(&self) {
        if let Err(error) = self.stream.shutdown(Shutdown::Both) {
            debug!(conn = %self.id, %error, "socket already closed");
        }
    }

    /// Claim the one-time cleanup. Only the first caller gets true.
    pub fn mark_released(&self) -> bool {
        !std::mem::replace(&mut *self.released.lock(), true)
    }

    pub fn is_released(&self) -> bool {
        *self.released.lock()
    }

    /// Run `register` unless cleanup has already been claimed. Cleanup waits
    /// while `register` runs, so whatever it binds to this link is seen and
    /// undone by the release. `register` must not call back into
    /// `mark_released`.
    pub fn unless_released<R>(&self, register: impl FnOnce() -> R) -> Option<R> {
        let released = self.released.lock();
        if *released {
            return None;
        }
        Some(register())
    }
}

impl LineSink for ConnectionLink {
    fn send(&self, message: &ServerMessage) -> io::Result<()> {
        self.lock_writer().send(message)
    }

    /// The game is over for this player: stop reading so the handler wakes
    /// up, finishes, and releases the connection.
    fn mark_game_over(&self) {
        self.game_over.store(true, Ordering::SeqCst);
        self.set_phase(Phase::GameOver);
        if let Err(error) = self.stream.shutdown(Shutdown::Read) {
            debug!(conn = %self.id, %error, "read side already closed");
        }
    }
}

/// What the read loop does after a line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// Owns the read side of one connection and drives its phase machine.
pub struct ConnectionHandler {
    context: Arc<ServerContext>,
    link: Arc<ConnectionLink>,
    reader: BufReader<TcpStream>,
}

impl ConnectionHandler {
    pub fn new(context: Arc<ServerContext>, link: Arc<ConnectionLink>) -> io::Result<Self> {
        let reader = BufReader::new(link.try_clone_stream()?);
        Ok(Self {
            context,
            link,
            reader,
        })
    }

    /// Greet the client, then process lines until the connection ends.
    /// Always finishes by releasing the connection.
    pub fn run(mut self) {
        let conn = self.link.id();
        debug!(%conn, peer = ?self.link.peer(), "connection opened");

        let welcome = ServerMessage::Welcome {
            lines: self.context.config().rules.clone().normalized().welcome_lines(),
        };
        if let Err(error) = self.link.send(&welcome) {
            debug!(%conn, %error, "failed to send welcome");
        }

        loop {
            match read_line(&mut self.reader) {
                Ok(Some(line)) => {
                    if self.handle_line(&line) == Flow::Close {
                        break;
                    }
                }
                Ok(None) => {
                    debug!(%conn, "peer closed connection");
                    break;
                }
                Err(error) => {
                    if self.link.was_force_closed() || self.context.is_shutting_down() {
                        debug!(%conn, %error, "read ended after forced close");
                    } else {
                        warn!(%conn, user = ?self.link.username(), %error, "read failed");
                    }
                    break;
                }
            }
        }

        self.context.release_connection(&self.link);
    }

    fn handle_line(&mut self, line: &str) -> Flow {
        if line.is_empty() {
            return Flow::Continue;
        }
        self.link.touch(Instant::now());
        let conn = self.link.id();

        if self.link.phase() == Phase::AdminConsole && line.trim() == "Shutdown" {
            info!(%conn, "shutdown requested from admin console");
            self.context.request_shutdown();
            return Flow::Close;
        }

        let message = match ClientMessage::parse(line) {
            Ok(message) => message,
            Err(error) => {
                warn!(%conn, %error, "discarding malformed line");
                return Flow::Continue;
            }
        };

        match &message {
            ClientMessage::Quit => {
                debug!(%conn, user = ?self.link.username(), "quit");
                self.link.set_phase(Phase::GameOver);
                return Flow::Close;
            }
            ClientMessage::Heartbeat { payload } => {
                if !self.link.answer_challenge(payload) {
                    let echo = ServerMessage::Heartbeat {
                        payload: payload.clone(),
                    };
                    if let Err(error) = self.link.send(&echo) {
                        debug!(%conn, %error, "failed to echo heartbeat");
                    }
                }
                return Flow::Continue;
            }
            _ => {}
        }

        if self.link.is_game_over() {
            self.link.set_phase(Phase::GameOver);
            return Flow::Close;
        }
        self.promote_if_announced();

        match (self.link.phase(), message) {
            (Phase::AwaitingLogin, ClientMessage::Login { username }) => self.login(username),
            (Phase::AwaitingSessionChoice, ClientMessage::Connect { session }) => {
                self.connect(&session)
            }
            (Phase::AwaitingStartLocation, ClientMessage::StartLocation(at)) => {
                self.start_location(at)
            }
            (Phase::AwaitingTurnAction, ClientMessage::Move(direction)) => {
                self.act(|session, user| session.move_ship(user, direction))
            }
            (Phase::AwaitingTurnAction, ClientMessage::Fire(target)) => {
                self.act(|session, user| session.fire(user, target))
            }
            (Phase::AwaitingTurnAction, ClientMessage::Scan(target)) => {
                self.act(|session, user| session.scan(user, target).map(|(_, gate)| gate))
            }
            (Phase::GameOver, _) => Flow::Close,
            (phase, message) => {
                warn!(%conn, ?phase, ?message, "message not accepted in this phase; discarded");
                Flow::Continue
            }
        }
    }

    /// A connection waiting for players moves on once its session has sent
    /// the start of game.
    fn promote_if_announced(&self) {
        if self.link.phase() != Phase::AwaitingMorePlayers {
            return;
        }
        if self.link.session().is_some_and(|s| s.has_announced_start()) {
            self.link.set_phase(Phase::AwaitingStartLocation);
        }
    }

    fn login(&self, username: String) -> Flow {
        let conn = self.link.id();
        if username == self.context.config().admin_username {
            info!(%conn, "admin console opened");
            self.link.set_phase(Phase::AdminConsole);
            return Flow::Continue;
        }
        let valid = !username.is_empty() && !username.contains(LIST_SEPARATOR);
        let registered = self.link.unless_released(|| {
            if !valid || !self.context.register_username(&username) {
                return false;
            }
            self.link.bind_username(username.clone());
            // Phase first, so a list change racing this login is still sent
            // here.
            self.link.set_phase(Phase::AwaitingSessionChoice);
            true
        });
        match registered {
            None => {
                debug!(%conn, user = %username, "login after release; ignored");
                return Flow::Close;
            }
            Some(false) => {
                info!(%conn, user = %username, "login rejected");
                if let Err(error) = self.link.send(&ServerMessage::LoginRejected) {
                    debug!(%conn, %error, "failed to send login rejection");
                }
                return Flow::Continue;
            }
            Some(true) => {
                info!(%conn, user = %username, "logged in");
            }
        }
        if let Err(error) = self.link.send(&self.context.session_list()) {
            debug!(%conn, %error, "failed to send session list");
        }
        Flow::Continue
    }

    fn connect(&self, name: &str) -> Flow {
        let conn = self.link.id();
        let Some(username) = self.link.username() else {
            return Flow::Continue;
        };
        let sink: Arc<dyn LineSink> = self.link.clone();

        // Hold our own writer across the join so the N reply goes out before
        // any B line the join makes possible.
        let mut writer = self.link.lock_writer();
        let joined = self.link.unless_released(|| {
            match self.context.join_or_create(name, username, sink) {
                JoinOutcome::Rejected => (ServerMessage::JoinRejected, None),
                JoinOutcome::Created { session } => {
                    self.link.bind_session(session);
                    self.link.set_phase(Phase::AwaitingMorePlayers);
                    (ServerMessage::Created, None)
                }
                JoinOutcome::Joined { session, filled } => {
                    self.link.bind_session(Arc::clone(&session));
                    if filled {
                        self.link.set_phase(Phase::AwaitingStartLocation);
                        (ServerMessage::Joined, Some(session))
                    } else {
                        self.link.set_phase(Phase::AwaitingMorePlayers);
                        (ServerMessage::Joined, None)
                    }
                }
            }
        });
        let Some((reply, filled_session)) = joined else {
            debug!(%conn, user = %username, session = %name, "join after release; ignored");
            return Flow::Close;
        };
        if reply != ServerMessage::JoinRejected {
            info!(
                %conn,
                user = %username,
                session = %name,
                reply = %reply.encode(),
                "session choice"
            );
            // This link has left AwaitingSessionChoice, so the list never
            // targets our own (held) writer.
            self.context.broadcast_session_list();
        }
        if let Err(error) = writer.send(&reply) {
            debug!(%conn, %error, "failed to send join reply");
        }
        drop(writer);

        if let Some(session) = filled_session {
            session.broadcast_start_of_game().deliver();
        }
        Flow::Continue
    }

    fn start_location(&self, at: Coordinate) -> Flow {
        let (Some(session), Some(username)) = (self.link.session(), self.link.username()) else {
            return Flow::Continue;
        };
        match session.set_start_location(username, at) {
            Ok(gate) => {
                self.link.set_phase(Phase::AwaitingTurnAction);
                if gate == Gate::Opened {
                    session.broadcast_start_of_turn().deliver();
                }
            }
            Err(error) => self.reject(error),
        }
        self.after_session_call()
    }

    fn act<F>(&self, action: F) -> Flow
    where
        F: FnOnce(&GameSession, &str) -> Result<Gate, SessionError>,
    {
        let (Some(session), Some(username)) = (self.link.session(), self.link.username()) else {
            return Flow::Continue;
        };
        match action(session.as_ref(), username) {
            Ok(Gate::Opened) => session.resolve_turn().deliver(),
            Ok(Gate::Pending) => {}
            Err(error) => self.reject(error),
        }
        self.after_session_call()
    }

    fn reject(&self, error: SessionError) {
        warn!(conn = %self.link.id(), user = ?self.link.username(), %error, "action discarded");
    }

    fn after_session_call(&self) -> Flow {
        if self.link.is_game_over() {
            self.link.set_phase(Phase::GameOver);
            Flow::Close
        } else {
            Flow::Continue
        }
    }
}
