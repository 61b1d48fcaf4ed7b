// Server context: every piece of process-wide shared state.
//
// `ServerContext` is constructed once by `start_server` and handed to every
// connection handler as an `Arc`. It owns:
//
// - the session registry, split into `open` (still filling) and `active`
//   (full, playing or finished) maps keyed by session name;
// - the set of logged-in usernames;
// - the table of live connections, which the idle sweeper scans;
// - the shutdown flag checked by the accept loop.
//
// Lock order is registry before session: `join_or_create` and
// `drop_session_if_empty` hold the registry lock while they call into a
// session. No lock in this module is held while writing to a socket. Methods
// that fan out (`broadcast_session_list`, `sweep_idle`, `close_all`) take a
// snapshot under the lock, release it, and then send.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use salvo_protocol::{LIST_SEPARATOR, ServerMessage};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::connection::{ConnectionId, ConnectionLink, Phase, TimeoutAction};
use crate::session::{GameSession, JoinStatus, LineSink};

/// Result of `ServerContext::join_or_create`.
pub enum JoinOutcome {
    /// Joined an open session. `filled` is set if this join completed it;
    /// the session has already moved to the active registry.
    Joined {
        session: Arc<GameSession>,
        filled: bool,
    },
    /// No open session had this name; a new one was created with the caller
    /// as its first player.
    Created { session: Arc<GameSession> },
    /// Invalid name, or a game by that name is already running.
    Rejected,
}

#[derive(Default)]
struct SessionRegistry {
    open: BTreeMap<String, Arc<GameSession>>,
    active: BTreeMap<String, Arc<GameSession>>,
}

pub struct ServerContext {
    config: ServerConfig,
    sessions: Mutex<SessionRegistry>,
    usernames: Mutex<BTreeSet<String>>,
    connections: Mutex<BTreeMap<ConnectionId, Arc<ConnectionLink>>>,
    next_connection_id: AtomicU64,
    shutdown: AtomicBool,
}

impl ServerContext {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(SessionRegistry::default()),
            usernames: Mutex::new(BTreeSet::new()),
            connections: Mutex::new(BTreeMap::new()),
            next_connection_id: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    // -- Usernames --

    /// Claim a username. False if someone already holds it.
    pub fn register_username(&self, username: &str) -> bool {
        self.usernames.lock().insert(username.to_string())
    }

    pub fn release_username(&self, username: &str) -> bool {
        self.usernames.lock().remove(username)
    }

    pub fn is_username_taken(&self, username: &str) -> bool {
        self.usernames.lock().contains(username)
    }

    pub fn username_count(&self) -> usize {
        self.usernames.lock().len()
    }

    // -- Sessions --

    /// Join the open session called `name`, or create it. A join that fills
    /// the session moves it from open to active under the same lock.
    pub fn join_or_create(
        &self,
        name: &str,
        username: &str,
        sink: Arc<dyn LineSink>,
    ) -> JoinOutcome {
        if name.is_empty() || name.contains(LIST_SEPARATOR) {
            return JoinOutcome::Rejected;
        }
        let mut sessions = self.sessions.lock();
        if sessions.active.contains_key(name) {
            debug!(session = %name, user = %username, "session already running");
            return JoinOutcome::Rejected;
        }

        if let Some(session) = sessions.open.get(name).cloned() {
            return match session.join(username, sink) {
                Ok(JoinStatus::Waiting) => JoinOutcome::Joined {
                    session,
                    filled: false,
                },
                Ok(JoinStatus::Filled) => {
                    sessions.open.remove(name);
                    sessions
                        .active
                        .insert(name.to_string(), Arc::clone(&session));
                    JoinOutcome::Joined {
                        session,
                        filled: true,
                    }
                }
                Err(error) => {
                    warn!(session = %name, user = %username, %error, "join failed");
                    JoinOutcome::Rejected
                }
            };
        }

        let session = Arc::new(GameSession::new(name, self.config.rules.clone()));
        if let Err(error) = session.join(username, sink) {
            warn!(session = %name, user = %username, %error, "join of a new session failed");
            return JoinOutcome::Rejected;
        }
        info!(
            session = %name,
            user = %username,
            players = session.required_players(),
            "session created"
        );
        sessions.open.insert(name.to_string(), Arc::clone(&session));
        JoinOutcome::Created { session }
    }

    /// Remove `session` from whichever registry holds it once its last
    /// player has left. Returns true if the open list changed.
    pub fn drop_session_if_empty(&self, session: &Arc<GameSession>) -> bool {
        let mut sessions = self.sessions.lock();
        if session.player_count() > 0 {
            return false;
        }
        let name = session.name();
        if sessions
            .open
            .get(name)
            .is_some_and(|s| Arc::ptr_eq(s, session))
        {
            sessions.open.remove(name);
            info!(session = %name, "open session dropped");
            return true;
        }
        if sessions
            .active
            .get(name)
            .is_some_and(|s| Arc::ptr_eq(s, session))
        {
            sessions.active.remove(name);
            info!(session = %name, state = ?session.state(), "active session dropped");
        }
        false
    }

    /// Names of sessions still waiting for players, sorted.
    pub fn open_session_names(&self) -> Vec<String> {
        self.sessions.lock().open.keys().cloned().collect()
    }

    pub fn active_session_names(&self) -> Vec<String> {
        self.sessions.lock().active.keys().cloned().collect()
    }

    pub fn find_session(&self, name: &str) -> Option<Arc<GameSession>> {
        let sessions = self.sessions.lock();
        sessions
            .open
            .get(name)
            .or_else(|| sessions.active.get(name))
            .cloned()
    }

    pub fn session_list(&self) -> ServerMessage {
        ServerMessage::SessionList {
            names: self.open_session_names(),
        }
    }

    /// Send the current open-session list to every connection still choosing
    /// a session.
    pub fn broadcast_session_list(&self) {
        let message = self.session_list();
        let choosing: Vec<Arc<ConnectionLink>> = self
            .connection_snapshot()
            .into_iter()
            .filter(|link| link.phase() == Phase::AwaitingSessionChoice)
            .collect();
        for link in choosing {
            if let Err(error) = link.send(&message) {
                debug!(conn = %link.id(), %error, "failed to send session list");
            }
        }
    }

    // -- Connections --

    /// Track a newly accepted socket.
    pub fn register_connection(&self, stream: TcpStream) -> io::Result<Arc<ConnectionLink>> {
        let id = ConnectionId(self.next_connection_id.fetch_add(1, Ordering::SeqCst));
        let link = Arc::new(ConnectionLink::new(id, stream)?);
        self.connections.lock().insert(id, Arc::clone(&link));
        Ok(link)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn connection_snapshot(&self) -> Vec<Arc<ConnectionLink>> {
        self.connections.lock().values().cloned().collect()
    }

    /// Challenge connections nearing the idle timeout and force-close the
    /// ones past it.
    pub fn sweep_idle(&self, now: Instant) {
        let timeout = self.config.connection_timeout();
        let window = self.config.heartbeat_window();
        for link in self.connection_snapshot() {
            match link.check_timeout(now, timeout, window) {
                TimeoutAction::Fresh => {}
                TimeoutAction::Challenge(payload) => {
                    if let Err(error) = link.send(&ServerMessage::Heartbeat { payload }) {
                        debug!(conn = %link.id(), %error, "failed to send heartbeat");
                    }
                }
                TimeoutAction::Expired => {
                    info!(
                        conn = %link.id(),
                        user = ?link.username(),
                        idle_ms = link.idle_for(now).as_millis() as u64,
                        "connection timed out"
                    );
                    self.force_close(&link);
                }
            }
        }
    }

    /// Close a connection from outside its handler and clean it up.
    pub fn force_close(&self, link: &Arc<ConnectionLink>) {
        link.force_close();
        self.release_connection(link);
    }

    /// Disconnect cleanup: leave the bound session, drop it if now empty,
    /// free the username, forget the connection, close the socket. Runs at
    /// most once per link; returns false for every call after the first.
    pub fn release_connection(&self, link: &Arc<ConnectionLink>) -> bool {
        if !link.mark_released() {
            return false;
        }
        self.connections.lock().remove(&link.id());
        link.set_phase(Phase::GameOver);

        if let (Some(session), Some(username)) = (link.session(), link.username()) {
            session.disconnect(username).deliver();
            if self.drop_session_if_empty(session) {
                self.broadcast_session_list();
            }
        }
        if let Some(username) = link.username() {
            self.release_username(username);
        }
        link.close();
        debug!(conn = %link.id(), user = ?link.username(), "connection released");
        true
    }

    // -- Shutdown --

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Force-close every remaining connection.
    pub fn close_all(&self) {
        for link in self.connection_snapshot() {
            self.force_close(&link);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::BufReader;
    use std::net::TcpListener;

    use salvo_protocol::read_line;

    use super::*;
    use crate::config::GameRules;

    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn context(players: usize) -> ServerContext {
        ServerContext::new(ServerConfig {
            rules: GameRules {
                players,
                ..GameRules::default()
            },
            ..ServerConfig::default()
        })
    }

    /// A registered link with a bound username, plus its client end.
    fn player(context: &ServerContext, name: &str) -> (TcpStream, Arc<ConnectionLink>) {
        let (client, server) = tcp_pair();
        let link = context.register_connection(server).unwrap();
        assert!(context.register_username(name));
        link.bind_username(name.to_string());
        (client, link)
    }

    #[test]
    fn usernames_are_unique() {
        let context = context(2);
        assert!(context.register_username("alice"));
        assert!(!context.register_username("alice"));
        assert_eq!(context.username_count(), 1);
        assert!(context.release_username("alice"));
        assert!(context.register_username("alice"));
    }

    #[test]
    fn create_then_fill_moves_session_to_active() {
        let context = context(2);
        let (_a, alice) = player(&context, "alice");
        let (_b, bob) = player(&context, "bob");

        let outcome = context.join_or_create("Arena", "alice", alice.clone());
        assert!(matches!(outcome, JoinOutcome::Created { .. }));
        assert_eq!(context.open_session_names(), vec!["Arena"]);

        let outcome = context.join_or_create("Arena", "bob", bob.clone());
        assert!(matches!(outcome, JoinOutcome::Joined { filled: true, .. }));
        assert!(context.open_session_names().is_empty());
        assert_eq!(context.active_session_names(), vec!["Arena"]);

        // A running game's name cannot be joined.
        let (_c, carol) = player(&context, "carol");
        assert!(matches!(
            context.join_or_create("Arena", "carol", carol),
            JoinOutcome::Rejected
        ));
    }

    #[test]
    fn invalid_session_names_are_rejected() {
        let context = context(2);
        let (_a, alice) = player(&context, "alice");
        assert!(matches!(
            context.join_or_create("", "alice", alice.clone()),
            JoinOutcome::Rejected
        ));
        assert!(matches!(
            context.join_or_create("a:b", "alice", alice),
            JoinOutcome::Rejected
        ));
        assert!(context.open_session_names().is_empty());
    }

    #[test]
    fn empty_session_is_dropped_only_once_empty() {
        let context = context(3);
        let (_a, alice) = player(&context, "alice");
        let (_b, bob) = player(&context, "bob");
        let JoinOutcome::Created { session } =
            context.join_or_create("Arena", "alice", alice.clone())
        else {
            panic!("expected a new session");
        };
        alice.bind_session(Arc::clone(&session));
        let _ = context.join_or_create("Arena", "bob", bob);

        assert!(session.disconnect("alice").is_empty());
        assert!(!context.drop_session_if_empty(&session));
        assert_eq!(context.open_session_names(), vec!["Arena"]);

        assert!(session.disconnect("bob").is_empty());
        assert!(context.drop_session_if_empty(&session));
        assert!(context.find_session("Arena").is_none());
    }

    #[test]
    fn stale_session_does_not_drop_its_successor() {
        let context = context(2);
        let (_a, alice) = player(&context, "alice");
        let (_b, bob) = player(&context, "bob");
        let JoinOutcome::Created { session: first } =
            context.join_or_create("Arena", "alice", alice)
        else {
            panic!("expected a new session");
        };
        first.disconnect("alice").deliver();
        assert!(context.drop_session_if_empty(&first));

        let JoinOutcome::Created { session: second } =
            context.join_or_create("Arena", "bob", bob)
        else {
            panic!("expected a new session");
        };
        assert!(!context.drop_session_if_empty(&first));
        let current = context.find_session("Arena").unwrap();
        assert!(Arc::ptr_eq(&current, &second));
    }

    #[test]
    fn session_list_goes_only_to_choosing_connections() {
        let context = context(2);
        let (a, alice) = player(&context, "alice");
        let (_b, bob) = player(&context, "bob");
        alice.set_phase(Phase::AwaitingSessionChoice);
        bob.set_phase(Phase::AwaitingMorePlayers);
        let _ = context.join_or_create("Arena", "bob", bob);

        context.broadcast_session_list();
        let mut reader = BufReader::new(a);
        assert_eq!(read_line(&mut reader).unwrap().as_deref(), Some("AArena"));
    }

    #[test]
    fn release_runs_once_and_frees_username() {
        let context = context(2);
        let (_a, alice) = player(&context, "alice");
        assert_eq!(context.connection_count(), 1);

        assert!(context.release_connection(&alice));
        assert!(!context.release_connection(&alice));
        assert_eq!(context.connection_count(), 0);
        assert!(!context.is_username_taken("alice"));
    }

    #[test]
    fn sweeper_expires_silent_connections() {
        let context = context(2);
        let (client, alice) = player(&context, "alice");
        let now = Instant::now();
        alice.touch(now);

        context.sweep_idle(now + context.config().connection_timeout() / 2);
        assert_eq!(context.connection_count(), 1);

        context.sweep_idle(now + context.config().connection_timeout());
        assert_eq!(context.connection_count(), 0);
        assert!(alice.was_force_closed());
        assert!(!context.is_username_taken("alice"));

        let mut reader = BufReader::new(client);
        assert_eq!(read_line(&mut reader).unwrap(), None);
    }

    #[test]
    fn sweeper_challenges_inside_heartbeat_window() {
        let context = context(2);
        let (client, alice) = player(&context, "alice");
        let now = Instant::now();
        alice.touch(now);

        let config = context.config();
        context.sweep_idle(now + config.connection_timeout() - config.heartbeat_window() / 2);
        let mut reader = BufReader::new(client);
        let line = read_line(&mut reader).unwrap().unwrap();
        assert!(line.starts_with("Halice"), "unexpected line {line:?}");
        assert!(alice.answer_challenge(&line[1..]));
        assert_eq!(context.connection_count(), 1);
    }
}
