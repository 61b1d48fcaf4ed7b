// Game session: the turn engine for one named game.
//
// `GameSession` owns the player records of one game and the session state
// machine:
//
//   Empty -> AwaitingPlayers -> AwaitingStartLocations -> AwaitingTurnActions
//                                                              |  ^
//                                                              +--+ (each turn)
//   any started state -> Finished (last survivor, or a forced end on departure)
//
// Every operation takes the session's mutex for its whole read-modify-write
// and returns a `Dispatch`: the outbound lines it decided to send. The caller
// delivers the dispatch after the lock is released, so no session lock is
// ever held across socket I/O.
//
// The readiness gate (`ready`) means "every survivor has finished the current
// phase". Player actions report `Gate::Opened` only to the single caller whose
// action flipped the gate from false to true, and the turn-advance entry
// points re-check the gate under the lock, so concurrent handlers can never
// both advance the same turn.
//
// Players live in a `BTreeMap` keyed by a monotonically increasing slot id.
// Iteration order is join order, which fixes the order of opponent lists and
// broadcasts, and removal never disturbs the other slots.
//
// See also: `registry.rs` (which session a name refers to, open vs. active),
// `connection.rs` (the handler that maps protocol lines onto these calls).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use salvo_protocol::{Coordinate, Direction, ServerMessage};
use tracing::{debug, info, warn};

use crate::config::GameRules;
use crate::error::SessionError;

/// Somewhere a session can send a player's lines.
pub trait LineSink: Send + Sync {
    fn send(&self, message: &ServerMessage) -> io::Result<()>;

    /// Called after a `GameOver` has been handed to `send`.
    fn mark_game_over(&self) {}
}

/// Lifecycle of a session. Ordered: later variants are further along.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Empty,
    AwaitingPlayers,
    AwaitingStartLocations,
    AwaitingTurnActions,
    Finished,
}

/// Result of a join.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinStatus {
    /// Still short of the required headcount.
    Waiting,
    /// This join completed the headcount; start of game can be announced.
    Filled,
}

/// Whether the caller's action opened the readiness gate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Gate {
    Pending,
    /// This call was the last one the phase was waiting for. The caller must
    /// advance the session (`broadcast_start_of_turn` after start locations,
    /// `resolve_turn` after turn actions).
    Opened,
}

/// One outbound line addressed to one player.
pub struct Delivery {
    pub recipient: String,
    pub message: ServerMessage,
    sink: Arc<dyn LineSink>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("recipient", &self.recipient)
            .field("message", &self.message)
            .finish()
    }
}

/// Lines decided under the session lock, to be written after it is released.
#[must_use = "a dispatch sends nothing until delivered"]
#[derive(Debug, Default)]
pub struct Dispatch {
    deliveries: Vec<Delivery>,
}

impl Dispatch {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, player: &Player, message: ServerMessage) {
        self.deliveries.push(Delivery {
            recipient: player.username.clone(),
            message,
            sink: Arc::clone(&player.sink),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.deliveries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.deliveries.len()
    }

    pub fn deliveries(&self) -> &[Delivery] {
        &self.deliveries
    }

    /// Messages addressed to `username`, in send order.
    pub fn messages_for(&self, username: &str) -> Vec<&ServerMessage> {
        self.deliveries
            .iter()
            .filter(|d| d.recipient == username)
            .map(|d| &d.message)
            .collect()
    }

    /// Write every line to its recipient. Write failures are logged and
    /// skipped; the recipient's own read loop notices the dead socket.
    pub fn deliver(self) {
        for delivery in self.deliveries {
            if let Err(error) = delivery.sink.send(&delivery.message) {
                debug!(user = %delivery.recipient, %error, "dropped outbound line");
            }
            if matches!(delivery.message, ServerMessage::GameOver { .. }) {
                delivery.sink.mark_game_over();
            }
        }
    }
}

/// Position of a player within the session, in join order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct SlotId(u32);

struct Player {
    username: String,
    sink: Arc<dyn LineSink>,
    /// Below zero means eliminated at the next start of turn.
    hit_points: i32,
    position: Option<Coordinate>,
    moved: bool,
    /// Landed or took a hit this turn.
    hit_this_turn: bool,
    /// `None` until the player scans (or the end-of-turn default scan runs).
    scan_hits: Option<BTreeSet<Coordinate>>,
}

impl Player {
    fn new(username: &str, sink: Arc<dyn LineSink>, hit_points: i32) -> Self {
        Self {
            username: username.to_string(),
            sink,
            hit_points,
            position: None,
            moved: false,
            hit_this_turn: false,
            scan_hits: None,
        }
    }
}

struct SessionInner {
    state: SessionState,
    /// Target headcount. Shrinks with every post-start departure so the
    /// gates track survivors.
    required_players: usize,
    players: BTreeMap<SlotId, Player>,
    next_slot: u32,
    ready: bool,
    /// `B` lines have gone out; start locations are accepted from now on.
    announced: bool,
    /// `E` lines for the current turn have gone out.
    turn_ended: bool,
    turn: u32,
}

impl SessionInner {
    fn slot_of(&self, username: &str) -> Option<SlotId> {
        self.players
            .iter()
            .find(|(_, p)| p.username == username)
            .map(|(slot, _)| *slot)
    }

    fn player(&self, username: &str) -> Option<&Player> {
        self.players.values().find(|p| p.username == username)
    }

    fn player_mut(&mut self, username: &str) -> Option<&mut Player> {
        self.players.values_mut().find(|p| p.username == username)
    }

    fn started(&self) -> bool {
        self.state > SessionState::AwaitingPlayers
    }

    fn all_positioned(&self) -> bool {
        !self.players.is_empty() && self.players.values().all(|p| p.position.is_some())
    }

    fn all_moved(&self) -> bool {
        !self.players.is_empty() && self.players.values().all(|p| p.moved)
    }

    fn remove_player(&mut self, username: &str) -> Option<Player> {
        let slot = self.slot_of(username)?;
        let player = self.players.remove(&slot)?;
        if self.started() {
            self.required_players = self.required_players.saturating_sub(1);
        }
        Some(player)
    }

    /// Other players' ships within `radius` of `center`.
    fn scan_around(&self, scanner: &str, center: Coordinate, radius: u8) -> BTreeSet<Coordinate> {
        self.players
            .values()
            .filter(|p| p.username != scanner)
            .filter_map(|p| p.position)
            .filter(|pos| center.is_within(*pos, radius))
            .collect()
    }

    /// Shared preconditions for move/fire/scan. Returns the actor's position.
    fn check_can_act(
        &self,
        username: &str,
        action: &'static str,
    ) -> Result<Coordinate, SessionError> {
        if self.state != SessionState::AwaitingTurnActions {
            return Err(SessionError::WrongState {
                action,
                state: self.state,
            });
        }
        let player = self
            .player(username)
            .ok_or_else(|| SessionError::UnknownPlayer(username.to_string()))?;
        if player.moved {
            return Err(SessionError::AlreadyActed(username.to_string()));
        }
        player
            .position
            .ok_or_else(|| SessionError::NoPosition(username.to_string()))
    }

    /// Mark the actor as done for this turn and evaluate the gate.
    fn finish_action(&mut self, username: &str) -> Gate {
        if let Some(player) = self.player_mut(username) {
            player.moved = true;
        }
        if !self.ready && self.all_moved() {
            self.ready = true;
            Gate::Opened
        } else {
            Gate::Pending
        }
    }
}

/// Whether a shot at an occupied `target` cell lands.
///
/// Placeholder combat model: every shot on an occupied cell lands.
fn hit_lands(_target: Coordinate) -> bool {
    true
}

/// One named game and its players.
pub struct GameSession {
    name: String,
    rules: GameRules,
    inner: Mutex<SessionInner>,
}

impl GameSession {
    pub fn new(name: impl Into<String>, rules: GameRules) -> Self {
        let rules = rules.normalized();
        Self {
            name: name.into(),
            inner: Mutex::new(SessionInner {
                state: SessionState::Empty,
                required_players: rules.players,
                players: BTreeMap::new(),
                next_slot: 0,
                ready: false,
                announced: false,
                turn_ended: false,
                turn: 0,
            }),
            rules,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rules(&self) -> &GameRules {
        &self.rules
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn player_count(&self) -> usize {
        self.inner.lock().players.len()
    }

    pub fn required_players(&self) -> usize {
        self.inner.lock().required_players
    }

    /// The readiness gate for the current phase.
    pub fn is_ready(&self) -> bool {
        self.inner.lock().ready
    }

    pub fn has_announced_start(&self) -> bool {
        self.inner.lock().announced
    }

    /// Turns started so far.
    pub fn turn(&self) -> u32 {
        self.inner.lock().turn
    }

    pub fn contains(&self, username: &str) -> bool {
        self.inner.lock().slot_of(username).is_some()
    }

    /// Usernames in slot order.
    pub fn usernames(&self) -> Vec<String> {
        self.inner
            .lock()
            .players
            .values()
            .map(|p| p.username.clone())
            .collect()
    }

    pub fn hit_points(&self, username: &str) -> Option<i32> {
        self.inner.lock().player(username).map(|p| p.hit_points)
    }

    pub fn position(&self, username: &str) -> Option<Coordinate> {
        self.inner.lock().player(username).and_then(|p| p.position)
    }

    /// True iff every current player has acted this turn.
    pub fn all_moved(&self) -> bool {
        self.inner.lock().all_moved()
    }

    /// Take the next free slot. The join that completes the headcount sets
    /// the gate and moves the session to `AwaitingStartLocations`.
    pub fn join(
        &self,
        username: &str,
        sink: Arc<dyn LineSink>,
    ) -> Result<JoinStatus, SessionError> {
        let mut inner = self.inner.lock();
        if inner.started() || inner.players.len() >= inner.required_players {
            // Full sessions are moved out of the open registry when they fill.
            warn!(
                session = %self.name,
                user = %username,
                state = ?inner.state,
                "join on a full session; open registry is out of sync"
            );
            return Err(SessionError::Full);
        }
        if inner.slot_of(username).is_some() {
            return Err(SessionError::DuplicatePlayer(username.to_string()));
        }
        if inner.state == SessionState::Empty {
            inner.state = SessionState::AwaitingPlayers;
        }

        let slot = SlotId(inner.next_slot);
        inner.next_slot += 1;
        inner.players.insert(
            slot,
            Player::new(username, sink, self.rules.starting_hit_points),
        );
        debug!(session = %self.name, user = %username, slot = slot.0, "player joined");

        if inner.players.len() == inner.required_players {
            inner.ready = true;
            inner.state = SessionState::AwaitingStartLocations;
            info!(session = %self.name, players = inner.players.len(), "session full");
            Ok(JoinStatus::Filled)
        } else {
            Ok(JoinStatus::Waiting)
        }
    }

    /// Send every player the other players' names, in slot order. Requires
    /// the gate set by the filling join; clears it.
    pub fn broadcast_start_of_game(&self) -> Dispatch {
        let mut inner = self.inner.lock();
        let mut dispatch = Dispatch::new();
        if inner.state != SessionState::AwaitingStartLocations || !inner.ready || inner.announced {
            warn!(
                session = %self.name,
                state = ?inner.state,
                ready = inner.ready,
                "start of game requested while the session is not ready"
            );
            return dispatch;
        }

        let names: Vec<String> = inner.players.values().map(|p| p.username.clone()).collect();
        for player in inner.players.values() {
            let opponents = names
                .iter()
                .filter(|name| **name != player.username)
                .cloned()
                .collect();
            dispatch.push(player, ServerMessage::StartOfGame { opponents });
        }
        inner.announced = true;
        inner.ready = false;
        info!(session = %self.name, players = names.len(), "game starting");
        dispatch
    }

    /// Record a starting cell. Reports `Gate::Opened` to the caller whose
    /// placement completed the set.
    pub fn set_start_location(
        &self,
        username: &str,
        at: Coordinate,
    ) -> Result<Gate, SessionError> {
        let mut inner = self.inner.lock();
        if inner.state != SessionState::AwaitingStartLocations {
            return Err(SessionError::WrongState {
                action: "start location",
                state: inner.state,
            });
        }
        if !inner.announced {
            return Err(SessionError::NotAnnounced);
        }
        let player = inner
            .player_mut(username)
            .ok_or_else(|| SessionError::UnknownPlayer(username.to_string()))?;
        player.position = Some(at);
        debug!(session = %self.name, user = %username, %at, "start location set");

        if !inner.ready && inner.all_positioned() {
            inner.ready = true;
            Ok(Gate::Opened)
        } else {
            Ok(Gate::Pending)
        }
    }

    /// Remove eliminated players, then either declare the last survivor the
    /// winner or open the next turn for everyone still afloat.
    pub fn broadcast_start_of_turn(&self) -> Dispatch {
        let mut inner = self.inner.lock();
        let mut dispatch = Dispatch::new();
        self.start_of_turn_locked(&mut inner, &mut dispatch);
        dispatch
    }

    /// Send each player this turn's result. Requires every player to have
    /// acted; leaves the gate set for the following start of turn.
    pub fn broadcast_end_of_turn(&self) -> Dispatch {
        let mut inner = self.inner.lock();
        let mut dispatch = Dispatch::new();
        self.end_of_turn_locked(&mut inner, &mut dispatch);
        dispatch
    }

    /// End the current turn and start the next one in a single critical
    /// section. Called by whoever received `Gate::Opened` from an action.
    pub fn resolve_turn(&self) -> Dispatch {
        let mut inner = self.inner.lock();
        let mut dispatch = Dispatch::new();
        if self.end_of_turn_locked(&mut inner, &mut dispatch) {
            self.start_of_turn_locked(&mut inner, &mut dispatch);
        }
        dispatch
    }

    /// Move one step; each axis clamps at the board edge.
    pub fn move_ship(&self, username: &str, direction: Direction) -> Result<Gate, SessionError> {
        let mut inner = self.inner.lock();
        let from = inner.check_can_act(username, "move")?;
        let to = from.step(direction);
        if let Some(player) = inner.player_mut(username) {
            player.position = Some(to);
        }
        debug!(session = %self.name, user = %username, %from, %to, "move");
        Ok(inner.finish_action(username))
    }

    /// Scan around `target`, plus around the actor's own ship when the rules
    /// say so. The result is stored for this turn's `E` line and returned.
    pub fn scan(
        &self,
        username: &str,
        target: Coordinate,
    ) -> Result<(BTreeSet<Coordinate>, Gate), SessionError> {
        let mut inner = self.inner.lock();
        let own = inner.check_can_act(username, "scan")?;
        let radius = self.rules.scan_distance;
        let mut hits = inner.scan_around(username, target, radius);
        if self.rules.scan_near_own_ship {
            hits.extend(inner.scan_around(username, own, radius));
        }
        if let Some(player) = inner.player_mut(username) {
            player.scan_hits = Some(hits.clone());
        }
        debug!(session = %self.name, user = %username, %target, found = hits.len(), "scan");
        let gate = inner.finish_action(username);
        Ok((hits, gate))
    }

    /// Fire at `target`. Every other ship on that cell takes damage, and
    /// both sides of a landed shot get the hit flag.
    pub fn fire(&self, username: &str, target: Coordinate) -> Result<Gate, SessionError> {
        let mut inner = self.inner.lock();
        inner.check_can_act(username, "fire")?;
        let mut landed = 0;
        for player in inner.players.values_mut() {
            if player.username == username || player.position != Some(target) {
                continue;
            }
            if hit_lands(target) {
                player.hit_points -= self.rules.damage_per_hit;
                player.hit_this_turn = true;
                landed += 1;
                info!(
                    session = %self.name,
                    shooter = %username,
                    target = %player.username,
                    hit_points = player.hit_points,
                    "hit"
                );
            }
        }
        if let Some(shooter) = inner.player_mut(username).filter(|_| landed > 0) {
            shooter.hit_this_turn = true;
        }
        Ok(inner.finish_action(username))
    }

    /// A player left (quit, error, or timeout). With fewer than three
    /// players in a started game this ends it: everyone else wins and the
    /// leaver loses. Otherwise the leaver is removed and the gate is
    /// re-evaluated against the survivors. No-op for unknown players.
    pub fn disconnect(&self, username: &str) -> Dispatch {
        let mut inner = self.inner.lock();
        let mut dispatch = Dispatch::new();
        if inner.slot_of(username).is_none() {
            return dispatch;
        }

        if inner.players.len() < 3 && inner.started() && inner.state != SessionState::Finished {
            info!(session = %self.name, user = %username, "player left; game cannot continue");
            inner.state = SessionState::Finished;
            inner.ready = false;
            let others: Vec<String> = inner
                .players
                .values()
                .filter(|p| p.username != username)
                .map(|p| p.username.clone())
                .collect();
            for name in others {
                if let Some(winner) = inner.remove_player(&name) {
                    dispatch.push(&winner, ServerMessage::GameOver { won: true });
                }
            }
            if let Some(leaver) = inner.player(username) {
                dispatch.push(leaver, ServerMessage::GameOver { won: false });
            }
        }

        inner.remove_player(username);
        debug!(
            session = %self.name,
            user = %username,
            remaining = inner.players.len(),
            "player left session"
        );
        self.after_departure_locked(&mut inner, &mut dispatch);
        dispatch
    }

    /// Drop a player record. After the game has started this also lowers
    /// the required headcount.
    pub fn remove(&self, username: &str) -> bool {
        self.inner.lock().remove_player(username).is_some()
    }

    fn start_of_turn_locked(&self, inner: &mut SessionInner, dispatch: &mut Dispatch) -> bool {
        let resumable = match inner.state {
            SessionState::AwaitingStartLocations => inner.announced,
            SessionState::AwaitingTurnActions => inner.turn_ended,
            _ => false,
        };
        if !inner.ready || !resumable {
            debug!(
                session = %self.name,
                state = ?inner.state,
                ready = inner.ready,
                "start of turn skipped"
            );
            return false;
        }

        let eliminated: Vec<String> = inner
            .players
            .values()
            .filter(|p| p.hit_points < 0)
            .map(|p| p.username.clone())
            .collect();
        for name in eliminated {
            if let Some(player) = inner.remove_player(&name) {
                info!(session = %self.name, user = %name, "player eliminated");
                dispatch.push(&player, ServerMessage::GameOver { won: false });
            }
        }

        inner.ready = false;
        inner.turn_ended = false;
        match inner.players.len() {
            0 => {
                inner.state = SessionState::Finished;
                info!(session = %self.name, "game over; no survivors");
            }
            1 => {
                let last = inner.players.values().next().map(|p| p.username.clone());
                if let Some(winner) = last.and_then(|name| inner.remove_player(&name)) {
                    info!(session = %self.name, user = %winner.username, "game won");
                    dispatch.push(&winner, ServerMessage::GameOver { won: true });
                }
                inner.state = SessionState::Finished;
            }
            _ => {
                inner.state = SessionState::AwaitingTurnActions;
                inner.turn += 1;
                for player in inner.players.values_mut() {
                    player.moved = false;
                }
                for player in inner.players.values() {
                    dispatch.push(
                        player,
                        ServerMessage::StartOfTurn {
                            hit_points: player.hit_points,
                        },
                    );
                }
                debug!(session = %self.name, turn = inner.turn, "turn started");
            }
        }
        true
    }

    fn end_of_turn_locked(&self, inner: &mut SessionInner, dispatch: &mut Dispatch) -> bool {
        if inner.state != SessionState::AwaitingTurnActions
            || !inner.ready
            || inner.turn_ended
            || !inner.all_moved()
        {
            debug!(
                session = %self.name,
                state = ?inner.state,
                ready = inner.ready,
                "end of turn skipped"
            );
            return false;
        }

        if self.rules.scan_near_own_ship {
            let radius = self.rules.scan_distance;
            let defaults: Vec<(SlotId, BTreeSet<Coordinate>)> = inner
                .players
                .iter()
                .filter(|(_, p)| p.scan_hits.is_none())
                .filter_map(|(slot, p)| {
                    p.position
                        .map(|pos| (*slot, inner.scan_around(&p.username, pos, radius)))
                })
                .collect();
            for (slot, hits) in defaults {
                if let Some(player) = inner.players.get_mut(&slot) {
                    player.scan_hits = Some(hits);
                }
            }
        }

        for player in inner.players.values_mut() {
            let scan_hits = player
                .scan_hits
                .take()
                .unwrap_or_default()
                .into_iter()
                .collect();
            let message = ServerMessage::EndOfTurn {
                hit: player.hit_this_turn,
                scan_hits,
            };
            player.hit_this_turn = false;
            dispatch.push(player, message);
        }
        inner.ready = true;
        inner.turn_ended = true;
        debug!(session = %self.name, turn = inner.turn, "turn ended");
        true
    }

    /// Re-check the gate after a departure so a phase waiting only on the
    /// leaver completes instead of stalling.
    fn after_departure_locked(&self, inner: &mut SessionInner, dispatch: &mut Dispatch) {
        if inner.ready || inner.players.is_empty() {
            return;
        }
        match inner.state {
            SessionState::AwaitingStartLocations if inner.announced && inner.all_positioned() => {
                inner.ready = true;
                self.start_of_turn_locked(inner, dispatch);
            }
            SessionState::AwaitingTurnActions if inner.all_moved() => {
                inner.ready = true;
                if self.end_of_turn_locked(inner, dispatch) {
                    self.start_of_turn_locked(inner, dispatch);
                }
            }
            _ => {}
        }
    }
}
