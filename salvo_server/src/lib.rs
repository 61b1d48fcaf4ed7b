// salvo_server — turn-based multiplayer salvo game server.
//
// Players connect over TCP, log in, and join named sessions. Once a session
// reaches its headcount, every player picks a starting cell, and the game
// proceeds in synchronized turns: each survivor moves, fires, or scans once,
// and the turn resolves only when all of them have acted. Ships hit below
// zero hit points are eliminated; the last one afloat wins.
//
// Module overview:
// - `config.rs`:      `ServerConfig` and per-session `GameRules` (serde/JSON,
//                     defaults, normalization, welcome text).
// - `error.rs`:       `ServerError` (bootstrap) and `SessionError` (actions a
//                     session refused).
// - `session.rs`:     `GameSession`, the turn engine. Every operation runs
//                     under the session lock and returns a `Dispatch` of
//                     outbound lines, delivered after the lock is released.
// - `registry.rs`:    `ServerContext`, the shared registries: open/active
//                     sessions, usernames, live connections, shutdown flag.
// - `connection.rs`:  `ConnectionLink` (shared per-connection state) and
//                     `ConnectionHandler` (read loop + phase machine).
// - `server.rs`:      Listener, accept loop with the idle sweeper, and the
//                     `ServerHandle` returned by `start_server`.
// - `client.rs`:      `NetClient`, a line client with a background reader
//                     thread, used by integration tests.
//
// Dependencies: `salvo_protocol` for the wire format; `parking_lot` locks;
// `tracing` for logs; `serde`/`serde_json` for config; `thiserror` for error
// types. Plain `std::net` threads, no async runtime.

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod registry;
pub mod server;
pub mod session;

pub use config::{GameRules, ServerConfig};
pub use error::{ServerError, SessionError};
pub use server::{ServerHandle, start_server};
