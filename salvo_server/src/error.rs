// Error types for the salvo server.
//
// `ServerError` covers bootstrap failures. Binding the listener (or failing
// to start the accept thread) is the only failure that stops the process;
// everything else a connection can hit is handled locally by that
// connection's handler.
//
// `SessionError` is returned by `GameSession` operations that a player asked
// for but the session cannot honor in its current state. Handlers log these
// and drop the offending message; the client is expected to resend.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::session::SessionState;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("failed to read config {}: {source}", path.display())]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid config: {0}")]
    ConfigFormat(#[from] serde_json::Error),
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session is full")]
    Full,
    #[error("player {0} is already in this session")]
    DuplicatePlayer(String),
    #[error("player {0} is not in this session")]
    UnknownPlayer(String),
    #[error("start of game has not been announced yet")]
    NotAnnounced,
    #[error("session does not accept {action} while {state:?}")]
    WrongState {
        action: &'static str,
        state: SessionState,
    },
    #[error("player {0} already acted this turn")]
    AlreadyActed(String),
    #[error("player {0} has no position yet")]
    NoPosition(String),
}
