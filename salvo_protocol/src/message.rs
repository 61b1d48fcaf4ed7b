// Protocol messages for client-server communication.
//
// Every line on the wire is `<1-char tag><payload>`. Two closed enums cover
// the whole vocabulary:
// - `ClientMessage`: sent by players to the server.
// - `ServerMessage`: sent by the server to players.
//
// Lines are parsed once at the transport boundary (`parse`) and rendered once
// on the way out (`encode`); nothing past this module inspects tag characters.
// Name lists (session list, opponents, welcome text) are `:`-separated, so
// names themselves must never contain `:`. The server enforces that at login
// and session creation.

use thiserror::Error;

use crate::types::{Coordinate, Direction};

/// Separator for list payloads.
pub const LIST_SEPARATOR: char = ':';

/// Why an inbound line could not be turned into a message.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty line")]
    Empty,
    #[error("unknown tag {0:?}")]
    UnknownTag(char),
    #[error("invalid coordinate payload {0:?}")]
    InvalidCoordinate(String),
    #[error("invalid direction payload {0:?}")]
    InvalidDirection(String),
    #[error("invalid payload for tag {tag:?}: {payload:?}")]
    InvalidPayload { tag: char, payload: String },
}

/// Messages sent by a player to the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientMessage {
    /// `L<name>`: claim a username.
    Login { username: String },
    /// `C<name>`: join the named open session, or create it.
    Connect { session: String },
    /// `S<xy>`: choose a starting cell.
    StartLocation(Coordinate),
    /// `F<xy>`: fire at a cell.
    Fire(Coordinate),
    /// `M<d>`: move one step in a keypad direction.
    Move(Direction),
    /// `P<xy>`: scan around a cell.
    Scan(Coordinate),
    /// `H<payload>`: either an answer to a server challenge or a liveness
    /// probe the server should echo.
    Heartbeat { payload: String },
    /// `Q`: leave.
    Quit,
}

impl ClientMessage {
    /// Parse one line (without its trailing newline).
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let (tag, payload) = split_tag(line)?;
        match tag {
            'L' => Ok(Self::Login {
                username: payload.trim().to_string(),
            }),
            'C' => Ok(Self::Connect {
                session: payload.trim().to_string(),
            }),
            'S' => parse_coordinate(payload).map(Self::StartLocation),
            'F' => parse_coordinate(payload).map(Self::Fire),
            'P' => parse_coordinate(payload).map(Self::Scan),
            'M' => parse_direction(payload).map(Self::Move),
            'H' => Ok(Self::Heartbeat {
                payload: payload.to_string(),
            }),
            'Q' => Ok(Self::Quit),
            other => Err(ParseError::UnknownTag(other)),
        }
    }

    /// Render as a wire line (no trailing newline).
    pub fn encode(&self) -> String {
        match self {
            Self::Login { username } => format!("L{username}"),
            Self::Connect { session } => format!("C{session}"),
            Self::StartLocation(c) => format!("S{c}"),
            Self::Fire(c) => format!("F{c}"),
            Self::Move(d) => format!("M{}", d.digit()),
            Self::Scan(c) => format!("P{c}"),
            Self::Heartbeat { payload } => format!("H{payload}"),
            Self::Quit => "Q".to_string(),
        }
    }
}

/// Messages sent by the server to a player.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerMessage {
    /// `W<line:line:...>`: greeting with the server's rules.
    Welcome { lines: Vec<String> },
    /// `N0`: joined an existing session.
    Joined,
    /// `N1`: created a new session.
    Created,
    /// `N2`: could not join or create that session.
    JoinRejected,
    /// `A<name:name:...>`: sessions still waiting for players.
    SessionList { names: Vec<String> },
    /// `B<name:name:...>`: the session is full; these are your opponents.
    StartOfGame { opponents: Vec<String> },
    /// `T<hp>`: a new turn begins; your remaining hit points.
    StartOfTurn { hit_points: i32 },
    /// `E<hit><count><xy...>`: turn result. `hit` is set when the player
    /// landed or took a hit; `scan_hits` are sorted ascending.
    EndOfTurn {
        hit: bool,
        scan_hits: Vec<Coordinate>,
    },
    /// `O0` / `O1`: you lost / you won.
    GameOver { won: bool },
    /// `H<payload>`: heartbeat challenge or echo.
    Heartbeat { payload: String },
    /// `X1`: username rejected.
    LoginRejected,
}

impl ServerMessage {
    /// Render as a wire line (no trailing newline).
    pub fn encode(&self) -> String {
        match self {
            Self::Welcome { lines } => format!("W{}", join_list(lines)),
            Self::Joined => "N0".to_string(),
            Self::Created => "N1".to_string(),
            Self::JoinRejected => "N2".to_string(),
            Self::SessionList { names } => format!("A{}", join_list(names)),
            Self::StartOfGame { opponents } => format!("B{}", join_list(opponents)),
            Self::StartOfTurn { hit_points } => format!("T{hit_points}"),
            Self::EndOfTurn { hit, scan_hits } => {
                let mut line = format!("E{}{}", u8::from(*hit), scan_hits.len());
                for cell in scan_hits {
                    line.push_str(&cell.to_string());
                }
                line
            }
            Self::GameOver { won } => format!("O{}", u8::from(*won)),
            Self::Heartbeat { payload } => format!("H{payload}"),
            Self::LoginRejected => "X1".to_string(),
        }
    }

    /// Parse one line (without its trailing newline). Used by clients.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let (tag, payload) = split_tag(line)?;
        let invalid = || ParseError::InvalidPayload {
            tag,
            payload: payload.to_string(),
        };
        match tag {
            'W' => Ok(Self::Welcome {
                lines: split_list(payload),
            }),
            'N' => match payload {
                "0" => Ok(Self::Joined),
                "1" => Ok(Self::Created),
                "2" => Ok(Self::JoinRejected),
                _ => Err(invalid()),
            },
            'A' => Ok(Self::SessionList {
                names: split_list(payload),
            }),
            'B' => Ok(Self::StartOfGame {
                opponents: split_list(payload),
            }),
            'T' => payload
                .parse()
                .map(|hit_points| Self::StartOfTurn { hit_points })
                .map_err(|_| invalid()),
            'E' => parse_end_of_turn(payload).ok_or_else(invalid),
            'O' => match payload {
                "0" => Ok(Self::GameOver { won: false }),
                "1" => Ok(Self::GameOver { won: true }),
                _ => Err(invalid()),
            },
            'H' => Ok(Self::Heartbeat {
                payload: payload.to_string(),
            }),
            'X' => Ok(Self::LoginRejected),
            other => Err(ParseError::UnknownTag(other)),
        }
    }
}

fn split_tag(line: &str) -> Result<(char, &str), ParseError> {
    let mut chars = line.chars();
    let tag = chars.next().ok_or(ParseError::Empty)?;
    Ok((tag, chars.as_str()))
}

/// Exactly two decimal digits, nothing around them.
fn parse_coordinate(payload: &str) -> Result<Coordinate, ParseError> {
    Coordinate::from_digits(payload)
        .ok_or_else(|| ParseError::InvalidCoordinate(payload.to_string()))
}

/// Exactly one keypad digit.
fn parse_direction(payload: &str) -> Result<Direction, ParseError> {
    let mut chars = payload.chars();
    let direction = match (chars.next(), chars.next()) {
        (Some(c), None) => c
            .to_digit(10)
            .and_then(|d| Direction::from_digit(d as u8)),
        _ => None,
    };
    direction.ok_or_else(|| ParseError::InvalidDirection(payload.to_string()))
}

fn parse_end_of_turn(payload: &str) -> Option<ServerMessage> {
    let digits: Vec<u8> = payload
        .chars()
        .map(|c| c.to_digit(10).map(|d| d as u8))
        .collect::<Option<_>>()?;
    let (&hit, rest) = digits.split_first()?;
    let (&count, cells) = rest.split_first()?;
    if hit > 1 || cells.len() != usize::from(count) * 2 {
        return None;
    }
    let scan_hits = cells
        .chunks_exact(2)
        .map(|pair| Coordinate::new(pair[0], pair[1]))
        .collect::<Option<Vec<_>>>()?;
    Some(ServerMessage::EndOfTurn {
        hit: hit == 1,
        scan_hits,
    })
}

fn join_list(items: &[String]) -> String {
    items.join(&LIST_SEPARATOR.to_string())
}

fn split_list(payload: &str) -> Vec<String> {
    if payload.is_empty() {
        return Vec::new();
    }
    payload.split(LIST_SEPARATOR).map(str::to_string).collect()
}
