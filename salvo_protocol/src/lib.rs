// salvo_protocol — wire protocol shared by the salvo server and its clients.
//
// The protocol is newline-delimited text. Each line is a one-character tag
// followed by a payload; coordinates travel as two decimal digits and lists as
// `:`-separated names. This crate owns that vocabulary so neither side
// inspects raw characters past the transport boundary.
//
// Module overview:
// - `types.rs`:    Board types: `Coordinate` (ordered (x, y) cell on the
//                  10x10 board) and `Direction` (keypad movement).
// - `message.rs`:  `ClientMessage` / `ServerMessage` closed enums with
//                  `parse` / `encode`, plus `ParseError`.
// - `framing.rs`:  Line framing over any `BufRead` / `Write` with a bounded
//                  line length.
//
// No dependency on the server crate, no async runtime. Framing works with
// blocking `TcpStream`s and in-memory buffers alike.

pub mod framing;
pub mod message;
pub mod types;

pub use framing::{MAX_LINE_LENGTH, read_line, write_line};
pub use message::{ClientMessage, LIST_SEPARATOR, ParseError, ServerMessage};
pub use types::{BOARD_MAX, BOARD_MIN, Coordinate, Direction};

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    /// Encode a ClientMessage, frame it, read the line back, parse it.
    fn client_roundtrip(msg: &ClientMessage) {
        let mut wire = Vec::new();
        write_line(&mut wire, &msg.encode()).unwrap();

        let mut cursor = Cursor::new(&wire);
        let line = read_line(&mut cursor).unwrap().unwrap();
        assert_eq!(&ClientMessage::parse(&line).unwrap(), msg);
    }

    /// Encode a ServerMessage, frame it, read the line back, parse it.
    fn server_roundtrip(msg: &ServerMessage) {
        let mut wire = Vec::new();
        write_line(&mut wire, &msg.encode()).unwrap();

        let mut cursor = Cursor::new(&wire);
        let line = read_line(&mut cursor).unwrap().unwrap();
        assert_eq!(&ServerMessage::parse(&line).unwrap(), msg);
    }

    #[test]
    fn turn_actions_survive_the_wire() {
        client_roundtrip(&ClientMessage::Move(Direction::DownLeft));
        client_roundtrip(&ClientMessage::Fire(Coordinate { x: 0, y: 9 }));
        client_roundtrip(&ClientMessage::Heartbeat {
            payload: "carol1700000000123".into(),
        });
    }

    #[test]
    fn end_of_turn_survives_the_wire() {
        server_roundtrip(&ServerMessage::EndOfTurn {
            hit: false,
            scan_hits: vec![Coordinate { x: 0, y: 0 }, Coordinate { x: 3, y: 1 }],
        });
        server_roundtrip(&ServerMessage::Welcome {
            lines: vec!["Welcome".into(), "Server rules>".into()],
        });
    }
}
