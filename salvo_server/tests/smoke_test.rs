// Integration smoke test for the salvo server.
//
// Starts a server on localhost and drives it with plain TCP sockets speaking
// the line protocol directly: welcome, login, session choice, start
// locations, turns, game over, heartbeats, idle timeout, admin shutdown.
//
// Each client is a bare socket using the protocol crate's framing, so these
// tests pin the exact wire lines the server emits.

use std::io::{BufReader, BufWriter};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use salvo_protocol::{read_line, write_line};
use salvo_server::{GameRules, ServerConfig, ServerHandle, start_server};

struct RawClient {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl RawClient {
    /// Connect and consume the `W` greeting.
    fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut client = Self {
            reader: BufReader::new(stream.try_clone().unwrap()),
            writer: BufWriter::new(stream),
        };
        let welcome = client.recv();
        assert!(welcome.starts_with('W'), "expected welcome, got {welcome:?}");
        client
    }

    fn send(&mut self, line: &str) {
        write_line(&mut self.writer, line).unwrap();
    }

    fn recv(&mut self) -> String {
        read_line(&mut self.reader)
            .unwrap()
            .expect("server closed the connection")
    }

    /// Send `line` and expect `reply` as the very next line.
    fn exchange(&mut self, line: &str, reply: &str) {
        self.send(line);
        assert_eq!(self.recv(), reply, "reply to {line:?}");
    }

    /// The server has closed the connection (EOF or reset).
    fn expect_closed(&mut self) {
        match read_line(&mut self.reader) {
            Ok(None) | Err(_) => {}
            Ok(Some(line)) => panic!("expected close, got {line:?}"),
        }
    }
}

fn test_config(players: usize) -> ServerConfig {
    ServerConfig {
        bind_address: "127.0.0.1".into(),
        port: 0,
        rules: GameRules {
            players,
            ..GameRules::default()
        },
        ..ServerConfig::default()
    }
}

fn start(config: ServerConfig) -> (ServerHandle, SocketAddr) {
    let (handle, addr) = start_server(config).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    (handle, addr)
}

#[test]
fn two_player_game_to_a_win() {
    let (handle, addr) = start(test_config(2));

    let mut alice = RawClient::connect(addr);
    alice.exchange("Lalice", "A");
    alice.exchange("CArena", "N1");

    let mut bob = RawClient::connect(addr);
    bob.exchange("Lbob", "AArena");
    bob.exchange("CArena", "N0");
    assert_eq!(bob.recv(), "Balice");
    assert_eq!(alice.recv(), "Bbob");

    alice.send("S00");
    bob.send("S99");
    assert_eq!(alice.recv(), "T1");
    assert_eq!(bob.recv(), "T1");

    // Turn 1: alice hits bob; bob scans empty water.
    alice.send("F99");
    bob.send("P55");
    assert_eq!(alice.recv(), "E10");
    assert_eq!(bob.recv(), "E10");
    assert_eq!(alice.recv(), "T1");
    assert_eq!(bob.recv(), "T0");

    // Turn 2: the second hit sinks bob.
    alice.send("F99");
    bob.send("P55");
    assert_eq!(alice.recv(), "E10");
    assert_eq!(bob.recv(), "E10");
    assert_eq!(alice.recv(), "O1");
    assert_eq!(bob.recv(), "O0");
    alice.expect_closed();
    bob.expect_closed();

    handle.stop();
}

#[test]
fn scan_reports_sorted_cells() {
    let (handle, addr) = start(test_config(3));

    let mut a = RawClient::connect(addr);
    a.exchange("La", "A");
    a.exchange("CReef", "N1");
    let mut b = RawClient::connect(addr);
    b.exchange("Lb", "AReef");
    b.exchange("CReef", "N0");
    let mut c = RawClient::connect(addr);
    c.exchange("Lc", "AReef");
    c.exchange("CReef", "N0");
    assert_eq!(c.recv(), "Ba:b");
    assert_eq!(a.recv(), "Bb:c");
    assert_eq!(b.recv(), "Ba:c");

    a.send("S00");
    b.send("S11");
    c.send("S88");
    for client in [&mut a, &mut b, &mut c] {
        assert_eq!(client.recv(), "T1");
    }

    // a scans around c; its own-ship sweep also finds b.
    a.send("P99");
    b.send("F55");
    c.send("F44");
    assert_eq!(a.recv(), "E021188");
    // Default sweeps: b sees a next door, c sees nobody.
    assert_eq!(b.recv(), "E0100");
    assert_eq!(c.recv(), "E00");

    handle.stop();
}

#[test]
fn duplicate_login_is_rejected() {
    let (handle, addr) = start(test_config(2));

    let mut first = RawClient::connect(addr);
    first.exchange("Lalice", "A");

    let mut second = RawClient::connect(addr);
    second.exchange("Lalice", "X1");
    second.exchange("L", "X1");
    second.exchange("Lbad:name", "X1");
    // Still unauthenticated; a fresh name works.
    second.exchange("Lbob", "A");

    assert!(handle.context().is_username_taken("alice"));
    assert!(handle.context().is_username_taken("bob"));
    handle.stop();
}

#[test]
fn session_list_reaches_choosing_players() {
    let (handle, addr) = start(test_config(2));

    let mut watcher = RawClient::connect(addr);
    watcher.exchange("Lwatcher", "A");

    let mut host = RawClient::connect(addr);
    host.exchange("Lhost", "A");
    host.exchange("CHarbor", "N1");
    assert_eq!(watcher.recv(), "AHarbor");

    host.send("Q");
    host.expect_closed();
    assert_eq!(watcher.recv(), "A");

    handle.stop();
}

#[test]
fn malformed_and_out_of_phase_lines_are_ignored() {
    let (handle, addr) = start(test_config(2));

    let mut client = RawClient::connect(addr);
    client.send("S5");
    client.send("M5");
    client.send("Zzz");
    client.send("F12");
    client.exchange("Hping", "Hping");
    client.exchange("Lalice", "A");
    client.exchange("C", "N2");

    handle.stop();
}

#[test]
fn silent_connection_is_challenged_then_closed() {
    let config = ServerConfig {
        connection_timeout_ms: 600,
        heartbeat_window_ms: 400,
        sweep_interval_ms: 50,
        ..test_config(2)
    };
    let (handle, addr) = start(config);

    let mut idle = RawClient::connect(addr);
    idle.exchange("Lsleepy", "A");

    let started = Instant::now();
    let challenge = idle.recv();
    assert!(challenge.starts_with("Hsleepy"), "got {challenge:?}");
    loop {
        match read_line(&mut idle.reader) {
            Ok(Some(line)) => assert!(line.starts_with('H'), "got {line:?}"),
            Ok(None) | Err(_) => break,
        }
    }
    assert!(started.elapsed() < Duration::from_secs(5));

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(handle.context().connection_count(), 0);
    assert!(!handle.context().is_username_taken("sleepy"));
    handle.stop();
}

#[test]
fn answered_challenges_keep_connection_open() {
    let config = ServerConfig {
        connection_timeout_ms: 600,
        heartbeat_window_ms: 400,
        sweep_interval_ms: 50,
        ..test_config(2)
    };
    let (handle, addr) = start(config);

    let mut client = RawClient::connect(addr);
    client.exchange("Lawake", "A");

    let until = Instant::now() + Duration::from_millis(1500);
    while Instant::now() < until {
        let line = client.recv();
        assert!(line.starts_with('H'), "got {line:?}");
        // Answering resets the idle timer; the answer itself is not echoed.
        client.send(&line);
    }
    assert_eq!(handle.context().connection_count(), 1);
    handle.stop();
}

#[test]
fn admin_console_shuts_the_server_down() {
    let (handle, addr) = start(test_config(2));

    let mut admin = RawClient::connect(addr);
    admin.send("Ladmin$");
    admin.send("Shutdown");
    admin.expect_closed();

    // Returns once the accept loop has exited.
    handle.wait();
}
