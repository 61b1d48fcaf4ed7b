// Server configuration and default session rules.
//
// `ServerConfig` carries everything the bootstrap needs: listen address, idle
// supervision timings, the reserved admin username, and the `GameRules` every
// new session is created with. Both structs are serde types with
// `#[serde(default)]`, so a JSON config file only needs the keys it wants to
// override. Command-line flags in `main.rs` are applied on top.
//
// Rule values are normalized once (`GameRules::normalized`) before a session
// sees them: headcount outside 2..=8 falls back to 2 and starting hit points
// are capped at one digit, since `T<hp>` carries a single digit.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ServerError;

/// Per-session game rules, fixed when a session is created.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GameRules {
    /// Players required before a session starts.
    pub players: usize,
    /// Hits a ship can absorb before the next one eliminates it. A ship is
    /// out once its hit points drop below zero.
    pub starting_hit_points: i32,
    /// Hit points removed per landed shot.
    pub damage_per_hit: i32,
    /// Chebyshev radius of a scan.
    pub scan_distance: u8,
    /// Every scan (and every turn without a scan) also sweeps around the
    /// player's own ship.
    pub scan_near_own_ship: bool,
}

impl GameRules {
    pub const MIN_PLAYERS: usize = 2;
    pub const MAX_PLAYERS: usize = 8;
    pub const MAX_HIT_POINTS: i32 = 9;

    /// Clamp values into the ranges the protocol can express.
    pub fn normalized(mut self) -> Self {
        if !(Self::MIN_PLAYERS..=Self::MAX_PLAYERS).contains(&self.players) {
            self.players = Self::MIN_PLAYERS;
        }
        self.starting_hit_points = self.starting_hit_points.clamp(0, Self::MAX_HIT_POINTS);
        self.damage_per_hit = self.damage_per_hit.max(0);
        self
    }

    /// Human-readable rule summary sent in the `W` greeting.
    pub fn welcome_lines(&self) -> Vec<String> {
        let mut lines = vec![
            "Welcome to the salvo server".to_string(),
            "Server rules>".to_string(),
            format!(
                "  Players start with {} hit points.",
                self.starting_hit_points + 1
            ),
            format!("  Games require {} players to start.", self.players),
        ];
        if self.scan_near_own_ship {
            lines.push("  You always scan your current location.".to_string());
        }
        lines.push("  Chance to hit is 100%".to_string());
        lines.push(format!(
            "  Each hit does {} hit point of damage.",
            self.damage_per_hit
        ));
        lines
    }
}

impl Default for GameRules {
    fn default() -> Self {
        Self {
            players: 4,
            starting_hit_points: 1,
            damage_per_hit: 1,
            scan_distance: 1,
            scan_near_own_ship: true,
        }
    }
}

/// Process-wide server settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub rules: GameRules,
    /// Silence longer than this gets a connection force-closed.
    pub connection_timeout_ms: u64,
    /// Heartbeat challenges start once less than this much time remains.
    pub heartbeat_window_ms: u64,
    /// How often the accept loop runs the idle sweeper.
    pub sweep_interval_ms: u64,
    /// Logging in with this name opens the admin console instead of playing.
    pub admin_username: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".into(),
            port: 9001,
            rules: GameRules::default(),
            connection_timeout_ms: 30_000,
            heartbeat_window_ms: 10_000,
            sweep_interval_ms: 2_000,
            admin_username: "admin$".into(),
        }
    }
}

impl ServerConfig {
    /// Load a config from a JSON file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self, ServerError> {
        let text = std::fs::read_to_string(path).map_err(|source| ServerError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Parse a config from JSON text.
    pub fn from_json(text: &str) -> Result<Self, ServerError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn heartbeat_window(&self) -> Duration {
        Duration::from_millis(self.heartbeat_window_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// `host:port` string for binding the listener.
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config =
            ServerConfig::from_json(r#"{"port": 7000, "rules": {"players": 3}}"#).unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.rules.players, 3);
        assert_eq!(config.rules.starting_hit_points, 1);
        assert_eq!(config.connection_timeout_ms, 30_000);
        assert_eq!(config.admin_username, "admin$");
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let err = ServerConfig::from_json("{port: nope").unwrap_err();
        assert!(matches!(err, ServerError::ConfigFormat(_)));
    }

    #[test]
    fn normalized_clamps_out_of_range_rules() {
        let rules = GameRules {
            players: 12,
            starting_hit_points: 40,
            damage_per_hit: -3,
            ..GameRules::default()
        }
        .normalized();
        assert_eq!(rules.players, 2);
        assert_eq!(rules.starting_hit_points, 9);
        assert_eq!(rules.damage_per_hit, 0);

        let single = GameRules {
            players: 1,
            ..GameRules::default()
        }
        .normalized();
        assert_eq!(single.players, 2);
    }

    #[test]
    fn welcome_mentions_scan_rule_only_when_enabled() {
        let with_scan = GameRules::default().welcome_lines();
        assert!(with_scan.iter().any(|l| l.contains("always scan")));
        assert!(with_scan.iter().any(|l| l.contains("start with 2 hit points")));

        let without = GameRules {
            scan_near_own_ship: false,
            ..GameRules::default()
        }
        .welcome_lines();
        assert!(!without.iter().any(|l| l.contains("always scan")));
        assert!(without.iter().all(|l| !l.contains(':')));
    }
}
