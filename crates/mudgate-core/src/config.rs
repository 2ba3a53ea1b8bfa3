//! Per-session configuration and its published limits.
//!
//! Every value that crosses the proxy boundary (handshake query parameters,
//! `updateConfig` control messages) is clamped into range here; out-of-range
//! values are clamped silently and non-numeric values fall back to defaults,
//! never rejected.

use serde::{Deserialize, Serialize};

/// Longest a session may persist without a client: 12 hours.
pub const MAX_PERSISTENCE_TIMEOUT_MS: u64 = 43_200_000;

/// Fewest buffered lines a session may be configured for.
pub const MIN_BUFFER_LINES: usize = 10;

/// Most buffered lines a session may be configured for.
pub const MAX_BUFFER_LINES: usize = 10_000;

/// Hard cap on buffered bytes per session (not configurable).
pub const MAX_BUFFER_BYTES: usize = 10 * 1024 * 1024;

/// Default persistence timeout: 5 minutes.
pub const DEFAULT_PERSISTENCE_TIMEOUT_MS: u64 = 300_000;

/// Default buffered-line limit.
pub const DEFAULT_MAX_BUFFER_LINES: usize = 1_000;

/// Per-session tunables, carried on the wire in `session` and
/// `configUpdated` control messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How long the session survives an involuntary client disconnect, in
    /// milliseconds. Zero disables persistence entirely.
    #[serde(rename = "persistenceTimeout")]
    pub persistence_timeout_ms: u64,
    /// Maximum number of buffered messages held while the client is absent.
    #[serde(rename = "maxBufferLines")]
    pub max_buffer_lines: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            persistence_timeout_ms: DEFAULT_PERSISTENCE_TIMEOUT_MS,
            max_buffer_lines: DEFAULT_MAX_BUFFER_LINES,
        }
    }
}

impl SessionConfig {
    /// Build a config from raw ingress values, falling back to `defaults`
    /// where a value is absent and clamping where it is out of range.
    pub fn from_raw(
        persistence_timeout_ms: Option<i64>,
        max_buffer_lines: Option<i64>,
        defaults: SessionConfig,
    ) -> Self {
        Self {
            persistence_timeout_ms: persistence_timeout_ms
                .map(clamp_timeout)
                .unwrap_or(defaults.persistence_timeout_ms),
            max_buffer_lines: max_buffer_lines
                .map(clamp_lines)
                .unwrap_or(defaults.max_buffer_lines),
        }
    }

    /// Apply an `updateConfig` request: keys present are clamped and
    /// replace the current values, keys absent are left untouched.
    pub fn apply_update(
        &mut self,
        persistence_timeout_ms: Option<i64>,
        max_buffer_lines: Option<i64>,
    ) {
        if let Some(t) = persistence_timeout_ms {
            self.persistence_timeout_ms = clamp_timeout(t);
        }
        if let Some(n) = max_buffer_lines {
            self.max_buffer_lines = clamp_lines(n);
        }
    }
}

fn clamp_timeout(ms: i64) -> u64 {
    ms.clamp(0, MAX_PERSISTENCE_TIMEOUT_MS as i64) as u64
}

fn clamp_lines(n: i64) -> usize {
    n.clamp(MIN_BUFFER_LINES as i64, MAX_BUFFER_LINES as i64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_absent() {
        let cfg = SessionConfig::from_raw(None, None, SessionConfig::default());
        assert_eq!(cfg.persistence_timeout_ms, DEFAULT_PERSISTENCE_TIMEOUT_MS);
        assert_eq!(cfg.max_buffer_lines, DEFAULT_MAX_BUFFER_LINES);
    }

    #[test]
    fn clamps_out_of_range() {
        let cfg = SessionConfig::from_raw(Some(-5), Some(3), SessionConfig::default());
        assert_eq!(cfg.persistence_timeout_ms, 0);
        assert_eq!(cfg.max_buffer_lines, MIN_BUFFER_LINES);

        let cfg = SessionConfig::from_raw(
            Some(i64::MAX),
            Some(1_000_000),
            SessionConfig::default(),
        );
        assert_eq!(cfg.persistence_timeout_ms, MAX_PERSISTENCE_TIMEOUT_MS);
        assert_eq!(cfg.max_buffer_lines, MAX_BUFFER_LINES);
    }

    #[test]
    fn in_range_passes_through() {
        let cfg = SessionConfig::from_raw(Some(60_000), Some(500), SessionConfig::default());
        assert_eq!(cfg.persistence_timeout_ms, 60_000);
        assert_eq!(cfg.max_buffer_lines, 500);
    }

    #[test]
    fn update_leaves_absent_keys() {
        let mut cfg = SessionConfig::default();
        cfg.apply_update(Some(0), None);
        assert_eq!(cfg.persistence_timeout_ms, 0);
        assert_eq!(cfg.max_buffer_lines, DEFAULT_MAX_BUFFER_LINES);
    }

    #[test]
    fn wire_field_names() {
        let json = serde_json::to_value(SessionConfig::default()).unwrap();
        assert_eq!(json["persistenceTimeout"], 300_000);
        assert_eq!(json["maxBufferLines"], 1_000);
    }
}
