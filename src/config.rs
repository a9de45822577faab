#![allow(dead_code)]
/// Process-wide tunables. Mirrors the spec's defaults exactly.
use std::env;

pub const DEFAULT_PORT: u16 = 3000;

/// Initial cash endowment given to every player on join.
pub const INITIAL_CASH: f64 = 10_000.0;

/// Default Stage-1 (spread quoting) timer, milliseconds.
pub const DEFAULT_SPREAD_TIMER_MS: u64 = 60_000;
/// Default Stage-4 (open trading) timer, milliseconds.
pub const DEFAULT_OPEN_TRADING_TIMER_MS: u64 = 120_000;
/// Rolling no-tighter-submission window during Stage 1, milliseconds.
pub const DEFAULT_NO_TIGHTER_WINDOW_MS: u64 = 10_000;

/// `gm:set_timer` clamp bounds, seconds.
pub const MIN_TIMER_SECONDS: u64 = 1;
pub const MAX_TIMER_SECONDS: u64 = 3_600;

/// Announcements ring buffer capacity.
pub const MAX_ANNOUNCEMENTS: usize = 50;

/// Game-code alphabet: uppercase letters and digits, excluding look-alikes
/// `I`, `O`, `0`, `1`.
pub const GAME_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
pub const GAME_CODE_LENGTH: usize = 6;

/// Tolerance used when comparing a market-maker quote's width to the
/// accepted spread (spec: "within ≤ 1e-6").
pub const SPREAD_EPSILON: f64 = 1e-6;

/// Reads `PORT` from the environment, falling back to [`DEFAULT_PORT`].
pub fn port() -> u16 {
    env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_PORT)
}

/// Reads `CORS_ORIGIN` as a comma-separated allowlist. `None` means "allow all".
pub fn cors_origins() -> Option<Vec<String>> {
    let raw = env::var("CORS_ORIGIN").ok()?;
    Some(
        raw.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
    )
}

pub fn origin_allowed(origins: &Option<Vec<String>>, origin: Option<&str>) -> bool {
    match origins {
        None => true,
        Some(list) => match origin {
            Some(o) => list.iter().any(|allowed| allowed == o),
            None => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_allowlist_rejects_everything() {
        let origins = Some(vec![]);
        assert!(!origin_allowed(&origins, Some("http://evil.example")));
    }

    #[test]
    fn no_allowlist_allows_everything() {
        assert!(origin_allowed(&None, None));
        assert!(origin_allowed(&None, Some("http://anything")));
    }

    #[test]
    fn allowlist_matches_exact_origin() {
        let origins = Some(vec!["http://localhost:5173".to_string()]);
        assert!(origin_allowed(&origins, Some("http://localhost:5173")));
        assert!(!origin_allowed(&origins, Some("http://localhost:9999")));
    }
}
