/// Crate-wide error taxonomy. Kinds, not type names — see spec §7.
///
/// Business logic returns `Result<T, GameError>`; the gateway translates a
/// non-ok result into a targeted `game:error` emission. No variant here ever
/// causes a panic: malformed input is always a value, never a crash.
#[derive(Debug, Clone, PartialEq)]
pub enum GameError {
    /// Malformed input, non-positive price/quantity, a spread that isn't
    /// strictly tighter, a quote width mismatch, a GM acting as trader.
    Validation(String),
    /// A GM-only operation attempted by a non-GM (normally caught silently
    /// at the gateway before reaching business logic; this variant covers
    /// the rare case business logic itself must refuse on identity grounds).
    Authorization(String),
    /// A legal-shaped operation refused by a business rule (e.g. `stop`
    /// while markets are complete but P&L isn't finalized).
    BusinessRefusal(String),
    /// Reference to a game, player, order or market that doesn't exist.
    NotFound(String),
    /// A named but intentionally unimplemented operation (`order:cancel`
    /// on the public protocol).
    Unimplemented(String),
}

impl GameError {
    pub fn message(&self) -> &str {
        match self {
            GameError::Validation(m)
            | GameError::Authorization(m)
            | GameError::BusinessRefusal(m)
            | GameError::NotFound(m)
            | GameError::Unimplemented(m) => m,
        }
    }
}

impl std::fmt::Display for GameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for GameError {}

pub type GameResult<T> = Result<T, GameError>;
