use crate::ids::{GameCode, PlayerId};

/// Per-connection key/value bag. Populated by `game:join`/`gm:create`,
/// cleared on `game:leave` or disconnect.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub player_id: Option<PlayerId>,
    pub game_code: Option<GameCode>,
    pub display_name: Option<String>,
    pub is_gamemaster: bool,
}

impl Session {
    pub fn identity(&self) -> Option<(PlayerId, GameCode)> {
        match (&self.player_id, &self.game_code) {
            (Some(p), Some(c)) => Some((p.clone(), c.clone())),
            _ => None,
        }
    }
}
