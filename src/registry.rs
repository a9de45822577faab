//! Multi-game registry: issues collision-free game codes, holds every live
//! [`GameInstance`](crate::game::GameInstance), and tracks which game each
//! player belongs to.
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::{GameError, GameResult};
use crate::game::{GameConfig, GameInstance};
use crate::ids::{GameCode, PlayerId};

/// Bounds the collision-avoidance retry loop; at the configured alphabet and
/// length this would only be exhausted by a pathological number of live
/// games sharing the process.
const MAX_CODE_ATTEMPTS: usize = 64;

pub type SharedGame = Arc<Mutex<GameInstance>>;

#[derive(Default)]
struct Inner {
    games: HashMap<GameCode, SharedGame>,
    player_games: HashMap<PlayerId, GameCode>,
}

/// Holds one lock over both indices rather than two separately-locked maps:
/// membership changes (join/leave) always touch both together, so splitting
/// the locks would just invite them drifting out of sync under concurrent
/// access.
pub struct GameRegistry {
    inner: RwLock<Inner>,
}

impl GameRegistry {
    pub fn new() -> Self {
        Self { inner: RwLock::new(Inner::default()) }
    }

    pub fn create_game(&self, gamemaster_secret: String, now_ms: i64) -> (GameCode, SharedGame) {
        self.create_game_with_config(GameConfig::new(gamemaster_secret), now_ms)
            .expect("code space exhaustion is not exercised outside stress tests")
    }

    /// Errors instead of looping forever if the alphabet is exhausted of
    /// unused codes.
    pub fn create_game_checked(
        &self,
        gamemaster_secret: String,
        now_ms: i64,
    ) -> GameResult<(GameCode, SharedGame)> {
        self.create_game_with_config(GameConfig::new(gamemaster_secret), now_ms)
    }

    pub fn create_game_with_config(
        &self,
        cfg: GameConfig,
        now_ms: i64,
    ) -> GameResult<(GameCode, SharedGame)> {
        let mut inner = self.inner.write();
        let mut code = None;
        for _ in 0..MAX_CODE_ATTEMPTS {
            let candidate = GameCode::random();
            if !inner.games.contains_key(&candidate) {
                code = Some(candidate);
                break;
            }
        }
        let code = code.ok_or_else(|| {
            GameError::BusinessRefusal("exhausted game code attempts".to_string())
        })?;
        let game = Arc::new(Mutex::new(GameInstance::new(code.clone(), cfg, now_ms)));
        inner.games.insert(code.clone(), game.clone());
        info!(game = %code, "game created");
        Ok((code, game))
    }

    pub fn get(&self, code: &GameCode) -> Option<SharedGame> {
        self.inner.read().games.get(code).cloned()
    }

    pub fn game_for_player(&self, player_id: &PlayerId) -> Option<GameCode> {
        self.inner.read().player_games.get(player_id).cloned()
    }

    pub fn link_player(&self, player_id: PlayerId, code: GameCode) {
        self.inner.write().player_games.insert(player_id, code);
    }

    pub fn unlink_player(&self, player_id: &PlayerId) {
        self.inner.write().player_games.remove(player_id);
    }

    /// Removes a game outright, e.g. once its last participant has left.
    /// Returns `true` if a game was present to remove.
    pub fn remove_game(&self, code: &GameCode) -> bool {
        let mut inner = self.inner.write();
        let removed = inner.games.remove(code).is_some();
        if removed {
            inner.player_games.retain(|_, g| g != code);
            info!(game = %code, "game removed");
        }
        removed
    }

    pub fn game_count(&self) -> usize {
        self.inner.read().games.len()
    }
}

impl Default for GameRegistry {
    fn default() -> Self {
        Self::new()
    }
}
