//! Turns the state machine's `ScheduleTimer`/`CancelTimer` requests into
//! real `tokio::time` waits, so [`GameInstance`](crate::game::GameInstance)
//! itself never has to touch a clock. One abortable task per
//! `(GameCode, TimerKind)`; scheduling the same kind again cancels whatever
//! was running before it, matching the state machine's own last-write-wins
//! timer semantics.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::game::{GameEvent, TimerKind};
use crate::ids::GameCode;
use crate::registry::SharedGame;

/// Called with every event the supervisor isn't itself responsible for
/// consuming (i.e. everything except `ScheduleTimer`/`CancelTimer`).
pub type EventSink = Arc<dyn Fn(GameCode, GameEvent) + Send + Sync>;

pub struct Supervisor {
    timers: Mutex<HashMap<(GameCode, TimerKind), JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { timers: Mutex::new(HashMap::new()) })
    }

    /// Processes a batch of events produced by one `GameInstance` call,
    /// recursing when a fired timer produces further events of its own.
    pub fn dispatch(
        self: &Arc<Self>,
        code: GameCode,
        game: SharedGame,
        events: Vec<GameEvent>,
        sink: EventSink,
    ) {
        for event in events {
            match event {
                GameEvent::ScheduleTimer { kind, duration_ms } => {
                    self.schedule(code.clone(), game.clone(), kind, duration_ms, sink.clone());
                }
                GameEvent::CancelTimer { kind } => self.cancel(&code, kind),
                other => sink(code.clone(), other),
            }
        }
    }

    fn schedule(
        self: &Arc<Self>,
        code: GameCode,
        game: SharedGame,
        kind: TimerKind,
        duration_ms: u64,
        sink: EventSink,
    ) {
        self.cancel(&code, kind);
        let sup = self.clone();
        let spawn_code = code.clone();
        let handle = tokio::spawn(async move {
            let ends_at = now_millis() + duration_ms as i64;
            // One tick per second while the timer runs, so clients see
            // secondsRemaining count down rather than only at arm time.
            let mut elapsed_ms = 0u64;
            while elapsed_ms + 1000 < duration_ms {
                tokio::time::sleep(Duration::from_millis(1000)).await;
                elapsed_ms += 1000;
                if kind == TimerKind::Stage {
                    let remaining = (ends_at - now_millis()).max(0) as u64;
                    sink(
                        spawn_code.clone(),
                        GameEvent::TimerTick { ends_at, seconds_remaining: remaining.div_ceil(1000) },
                    );
                }
            }
            tokio::time::sleep(Duration::from_millis(duration_ms - elapsed_ms)).await;

            let now_ms = now_millis();
            let follow_up = {
                let mut instance = game.lock().await;
                instance.on_timer_expiry(kind, now_ms)
            };
            sup.timers.lock().remove(&(spawn_code.clone(), kind));
            sup.dispatch(spawn_code, game, follow_up, sink);
        });
        self.timers.lock().insert((code, kind), handle);
    }

    fn cancel(&self, code: &GameCode, kind: TimerKind) {
        if let Some(handle) = self.timers.lock().remove(&(code.clone(), kind)) {
            handle.abort();
        }
    }

    /// Aborts every timer belonging to a game, e.g. once it's removed from
    /// the registry.
    pub fn cancel_all(&self, code: &GameCode) {
        self.cancel(code, TimerKind::Stage);
        self.cancel(code, TimerKind::NoTighter);
    }
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::{GameConfig, GameInstance};
    use crate::ids::MarketId;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Mutex as TokioMutex;

    #[tokio::test]
    async fn scheduled_timer_fires_and_reaches_the_sink() {
        let code = GameCode::canonicalize("abcdef");
        let mut instance = GameInstance::new(code.clone(), GameConfig::new("s".into()), 0);
        instance.add_market(crate::game::Market::new(MarketId::from("X"), "X".into(), String::new()), 0);
        instance.add_player(crate::ids::PlayerId::from("alice"), "Alice".into(), false);
        instance.start_game(0).unwrap();
        let game: SharedGame = Arc::new(TokioMutex::new(instance));

        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        let sink: EventSink = Arc::new(move |_code, _event| {
            fired_clone.store(true, Ordering::SeqCst);
        });

        let supervisor = Supervisor::new();
        supervisor.dispatch(
            code.clone(),
            game,
            vec![GameEvent::ScheduleTimer { kind: TimerKind::Stage, duration_ms: 10 }],
            sink,
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancelling_a_timer_prevents_it_from_firing() {
        let code = GameCode::canonicalize("abcdef");
        let instance = GameInstance::new(code.clone(), GameConfig::new("s".into()), 0);
        let game: SharedGame = Arc::new(TokioMutex::new(instance));

        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        let sink: EventSink = Arc::new(move |_code, _event| {
            fired_clone.store(true, Ordering::SeqCst);
        });

        let supervisor = Supervisor::new();
        supervisor.dispatch(
            code.clone(),
            game,
            vec![GameEvent::ScheduleTimer { kind: TimerKind::Stage, duration_ms: 50 }],
            sink,
        );
        supervisor.cancel(&code, TimerKind::Stage);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn stage_timer_ticks_once_per_second_until_expiry() {
        let code = GameCode::canonicalize("abcdef");
        let mut instance = GameInstance::new(code.clone(), GameConfig::new("s".into()), 0);
        instance.add_market(crate::game::Market::new(MarketId::from("X"), "X".into(), String::new()), 0);
        instance.add_player(crate::ids::PlayerId::from("alice"), "Alice".into(), false);
        instance.start_game(0).unwrap();
        let game: SharedGame = Arc::new(TokioMutex::new(instance));

        let ticks = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let expired = Arc::new(AtomicBool::new(false));
        let ticks_clone = ticks.clone();
        let expired_clone = expired.clone();
        let sink: EventSink = Arc::new(move |_code, event| match event {
            GameEvent::TimerTick { .. } => {
                ticks_clone.fetch_add(1, Ordering::SeqCst);
            }
            _ => expired_clone.store(true, Ordering::SeqCst),
        });

        let supervisor = Supervisor::new();
        supervisor.dispatch(
            code,
            game,
            vec![GameEvent::ScheduleTimer { kind: TimerKind::Stage, duration_ms: 2500 }],
            sink,
        );

        tokio::time::sleep(Duration::from_millis(3100)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
        assert!(expired.load(Ordering::SeqCst));
    }
}
