//! Events emitted by [`GameInstance`](super::GameInstance) methods.
//!
//! The instance itself never touches a socket or a clock directly — it
//! returns a batch of these from each mutating call, and a supervisor (see
//! `crate::supervisor`) translates `ScheduleTimer`/`CancelTimer` into real
//! `tokio::time` tasks (tracked by an abortable `JoinHandle` per game/kind)
//! and forwards the rest to the event gateway. This keeps the state machine
//! itself a plain, deterministically testable value.
use crate::game::round::SpreadSubmission;
use crate::game::round::Stage;
use crate::ids::PlayerId;
use crate::orderbook::{OrderBookSnapshot, Trade};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Stage,
    NoTighter,
}

#[derive(Debug, Clone)]
pub enum GameEvent {
    StageChanged { stage: Stage, round_index: u32 },
    SpreadUpdate {
        best_spread: Option<f64>,
        best_spread_player_id: Option<PlayerId>,
        submissions: Vec<SpreadSubmission>,
    },
    MarketMakerQuoted,
    Trade(Trade),
    OrderBookChanged(OrderBookSnapshot),
    Announcement { id: u64, text: String, at: i64 },
    /// The initial tick emitted synchronously when a stage timer is armed
    /// or re-armed (spec: "emits an initial onTimer(endsAt, secondsRemaining)").
    /// Never emitted for the auxiliary no-tighter timer.
    TimerTick { ends_at: i64, seconds_remaining: u64 },
    GameEnded { message: String },
    ScheduleTimer { kind: TimerKind, duration_ms: u64 },
    CancelTimer { kind: TimerKind },
}
