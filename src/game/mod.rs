pub mod events;
pub mod market;
pub mod player;
pub mod round;

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};

use tracing::{debug, info, warn};

use crate::config;
use crate::error::{GameError, GameResult};
use crate::ids::{GameCode, MarketId, OrderId, PlayerId, TradeId};
use crate::orderbook::{OrderBook, Side as BookSide, Trade};

pub use events::{GameEvent, TimerKind};
pub use market::Market;
pub use player::{PlayerState, Position};
pub use round::{MarketMakerQuote, RoundState, Stage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Lobby,
    Playing,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Buy,
    Sell,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    pub id: u64,
    pub text: String,
    pub at: i64,
}

/// Authoritative state, transitions, and settlement for one game.
///
/// Deliberately synchronous and clock-free except for the `now_ms` each
/// mutating call is handed explicitly — this is what makes the state
/// machine itself unit-testable without a real `tokio` runtime. Real-time
/// behavior (actually waiting out a timer) is layered on top by a
/// supervisor that calls `on_timer_expiry` when a scheduled timer fires —
/// see `crate::supervisor`.
pub struct GameInstance {
    pub code: GameCode,
    pub status: Status,
    pub markets: Vec<Market>,
    pub current_market_index: usize,
    pub current_round_index: u32,
    pub round: Option<RoundState>,
    pub players: HashMap<PlayerId, PlayerState>,
    pub announcements: VecDeque<Announcement>,
    pub show_individual_positions: bool,
    market_true_values: HashMap<MarketId, f64>,
    pub all_markets_complete: bool,
    pub pnl_finalized: bool,
    pub max_exposure: f64,
    pub created_at: i64,

    spread_timer_ms: u64,
    /// Configured per the construction contract but never auto-applied —
    /// OPEN_TRADING's timer, like SPREAD_QUOTING's, only starts via an
    /// explicit `setTimer` call.
    #[allow(dead_code)]
    open_trading_timer_ms: u64,
    no_tighter_window_ms: u64,
    gamemaster_secret: String,

    order_book: Option<OrderBook>,
    next_announcement_id: u64,
}

pub struct GameConfig {
    pub gamemaster_secret: String,
    pub spread_timer_ms: u64,
    pub open_trading_timer_ms: u64,
    pub no_tighter_window_ms: u64,
}

impl GameConfig {
    pub fn new(gamemaster_secret: String) -> Self {
        Self {
            gamemaster_secret,
            spread_timer_ms: config::DEFAULT_SPREAD_TIMER_MS,
            open_trading_timer_ms: config::DEFAULT_OPEN_TRADING_TIMER_MS,
            no_tighter_window_ms: config::DEFAULT_NO_TIGHTER_WINDOW_MS,
        }
    }
}

impl GameInstance {
    pub fn new(code: GameCode, cfg: GameConfig, now_ms: i64) -> Self {
        Self {
            code,
            status: Status::Lobby,
            markets: Vec::new(),
            current_market_index: 0,
            current_round_index: 0,
            round: None,
            players: HashMap::new(),
            announcements: VecDeque::new(),
            show_individual_positions: true,
            market_true_values: HashMap::new(),
            all_markets_complete: false,
            pnl_finalized: false,
            max_exposure: 0.0,
            created_at: now_ms,
            spread_timer_ms: cfg.spread_timer_ms,
            open_trading_timer_ms: cfg.open_trading_timer_ms,
            no_tighter_window_ms: cfg.no_tighter_window_ms,
            gamemaster_secret: cfg.gamemaster_secret,
            order_book: None,
            next_announcement_id: 1,
        }
    }

    // ── Players ────────────────────────────────────────────────────────

    /// Idempotent on re-join of the same id.
    pub fn add_player(&mut self, id: PlayerId, name: String, is_gamemaster: bool) {
        if self.players.contains_key(&id) {
            return;
        }
        let mut player = PlayerState::new(id.clone(), name, is_gamemaster);
        for market in &self.markets {
            player.position_mut(&market.id);
        }
        self.players.insert(id, player);
    }

    pub fn remove_player(&mut self, id: &PlayerId) {
        self.players.remove(id);
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn set_gamemaster(&mut self, id: &PlayerId) {
        if let Some(p) = self.players.get_mut(id) {
            p.is_gamemaster = true;
        }
    }

    pub fn is_gamemaster(&self, id: &PlayerId) -> bool {
        self.players.get(id).map(|p| p.is_gamemaster).unwrap_or(false)
    }

    /// Constant-origin equality: always compares every byte of the shorter
    /// side's length against the configured secret to avoid leaking length
    /// or prefix-match information via timing.
    pub fn check_gamemaster_secret(&self, supplied: &str) -> bool {
        let expected = self.gamemaster_secret.as_bytes();
        let got = supplied.as_bytes();
        let mut diff = (expected.len() != got.len()) as u8;
        for i in 0..expected.len().max(got.len()) {
            let a = expected.get(i).copied().unwrap_or(0);
            let b = got.get(i).copied().unwrap_or(0);
            diff |= a ^ b;
        }
        diff == 0
    }

    // ── GM configuration ────────────────────────────────────────────────

    pub fn set_max_exposure(&mut self, value: f64) -> GameResult<()> {
        if value < 0.0 {
            return Err(GameError::Validation("maxExposure must be >= 0".into()));
        }
        self.max_exposure = value;
        Ok(())
    }

    pub fn set_show_individual_positions(&mut self, value: bool) {
        self.show_individual_positions = value;
    }

    pub fn set_market_true_value(&mut self, market_id: MarketId, value: f64) {
        self.market_true_values.insert(market_id, value);
    }

    pub fn get_market_true_value(&self, market_id: &MarketId) -> Option<f64> {
        let markets_by_id: HashMap<MarketId, Market> = self
            .markets
            .iter()
            .map(|m| (m.id.clone(), m.clone()))
            .collect();
        market::resolve_true_value(&markets_by_id, &self.market_true_values, market_id)
    }

    pub fn push_announcement(&mut self, text: String, now_ms: i64) -> GameEvent {
        let id = self.next_announcement_id;
        self.next_announcement_id += 1;
        let announcement = Announcement { id, text: text.clone(), at: now_ms };
        if self.announcements.len() >= config::MAX_ANNOUNCEMENTS {
            self.announcements.pop_front();
        }
        self.announcements.push_back(announcement);
        GameEvent::Announcement { id, text, at: now_ms }
    }

    // ── Markets ──────────────────────────────────────────────────────────

    pub fn add_market(&mut self, market: Market, now_ms: i64) -> Vec<GameEvent> {
        let market_id = market.id.clone();
        self.markets.push(market);
        for player in self.players.values_mut() {
            player.position_mut(&market_id);
        }

        let mut events = Vec::new();
        if self.all_markets_complete
            && self.round.is_none()
            && self.current_market_index < self.markets.len()
        {
            self.all_markets_complete = false;
            events.extend(self.begin_round(now_ms));
        }
        events
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    pub fn start_game(&mut self, now_ms: i64) -> GameResult<Vec<GameEvent>> {
        if self.status != Status::Lobby {
            return Err(GameError::BusinessRefusal("game already started".into()));
        }
        if self.markets.is_empty() {
            return Err(GameError::Validation("at least one market is required".into()));
        }
        self.status = Status::Playing;
        self.current_market_index = 0;
        self.current_round_index = 0;
        Ok(self.begin_round(now_ms))
    }

    fn stage_event(&self, stage: Stage) -> GameEvent {
        GameEvent::StageChanged { stage, round_index: self.current_round_index }
    }

    fn spread_update_event(&self) -> GameEvent {
        let round = self.round.as_ref();
        GameEvent::SpreadUpdate {
            best_spread: round.and_then(|r| r.best_spread),
            best_spread_player_id: round.and_then(|r| r.best_spread_player_id.clone()),
            submissions: round.map(|r| r.submissions.clone()).unwrap_or_default(),
        }
    }

    fn begin_round(&mut self, _now_ms: i64) -> Vec<GameEvent> {
        let market_id = self.markets[self.current_market_index].id.clone();
        self.order_book = Some(OrderBook::new(market_id.clone()));
        self.round = Some(RoundState::new(self.current_round_index, market_id));
        for player in self.players.values_mut() {
            player.is_market_maker = false;
            player.round_pnl = 0.0;
        }
        info!(game = %self.code, round = self.current_round_index, "round started");
        vec![
            GameEvent::CancelTimer { kind: TimerKind::Stage },
            GameEvent::CancelTimer { kind: TimerKind::NoTighter },
            self.stage_event(Stage::SpreadQuoting),
        ]
    }

    // ── Stage 1: spread quoting ─────────────────────────────────────────

    pub fn submit_spread(
        &mut self,
        player_id: &PlayerId,
        width: f64,
        now_ms: i64,
    ) -> GameResult<Vec<GameEvent>> {
        if self.is_gamemaster(player_id) {
            return Err(GameError::Validation("gamemaster cannot trade".into()));
        }
        if width <= 0.0 {
            return Err(GameError::Validation("spreadWidth must be positive".into()));
        }
        let round = self
            .round
            .as_mut()
            .ok_or_else(|| GameError::BusinessRefusal("no active round".into()))?;
        if round.stage != Stage::SpreadQuoting {
            return Err(GameError::BusinessRefusal("not in spread quoting".into()));
        }
        if let Some(best) = round.best_spread {
            if width >= best {
                return Err(GameError::Validation(
                    "spread must be strictly tighter than the current best".into(),
                ));
            }
        }

        round.best_spread = Some(width);
        round.best_spread_player_id = Some(player_id.clone());
        round.submissions.push(round::SpreadSubmission {
            player_id: player_id.clone(),
            width,
            timestamp: now_ms,
        });
        round.no_tighter_until = Some(now_ms + self.no_tighter_window_ms as i64);

        Ok(vec![
            GameEvent::ScheduleTimer {
                kind: TimerKind::NoTighter,
                duration_ms: self.no_tighter_window_ms,
            },
            self.spread_update_event(),
        ])
    }

    /// Ends Stage 1 — called on stage-timer expiry, no-tighter-timer expiry,
    /// or a gamemaster `nextStage`.
    fn end_spread_quoting(&mut self, now_ms: i64) -> Vec<GameEvent> {
        let best_spread_player_id = self
            .round
            .as_ref()
            .and_then(|r| r.best_spread_player_id.clone());

        let mut events = vec![
            GameEvent::CancelTimer { kind: TimerKind::Stage },
            GameEvent::CancelTimer { kind: TimerKind::NoTighter },
        ];

        match best_spread_player_id {
            Some(mm_id) => {
                if let Some(p) = self.players.get_mut(&mm_id) {
                    p.is_market_maker = true;
                }
                if let Some(round) = self.round.as_mut() {
                    round.stage = Stage::MarketMakerQuote;
                }
                events.push(self.stage_event(Stage::MarketMakerQuote));
            }
            None => {
                events.extend(self.end_round(now_ms));
            }
        }
        events
    }

    // ── Stage 2: market-maker quote ─────────────────────────────────────

    pub fn submit_mm_quote(
        &mut self,
        player_id: &PlayerId,
        bid: f64,
        ask: f64,
        _now_ms: i64,
    ) -> GameResult<Vec<GameEvent>> {
        let round = self
            .round
            .as_ref()
            .ok_or_else(|| GameError::BusinessRefusal("no active round".into()))?;
        if round.stage != Stage::MarketMakerQuote {
            return Err(GameError::BusinessRefusal("not in market-maker quoting".into()));
        }
        if round.best_spread_player_id.as_ref() != Some(player_id) {
            return Err(GameError::BusinessRefusal(
                "only the best-spread player may quote".into(),
            ));
        }
        let width = ask - bid;
        let best_spread = round.best_spread.unwrap_or(0.0);
        if width <= 0.0 || (width - best_spread).abs() > config::SPREAD_EPSILON {
            return Err(GameError::Validation(
                "quote width must equal the accepted spread".into(),
            ));
        }

        let round = self.round.as_mut().unwrap();
        round.mm_quote = Some(MarketMakerQuote { bid, ask });
        round.stage = Stage::ForcedTrading;

        Ok(vec![GameEvent::MarketMakerQuoted, self.stage_event(Stage::ForcedTrading)])
    }

    // ── Stage 3: forced trading ──────────────────────────────────────────

    pub fn submit_forced_trade(
        &mut self,
        player_id: &PlayerId,
        direction: Direction,
        quantity: u32,
        now_ms: i64,
    ) -> GameResult<Vec<GameEvent>> {
        if quantity == 0 {
            return Err(GameError::Validation("quantity must be positive".into()));
        }
        if self.is_gamemaster(player_id) {
            return Err(GameError::Validation("gamemaster cannot trade".into()));
        }
        let round = self
            .round
            .as_ref()
            .ok_or_else(|| GameError::BusinessRefusal("no active round".into()))?;
        if round.stage != Stage::ForcedTrading {
            return Err(GameError::BusinessRefusal("not in forced trading".into()));
        }
        let mm_id = round
            .best_spread_player_id
            .clone()
            .ok_or_else(|| GameError::BusinessRefusal("no market maker".into()))?;
        if *player_id == mm_id {
            return Err(GameError::Validation("the market maker cannot force-trade itself".into()));
        }
        let quote = round
            .mm_quote
            .ok_or_else(|| GameError::BusinessRefusal("no market-maker quote".into()))?;
        let market_id = round.market_id.clone();

        let delta: i64 = match direction {
            Direction::Buy => quantity as i64,
            Direction::Sell => -(quantity as i64),
        };

        let caller_new_qty = self
            .players
            .get(player_id)
            .map(|p| p.positions.get(&market_id).map(|pos| pos.quantity).unwrap_or(0))
            .unwrap_or(0)
            + delta;
        let mm_new_qty = self
            .players
            .get(&mm_id)
            .map(|p| p.positions.get(&market_id).map(|pos| pos.quantity).unwrap_or(0))
            .unwrap_or(0)
            - delta;

        if self.max_exposure > 0.0
            && (caller_new_qty.unsigned_abs() as f64 > self.max_exposure
                || mm_new_qty.unsigned_abs() as f64 > self.max_exposure)
        {
            return Err(GameError::BusinessRefusal("exposure limit exceeded".into()));
        }

        let price = match direction {
            Direction::Buy => quote.ask,
            Direction::Sell => quote.bid,
        };
        let cash_delta = match direction {
            Direction::Buy => -price * quantity as f64,
            Direction::Sell => price * quantity as f64,
        };

        {
            let caller = self.players.get_mut(player_id).unwrap();
            caller.cash += cash_delta;
            caller.position_mut(&market_id).apply_fill(delta, price);
        }
        {
            let mm = self.players.get_mut(&mm_id).unwrap();
            mm.cash -= cash_delta;
            // The MM's avg_cost is intentionally not updated — see spec §9.
            mm.position_mut(&market_id).quantity -= delta;
        }

        let (buyer_id, seller_id) = match direction {
            Direction::Buy => (player_id.clone(), mm_id.clone()),
            Direction::Sell => (mm_id.clone(), player_id.clone()),
        };
        let trade = Trade {
            id: TradeId::new(),
            market_id,
            buyer_id,
            seller_id,
            bid_order_id: None,
            ask_order_id: None,
            price,
            quantity,
            timestamp: now_ms,
        };

        debug!(game = %self.code, ?direction, quantity, price, "forced trade settled");
        Ok(vec![GameEvent::Trade(trade)])
    }

    // ── Stage 4: open trading ────────────────────────────────────────────

    pub fn submit_order(
        &mut self,
        player_id: &PlayerId,
        side: BookSide,
        price: f64,
        quantity: u32,
        now_ms: i64,
    ) -> GameResult<Vec<GameEvent>> {
        let round = self
            .round
            .as_ref()
            .ok_or_else(|| GameError::BusinessRefusal("no active round".into()))?;
        if round.stage != Stage::OpenTrading {
            return Err(GameError::BusinessRefusal("not in open trading".into()));
        }
        let max_exposure = self.max_exposure;
        let players = &self.players;
        // One `add_order` call can cross several resting orders; track each
        // principal's not-yet-applied position delta here so the limit is
        // enforced against the cumulative effect of every fill in this call,
        // not just the player's pre-call position.
        let deltas: RefCell<HashMap<(PlayerId, MarketId), i64>> = RefCell::new(HashMap::new());
        let validator = move |buyer_id: &PlayerId, seller_id: &PlayerId, market_id: &MarketId, qty: u32| {
            if max_exposure <= 0.0 {
                return true;
            }
            let mut deltas = deltas.borrow_mut();
            let buyer_key = (buyer_id.clone(), market_id.clone());
            let seller_key = (seller_id.clone(), market_id.clone());
            let buyer_delta = deltas.get(&buyer_key).copied().unwrap_or(0);
            let seller_delta = deltas.get(&seller_key).copied().unwrap_or(0);
            let buyer_cur = players
                .get(buyer_id)
                .and_then(|p| p.positions.get(market_id))
                .map(|pos| pos.quantity)
                .unwrap_or(0)
                + buyer_delta;
            let seller_cur = players
                .get(seller_id)
                .and_then(|p| p.positions.get(market_id))
                .map(|pos| pos.quantity)
                .unwrap_or(0)
                + seller_delta;
            let buyer_ok = (buyer_cur + qty as i64).unsigned_abs() as f64 <= max_exposure;
            let seller_ok = (seller_cur - qty as i64).unsigned_abs() as f64 <= max_exposure;
            if buyer_ok && seller_ok {
                deltas.insert(buyer_key, buyer_delta + qty as i64);
                deltas.insert(seller_key, seller_delta - qty as i64);
            }
            buyer_ok && seller_ok
        };

        let book = self.order_book.as_mut().unwrap();
        let (_order, trades) = book.add_order(player_id.clone(), side, price, quantity, now_ms, Some(&validator))?;

        for trade in &trades {
            if let Some(buyer) = self.players.get_mut(&trade.buyer_id) {
                buyer.cash -= trade.price * trade.quantity as f64;
                buyer.position_mut(&trade.market_id).apply_fill(trade.quantity as i64, trade.price);
            }
            if let Some(seller) = self.players.get_mut(&trade.seller_id) {
                seller.cash += trade.price * trade.quantity as f64;
                seller.position_mut(&trade.market_id).quantity -= trade.quantity as i64;
            }
        }

        let snapshot = self.order_book.as_ref().unwrap().get_snapshot();
        let mut events: Vec<GameEvent> = vec![GameEvent::OrderBookChanged(snapshot)];
        events.extend(trades.into_iter().map(GameEvent::Trade));
        Ok(events)
    }

    // ── Stage transitions ────────────────────────────────────────────────

    pub fn next_stage(&mut self, now_ms: i64) -> GameResult<Vec<GameEvent>> {
        let stage = self
            .round
            .as_ref()
            .ok_or_else(|| GameError::BusinessRefusal("no active round".into()))?
            .stage;
        match stage {
            Stage::SpreadQuoting => Ok(self.end_spread_quoting(now_ms)),
            Stage::MarketMakerQuote => {
                if self.round.as_ref().unwrap().mm_quote.is_none() {
                    return Err(GameError::BusinessRefusal("no market-maker quote yet".into()));
                }
                self.round.as_mut().unwrap().stage = Stage::ForcedTrading;
                Ok(vec![self.stage_event(Stage::ForcedTrading)])
            }
            Stage::ForcedTrading => {
                self.round.as_mut().unwrap().stage = Stage::OpenTrading;
                Ok(vec![self.stage_event(Stage::OpenTrading)])
            }
            Stage::OpenTrading => Ok(self.end_open_trading(now_ms)),
            Stage::RoundEnd => Ok(self.advance_to_next_market(now_ms)),
        }
    }

    /// Minimal rewind: MARKET_MAKER_QUOTE -> SPREAD_QUOTING re-arms the
    /// spread timer at default length but the spec documents this as not
    /// re-arming the underlying scheduled task — callers relying on the
    /// round auto-advancing after a `prevStage` from this state will not
    /// see it happen on its own. FORCED_TRADING -> MARKET_MAKER_QUOTE only
    /// if a quote exists, and clears it.
    pub fn prev_stage(&mut self, now_ms: i64) -> GameResult<Vec<GameEvent>> {
        let stage = self
            .round
            .as_ref()
            .ok_or_else(|| GameError::BusinessRefusal("no active round".into()))?
            .stage;
        match stage {
            Stage::MarketMakerQuote => {
                let round = self.round.as_mut().unwrap();
                round.stage = Stage::SpreadQuoting;
                round.stage_ends_at = Some(now_ms + self.spread_timer_ms as i64);
                Ok(vec![self.stage_event(Stage::SpreadQuoting)])
            }
            Stage::ForcedTrading => {
                let round = self.round.as_mut().unwrap();
                if round.mm_quote.is_none() {
                    return Err(GameError::BusinessRefusal("unsupported rewind".into()));
                }
                round.mm_quote = None;
                round.stage = Stage::MarketMakerQuote;
                Ok(vec![self.stage_event(Stage::MarketMakerQuote)])
            }
            _ => Err(GameError::BusinessRefusal("unsupported rewind".into())),
        }
    }

    fn end_open_trading(&mut self, now_ms: i64) -> Vec<GameEvent> {
        let mut events = vec![GameEvent::CancelTimer { kind: TimerKind::Stage }];
        events.extend(self.end_round(now_ms));
        events
    }

    fn end_round(&mut self, now_ms: i64) -> Vec<GameEvent> {
        if let Some(round) = self.round.as_mut() {
            round.stage = Stage::RoundEnd;
        }
        let mut events = vec![self.stage_event(Stage::RoundEnd)];
        events.extend(self.advance_to_next_market(now_ms));
        events
    }

    pub fn advance_to_next_market(&mut self, now_ms: i64) -> Vec<GameEvent> {
        self.current_market_index += 1;
        self.current_round_index += 1;
        if self.current_market_index >= self.markets.len() {
            self.round = None;
            self.order_book = None;
            self.all_markets_complete = true;
            return Vec::new();
        }
        self.begin_round(now_ms)
    }

    // ── Pause / resume / stop ────────────────────────────────────────────

    pub fn pause(&mut self) -> GameResult<Vec<GameEvent>> {
        if self.status == Status::Stopped {
            return Err(GameError::BusinessRefusal("game is stopped".into()));
        }
        self.status = Status::Paused;
        Ok(vec![
            GameEvent::CancelTimer { kind: TimerKind::Stage },
            GameEvent::CancelTimer { kind: TimerKind::NoTighter },
        ])
    }

    pub fn resume(&mut self, now_ms: i64) -> GameResult<Vec<GameEvent>> {
        if self.status != Status::Paused {
            return Err(GameError::BusinessRefusal("game is not paused".into()));
        }
        self.status = Status::Playing;
        let mut events = Vec::new();
        if let Some(round) = self.round.as_ref() {
            if let Some(ends_at) = round.stage_ends_at {
                let remaining = (ends_at - now_ms).max(0) as u64;
                events.push(GameEvent::ScheduleTimer { kind: TimerKind::Stage, duration_ms: remaining });
                events.push(GameEvent::TimerTick {
                    ends_at,
                    seconds_remaining: ceil_seconds(remaining),
                });
            }
        }
        Ok(events)
    }

    pub fn stop(&mut self) -> GameResult<Vec<GameEvent>> {
        if self.all_markets_complete && !self.pnl_finalized {
            return Err(GameError::BusinessRefusal(
                "finalize P&L before stopping a completed game".into(),
            ));
        }
        self.status = Status::Stopped;
        Ok(vec![
            GameEvent::CancelTimer { kind: TimerKind::Stage },
            GameEvent::CancelTimer { kind: TimerKind::NoTighter },
        ])
    }

    // ── Timers ────────────────────────────────────────────────────────────

    /// Only meaningful in SPREAD_QUOTING and OPEN_TRADING; a no-op elsewhere.
    pub fn set_timer(&mut self, seconds: u64, now_ms: i64) -> Vec<GameEvent> {
        let seconds = seconds.clamp(config::MIN_TIMER_SECONDS, config::MAX_TIMER_SECONDS);
        let stage = match self.round.as_ref() {
            Some(r) => r.stage,
            None => return Vec::new(),
        };
        if stage != Stage::SpreadQuoting && stage != Stage::OpenTrading {
            return Vec::new();
        }
        let duration_ms = seconds * 1000;
        let ends_at = now_ms + duration_ms as i64;
        self.round.as_mut().unwrap().stage_ends_at = Some(ends_at);
        vec![
            GameEvent::ScheduleTimer { kind: TimerKind::Stage, duration_ms },
            GameEvent::TimerTick { ends_at, seconds_remaining: seconds },
        ]
    }

    /// Called by the supervisor when a previously scheduled timer fires.
    pub fn on_timer_expiry(&mut self, kind: TimerKind, now_ms: i64) -> Vec<GameEvent> {
        let stage = match self.round.as_ref() {
            Some(r) => r.stage,
            None => return Vec::new(),
        };
        match (kind, stage) {
            (TimerKind::Stage, Stage::SpreadQuoting) | (TimerKind::NoTighter, Stage::SpreadQuoting) => {
                self.end_spread_quoting(now_ms)
            }
            (TimerKind::Stage, Stage::OpenTrading) => self.end_open_trading(now_ms),
            _ => {
                warn!(game = %self.code, ?kind, ?stage, "timer expired in an unexpected stage, ignoring");
                Vec::new()
            }
        }
    }

    // ── P&L ───────────────────────────────────────────────────────────────

    pub fn finalize_pnl(&mut self) -> GameResult<Vec<GameEvent>> {
        if !self.all_markets_complete {
            return Err(GameError::BusinessRefusal(
                "markets are not all complete".into(),
            ));
        }
        if self.pnl_finalized {
            return Ok(Vec::new());
        }

        let markets_by_id: HashMap<MarketId, Market> =
            self.markets.iter().map(|m| (m.id.clone(), m.clone())).collect();
        let true_values = self.market_true_values.clone();

        let player_ids: Vec<PlayerId> = self.players.keys().cloned().collect();
        for player_id in player_ids {
            let is_gm = self.players[&player_id].is_gamemaster;
            if is_gm {
                continue;
            }
            let mut settlement = self.players[&player_id].cash;
            let positions: Vec<(MarketId, i64)> = self.players[&player_id]
                .positions
                .iter()
                .map(|(m, p)| (m.clone(), p.quantity))
                .collect();
            for (market_id, quantity) in positions {
                if quantity == 0 {
                    continue;
                }
                if let Some(value) =
                    market::resolve_true_value(&markets_by_id, &true_values, &market_id)
                {
                    settlement += quantity as f64 * value;
                }
            }
            let player = self.players.get_mut(&player_id).unwrap();
            player.total_pnl = settlement - config::INITIAL_CASH;
        }

        self.pnl_finalized = true;
        Ok(Vec::new())
    }

    // ── Snapshot projection ──────────────────────────────────────────────

    pub fn get_snapshot(&self, for_gamemaster: bool, viewer_player_id: Option<&PlayerId>) -> GameSnapshot {
        let markets_by_id: HashMap<MarketId, Market> =
            self.markets.iter().map(|m| (m.id.clone(), m.clone())).collect();

        let market_true_values = if for_gamemaster {
            let mut values = self.market_true_values.clone();
            for market in &self.markets {
                if !values.contains_key(&market.id) {
                    if let Some(v) = market::resolve_true_value(&markets_by_id, &self.market_true_values, &market.id) {
                        values.insert(market.id.clone(), v);
                    }
                }
            }
            Some(values)
        } else {
            None
        };

        let mut players: Vec<PlayerState> = self
            .players
            .values()
            .map(|p| {
                let mut projected = p.clone();
                if !self.show_individual_positions {
                    projected.positions.clear();
                    projected.cash = 0.0;
                    projected.round_pnl = 0.0;
                }
                if !for_gamemaster {
                    if let Some(viewer) = viewer_player_id {
                        if viewer == &p.id {
                            projected.cash = 0.0;
                        }
                    }
                }
                projected
            })
            .collect();
        players.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));

        GameSnapshot {
            code: self.code.clone(),
            status: self.status,
            current_market_index: self.current_market_index,
            current_round_index: self.current_round_index,
            round: self.round.clone(),
            players,
            announcements: self.announcements.iter().cloned().collect(),
            show_individual_positions: self.show_individual_positions,
            market_true_values,
            all_markets_complete: self.all_markets_complete,
            pnl_finalized: self.pnl_finalized,
            max_exposure: self.max_exposure,
        }
    }

    pub fn order_book_snapshot(&self) -> Option<crate::orderbook::OrderBookSnapshot> {
        self.order_book.as_ref().map(|b| b.get_snapshot())
    }

    pub fn cancel_order(&mut self, _order_id: &OrderId) -> GameResult<()> {
        Err(GameError::Unimplemented("order cancellation is not supported".into()))
    }
}

fn ceil_seconds(ms: u64) -> u64 {
    ms.div_ceil(1000)
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSnapshot {
    pub code: GameCode,
    pub status: Status,
    pub current_market_index: usize,
    pub current_round_index: u32,
    pub round: Option<RoundState>,
    pub players: Vec<PlayerState>,
    pub announcements: Vec<Announcement>,
    pub show_individual_positions: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub market_true_values: Option<HashMap<MarketId, f64>>,
    pub all_markets_complete: bool,
    pub pnl_finalized: bool,
    pub max_exposure: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_game(now_ms: i64) -> GameInstance {
        GameInstance::new(GameCode::canonicalize("abcdef"), GameConfig::new("s".into()), now_ms)
    }

    fn add_market(game: &mut GameInstance, id: &str, now_ms: i64) {
        game.add_market(Market::new(MarketId::from(id), id.into(), String::new()), now_ms);
    }

    #[test]
    fn s1_forced_trade() {
        let mut game = new_game(0);
        add_market(&mut game, "X", 0);
        let alice = PlayerId::from("alice");
        let bob = PlayerId::from("bob");
        game.add_player(alice.clone(), "Alice".into(), false);
        game.add_player(bob.clone(), "Bob".into(), false);
        game.start_game(0).unwrap();

        game.submit_spread(&alice, 2.0, 0).unwrap();
        game.on_timer_expiry(TimerKind::NoTighter, 10_000);
        assert_eq!(game.round.as_ref().unwrap().stage, Stage::MarketMakerQuote);

        game.submit_mm_quote(&alice, 99.0, 101.0, 10_000).unwrap();
        assert_eq!(game.round.as_ref().unwrap().stage, Stage::ForcedTrading);

        game.submit_forced_trade(&bob, Direction::Buy, 5, 10_000).unwrap();

        let bob_state = &game.players[&bob];
        assert!((bob_state.cash - (10_000.0 - 101.0 * 5.0)).abs() < 1e-9);
        assert_eq!(bob_state.positions[&MarketId::from("X")].quantity, 5);
        assert!((bob_state.positions[&MarketId::from("X")].avg_cost - 101.0).abs() < 1e-9);

        let alice_state = &game.players[&alice];
        assert!((alice_state.cash - (10_000.0 + 101.0 * 5.0)).abs() < 1e-9);
        assert_eq!(alice_state.positions[&MarketId::from("X")].quantity, -5);
    }

    #[test]
    fn s5_stricter_spread_enforcement() {
        let mut game = new_game(0);
        add_market(&mut game, "X", 0);
        let alice = PlayerId::from("alice");
        let bob = PlayerId::from("bob");
        let carol = PlayerId::from("carol");
        game.add_player(alice, "Alice".into(), false);
        game.add_player(bob.clone(), "Bob".into(), false);
        game.add_player(carol.clone(), "Carol".into(), false);
        game.start_game(0).unwrap();

        game.submit_spread(&bob, 1.50, 0).unwrap();
        let err = game.submit_spread(&bob, 1.50, 1).unwrap_err();
        assert!(matches!(err, GameError::Validation(_)));

        game.submit_spread(&carol, 1.49, 2).unwrap();
        let round = game.round.as_ref().unwrap();
        assert_eq!(round.best_spread_player_id.as_ref(), Some(&carol));
        assert_eq!(round.no_tighter_until, Some(2 + 10_000));
    }

    #[test]
    fn gamemaster_cannot_submit_spread() {
        let mut game = new_game(0);
        add_market(&mut game, "X", 0);
        let gm = PlayerId::from("gm");
        game.add_player(gm.clone(), "GM".into(), true);
        game.start_game(0).unwrap();
        let err = game.submit_spread(&gm, 1.0, 0).unwrap_err();
        assert!(matches!(err, GameError::Validation(_)));
    }

    #[test]
    fn exposure_limit_blocks_forced_trade() {
        let mut game = new_game(0);
        add_market(&mut game, "X", 0);
        game.set_max_exposure(2.0).unwrap();
        let alice = PlayerId::from("alice");
        let bob = PlayerId::from("bob");
        game.add_player(alice.clone(), "Alice".into(), false);
        game.add_player(bob.clone(), "Bob".into(), false);
        game.start_game(0).unwrap();
        game.submit_spread(&alice, 2.0, 0).unwrap();
        game.on_timer_expiry(TimerKind::NoTighter, 10_000);
        game.submit_mm_quote(&alice, 99.0, 101.0, 10_000).unwrap();

        let err = game.submit_forced_trade(&bob, Direction::Buy, 5, 10_000).unwrap_err();
        assert!(matches!(err, GameError::BusinessRefusal(_)));
    }

    #[test]
    fn exposure_limit_is_enforced_across_fills_within_one_order() {
        let mut game = new_game(0);
        add_market(&mut game, "X", 0);
        game.set_max_exposure(2.0).unwrap();
        let alice = PlayerId::from("alice");
        let bob = PlayerId::from("bob");
        game.add_player(alice.clone(), "Alice".into(), false);
        game.add_player(bob.clone(), "Bob".into(), false);
        game.start_game(0).unwrap();
        game.submit_spread(&alice, 2.0, 0).unwrap();
        game.on_timer_expiry(TimerKind::NoTighter, 10_000);
        game.submit_mm_quote(&alice, 99.0, 101.0, 10_000).unwrap();
        game.next_stage(10_000).unwrap();
        assert_eq!(game.round.as_ref().unwrap().stage, Stage::OpenTrading);

        // Two resting asks at the same price, qty 2 each — filling both
        // against one crossing bid would push the buyer to +4.
        game.submit_order(&alice, BookSide::Ask, 100.0, 2, 10_000).unwrap();
        game.submit_order(&alice, BookSide::Ask, 100.0, 2, 10_001).unwrap();

        let events = game.submit_order(&bob, BookSide::Bid, 100.0, 4, 10_002).unwrap();
        let trades: Vec<_> = events
            .into_iter()
            .filter_map(|e| match e {
                GameEvent::Trade(t) => Some(t),
                _ => None,
            })
            .collect();

        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].quantity, 2);
        let bob_qty = game.players[&bob].positions[&MarketId::from("X")].quantity;
        assert_eq!(bob_qty, 2);
        let alice_qty = game.players[&alice].positions[&MarketId::from("X")].quantity;
        assert_eq!(alice_qty, -2);
    }

    #[test]
    fn s6_finalize_pnl_after_all_markets_complete() {
        let mut game = new_game(0);
        add_market(&mut game, "A", 0);
        add_market(&mut game, "B", 0);
        let mut weights = HashMap::new();
        weights.insert(MarketId::from("A"), 1.0);
        weights.insert(MarketId::from("B"), -2.0);
        game.add_market(
            Market::derivative(MarketId::from("D"), "D".into(), String::new(), weights, None),
            0,
        );
        let alice = PlayerId::from("alice");
        game.add_player(alice.clone(), "Alice".into(), false);
        game.start_game(0).unwrap();

        // Walk every round to completion without trading.
        for _ in 0..3 {
            game.submit_spread(&alice, 1.0, 0).unwrap();
            game.next_stage(0).unwrap(); // SpreadQuoting -> MarketMakerQuote
            game.submit_mm_quote(&alice, 99.5, 100.5, 0).unwrap();
            game.next_stage(0).unwrap(); // ForcedTrading
            game.next_stage(0).unwrap(); // OpenTrading -> ends round, advances
        }
        assert!(game.all_markets_complete);

        game.set_market_true_value(MarketId::from("A"), 10.0);
        game.set_market_true_value(MarketId::from("B"), 4.0);
        game.players.get_mut(&alice).unwrap().position_mut(&MarketId::from("D")).quantity = 3;

        game.finalize_pnl().unwrap();
        let expected_value = 10.0 * 1.0 + 4.0 * -2.0;
        assert_eq!(expected_value, 2.0);
        let pnl = game.players[&alice].total_pnl;
        assert!((pnl - (3.0 * 2.0)).abs() < 1e-9);

        // Idempotent.
        game.finalize_pnl().unwrap();
    }

    #[test]
    fn snapshot_hides_true_values_from_non_gm() {
        let mut game = new_game(0);
        add_market(&mut game, "X", 0);
        game.set_market_true_value(MarketId::from("X"), 5.0);
        let snap_player = game.get_snapshot(false, None);
        assert!(snap_player.market_true_values.is_none());
        let snap_gm = game.get_snapshot(true, None);
        assert!(snap_gm.market_true_values.is_some());
    }

    #[test]
    fn snapshot_zeros_positions_when_visibility_disabled() {
        let mut game = new_game(0);
        add_market(&mut game, "X", 0);
        let alice = PlayerId::from("alice");
        game.add_player(alice.clone(), "Alice".into(), false);
        game.players.get_mut(&alice).unwrap().total_pnl = 42.0;
        game.set_show_individual_positions(false);
        let snap = game.get_snapshot(false, None);
        let projected = snap.players.iter().find(|p| p.id == alice).unwrap();
        assert!(projected.positions.is_empty());
        assert_eq!(projected.cash, 0.0);
        assert_eq!(projected.total_pnl, 42.0);
    }
}
