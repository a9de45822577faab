//! Routes inbound events to game-instance methods, owns per-connection
//! session state, enforces GM authorization, and fans out both derived
//! events and per-recipient projected snapshots.
pub mod session;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{json, Value};
use tracing::debug;

use crate::game::round::Stage;
use crate::game::{Direction, GameConfig, GameEvent, GameInstance};
use crate::ids::{GameCode, MarketId, PlayerId};
use crate::orderbook::Side;
use crate::registry::{GameRegistry, SharedGame};
use crate::supervisor::{EventSink, Supervisor};
use crate::transport::{ConnectionId, EventTransport, OutboundEvent};

use session::Session;

const UNIMPLEMENTED_CANCEL_MESSAGE: &str = "order cancellation is not supported";

pub struct Gateway {
    registry: Arc<GameRegistry>,
    transport: Arc<dyn EventTransport>,
    supervisor: Arc<Supervisor>,
    sessions: RwLock<HashMap<ConnectionId, Session>>,
    room_members: RwLock<HashMap<GameCode, HashSet<ConnectionId>>>,
    last_stage: RwLock<HashMap<GameCode, Stage>>,
}

impl Gateway {
    pub fn new(
        registry: Arc<GameRegistry>,
        transport: Arc<dyn EventTransport>,
        supervisor: Arc<Supervisor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            transport,
            supervisor,
            sessions: RwLock::new(HashMap::new()),
            room_members: RwLock::new(HashMap::new()),
            last_stage: RwLock::new(HashMap::new()),
        })
    }

    pub fn on_connect(&self, conn_id: ConnectionId) {
        self.sessions.write().insert(conn_id, Session::default());
    }

    pub async fn on_disconnect(&self, conn_id: ConnectionId) {
        self.handle_leave(conn_id).await;
        self.sessions.write().remove(&conn_id);
        self.transport.disconnect(conn_id);
    }

    /// Dispatches one inbound `{event, payload}` and returns the ack value
    /// (an empty object if the event carries none).
    pub async fn handle_event(self: &Arc<Self>, conn_id: ConnectionId, event: &str, payload: Value, now_ms: i64) -> Value {
        match event {
            "game:join" => self.handle_join(conn_id, payload, now_ms).await,
            "game:leave" => {
                self.handle_leave(conn_id).await;
                Value::Null
            }
            "game:spread:submit" => {
                self.handle_player_action(conn_id, now_ms, |game, player_id, now_ms| {
                    let width = payload_f64(&payload, "spreadWidth").unwrap_or(0.0);
                    game.submit_spread(player_id, width, now_ms)
                })
                .await
            }
            "game:mm:quote" => {
                self.handle_player_action(conn_id, now_ms, |game, player_id, now_ms| {
                    let bid = payload_f64(&payload, "bid").unwrap_or(0.0);
                    let ask = payload_f64(&payload, "ask").unwrap_or(0.0);
                    game.submit_mm_quote(player_id, bid, ask, now_ms)
                })
                .await
            }
            "game:forced:trade" => {
                self.handle_player_action(conn_id, now_ms, |game, player_id, now_ms| {
                    let direction = match payload.get("direction").and_then(Value::as_str) {
                        Some("sell") => Direction::Sell,
                        _ => Direction::Buy,
                    };
                    let quantity = payload_u32(&payload, "quantity").unwrap_or(0);
                    game.submit_forced_trade(player_id, direction, quantity, now_ms)
                })
                .await
            }
            "game:order:submit" => {
                self.handle_player_action(conn_id, now_ms, |game, player_id, now_ms| {
                    let side = match payload.get("side").and_then(Value::as_str) {
                        Some("ask") => Side::Ask,
                        _ => Side::Bid,
                    };
                    let price = payload_f64(&payload, "price").unwrap_or(0.0);
                    let quantity = payload_u32(&payload, "quantity").unwrap_or(0);
                    game.submit_order(player_id, side, price, quantity, now_ms)
                })
                .await
            }
            "game:order:cancel" => {
                self.send_error(conn_id, UNIMPLEMENTED_CANCEL_MESSAGE);
                Value::Null
            }
            "gm:create" => self.handle_create(conn_id, payload, now_ms).await,
            "gm:start" => {
                self.handle_gm_action(conn_id, now_ms, |game, now_ms| game.start_game(now_ms)).await
            }
            "gm:pause" => self.handle_gm_action(conn_id, now_ms, |game, _| game.pause()).await,
            "gm:resume" => self.handle_gm_action(conn_id, now_ms, |game, now_ms| game.resume(now_ms)).await,
            "gm:stop" => self.handle_stop(conn_id, now_ms).await,
            "gm:next_stage" => {
                self.handle_gm_action(conn_id, now_ms, |game, now_ms| game.next_stage(now_ms)).await
            }
            "gm:prev_stage" => {
                self.handle_gm_action(conn_id, now_ms, |game, now_ms| game.prev_stage(now_ms)).await
            }
            "gm:add_market" => self.handle_add_market(conn_id, payload, now_ms, false).await,
            "gm:add_derivative" => self.handle_add_market(conn_id, payload, now_ms, true).await,
            "gm:broadcast" => self.handle_broadcast(conn_id, payload, now_ms).await,
            "gm:set_timer" => {
                let seconds = payload.get("seconds").and_then(Value::as_u64).unwrap_or(0);
                self.handle_gm_action(conn_id, now_ms, move |game, now_ms| {
                    Ok(game.set_timer(seconds, now_ms))
                })
                .await
            }
            "gm:set_visibility" => {
                let visible = payload.get("showIndividualPositions").and_then(Value::as_bool).unwrap_or(true);
                self.handle_gm_action(conn_id, now_ms, move |game, _| {
                    game.set_show_individual_positions(visible);
                    Ok(Vec::new())
                })
                .await
            }
            "gm:set_true_value" => {
                let market_id = payload.get("marketId").and_then(Value::as_str).map(MarketId::from);
                let value = payload_f64(&payload, "value").unwrap_or(0.0);
                self.handle_gm_action(conn_id, now_ms, move |game, _| {
                    if let Some(market_id) = market_id.clone() {
                        game.set_market_true_value(market_id, value);
                    }
                    Ok(Vec::new())
                })
                .await
            }
            "gm:set_exposure_limit" => {
                let max_exposure = payload_f64(&payload, "maxExposure").unwrap_or(0.0);
                self.handle_gm_action(conn_id, now_ms, move |game, _| {
                    game.set_max_exposure(max_exposure)?;
                    Ok(Vec::new())
                })
                .await
            }
            "gm:finalize_pnl" => {
                self.handle_gm_action(conn_id, now_ms, |game, _| game.finalize_pnl()).await
            }
            _ => {
                debug!(event, "ignoring unrecognized inbound event");
                Value::Null
            }
        }
    }

    // ── game:join / gm:create ────────────────────────────────────────────

    async fn handle_join(&self, conn_id: ConnectionId, payload: Value, _now_ms: i64) -> Value {
        let Some(code_raw) = payload.get("gameCode").and_then(Value::as_str) else {
            return json!({"error": "gameCode is required"});
        };
        let code = GameCode::canonicalize(code_raw);
        let Some(game) = self.registry.get(&code) else {
            return json!({"error": "game not found"});
        };
        let display_name = payload
            .get("displayName")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let wants_gamemaster = payload.get("isGamemaster").and_then(Value::as_bool).unwrap_or(false);

        let mut instance = game.lock().await;
        let is_gamemaster = wants_gamemaster
            && payload
                .get("gamemasterSecret")
                .and_then(Value::as_str)
                .map(|s| instance.check_gamemaster_secret(s))
                .unwrap_or(false);
        if wants_gamemaster && !is_gamemaster {
            return json!({"error": "invalid gamemaster secret"});
        }

        let player_id = PlayerId::new();
        instance.add_player(player_id.clone(), display_name.clone(), is_gamemaster);
        let snapshot = instance.get_snapshot(is_gamemaster, Some(&player_id));
        drop(instance);

        self.registry.link_player(player_id.clone(), code.clone());
        {
            let mut sessions = self.sessions.write();
            let session = sessions.entry(conn_id).or_default();
            session.player_id = Some(player_id.clone());
            session.game_code = Some(code.clone());
            session.display_name = Some(display_name);
            session.is_gamemaster = is_gamemaster;
        }
        self.join_room(conn_id, code.clone());

        json!({
            "gameCode": code,
            "playerId": player_id,
            "isGamemaster": is_gamemaster,
            "state": snapshot,
        })
    }

    async fn handle_create(&self, conn_id: ConnectionId, payload: Value, now_ms: i64) -> Value {
        let Some(secret) = payload.get("gamemasterSecret").and_then(Value::as_str) else {
            return json!({"error": "gamemasterSecret is required"});
        };
        let mut cfg = GameConfig::new(secret.to_string());
        if let Some(s) = payload.get("spreadTimerSeconds").and_then(Value::as_u64) {
            cfg.spread_timer_ms = s * 1000;
        }
        if let Some(s) = payload.get("openTradingTimerSeconds").and_then(Value::as_u64) {
            cfg.open_trading_timer_ms = s * 1000;
        }
        if let Some(s) = payload.get("noTighterWindowSeconds").and_then(Value::as_u64) {
            cfg.no_tighter_window_ms = s * 1000;
        }

        let (code, game) = match self.registry.create_game_with_config(cfg, now_ms) {
            Ok(v) => v,
            Err(e) => return json!({"error": e.message()}),
        };

        let player_id = PlayerId::new();
        let mut instance = game.lock().await;
        instance.add_player(player_id.clone(), "Gamemaster".to_string(), true);
        let snapshot = instance.get_snapshot(true, Some(&player_id));
        drop(instance);

        self.registry.link_player(player_id.clone(), code.clone());
        {
            let mut sessions = self.sessions.write();
            let session = sessions.entry(conn_id).or_default();
            session.player_id = Some(player_id.clone());
            session.game_code = Some(code.clone());
            session.display_name = Some("Gamemaster".to_string());
            session.is_gamemaster = true;
        }
        self.join_room(conn_id, code.clone());

        self.transport.send_to(
            conn_id,
            OutboundEvent::new(
                "game:joined",
                json!({
                    "gameCode": code,
                    "playerId": player_id,
                    "isGamemaster": true,
                    "state": snapshot,
                }),
            ),
        );

        json!({ "gameCode": code })
    }

    async fn handle_leave(&self, conn_id: ConnectionId) {
        let identity = { self.sessions.read().get(&conn_id).and_then(Session::identity) };
        let Some((player_id, code)) = identity else { return };

        let display_name = self
            .sessions
            .read()
            .get(&conn_id)
            .and_then(|s| s.display_name.clone());

        if let Some(game) = self.registry.get(&code) {
            let mut instance = game.lock().await;
            instance.remove_player(&player_id);
            let remaining = instance.player_count();
            drop(instance);

            self.registry.unlink_player(&player_id);
            self.leave_room(conn_id, &code);

            self.transport.broadcast(
                &code,
                OutboundEvent::new(
                    "game:player_left",
                    json!({ "playerId": player_id, "displayName": display_name }),
                ),
            );

            if remaining == 0 {
                self.registry.remove_game(&code);
                self.supervisor.cancel_all(&code);
                self.last_stage.write().remove(&code);
            } else if let Some(game) = self.registry.get(&code) {
                let instance = game.lock().await;
                self.broadcast_state(&code, &instance);
            }
        }

        if let Some(session) = self.sessions.write().get_mut(&conn_id) {
            *session = Session::default();
        }
    }

    // ── generic player / GM action plumbing ──────────────────────────────

    async fn handle_player_action<F>(self: &Arc<Self>, conn_id: ConnectionId, now_ms: i64, op: F) -> Value
    where
        F: FnOnce(&mut GameInstance, &PlayerId, i64) -> crate::error::GameResult<Vec<GameEvent>>,
    {
        let identity = { self.sessions.read().get(&conn_id).and_then(Session::identity) };
        let Some((player_id, code)) = identity else { return Value::Null };
        let Some(game) = self.registry.get(&code) else { return Value::Null };

        let mut instance = game.lock().await;
        match op(&mut instance, &player_id, now_ms) {
            Ok(events) => self.apply_events(conn_id, &code, &game, &mut instance, events).await,
            Err(e) => {
                drop(instance);
                self.send_error(conn_id, e.message());
            }
        }
        Value::Null
    }

    async fn handle_gm_action<F>(self: &Arc<Self>, conn_id: ConnectionId, now_ms: i64, op: F) -> Value
    where
        F: FnOnce(&mut GameInstance, i64) -> crate::error::GameResult<Vec<GameEvent>>,
    {
        let identity = { self.sessions.read().get(&conn_id).and_then(Session::identity) };
        let Some((player_id, code)) = identity else { return Value::Null };
        let Some(game) = self.registry.get(&code) else { return Value::Null };

        let mut instance = game.lock().await;
        if !instance.is_gamemaster(&player_id) {
            return Value::Null; // Authorization: silently ignored at the gateway.
        }
        match op(&mut instance, now_ms) {
            Ok(events) => self.apply_events(conn_id, &code, &game, &mut instance, events).await,
            Err(e) => {
                drop(instance);
                self.send_error(conn_id, e.message());
            }
        }
        Value::Null
    }

    async fn handle_add_market(self: &Arc<Self>, conn_id: ConnectionId, payload: Value, now_ms: i64, derivative: bool) -> Value {
        let name = payload.get("name").and_then(Value::as_str).unwrap_or("").to_string();
        let description = payload.get("description").and_then(Value::as_str).unwrap_or("").to_string();
        let condition = payload.get("condition").and_then(Value::as_str).map(str::to_string);
        let weights: HashMap<MarketId, f64> = payload
            .get("underlyingWeights")
            .and_then(Value::as_object)
            .map(|obj| {
                obj.iter()
                    .filter_map(|(k, v)| v.as_f64().map(|v| (MarketId::from(k.as_str()), v)))
                    .collect()
            })
            .unwrap_or_default();

        self.handle_gm_action(conn_id, now_ms, move |game, now_ms| {
            let market = if derivative {
                crate::game::Market::derivative(MarketId::new(), name, description, weights, condition)
            } else {
                crate::game::Market::new(MarketId::new(), name, description)
            };
            Ok(game.add_market(market, now_ms))
        })
        .await
    }

    async fn handle_broadcast(self: &Arc<Self>, conn_id: ConnectionId, payload: Value, now_ms: i64) -> Value {
        let text = payload.get("text").and_then(Value::as_str).unwrap_or("").to_string();
        self.handle_gm_action(conn_id, now_ms, move |game, now_ms| {
            Ok(vec![game.push_announcement(text, now_ms)])
        })
        .await
    }

    async fn handle_stop(self: &Arc<Self>, conn_id: ConnectionId, _now_ms: i64) -> Value {
        let identity = { self.sessions.read().get(&conn_id).and_then(Session::identity) };
        let Some((player_id, code)) = identity else { return Value::Null };
        let Some(game) = self.registry.get(&code) else { return Value::Null };

        let mut instance = game.lock().await;
        if !instance.is_gamemaster(&player_id) {
            return Value::Null;
        }
        match instance.stop() {
            Ok(_) => {
                let snapshot = instance.get_snapshot(true, None);
                drop(instance);
                self.supervisor.cancel_all(&code);
                self.transport.broadcast(
                    &code,
                    OutboundEvent::new(
                        "game:ended",
                        json!({ "state": snapshot, "message": "the gamemaster has ended the game" }),
                    ),
                );
            }
            Err(e) => {
                drop(instance);
                self.send_error(conn_id, e.message());
            }
        }
        Value::Null
    }

    /// Shared tail of every mutating handler: splits timer-scheduling
    /// requests off to the supervisor, emits any data-bearing derived
    /// events immediately, then runs the per-recipient snapshot broadcast —
    /// all still inside the game's critical section.
    async fn apply_events(
        self: &Arc<Self>,
        _conn_id: ConnectionId,
        code: &GameCode,
        game: &SharedGame,
        instance: &mut GameInstance,
        events: Vec<GameEvent>,
    ) {
        let mut timer_events = Vec::new();
        for event in events {
            match event {
                GameEvent::ScheduleTimer { .. } | GameEvent::CancelTimer { .. } => {
                    timer_events.push(event);
                }
                other => {
                    if let Some(outbound) = self.build_outbound(code, &other) {
                        self.transport.broadcast(code, outbound);
                    }
                }
            }
        }
        self.broadcast_state(code, instance);

        if !timer_events.is_empty() {
            let sink = self.event_sink();
            self.supervisor.dispatch(code.clone(), game.clone(), timer_events, sink);
        }
    }

    /// Returns a sink the supervisor can call (without a lock in hand) once
    /// a timer fires on its own schedule, later than the request that
    /// scheduled it.
    fn event_sink(self: &Arc<Self>) -> EventSink {
        let this = self.clone();
        Arc::new(move |code, event| {
            let this = this.clone();
            tokio::spawn(async move {
                this.handle_deferred_event(code, event).await;
            });
        })
    }

    async fn handle_deferred_event(&self, code: GameCode, event: GameEvent) {
        match event {
            GameEvent::ScheduleTimer { .. } | GameEvent::CancelTimer { .. } => {}
            other => {
                if let Some(outbound) = self.build_outbound(&code, &other) {
                    self.transport.broadcast(&code, outbound);
                }
                if let Some(game) = self.registry.get(&code) {
                    let instance = game.lock().await;
                    self.broadcast_state(&code, &instance);
                }
            }
        }
    }

    fn build_outbound(&self, code: &GameCode, event: &GameEvent) -> Option<OutboundEvent> {
        match event {
            GameEvent::StageChanged { stage, round_index } => {
                self.last_stage.write().insert(code.clone(), *stage);
                Some(OutboundEvent::new(
                    "game:stage_changed",
                    json!({ "stage": stage, "round": round_index }),
                ))
            }
            GameEvent::SpreadUpdate { best_spread, best_spread_player_id, submissions } => {
                Some(OutboundEvent::new(
                    "game:spread_update",
                    json!({
                        "bestSpread": best_spread,
                        "bestSpreadPlayerId": best_spread_player_id,
                        "submissions": submissions,
                    }),
                ))
            }
            GameEvent::MarketMakerQuoted => None,
            GameEvent::Trade(trade) => Some(OutboundEvent::new("game:trade", json!({ "trade": trade }))),
            GameEvent::OrderBookChanged(snapshot) => {
                Some(OutboundEvent::new("game:order_book", json!({ "orderBook": snapshot })))
            }
            GameEvent::Announcement { id, text, at } => {
                Some(OutboundEvent::new("game:announcement", json!({ "id": id, "text": text, "at": at })))
            }
            GameEvent::TimerTick { ends_at, seconds_remaining } => {
                let stage = self.last_stage.read().get(code).copied();
                Some(OutboundEvent::new(
                    "game:timer",
                    json!({ "stage": stage, "endsAt": ends_at, "secondsRemaining": seconds_remaining }),
                ))
            }
            GameEvent::GameEnded { .. } => None,
            GameEvent::ScheduleTimer { .. } | GameEvent::CancelTimer { .. } => None,
        }
    }

    fn broadcast_state(&self, code: &GameCode, instance: &GameInstance) {
        let members: Vec<ConnectionId> = self
            .room_members
            .read()
            .get(code)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        let sessions = self.sessions.read();
        for conn_id in members {
            let Some(session) = sessions.get(&conn_id) else { continue };
            let snapshot = instance.get_snapshot(session.is_gamemaster, session.player_id.as_ref());
            self.transport.send_to(conn_id, OutboundEvent::new("game:state", json!({ "state": snapshot })));
        }
    }

    fn send_error(&self, conn_id: ConnectionId, message: &str) {
        self.transport.send_to(conn_id, OutboundEvent::new("game:error", json!({ "message": message })));
    }

    /// Delivers the ack-correlated result of an inbound event back to its
    /// sender, keyed by the id the client supplied in its envelope.
    pub fn send_ack(&self, conn_id: ConnectionId, id: Value, result: Value) {
        self.transport.send_to(conn_id, OutboundEvent::new("ack", json!({ "id": id, "result": result })));
    }

    fn join_room(&self, conn_id: ConnectionId, code: GameCode) {
        self.room_members.write().entry(code.clone()).or_default().insert(conn_id);
        self.transport.join_room(conn_id, code);
    }

    fn leave_room(&self, conn_id: ConnectionId, code: &GameCode) {
        if let Some(members) = self.room_members.write().get_mut(code) {
            members.remove(&conn_id);
        }
        self.transport.leave_room(conn_id, code);
    }
}

fn payload_f64(payload: &Value, key: &str) -> Option<f64> {
    payload.get(key).and_then(Value::as_f64)
}

fn payload_u32(payload: &Value, key: &str) -> Option<u32> {
    payload.get(key).and_then(Value::as_u64).map(|v| v as u32)
}
