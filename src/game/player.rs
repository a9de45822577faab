use std::collections::HashMap;

use serde::Serialize;

use crate::config;
use crate::ids::{MarketId, PlayerId};

/// Signed position in one market. `avg_cost` is only meaningful while
/// `quantity != 0`.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub quantity: i64,
    pub avg_cost: f64,
}

impl Position {
    /// Applies a signed fill (`delta` positive = bought/long, negative =
    /// sold/shorted) at `price`, recomputing the quantity-weighted average
    /// cost. Used for the *active* side of a fill; the passive (market
    /// maker / resting-order) side updates quantity only — see spec §4.B.
    pub fn apply_fill(&mut self, delta: i64, price: f64) {
        let new_quantity = self.quantity + delta;
        // Only accumulate a weighted average while adding to an existing
        // directional position (or opening a flat one); a fill that reduces
        // or flips the position doesn't need a meaningful blended cost for
        // settlement, which uses true-value × quantity, not avg_cost.
        if self.quantity == 0 || self.quantity.signum() == delta.signum() {
            let prior_qty = self.quantity.unsigned_abs() as f64;
            let fill_qty = delta.unsigned_abs() as f64;
            let total_qty = prior_qty + fill_qty;
            if total_qty > 0.0 {
                self.avg_cost = (self.avg_cost * prior_qty + price * fill_qty) / total_qty;
            }
        }
        self.quantity = new_quantity;
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerState {
    pub id: PlayerId,
    pub display_name: String,
    pub cash: f64,
    pub positions: HashMap<MarketId, Position>,
    pub round_pnl: f64,
    pub total_pnl: f64,
    pub is_market_maker: bool,
    pub is_gamemaster: bool,
}

impl PlayerState {
    pub fn new(id: PlayerId, display_name: String, is_gamemaster: bool) -> Self {
        Self {
            id,
            display_name,
            cash: config::INITIAL_CASH,
            positions: HashMap::new(),
            round_pnl: 0.0,
            total_pnl: 0.0,
            is_market_maker: false,
            is_gamemaster,
        }
    }

    pub fn position_mut(&mut self, market_id: &MarketId) -> &mut Position {
        self.positions.entry(market_id.clone()).or_default()
    }
}
