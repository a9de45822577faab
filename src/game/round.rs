use serde::Serialize;

use crate::ids::{MarketId, PlayerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    SpreadQuoting,
    MarketMakerQuote,
    ForcedTrading,
    OpenTrading,
    RoundEnd,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpreadSubmission {
    pub player_id: PlayerId,
    pub width: f64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketMakerQuote {
    pub bid: f64,
    pub ask: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundState {
    pub round_index: u32,
    pub stage: Stage,
    pub market_id: MarketId,
    pub best_spread: Option<f64>,
    pub best_spread_player_id: Option<PlayerId>,
    pub submissions: Vec<SpreadSubmission>,
    pub mm_quote: Option<MarketMakerQuote>,
    pub stage_ends_at: Option<i64>,
    pub no_tighter_until: Option<i64>,
}

impl RoundState {
    pub fn new(round_index: u32, market_id: MarketId) -> Self {
        Self {
            round_index,
            stage: Stage::SpreadQuoting,
            market_id,
            best_spread: None,
            best_spread_player_id: None,
            submissions: Vec::new(),
            mm_quote: None,
            stage_ends_at: None,
            no_tighter_until: None,
        }
    }
}
