//! Price-time priority limit order book for exactly one market.
//!
//! Generalizes the teacher's `systems::market` matching loop (which hard-codes
//! an escrow rule) behind an externally-pluggable fill validator, since the
//! game instance needs to gate fills on a live exposure limit instead.
use crate::error::{GameError, GameResult};
use crate::ids::{MarketId, OrderId, PlayerId, TradeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Side {
    Bid,
    Ask,
}

#[derive(Debug, Clone)]
pub struct Order {
    pub id: OrderId,
    pub market_id: MarketId,
    pub player_id: PlayerId,
    pub side: Side,
    pub price: f64,
    pub quantity: u32,
    pub remaining: u32,
    pub created_at: i64,
    /// Monotonic insertion sequence, used for time-priority tie-breaking and
    /// to decide passive-price priority when a crossing order lands.
    pub seq: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub id: TradeId,
    pub market_id: MarketId,
    pub buyer_id: PlayerId,
    pub seller_id: PlayerId,
    pub bid_order_id: Option<OrderId>,
    pub ask_order_id: Option<OrderId>,
    pub price: f64,
    pub quantity: u32,
    pub timestamp: i64,
}

/// A validator consulted before each prospective fill. Returning `false`
/// stops matching immediately; the crossing order remains resting with
/// whatever quantity it matched before the refusal.
pub type FillValidator<'a> = dyn Fn(&PlayerId, &PlayerId, &MarketId, u32) -> bool + 'a;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceLevel {
    pub price: f64,
    pub quantity: u32,
    pub player_ids: Vec<PlayerId>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderBookSnapshot {
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub last_trade_price: Option<f64>,
}

use serde::Serialize;

pub struct OrderBook {
    pub market_id: MarketId,
    bids: Vec<Order>,
    asks: Vec<Order>,
    next_seq: u64,
    last_trade_price: Option<f64>,
}

impl OrderBook {
    pub fn new(market_id: MarketId) -> Self {
        Self {
            market_id,
            bids: Vec::new(),
            asks: Vec::new(),
            next_seq: 0,
            last_trade_price: None,
        }
    }

    /// Inserts a new order and runs the matching loop. Returns the inserted
    /// order (remaining-quantity reflects any immediate matches) and the
    /// ordered list of trades produced.
    pub fn add_order(
        &mut self,
        player_id: PlayerId,
        side: Side,
        price: f64,
        quantity: u32,
        now_ms: i64,
        validator: Option<&FillValidator>,
    ) -> GameResult<(Order, Vec<Trade>)> {
        if price <= 0.0 || quantity == 0 {
            return Err(GameError::Validation("invalid order".to_string()));
        }

        let order = Order {
            id: OrderId::new(),
            market_id: self.market_id.clone(),
            player_id: player_id.clone(),
            side,
            price,
            quantity,
            remaining: quantity,
            created_at: now_ms,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        let order_id = order.id.clone();

        match side {
            Side::Bid => {
                self.bids.push(order);
                sort_bids(&mut self.bids);
            }
            Side::Ask => {
                self.asks.push(order);
                sort_asks(&mut self.asks);
            }
        }

        let trades = self.run_matching(validator);

        let resting = self
            .bids
            .iter()
            .chain(self.asks.iter())
            .find(|o| o.id == order_id)
            .cloned();
        let result_order = match resting {
            Some(o) => o,
            None => {
                // Fully filled and removed from the book.
                Order {
                    id: order_id,
                    market_id: self.market_id.clone(),
                    player_id,
                    side,
                    price,
                    quantity,
                    remaining: 0,
                    created_at: now_ms,
                    seq: 0,
                }
            }
        };

        Ok((result_order, trades))
    }

    /// Removes a resting order. Returns `true` if it was found and removed.
    pub fn cancel_order(&mut self, order_id: &OrderId) -> bool {
        if let Some(idx) = self.bids.iter().position(|o| &o.id == order_id) {
            self.bids.remove(idx);
            return true;
        }
        if let Some(idx) = self.asks.iter().position(|o| &o.id == order_id) {
            self.asks.remove(idx);
            return true;
        }
        false
    }

    pub fn get_spread(&self) -> Option<f64> {
        match (self.bids.first(), self.asks.first()) {
            (Some(bid), Some(ask)) => Some(ask.price - bid.price),
            _ => None,
        }
    }

    pub fn get_snapshot(&self) -> OrderBookSnapshot {
        OrderBookSnapshot {
            bids: aggregate_levels(&self.bids),
            asks: aggregate_levels(&self.asks),
            last_trade_price: self.last_trade_price,
        }
    }

    /// While both sides are non-empty and crossed, fill at the resting
    /// (earlier-inserted) order's price. No wall clock is consulted here —
    /// only insertion sequence — so matching is deterministic given
    /// identical inputs.
    fn run_matching(&mut self, validator: Option<&FillValidator>) -> Vec<Trade> {
        let mut trades = Vec::new();

        loop {
            let (Some(best_bid), Some(best_ask)) = (self.bids.first(), self.asks.first()) else {
                break;
            };
            if best_bid.price < best_ask.price {
                break;
            }

            let qty = best_bid.remaining.min(best_ask.remaining);

            if let Some(v) = validator {
                if !v(&best_bid.player_id, &best_ask.player_id, &self.market_id, qty) {
                    break;
                }
            }

            let (exec_price, buyer_id, seller_id, bid_id, ask_id) = {
                let bid = &self.bids[0];
                let ask = &self.asks[0];
                let exec_price = if bid.seq < ask.seq { bid.price } else { ask.price };
                (
                    exec_price,
                    bid.player_id.clone(),
                    ask.player_id.clone(),
                    bid.id.clone(),
                    ask.id.clone(),
                )
            };

            self.bids[0].remaining -= qty;
            self.asks[0].remaining -= qty;
            self.last_trade_price = Some(exec_price);

            trades.push(Trade {
                id: TradeId::new(),
                market_id: self.market_id.clone(),
                buyer_id,
                seller_id,
                bid_order_id: Some(bid_id),
                ask_order_id: Some(ask_id),
                price: exec_price,
                quantity: qty,
                timestamp: 0,
            });

            if self.bids[0].remaining == 0 {
                self.bids.remove(0);
            }
            if self.asks.first().map(|a| a.remaining) == Some(0) {
                self.asks.remove(0);
            }
        }

        trades
    }
}

fn sort_bids(bids: &mut [Order]) {
    bids.sort_by(|a, b| {
        b.price
            .partial_cmp(&a.price)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.seq.cmp(&b.seq))
    });
}

fn sort_asks(asks: &mut [Order]) {
    asks.sort_by(|a, b| {
        a.price
            .partial_cmp(&b.price)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.seq.cmp(&b.seq))
    });
}

/// `orders` arrives pre-sorted in the side's canonical order, so same-price
/// orders are already contiguous; a single linear pass preserves that order
/// while merging consecutive equal prices into one level.
fn aggregate_levels(orders: &[Order]) -> Vec<PriceLevel> {
    let mut levels: Vec<PriceLevel> = Vec::new();
    for o in orders {
        match levels.last_mut() {
            Some(level) if level.price == o.price => {
                level.quantity += o.remaining;
                if !level.player_ids.contains(&o.player_id) {
                    level.player_ids.push(o.player_id.clone());
                }
            }
            _ => levels.push(PriceLevel {
                price: o.price,
                quantity: o.remaining,
                player_ids: vec![o.player_id.clone()],
            }),
        }
    }
    levels
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> OrderBook {
        OrderBook::new(MarketId::from("m1"))
    }

    fn pid(s: &str) -> PlayerId {
        PlayerId::from(s)
    }

    #[test]
    fn rejects_non_positive_price_or_quantity() {
        let mut b = book();
        assert!(b.add_order(pid("a"), Side::Bid, 0.0, 5, 0, None).is_err());
        assert!(b.add_order(pid("a"), Side::Bid, 5.0, 0, 0, None).is_err());
    }

    #[test]
    fn s2_price_time_priority() {
        let mut b = book();
        let (_ask1, t1) = b
            .add_order(pid("seller1"), Side::Ask, 100.0, 5, 0, None)
            .unwrap();
        assert!(t1.is_empty());
        let (_ask2, t2) = b
            .add_order(pid("seller2"), Side::Ask, 100.0, 5, 0, None)
            .unwrap();
        assert!(t2.is_empty());
        let (_bid, trades) = b
            .add_order(pid("buyer"), Side::Bid, 100.0, 5, 0, None)
            .unwrap();

        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].price, 100.0);
        assert_eq!(trades[0].quantity, 5);
        assert_eq!(trades[0].seller_id, pid("seller1"));

        let snap = b.get_snapshot();
        assert_eq!(snap.asks.len(), 1);
        assert_eq!(snap.asks[0].quantity, 5);
    }

    #[test]
    fn s3_crossing_buyer_lifts_older_ask_at_passive_price() {
        let mut b = book();
        b.add_order(pid("seller"), Side::Ask, 100.0, 3, 0, None)
            .unwrap();
        let (_bid, trades) = b
            .add_order(pid("buyer"), Side::Bid, 102.0, 3, 0, None)
            .unwrap();

        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].price, 100.0);
        let snap = b.get_snapshot();
        assert!(snap.bids.is_empty());
        assert!(snap.asks.is_empty());
    }

    #[test]
    fn s4_validator_refusal_stops_matching_and_keeps_order_resting() {
        let mut b = book();
        b.add_order(pid("seller"), Side::Ask, 100.0, 3, 0, None)
            .unwrap();
        let validator = |_buyer: &PlayerId, _seller: &PlayerId, _m: &MarketId, _qty: u32| false;
        let (order, trades) = b
            .add_order(pid("buyer"), Side::Bid, 100.0, 3, 0, Some(&validator))
            .unwrap();

        assert!(trades.is_empty());
        assert_eq!(order.remaining, 3);
        let snap = b.get_snapshot();
        assert_eq!(snap.bids.len(), 1);
        assert_eq!(snap.asks.len(), 1);
    }

    #[test]
    fn conservation_levels_sum_to_resting_quantity() {
        let mut b = book();
        b.add_order(pid("a"), Side::Bid, 99.0, 4, 0, None).unwrap();
        b.add_order(pid("b"), Side::Bid, 99.0, 6, 0, None).unwrap();
        b.add_order(pid("c"), Side::Bid, 98.0, 2, 0, None).unwrap();

        let snap = b.get_snapshot();
        let total: u32 = snap.bids.iter().map(|l| l.quantity).sum();
        assert_eq!(total, 12);
        assert_eq!(snap.bids[0].price, 99.0);
        assert_eq!(snap.bids[0].player_ids.len(), 2);
    }

    #[test]
    fn spread_is_ask_minus_bid() {
        let mut b = book();
        assert_eq!(b.get_spread(), None);
        b.add_order(pid("a"), Side::Bid, 99.0, 1, 0, None).unwrap();
        assert_eq!(b.get_spread(), None);
        b.add_order(pid("b"), Side::Ask, 101.0, 1, 0, None).unwrap();
        assert_eq!(b.get_spread(), Some(2.0));
    }

    #[test]
    fn cancel_removes_resting_order_only() {
        let mut b = book();
        let (order, _) = b.add_order(pid("a"), Side::Bid, 99.0, 1, 0, None).unwrap();
        assert!(b.cancel_order(&order.id));
        assert!(!b.cancel_order(&order.id));
        assert_eq!(b.get_snapshot().bids.len(), 0);
    }

    #[test]
    fn matching_is_deterministic_given_identical_insertion_sequence() {
        fn run() -> Vec<(f64, u32)> {
            let mut b = book();
            b.add_order(pid("s1"), Side::Ask, 100.0, 5, 0, None).unwrap();
            b.add_order(pid("s2"), Side::Ask, 100.0, 5, 0, None).unwrap();
            let (_, trades) = b
                .add_order(pid("buy"), Side::Bid, 100.0, 7, 0, None)
                .unwrap();
            trades.iter().map(|t| (t.price, t.quantity)).collect()
        }
        assert_eq!(run(), run());
    }
}
