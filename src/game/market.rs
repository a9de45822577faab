use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::ids::MarketId;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Market {
    pub id: MarketId,
    pub name: String,
    pub description: String,
    /// Present for a derivative: a weighted sum over other markets' true
    /// values. Weight references may be nested.
    pub underlying_weights: Option<HashMap<MarketId, f64>>,
    pub condition: Option<String>,
}

impl Market {
    pub fn new(id: MarketId, name: String, description: String) -> Self {
        Self {
            id,
            name,
            description,
            underlying_weights: None,
            condition: None,
        }
    }

    pub fn derivative(
        id: MarketId,
        name: String,
        description: String,
        underlying_weights: HashMap<MarketId, f64>,
        condition: Option<String>,
    ) -> Self {
        Self {
            id,
            name,
            description,
            underlying_weights: Some(underlying_weights),
            condition,
        }
    }
}

/// Resolves a market's true value, recursing through derivative weights.
/// Returns `None` ("undefined") if any referenced underlying is missing or
/// itself undefined. A visited-set guards against cyclic definitions —
/// cycles are not expected, but if present resolve to `None` rather than
/// looping forever.
pub fn resolve_true_value(
    markets: &HashMap<MarketId, Market>,
    true_values: &HashMap<MarketId, f64>,
    market_id: &MarketId,
) -> Option<f64> {
    let mut visited = HashSet::new();
    resolve_inner(markets, true_values, market_id, &mut visited)
}

fn resolve_inner(
    markets: &HashMap<MarketId, Market>,
    true_values: &HashMap<MarketId, f64>,
    market_id: &MarketId,
    visited: &mut HashSet<MarketId>,
) -> Option<f64> {
    if let Some(v) = true_values.get(market_id) {
        return Some(*v);
    }
    if !visited.insert(market_id.clone()) {
        return None; // cycle
    }
    let market = markets.get(market_id)?;
    let weights = market.underlying_weights.as_ref()?;

    let mut total = 0.0;
    for (underlying_id, weight) in weights {
        let underlying_value = resolve_inner(markets, true_values, underlying_id, visited)?;
        total += weight * underlying_value;
    }
    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mkt(id: &str) -> Market {
        Market::new(MarketId::from(id), id.to_string(), String::new())
    }

    #[test]
    fn s6_derivative_valuation() {
        let mut markets = HashMap::new();
        markets.insert(MarketId::from("A"), mkt("A"));
        markets.insert(MarketId::from("B"), mkt("B"));
        let mut weights = HashMap::new();
        weights.insert(MarketId::from("A"), 1.0);
        weights.insert(MarketId::from("B"), -2.0);
        markets.insert(
            MarketId::from("D"),
            Market::derivative(MarketId::from("D"), "D".into(), String::new(), weights, None),
        );

        let mut true_values = HashMap::new();
        true_values.insert(MarketId::from("A"), 10.0);
        true_values.insert(MarketId::from("B"), 4.0);

        let value = resolve_true_value(&markets, &true_values, &MarketId::from("D"));
        assert_eq!(value, Some(2.0));
    }

    #[test]
    fn missing_underlying_is_undefined() {
        let mut markets = HashMap::new();
        let mut weights = HashMap::new();
        weights.insert(MarketId::from("missing"), 1.0);
        markets.insert(
            MarketId::from("D"),
            Market::derivative(MarketId::from("D"), "D".into(), String::new(), weights, None),
        );
        let true_values = HashMap::new();
        assert_eq!(
            resolve_true_value(&markets, &true_values, &MarketId::from("D")),
            None
        );
    }

    #[test]
    fn cyclic_definition_resolves_undefined_and_terminates() {
        let mut markets = HashMap::new();
        let mut weights_a = HashMap::new();
        weights_a.insert(MarketId::from("B"), 1.0);
        markets.insert(
            MarketId::from("A"),
            Market::derivative(MarketId::from("A"), "A".into(), String::new(), weights_a, None),
        );
        let mut weights_b = HashMap::new();
        weights_b.insert(MarketId::from("A"), 1.0);
        markets.insert(
            MarketId::from("B"),
            Market::derivative(MarketId::from("B"), "B".into(), String::new(), weights_b, None),
        );
        let true_values = HashMap::new();
        assert_eq!(
            resolve_true_value(&markets, &true_values, &MarketId::from("A")),
            None
        );
    }
}
