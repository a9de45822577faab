//! Opaque globally-unique identifiers. Each kind is a thin newtype over
//! `String` so a `MarketId` can never be passed where an `OrderId` is
//! expected, while still serializing as a bare string on the wire.
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }

            fn generate(counter: &'static AtomicU64) -> Self {
                let n = counter.fetch_add(1, Ordering::Relaxed);
                Self(format!(concat!($prefix, "{}"), n))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(PlayerId, "player_");
string_id!(MarketId, "market_");
string_id!(OrderId, "order_");
string_id!(TradeId, "trade_");

static NEXT_PLAYER_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_MARKET_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_ORDER_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_TRADE_ID: AtomicU64 = AtomicU64::new(1);

impl PlayerId {
    pub fn new() -> Self {
        Self::generate(&NEXT_PLAYER_ID)
    }
}

impl MarketId {
    pub fn new() -> Self {
        Self::generate(&NEXT_MARKET_ID)
    }
}

impl OrderId {
    pub fn new() -> Self {
        Self::generate(&NEXT_ORDER_ID)
    }
}

impl TradeId {
    pub fn new() -> Self {
        Self::generate(&NEXT_TRADE_ID)
    }
}

/// Six-character case-insensitive game code drawn from an unambiguous
/// alphabet; canonical storage form is uppercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GameCode(pub String);

impl GameCode {
    pub fn canonicalize(input: &str) -> Self {
        Self(input.to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Draws a random 6-character code from the unambiguous alphabet.
    /// Not cryptographically secure; collision avoidance happens in the
    /// registry via retry, per spec Non-goals.
    pub fn random() -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let code: String = (0..crate::config::GAME_CODE_LENGTH)
            .map(|_| {
                let idx = rng.gen_range(0..crate::config::GAME_CODE_ALPHABET.len());
                crate::config::GAME_CODE_ALPHABET[idx] as char
            })
            .collect();
        Self(code)
    }
}

impl fmt::Display for GameCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
