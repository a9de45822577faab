pub mod config;
pub mod error;
pub mod game;
pub mod gateway;
pub mod ids;
pub mod orderbook;
pub mod registry;
pub mod supervisor;
pub mod transport;
