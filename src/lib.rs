pub mod bot;
pub mod chain;
pub mod config;
pub mod database;
pub mod error;
pub mod events;
pub mod execution;
pub mod models;
pub mod monitoring;
pub mod networks;
pub mod providers;
pub mod strategy;

pub use bot::LiquidityBot;
pub use config::BotConfig;
pub use events::BotEvent;
pub use models::*;
