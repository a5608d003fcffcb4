/// Media group coalescing for Telegram messages
pub mod album;
/// Command and message handlers
pub mod handlers;
/// Telegram calls with automatic retry
pub mod resilient;
/// Dispatcher setup and endpoint wiring
pub mod runner;
/// User state and dialogue management
pub mod state;

pub use runner::run_bot;
