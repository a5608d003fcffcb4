//! Telegram bot that moves photo albums between Telegram chats and VK.

/// Batch coalescing of grouped messages
pub mod album;
/// Telegram bot implementation
pub mod bot;
/// Configuration and settings
pub mod config;
/// Shared HTTP session and file downloads
pub mod http;
/// Utility functions
pub mod utils;
/// VK API client
pub mod vk;

#[cfg(test)]
mod testing;
