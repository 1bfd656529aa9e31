pub mod api;
pub mod commands;
pub mod config;
pub mod detector;
pub mod notifier;
pub mod rate_limit;
pub mod scheduler;
pub mod state;
pub mod types;

#[cfg(test)]
pub(crate) mod test_helpers;

/// Character listing endpoint (public profiles only, no auth required).
pub const CHARACTERS_URL: &str = "https://www.pathofexile.com/character-window/get-characters";

/// Identifying User-Agent sent with every upstream request.
pub const USER_AGENT: &str = concat!("poe-level-tracker/", env!("CARGO_PKG_VERSION"));
