//! Real-time two-player match orchestration over WebSockets.
//!
//! A [`MatchCoordinator`] pairs players, routes their moves to per-match
//! [`MatchSession`]s and relays chat. Sessions run an abandonment watchdog and
//! a move clock, persist through a [`MatchStore`] and settle Elo ratings once a
//! match ends. Move legality is delegated to a [`RulesEngine`].

pub mod auth;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod protocol;
pub mod rate_limit;
pub mod rating;
pub mod registry;
pub mod rules;
pub mod server;
pub mod session;
pub mod store;

#[cfg(test)]
mod testing;

pub use auth::JwtAuth;
pub use config::{Config, MatchSettings};
pub use coordinator::MatchCoordinator;
pub use error::{ConfigError, RulesError, SessionError, StoreError};
pub use protocol::{ClientMessage, ServerMessage};
pub use registry::{Connection, ConnectionRegistry};
pub use rules::{ChessRules, RulesEngine};
pub use server::Server;
pub use session::MatchSession;
pub use store::{InMemoryStore, MatchStore};

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Start the chess match server configured from the environment.
pub async fn run() -> anyhow::Result<()> {
  let config = Config::from_env()?;

  tracing_subscriber::registry()
    .with(
      tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("{}=debug,tower_http=debug", env!("CARGO_CRATE_NAME")).into()
      }),
    )
    .with(tracing_subscriber::fmt::layer())
    .init();

  let store = Arc::new(InMemoryStore::new(config.match_settings.baseline_rating));
  let coordinator = MatchCoordinator::new(
    ChessRules,
    store,
    ConnectionRegistry::new(),
    config.match_settings.clone(),
  );

  Server::new(coordinator)
    .with_auth(config.jwt_auth())
    .with_limits(config.limits.clone())
    .allow_guests(config.allow_guests)
    .listen(&config.listen_addr())
    .await
}
