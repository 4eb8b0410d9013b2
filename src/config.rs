//! Process configuration read from the environment (and `.env`).

use crate::{
  auth::{JwtAuth, JwtAuthOptions},
  error::ConfigError,
  rate_limit::MessageLimits,
  rating::{KFactorPolicy, DEFAULT_BASELINE_RATING, DEFAULT_K_FACTOR},
};
use std::{str::FromStr, time::Duration};

/// Per-match tuning shared by every session.
#[derive(Debug, Clone)]
pub struct MatchSettings {
  /// Inactivity window after which the side on move forfeits.
  pub abandon_timeout: Duration,
  /// Total thinking time allotted to each player.
  pub game_time: Duration,
  /// Maximum chat message length in characters, after trimming.
  pub chat_max_chars: usize,
  pub k_factor: KFactorPolicy,
  pub baseline_rating: i32,
}

impl Default for MatchSettings {
  fn default() -> Self {
    Self {
      abandon_timeout: Duration::from_secs(60),
      game_time: Duration::from_secs(10 * 60 * 60),
      chat_max_chars: 500,
      k_factor: KFactorPolicy::Fixed(DEFAULT_K_FACTOR),
      baseline_rating: DEFAULT_BASELINE_RATING,
    }
  }
}

#[derive(Debug, Clone)]
pub struct Config {
  pub bind_address: String,
  pub port: u16,
  pub jwt_secret: String,
  /// Expected `iss` claim; unchecked when unset.
  pub jwt_issuer: Option<String>,
  /// Allowed clock skew when checking token expiry.
  pub jwt_leeway_secs: u64,
  /// Admit connections with an invalid token under a generated guest identity.
  pub allow_guests: bool,
  pub match_settings: MatchSettings,
  pub limits: MessageLimits,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      bind_address: "0.0.0.0".to_string(),
      port: 8080,
      jwt_secret: "your_secret_key".to_string(),
      jwt_issuer: None,
      jwt_leeway_secs: 0,
      allow_guests: true,
      match_settings: MatchSettings::default(),
      limits: MessageLimits::default(),
    }
  }
}

impl Config {
  /// Load `.env` if present, then read `ROOKERY_*` variables over the defaults.
  pub fn from_env() -> Result<Self, ConfigError> {
    dotenv::dotenv().ok();
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
  where
    F: Fn(&str) -> Option<String>,
  {
    let mut config = Config::default();

    if let Some(addr) = lookup("ROOKERY_BIND_ADDRESS") {
      config.bind_address = addr;
    }
    if let Some(secret) = lookup("ROOKERY_JWT_SECRET") {
      config.jwt_secret = secret;
    }
    config.jwt_issuer = lookup("ROOKERY_JWT_ISSUER").filter(|iss| !iss.trim().is_empty());
    config.jwt_leeway_secs = parse_or(&lookup, "ROOKERY_JWT_LEEWAY_SECS", config.jwt_leeway_secs)?;
    config.port = parse_or(&lookup, "ROOKERY_PORT", config.port)?;
    config.allow_guests = parse_or(&lookup, "ROOKERY_ALLOW_GUESTS", config.allow_guests)?;

    let settings = &mut config.match_settings;
    settings.abandon_timeout = Duration::from_secs(parse_or(
      &lookup,
      "ROOKERY_ABANDON_TIMEOUT_SECS",
      settings.abandon_timeout.as_secs(),
    )?);
    settings.game_time = Duration::from_secs(parse_or(
      &lookup,
      "ROOKERY_GAME_TIME_SECS",
      settings.game_time.as_secs(),
    )?);
    settings.chat_max_chars = parse_or(&lookup, "ROOKERY_CHAT_MAX_CHARS", settings.chat_max_chars)?;
    settings.baseline_rating = parse_or(&lookup, "ROOKERY_BASELINE_RATING", settings.baseline_rating)?;
    if let Some(raw) = lookup("ROOKERY_K_FACTOR") {
      settings.k_factor = parse_k_factor(&raw).ok_or(ConfigError::Invalid {
        var: "ROOKERY_K_FACTOR",
        value: raw,
      })?;
    }

    let limits = &mut config.limits;
    limits.max_size_bytes = parse_or(&lookup, "ROOKERY_MAX_MESSAGE_BYTES", limits.max_size_bytes)?;
    limits.max_messages_per_window = parse_or(
      &lookup,
      "ROOKERY_MAX_MESSAGES_PER_WINDOW",
      limits.max_messages_per_window,
    )?;
    limits.window_duration = Duration::from_millis(parse_or(
      &lookup,
      "ROOKERY_RATE_WINDOW_MS",
      limits.window_duration.as_millis() as u64,
    )?);
    limits.ban_duration = Duration::from_secs(parse_or(
      &lookup,
      "ROOKERY_BAN_SECS",
      limits.ban_duration.as_secs(),
    )?);

    Ok(config)
  }

  pub fn jwt_auth(&self) -> JwtAuth {
    JwtAuth::with_options(
      &self.jwt_secret,
      JwtAuthOptions {
        leeway: self.jwt_leeway_secs,
        issuer: self.jwt_issuer.clone(),
      },
    )
  }

  pub fn listen_addr(&self) -> String {
    format!("{}:{}", self.bind_address, self.port)
  }
}

/// `adaptive`, `fixed:<k>` or a bare integer.
fn parse_k_factor(raw: &str) -> Option<KFactorPolicy> {
  let raw = raw.trim();
  if raw.eq_ignore_ascii_case("adaptive") {
    return Some(KFactorPolicy::Adaptive);
  }
  let k = raw.strip_prefix("fixed:").unwrap_or(raw);
  k.parse().ok().filter(|k| *k > 0).map(KFactorPolicy::Fixed)
}

fn parse_or<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
  F: Fn(&str) -> Option<String>,
  T: FromStr,
{
  match lookup(var) {
    Some(value) => value
      .trim()
      .parse()
      .map_err(|_| ConfigError::Invalid { var, value }),
    None => Ok(default),
  }
}
