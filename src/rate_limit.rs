//! Per-identity inbound flood protection.
//!
//! Over-limit frames are dropped; the connection itself stays open.

use std::{
  collections::{HashMap, VecDeque},
  sync::Arc,
  time::Duration,
};
use thiserror::Error;
use tokio::{sync::Mutex, time::Instant};

/// Configuration for inbound limits.
#[derive(Debug, Clone)]
pub struct MessageLimits {
  /// Maximum frame size in bytes
  pub max_size_bytes: usize,
  /// Maximum frames per window
  pub max_messages_per_window: u32,
  pub window_duration: Duration,
  /// How long an identity is muted after exceeding the window
  pub ban_duration: Duration,
}

impl Default for MessageLimits {
  fn default() -> Self {
    Self {
      max_size_bytes: 16 * 1024,
      max_messages_per_window: 20,
      window_duration: Duration::from_secs(1),
      ban_duration: Duration::from_secs(30),
    }
  }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Rejection {
  #[error("frame too large: {size} bytes (max {max})")]
  TooLarge { size: usize, max: usize },

  #[error("rate limit exceeded: {0} frames per window")]
  Flooding(u32),

  #[error("muted until the ban expires")]
  Muted,
}

#[derive(Debug, Default)]
struct Window {
  seen: VecDeque<Instant>,
  muted_until: Option<Instant>,
}

impl Window {
  fn is_muted(&self, now: Instant) -> bool {
    self.muted_until.is_some_and(|until| now < until)
  }

  fn expire(&mut self, now: Instant, window: Duration) {
    while self
      .seen
      .front()
      .is_some_and(|&t| now.duration_since(t) >= window)
    {
      self.seen.pop_front();
    }
  }
}

/// Sliding-window limiter keyed by identity. Clones share state.
#[derive(Clone)]
pub struct RateLimiter {
  limits: MessageLimits,
  windows: Arc<Mutex<HashMap<String, Window>>>,
}

impl RateLimiter {
  pub fn new(limits: MessageLimits) -> Self {
    Self {
      limits,
      windows: Arc::new(Mutex::new(HashMap::new())),
    }
  }

  /// Account for one inbound frame of `size` bytes from `identity`.
  pub async fn check(&self, identity: &str, size: usize) -> Result<(), Rejection> {
    if size > self.limits.max_size_bytes {
      return Err(Rejection::TooLarge {
        size,
        max: self.limits.max_size_bytes,
      });
    }

    let now = Instant::now();
    let mut windows = self.windows.lock().await;
    let window = windows.entry(identity.to_string()).or_default();

    if window.is_muted(now) {
      return Err(Rejection::Muted);
    }

    window.expire(now, self.limits.window_duration);
    if window.seen.len() >= self.limits.max_messages_per_window as usize {
      window.muted_until = Some(now + self.limits.ban_duration);
      window.seen.clear();
      tracing::warn!("{} exceeded the inbound rate limit and was muted", identity);
      return Err(Rejection::Flooding(self.limits.max_messages_per_window));
    }

    window.seen.push_back(now);
    Ok(())
  }

  /// Drop all state for `identity` (on disconnect).
  pub async fn forget(&self, identity: &str) {
    self.windows.lock().await.remove(identity);
  }
}
