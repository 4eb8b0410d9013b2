//! Identity verification for incoming connections.
//!
//! Tokens are issued by an external identity provider and carry the user's
//! identity in `sub`. The server only verifies them; [`JwtAuth::sign_identity`]
//! exists so that tests and local tooling can mint tokens.
//!
//! ## Example Usage
//! ```
//! use rookery::auth::JwtAuth;
//!
//! let auth = JwtAuth::new("super-secret-key");
//! let token = auth.sign_identity("user42", Some("Ada"), 3600).unwrap();
//! let claims = auth.verify_identity(&token).unwrap();
//! assert_eq!(claims.sub, "user42");
//! assert_eq!(claims.name.as_deref(), Some("Ada"));
//! ```
use anyhow::{Context, Result};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Claims carried by an identity token.
///
/// ## Fields
/// - `sub`: the user's identity.
/// - `name`: optional display name.
/// - `exp`: UNIX timestamp after which the token is rejected.
/// - `iss`: optional issuer, checked when [`JwtAuthOptions::issuer`] is set.
#[derive(Debug, Serialize, Deserialize)]
pub struct IdentityClaims {
  pub sub: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  pub exp: usize,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub iss: Option<String>,
}

/// Validation knobs.
///
/// ## Fields
/// - `leeway`: Allowed clock skew in seconds.
/// - `issuer`: Optional expected issuer string.
#[derive(Clone, Default)]
pub struct JwtAuthOptions {
  pub leeway: u64,
  pub issuer: Option<String>,
}

#[derive(Clone)]
pub struct JwtAuth {
  secret: String,
  options: JwtAuthOptions,
}

impl JwtAuth {
  pub fn new(secret: &str) -> Self {
    Self {
      secret: secret.into(),
      options: JwtAuthOptions::default(),
    }
  }

  pub fn with_options(secret: &str, options: JwtAuthOptions) -> Self {
    Self {
      secret: secret.into(),
      options,
    }
  }

  /// Signs an HS256 identity token valid for `ttl_secs`.
  pub fn sign_identity(&self, user_id: &str, name: Option<&str>, ttl_secs: usize) -> Result<String> {
    let exp = chrono::Utc::now()
      .timestamp()
      .saturating_add(ttl_secs as i64) as usize;

    let claims = IdentityClaims {
      sub: user_id.to_string(),
      name: name.map(str::to_string),
      exp,
      iss: self.options.issuer.clone(),
    };
    encode(
      &Header::default(),
      &claims,
      &EncodingKey::from_secret(self.secret.as_ref()),
    )
    .context("Failed to encode identity token.")
  }

  /// Verifies signature and expiry, returning the claims.
  pub fn verify_identity(&self, token: &str) -> Result<IdentityClaims> {
    let mut validation = Validation::default();
    validation.leeway = self.options.leeway;
    if let Some(ref iss) = self.options.issuer {
      validation.set_issuer(&[iss]);
    }
    let data = decode::<IdentityClaims>(
      token,
      &DecodingKey::from_secret(self.secret.as_ref()),
      &validation,
    )
    .context("Failed to decode identity token")?;
    Ok(data.claims)
  }
}

/// Identity handed to connections whose token could not be verified.
pub fn guest_identity() -> String {
  let id = Uuid::new_v4().simple().to_string();
  format!("guest_{}", &id[..8])
}
