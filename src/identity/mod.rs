use crate::error::{Error, Result};
use crate::messaging::{EventBus, Subscription};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};

pub mod password;

pub use password::PasswordIdentityProvider;

/// Session lifecycle notifications
#[derive(Debug, Clone, PartialEq)]
pub enum AuthEvent {
    SignedIn { user_id: String, email: Option<String> },
    SignedOut,
    /// The backend rejected the bearer token; the operator must sign in again
    AuthenticationRequired { reason: String },
}

/// Authenticated operator session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub user_id: String,
    pub email: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        self.expires_at.map_or(false, |at| at <= Utc::now())
    }
}

/// Role granted to every operator account
pub const ROLE_OPERATOR: &str = "operator";
/// Role allowed to run destructive maintenance
pub const ROLE_ADMIN: &str = "admin";

/// Provider-managed metadata; operators cannot edit it themselves
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct AppMetadata {
    #[serde(default)]
    pub role: Option<String>,
}

/// Claims we read from provider-issued tokens
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    /// Expiration time (Unix timestamp)
    #[serde(default)]
    pub exp: Option<i64>,
    #[serde(default)]
    pub app_metadata: AppMetadata,
}

impl Claims {
    /// Application role; accounts without one are operators.
    pub fn role(&self) -> &str {
        self.app_metadata.role.as_deref().unwrap_or(ROLE_OPERATOR)
    }
}

/// Read claims from a token without checking its signature.
///
/// The identity provider owns verification; the client only needs the
/// subject and expiry for display and refresh decisions.
pub fn read_claims(token: &str) -> Option<Claims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.required_spec_claims.clear();

    decode::<Claims>(token, &DecodingKey::from_secret(&[]), &validation)
        .map(|data| data.claims)
        .ok()
}

/// Expiry instant from the `exp` claim, if present
pub fn token_expiry(token: &str) -> Option<DateTime<Utc>> {
    read_claims(token)
        .and_then(|claims| claims.exp)
        .and_then(|exp| Utc.timestamp_opt(exp, 0).single())
}

/// Shared bearer-token holder.
///
/// The backend client reads it for every request and clears it on 401; the
/// identity provider writes it on sign-in.
pub struct TokenStore {
    token: Mutex<Option<String>>,
    events: EventBus<AuthEvent>,
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenStore {
    pub fn new() -> Self {
        Self {
            token: Mutex::new(None),
            events: EventBus::new(),
        }
    }

    pub fn token(&self) -> Option<String> {
        self.token.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.lock().unwrap_or_else(PoisonError::into_inner) = Some(token.into());
    }

    pub fn clear(&self) {
        *self.token.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Drop the token and tell listeners a new sign-in is needed.
    pub fn clear_for_reauth(&self, reason: &str) {
        self.clear();
        log::warn!("Authentication required: {}", reason);
        self.events.publish(&AuthEvent::AuthenticationRequired {
            reason: reason.to_string(),
        });
    }

    /// Role of the signed-in operator, if any
    pub fn role(&self) -> Option<String> {
        self.token()
            .and_then(|token| read_claims(&token))
            .map(|claims| claims.role().to_string())
    }

    /// Admit the current session if it holds `required` or is an admin.
    pub fn require_role(&self, required: &str) -> Result<()> {
        let Some(token) = self.token() else {
            return Err(Error::AuthenticationRequired(format!(
                "Signing in as {} is required",
                required
            )));
        };
        let role = read_claims(&token)
            .map(|claims| claims.role().to_string())
            .unwrap_or_else(|| ROLE_OPERATOR.to_string());
        if role == ROLE_ADMIN || role == required {
            Ok(())
        } else {
            Err(Error::Forbidden(format!("role {} may not act as {}", role, required)))
        }
    }

    pub fn publish(&self, event: AuthEvent) {
        self.events.publish(&event);
    }

    pub fn on_auth_event<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&AuthEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(callback)
    }
}

/// Identity collaborator
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn sign_in(&self, email: &str, password: &str) -> Result<Session>;
    async fn sign_out(&self) -> Result<()>;
    fn session(&self) -> Option<Session>;
    fn on_auth_state_change(&self, callback: Box<dyn Fn(&AuthEvent) + Send + Sync>) -> Subscription;
}
