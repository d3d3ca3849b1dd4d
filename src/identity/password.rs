use super::{token_expiry, AuthEvent, IdentityProvider, Session, TokenStore};
use crate::backend::transport::{HttpRequest, HttpTransport, Method};
use crate::error::{Error, Result};
use async_trait::async_trait;
use log::{info, warn};
use serde::Deserialize;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    user: TokenUser,
}

#[derive(Debug, Deserialize)]
struct TokenUser {
    id: String,
    #[serde(default)]
    email: Option<String>,
}

/// Email/password sign-in against the hosted auth endpoint
pub struct PasswordIdentityProvider {
    transport: Arc<dyn HttpTransport>,
    base_url: String,
    api_key: String,
    tokens: Arc<TokenStore>,
    session: Mutex<Option<Session>>,
}

impl PasswordIdentityProvider {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        base_url: &str,
        api_key: &str,
        tokens: Arc<TokenStore>,
    ) -> Self {
        Self {
            transport,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            tokens,
            session: Mutex::new(None),
        }
    }

    fn auth_request(&self, path: &str, body: Option<serde_json::Value>, bearer: Option<&str>) -> HttpRequest {
        let mut headers = vec![
            ("apikey".to_string(), self.api_key.clone()),
            ("Content-Type".to_string(), "application/json".to_string()),
        ];
        if let Some(token) = bearer {
            headers.push(("Authorization".to_string(), format!("Bearer {}", token)));
        }
        HttpRequest {
            headers,
            body,
            ..HttpRequest::new(Method::Post, format!("{}/auth/v1/{}", self.base_url, path))
        }
    }
}

#[async_trait]
impl IdentityProvider for PasswordIdentityProvider {
    async fn sign_in(&self, email: &str, password: &str) -> Result<Session> {
        let mut request = self.auth_request(
            "token",
            Some(serde_json::json!({ "email": email, "password": password })),
            None,
        );
        request
            .query
            .insert("grant_type".to_string(), "password".to_string());

        let response = self.transport.execute(request).await?;
        if response.status == 400 || response.status == 401 {
            return Err(Error::AuthenticationRequired(
                "Invalid login credentials".to_string(),
            ));
        }
        if !response.is_success() {
            return Err(Error::Http {
                status: response.status,
                message: response.body.to_string(),
            });
        }

        let token: TokenResponse = serde_json::from_value(response.body)?;
        let expires_at = token_expiry(&token.access_token).or_else(|| {
            token
                .expires_in
                .map(|secs| chrono::Utc::now() + chrono::Duration::seconds(secs))
        });
        let session = Session {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            user_id: token.user.id,
            email: token.user.email,
            expires_at,
        };

        self.tokens.set_token(session.access_token.clone());
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(session.clone());

        info!("Operator signed in: {}", session.email.as_deref().unwrap_or(&session.user_id));
        self.tokens.publish(AuthEvent::SignedIn {
            user_id: session.user_id.clone(),
            email: session.email.clone(),
        });

        Ok(session)
    }

    async fn sign_out(&self) -> Result<()> {
        let session = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.tokens.clear();

        if let Some(session) = session {
            let request = self.auth_request("logout", None, Some(&session.access_token));
            // The local session is gone either way.
            match self.transport.execute(request).await {
                Ok(response) if !response.is_success() => {
                    warn!("Logout returned HTTP {}", response.status);
                }
                Err(e) => warn!("Logout request failed: {}", e),
                Ok(_) => {}
            }
        }

        self.tokens.publish(AuthEvent::SignedOut);
        Ok(())
    }

    fn session(&self) -> Option<Session> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn on_auth_state_change(&self, callback: Box<dyn Fn(&AuthEvent) + Send + Sync>) -> crate::messaging::Subscription {
        self.tokens.on_auth_event(move |event| callback(event))
    }
}
