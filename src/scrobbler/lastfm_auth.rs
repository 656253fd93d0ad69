// Last.fm desktop authentication
// https://www.last.fm/api/desktopauth
//
// 1. auth.getToken gives an unauthorized request token
// 2. the user approves the token in a browser
// 3. auth.getSession trades the approved token for a session key

use super::lastfm::{LastFmClient, Transport};
use super::signature::RequestParams;
use super::traits::Authenticator;
use crate::error::{Result, ScrobblerError};
use serde::Deserialize;
use std::sync::PoisonError;

pub const AUTH_URL: &str = "https://www.last.fm/api/auth/";

/// A Last.fm web service session
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Session {
    pub name: String,
    pub key: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    session: Session,
}

impl LastFmClient {
    /// Page where the user approves `token`
    pub fn authorization_url(&self, token: &str) -> String {
        format!("{}?api_key={}&token={}", AUTH_URL, self.api_key, token)
    }

    /// Request a token and open the approval page in the default browser.
    /// Returns the approval URL so callers can show it when no browser opens.
    pub fn begin_authentication(&self) -> Result<String> {
        let value = self.call("auth.getToken", RequestParams::new(), Transport::Get)?;
        let TokenResponse { token } = serde_json::from_value(value)?;

        let url = self.authorization_url(&token);
        *self
            .pending_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(token);

        log::info!("Opening Last.fm authorization page");
        if let Err(err) = open::that(&url) {
            log::warn!("Could not open browser ({}), visit {} to continue", err, url);
        }
        Ok(url)
    }

    /// Trade the approved token for a session. The token is kept when the
    /// exchange fails so the user can approve it and try again.
    pub fn complete_authentication(&self) -> Result<Session> {
        let token = self
            .pending_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| ScrobblerError::Auth("no authentication in progress".to_string()))?;

        let mut params = RequestParams::new();
        params.insert("token", token);
        let value = self
            .call("auth.getSession", params, Transport::Get)
            .map_err(|err| match err {
                ScrobblerError::Api { code, message } => {
                    ScrobblerError::Auth(format!("{} (code {})", message, code))
                }
                other => other,
            })?;
        let SessionResponse { session } = serde_json::from_value(value)?;

        self.pending_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.set_session_key(Some(session.key.clone()));
        log::info!("Authenticated with Last.fm as {}", session.name);
        Ok(session)
    }

    /// Forget a pending token
    pub fn cancel_authentication(&self) {
        if self
            .pending_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
        {
            log::info!("Last.fm authentication cancelled");
        }
    }

    pub fn is_authenticating(&self) -> bool {
        self.pending_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl Authenticator for LastFmClient {
    fn begin_authentication(&self) -> Result<String> {
        LastFmClient::begin_authentication(self)
    }

    fn complete_authentication(&self) -> Result<Session> {
        LastFmClient::complete_authentication(self)
    }

    fn cancel_authentication(&self) {
        LastFmClient::cancel_authentication(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scrobbler::lastfm::tests::serve_once;

    fn with_token(client: &LastFmClient, token: &str) {
        *client.pending_token.lock().unwrap() = Some(token.to_string());
    }

    #[test]
    fn test_authorization_url() {
        let client = LastFmClient::new("key", "secret");
        assert_eq!(
            client.authorization_url("tok"),
            "https://www.last.fm/api/auth/?api_key=key&token=tok"
        );
    }

    #[test]
    fn test_complete_without_token_fails() {
        let client = LastFmClient::new("key", "secret").with_api_url("http://127.0.0.1:9/");
        assert!(matches!(
            client.complete_authentication(),
            Err(ScrobblerError::Auth(_))
        ));
    }

    #[test]
    fn test_complete_adopts_session() {
        let (url, request) = serve_once(
            "200 OK",
            r#"{"session":{"name":"listener","key":"sk-123","subscriber":0}}"#,
        );
        let client = LastFmClient::new("key", "secret").with_api_url(url);
        with_token(&client, "tok");

        let session = client.complete_authentication().unwrap();
        assert_eq!(session.name, "listener");
        assert_eq!(client.session_key().as_deref(), Some("sk-123"));
        assert!(!client.is_authenticating());

        let request = request.recv().unwrap();
        assert!(request.starts_with("GET /2.0/?"));
        assert!(request.contains("method=auth.getSession"));
        assert!(request.contains("token=tok"));
    }

    #[test]
    fn test_unapproved_token_is_kept() {
        let (url, _request) = serve_once(
            "403 Forbidden",
            r#"{"error":14,"message":"This token has not been authorized"}"#,
        );
        let client = LastFmClient::new("key", "secret").with_api_url(url);
        with_token(&client, "tok");

        assert!(matches!(
            client.complete_authentication(),
            Err(ScrobblerError::Auth(_))
        ));
        assert!(client.is_authenticating());
        assert!(!client.is_authenticated());

        client.cancel_authentication();
        assert!(!client.is_authenticating());
    }
}
