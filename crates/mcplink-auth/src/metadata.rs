//! OAuth 2.0 server metadata discovery and endpoint calls.
//!
//! Discovery walks the RFC 8414 well-known candidates on the server origin
//! and follows `authorization_servers` delegation when the resource document
//! points elsewhere.

use crate::error::{AuthError, AuthResult};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// OAuth server metadata (the subset the client uses).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OAuthMetadata {
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default)]
    pub authorization_endpoint: Option<String>,
    #[serde(default)]
    pub token_endpoint: Option<String>,
    #[serde(default)]
    pub registration_endpoint: Option<String>,
    #[serde(default)]
    pub scopes_supported: Option<Vec<String>>,
    /// Present on protected-resource documents that delegate to a separate
    /// authorization server.
    #[serde(default)]
    pub authorization_servers: Option<Vec<String>>,
}

impl OAuthMetadata {
    fn has_endpoints(&self) -> bool {
        self.authorization_endpoint.is_some() || self.token_endpoint.is_some()
    }
}

/// Token endpoint response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// Client information (from dynamic registration or config).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id_issued_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret_expires_at: Option<u64>,
}

/// Discover OAuth metadata for a server URL.
///
/// Tries the well-known documents on the server origin in order, then any
/// delegated authorization servers. Returns `None` when nothing usable is
/// advertised.
pub async fn discover(
    http: &reqwest::Client,
    server_url: &str,
) -> AuthResult<Option<OAuthMetadata>> {
    let url = url::Url::parse(server_url)
        .map_err(|e| AuthError::Discovery(format!("invalid server URL: {e}")))?;
    let scheme = url.scheme();
    let Some(host) = url.host_str() else {
        return Err(AuthError::Discovery("server URL has no host".to_string()));
    };
    let origin = match url.port() {
        Some(port) => format!("{scheme}://{host}:{port}"),
        None => format!("{scheme}://{host}"),
    };

    let candidates = [
        format!("{origin}/.well-known/oauth-authorization-server"),
        format!("{origin}/.well-known/openid-configuration"),
        format!("{origin}/.well-known/oauth-protected-resource"),
    ];

    for candidate in candidates {
        let Some(metadata) = fetch(http, &candidate).await else {
            continue;
        };
        if metadata.has_endpoints() {
            debug!(url = %candidate, "Discovered OAuth metadata");
            return Ok(Some(metadata));
        }
        if let Some(servers) = metadata.authorization_servers.as_ref() {
            for issuer in servers {
                let issuer = issuer.trim_end_matches('/');
                let delegated_url = format!("{issuer}/.well-known/oauth-authorization-server");
                if let Some(mut delegated) = fetch(http, &delegated_url).await {
                    if delegated.has_endpoints() {
                        if delegated.issuer.is_none() {
                            delegated.issuer = Some(issuer.to_string());
                        }
                        debug!(url = %delegated_url, "Discovered delegated OAuth metadata");
                        return Ok(Some(delegated));
                    }
                }
            }
        }
    }

    Ok(None)
}

async fn fetch(http: &reqwest::Client, url: &str) -> Option<OAuthMetadata> {
    let response = http.get(url).send().await.ok()?;
    if !response.status().is_success() {
        return None;
    }
    response.json::<OAuthMetadata>().await.ok()
}

/// Register a new OAuth client dynamically (RFC 7591).
pub async fn register_client(
    http: &reqwest::Client,
    registration_endpoint: &str,
    client_name: &str,
    redirect_uri: &str,
) -> AuthResult<ClientInfo> {
    let payload = serde_json::json!({
        "client_name": client_name,
        "redirect_uris": [redirect_uri],
        "grant_types": ["authorization_code", "refresh_token"],
        "response_types": ["code"],
        "token_endpoint_auth_method": "none",
    });

    let response = http
        .post(registration_endpoint)
        .json(&payload)
        .send()
        .await
        .map_err(|e| AuthError::Registration(format!("request failed: {e}")))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(AuthError::Registration(format!("{status}: {body}")));
    }

    let info: ClientInfo = response
        .json()
        .await
        .map_err(|e| AuthError::Registration(format!("invalid response: {e}")))?;

    Ok(info)
}

/// Build the authorization URL for the code flow with PKCE.
pub fn build_auth_url(
    auth_endpoint: &str,
    client_id: &str,
    redirect_uri: &str,
    scope: Option<&str>,
    state: &str,
    code_challenge: &str,
) -> String {
    let mut url = format!(
        "{}?response_type=code&client_id={}&redirect_uri={}&state={}&code_challenge={}&code_challenge_method=S256",
        auth_endpoint,
        urlencoding::encode(client_id),
        urlencoding::encode(redirect_uri),
        urlencoding::encode(state),
        urlencoding::encode(code_challenge),
    );

    if let Some(scope) = scope {
        url.push_str(&format!("&scope={}", urlencoding::encode(scope)));
    }

    url
}

/// Exchange an authorization code for tokens.
pub async fn exchange_code(
    http: &reqwest::Client,
    token_endpoint: &str,
    client_id: &str,
    client_secret: Option<&str>,
    code: &str,
    redirect_uri: &str,
    code_verifier: &str,
) -> AuthResult<OAuthTokens> {
    let mut params = vec![
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", redirect_uri),
        ("client_id", client_id),
        ("code_verifier", code_verifier),
    ];
    if let Some(secret) = client_secret {
        params.push(("client_secret", secret));
    }

    let response = http
        .post(token_endpoint)
        .form(&params)
        .send()
        .await
        .map_err(|e| AuthError::TokenExchange(format!("request failed: {e}")))?;

    if !response.status().is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(AuthError::TokenExchange(text));
    }

    let tokens: OAuthTokens = response
        .json()
        .await
        .map_err(|e| AuthError::TokenExchange(format!("invalid token response: {e}")))?;

    Ok(tokens)
}

/// Refresh tokens using a refresh token.
pub async fn refresh_tokens(
    http: &reqwest::Client,
    token_endpoint: &str,
    client_id: &str,
    client_secret: Option<&str>,
    refresh_token: &str,
) -> AuthResult<OAuthTokens> {
    let mut params = vec![
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
        ("client_id", client_id),
    ];
    if let Some(secret) = client_secret {
        params.push(("client_secret", secret));
    }

    let response = http
        .post(token_endpoint)
        .form(&params)
        .send()
        .await
        .map_err(|e| AuthError::TokenExchange(format!("refresh request failed: {e}")))?;

    if !response.status().is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(AuthError::TokenExchange(text));
    }

    let tokens: OAuthTokens = response
        .json()
        .await
        .map_err(|e| AuthError::TokenExchange(format!("invalid refresh response: {e}")))?;

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_build_auth_url() {
        let url = build_auth_url(
            "https://auth.example.com/authorize",
            "client123",
            "http://127.0.0.1:18912/oauth/callback",
            Some("read write"),
            "state123",
            "challenge123",
        );

        assert!(url.contains("response_type=code"));
        assert!(url.contains("client_id=client123"));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains("scope=read%20write"));
    }

    #[test]
    fn test_build_auth_url_no_scope() {
        let url = build_auth_url(
            "https://auth.example.com/authorize",
            "client123",
            "http://127.0.0.1:18912/oauth/callback",
            None,
            "state123",
            "challenge123",
        );

        assert!(!url.contains("scope="));
    }

    #[test]
    fn test_build_auth_url_encodes_special_chars() {
        let url = build_auth_url(
            "https://auth.example.com/authorize",
            "client with spaces",
            "http://127.0.0.1:18912/cb?x=1",
            None,
            "state=test&nonce=123",
            "challenge+123",
        );

        assert!(url.contains("client%20with%20spaces"));
        assert!(!url.contains("state=test&nonce"));
    }

    #[tokio::test]
    async fn test_discover_direct_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-authorization-server"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "authorization_endpoint": format!("{}/authorize", server.uri()),
                "token_endpoint": format!("{}/token", server.uri()),
            })))
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let metadata = discover(&http, &format!("{}/mcp", server.uri()))
            .await
            .unwrap()
            .unwrap();

        assert!(metadata.authorization_endpoint.unwrap().ends_with("/authorize"));
        assert!(metadata.token_endpoint.unwrap().ends_with("/token"));
    }

    #[tokio::test]
    async fn test_discover_follows_delegation() {
        let auth_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-authorization-server"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "authorization_endpoint": format!("{}/authorize", auth_server.uri()),
                "token_endpoint": format!("{}/token", auth_server.uri()),
            })))
            .mount(&auth_server)
            .await;

        let resource_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-protected-resource"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "authorization_servers": [auth_server.uri()],
            })))
            .mount(&resource_server)
            .await;

        let http = reqwest::Client::new();
        let metadata = discover(&http, &resource_server.uri())
            .await
            .unwrap()
            .unwrap();

        assert!(metadata.token_endpoint.unwrap().starts_with(&auth_server.uri()));
        assert_eq!(metadata.issuer.as_deref(), Some(auth_server.uri().as_str()));
    }

    #[tokio::test]
    async fn test_discover_nothing_advertised() {
        let server = MockServer::start().await;

        let http = reqwest::Client::new();
        let metadata = discover(&http, &server.uri()).await.unwrap();
        assert!(metadata.is_none());
    }

    #[tokio::test]
    async fn test_register_client() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/register"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "client_id": "generated-id",
                "client_id_issued_at": 1700000000u64,
            })))
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let info = register_client(
            &http,
            &format!("{}/register", server.uri()),
            "mcplink",
            "http://127.0.0.1:18912/oauth/callback",
        )
        .await
        .unwrap();

        assert_eq!(info.client_id, "generated-id");
        assert!(info.client_secret.is_none());
    }

    #[tokio::test]
    async fn test_exchange_code_sends_verifier() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code_verifier=verifier123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "access123",
                "token_type": "Bearer",
                "refresh_token": "refresh456",
                "expires_in": 3600,
            })))
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let tokens = exchange_code(
            &http,
            &format!("{}/token", server.uri()),
            "client123",
            None,
            "authcode",
            "http://127.0.0.1:18912/oauth/callback",
            "verifier123",
        )
        .await
        .unwrap();

        assert_eq!(tokens.access_token, "access123");
        assert_eq!(tokens.refresh_token.as_deref(), Some("refresh456"));
    }

    #[tokio::test]
    async fn test_exchange_code_error_body_propagated() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let err = exchange_code(
            &http,
            &format!("{}/token", server.uri()),
            "client123",
            None,
            "badcode",
            "http://127.0.0.1:18912/oauth/callback",
            "verifier123",
        )
        .await
        .unwrap_err();

        assert!(matches!(err, AuthError::TokenExchange(ref m) if m.contains("invalid_grant")));
    }

    #[tokio::test]
    async fn test_refresh_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "fresh",
                "expires_in": 120,
            })))
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let tokens = refresh_tokens(
            &http,
            &format!("{}/token", server.uri()),
            "client123",
            None,
            "refresh456",
        )
        .await
        .unwrap();

        assert_eq!(tokens.access_token, "fresh");
        // Response omitted the refresh token; the provider preserves the old one
        assert!(tokens.refresh_token.is_none());
    }
}
