//! OAuth2 plumbing: the provider capability, Google's implementation of it,
//! and the interactive consent flow with its loopback callback server.

use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Router;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::command;
use crate::error::{Error, Result};
use crate::token::TokenManager;
use crate::types::{AuthStatus, AuthorizationOutcome};

pub const GOOGLE_AUTH_ENDPOINT: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const GOOGLE_TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";

pub const YOUTUBE_SCOPES: [&str; 3] = [
    "https://www.googleapis.com/auth/youtube.upload",
    "https://www.googleapis.com/auth/youtube",
    "https://www.googleapis.com/auth/youtube.force-ssl",
];

/// Hard limit on waiting for the consent redirect.
pub const AUTHORIZATION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Token endpoint response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    /// Lifetime in seconds.
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
}

/// What the token lifecycle needs from an OAuth2 client.
pub trait OAuthProvider: Send + Sync {
    /// Consent URL asking for offline access to `scopes`.
    fn authorization_url(&self, redirect_uri: &str, scopes: &[&str]) -> String;

    /// Trade an authorization code for tokens.
    fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> impl Future<Output = Result<TokenGrant>> + Send;

    /// Mint a new access token from a refresh token.
    fn refresh(&self, refresh_token: &str) -> impl Future<Output = Result<TokenGrant>> + Send;
}

/// OAuth client id and secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
}

impl ClientCredentials {
    /// Read a Google client-secret file (`installed`, `web`, or flat layout).
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::Credentials(format!("credentials file not found: {}", path.display()))
            } else {
                Error::Io(e)
            }
        })?;
        let raw: serde_json::Value = serde_json::from_str(&text)
            .map_err(|_| Error::Credentials("credentials file is invalid JSON".into()))?;

        let details = raw
            .get("installed")
            .or_else(|| raw.get("web"))
            .unwrap_or(&raw);
        let field = |name: &str| {
            details
                .get(name)
                .and_then(|v| v.as_str())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        match (field("client_id"), field("client_secret")) {
            (Some(client_id), Some(client_secret)) => Ok(Self {
                client_id,
                client_secret,
            }),
            _ => Err(Error::Credentials(
                "credentials file missing client_id/client_secret".into(),
            )),
        }
    }
}

#[derive(Deserialize)]
struct ProviderErrorBody {
    error: Option<String>,
    error_description: Option<String>,
}

/// Google's OAuth2 endpoints, called with plain form posts.
#[derive(Debug, Clone)]
pub struct GoogleOAuth {
    credentials: ClientCredentials,
    http: reqwest::Client,
    auth_endpoint: String,
    token_endpoint: String,
}

impl GoogleOAuth {
    pub fn new(credentials: ClientCredentials) -> Self {
        Self {
            credentials,
            http: reqwest::Client::new(),
            auth_endpoint: GOOGLE_AUTH_ENDPOINT.into(),
            token_endpoint: GOOGLE_TOKEN_ENDPOINT.into(),
        }
    }

    /// Point at a different token endpoint (e.g. a local mock server).
    pub fn token_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.token_endpoint = endpoint.into();
        self
    }

    async fn post_token(&self, form: &[(&str, &str)]) -> Result<TokenGrant> {
        let response = self.http.post(&self.token_endpoint).form(form).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = match serde_json::from_str::<ProviderErrorBody>(&body) {
                Ok(ProviderErrorBody {
                    error: Some(error),
                    error_description,
                }) => match error_description {
                    Some(description) => format!("{error}: {description}"),
                    None => error,
                },
                _ => format!("HTTP {status}: {}", body.trim()),
            };
            return Err(Error::Provider(message));
        }
        Ok(response.json::<TokenGrant>().await?)
    }
}

impl OAuthProvider for GoogleOAuth {
    fn authorization_url(&self, redirect_uri: &str, scopes: &[&str]) -> String {
        let scope = scopes.join(" ");
        let params = [
            ("client_id", self.credentials.client_id.as_str()),
            ("redirect_uri", redirect_uri),
            ("response_type", "code"),
            ("access_type", "offline"),
            ("prompt", "consent"),
            ("scope", scope.as_str()),
        ];
        match Url::parse_with_params(&self.auth_endpoint, &params) {
            Ok(url) => url.into(),
            Err(e) => {
                warn!(endpoint = %self.auth_endpoint, error = %e, "invalid auth endpoint");
                self.auth_endpoint.clone()
            }
        }
    }

    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<TokenGrant> {
        self.post_token(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", &self.credentials.client_id),
            ("client_secret", &self.credentials.client_secret),
        ])
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant> {
        self.post_token(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", &self.credentials.client_id),
            ("client_secret", &self.credentials.client_secret),
        ])
        .await
    }
}

/// Knobs for [`authorize`].
#[derive(Debug, Clone)]
pub struct AuthorizeOptions {
    pub timeout: Duration,
    /// Try to launch the system browser on the consent URL.
    pub open_browser: bool,
}

impl Default for AuthorizeOptions {
    fn default() -> Self {
        Self {
            timeout: AUTHORIZATION_TIMEOUT,
            open_browser: true,
        }
    }
}

/// Run the interactive consent flow and persist the resulting tokens.
///
/// A loopback server on an ephemeral port receives the redirect. It is shut
/// down on every exit path, including timeout.
pub async fn authorize<P: OAuthProvider>(
    manager: &TokenManager<P>,
    options: &AuthorizeOptions,
) -> Result<AuthorizationOutcome> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let port = listener.local_addr()?.port();
    let redirect_uri = format!("http://127.0.0.1:{port}");

    let (callback_tx, callback_rx) = oneshot::channel();
    let server = CallbackServer::start(listener, callback_tx);

    let auth_url = manager
        .provider()
        .authorization_url(&redirect_uri, &YOUTUBE_SCOPES);
    info!(%redirect_uri, "waiting for OAuth consent");

    let browser_opened = options.open_browser && open_browser(&auth_url).await;
    if !browser_opened {
        info!(url = %auth_url, "open this URL to authorize");
    }

    let callback = tokio::time::timeout(options.timeout, callback_rx).await;
    server.shutdown().await;

    let code = match callback {
        Ok(Ok(Callback::Code(code))) => code,
        Ok(Ok(Callback::Denied(error))) => return Err(Error::AuthorizationDenied(error)),
        Ok(Err(_)) => {
            return Err(Error::Io(std::io::Error::other(
                "OAuth callback server stopped",
            )))
        }
        Err(_) => return Err(Error::AuthorizationTimeout),
    };

    let grant = manager
        .provider()
        .exchange_code(&code, &redirect_uri)
        .await?;
    manager.store_authorized(grant).await?;
    info!(path = %manager.token_path().display(), "OAuth token saved");

    Ok(AuthorizationOutcome {
        token_persisted: true,
        token_path: manager.token_path().to_path_buf(),
        auth_url,
        browser_opened,
    })
}

/// What the consent redirect carried.
#[derive(Debug)]
enum Callback {
    Code(String),
    Denied(String),
}

#[derive(Deserialize)]
struct CallbackParams {
    code: Option<String>,
    error: Option<String>,
}

/// Taken by the first redirect carrying `code` or `error`.
type CallbackSlot = Arc<Mutex<Option<oneshot::Sender<Callback>>>>;

/// Grace period for in-flight callback responses before the server is aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

struct CallbackServer {
    task: JoinHandle<std::io::Result<()>>,
    stop: oneshot::Sender<()>,
}

impl CallbackServer {
    fn start(listener: TcpListener, callback: oneshot::Sender<Callback>) -> Self {
        let slot: CallbackSlot = Arc::new(Mutex::new(Some(callback)));
        let app = Router::new().fallback(oauth_callback).with_state(slot);
        let (stop, stopped) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = stopped.await;
                })
                .await
        });
        Self { task, stop }
    }

    /// Stop accepting and release the port. Connections still open after
    /// the grace period are dropped.
    async fn shutdown(self) {
        let Self { mut task, stop } = self;
        if stop.send(()).is_err() {
            debug!("OAuth callback server already stopped");
        }
        match tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!(error = %e, "OAuth callback server failed"),
            Ok(Err(e)) => warn!(error = %e, "OAuth callback server panicked"),
            Err(_) => {
                debug!("aborting OAuth callback server with open connections");
                task.abort();
                if let Err(e) = task.await {
                    debug!(error = %e, "OAuth callback server aborted");
                }
            }
        }
    }
}

async fn oauth_callback(
    State(slot): State<CallbackSlot>,
    Query(params): Query<CallbackParams>,
) -> (StatusCode, String) {
    let (callback, response) = match (params.error, params.code) {
        (Some(error), _) => (
            Callback::Denied(error.clone()),
            (StatusCode::BAD_REQUEST, format!("OAuth failed: {error}")),
        ),
        (None, Some(code)) if !code.is_empty() => (
            Callback::Code(code),
            (StatusCode::OK, "OAuth complete. You can close this tab.".to_string()),
        ),
        _ => return (StatusCode::OK, "Waiting for OAuth code...".to_string()),
    };

    let sender = slot.lock().ok().and_then(|mut s| s.take());
    match sender {
        Some(sender) => {
            if sender.send(callback).is_err() {
                debug!("OAuth flow no longer waiting for the callback");
            }
        }
        None => debug!("ignoring repeated OAuth callback"),
    }
    response
}

/// Best-effort launch of the platform URL opener.
async fn open_browser(url: &str) -> bool {
    let (program, args): (&str, Vec<&str>) = if cfg!(target_os = "windows") {
        ("cmd", vec!["/C", "start", "", url])
    } else if cfg!(target_os = "macos") {
        ("open", vec![url])
    } else {
        ("xdg-open", vec![url])
    };

    match command::run(program, &args, Duration::from_secs(15)).await {
        Ok(result) if result.success() => true,
        Ok(result) => {
            warn!(program, exit_code = result.exit_code, "browser opener failed");
            false
        }
        Err(e) => {
            warn!(program, error = %e, "could not launch browser");
            false
        }
    }
}

/// Check that credentials and a refresh token are in place, without network access.
pub fn auth_status(credentials_path: &Path, token_path: &Path) -> AuthStatus {
    let not_ready = |message: &str| AuthStatus {
        ready: false,
        message: message.into(),
    };

    if !credentials_path.exists() {
        return not_ready("Credentials file not found.");
    }
    if ClientCredentials::load(credentials_path).is_err() {
        return not_ready("Credentials file is invalid.");
    }
    if !token_path.exists() {
        return not_ready("Token file not found.");
    }
    let Ok(text) = std::fs::read_to_string(token_path) else {
        return not_ready("Token file is unreadable.");
    };
    let Ok(token) = serde_json::from_str::<serde_json::Value>(&text) else {
        return not_ready("Token file is invalid JSON.");
    };
    let has_refresh = token
        .get("refresh_token")
        .and_then(|v| v.as_str())
        .is_some_and(|v| !v.trim().is_empty());
    if !has_refresh {
        return not_ready("refresh_token missing in token file.");
    }

    AuthStatus {
        ready: true,
        message: "Auth files are ready.".into(),
    }
}
