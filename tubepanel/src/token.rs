//! Persisted OAuth token lifecycle.
//!
//! The token file is read fresh on every call. A refresh happens at most once
//! per file at a time: concurrent callers queue on a per-path lock and pick up
//! the token the first caller wrote.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::oauth::{OAuthProvider, TokenGrant};

/// Tokens expiring within this window are refreshed ahead of time.
pub const REFRESH_AHEAD: Duration = Duration::from_secs(60);

const DEFAULT_TOKEN_TYPE: &str = "Bearer";

static REFRESH_LOCKS: LazyLock<Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Contents of the token file. Keys this crate doesn't know are kept in `extra`
/// and written back untouched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersistedToken {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    pub refresh_token: String,
    pub token_type: String,
    /// Unix epoch milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Lenient on-disk shape; validated into [`PersistedToken`].
#[derive(Debug, Default, Deserialize)]
struct TokenFile {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default, deserialize_with = "deserialize_expiry")]
    expiry_date: Option<i64>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Accepts epoch millis as a number or numeric string, or an RFC 3339 timestamp.
fn deserialize_expiry<'de, D>(deserializer: D) -> std::result::Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| {
                chrono::DateTime::parse_from_rfc3339(s)
                    .ok()
                    .map(|dt| dt.timestamp_millis())
            })
        }
        _ => None,
    })
}

impl PersistedToken {
    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref().filter(|t| !t.is_empty())
    }

    /// Fold a token-endpoint response into this token.
    ///
    /// The refresh token survives unless the response carries a new one.
    pub fn merge_grant(&self, grant: TokenGrant, now_ms: i64) -> Result<Self> {
        if grant.access_token.trim().is_empty() {
            return Err(Error::Provider(
                "token response is missing access_token".into(),
            ));
        }

        let mut extra = self.extra.clone();
        if let Some(scope) = grant.scope {
            extra.insert("scope".into(), Value::String(scope));
        }
        if let Some(id_token) = grant.id_token {
            extra.insert("id_token".into(), Value::String(id_token));
        }

        Ok(Self {
            access_token: Some(grant.access_token),
            refresh_token: grant
                .refresh_token
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| self.refresh_token.clone()),
            token_type: grant
                .token_type
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| self.token_type.clone()),
            expiry_date: match grant.expires_in {
                Some(secs) => Some(now_ms + secs as i64 * 1000),
                None => self.expiry_date,
            },
            extra,
        })
    }
}

/// Classification of the token file.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenState {
    NoToken,
    /// Unusable file; the reason is user-facing.
    Invalid(String),
    /// Missing access token, unknown expiry, or expiring within the refresh window.
    Expiring(PersistedToken),
    Valid(PersistedToken),
}

impl TokenState {
    /// Sort a freshly read token by how soon it needs refreshing.
    pub fn classify(token: PersistedToken, now_ms: i64, refresh_ahead: Duration) -> Self {
        let horizon = now_ms + refresh_ahead.as_millis() as i64;
        match (token.access_token(), token.expiry_date) {
            (Some(_), Some(expiry)) if expiry > horizon => TokenState::Valid(token),
            _ => TokenState::Expiring(token),
        }
    }

    fn into_usable(self) -> Result<PersistedToken> {
        match self {
            TokenState::NoToken => Err(Error::AuthRequired(
                "token file not found; run the authorization flow first".into(),
            )),
            TokenState::Invalid(reason) => Err(Error::AuthRequired(reason)),
            TokenState::Expiring(token) | TokenState::Valid(token) => Ok(token),
        }
    }
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

fn lock_for(path: &Path) -> Arc<tokio::sync::Mutex<()>> {
    let key = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut locks = REFRESH_LOCKS.lock().unwrap_or_else(|e| e.into_inner());
    locks.entry(key).or_default().clone()
}

/// Keeps one token file valid, refreshing through `P` when needed.
pub struct TokenManager<P> {
    token_path: PathBuf,
    provider: P,
    refresh_ahead: Duration,
}

impl<P: OAuthProvider> TokenManager<P> {
    pub fn new(token_path: impl Into<PathBuf>, provider: P) -> Self {
        Self {
            token_path: token_path.into(),
            provider,
            refresh_ahead: REFRESH_AHEAD,
        }
    }

    pub fn refresh_ahead(mut self, window: Duration) -> Self {
        self.refresh_ahead = window;
        self
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn token_path(&self) -> &Path {
        &self.token_path
    }

    /// Read and classify the token file.
    pub async fn state(&self) -> Result<TokenState> {
        let text = match tokio::fs::read_to_string(&self.token_path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(TokenState::NoToken),
            Err(e) => return Err(e.into()),
        };
        Ok(parse_token(&text)
            .map(|token| TokenState::classify(token, now_millis(), self.refresh_ahead))
            .unwrap_or_else(TokenState::Invalid))
    }

    /// Return a usable access token, refreshing first if it is expiring
    /// or `force_refresh` is set.
    ///
    /// A valid token is returned without any write. Callers racing on the
    /// same file share a single refresh.
    pub async fn ensure_valid(&self, force_refresh: bool) -> Result<String> {
        let observed = match self.state().await? {
            TokenState::Valid(token) if !force_refresh => return Ok(access_of(&token)),
            state => state.into_usable()?,
        };

        let lock = lock_for(&self.token_path);
        let _guard = lock.lock().await;

        let current = self.state().await?;
        if let TokenState::Valid(token) = &current {
            if !force_refresh || token.access_token != observed.access_token {
                debug!(path = %self.token_path.display(), "token refreshed by another caller");
                return Ok(access_of(token));
            }
        }
        let current = current.into_usable()?;

        let grant = match self.provider.refresh(&current.refresh_token).await {
            Ok(grant) => grant,
            Err(e) => {
                warn!(path = %self.token_path.display(), error = %e, "token refresh failed");
                return Err(e);
            }
        };
        let refreshed = current.merge_grant(grant, now_millis())?;
        self.persist(&refreshed).await?;
        info!(
            path = %self.token_path.display(),
            expiry_date = ?refreshed.expiry_date,
            "access token refreshed"
        );
        Ok(access_of(&refreshed))
    }

    /// Persist tokens from a fresh authorization, keeping unknown keys and
    /// the old refresh token if the provider sent none.
    pub async fn store_authorized(&self, grant: TokenGrant) -> Result<PersistedToken> {
        let lock = lock_for(&self.token_path);
        let _guard = lock.lock().await;

        let existing = match tokio::fs::read_to_string(&self.token_path).await {
            Ok(text) => serde_json::from_str::<TokenFile>(&text).unwrap_or_default(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => TokenFile::default(),
            Err(e) => return Err(e.into()),
        };

        let base = PersistedToken {
            access_token: existing.access_token,
            refresh_token: existing.refresh_token.unwrap_or_default(),
            token_type: existing
                .token_type
                .unwrap_or_else(|| DEFAULT_TOKEN_TYPE.into()),
            expiry_date: existing.expiry_date,
            extra: existing.extra,
        };
        let token = base.merge_grant(grant, now_millis())?;
        if token.refresh_token.trim().is_empty() {
            return Err(Error::Provider(
                "authorization response did not include a refresh_token".into(),
            ));
        }
        self.persist(&token).await?;
        Ok(token)
    }

    /// Write through a sibling temp file and rename over the target.
    async fn persist(&self, token: &PersistedToken) -> Result<()> {
        if let Some(parent) = self.token_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut tmp = self.token_path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let json = serde_json::to_string_pretty(token)?;
        tokio::fs::write(&tmp, json).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &self.token_path).await {
            if let Err(cleanup) = tokio::fs::remove_file(&tmp).await {
                warn!(path = %tmp.display(), error = %cleanup, "failed to remove temp token file");
            }
            return Err(e.into());
        }
        Ok(())
    }
}

fn access_of(token: &PersistedToken) -> String {
    token.access_token().unwrap_or_default().to_string()
}

/// Parse and validate token file text; `Err` carries the user-facing reason.
fn parse_token(text: &str) -> std::result::Result<PersistedToken, String> {
    let file: TokenFile = serde_json::from_str(text)
        .map_err(|_| "token file is not a valid JSON object".to_string())?;
    let refresh_token = file
        .refresh_token
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| "token file has no refresh_token; run the authorization flow again".to_string())?;

    Ok(PersistedToken {
        access_token: file.access_token,
        refresh_token,
        token_type: file
            .token_type
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| DEFAULT_TOKEN_TYPE.into()),
        expiry_date: file.expiry_date,
        extra: file.extra,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::tests::FakeProvider;
    use std::fs;
    use std::sync::atomic::Ordering;

    fn fresh_grant() -> TokenGrant {
        TokenGrant {
            access_token: "new-access".into(),
            expires_in: Some(3600),
            ..TokenGrant::default()
        }
    }

    fn manager_with(dir: &Path, contents: Option<Value>) -> TokenManager<FakeProvider> {
        let path = dir.join("token.json");
        if let Some(contents) = contents {
            fs::write(&path, contents.to_string()).unwrap();
        }
        let provider = FakeProvider {
            refresh_grant: std::sync::Mutex::new(fresh_grant()),
            ..FakeProvider::default()
        };
        TokenManager::new(path, provider)
    }

    fn read_json(path: &Path) -> Value {
        serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
    }

    #[test]
    fn test_classify_window() {
        let token = parse_token(r#"{"access_token": "a", "refresh_token": "r", "expiry_date": 100000}"#)
            .unwrap();
        let window = Duration::from_secs(60);
        assert!(matches!(
            TokenState::classify(token.clone(), 0, window),
            TokenState::Valid(_)
        ));
        // exactly at the horizon counts as expiring
        assert!(matches!(
            TokenState::classify(token.clone(), 40_000, window),
            TokenState::Expiring(_)
        ));

        let mut no_access = token.clone();
        no_access.access_token = None;
        assert!(matches!(
            TokenState::classify(no_access, 0, window),
            TokenState::Expiring(_)
        ));

        let mut no_expiry = token;
        no_expiry.expiry_date = None;
        assert!(matches!(
            TokenState::classify(no_expiry, 0, window),
            TokenState::Expiring(_)
        ));
    }

    #[test]
    fn test_expiry_formats() {
        let numeric = parse_token(r#"{"refresh_token": "r", "expiry_date": "1700000000000"}"#).unwrap();
        assert_eq!(numeric.expiry_date, Some(1_700_000_000_000));

        let rfc = parse_token(r#"{"refresh_token": "r", "expiry_date": "2023-11-14T22:13:20Z"}"#).unwrap();
        assert_eq!(rfc.expiry_date, Some(1_700_000_000_000));

        let junk = parse_token(r#"{"refresh_token": "r", "expiry_date": "soon"}"#).unwrap();
        assert_eq!(junk.expiry_date, None);
    }

    #[test]
    fn test_parse_rejects_missing_refresh_token() {
        assert!(parse_token(r#"{"access_token": "a"}"#).is_err());
        assert!(parse_token(r#"{"refresh_token": "  "}"#).is_err());
        assert!(parse_token("not json").is_err());
        assert!(parse_token("[1, 2]").is_err());
    }

    #[test]
    fn test_merge_keeps_refresh_token_and_type() {
        let base = parse_token(r#"{"refresh_token": "keep", "token_type": "Custom", "expiry_date": 5}"#)
            .unwrap();
        let merged = base
            .merge_grant(
                TokenGrant {
                    access_token: "a".into(),
                    ..TokenGrant::default()
                },
                1_000,
            )
            .unwrap();
        assert_eq!(merged.refresh_token, "keep");
        assert_eq!(merged.token_type, "Custom");
        assert_eq!(merged.expiry_date, Some(5));

        let merged = base.merge_grant(fresh_grant(), 1_000).unwrap();
        assert_eq!(merged.expiry_date, Some(1_000 + 3_600_000));

        let blank = TokenGrant::default();
        assert!(matches!(base.merge_grant(blank, 0), Err(Error::Provider(_))));
    }

    #[tokio::test]
    async fn test_valid_token_returned_without_refresh_or_write() {
        let tmp = tempfile::tempdir().unwrap();
        let expiry = now_millis() + 3_600_000;
        let manager = manager_with(
            tmp.path(),
            Some(serde_json::json!({
                "access_token": "still-good",
                "refresh_token": "r",
                "expiry_date": expiry,
            })),
        );
        let before = fs::read_to_string(manager.token_path()).unwrap();

        assert_eq!(manager.ensure_valid(false).await.unwrap(), "still-good");
        assert_eq!(manager.ensure_valid(false).await.unwrap(), "still-good");

        assert_eq!(manager.provider().refresh_calls.load(Ordering::SeqCst), 0);
        assert_eq!(fs::read_to_string(manager.token_path()).unwrap(), before);
    }

    #[tokio::test]
    async fn test_expiring_token_refreshed_once_and_extra_keys_kept() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = manager_with(
            tmp.path(),
            Some(serde_json::json!({
                "access_token": "stale",
                "refresh_token": "r-1",
                "expiry_date": now_millis() + 10_000,
                "scope": "youtube",
                "custom_field": {"nested": true},
            })),
        );

        assert_eq!(manager.ensure_valid(false).await.unwrap(), "new-access");
        // second call sees the refreshed token as valid
        assert_eq!(manager.ensure_valid(false).await.unwrap(), "new-access");
        assert_eq!(manager.provider().refresh_calls.load(Ordering::SeqCst), 1);

        let saved = read_json(manager.token_path());
        assert_eq!(saved["refresh_token"], "r-1");
        assert_eq!(saved["token_type"], "Bearer");
        assert_eq!(saved["custom_field"]["nested"], true);
        assert!(saved["expiry_date"].as_i64().unwrap() > now_millis() + 3_000_000);
        assert!(!tmp.path().join("token.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_force_refresh_on_valid_token() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = manager_with(
            tmp.path(),
            Some(serde_json::json!({
                "access_token": "revoked",
                "refresh_token": "r",
                "expiry_date": now_millis() + 3_600_000,
            })),
        );
        assert_eq!(manager.ensure_valid(true).await.unwrap(), "new-access");
        assert_eq!(manager.provider().refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let tmp = tempfile::tempdir().unwrap();
        let mut manager = manager_with(
            tmp.path(),
            Some(serde_json::json!({"refresh_token": "r"})),
        );
        manager.provider.delay = Duration::from_millis(50);
        let manager = Arc::new(manager);

        let mut handles = Vec::new();
        for _ in 0..5 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move { manager.ensure_valid(false).await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "new-access");
        }
        assert_eq!(manager.provider().refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unusable_files_require_auth() {
        let tmp = tempfile::tempdir().unwrap();

        let missing = manager_with(tmp.path(), None);
        assert!(matches!(
            missing.ensure_valid(false).await,
            Err(Error::AuthRequired(_))
        ));

        let garbage = tmp.path().join("token.json");
        fs::write(&garbage, "{not json").unwrap();
        let invalid = manager_with(tmp.path(), None);
        assert!(matches!(
            invalid.ensure_valid(false).await,
            Err(Error::AuthRequired(_))
        ));

        let no_refresh = manager_with(tmp.path(), Some(serde_json::json!({"access_token": "a"})));
        assert!(matches!(
            no_refresh.ensure_valid(true).await,
            Err(Error::AuthRequired(_))
        ));
        assert_eq!(no_refresh.provider().refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_provider_failure_leaves_file_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = manager_with(tmp.path(), Some(serde_json::json!({"refresh_token": "r"})));
        *manager.provider().refresh_error.lock().unwrap() = Some("invalid_grant".into());
        let before = fs::read_to_string(manager.token_path()).unwrap();

        let err = manager.ensure_valid(false).await.unwrap_err();
        assert!(matches!(err, Error::Provider(ref m) if m == "invalid_grant"));
        assert_eq!(fs::read_to_string(manager.token_path()).unwrap(), before);
    }

    #[tokio::test]
    async fn test_store_authorized_requires_refresh_token() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = manager_with(tmp.path(), None);
        let err = manager.store_authorized(fresh_grant()).await.unwrap_err();
        assert!(matches!(err, Error::Provider(_)));
        assert!(!manager.token_path().exists());
    }

    #[tokio::test]
    async fn test_expired_token_refreshed_once_keeping_refresh_token() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = manager_with(
            tmp.path(),
            Some(serde_json::json!({
                "access_token": "expired",
                "refresh_token": "r-keep",
                "expiry_date": now_millis() - 1_000,
            })),
        );

        assert_eq!(manager.ensure_valid(false).await.unwrap(), "new-access");
        assert_eq!(manager.provider().refresh_calls.load(Ordering::SeqCst), 1);

        let saved = read_json(manager.token_path());
        assert_eq!(saved["access_token"], "new-access");
        assert_eq!(saved["refresh_token"], "r-keep");
        assert!(saved["expiry_date"].as_i64().unwrap() > now_millis());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_rename_removes_temp_file() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = manager_with(tmp.path(), None);
        fs::create_dir(manager.token_path()).unwrap();
        fs::write(manager.token_path().join("occupied"), b"x").unwrap();

        let token = parse_token(r#"{"access_token": "a", "refresh_token": "r"}"#).unwrap();
        assert!(manager.persist(&token).await.is_err());
        assert!(!tmp.path().join("token.json.tmp").exists());
        assert!(manager.token_path().is_dir());
    }
}
