//! Cached bearer tokens.
//!
//! The token is acquired from an external credential source (by default
//! `gcloud auth print-access-token`) and reused until it is older than the
//! configured lifetime or until `force_refresh` is called after a 401.
//! Nothing is persisted: every process starts with an empty cache.

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info};

// =============================================================================
// Token + errors
// =============================================================================

/// A bearer token. `Debug` only shows the last few characters.
#[derive(Clone, PartialEq, Eq)]
pub struct Token(String);

impl Token {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tail: Vec<char> = self.0.chars().rev().take(4).collect();
        let tail: String = tail.into_iter().rev().collect();
        write!(f, "Token(…{})", tail)
    }
}

/// The credential source could not produce a token.
#[derive(Debug, Clone)]
pub enum AuthError {
    /// The credential command could not be started.
    Spawn { program: String, reason: String },
    /// The credential command exited unsuccessfully.
    CommandFailed { program: String, status: Option<i32>, stderr: String },
    /// The credential command did not finish in time and was killed.
    Timeout { program: String, after: Duration },
    /// The credential source returned nothing.
    EmptyToken,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spawn { program, reason } => {
                write!(f, "failed to run credential command `{}`: {}", program, reason)
            }
            Self::CommandFailed {
                program,
                status,
                stderr,
            } => write!(
                f,
                "credential command `{}` exited with {:?}: {}",
                program,
                status,
                stderr.trim()
            ),
            Self::Timeout { program, after } => write!(
                f,
                "credential command `{}` did not finish within {:?}",
                program, after
            ),
            Self::EmptyToken => write!(f, "credential source returned an empty token"),
        }
    }
}

impl std::error::Error for AuthError {}

// =============================================================================
// Sources
// =============================================================================

#[async_trait::async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch_token(&self) -> Result<Token, AuthError>;
}

/// Runs an external command and uses its trimmed stdout as the token.
#[derive(Debug, Clone)]
pub struct GcloudTokenSource {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

impl Default for GcloudTokenSource {
    fn default() -> Self {
        Self {
            program: "gcloud".to_string(),
            args: vec!["auth".to_string(), "print-access-token".to_string()],
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

impl GcloudTokenSource {
    pub fn with_command(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Kill the command and fail if it runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// `LILO_TOKEN_COMMAND` replaces the default gcloud invocation
    /// (whitespace separated, first word is the program).
    pub fn from_env() -> Self {
        match std::env::var("LILO_TOKEN_COMMAND") {
            Ok(cmd) if !cmd.trim().is_empty() => {
                let mut parts = cmd.split_whitespace().map(str::to_string);
                match parts.next() {
                    Some(program) => Self::with_command(program, parts.collect()),
                    None => Self::default(),
                }
            }
            _ => Self::default(),
        }
    }
}

#[async_trait::async_trait]
impl TokenSource for GcloudTokenSource {
    async fn fetch_token(&self) -> Result<Token, AuthError> {
        let run = Command::new(&self.program)
            .args(&self.args)
            .kill_on_drop(true)
            .output();

        let output = timeout(self.timeout, run)
            .await
            .map_err(|_| AuthError::Timeout {
                program: self.program.clone(),
                after: self.timeout,
            })?
            .map_err(|e| AuthError::Spawn {
                program: self.program.clone(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(AuthError::CommandFailed {
                program: self.program.clone(),
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }

        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if token.is_empty() {
            return Err(AuthError::EmptyToken);
        }
        Ok(Token(token))
    }
}

/// A fixed token, e.g. from `LILO_ACCESS_TOKEN`.
#[derive(Debug, Clone)]
pub struct StaticTokenSource {
    token: String,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait::async_trait]
impl TokenSource for StaticTokenSource {
    async fn fetch_token(&self) -> Result<Token, AuthError> {
        let token = self.token.trim();
        if token.is_empty() {
            return Err(AuthError::EmptyToken);
        }
        Ok(Token(token.to_string()))
    }
}

// =============================================================================
// Cache
// =============================================================================

struct CachedToken {
    token: Token,
    created_at: Instant,
}

/// Process-local token cache, shared by handle between the driver and the paginator.
pub struct TokenCache {
    source: Box<dyn TokenSource>,
    lifetime: Duration,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenCache {
    pub fn new(source: Box<dyn TokenSource>, lifetime: Duration) -> Self {
        Self {
            source,
            lifetime,
            cached: Mutex::new(None),
        }
    }

    /// Cached token, or a fresh one if the cache is empty or expired.
    pub async fn get_token(&self) -> Result<Token, AuthError> {
        {
            let cached = self.cached.lock();
            if let Some(c) = cached.as_ref() {
                if c.created_at.elapsed() < self.lifetime {
                    return Ok(c.token.clone());
                }
                debug!("Bearer token expired after {:?}", c.created_at.elapsed());
            }
        }

        let token = self.source.fetch_token().await?;
        info!("Acquired new bearer token");

        *self.cached.lock() = Some(CachedToken {
            token: token.clone(),
            created_at: Instant::now(),
        });
        Ok(token)
    }

    /// Drop the cached token so the next `get_token` asks the source again.
    pub fn force_refresh(&self) {
        self.cached.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSource {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl TokenSource for CountingSource {
        async fn fetch_token(&self) -> Result<Token, AuthError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Token::new(format!("token-{}", n)))
        }
    }

    struct FailingSource;

    #[async_trait::async_trait]
    impl TokenSource for FailingSource {
        async fn fetch_token(&self) -> Result<Token, AuthError> {
            Err(AuthError::EmptyToken)
        }
    }

    fn counting(lifetime: Duration) -> (TokenCache, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = TokenCache::new(
            Box::new(CountingSource {
                calls: calls.clone(),
            }),
            lifetime,
        );
        (cache, calls)
    }

    #[tokio::test]
    async fn token_is_reused_within_lifetime() {
        let (cache, calls) = counting(Duration::from_secs(600));

        let a = cache.get_token().await.unwrap();
        let b = cache.get_token().await.unwrap();

        assert_eq!(a, b);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_token_is_replaced() {
        let (cache, calls) = counting(Duration::ZERO);

        let a = cache.get_token().await.unwrap();
        let b = cache.get_token().await.unwrap();

        assert_ne!(a, b);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn force_refresh_invalidates_immediately() {
        let (cache, calls) = counting(Duration::from_secs(600));

        let a = cache.get_token().await.unwrap();
        cache.force_refresh();
        let b = cache.get_token().await.unwrap();

        assert_eq!(a.as_str(), "token-1");
        assert_eq!(b.as_str(), "token-2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn source_failure_surfaces_as_auth_error() {
        let cache = TokenCache::new(Box::new(FailingSource), Duration::from_secs(600));
        let err = cache.get_token().await.unwrap_err();
        assert!(matches!(err, AuthError::EmptyToken));
    }

    #[tokio::test]
    async fn static_source_trims_and_rejects_blank() {
        let ok = StaticTokenSource::new("  abc\n").fetch_token().await.unwrap();
        assert_eq!(ok.as_str(), "abc");
        assert!(StaticTokenSource::new(" ").fetch_token().await.is_err());
    }

    #[tokio::test]
    async fn missing_command_is_a_spawn_error() {
        let source = GcloudTokenSource::with_command("lilo-definitely-not-a-command", vec![]);
        let err = source.fetch_token().await.unwrap_err();
        assert!(matches!(err, AuthError::Spawn { .. }));
    }

    #[tokio::test]
    async fn hanging_command_times_out() {
        let source = GcloudTokenSource::with_command("sleep", vec!["30".to_string()])
            .with_timeout(Duration::from_millis(200));
        let cache = TokenCache::new(Box::new(source), Duration::from_secs(600));

        let started = Instant::now();
        let err = cache.get_token().await.unwrap_err();

        assert!(matches!(err, AuthError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn debug_hides_token() {
        let t = Token::new("secret-value-1234");
        assert_eq!(format!("{:?}", t), "Token(…1234)");
    }
}
