//! Bearer credential ownership.
//!
//! The marketplace credential cannot be renewed programmatically: a fresh one
//! has to be observed from a signed-in session. [`TokenStore`] keeps the
//! current credential and its freshness, and asks a [`TokenSource`] for a new
//! one when the old one is rejected or stale.

use crate::engine::market::{FetchError, MarketFeed};
use crate::engine::snapshot::write_atomic;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tracing::{error, info, warn};

pub const TOKEN_PREFIX: &str = "tma ";

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token source unavailable: {0}")]
    Unavailable(String),
    #[error("credential rejected: {0}")]
    Rejected(String),
    #[error("token source timed out after {0:?}")]
    Timeout(Duration),
    /// The credential was kept but could not be checked against the API.
    #[error("credential could not be validated: {0}")]
    Unverified(String),
}

/// Out-of-band producer of fresh credentials.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn acquire(&self, timeout: Duration) -> Result<String, TokenError>;
}

/// Trims and prefixes an observed credential; anything that does not look
/// like a mini-app init string is refused.
pub fn normalize_token(raw: &str) -> Result<String, TokenError> {
    let trimmed = raw.trim();
    if trimmed.starts_with(TOKEN_PREFIX) && trimmed.len() > TOKEN_PREFIX.len() {
        return Ok(trimmed.to_string());
    }
    if trimmed.contains("query_id=") {
        return Ok(format!("{TOKEN_PREFIX}{trimmed}"));
    }
    Err(TokenError::Rejected(
        "expected a 'tma ' prefixed credential".to_string(),
    ))
}

#[derive(Debug, Clone)]
pub struct TokenPolicy {
    /// Persisted credentials younger than this are trusted without a probe.
    pub skip_validation: Duration,
    /// Credentials older than this are refreshed proactively.
    pub refresh_interval: Duration,
    /// Credentials older than this are discarded outright.
    pub max_age: Duration,
    pub acquire_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStatus {
    Trusted,
    Probed,
    Refreshed,
}

#[derive(Debug, Clone)]
struct Credential {
    value: String,
    updated_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct TokenStore {
    path: PathBuf,
    policy: TokenPolicy,
    current: Option<Credential>,
    rejected: Option<String>,
    refresh_in_progress: bool,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>, policy: TokenPolicy) -> Self {
        Self {
            path: path.into(),
            policy,
            current: None,
            rejected: None,
            refresh_in_progress: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get_current(&self) -> Option<&str> {
        self.current.as_ref().map(|c| c.value.as_str())
    }

    pub fn age(&self, now: DateTime<Utc>) -> Option<Duration> {
        let c = self.current.as_ref()?;
        Some((now - c.updated_at).to_std().unwrap_or(Duration::ZERO))
    }

    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        self.age(now)
            .is_some_and(|age| age > self.policy.refresh_interval)
    }

    /// Reads the credential file; its mtime is the freshness timestamp.
    pub fn load_persisted(&mut self) -> Result<bool> {
        if !self.path.exists() {
            return Ok(false);
        }
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("read {}", self.path.display()))?;
        let value = raw.trim().to_string();
        if value.is_empty() {
            return Ok(false);
        }
        if self.rejected.as_deref() == Some(value.as_str()) {
            info!("persisted credential was already rejected, ignoring it");
            return Ok(false);
        }
        let modified = std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .with_context(|| format!("stat {}", self.path.display()))?;
        self.current = Some(Credential {
            value,
            updated_at: DateTime::<Utc>::from(modified),
        });
        info!("loaded credential from file");
        Ok(true)
    }

    /// Entry point for freshly observed credentials; persists with "now".
    pub fn accept_observed(&mut self, raw: &str) -> Result<String, TokenError> {
        let value = normalize_token(raw)?;
        if let Err(e) = write_atomic(&self.path, value.as_bytes()) {
            warn!(err = %format!("{e:#}"), "could not persist credential");
        }
        if self.rejected.as_deref() == Some(value.as_str()) {
            self.rejected = None;
        }
        self.current = Some(Credential {
            value: value.clone(),
            updated_at: Utc::now(),
        });
        info!(preview = %preview(&value), "captured fresh credential");
        Ok(value)
    }

    /// Marks the current credential as rejected by the API (HTTP 401).
    pub fn invalidate(&mut self) {
        if let Some(c) = self.current.take() {
            self.rejected = Some(c.value);
        }
    }

    pub async fn refresh(&mut self, source: &dyn TokenSource) -> Result<(), TokenError> {
        if self.refresh_in_progress {
            return Err(TokenError::Unavailable(
                "refresh already in progress".to_string(),
            ));
        }
        self.refresh_in_progress = true;
        info!(timeout = ?self.policy.acquire_timeout, "requesting fresh credential");
        let acquired = source.acquire(self.policy.acquire_timeout).await;
        self.refresh_in_progress = false;

        let raw = acquired?;
        self.accept_observed(&raw)?;
        Ok(())
    }

    pub async fn ensure_valid(
        &mut self,
        feed: &dyn MarketFeed,
        source: &dyn TokenSource,
    ) -> Result<TokenStatus, TokenError> {
        self.ensure_valid_at(Utc::now(), feed, source).await
    }

    pub async fn ensure_valid_at(
        &mut self,
        now: DateTime<Utc>,
        feed: &dyn MarketFeed,
        source: &dyn TokenSource,
    ) -> Result<TokenStatus, TokenError> {
        if self.current.is_none() {
            if let Err(e) = self.load_persisted() {
                warn!(err = %format!("{e:#}"), "could not load credential file");
            }
        }

        if self.age(now).is_some_and(|age| age >= self.policy.max_age) {
            warn!("credential exceeded its maximum age, discarding");
            self.current = None;
        }

        let mut probed = false;
        match (self.age(now), self.get_current().map(str::to_string)) {
            (Some(age), Some(_)) if age < self.policy.skip_validation => {
                info!("credential is recent, skipping validation");
                return Ok(TokenStatus::Trusted);
            }
            (Some(age), Some(token)) if age < self.policy.refresh_interval => {
                probed = true;
                match feed.probe(&token).await {
                    Ok(()) => return Ok(TokenStatus::Probed),
                    Err(FetchError::TokenInvalid) => self.invalidate(),
                    Err(FetchError::Transient(e)) => {
                        warn!(err = %e, "could not validate credential, keeping it");
                        return Err(TokenError::Unverified(e));
                    }
                }
            }
            (Some(_), Some(_)) => info!("credential is stale, refreshing"),
            _ => info!("no usable credential, refreshing"),
        }

        match self.refresh(source).await {
            Ok(()) => Ok(TokenStatus::Refreshed),
            Err(e) => {
                if !probed {
                    if let Some(token) = self.get_current().map(str::to_string) {
                        match feed.probe(&token).await {
                            Ok(()) => {
                                warn!(err = %e, "refresh failed, stale credential still accepted");
                                return Ok(TokenStatus::Probed);
                            }
                            Err(FetchError::TokenInvalid) => self.invalidate(),
                            Err(FetchError::Transient(_)) => {}
                        }
                    }
                }
                error!(err = %e, "failed to obtain a valid credential");
                Err(e)
            }
        }
    }
}

fn preview(token: &str) -> String {
    let head: String = token.chars().take(24).collect();
    format!("{head}...")
}

/// Waits for an external helper to rewrite the credential file.
#[derive(Debug, Clone)]
pub struct FileWatchTokenSource {
    path: PathBuf,
    poll: Duration,
}

impl FileWatchTokenSource {
    pub fn new(path: impl Into<PathBuf>, poll: Duration) -> Self {
        Self {
            path: path.into(),
            poll,
        }
    }
}

#[async_trait]
impl TokenSource for FileWatchTokenSource {
    async fn acquire(&self, timeout: Duration) -> Result<String, TokenError> {
        let baseline = tokio::fs::read_to_string(&self.path)
            .await
            .ok()
            .map(|s| s.trim().to_string());
        info!(
            path = %self.path.display(),
            "waiting for a fresh credential to be written"
        );
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            tokio::time::sleep(self.poll).await;
            if let Ok(s) = tokio::fs::read_to_string(&self.path).await {
                let s = s.trim();
                if !s.is_empty() && baseline.as_deref() != Some(s) {
                    return Ok(s.to_string());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(TokenError::Timeout(timeout));
            }
        }
    }
}

/// Runs a helper command whose stdout carries the credential. The child is
/// killed on every exit path, including timeout.
#[derive(Debug, Clone)]
pub struct CommandTokenSource {
    command: String,
}

impl CommandTokenSource {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl TokenSource for CommandTokenSource {
    async fn acquire(&self, timeout: Duration) -> Result<String, TokenError> {
        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TokenError::Unavailable(format!("spawn token helper: {e}")))?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Err(_) => return Err(TokenError::Timeout(timeout)),
            Ok(Err(e)) => {
                return Err(TokenError::Unavailable(format!("token helper io: {e}")))
            }
            Ok(Ok(out)) => out,
        };
        if !output.status.success() {
            return Err(TokenError::Unavailable(format!(
                "token helper exited with {}",
                output.status
            )));
        }
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .last()
            .map(str::to_string)
            .ok_or_else(|| TokenError::Unavailable("token helper printed nothing".to_string()))
    }
}
