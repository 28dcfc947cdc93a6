//! Server configuration.

use std::path::PathBuf;
use std::time::Duration;

use loops_core::{Error, Result};
use loops_sos::channels::email::{DEFAULT_APP_URL, DEFAULT_FROM_EMAIL};
use loops_sos::limits::{
    AdmissionPolicy, DEFAULT_COOLDOWN_SECS, DEFAULT_MAX_TRIGGERS, DEFAULT_WINDOW_SECS,
};
use loops_sos::orchestrator::{
    DEFAULT_ATTEMPT_TIMEOUT, DEFAULT_LEASE, DEFAULT_MAX_CONCURRENT_ATTEMPTS, DEFAULT_WORKERS,
    OrchestratorConfig,
};

const MIN_ATTEMPT_TIMEOUT_SECS: u64 = 1;
const MAX_ATTEMPT_TIMEOUT_SECS: u64 = 9;

/// Configuration for the Loops API server.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server port.
    pub http_port: u16,

    /// Enable debug mode.
    ///
    /// When enabled:
    /// - the caller is identified by the `X-User-Id` header (dev/tests)
    /// - a missing SendGrid key falls back to the logging transport silently
    ///
    /// When disabled:
    /// - `Authorization: Bearer <jwt>` is required
    pub debug: bool,

    /// JWT authentication configuration (used when `debug` is false).
    pub jwt: JwtConfig,

    /// Trigger admission limits.
    pub sos: SosLimitsConfig,

    /// Notification cascade tuning.
    pub notify: NotifyConfig,

    /// Audit log settings.
    pub audit: AuditConfig,

    /// Email provider settings.
    pub email: EmailConfig,

    /// Push gateway settings.
    pub push: PushConfig,

    /// JSON file of profiles, contacts and circle memberships loaded into the
    /// in-memory directory at startup.
    pub directory_seed_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 8080,
            debug: false,
            jwt: JwtConfig::default(),
            sos: SosLimitsConfig::default(),
            notify: NotifyConfig::default(),
            audit: AuditConfig::default(),
            email: EmailConfig::default(),
            push: PushConfig::default(),
            directory_seed_path: None,
        }
    }
}

/// JWT configuration for production authentication.
#[derive(Clone, Default)]
pub struct JwtConfig {
    /// HS256 secret used to verify bearer tokens.
    pub hs256_secret: Option<String>,
    /// Optional issuer (`iss`) to enforce.
    pub issuer: Option<String>,
    /// Optional audience (`aud`) to enforce.
    pub audience: Option<String>,
}

impl std::fmt::Debug for JwtConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtConfig")
            .field("hs256_secret", &self.hs256_secret.as_ref().map(|_| "[REDACTED]"))
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .finish()
    }
}

/// Rolling-window trigger limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SosLimitsConfig {
    /// Triggers allowed per window.
    pub max_triggers: u32,
    /// Window length in seconds.
    pub window_secs: u64,
    /// Cooldown length in seconds.
    pub cooldown_secs: u64,
}

impl Default for SosLimitsConfig {
    fn default() -> Self {
        Self {
            max_triggers: DEFAULT_MAX_TRIGGERS,
            window_secs: DEFAULT_WINDOW_SECS.unsigned_abs(),
            cooldown_secs: DEFAULT_COOLDOWN_SECS.unsigned_abs(),
        }
    }
}

impl SosLimitsConfig {
    /// The admission policy these limits describe.
    #[must_use]
    pub fn policy(&self) -> AdmissionPolicy {
        AdmissionPolicy {
            max_triggers: self.max_triggers,
            window: seconds(self.window_secs),
            cooldown: seconds(self.cooldown_secs),
        }
    }
}

/// Notification cascade tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifyConfig {
    /// Global bound on simultaneous channel attempts.
    pub max_concurrent_attempts: usize,
    /// Per-attempt timeout in seconds (1-9).
    pub attempt_timeout_secs: u64,
    /// Dispatch workers to run.
    pub workers: usize,
    /// Dispatch lease in seconds.
    pub lease_secs: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_attempts: DEFAULT_MAX_CONCURRENT_ATTEMPTS,
            attempt_timeout_secs: DEFAULT_ATTEMPT_TIMEOUT.as_secs(),
            workers: DEFAULT_WORKERS,
            lease_secs: DEFAULT_LEASE.as_secs(),
        }
    }
}

/// Audit log settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditConfig {
    /// JSON-lines file to append to; in memory when unset.
    pub log_path: Option<PathBuf>,
    /// Days an entry stays queryable.
    pub retention_days: i64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            log_path: None,
            retention_days: loops_sos::audit::DEFAULT_RETENTION_DAYS,
        }
    }
}

/// Email provider settings.
#[derive(Clone)]
pub struct EmailConfig {
    /// SendGrid API key; the logging transport is used when unset.
    pub sendgrid_api_key: Option<String>,
    /// Sender address.
    pub from_email: String,
    /// Public app URL for links in emails.
    pub app_url: String,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            sendgrid_api_key: None,
            from_email: DEFAULT_FROM_EMAIL.to_string(),
            app_url: DEFAULT_APP_URL.to_string(),
        }
    }
}

impl std::fmt::Debug for EmailConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailConfig")
            .field("sendgrid_api_key", &self.sendgrid_api_key.as_ref().map(|_| "[REDACTED]"))
            .field("from_email", &self.from_email)
            .field("app_url", &self.app_url)
            .finish()
    }
}

/// Push gateway settings.
#[derive(Clone, Default)]
pub struct PushConfig {
    /// Gateway endpoint; push is disabled when unset.
    pub endpoint: Option<String>,
    /// Bearer token sent to the gateway.
    pub bearer_token: Option<String>,
}

impl std::fmt::Debug for PushConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushConfig")
            .field("endpoint", &self.endpoint)
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// Supported env vars:
    /// - `LOOPS_HTTP_PORT`
    /// - `LOOPS_DEBUG`
    /// - `LOOPS_JWT_SECRET`
    /// - `LOOPS_JWT_ISSUER`
    /// - `LOOPS_JWT_AUDIENCE`
    /// - `LOOPS_SOS_MAX_TRIGGERS`
    /// - `LOOPS_SOS_WINDOW_SECS`
    /// - `LOOPS_SOS_COOLDOWN_SECS`
    /// - `LOOPS_NOTIFY_MAX_CONCURRENT_ATTEMPTS`
    /// - `LOOPS_NOTIFY_ATTEMPT_TIMEOUT_SECS` (1-9, default: 5)
    /// - `LOOPS_NOTIFY_WORKERS`
    /// - `LOOPS_DISPATCH_LEASE_SECS`
    /// - `LOOPS_AUDIT_LOG_PATH`
    /// - `LOOPS_AUDIT_RETENTION_DAYS`
    /// - `LOOPS_SENDGRID_API_KEY`
    /// - `LOOPS_FROM_EMAIL`
    /// - `LOOPS_APP_URL`
    /// - `LOOPS_PUSH_ENDPOINT`
    /// - `LOOPS_PUSH_BEARER_TOKEN`
    /// - `LOOPS_DIRECTORY_SEED_PATH`
    ///
    /// # Errors
    ///
    /// Returns an error if any environment variable is present but cannot be
    /// parsed or is out of range.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration through `lookup` instead of the process environment.
    ///
    /// # Errors
    ///
    /// See [`Config::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = Env(lookup);
        let mut config = Self::default();

        if let Some(port) = env.u16("LOOPS_HTTP_PORT")? {
            config.http_port = port;
        }
        if let Some(debug) = env.bool("LOOPS_DEBUG")? {
            config.debug = debug;
        }

        config.jwt.hs256_secret = env.string("LOOPS_JWT_SECRET");
        config.jwt.issuer = env.string("LOOPS_JWT_ISSUER");
        config.jwt.audience = env.string("LOOPS_JWT_AUDIENCE");

        if let Some(max) = env.u64("LOOPS_SOS_MAX_TRIGGERS")? {
            config.sos.max_triggers = u32::try_from(max)
                .ok()
                .filter(|max| *max > 0)
                .ok_or_else(|| {
                    Error::InvalidInput("LOOPS_SOS_MAX_TRIGGERS must be between 1 and u32::MAX".to_string())
                })?;
        }
        if let Some(secs) = env.u64("LOOPS_SOS_WINDOW_SECS")? {
            config.sos.window_secs = positive("LOOPS_SOS_WINDOW_SECS", secs)?;
        }
        if let Some(secs) = env.u64("LOOPS_SOS_COOLDOWN_SECS")? {
            config.sos.cooldown_secs = positive("LOOPS_SOS_COOLDOWN_SECS", secs)?;
        }

        if let Some(max) = env.usize("LOOPS_NOTIFY_MAX_CONCURRENT_ATTEMPTS")? {
            if max == 0 {
                return Err(Error::InvalidInput(
                    "LOOPS_NOTIFY_MAX_CONCURRENT_ATTEMPTS must be at least 1".to_string(),
                ));
            }
            config.notify.max_concurrent_attempts = max;
        }
        if let Some(secs) = env.u64("LOOPS_NOTIFY_ATTEMPT_TIMEOUT_SECS")? {
            if !(MIN_ATTEMPT_TIMEOUT_SECS..=MAX_ATTEMPT_TIMEOUT_SECS).contains(&secs) {
                return Err(Error::InvalidInput(format!(
                    "LOOPS_NOTIFY_ATTEMPT_TIMEOUT_SECS must be between {MIN_ATTEMPT_TIMEOUT_SECS} and {MAX_ATTEMPT_TIMEOUT_SECS} seconds"
                )));
            }
            config.notify.attempt_timeout_secs = secs;
        }
        if let Some(workers) = env.usize("LOOPS_NOTIFY_WORKERS")? {
            if workers == 0 {
                return Err(Error::InvalidInput(
                    "LOOPS_NOTIFY_WORKERS must be at least 1".to_string(),
                ));
            }
            config.notify.workers = workers;
        }
        if let Some(secs) = env.u64("LOOPS_DISPATCH_LEASE_SECS")? {
            config.notify.lease_secs = positive("LOOPS_DISPATCH_LEASE_SECS", secs)?;
        }

        config.audit.log_path = env.string("LOOPS_AUDIT_LOG_PATH").map(PathBuf::from);
        if let Some(days) = env.u64("LOOPS_AUDIT_RETENTION_DAYS")? {
            let days = positive("LOOPS_AUDIT_RETENTION_DAYS", days)?;
            config.audit.retention_days = i64::try_from(days).map_err(|_| {
                Error::InvalidInput("LOOPS_AUDIT_RETENTION_DAYS is too large".to_string())
            })?;
        }

        config.email.sendgrid_api_key = env.string("LOOPS_SENDGRID_API_KEY");
        if let Some(from) = env.string("LOOPS_FROM_EMAIL") {
            if !from.contains('@') {
                return Err(Error::InvalidInput(
                    "LOOPS_FROM_EMAIL must be an email address".to_string(),
                ));
            }
            config.email.from_email = from;
        }
        if let Some(url) = env.string("LOOPS_APP_URL") {
            config.email.app_url = url.trim_end_matches('/').to_string();
        }

        config.push.endpoint = env.string("LOOPS_PUSH_ENDPOINT");
        config.push.bearer_token = env.string("LOOPS_PUSH_BEARER_TOKEN");
        config.directory_seed_path = env.string("LOOPS_DIRECTORY_SEED_PATH").map(PathBuf::from);

        Ok(config)
    }

    /// Orchestrator settings derived from this configuration.
    #[must_use]
    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_concurrent_attempts: self.notify.max_concurrent_attempts,
            attempt_timeout: Duration::from_secs(self.notify.attempt_timeout_secs),
            workers: self.notify.workers,
            lease: Duration::from_secs(self.notify.lease_secs),
            retention: chrono::Duration::days(self.audit.retention_days),
            ..OrchestratorConfig::default()
        }
    }

    /// Checks settings that only matter once the server starts.
    ///
    /// # Errors
    ///
    /// Returns an error if production mode has no JWT secret.
    pub fn validate(&self) -> Result<()> {
        if !self.debug && self.jwt.hs256_secret.is_none() {
            return Err(Error::InvalidInput(
                "LOOPS_JWT_SECRET is required when LOOPS_DEBUG=false".to_string(),
            ));
        }
        Ok(())
    }
}

fn seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
}

fn positive(name: &str, value: u64) -> Result<u64> {
    if value == 0 {
        return Err(Error::InvalidInput(format!("{name} must be greater than 0")));
    }
    Ok(value)
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.0)(name).and_then(|v| {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    fn u16(&self, name: &str) -> Result<Option<u16>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<u16>()
            .map(Some)
            .map_err(|e| Error::InvalidInput(format!("{name} must be a u16: {e}")))
    }

    fn u64(&self, name: &str) -> Result<Option<u64>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<u64>()
            .map(Some)
            .map_err(|e| Error::InvalidInput(format!("{name} must be a u64: {e}")))
    }

    fn usize(&self, name: &str) -> Result<Option<usize>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<usize>()
            .map(Some)
            .map_err(|e| Error::InvalidInput(format!("{name} must be a usize: {e}")))
    }

    fn bool(&self, name: &str) -> Result<Option<bool>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        parse_bool(name, &v).map(Some)
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    let value = value.trim().to_ascii_lowercase();
    match value.as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => Err(Error::InvalidInput(format!(
            "{name} must be a boolean (true/false/1/0)"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_match_engine_defaults() -> Result<()> {
        let config = load(&[])?;
        assert_eq!(config.http_port, 8080);
        assert!(!config.debug);
        assert_eq!(config.sos.policy(), AdmissionPolicy::default());
        assert_eq!(config.orchestrator(), OrchestratorConfig::default());
        assert_eq!(config.email.from_email, "noreply@loops.app");
        assert!(config.audit.log_path.is_none());
        Ok(())
    }

    #[test]
    fn overrides_are_applied() -> Result<()> {
        let config = load(&[
            ("LOOPS_HTTP_PORT", "9000"),
            ("LOOPS_DEBUG", "yes"),
            ("LOOPS_SOS_MAX_TRIGGERS", "5"),
            ("LOOPS_SOS_COOLDOWN_SECS", "600"),
            ("LOOPS_NOTIFY_ATTEMPT_TIMEOUT_SECS", "3"),
            ("LOOPS_AUDIT_LOG_PATH", "/var/lib/loops/audit.jsonl"),
            ("LOOPS_APP_URL", "https://staging.loops.app/"),
        ])?;
        assert_eq!(config.http_port, 9000);
        assert!(config.debug);
        assert_eq!(config.sos.policy().max_triggers, 5);
        assert_eq!(config.sos.policy().cooldown, chrono::Duration::minutes(10));
        assert_eq!(config.orchestrator().attempt_timeout, Duration::from_secs(3));
        assert_eq!(
            config.audit.log_path,
            Some(PathBuf::from("/var/lib/loops/audit.jsonl"))
        );
        assert_eq!(config.email.app_url, "https://staging.loops.app");
        Ok(())
    }

    #[test]
    fn blank_values_are_unset() -> Result<()> {
        let config = load(&[("LOOPS_SENDGRID_API_KEY", "   "), ("LOOPS_HTTP_PORT", "")])?;
        assert!(config.email.sendgrid_api_key.is_none());
        assert_eq!(config.http_port, 8080);
        Ok(())
    }

    #[test]
    fn attempt_timeout_must_be_single_digit() {
        for value in ["0", "10", "60"] {
            let err = load(&[("LOOPS_NOTIFY_ATTEMPT_TIMEOUT_SECS", value)]).unwrap_err();
            assert!(matches!(err, Error::InvalidInput(_)), "{value}");
        }
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let err = load(&[("LOOPS_HTTP_PORT", "eighty")]).unwrap_err();
        assert!(err.to_string().contains("LOOPS_HTTP_PORT"));
        let err = load(&[("LOOPS_SOS_MAX_TRIGGERS", "0")]).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        let err = load(&[("LOOPS_DEBUG", "maybe")]).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn production_requires_jwt_secret() -> Result<()> {
        let config = load(&[])?;
        assert!(config.validate().is_err());
        let config = load(&[("LOOPS_JWT_SECRET", "s3cret")])?;
        config.validate()?;
        let config = load(&[("LOOPS_DEBUG", "true")])?;
        config.validate()?;
        Ok(())
    }

    #[test]
    fn secrets_are_not_debug_printed() -> Result<()> {
        let config = load(&[
            ("LOOPS_JWT_SECRET", "jwt-secret-value"),
            ("LOOPS_SENDGRID_API_KEY", "SG.key-value"),
            ("LOOPS_PUSH_BEARER_TOKEN", "push-token-value"),
        ])?;
        let printed = format!("{config:?}");
        assert!(!printed.contains("jwt-secret-value"));
        assert!(!printed.contains("SG.key-value"));
        assert!(!printed.contains("push-token-value"));
        Ok(())
    }
}
