//! Layered gateway configuration.
//!
//! Built-in defaults, then an optional TOML file, then `LOOM_`-prefixed
//! environment variables (`__` separates sections, e.g.
//! `LOOM_SANDBOX__CUSTOM__TIMEOUT_MS=2000`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use loom_core::RouteKind;
use loom_executor::{
    SandboxLimits, DEFAULT_CUSTOM_TIMEOUT, DEFAULT_INSTRUCTION_INTERVAL, DEFAULT_LOGIC_TIMEOUT,
    DEFAULT_MEMORY_LIMIT_BYTES, DEFAULT_MAX_CONCURRENT,
};
use serde::{Deserialize, Serialize};

/// Top-level configuration, shared read-only by every component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoomConfig {
    pub server: ServerConfig,
    pub admin: AdminConfig,
    pub storage: StorageConfig,
    pub sandbox: SandboxConfig,
    pub packages: PackagesConfig,
    pub auth: AuthConfig,
    pub plans: PlansConfig,
    pub rate_limit: RateLimitConfig,
}

impl LoomConfig {
    /// Loads defaults, then `path` if it exists, then the environment.
    ///
    /// # Errors
    /// Returns a [`figment::Error`] if the file or an environment variable
    /// holds a value of the wrong shape.
    pub fn load(path: &Path) -> Result<Self, figment::Error> {
        Self::figment(path).extract()
    }

    /// The provider stack behind [`LoomConfig::load`].
    #[must_use]
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("LOOM_").split("__"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Take the caller address from the first `X-Forwarded-For` hop.
    pub trust_forwarded_for: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { listen_addr: "127.0.0.1:3456".to_owned(), trust_forwarded_for: false }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Bearer token for `/admin`. The admin API is open when unset.
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub sqlite_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { backend: StorageBackend::Memory, sqlite_path: PathBuf::from("loom.db") }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantConfig {
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub memory_limit_bytes: usize,
    pub instruction_interval: u32,
    pub max_concurrent: usize,
    /// Include Lua stack traces in HTTP error envelopes.
    pub expose_stack_traces: bool,
    pub custom: VariantConfig,
    pub logic: VariantConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT_BYTES,
            instruction_interval: DEFAULT_INSTRUCTION_INTERVAL,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            expose_stack_traces: false,
            custom: VariantConfig { timeout_ms: duration_ms(DEFAULT_CUSTOM_TIMEOUT) },
            logic: VariantConfig { timeout_ms: duration_ms(DEFAULT_LOGIC_TIMEOUT) },
        }
    }
}

impl SandboxConfig {
    /// Execution limits for routes of `kind`.
    #[must_use]
    pub fn limits_for(&self, kind: RouteKind) -> SandboxLimits {
        let variant = match kind {
            RouteKind::Custom => self.custom,
            RouteKind::Logic => self.logic,
        };
        SandboxLimits::with_timeout(Duration::from_millis(variant.timeout_ms))
            .memory_limit(self.memory_limit_bytes)
            .instruction_interval(self.instruction_interval)
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackagesConfig {
    /// Local package directory. Takes precedence over `registry_url`.
    pub registry_dir: Option<PathBuf>,
    pub registry_url: Option<String>,
    /// Root of the per-route installed module directories.
    pub modules_dir: PathBuf,
}

impl Default for PackagesConfig {
    fn default() -> Self {
        Self {
            registry_dir: None,
            registry_url: None,
            modules_dir: PathBuf::from("loom-modules"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 secret for session tokens. No caller authenticates when unset.
    pub jwt_secret: Option<String>,
    pub session_cookie: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self { jwt_secret: None, session_cookie: "loom_session".to_owned() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlansConfig {
    pub default_plan: String,
    pub upgrade_url: String,
    /// User id to plan name.
    pub assignments: BTreeMap<String, String>,
}

impl Default for PlansConfig {
    fn default() -> Self {
        Self {
            default_plan: "free".to_owned(),
            upgrade_url: "/pricing".to_owned(),
            assignments: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub prune_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { prune_interval_secs: 3600 }
    }
}
