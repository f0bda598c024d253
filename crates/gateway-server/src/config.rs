use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub manifest: ManifestConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_admin_addr")]
    pub admin_addr: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UpstreamConfig {
    pub url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_app_name")]
    pub app_name: String,
    /// Generation token baked into store names. Bump it on deploy to
    /// install a fresh static store and evict every older generation at
    /// activation.
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,
    #[serde(default = "default_document_suffixes")]
    pub document_suffixes: Vec<String>,
    #[serde(default = "default_offline_fallback_path")]
    pub offline_fallback_path: String,
    /// Entry cap for the dynamic store. Unset means captured entries are
    /// never evicted individually — only whole-generation deletion at
    /// activation reclaims them.
    #[serde(default)]
    pub dynamic_capacity: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ManifestConfig {
    /// Paths prefetched into the static store at install. Must include
    /// the offline fallback path for the app-shell guarantee to hold.
    #[serde(default = "default_manifest_paths")]
    pub paths: Vec<String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        Config {
            server: ServerConfig::default(),
            upstream: UpstreamConfig {
                url: "http://127.0.0.1:3000".to_string(),
                timeout_ms: default_timeout_ms(),
            },
            cache: CacheConfig::default(),
            manifest: ManifestConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            admin_addr: default_admin_addr(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            app_name: default_app_name(),
            version: default_version(),
            api_prefix: default_api_prefix(),
            document_suffixes: default_document_suffixes(),
            offline_fallback_path: default_offline_fallback_path(),
            dynamic_capacity: None,
        }
    }
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            paths: default_manifest_paths(),
        }
    }
}

/// What a reloaded config requires of the running gateway.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReloadPlan {
    /// Install and activate a generation, then swap the engine.
    pub reinstall: bool,
    /// Swap the engine on the current stores (classifier or upstream
    /// changed, generation did not).
    pub rebuild_engine: bool,
}

/// Compare old and new config, decide what can be applied at runtime,
/// warn about what cannot.
///
/// - version or manifest changed → reinstall (new generation)
/// - classifier/upstream/fallback/capacity changed → engine rebuild
/// - listen addresses or db path changed → WARN log, ignore (restart required)
pub fn diff(old: &Config, new: &Config) -> ReloadPlan {
    let mut plan = ReloadPlan::default();

    if old.server != new.server {
        tracing::warn!(
            old = ?old.server,
            new = ?new.server,
            "listen address change detected — ignoring. Restart to rebind"
        );
    }
    if old.cache.db_path != new.cache.db_path {
        tracing::warn!(
            old = %old.cache.db_path,
            new = %new.cache.db_path,
            "cache db path change detected — ignoring. Restart to switch databases"
        );
    }

    if old.cache.version != new.cache.version || old.manifest != new.manifest {
        plan.reinstall = true;
        plan.rebuild_engine = true;
        return plan;
    }

    if old.upstream != new.upstream
        || old.cache.api_prefix != new.cache.api_prefix
        || old.cache.document_suffixes != new.cache.document_suffixes
        || old.cache.offline_fallback_path != new.cache.offline_fallback_path
        || old.cache.dynamic_capacity != new.cache.dynamic_capacity
    {
        plan.rebuild_engine = true;
    }

    plan
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_admin_addr() -> String {
    "0.0.0.0:9090".to_string()
}
fn default_timeout_ms() -> u64 {
    5000
}
fn default_db_path() -> String {
    "satchel.db".to_string()
}
fn default_app_name() -> String {
    "satchel".to_string()
}
fn default_version() -> String {
    "v1".to_string()
}
fn default_api_prefix() -> String {
    "/api/".to_string()
}
fn default_document_suffixes() -> Vec<String> {
    vec![".pdf".to_string()]
}
fn default_offline_fallback_path() -> String {
    "/".to_string()
}
fn default_manifest_paths() -> Vec<String> {
    vec!["/".to_string()]
}
