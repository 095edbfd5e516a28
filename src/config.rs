use crate::errors::{AppError, AppResult};
use crate::models::DowngradePolicy;
use std::path::{Path, PathBuf};

pub const VERSION_KEY: &str = "platform_version";
pub const THEME_KEY: &str = "active_theme";
pub const DEFAULT_THEME: &str = "core";

/// Persisted key/value configuration shared by every process using the
/// database. Writes go through the store's own consistency mechanism.
pub trait ConfigStore: Send + Sync {
    fn get(&self, key: &str) -> AppResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> AppResult<()>;
}

/// Process-level settings resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub database_url: String,
    pub themes_dir: PathBuf,
    pub admin_dir: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub default_theme: String,
    pub downgrade_policy: DowngradePolicy,
    pub follow_symlinks: bool,
}

impl AppConfig {
    /// Defaults for an installation rooted at `root`.
    pub fn with_root(root: &Path) -> Self {
        let themes_dir = root.join("themes");
        Self {
            database_url: format!("sqlite://{}", root.join("stagehand.db").to_string_lossy()),
            admin_dir: themes_dir.clone(),
            themes_dir,
            log_dir: None,
            default_theme: DEFAULT_THEME.to_string(),
            downgrade_policy: DowngradePolicy::default(),
            follow_symlinks: true,
        }
    }

    pub fn from_env() -> AppResult<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |key: &str| lookup(key).map(|raw| raw.trim().to_string()).filter(|raw| !raw.is_empty());

        let root = match value("STAGEHAND_ROOT") {
            Some(root) => PathBuf::from(root),
            None => std::env::current_dir().map_err(|err| {
                AppError::ConfigurationMissing(format!("STAGEHAND_ROOT unset and cwd unavailable: {}", err))
            })?,
        };
        let mut config = Self::with_root(&root);

        if let Some(url) = value("DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(dir) = value("STAGEHAND_THEMES_DIR") {
            config.themes_dir = PathBuf::from(dir);
            config.admin_dir = config.themes_dir.clone();
        }
        if let Some(dir) = value("STAGEHAND_ADMIN_DIR") {
            config.admin_dir = PathBuf::from(dir);
        }
        config.log_dir = value("STAGEHAND_LOG_DIR").map(PathBuf::from);
        if let Some(theme) = value("STAGEHAND_DEFAULT_THEME") {
            validate_theme_name(&theme)?;
            config.default_theme = theme;
        }
        if let Some(policy) = value("STAGEHAND_DOWNGRADE_POLICY") {
            config.downgrade_policy = DowngradePolicy::parse(&policy)?;
        }
        if let Some(flag) = value("STAGEHAND_FOLLOW_SYMLINKS") {
            config.follow_symlinks = parse_flag("STAGEHAND_FOLLOW_SYMLINKS", &flag)?;
        }

        Ok(config)
    }
}

/// Theme identifiers become a single path segment under the themes root.
pub fn validate_theme_name(theme: &str) -> AppResult<()> {
    let valid = !theme.is_empty()
        && theme != "."
        && theme != ".."
        && theme
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.');
    if !valid {
        return Err(AppError::InvalidConfiguration(format!(
            "theme '{}' is not a valid theme identifier",
            theme
        )));
    }
    Ok(())
}

fn parse_flag(key: &str, raw: &str) -> AppResult<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(AppError::InvalidConfiguration(format!("{} must be a boolean, got '{}'", key, raw))),
    }
}
