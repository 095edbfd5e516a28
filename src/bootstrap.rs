use crate::app::{App, Extension};
use crate::config::{validate_theme_name, AppConfig, ConfigStore, THEME_KEY, VERSION_KEY};
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::migrate::{ControlChannel, MigrationOrchestrator};
use crate::models::{DatabaseDescriptor, DowngradePolicy};
use crate::redaction::redact_database_url;
use crate::templates::loader::FileSystemLoader;
use crate::templates::resolver::{OverrideMap, ThemeResolver};
use crate::templates::sandbox::SandboxedEnvironment;
use crate::version::{self, SchemaVersion, VersionCheck};
use std::sync::Arc;

/// Startup sequence producing a ready [`App`]. Any failure returns before the
/// handle exists, so nothing can be served against a stale schema.
pub struct Bootstrap {
    config: AppConfig,
    extensions: Vec<Box<dyn Extension>>,
    database: Option<Database>,
}

impl Bootstrap {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            extensions: Vec::new(),
            database: None,
        }
    }

    /// Extensions run in registration order once every handler is in place.
    pub fn with_extension(mut self, extension: impl Extension + 'static) -> Self {
        self.extensions.push(Box::new(extension));
        self
    }

    /// Uses an already-open database instead of connecting from the
    /// configured URL. This is how engines without a bundled connector plug in.
    pub fn with_database(mut self, database: Database) -> Self {
        self.database = Some(database);
        self
    }

    pub fn run(self, channel: &mut dyn ControlChannel) -> AppResult<App> {
        let Self {
            config,
            extensions,
            database,
        } = self;

        let database = match database {
            Some(database) => database,
            None => {
                let descriptor = DatabaseDescriptor::parse(&config.database_url)?;
                tracing::info!(
                    url = %redact_database_url(&descriptor.url),
                    driver = descriptor.driver.as_str(),
                    "connecting to database"
                );
                Database::connect(&descriptor)?
            }
        };
        let database = Arc::new(database);
        let driver = database.descriptor().driver;

        let orchestrator = MigrationOrchestrator::new(database.as_ref(), driver);
        let report = orchestrator.prepare_schema()?;
        tracing::info!(
            strategy = ?report.strategy,
            revision = ?report.revision,
            applied = report.applied.len(),
            "schema prepared"
        );

        let running = SchemaVersion::running()?;
        let persisted = database
            .get(VERSION_KEY)?
            .map(|raw| raw.parse::<SchemaVersion>())
            .transpose()?;

        match version::check(persisted, running) {
            VersionCheck::FreshInstall => {
                database.set(VERSION_KEY, &running.to_string())?;
                tracing::info!(version = %running, "fresh install stamped");
            }
            VersionCheck::UpToDate => {
                tracing::debug!(version = %running, "database version is current");
            }
            VersionCheck::Upgrade { from, to } => {
                orchestrator.run_upgrade(database.as_ref(), channel, from, to)?;
            }
            VersionCheck::Downgrade { from, to } => match config.downgrade_policy {
                DowngradePolicy::Proceed => {
                    tracing::warn!(persisted = %from, running = %to, "database is newer than this build; continuing");
                }
                DowngradePolicy::Refuse => {
                    return Err(AppError::MigrationAborted(format!(
                        "database version {} is newer than running version {}",
                        from, to
                    )));
                }
            },
        }

        if database.get(THEME_KEY)?.is_none() {
            validate_theme_name(&config.default_theme)?;
            database.set(THEME_KEY, &config.default_theme)?;
            tracing::info!(theme = %config.default_theme, "default theme assigned");
        }

        let resolver = ThemeResolver::new(
            Arc::new(OverrideMap::new()),
            database.clone(),
            Arc::new(FileSystemLoader::new(config.follow_symlinks)),
            &config.themes_dir,
            &config.admin_dir,
        );
        let env = SandboxedEnvironment::new(Arc::new(resolver));

        let mut app = App::new(database, env, running);
        app.register_default_hooks();
        app.register_default_error_handlers();
        for extension in &extensions {
            app.load_extension(extension.as_ref())?;
        }

        tracing::info!(version = %running, extensions = app.loaded_extensions().len(), "application ready");
        Ok(app)
    }
}
