//! Maps logical template references onto physical sources.
//!
//! Rules are tried in a fixed order and the first that claims a reference
//! wins, with no fallthrough:
//!
//! 1. an override registered at runtime,
//! 2. the `admin/` namespace, served from `admin/templates/` under the admin root,
//! 3. the active theme, served from `<theme>/templates/` under the themes root.
//!
//! Any reference starting with `admin/` is routed to the admin namespace, even
//! when a theme ships a template under that name.

use crate::config::{validate_theme_name, ConfigStore, THEME_KEY};
use crate::errors::{AppError, AppResult};
use crate::templates::loader::TemplateLoader;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

pub const ADMIN_PREFIX: &str = "admin/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    Override,
    AdminNamespace,
    ThemeNamespace,
}

pub const RESOLUTION_ORDER: [Rule; 3] = [Rule::Override, Rule::AdminNamespace, Rule::ThemeNamespace];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Override,
    File { rule: Rule, root: PathBuf, path: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Freshness {
    Always,
    Modified { path: PathBuf, at: Option<SystemTime> },
}

impl Freshness {
    pub fn is_fresh(&self) -> bool {
        match self {
            Self::Always => true,
            Self::Modified { path, at } => {
                let current = std::fs::metadata(path).and_then(|metadata| metadata.modified()).ok();
                current.is_some() && current == *at
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateSource {
    pub text: String,
    /// Reference for overrides, file path otherwise.
    pub origin: String,
    pub freshness: Freshness,
    /// Overrides may be replaced at any time and are never cached.
    pub cacheable: bool,
}

/// Template substitutions registered by extensions. Last write for a key wins.
#[derive(Debug, Default)]
pub struct OverrideMap {
    entries: RwLock<HashMap<String, String>>,
}

impl OverrideMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, reference: &str, source: &str) -> AppResult<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| AppError::Internal("override map lock poisoned".to_string()))?;
        if entries.insert(reference.to_string(), source.to_string()).is_some() {
            tracing::debug!(reference, "replaced template override");
        }
        Ok(())
    }

    pub fn get(&self, reference: &str) -> AppResult<Option<String>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| AppError::Internal("override map lock poisoned".to_string()))?;
        Ok(entries.get(reference).cloned())
    }

    pub fn contains(&self, reference: &str) -> bool {
        self.entries
            .read()
            .map(|entries| entries.contains_key(reference))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct ThemeResolver {
    overrides: Arc<OverrideMap>,
    store: Arc<dyn ConfigStore>,
    loader: Arc<dyn TemplateLoader>,
    themes_root: PathBuf,
    admin_root: PathBuf,
}

impl ThemeResolver {
    pub fn new(
        overrides: Arc<OverrideMap>,
        store: Arc<dyn ConfigStore>,
        loader: Arc<dyn TemplateLoader>,
        themes_root: &Path,
        admin_root: &Path,
    ) -> Self {
        Self {
            overrides,
            store,
            loader,
            themes_root: themes_root.to_path_buf(),
            admin_root: admin_root.to_path_buf(),
        }
    }

    pub fn overrides(&self) -> &Arc<OverrideMap> {
        &self.overrides
    }

    /// Reads the configured theme on every call so a switch applies to the
    /// next render.
    pub fn active_theme(&self) -> AppResult<String> {
        let theme = self
            .store
            .get(THEME_KEY)?
            .ok_or_else(|| AppError::ConfigurationMissing(format!("'{}' is not set", THEME_KEY)))?;
        validate_theme_name(&theme)?;
        Ok(theme)
    }

    pub fn route(&self, reference: &str) -> AppResult<Route> {
        for rule in RESOLUTION_ORDER {
            if let Some(route) = self.apply(rule, reference)? {
                return Ok(route);
            }
        }
        Err(AppError::TemplateNotFound(reference.to_string()))
    }

    fn apply(&self, rule: Rule, reference: &str) -> AppResult<Option<Route>> {
        let route = match rule {
            Rule::Override => self.overrides.contains(reference).then_some(Route::Override),
            Rule::AdminNamespace => reference.strip_prefix(ADMIN_PREFIX).map(|rest| Route::File {
                rule,
                root: self.admin_root.clone(),
                path: format!("admin/templates/{}", rest),
            }),
            Rule::ThemeNamespace => Some(Route::File {
                rule,
                root: self.themes_root.clone(),
                path: format!("{}/templates/{}", self.active_theme()?, reference),
            }),
        };
        Ok(route)
    }

    pub fn get_source(&self, reference: &str) -> AppResult<TemplateSource> {
        // Read the override directly so a concurrent insert between routing
        // and lookup cannot lose the match.
        if let Some(text) = self.overrides.get(reference)? {
            return Ok(TemplateSource {
                text,
                origin: reference.to_string(),
                freshness: Freshness::Always,
                cacheable: false,
            });
        }

        match self.route(reference)? {
            Route::Override => Err(AppError::TemplateNotFound(reference.to_string())),
            Route::File { rule, root, path } => {
                let loaded = self
                    .loader
                    .load(&root, &path)?
                    .ok_or_else(|| AppError::TemplateNotFound(reference.to_string()))?;
                tracing::trace!(reference, rule = ?rule, path = %loaded.path.display(), "resolved template");
                Ok(TemplateSource {
                    text: loaded.text,
                    origin: loaded.path.display().to_string(),
                    freshness: Freshness::Modified {
                        path: loaded.path,
                        at: loaded.modified,
                    },
                    cacheable: true,
                })
            }
        }
    }
}
