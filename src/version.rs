use crate::errors::{AppError, AppResult};
use std::fmt;
use std::str::FromStr;

/// Version of the running build. Persisted installs are compared against it.
pub const RUNNING_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SchemaVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl SchemaVersion {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self { major, minor, patch }
    }

    pub fn running() -> AppResult<Self> {
        RUNNING_VERSION.parse()
    }
}

impl FromStr for SchemaVersion {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        let parts = trimmed
            .split('.')
            .map(|segment| {
                if segment.is_empty() || !segment.chars().all(|ch| ch.is_ascii_digit()) {
                    return None;
                }
                segment.parse::<u64>().ok()
            })
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| AppError::InvalidVersion(format!("'{}' is not a numeric version", raw)))?;

        match parts.as_slice() {
            [major, minor] => Ok(Self::new(*major, *minor, 0)),
            [major, minor, patch] => Ok(Self::new(*major, *minor, *patch)),
            _ => Err(AppError::InvalidVersion(format!(
                "'{}' must have the form major.minor.patch",
                raw
            ))),
        }
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionCheck {
    FreshInstall,
    UpToDate,
    Upgrade { from: SchemaVersion, to: SchemaVersion },
    Downgrade { from: SchemaVersion, to: SchemaVersion },
}

pub fn check(persisted: Option<SchemaVersion>, running: SchemaVersion) -> VersionCheck {
    match persisted {
        None => VersionCheck::FreshInstall,
        Some(from) if from < running => VersionCheck::Upgrade { from, to: running },
        Some(from) if from > running => VersionCheck::Downgrade { from, to: running },
        Some(_) => VersionCheck::UpToDate,
    }
}

/// A fresh install and a persisted version at or beyond `running` both skip
/// migration; downgrades are reported separately through [`check`].
pub fn needs_migration(persisted: Option<&SchemaVersion>, running: &SchemaVersion) -> bool {
    matches!(check(persisted.copied(), *running), VersionCheck::Upgrade { .. })
}
