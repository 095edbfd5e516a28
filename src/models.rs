use crate::errors::{AppError, AppResult};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverKind {
    Embedded,
    ClientServer,
}

impl DriverKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Embedded => "embedded",
            Self::ClientServer => "client-server",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmbeddedLocation {
    Memory,
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseDescriptor {
    pub driver: DriverKind,
    pub scheme: String,
    pub url: String,
}

const EMBEDDED_SCHEMES: &[&str] = &["sqlite", "sqlite3"];
const CLIENT_SERVER_SCHEMES: &[&str] = &["postgres", "postgresql", "mysql", "mariadb"];

impl DatabaseDescriptor {
    pub fn parse(url: &str) -> AppResult<Self> {
        let url = url.trim();
        if url.is_empty() {
            return Err(AppError::ConfigurationMissing("database url is empty".to_string()));
        }

        let Some((scheme, _)) = url.split_once(':').filter(|(scheme, _)| looks_like_scheme(scheme)) else {
            // A bare filesystem path names an embedded database file.
            return Ok(Self {
                driver: DriverKind::Embedded,
                scheme: "sqlite".to_string(),
                url: format!("sqlite://{}", url),
            });
        };

        // `mysql+pymysql://` style suffixes name a client library, not an engine.
        let engine = scheme.split('+').next().unwrap_or(scheme).to_ascii_lowercase();
        let driver = if EMBEDDED_SCHEMES.contains(&engine.as_str()) {
            DriverKind::Embedded
        } else if CLIENT_SERVER_SCHEMES.contains(&engine.as_str()) {
            DriverKind::ClientServer
        } else {
            return Err(AppError::UnsupportedDriver(format!("unknown database scheme '{}'", scheme)));
        };

        Ok(Self {
            driver,
            scheme: engine,
            url: url.to_string(),
        })
    }

    /// Where an embedded database lives. `None` for client-server engines.
    pub fn embedded_location(&self) -> Option<EmbeddedLocation> {
        if self.driver != DriverKind::Embedded {
            return None;
        }
        let rest = self.url.split_once(':').map(|(_, rest)| rest).unwrap_or(&self.url);
        let path = rest.strip_prefix("//").unwrap_or(rest);
        if path.is_empty() || path == ":memory:" {
            return Some(EmbeddedLocation::Memory);
        }
        Some(EmbeddedLocation::File(PathBuf::from(path)))
    }
}

fn looks_like_scheme(candidate: &str) -> bool {
    // Single letters are Windows drive prefixes, not schemes.
    candidate.len() > 1
        && candidate
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '+' || ch == '-' || ch == '.')
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DowngradePolicy {
    #[default]
    Proceed,
    Refuse,
}

impl DowngradePolicy {
    pub fn parse(raw: &str) -> AppResult<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "proceed" => Ok(Self::Proceed),
            "refuse" => Ok(Self::Refuse),
            other => Err(AppError::InvalidConfiguration(format!(
                "downgrade policy '{}' is not one of proceed, refuse",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorPage {
    Forbidden,
    NotFound,
    ServerError,
    BadGateway,
}

impl ErrorPage {
    pub const ALL: [ErrorPage; 4] = [Self::NotFound, Self::Forbidden, Self::ServerError, Self::BadGateway];

    pub fn status(self) -> u16 {
        match self {
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::ServerError => 500,
            Self::BadGateway => 502,
        }
    }

    pub fn from_status(status: u16) -> Self {
        match status {
            403 => Self::Forbidden,
            404 => Self::NotFound,
            502 => Self::BadGateway,
            _ => Self::ServerError,
        }
    }

    pub fn template(self) -> String {
        format!("errors/{}", self.status())
    }

    pub fn reason(self) -> &'static str {
        match self {
            Self::Forbidden => "Forbidden",
            Self::NotFound => "Not Found",
            Self::ServerError => "Internal Server Error",
            Self::BadGateway => "Bad Gateway",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    pub method: String,
    pub path: String,
}

impl RequestInfo {
    pub fn get(path: &str) -> Self {
        Self {
            method: "GET".to_string(),
            path: path.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub body: String,
}

impl Response {
    pub fn ok(body: String) -> Self {
        Self { status: 200, body }
    }
}

#[cfg(test)]
mod tests {
    use super::{DatabaseDescriptor, DowngradePolicy, DriverKind, EmbeddedLocation, ErrorPage};
    use crate::errors::AppError;
    use std::path::PathBuf;

    #[test]
    fn classifies_embedded_urls() {
        let file = DatabaseDescriptor::parse("sqlite:///var/lib/stagehand.db").expect("descriptor");
        assert_eq!(file.driver, DriverKind::Embedded);
        assert_eq!(
            file.embedded_location(),
            Some(EmbeddedLocation::File(PathBuf::from("/var/lib/stagehand.db")))
        );

        let memory = DatabaseDescriptor::parse("sqlite://").expect("descriptor");
        assert_eq!(memory.embedded_location(), Some(EmbeddedLocation::Memory));

        let memory = DatabaseDescriptor::parse("sqlite::memory:").expect("descriptor");
        assert_eq!(memory.embedded_location(), Some(EmbeddedLocation::Memory));

        let bare = DatabaseDescriptor::parse("data/stagehand.db").expect("descriptor");
        assert_eq!(bare.driver, DriverKind::Embedded);
        assert_eq!(
            bare.embedded_location(),
            Some(EmbeddedLocation::File(PathBuf::from("data/stagehand.db")))
        );
    }

    #[test]
    fn classifies_client_server_urls() {
        for url in [
            "postgres://app:secret@db:5432/stagehand",
            "postgresql://db/stagehand",
            "mysql+pymysql://root@localhost/stagehand",
            "mariadb://db/stagehand",
        ] {
            let descriptor = DatabaseDescriptor::parse(url).expect("descriptor");
            assert_eq!(descriptor.driver, DriverKind::ClientServer, "{url}");
            assert!(descriptor.embedded_location().is_none());
        }
        let mysql = DatabaseDescriptor::parse("mysql+pymysql://root@localhost/stagehand").expect("descriptor");
        assert_eq!(mysql.scheme, "mysql");
    }

    #[test]
    fn rejects_unknown_schemes_and_empty_urls() {
        assert!(DatabaseDescriptor::parse("oracle://db").is_err());
        assert!(DatabaseDescriptor::parse("   ").is_err());
    }

    #[test]
    fn parses_downgrade_policy() {
        assert_eq!(DowngradePolicy::parse("Refuse").expect("policy"), DowngradePolicy::Refuse);
        assert_eq!(DowngradePolicy::parse("proceed").expect("policy"), DowngradePolicy::Proceed);
        assert!(matches!(DowngradePolicy::parse("ignore"), Err(AppError::InvalidConfiguration(_))));
    }

    #[test]
    fn error_pages_map_statuses() {
        assert_eq!(ErrorPage::from_status(404), ErrorPage::NotFound);
        assert_eq!(ErrorPage::from_status(418), ErrorPage::ServerError);
        assert_eq!(ErrorPage::BadGateway.template(), "errors/502");
    }
}
