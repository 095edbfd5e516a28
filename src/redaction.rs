use once_cell::sync::Lazy;
use regex::Regex;

static URL_CREDENTIALS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<scheme>[A-Za-z0-9+.\-]+://)(?P<user>[^:@/]*):(?P<secret>[^@/]*)@").expect("valid regex"));

static QUERY_SECRETS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?P<key>password|passwd|pwd|token|secret|sslpassword)=(?P<value>[^&;\s]+)").expect("valid regex")
});

/// Strips passwords from a database URL before it reaches a log line.
pub fn redact_database_url(url: &str) -> String {
    let without_userinfo = URL_CREDENTIALS.replace(url, "${scheme}${user}:[REDACTED]@");
    QUERY_SECRETS
        .replace_all(&without_userinfo, "${key}=[REDACTED]")
        .to_string()
}
