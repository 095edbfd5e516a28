//! The only way values reach template code.
//!
//! Types opt in by implementing [`Expose`] and naming each field they grant.
//! Nothing else about the value (methods, private state, other fields) is
//! ever reachable from a template, and field names are checked when the
//! context is built rather than when a template asks for them.

use crate::errors::{AppError, AppResult};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

static FIELD_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").expect("valid regex"));

/// Names the context reserves for values injected by the environment.
pub const RESERVED_NAMES: &[&str] = &["site"];

/// Adapter granting a fixed set of fields to template code.
pub trait Expose {
    fn expose(&self, fields: &mut Fields) -> AppResult<()>;
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Fields {
    map: Map<String, Value>,
}

impl Fields {
    pub fn scalar(&mut self, name: &str, value: impl Into<Scalar>) -> AppResult<&mut Self> {
        check_name(name)?;
        self.map.insert(name.to_string(), value.into().0);
        Ok(self)
    }

    pub fn object<T: Expose + ?Sized>(&mut self, name: &str, value: &T) -> AppResult<&mut Self> {
        check_name(name)?;
        self.map.insert(name.to_string(), expose_value(value)?);
        Ok(self)
    }

    pub fn list<T: Expose>(&mut self, name: &str, items: &[T]) -> AppResult<&mut Self> {
        check_name(name)?;
        let values = items.iter().map(expose_value).collect::<AppResult<Vec<_>>>()?;
        self.map.insert(name.to_string(), Value::Array(values));
        Ok(self)
    }

    pub fn scalars<I, S>(&mut self, name: &str, items: I) -> AppResult<&mut Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<Scalar>,
    {
        check_name(name)?;
        let values = items.into_iter().map(|item| item.into().0).collect();
        self.map.insert(name.to_string(), Value::Array(values));
        Ok(self)
    }
}

/// A leaf value: string, number, bool or null.
#[derive(Debug, Clone, PartialEq)]
pub struct Scalar(Value);

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Self(Value::String(value.to_string()))
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Self(Value::String(value))
    }
}

impl From<&String> for Scalar {
    fn from(value: &String) -> Self {
        Self(Value::String(value.clone()))
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Self(Value::Bool(value))
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Self(Value::from(value))
    }
}

impl From<u64> for Scalar {
    fn from(value: u64) -> Self {
        Self(Value::from(value))
    }
}

impl From<i32> for Scalar {
    fn from(value: i32) -> Self {
        Self(Value::from(value))
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Self(Value::from(value))
    }
}

impl<T: Into<Scalar>> From<Option<T>> for Scalar {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self(Value::Null))
    }
}

fn expose_value<T: Expose + ?Sized>(value: &T) -> AppResult<Value> {
    let mut fields = Fields::default();
    value.expose(&mut fields)?;
    Ok(Value::Object(fields.map))
}

fn check_name(name: &str) -> AppResult<()> {
    if !FIELD_NAME.is_match(name) {
        return Err(AppError::SandboxViolation(format!(
            "'{}' cannot be exposed to templates",
            name
        )));
    }
    Ok(())
}

/// Root mapping handed to a render.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SafeContext {
    root: Fields,
}

impl SafeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scalar(&mut self, name: &str, value: impl Into<Scalar>) -> AppResult<&mut Self> {
        check_reserved(name)?;
        self.root.scalar(name, value)?;
        Ok(self)
    }

    pub fn object<T: Expose + ?Sized>(&mut self, name: &str, value: &T) -> AppResult<&mut Self> {
        check_reserved(name)?;
        self.root.object(name, value)?;
        Ok(self)
    }

    pub fn list<T: Expose>(&mut self, name: &str, items: &[T]) -> AppResult<&mut Self> {
        check_reserved(name)?;
        self.root.list(name, items)?;
        Ok(self)
    }

    pub(crate) fn into_value_with(self, reserved: Vec<(&'static str, Value)>) -> Value {
        let mut map = self.root.map;
        for (name, value) in reserved {
            map.insert(name.to_string(), value);
        }
        Value::Object(map)
    }
}

fn check_reserved(name: &str) -> AppResult<()> {
    if RESERVED_NAMES.contains(&name) {
        return Err(AppError::SandboxViolation(format!(
            "'{}' is reserved for the rendering environment",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{Expose, Fields, SafeContext};
    use crate::errors::{AppError, AppResult};
    use serde_json::json;

    struct Account {
        name: String,
        score: i64,
        password_hash: String,
    }

    impl Expose for Account {
        fn expose(&self, fields: &mut Fields) -> AppResult<()> {
            fields.scalar("name", &self.name)?.scalar("score", self.score)?;
            Ok(())
        }
    }

    #[test]
    fn only_granted_fields_are_present() {
        let account = Account {
            name: "ada".to_string(),
            score: 42,
            password_hash: "argon2$secret".to_string(),
        };
        let mut ctx = SafeContext::new();
        ctx.object("account", &account).expect("expose");
        ctx.scalar("title", "Scoreboard").expect("scalar");

        let value = ctx.into_value_with(vec![]);
        assert_eq!(value, json!({"account": {"name": "ada", "score": 42}, "title": "Scoreboard"}));
        assert!(!value.to_string().contains(&account.password_hash));
    }

    #[test]
    fn lists_expose_each_item() {
        let accounts = vec![
            Account { name: "a".to_string(), score: 1, password_hash: String::new() },
            Account { name: "b".to_string(), score: 2, password_hash: String::new() },
        ];
        let mut ctx = SafeContext::new();
        ctx.list("accounts", &accounts).expect("list");
        let value = ctx.into_value_with(vec![]);
        assert_eq!(value["accounts"][1]["name"], "b");
    }

    #[test]
    fn rejects_private_and_reserved_names() {
        let mut ctx = SafeContext::new();
        assert!(matches!(ctx.scalar("__class__", "x"), Err(AppError::SandboxViolation(_))));
        assert!(matches!(ctx.scalar("_private", "x"), Err(AppError::SandboxViolation(_))));
        assert!(matches!(ctx.scalar("a.b", "x"), Err(AppError::SandboxViolation(_))));
        assert!(matches!(ctx.scalar("site", "x"), Err(AppError::SandboxViolation(_))));
    }

    #[test]
    fn optional_scalars_become_null() {
        let mut ctx = SafeContext::new();
        ctx.scalar("missing", None::<String>).expect("scalar");
        assert_eq!(ctx.into_value_with(vec![])["missing"], serde_json::Value::Null);
    }
}
