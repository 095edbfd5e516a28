use crate::errors::{AppError, AppResult};
use crate::templates::context::SafeContext;
use crate::templates::resolver::ThemeResolver;
use crate::version::RUNNING_VERSION;
use handlebars::{Handlebars, RenderError, RenderErrorReason};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

const DENIED_MARKER: &str = "sandbox:";
const MAX_PARTIAL_DEPTH: usize = 8;

/// Helpers template code may call. Any other name in helper position is
/// rejected when the template is scanned, and built-ins missing from this list
/// are replaced with a denying helper at construction.
pub const ALLOWED_HELPERS: &[&str] = &[
    "if", "unless", "each", "with", "lookup", "raw", "eq", "ne", "gt", "gte", "lt", "lte", "and", "or", "not",
    "len", "upper", "lower", "json",
];

/// Helpers handlebars registers on its own, including the `string_helpers`
/// feature set.
pub const BUILTIN_HELPERS: &[&str] = &[
    "if",
    "unless",
    "each",
    "with",
    "lookup",
    "raw",
    "log",
    "eq",
    "ne",
    "gt",
    "gte",
    "lt",
    "lte",
    "and",
    "or",
    "not",
    "len",
    "lowerCamelCase",
    "upperCamelCase",
    "snakeCase",
    "kebabCase",
    "shoutySnakeCase",
    "shoutyKebabCase",
    "titleCase",
    "trainCase",
];

static RAW_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)\{\{\{\{~?\s*([^\s}~]+)[^}]*\}\}\}\}.*?\{\{\{\{~?/[^}]*\}\}\}\}").expect("valid regex")
});
static COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)\{\{!--.*?--\}\}|\{\{![^}]*\}\}").expect("valid regex"));
static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)\{\{\{?(.*?)\}?\}\}").expect("valid regex"));
static STRING_LITERAL: Lazy<Regex> = Lazy::new(|| Regex::new(r#""[^"]*"|'[^']*'"#).expect("valid regex"));
static PATH_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z0-9_@$.\-/\[\]]+").expect("valid regex"));
static SUBEXPRESSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\(\s*([A-Za-z0-9_@.\-/]+)").expect("valid regex"));
static PARTIAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{~?(#?)>\s*([A-Za-z0-9_@.\-/]+)").expect("valid regex"));
static INLINE_PARTIAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\{\{~?#\*inline\s+"([^"]+)""#).expect("valid regex"));

/// Rendering environment whose only template source is the resolver and
/// whose template code sees only exposed context values and allowed helpers.
pub struct SandboxedEnvironment {
    registry: Handlebars<'static>,
    resolver: Arc<ThemeResolver>,
}

impl SandboxedEnvironment {
    pub fn new(resolver: Arc<ThemeResolver>) -> Self {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        registry.set_dev_mode(false);
        registry.register_helper("upper", Box::new(upper_helper));
        registry.register_helper("lower", Box::new(lower_helper));
        registry.register_helper("json", Box::new(json_helper));
        for name in denied_builtins() {
            registry.register_helper(name, Box::new(denied_helper));
        }

        Self { registry, resolver }
    }

    pub fn resolver(&self) -> &Arc<ThemeResolver> {
        &self.resolver
    }

    /// Resolves `reference` and every partial it pulls in, then renders it.
    /// Compiled templates are not kept between calls.
    pub fn render(&self, reference: &str, context: SafeContext) -> AppResult<String> {
        let source = self.resolver.get_source(reference)?;

        // Registrations go to a per-render copy; the shared registry is never
        // touched after construction.
        let mut registry = self.registry.clone();
        self.compile(&mut registry, reference, &source.text, &mut Vec::new())?;

        let data = context.into_value_with(vec![("site", self.site_globals())]);
        registry
            .render(reference, &data)
            .map_err(|err| map_render_error(reference, err))
    }

    fn compile(
        &self,
        registry: &mut Handlebars<'static>,
        name: &str,
        text: &str,
        ancestors: &mut Vec<String>,
    ) -> AppResult<()> {
        check_source(name, text)?;
        registry
            .register_template_string(name, text)
            .map_err(|err| AppError::Render(format!("{}: {}", name, err)))?;

        ancestors.push(name.to_string());
        for (partial, block_only) in partial_names(text) {
            if ancestors.contains(&partial) {
                return Err(AppError::Render(format!(
                    "{}: partial cycle through '{}'",
                    ancestors.join(" -> "),
                    partial
                )));
            }
            if registry.has_template(&partial) {
                continue;
            }
            if ancestors.len() >= MAX_PARTIAL_DEPTH {
                return Err(AppError::Render(format!(
                    "{}: partials nested deeper than {}",
                    name, MAX_PARTIAL_DEPTH
                )));
            }
            // `{{#> name}}` renders its own block when the partial is absent.
            let source = match self.resolver.get_source(&partial) {
                Ok(source) => source,
                Err(AppError::TemplateNotFound(_)) if block_only => {
                    tracing::debug!(template = %name, partial = %partial, "partial missing, using block content");
                    continue;
                }
                Err(err) => return Err(err),
            };
            self.compile(registry, &partial, &source.text, ancestors)?;
        }
        ancestors.pop();
        Ok(())
    }

    fn site_globals(&self) -> Value {
        json!({
            "version": RUNNING_VERSION,
            "theme": self.resolver.active_theme().ok(),
        })
    }
}

fn denied_builtins() -> impl Iterator<Item = &'static str> {
    BUILTIN_HELPERS
        .iter()
        .copied()
        .filter(|name| !ALLOWED_HELPERS.contains(name))
}

/// Template text with comments and raw-block bodies removed. Neither is
/// evaluated, so neither is scanned.
fn scannable(text: &str) -> String {
    let without_raw = RAW_BLOCK.replace_all(text, "");
    COMMENT.replace_all(&without_raw, "").into_owned()
}

/// Rejects templates that name underscore-prefixed segments, which is how
/// private and engine-internal members are spelled, or that call a helper
/// outside [`ALLOWED_HELPERS`].
fn check_source(name: &str, text: &str) -> AppResult<()> {
    for raw in RAW_BLOCK.captures_iter(text) {
        ensure_helper_allowed(name, raw.get(1).map(|m| m.as_str()).unwrap_or_default())?;
    }

    let scanned = scannable(text);
    for tag in TAG.captures_iter(&scanned) {
        let inner = tag.get(1).map(|m| m.as_str()).unwrap_or_default();
        let inner = STRING_LITERAL.replace_all(inner, "\"\"");
        for token in PATH_TOKEN.find_iter(&inner) {
            let private = token
                .as_str()
                .split(['.', '/', '[', ']'])
                .find(|segment| segment.starts_with('_'));
            if let Some(segment) = private {
                return Err(AppError::SandboxViolation(format!(
                    "{}: access to '{}' is not allowed",
                    name, segment
                )));
            }
        }
        check_helper_calls(name, &inner)?;
    }
    Ok(())
}

/// A name is in helper position when it opens a block, heads a tag that
/// carries parameters, or heads a subexpression. A bare `{{name}}` is a
/// lookup unless a helper of that name is registered.
fn check_helper_calls(template: &str, inner: &str) -> AppResult<()> {
    for call in SUBEXPRESSION.captures_iter(inner) {
        ensure_helper_allowed(template, call.get(1).map(|m| m.as_str()).unwrap_or_default())?;
    }

    let tag = inner.trim_matches(|c: char| c == '~' || c.is_whitespace());
    let tag = match tag.strip_prefix("else") {
        Some(rest) if rest.is_empty() || rest.starts_with(char::is_whitespace) => rest.trim_start(),
        _ => tag,
    };
    let (opens_block, body) = match tag.strip_prefix('#') {
        Some(rest) => (true, rest.trim_start()),
        None => (false, tag),
    };
    if body.starts_with(['>', '*', '/', '^', '!', '(', '"']) {
        return Ok(());
    }

    let mut tokens = body.split_whitespace();
    let Some(head) = tokens.next() else {
        return Ok(());
    };
    if opens_block || tokens.next().is_some() {
        ensure_helper_allowed(template, head)?;
    }
    Ok(())
}

fn ensure_helper_allowed(template: &str, helper: &str) -> AppResult<()> {
    if ALLOWED_HELPERS.contains(&helper) {
        return Ok(());
    }
    Err(AppError::SandboxViolation(format!(
        "{}: helper '{}' is not allowed",
        template, helper
    )))
}

/// Partials a template pulls in, mapped to whether every use opens a block
/// with `{{#>`. Inline partials and `@partial-block` are left to handlebars.
fn partial_names(text: &str) -> BTreeMap<String, bool> {
    let text = scannable(text);
    let inline: BTreeSet<String> = INLINE_PARTIAL
        .captures_iter(&text)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .collect();

    let mut names = BTreeMap::new();
    for caps in PARTIAL.captures_iter(&text) {
        let block = caps.get(1).is_some_and(|m| !m.as_str().is_empty());
        let Some(name) = caps.get(2).map(|m| m.as_str()) else {
            continue;
        };
        if name.starts_with('@') || inline.contains(name) {
            continue;
        }
        names
            .entry(name.to_string())
            .and_modify(|block_only: &mut bool| *block_only &= block)
            .or_insert(block);
    }
    names
}

fn map_render_error(reference: &str, err: RenderError) -> AppError {
    match err.reason() {
        RenderErrorReason::MissingVariable(path) => AppError::SandboxViolation(format!(
            "{}: '{}' is not exposed to templates",
            reference,
            path.as_deref().unwrap_or("<unknown>")
        )),
        RenderErrorReason::HelperNotFound(helper) => {
            AppError::SandboxViolation(format!("{}: helper '{}' is not allowed", reference, helper))
        }
        RenderErrorReason::PartialNotFound(partial) => AppError::TemplateNotFound(partial.clone()),
        RenderErrorReason::Other(message) if message.starts_with(DENIED_MARKER) => AppError::SandboxViolation(
            format!("{}: {}", reference, message.trim_start_matches(DENIED_MARKER).trim()),
        ),
        _ => AppError::Render(format!("{}: {}", reference, err)),
    }
}

fn denied_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    _: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    Err(RenderErrorReason::Other(format!("{} helper '{}' is not allowed", DENIED_MARKER, h.name())).into())
}

fn upper_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let param = h.param(0).and_then(|v| v.value().as_str()).unwrap_or("");
    out.write(&handlebars::html_escape(&param.to_uppercase()))?;
    Ok(())
}

fn lower_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let param = h.param(0).and_then(|v| v.value().as_str()).unwrap_or("");
    out.write(&handlebars::html_escape(&param.to_lowercase()))?;
    Ok(())
}

/// Embeds a value as JSON that is safe inside a `<script>` element.
fn json_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    if let Some(v) = h.param(0) {
        let encoded = serde_json::to_string(v.value()).unwrap_or_default();
        let encoded = encoded
            .replace('<', "\\u003c")
            .replace('>', "\\u003e")
            .replace('&', "\\u0026");
        out.write(&encoded)?;
    }
    Ok(())
}
