use crate::config::{validate_theme_name, ConfigStore, THEME_KEY};
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{ErrorPage, RequestInfo, Response};
use crate::templates::context::SafeContext;
use crate::templates::resolver::OverrideMap;
use crate::templates::sandbox::SandboxedEnvironment;
use crate::version::SchemaVersion;
use std::collections::BTreeMap;
use std::sync::Arc;

pub type RequestHook = Box<dyn Fn(&RequestInfo) -> AppResult<()> + Send + Sync>;
pub type ResponseHook = Box<dyn Fn(&RequestInfo, &mut Response) -> AppResult<()> + Send + Sync>;
pub type ErrorHandler = Box<dyn Fn(&App, ErrorPage) -> Response + Send + Sync>;

/// Third-party code loaded once at the end of bootstrap. `init` may register
/// template overrides, hooks and error handlers before the first render.
pub trait Extension {
    fn name(&self) -> &str;
    fn init(&self, app: &mut App) -> anyhow::Result<()>;
}

/// Ready-to-serve application handle returned by the bootstrap sequencer.
pub struct App {
    database: Arc<Database>,
    env: SandboxedEnvironment,
    version: SchemaVersion,
    before_request: Vec<RequestHook>,
    after_request: Vec<ResponseHook>,
    error_handlers: BTreeMap<ErrorPage, ErrorHandler>,
    extensions: Vec<String>,
}

impl App {
    pub(crate) fn new(database: Arc<Database>, env: SandboxedEnvironment, version: SchemaVersion) -> Self {
        Self {
            database,
            env,
            version,
            before_request: Vec::new(),
            after_request: Vec::new(),
            error_handlers: BTreeMap::new(),
            extensions: Vec::new(),
        }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.database
    }

    /// Version the persisted configuration was brought to during bootstrap.
    pub fn version(&self) -> SchemaVersion {
        self.version
    }

    pub fn overrides(&self) -> &Arc<OverrideMap> {
        self.env.resolver().overrides()
    }

    pub fn override_template(&self, reference: &str, source: &str) -> AppResult<()> {
        self.overrides().insert(reference, source)
    }

    pub fn render(&self, reference: &str, context: SafeContext) -> AppResult<String> {
        self.env.render(reference, context)
    }

    pub fn active_theme(&self) -> AppResult<String> {
        self.env.resolver().active_theme()
    }

    /// Persists a new active theme; the next render picks it up.
    pub fn set_theme(&self, theme: &str) -> AppResult<()> {
        validate_theme_name(theme)?;
        self.database.set(THEME_KEY, theme)?;
        tracing::info!(theme, "active theme changed");
        Ok(())
    }

    pub fn before_request<F>(&mut self, hook: F)
    where
        F: Fn(&RequestInfo) -> AppResult<()> + Send + Sync + 'static,
    {
        self.before_request.push(Box::new(hook));
    }

    pub fn after_request<F>(&mut self, hook: F)
    where
        F: Fn(&RequestInfo, &mut Response) -> AppResult<()> + Send + Sync + 'static,
    {
        self.after_request.push(Box::new(hook));
    }

    /// Replaces the handler for `page`.
    pub fn register_error_handler<F>(&mut self, page: ErrorPage, handler: F)
    where
        F: Fn(&App, ErrorPage) -> Response + Send + Sync + 'static,
    {
        self.error_handlers.insert(page, Box::new(handler));
    }

    pub(crate) fn register_default_hooks(&mut self) {
        self.before_request(|request| {
            tracing::debug!(method = %request.method, path = %request.path, "request started");
            Ok(())
        });
        self.after_request(|request, response| {
            tracing::debug!(method = %request.method, path = %request.path, status = response.status, "request finished");
            Ok(())
        });
    }

    pub(crate) fn register_default_error_handlers(&mut self) {
        for page in ErrorPage::ALL {
            self.register_error_handler(page, |app, page| app.render_error(page));
        }
    }

    pub fn has_error_handler(&self, page: ErrorPage) -> bool {
        self.error_handlers.contains_key(&page)
    }

    /// Runs the before-hooks, `handler` and the after-hooks for one request.
    /// Failures become the error page matching their status.
    pub fn dispatch<F>(&self, request: &RequestInfo, handler: F) -> Response
    where
        F: FnOnce(&App, &RequestInfo) -> AppResult<Response>,
    {
        let outcome = self
            .before_request
            .iter()
            .try_for_each(|hook| hook(request))
            .and_then(|_| handler(self, request));

        let mut response = match outcome {
            Ok(response) => response,
            Err(err) => self.handle_error(request, &err),
        };

        for hook in &self.after_request {
            if let Err(err) = hook(request, &mut response) {
                response = self.handle_error(request, &err);
                break;
            }
        }
        response
    }

    /// Response produced by the handler registered for `page`.
    pub fn error_response(&self, page: ErrorPage) -> Response {
        match self.error_handlers.get(&page) {
            Some(handler) => handler(self, page),
            None => plain_error(page),
        }
    }

    /// Renders `errors/<code>` through the resolver, falling back to a plain
    /// body when the theme has no such template or it fails to render.
    pub fn render_error(&self, page: ErrorPage) -> Response {
        let body = error_context(page).and_then(|ctx| self.render(&page.template(), ctx));
        match body {
            Ok(body) => Response {
                status: page.status(),
                body,
            },
            Err(err) => {
                tracing::debug!(status = page.status(), error = %err, "error page fell back to plain text");
                plain_error(page)
            }
        }
    }

    fn handle_error(&self, request: &RequestInfo, err: &AppError) -> Response {
        let page = ErrorPage::from_status(err.status_code());
        if page == ErrorPage::NotFound {
            tracing::debug!(path = %request.path, error = %err, "request failed");
        } else {
            tracing::error!(method = %request.method, path = %request.path, error = %err, "request failed");
        }
        self.error_response(page)
    }

    pub fn loaded_extensions(&self) -> &[String] {
        &self.extensions
    }

    pub(crate) fn load_extension(&mut self, extension: &dyn Extension) -> AppResult<()> {
        let name = extension.name().to_string();
        extension
            .init(self)
            .map_err(|err| AppError::Extension(format!("{}: {:#}", name, err)))?;
        tracing::info!(extension = %name, "extension loaded");
        self.extensions.push(name);
        Ok(())
    }
}

fn error_context(page: ErrorPage) -> AppResult<SafeContext> {
    let mut ctx = SafeContext::new();
    ctx.scalar("status", u64::from(page.status()))?
        .scalar("reason", page.reason())?;
    Ok(ctx)
}

fn plain_error(page: ErrorPage) -> Response {
    Response {
        status: page.status(),
        body: format!("{} {}", page.status(), page.reason()),
    }
}

#[cfg(test)]
mod tests {
    use super::{App, Extension};
    use crate::config::{ConfigStore, THEME_KEY};
    use crate::db::Database;
    use crate::errors::AppError;
    use crate::migrate::MigrationLedger;
    use crate::models::{DatabaseDescriptor, ErrorPage, RequestInfo, Response};
    use crate::templates::context::SafeContext;
    use crate::templates::loader::FileSystemLoader;
    use crate::templates::resolver::{OverrideMap, ThemeResolver};
    use crate::templates::sandbox::SandboxedEnvironment;
    use crate::version::SchemaVersion;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn app(files: &[(&str, &str)]) -> (tempfile::TempDir, App) {
        let dir = tempfile::tempdir().expect("tempdir");
        for (path, text) in files {
            let full = dir.path().join(path);
            fs::create_dir_all(full.parent().expect("parent")).expect("mkdir");
            fs::write(full, text).expect("write");
        }
        let descriptor = DatabaseDescriptor::parse("sqlite::memory:").expect("descriptor");
        let database = Arc::new(Database::open_in_memory(descriptor).expect("db"));
        database.create_schema().expect("schema");
        database.set(THEME_KEY, "core").expect("theme");

        let resolver = ThemeResolver::new(
            Arc::new(OverrideMap::new()),
            database.clone(),
            Arc::new(FileSystemLoader::default()),
            dir.path(),
            dir.path(),
        );
        let env = SandboxedEnvironment::new(Arc::new(resolver));
        let mut app = App::new(database, env, SchemaVersion::running().expect("version"));
        app.register_default_hooks();
        app.register_default_error_handlers();
        (dir, app)
    }

    #[test]
    fn dispatch_runs_hooks_around_the_handler() {
        let (_dir, mut app) = app(&[]);
        let before = Arc::new(AtomicUsize::new(0));
        let counter = before.clone();
        app.before_request(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        app.after_request(|_, response| {
            response.body.push_str(" [served]");
            Ok(())
        });

        let response = app.dispatch(&RequestInfo::get("/"), |_, _| Ok(Response::ok("home".to_string())));
        assert_eq!(response, Response::ok("home [served]".to_string()));
        assert_eq!(before.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_templates_use_the_themed_not_found_page() {
        let (_dir, app) = app(&[("core/templates/errors/404", "{{status}}: {{reason}} ({{site.theme}})")]);
        let response = app.dispatch(&RequestInfo::get("/nope"), |app, _| {
            app.render("nope.html", SafeContext::new()).map(Response::ok)
        });
        assert_eq!(response.status, 404);
        assert_eq!(response.body, "404: Not Found (core)");
    }

    #[test]
    fn error_pages_fall_back_to_plain_text() {
        let (_dir, app) = app(&[]);
        let response = app.dispatch(&RequestInfo::get("/boom"), |_, _| {
            Err(AppError::Internal("boom".to_string()))
        });
        assert_eq!(response.status, 500);
        assert_eq!(response.body, "500 Internal Server Error");
        assert_eq!(app.error_response(ErrorPage::BadGateway).body, "502 Bad Gateway");
    }

    #[test]
    fn before_hook_failure_skips_the_handler() {
        let (_dir, mut app) = app(&[]);
        app.before_request(|request| {
            if request.path.starts_with("/private") {
                return Err(AppError::SandboxViolation("denied".to_string()));
            }
            Ok(())
        });
        let called = AtomicUsize::new(0);
        let response = app.dispatch(&RequestInfo::get("/private/x"), |_, _| {
            called.fetch_add(1, Ordering::SeqCst);
            Ok(Response::ok(String::new()))
        });
        assert_eq!(response.status, 500);
        assert_eq!(called.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn custom_error_handlers_replace_defaults() {
        let (_dir, mut app) = app(&[]);
        app.register_error_handler(ErrorPage::Forbidden, |_, page| Response {
            status: page.status(),
            body: "go away".to_string(),
        });
        assert_eq!(app.error_response(ErrorPage::Forbidden).body, "go away");
        assert!(ErrorPage::ALL.iter().all(|page| app.has_error_handler(*page)));
    }

    #[test]
    fn theme_switch_is_visible_to_the_next_render() {
        let (_dir, app) = app(&[
            ("core/templates/index.html", "core"),
            ("midnight/templates/index.html", "midnight"),
        ]);
        assert_eq!(app.render("index.html", SafeContext::new()).expect("render"), "core");
        app.set_theme("midnight").expect("switch");
        assert_eq!(app.render("index.html", SafeContext::new()).expect("render"), "midnight");
        assert!(matches!(app.set_theme("../etc"), Err(AppError::InvalidConfiguration(_))));
        assert_eq!(app.active_theme().expect("theme"), "midnight");
    }

    struct Banner;

    impl Extension for Banner {
        fn name(&self) -> &str {
            "banner"
        }

        fn init(&self, app: &mut App) -> anyhow::Result<()> {
            app.override_template("index.html", "banner says hi")?;
            Ok(())
        }
    }

    struct Broken;

    impl Extension for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn init(&self, _app: &mut App) -> anyhow::Result<()> {
            anyhow::bail!("missing asset bundle")
        }
    }

    #[test]
    fn extensions_register_overrides_and_report_failures() {
        let (_dir, mut app) = app(&[("core/templates/index.html", "core")]);
        app.load_extension(&Banner).expect("load");
        assert_eq!(app.render("index.html", SafeContext::new()).expect("render"), "banner says hi");
        assert_eq!(app.loaded_extensions().to_vec(), vec!["banner".to_string()]);

        match app.load_extension(&Broken) {
            Err(AppError::Extension(message)) => assert!(message.contains("broken: missing asset bundle")),
            other => panic!("unexpected {:?}", other.err()),
        }
        assert_eq!(app.loaded_extensions().len(), 1);
    }
}
