use stagehand::bootstrap::Bootstrap;
use stagehand::config::{AppConfig, ConfigStore, VERSION_KEY};
use stagehand::errors::{AppError, AppResult};
use stagehand::migrate::ControlChannel;
use stagehand::models::{RequestInfo, Response};
use stagehand::templates::{Expose, Fields, SafeContext};
use stagehand::version::RUNNING_VERSION;
use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};

struct Operator {
    answer: &'static str,
    prompts: usize,
}

impl ControlChannel for Operator {
    fn is_attached(&self) -> bool {
        true
    }

    fn notify(&mut self, _message: &str) -> AppResult<()> {
        Ok(())
    }

    fn prompt(&mut self, _message: &str) -> AppResult<String> {
        self.prompts += 1;
        Ok(self.answer.to_string())
    }
}

struct Player {
    name: String,
    score: i64,
    #[allow(dead_code)]
    email: String,
}

impl Expose for Player {
    fn expose(&self, fields: &mut Fields) -> AppResult<()> {
        fields.scalar("name", &self.name)?.scalar("score", self.score)?;
        Ok(())
    }
}

fn site(root: &Path) -> AppConfig {
    let themes = root.join("themes");
    let write = |path: &str, text: &str| {
        let full = themes.join(path);
        fs::create_dir_all(full.parent().expect("parent")).expect("mkdir");
        fs::write(full, text).expect("write");
    };
    write("core/templates/index.html", "Welcome to {{site.theme}}");
    write(
        "core/templates/scoreboard.html",
        "{{#each players}}{{> row}}{{/each}}",
    );
    write("core/templates/row", "[{{name}}:{{score}}]");
    write("core/templates/errors/404", "nothing at this address");
    write("admin/templates/users/list", "admin user list");
    AppConfig::with_root(root)
}

#[test]
fn fresh_site_serves_theme_and_admin_templates() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut operator = Operator { answer: "n", prompts: 0 };
    let app = Bootstrap::new(site(dir.path())).run(&mut operator).expect("bootstrap");
    assert_eq!(operator.prompts, 0);

    assert_eq!(app.render("index.html", SafeContext::new()).expect("render"), "Welcome to core");
    assert_eq!(app.render("admin/users/list", SafeContext::new()).expect("render"), "admin user list");

    let players = vec![
        Player { name: "ada".to_string(), score: 30, email: "ada@example.test".to_string() },
        Player { name: "linus".to_string(), score: 12, email: "linus@example.test".to_string() },
    ];
    let mut ctx = SafeContext::new();
    ctx.list("players", &players).expect("list");
    assert_eq!(app.render("scoreboard.html", ctx).expect("render"), "[ada:30][linus:12]");
}

#[test]
fn sandbox_blocks_fields_that_were_not_exposed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut operator = Operator { answer: "n", prompts: 0 };
    let app = Bootstrap::new(site(dir.path())).run(&mut operator).expect("bootstrap");
    app.override_template("leak.html", "{{#each players}}{{email}}{{/each}}").expect("override");

    let players = vec![Player { name: "ada".to_string(), score: 1, email: "ada@example.test".to_string() }];
    let mut ctx = SafeContext::new();
    ctx.list("players", &players).expect("list");
    assert!(matches!(app.render("leak.html", ctx), Err(AppError::SandboxViolation(_))));
}

#[test]
fn dispatch_maps_missing_templates_to_the_themed_404() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut operator = Operator { answer: "n", prompts: 0 };
    let app = Bootstrap::new(site(dir.path())).run(&mut operator).expect("bootstrap");

    let response = app.dispatch(&RequestInfo::get("/missing"), |app, _| {
        app.render("missing.html", SafeContext::new()).map(Response::ok)
    });
    assert_eq!(response.status, 404);
    assert_eq!(response.body, "nothing at this address");
}

#[test]
fn declined_upgrade_leaves_the_old_version_in_place() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = site(dir.path());
    {
        let mut operator = Operator { answer: "y", prompts: 0 };
        let app = Bootstrap::new(config.clone()).run(&mut operator).expect("install");
        app.database().set(VERSION_KEY, "1.0.0").expect("older version");
    }

    let mut operator = Operator { answer: "N", prompts: 0 };
    let error = Bootstrap::new(config.clone()).run(&mut operator).err().expect("declined");
    assert!(matches!(error, AppError::MigrationAborted(_)));
    assert_eq!(operator.prompts, 1);

    let mut operator = Operator { answer: "y", prompts: 0 };
    let app = Bootstrap::new(config).run(&mut operator).expect("confirmed");
    assert_eq!(app.database().get(VERSION_KEY).expect("get"), Some(RUNNING_VERSION.to_string()));
}

fn stagehand(root: &Path, args: &[&str]) -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_stagehand"));
    command
        .args(args)
        .current_dir(root)
        .env("STAGEHAND_ROOT", root)
        .env_remove("DATABASE_URL")
        .env_remove("STAGEHAND_THEMES_DIR")
        .env_remove("STAGEHAND_ADMIN_DIR")
        .env_remove("STAGEHAND_LOG_DIR")
        .env_remove("STAGEHAND_DEFAULT_THEME")
        .env_remove("STAGEHAND_DOWNGRADE_POLICY")
        .env_remove("STAGEHAND_FOLLOW_SYMLINKS")
        .env("RUST_LOG", "warn")
        .stdin(Stdio::null());
    command
}

#[test]
fn binary_renders_a_template_after_bootstrap() {
    let dir = tempfile::tempdir().expect("tempdir");
    site(dir.path());

    let output = stagehand(dir.path(), &["render", "index.html"]).output().expect("run stagehand");
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "Welcome to core");
    assert!(dir.path().join("stagehand.db").exists());
}

#[test]
fn binary_exit_code_reflects_refused_downgrade() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = site(dir.path());
    {
        let mut operator = Operator { answer: "y", prompts: 0 };
        let app = Bootstrap::new(config).run(&mut operator).expect("install");
        app.database().set(VERSION_KEY, "99.0.0").expect("newer version");
    }

    let output = stagehand(dir.path(), &["boot"])
        .env("STAGEHAND_DOWNGRADE_POLICY", "refuse")
        .output()
        .expect("run stagehand");
    assert_eq!(output.status.code(), Some(3));
    assert!(String::from_utf8_lossy(&output.stderr).contains("MIGRATION_ABORTED"));
}
