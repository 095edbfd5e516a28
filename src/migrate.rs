use crate::config::{ConfigStore, VERSION_KEY};
use crate::errors::{AppError, AppResult};
use crate::models::DriverKind;
use crate::version::SchemaVersion;
use std::io::{BufRead, IsTerminal, Write};

/// Revision bookkeeping for the migration script set.
pub trait MigrationLedger {
    fn current_revision(&self) -> AppResult<Option<String>>;
    fn latest_revision(&self) -> Option<&'static str>;
    /// Creates the full target schema; objects that already exist are kept.
    fn create_schema(&self) -> AppResult<()>;
    /// Replays every revision after the ledger's current one and returns the
    /// revisions that ran.
    fn apply_to_latest(&self) -> AppResult<Vec<String>>;
    fn stamp_latest(&self) -> AppResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStrategy {
    CreateAndStamp,
    Incremental,
}

impl MigrationStrategy {
    pub fn for_driver(driver: DriverKind) -> Self {
        match driver {
            DriverKind::Embedded => Self::CreateAndStamp,
            DriverKind::ClientServer => Self::Incremental,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub strategy: MigrationStrategy,
    pub applied: Vec<String>,
    pub revision: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeState {
    AwaitingDecision,
    Confirmed,
    Declined,
    Migrating,
    Done,
    Aborted,
}

#[derive(Debug)]
pub struct UpgradeFlow {
    state: UpgradeState,
}

impl Default for UpgradeFlow {
    fn default() -> Self {
        Self::new()
    }
}

impl UpgradeFlow {
    pub fn new() -> Self {
        Self {
            state: UpgradeState::AwaitingDecision,
        }
    }

    pub fn state(&self) -> UpgradeState {
        self.state
    }

    /// Detached channels confirm without asking.
    pub fn decide(&mut self, channel: &mut dyn ControlChannel, from: SchemaVersion, to: SchemaVersion) -> AppResult<UpgradeState> {
        self.require(UpgradeState::AwaitingDecision)?;
        if !channel.is_attached() {
            tracing::info!(%from, %to, "no interactive channel attached; migrating without confirmation");
            self.state = UpgradeState::Confirmed;
            return Ok(self.state);
        }

        for line in UPGRADE_WARNING {
            channel.notify(line)?;
        }
        let answer = channel.prompt(&format!("Run database migrations from {} to {} (Y/N)", from, to))?;
        if answer.trim().eq_ignore_ascii_case("y") {
            self.state = UpgradeState::Confirmed;
        } else {
            channel.notify("/*\\ Ignored database migrations... /*\\")?;
            self.state = UpgradeState::Declined;
        }
        Ok(self.state)
    }

    pub fn begin(&mut self) -> AppResult<()> {
        self.transition(UpgradeState::Confirmed, UpgradeState::Migrating)
    }

    pub fn finish(&mut self) -> AppResult<()> {
        self.transition(UpgradeState::Migrating, UpgradeState::Done)
    }

    pub fn abort(&mut self) -> AppResult<()> {
        self.transition(UpgradeState::Declined, UpgradeState::Aborted)
    }

    fn transition(&mut self, from: UpgradeState, to: UpgradeState) -> AppResult<()> {
        self.require(from)?;
        self.state = to;
        Ok(())
    }

    fn require(&self, state: UpgradeState) -> AppResult<()> {
        if self.state != state {
            return Err(AppError::Internal(format!(
                "upgrade flow is {:?}, expected {:?}",
                self.state, state
            )));
        }
        Ok(())
    }
}

const UPGRADE_WARNING: &[&str] = &[
    "/*\\ The platform has been updated and must update the database! /*\\",
    "/*\\ Please back up your database before proceeding! /*\\",
    "/*\\ Maintainers are not responsible for any data loss! /*\\",
];

/// Operator console used for the upgrade confirmation.
pub trait ControlChannel {
    fn is_attached(&self) -> bool;
    fn notify(&mut self, message: &str) -> AppResult<()>;
    /// Blocks until the operator answers.
    fn prompt(&mut self, message: &str) -> AppResult<String>;
}

#[derive(Debug, Default)]
pub struct TerminalChannel;

impl ControlChannel for TerminalChannel {
    fn is_attached(&self) -> bool {
        std::io::stdin().is_terminal()
    }

    fn notify(&mut self, message: &str) -> AppResult<()> {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{}", message)?;
        Ok(())
    }

    fn prompt(&mut self, message: &str) -> AppResult<String> {
        {
            let mut stdout = std::io::stdout().lock();
            write!(stdout, "{} ", message)?;
            stdout.flush()?;
        }
        let mut answer = String::new();
        // EOF leaves the answer empty, which declines.
        std::io::stdin().lock().read_line(&mut answer)?;
        Ok(answer)
    }
}

pub struct MigrationOrchestrator<'a> {
    ledger: &'a dyn MigrationLedger,
    strategy: MigrationStrategy,
}

impl<'a> MigrationOrchestrator<'a> {
    pub fn new(ledger: &'a dyn MigrationLedger, driver: DriverKind) -> Self {
        Self {
            ledger,
            strategy: MigrationStrategy::for_driver(driver),
        }
    }

    pub fn strategy(&self) -> MigrationStrategy {
        self.strategy
    }

    /// Brings the schema to the latest revision using the driver's strategy.
    pub fn prepare_schema(&self) -> AppResult<MigrationReport> {
        self.migrate().map_err(AppError::into_migration_failure)
    }

    /// In-place upgrade of an initialized install. The running version is
    /// persisted only after migration succeeds.
    pub fn run_upgrade(
        &self,
        store: &dyn ConfigStore,
        channel: &mut dyn ControlChannel,
        from: SchemaVersion,
        to: SchemaVersion,
    ) -> AppResult<MigrationReport> {
        let mut flow = UpgradeFlow::new();
        if flow.decide(channel, from, to)? == UpgradeState::Declined {
            flow.abort()?;
            tracing::warn!(%from, %to, "database upgrade declined by operator");
            return Err(AppError::MigrationAborted(format!(
                "upgrade from {} to {} declined",
                from, to
            )));
        }

        flow.begin()?;
        tracing::info!(%from, %to, strategy = ?self.strategy, "running database upgrade");
        let report = self.migrate().map_err(AppError::into_migration_failure)?;
        store
            .set(VERSION_KEY, &to.to_string())
            .map_err(AppError::into_migration_failure)?;
        flow.finish()?;
        tracing::info!(version = %to, revision = ?report.revision, "database upgrade complete");
        Ok(report)
    }

    fn migrate(&self) -> AppResult<MigrationReport> {
        let applied = match self.strategy {
            MigrationStrategy::CreateAndStamp => {
                self.ledger.create_schema()?;
                self.ledger.stamp_latest()?;
                Vec::new()
            }
            MigrationStrategy::Incremental => self.ledger.apply_to_latest()?,
        };
        let revision = self.ledger.current_revision()?;
        if revision.as_deref() != self.ledger.latest_revision() {
            return Err(AppError::MigrationFailed(format!(
                "ledger at {:?} after migration, expected {:?}",
                revision,
                self.ledger.latest_revision()
            )));
        }
        Ok(MigrationReport {
            strategy: self.strategy,
            applied,
            revision,
        })
    }
}
