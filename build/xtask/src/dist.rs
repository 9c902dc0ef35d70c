// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeSet;
use std::path::Path;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use indexmap::IndexMap;
use layout_patch::{ArtifactError, LayoutFile, LayoutScript, Storage};
use link_addr::{AddressPlan, Exhausted};

use crate::{
    app_table,
    config::{self, Config},
    discover::{discover_targets, target_name_suggestion, DiscoveryError, Target},
    report,
};

/// Builds one application, given the address its linker script now names.
///
/// The real implementation shells out to the configured command; tests use a
/// stand-in that fails on demand.
pub trait Builder {
    fn build(&mut self, target: &Target, address: u64) -> Result<(), BuildError>;
}

/// Runs the configured build command for each target.
pub struct CommandBuilder<'a> {
    cfg: &'a Config,
    verbose: bool,
}

impl<'a> CommandBuilder<'a> {
    pub fn new(cfg: &'a Config, verbose: bool) -> Self {
        Self { cfg, verbose }
    }
}

impl Builder for CommandBuilder<'_> {
    fn build(&mut self, target: &Target, address: u64) -> Result<(), BuildError> {
        let command = self.cfg.build_command(target, address);
        println!("building {} at {:#x}", target.name, address);
        if self.verbose {
            println!("  from {}", target.source.display());
            println!("  running {}", command);
        }

        let mut cmd = command.cmd();
        let status = cmd.status().map_err(|e| {
            BuildError::Spawn(format!("failed to run {}: {}", command, e))
        })?;
        if !status.success() {
            return Err(BuildError::Status(status));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum BuildError {
    /// The command couldn't be started at all.
    Spawn(String),
    /// The command ran and reported failure.
    Status(ExitStatus),
    /// Reported by a non-process builder.
    Other(String),
}

impl std::fmt::Display for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildError::Spawn(s) | BuildError::Other(s) => write!(f, "{}", s),
            BuildError::Status(s) => write!(f, "build command {}", s),
        }
    }
}

impl std::error::Error for BuildError {}

#[derive(Debug)]
pub enum Outcome {
    Built,
    Failed(BuildError),
    /// Not attempted, because the run stopped before getting here.
    Skipped,
}

#[derive(Debug)]
pub struct Entry {
    pub ordinal: usize,
    /// `None` if we never got as far as computing it.
    pub address: Option<u64>,
    pub outcome: Outcome,
}

/// What happened to each requested target, in build order.
#[derive(Debug, Default)]
pub struct RunReport {
    pub entries: IndexMap<String, Entry>,
}

impl RunReport {
    fn new<'a>(targets: impl Iterator<Item = &'a Target>) -> Self {
        let entries = targets
            .map(|t| {
                let e = Entry {
                    ordinal: t.ordinal,
                    address: None,
                    outcome: Outcome::Skipped,
                };
                (t.name.clone(), e)
            })
            .collect();
        RunReport { entries }
    }

    fn names(&self, f: impl Fn(&Outcome) -> bool) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(_, e)| f(&e.outcome))
            .map(|(n, _)| n.as_str())
            .collect()
    }

    pub fn succeeded(&self) -> Vec<&str> {
        self.names(|o| matches!(o, Outcome::Built))
    }

    pub fn failed(&self) -> Vec<&str> {
        self.names(|o| matches!(o, Outcome::Failed(..)))
    }

    pub fn skipped(&self) -> Vec<&str> {
        self.names(|o| matches!(o, Outcome::Skipped))
    }

    /// Every requested target was built.
    pub fn is_success(&self) -> bool {
        self.entries
            .values()
            .all(|e| matches!(e.outcome, Outcome::Built))
    }

    fn record(
        &mut self,
        target: &Target,
        address: u64,
        outcome: Option<Outcome>,
    ) {
        if let Some(e) = self.entries.get_mut(&target.name) {
            e.address = Some(address);
            if let Some(o) = outcome {
                e.outcome = o;
            }
        }
    }
}

/// Why a run stopped early.
#[derive(Debug)]
pub enum Abort {
    Artifact(ArtifactError),
    Exhausted(Exhausted),
    Interrupted,
}

impl std::fmt::Display for Abort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Abort::Artifact(e) => write!(f, "{}", e),
            Abort::Exhausted(e) => write!(f, "{}", e),
            Abort::Interrupted => write!(f, "interrupted"),
        }
    }
}

#[derive(Debug)]
pub enum RunError {
    /// Nothing was touched.
    Discovery(DiscoveryError),
    /// Nothing was touched.
    UnknownTarget(String),
    /// The run stopped early; the linker script is back as it was.
    Aborted { cause: Abort, report: RunReport },
    /// The linker script could not be put back. This is the one failure that
    /// leaves a mess behind.
    Corrupted {
        cause: Option<Abort>,
        restore: ArtifactError,
        report: RunReport,
    },
}

impl RunError {
    pub fn report(&self) -> Option<&RunReport> {
        match self {
            RunError::Aborted { report, .. }
            | RunError::Corrupted { report, .. } => Some(report),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::Discovery(e) => write!(f, "{}", e),
            RunError::UnknownTarget(s) => write!(f, "{}", s),
            RunError::Aborted { cause, .. } => {
                write!(f, "build aborted: {}", cause)
            }
            RunError::Corrupted { cause, restore, .. } => {
                write!(
                    f,
                    "LINKER SCRIPT LEFT MODIFIED: restoring it failed ({})",
                    restore
                )?;
                if let Some(cause) = cause {
                    write!(f, "; the build had already aborted: {}", cause)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for RunError {}

/// Knobs for [`run`] that don't come from the address plan.
#[derive(Clone, Debug, Default)]
pub struct RunOptions<'a> {
    /// Build only these targets. Their slots are still computed from the full
    /// listing, so they land where a full build would put them.
    pub only: Option<&'a [String]>,
    /// Stop at the first failed build instead of carrying on.
    pub fail_fast: bool,
    /// Checked between builds; set by the Ctrl-C handler.
    pub interrupted: Option<Arc<AtomicBool>>,
}

/// Links every application in `source_dir` at its own address.
///
/// For each application, in discovery order, the shared linker script is
/// rewritten to name that application's address and `builder` is called.
/// A failed build is recorded and the run moves on (unless
/// `opts.fail_fast`). Whatever happens, the linker script is restored before
/// this returns, and storage is not opened at all unless discovery succeeds.
pub fn run<S, F, B>(
    plan: &AddressPlan,
    source_dir: &Path,
    open_storage: F,
    builder: &mut B,
    opts: &RunOptions<'_>,
) -> Result<RunReport, RunError>
where
    S: Storage,
    F: FnOnce() -> Result<S, ArtifactError>,
    B: Builder,
{
    let targets = discover_targets(source_dir).map_err(RunError::Discovery)?;
    let selected = select(&targets, opts.only)?;
    let mut report = RunReport::new(
        targets.iter().filter(|t| selected.contains(t.name.as_str())),
    );

    let script =
        open_storage().and_then(|s| LayoutScript::open(s, plan.base()));
    let mut script = match script {
        Ok(s) => s,
        Err(e) => {
            return Err(RunError::Aborted {
                cause: Abort::Artifact(e),
                report,
            })
        }
    };
    log::debug!(
        "patching {} in {}",
        script.token(),
        script.location().display()
    );

    let outcome = build_all(
        plan,
        &targets,
        &selected,
        &mut script,
        builder,
        opts,
        &mut report,
    );
    let location = script.location().display().to_string();
    let applied = script.applied();
    let modified = script.is_modified();
    let restored = script.restore();
    if modified && restored.is_ok() {
        log::debug!("{} restored", location);
    }

    match (outcome, restored) {
        (Ok(()), Ok(())) => Ok(report),
        (Err(cause), Ok(())) => Err(RunError::Aborted { cause, report }),
        (outcome, Err(restore)) => {
            match applied {
                Some(a) => log::error!(
                    "{} could not be restored and may still link at {:#x}: {}",
                    location,
                    a,
                    restore
                ),
                None => log::error!(
                    "{} could not be restored: {}",
                    location,
                    restore
                ),
            }
            Err(RunError::Corrupted {
                cause: outcome.err(),
                restore,
                report,
            })
        }
    }
}

fn select<'a>(
    targets: &'a [Target],
    only: Option<&'a [String]>,
) -> Result<BTreeSet<&'a str>, RunError> {
    let Some(names) = only else {
        return Ok(targets.iter().map(|t| t.name.as_str()).collect());
    };
    if names.is_empty() {
        return Err(RunError::UnknownTarget("no targets given".to_string()));
    }
    for name in names {
        if !targets.iter().any(|t| &t.name == name) {
            return Err(RunError::UnknownTarget(target_name_suggestion(
                targets, name,
            )));
        }
    }
    Ok(names.iter().map(|n| n.as_str()).collect())
}

fn build_all<S: Storage, B: Builder>(
    plan: &AddressPlan,
    targets: &[Target],
    selected: &BTreeSet<&str>,
    script: &mut LayoutScript<S>,
    builder: &mut B,
    opts: &RunOptions<'_>,
    report: &mut RunReport,
) -> Result<(), Abort> {
    let interrupted = || {
        opts.interrupted
            .as_ref()
            .map(|f| f.load(Ordering::SeqCst))
            .unwrap_or(false)
    };

    for target in targets {
        if !selected.contains(target.name.as_str()) {
            continue;
        }
        if interrupted() {
            return Err(Abort::Interrupted);
        }

        // Slots only grow with the ordinal, so running out here means every
        // remaining target would run out too.
        let address =
            plan.base_address(target.ordinal).map_err(Abort::Exhausted)?;
        report.record(target, address, None);

        script.retarget(address).map_err(Abort::Artifact)?;

        match builder.build(target, address) {
            Ok(()) => report.record(target, address, Some(Outcome::Built)),
            Err(e) => {
                log::warn!("{} failed to build: {}", target.name, e);
                report.record(target, address, Some(Outcome::Failed(e)));
                if opts.fail_fast {
                    log::info!("stopping at first failure (fail-fast)");
                    break;
                }
            }
        }
    }

    // A Ctrl-C during the last build shouldn't be mistaken for success.
    if interrupted() {
        return Err(Abort::Interrupted);
    }
    Ok(())
}

/// Builds the requested targets (all of them if `only` is `None`), prints a
/// report, and writes the app table after a complete, successful build.
pub fn package(
    cfg: &Config,
    only: Option<Vec<String>>,
    fail_fast: bool,
    verbose: bool,
) -> Result<()> {
    let plan = cfg.plan()?;
    if verbose {
        log::info!("{}", config::describe(cfg));
    }

    // Let Ctrl-C reach the build command, but not kill us before the linker
    // script has been put back.
    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let flag = interrupted.clone();
        ctrlc::set_handler(move || {
            flag.store(true, Ordering::SeqCst);
        })?;
    }

    let opts = RunOptions {
        only: only.as_deref(),
        fail_fast: fail_fast || cfg.fail_fast,
        interrupted: Some(interrupted),
    };
    let mut builder = CommandBuilder::new(cfg, verbose);
    let layout_path = cfg.layout_path.clone();
    let result = run(
        &plan,
        &cfg.source_dir,
        move || LayoutFile::lock(layout_path),
        &mut builder,
        &opts,
    );

    let report = match &result {
        Ok(report) => Some(report),
        Err(e) => e.report(),
    };
    if let Some(report) = report {
        report::print_report(report, &plan)?;
    }

    let report = result?;
    let failed = report.failed();
    if !failed.is_empty() {
        bail!(
            "{} of {} application(s) failed to build: {}",
            failed.len(),
            report.entries.len(),
            failed.join(", ")
        );
    }
    if !report.is_success() {
        bail!("stopped before building: {}", report.skipped().join(", "));
    }

    if only.is_none() {
        if let Some(table) = &cfg.app_table {
            app_table::write(table, &report)?;
        }
    }
    Ok(())
}
