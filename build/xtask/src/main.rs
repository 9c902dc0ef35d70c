// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::Result;
use clap::Parser;

mod app_table;
mod config;
mod discover;
mod dist;
mod report;

use config::{Config, Overrides};

#[derive(Debug, Parser)]
#[clap(
    max_term_width = 80,
    about = "extra tasks to help you build user applications"
)]
enum Xtask {
    /// Builds every application at its own, non-overlapping base address,
    /// restoring the shared linker script afterwards, and then writes the
    /// kernel's application table.
    Dist {
        #[clap(flatten)]
        overrides: Overrides,
        /// Stop at the first application that fails to build.
        #[clap(long)]
        fail_fast: bool,
        /// Print each build command before running it.
        #[clap(short)]
        verbose: bool,
    },

    /// Builds one or more applications at the address they would get from
    /// `dist`, without building the others. This is useful for iterating on
    /// a single application.
    Build {
        #[clap(flatten)]
        overrides: Overrides,
        /// Stop at the first application that fails to build.
        #[clap(long)]
        fail_fast: bool,
        /// Print each build command before running it.
        #[clap(short)]
        verbose: bool,
        /// Name of application(s) to build.
        #[clap(min_values = 1, required = true)]
        targets: Vec<String>,
    },

    /// Prints the address each application would be linked at, without
    /// building anything.
    Plan {
        #[clap(flatten)]
        overrides: Overrides,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    match Xtask::parse() {
        Xtask::Dist {
            overrides,
            fail_fast,
            verbose,
        } => {
            let cfg = Config::load(&overrides)?;
            dist::package(&cfg, None, fail_fast, verbose)?;
        }
        Xtask::Build {
            overrides,
            fail_fast,
            verbose,
            targets,
        } => {
            let cfg = Config::load(&overrides)?;
            dist::package(&cfg, Some(targets), fail_fast, verbose)?;
        }
        Xtask::Plan { overrides } => {
            let cfg = Config::load(&overrides)?;
            let plan = cfg.plan()?;
            let targets = discover::discover_targets(&cfg.source_dir)?;
            report::print_plan(&plan, &targets)?;
            // Fail if any slot didn't fit, after showing which.
            plan.assign(targets.iter().map(|t| t.name.as_str()))?;
        }
    }

    Ok(())
}
