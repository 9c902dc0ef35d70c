// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use link_addr::{address_token, AddressPlan};
use serde::Deserialize;

use crate::discover::Target;

pub const DEFAULT_BASE_ADDRESS: u64 = 0x8040_0000;
pub const DEFAULT_STEP: u64 = 0x20_0000;
pub const DEFAULT_ADDRESS_WIDTH: u32 = 64;

/// A `RawConfig` represents a `build.toml` file that has been deserialized,
/// but not yet merged with command-line overrides or had its paths resolved.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawConfig {
    base_address: Option<u64>,
    step: Option<u64>,
    address_width: Option<u32>,
    source_dir: Option<PathBuf>,
    layout_path: Option<PathBuf>,
    build_command: Option<Vec<String>>,
    #[serde(default)]
    fail_fast: bool,
    app_table: Option<AppTable>,
}

/// Where to write the assembly table that embeds every built image.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct AppTable {
    /// Output file, e.g. the kernel's `src/link_app.S`.
    pub path: PathBuf,
    /// Directory holding the built images.
    pub image_dir: PathBuf,
    /// Extension of each image file, without the dot.
    #[serde(default = "default_image_extension")]
    pub extension: String,
}

fn default_image_extension() -> String {
    "bin".to_string()
}

/// Settings that may be given on the command line, overriding `build.toml`.
#[derive(Clone, Debug, Default, clap::Args)]
pub struct Overrides {
    /// Path to the build configuration file, in TOML.
    #[clap(long = "config", short = 'c')]
    pub config: Option<PathBuf>,
    /// Directory with one entry per application [default: src/bin]
    #[clap(long)]
    pub source_dir: Option<PathBuf>,
    /// Linker script shared by every application [default: src/linker.ld]
    #[clap(long)]
    pub layout_path: Option<PathBuf>,
    /// Load address of the first application [default: 0x80400000]
    #[clap(long, parse(try_from_str = parse_int::parse))]
    pub base_address: Option<u64>,
    /// Distance between consecutive applications [default: 0x200000]
    #[clap(long, parse(try_from_str = parse_int::parse))]
    pub step: Option<u64>,
    /// Width of the address space, in bits [default: 64]
    #[clap(long)]
    pub address_width: Option<u32>,
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Directory that relative paths are resolved against, and where the
    /// build command runs.
    pub root: PathBuf,
    pub base_address: u64,
    pub step: u64,
    pub address_width: u32,
    pub source_dir: PathBuf,
    pub layout_path: PathBuf,
    pub build_command: Vec<String>,
    pub fail_fast: bool,
    pub app_table: Option<AppTable>,
}

impl Config {
    /// Loads `build.toml` (if one was given) and applies `overrides` on top.
    pub fn load(overrides: &Overrides) -> Result<Self> {
        let (raw, root) = match &overrides.config {
            Some(path) => {
                let contents = std::fs::read(path).with_context(|| {
                    format!("could not read {}", path.display())
                })?;
                let raw: RawConfig = toml::from_slice(&contents)
                    .with_context(|| {
                        format!("could not parse {}", path.display())
                    })?;
                let root = match path.parent() {
                    Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
                    _ => PathBuf::from("."),
                };
                (raw, root)
            }
            None => (RawConfig::default(), PathBuf::from(".")),
        };

        // The build command runs in `root`, so anything we hand it must not
        // depend on where we were started from.
        let cwd = std::env::current_dir()?;
        let overrides = Overrides {
            source_dir: overrides.source_dir.as_ref().map(|p| cwd.join(p)),
            layout_path: overrides.layout_path.as_ref().map(|p| cwd.join(p)),
            ..overrides.clone()
        };
        Self::from_raw(raw, cwd.join(root), &overrides)
    }

    fn from_raw(
        raw: RawConfig,
        root: PathBuf,
        overrides: &Overrides,
    ) -> Result<Self> {
        let build_command = raw.build_command.unwrap_or_else(|| {
            ["cargo", "build", "--bin", "{name}", "--release"]
                .iter()
                .map(|s| s.to_string())
                .collect()
        });
        if build_command.is_empty() {
            bail!("build-command must name a program to run");
        }

        // Paths from the command line are relative to where we were run;
        // paths from the file are relative to the file.
        let source_dir = match &overrides.source_dir {
            Some(p) => p.clone(),
            None => {
                root.join(raw.source_dir.unwrap_or_else(|| "src/bin".into()))
            }
        };
        let layout_path = match &overrides.layout_path {
            Some(p) => p.clone(),
            None => root.join(
                raw.layout_path.unwrap_or_else(|| "src/linker.ld".into()),
            ),
        };
        let app_table = raw.app_table.map(|t| AppTable {
            path: root.join(t.path),
            image_dir: root.join(t.image_dir),
            extension: t.extension,
        });

        let cfg = Config {
            root,
            base_address: overrides
                .base_address
                .or(raw.base_address)
                .unwrap_or(DEFAULT_BASE_ADDRESS),
            step: overrides.step.or(raw.step).unwrap_or(DEFAULT_STEP),
            address_width: overrides
                .address_width
                .or(raw.address_width)
                .unwrap_or(DEFAULT_ADDRESS_WIDTH),
            source_dir,
            layout_path,
            build_command,
            fail_fast: raw.fail_fast,
            app_table,
        };
        cfg.plan()?;
        Ok(cfg)
    }

    pub fn plan(&self) -> Result<AddressPlan> {
        AddressPlan::new(self.base_address, self.step, self.address_width)
            .context("invalid address configuration")
    }

    /// Expands the build command template for one target.
    pub fn build_command(&self, target: &Target, address: u64) -> BuildCommand {
        let ordinal = target.ordinal.to_string();
        let address = address_token(address);
        let layout = self.layout_path.display().to_string();

        let expand = |s: &str| {
            s.replace("{name}", &target.name)
                .replace("{ordinal}", &ordinal)
                .replace("{address}", &address)
                .replace("{layout}", &layout)
        };
        let mut words = self.build_command.iter().map(|s| expand(s));
        // Checked non-empty when the config was loaded.
        let program = words.next().unwrap_or_default();
        let args = words.collect();

        // Build scripts can `rerun-if-env-changed` on these to notice that the
        // linker script moved under them.
        let mut env = BTreeMap::new();
        env.insert("APP_NAME".to_string(), target.name.clone());
        env.insert("APP_ORDINAL".to_string(), ordinal);
        env.insert("APP_BASE_ADDRESS".to_string(), address);
        env.insert("APP_LAYOUT".to_string(), layout);

        BuildCommand {
            program,
            args,
            env,
            dir: self.root.clone(),
        }
    }
}

/// Stores the program, arguments and environment to build one target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub dir: PathBuf,
}

impl BuildCommand {
    pub fn cmd(&self) -> std::process::Command {
        let mut cmd = std::process::Command::new(&self.program);
        cmd.args(&self.args);
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        cmd.current_dir(&self.dir);
        cmd
    }
}

impl std::fmt::Display for BuildCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for a in &self.args {
            write!(f, " {}", a)?;
        }
        Ok(())
    }
}

/// Reports the settings that `cfg` ended up with, for `--verbose` runs.
pub fn describe(cfg: &Config) -> String {
    format!(
        "base {:#x}, step {:#x}, {}-bit, apps in {}, script {}",
        cfg.base_address,
        cfg.step,
        cfg.address_width,
        cfg.source_dir.display(),
        cfg.layout_path.display(),
    )
}
