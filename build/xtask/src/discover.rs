// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// One application to be built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    /// Binary name, as passed to `cargo build --bin`.
    pub name: String,
    /// Position in the sorted listing of the source directory. This, and
    /// nothing else, decides where the application is linked.
    pub ordinal: usize,
    /// The file (or directory) the name came from.
    pub source: PathBuf,
}

/// Lists the applications in `dir`.
///
/// Every entry that doesn't start with `.` is an application, whether it's a
/// single file (`hello.rs`) or a directory (`hello/main.rs`); its name is
/// everything before the first `.`. Entries are ordered by file name, so
/// adding `aardvark.rs` moves every other application up one slot.
pub fn discover_targets(dir: &Path) -> Result<Vec<Target>, DiscoveryError> {
    let unreadable = |source| DiscoveryError::Unreadable {
        dir: dir.to_owned(),
        source,
    };

    let mut entries = vec![];
    for entry in fs::read_dir(dir).map_err(unreadable)? {
        let entry = entry.map_err(unreadable)?;
        let file_name = entry.file_name().into_string().map_err(|name| {
            DiscoveryError::BadName {
                dir: dir.to_owned(),
                name,
            }
        })?;
        if file_name.starts_with('.') {
            continue;
        }
        entries.push((file_name, entry.path()));
    }
    if entries.is_empty() {
        return Err(DiscoveryError::Empty { dir: dir.to_owned() });
    }
    entries.sort();

    let mut seen: BTreeMap<String, PathBuf> = BTreeMap::new();
    let mut targets = Vec::with_capacity(entries.len());
    for (ordinal, (file_name, source)) in entries.into_iter().enumerate() {
        let name = match file_name.split('.').next() {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => {
                return Err(DiscoveryError::BadName {
                    dir: dir.to_owned(),
                    name: file_name.into(),
                })
            }
        };
        if let Some(first) = seen.insert(name.clone(), source.clone()) {
            return Err(DiscoveryError::Duplicate {
                name,
                first,
                second: source,
            });
        }
        targets.push(Target {
            name,
            ordinal,
            source,
        });
    }
    Ok(targets)
}

pub fn target_name_suggestion(targets: &[Target], name: &str) -> String {
    // Suggest only for very small differences
    const MAX_DISTANCE: usize = 3;

    let mut scored: Vec<_> = targets
        .iter()
        .filter_map(|t| {
            let distance = strsim::damerau_levenshtein(name, &t.name);
            if distance <= MAX_DISTANCE {
                Some((distance, t.name.as_str()))
            } else {
                None
            }
        })
        .collect();
    scored.sort();
    let mut out = format!("'{}' is not a valid target name.", name);
    if let Some((_, s)) = scored.first() {
        out.push_str(&format!(" Did you mean '{}'?", s));
    }
    out
}

#[derive(Debug)]
pub enum DiscoveryError {
    Unreadable { dir: PathBuf, source: io::Error },
    Empty { dir: PathBuf },
    BadName { dir: PathBuf, name: OsString },
    Duplicate {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },
}

impl std::fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscoveryError::Unreadable { dir, source } => write!(
                f,
                "could not list applications in {}: {}",
                dir.display(),
                source
            ),
            DiscoveryError::Empty { dir } => {
                write!(f, "no applications found in {}", dir.display())
            }
            DiscoveryError::BadName { dir, name } => write!(
                f,
                "{:?} in {} does not name an application",
                name,
                dir.display()
            ),
            DiscoveryError::Duplicate {
                name,
                first,
                second,
            } => write!(
                f,
                "both {} and {} would build an application named '{}'",
                first.display(),
                second.display(),
                name
            ),
        }
    }
}

impl std::error::Error for DiscoveryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DiscoveryError::Unreadable { source, .. } => Some(source),
            _ => None,
        }
    }
}
