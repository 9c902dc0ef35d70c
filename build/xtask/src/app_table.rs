// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel finds applications through a table of image boundaries,
//! assembled into its data section. Entry `i` of the table is the start of
//! application `i`, and the entry after the last is the end of the final
//! image, so that every image's extent can be read off two neighbours.

use std::fmt::Write as _;
use std::fs;

use anyhow::{Context, Result};

use crate::config::AppTable;
use crate::dist::RunReport;

pub fn render(
    table: &AppTable,
    names: &[&str],
) -> Result<String, std::fmt::Error> {
    let mut out = String::new();
    writeln!(out, "    .align 3")?;
    writeln!(out, "    .section .data")?;
    writeln!(out, "    .global __num_app")?;
    writeln!(out, "    .global __end_app")?;
    writeln!(out, "__num_app:")?;
    writeln!(out, "    .quad {}", names.len())?;
    for i in 0..names.len() {
        writeln!(out, "    .quad app_{}_start", i)?;
    }
    if let Some(last) = names.len().checked_sub(1) {
        writeln!(out, "    .quad app_{}_end", last)?;
    }

    for (i, name) in names.iter().enumerate() {
        let image = table
            .image_dir
            .join(format!("{}.{}", name, table.extension));
        writeln!(out)?;
        writeln!(out, "    .section .data")?;
        writeln!(out, "    .global app_{}_start", i)?;
        writeln!(out, "    .global app_{}_end", i)?;
        writeln!(out, "app_{}_start:", i)?;
        writeln!(out, "    .incbin \"{}\"", image.display())?;
        writeln!(out, "app_{}_end:", i)?;
    }

    writeln!(out)?;
    writeln!(out, "__end_app:")?;
    writeln!(out, "    .quad 0")?;
    Ok(out)
}

/// Writes the table for every application in `report`, in build order.
pub fn write(table: &AppTable, report: &RunReport) -> Result<()> {
    let names: Vec<&str> = report.entries.keys().map(|s| s.as_str()).collect();
    let text = render(table, &names)?;

    // Rewriting an identical file would make the kernel's build script
    // rebuild for nothing.
    if fs::read_to_string(&table.path).ok().as_deref() == Some(text.as_str()) {
        log::debug!("{} is up to date", table.path.display());
        return Ok(());
    }
    fs::write(&table.path, text)
        .with_context(|| format!("could not write {}", table.path.display()))?;
    log::info!(
        "wrote {} application(s) to {}",
        names.len(),
        table.path.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dist::{Entry, Outcome};
    use indoc::indoc;
    use std::path::PathBuf;

    fn table(path: PathBuf) -> AppTable {
        AppTable {
            path,
            image_dir: PathBuf::from("../user/target/release"),
            extension: "bin".to_string(),
        }
    }

    #[test]
    fn two_apps() {
        let t = table(PathBuf::from("link_app.S"));
        assert_eq!(
            render(&t, &["hello", "power"]).unwrap(),
            indoc! {r#"
                    .align 3
                    .section .data
                    .global __num_app
                    .global __end_app
                __num_app:
                    .quad 2
                    .quad app_0_start
                    .quad app_1_start
                    .quad app_1_end

                    .section .data
                    .global app_0_start
                    .global app_0_end
                app_0_start:
                    .incbin "../user/target/release/hello.bin"
                app_0_end:

                    .section .data
                    .global app_1_start
                    .global app_1_end
                app_1_start:
                    .incbin "../user/target/release/power.bin"
                app_1_end:

                __end_app:
                    .quad 0
            "#}
        );
    }

    #[test]
    fn written_in_report_order() {
        let dir = tempfile::tempdir().unwrap();
        let t = table(dir.path().join("link_app.S"));
        let mut report = RunReport::default();
        for (ordinal, name) in ["a", "b", "c"].iter().enumerate() {
            report.entries.insert(
                name.to_string(),
                Entry {
                    ordinal,
                    address: Some(0x8040_0000 + ordinal as u64 * 0x20_0000),
                    outcome: Outcome::Built,
                },
            );
        }
        write(&t, &report).unwrap();
        let text = fs::read_to_string(&t.path).unwrap();
        assert!(text.contains("    .quad 3\n"));
        let a = text.find("a.bin").unwrap();
        let b = text.find("b.bin").unwrap();
        let c = text.find("c.bin").unwrap();
        assert!(a < b && b < c);

        // A second identical write leaves the file alone.
        let before = fs::metadata(&t.path).unwrap().modified().unwrap();
        write(&t, &report).unwrap();
        let after = fs::metadata(&t.path).unwrap().modified().unwrap();
        assert_eq!(before, after);
    }
}
