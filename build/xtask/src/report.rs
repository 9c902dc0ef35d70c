// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.


use link_addr::{address_token, AddressPlan};
use termcolor::{Color, ColorSpec, StandardStream, WriteColor};

use crate::discover::Target;
use crate::dist::{Outcome, RunReport};

fn stdout() -> StandardStream {
    let color_choice = if atty::is(atty::Stream::Stdout) {
        termcolor::ColorChoice::Auto
    } else {
        termcolor::ColorChoice::Never
    };
    StandardStream::stdout(color_choice)
}

/// Prints where each target would be linked, without building anything.
pub fn print_plan(
    plan: &AddressPlan,
    targets: &[Target],
) -> anyhow::Result<()> {
    write_plan(&mut stdout(), plan, targets)
}

pub fn print_report(
    report: &RunReport,
    plan: &AddressPlan,
) -> anyhow::Result<()> {
    write_report(&mut stdout(), report, plan)
}

fn write_plan(
    out: &mut dyn WriteColor,
    plan: &AddressPlan,
    targets: &[Target],
) -> anyhow::Result<()> {
    let width = name_width(targets.iter().map(|t| t.name.as_str()));
    out.set_color(ColorSpec::new().set_bold(true))?;
    writeln!(out, "{:>3}  {:<width$}  RANGE", "#", "NAME")?;
    out.reset()?;

    for t in targets {
        write!(out, "{:>3}  {:<width$}  ", t.ordinal, t.name)?;
        match plan.range(t.ordinal) {
            Ok(r) => writeln!(
                out,
                "{}..={}",
                address_token(r.start),
                address_token(r.end - 1)
            )?,
            Err(e) => {
                out.set_color(
                    ColorSpec::new().set_bold(true).set_fg(Some(Color::Red)),
                )?;
                writeln!(out, "{}", e)?;
                out.reset()?;
            }
        }
    }
    Ok(())
}

fn write_report(
    out: &mut dyn WriteColor,
    report: &RunReport,
    plan: &AddressPlan,
) -> anyhow::Result<()> {
    let width = name_width(report.entries.keys().map(|s| s.as_str()));
    writeln!(out)?;
    out.set_color(ColorSpec::new().set_bold(true))?;
    writeln!(out, "========== Build summary ==========")?;
    out.reset()?;

    for (name, e) in &report.entries {
        write!(out, "{:>3}  {:<width$}  ", e.ordinal, name)?;
        match e.address {
            Some(a) => write!(out, "{:<12}", address_token(a))?,
            None => write!(out, "{:<12}", "-")?,
        }
        let mut color = ColorSpec::new();
        let label = match &e.outcome {
            Outcome::Built => {
                color.set_fg(Some(Color::Green));
                "ok"
            }
            Outcome::Failed(_) => {
                color.set_bold(true).set_fg(Some(Color::Red));
                "FAILED"
            }
            Outcome::Skipped => {
                color.set_dimmed(true);
                "skipped"
            }
        };
        out.set_color(&color)?;
        write!(out, "  {}", label)?;
        out.reset()?;
        if let Outcome::Failed(err) = &e.outcome {
            out.set_color(ColorSpec::new().set_dimmed(true))?;
            write!(out, " ({})", err)?;
            out.reset()?;
        }
        writeln!(out)?;
    }

    let built = report.succeeded().len();
    writeln!(
        out,
        "{} of {} built, {:#x} bytes reserved per application \
         in a {}-bit address space",
        built,
        report.entries.len(),
        plan.step(),
        plan.width()
    )?;
    Ok(())
}

fn name_width<'a>(names: impl Iterator<Item = &'a str>) -> usize {
    names.map(|n| n.len()).max().unwrap_or(0).max(4)
}
