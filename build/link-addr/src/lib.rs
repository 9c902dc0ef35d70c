// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Assigns load addresses to applications that cannot be relocated.
//!
//! Every application gets a fixed-size slot in one shared address space. The
//! slot for the application at position `i` of the (sorted) application list
//! starts at `base + step * i`, so two slots can never overlap as long as no
//! image grows past `step` bytes. Sizing `step` is left to whoever writes the
//! configuration.

use std::ops::Range;

/// Computes `base + step * ordinal`, or `None` if that doesn't fit in 64 bits.
pub fn base_address(ordinal: u64, base: u64, step: u64) -> Option<u64> {
    step.checked_mul(ordinal)?.checked_add(base)
}

/// Renders an address the way it appears in a linker script: `0x` followed by
/// lowercase hex digits, without padding.
pub fn address_token(addr: u64) -> String {
    format!("{:#x}", addr)
}

/// A validated base/stride pair, bounded by an address width in bits.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct AddressPlan {
    base: u64,
    step: u64,
    width: u32,
}

/// One application's slot in the address space.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Assignment {
    pub name: String,
    pub ordinal: usize,
    pub range: Range<u64>,
}

impl Assignment {
    pub fn address(&self) -> u64 {
        self.range.start
    }
}

impl AddressPlan {
    pub fn new(base: u64, step: u64, width: u32) -> Result<Self, PlanError> {
        if step == 0 {
            return Err(PlanError::ZeroStep);
        }
        if width == 0 || width > 64 {
            return Err(PlanError::BadWidth(width));
        }
        let plan = AddressPlan { base, step, width };
        if u128::from(base) >= plan.limit() {
            return Err(PlanError::BaseOutOfRange { base, width });
        }
        Ok(plan)
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    /// One past the highest address representable at this width.
    fn limit(&self) -> u128 {
        1u128 << self.width
    }

    /// Returns the base address of the slot at `ordinal`.
    pub fn base_address(&self, ordinal: usize) -> Result<u64, Exhausted> {
        self.range(ordinal).map(|r| r.start)
    }

    /// Returns the whole slot at `ordinal`. The slot must end at or below the
    /// top of the address space; if it doesn't, neither does any slot after it.
    ///
    /// The slot is a half-open `Range<u64>`, so its end must itself be a
    /// `u64`. Below 64 bits a slot may end exactly at `2^width` (so a 32-bit
    /// slot may end at `0x1_0000_0000`). At 64 bits the end can't be `2^64`, so
    /// the topmost slot of the space is never handed out.
    pub fn range(&self, ordinal: usize) -> Result<Range<u64>, Exhausted> {
        let exhausted = Exhausted {
            ordinal,
            base: self.base,
            step: self.step,
            width: self.width,
        };

        // Everything here fits comfortably in 128 bits: each factor is below
        // 2^64, so the product is below 2^128 - 2^65 and adding two more
        // 64-bit quantities can't wrap.
        let start = u128::from(self.base)
            + u128::from(self.step) * ordinal as u128;
        let end = start + u128::from(self.step);
        if end > self.limit() {
            return Err(exhausted);
        }

        // `end` may be exactly 2^64 when the width is 64, which is not a
        // valid u64; that slot is unusable as a half-open range.
        let start = u64::try_from(start).map_err(|_| exhausted.clone())?;
        let end = u64::try_from(end).map_err(|_| exhausted)?;
        Ok(start..end)
    }

    /// Assigns a slot to each name, in the order given.
    pub fn assign<I, S>(&self, names: I) -> Result<Vec<Assignment>, Exhausted>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        names
            .into_iter()
            .enumerate()
            .map(|(ordinal, name)| -> Result<Assignment, Exhausted> {
                Ok(Assignment {
                    name: name.into(),
                    ordinal,
                    range: self.range(ordinal)?,
                })
            })
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlanError {
    ZeroStep,
    BadWidth(u32),
    BaseOutOfRange { base: u64, width: u32 },
}

impl std::fmt::Display for PlanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanError::ZeroStep => write!(f, "step must be non-zero"),
            PlanError::BadWidth(w) => {
                write!(f, "address width must be 1..=64 bits, not {}", w)
            }
            PlanError::BaseOutOfRange { base, width } => write!(
                f,
                "base address {:#x} does not fit in {} bits",
                base, width
            ),
        }
    }
}

impl std::error::Error for PlanError {}

/// The slot for `ordinal` runs past the top of the address space.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Exhausted {
    pub ordinal: usize,
    pub base: u64,
    pub step: u64,
    pub width: u32,
}

impl std::fmt::Display for Exhausted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "address space exhausted: slot {} ({:#x} + {:#x} * {}) \
             does not fit in {} bits",
            self.ordinal, self.base, self.step, self.ordinal, self.width
        )
    }
}

impl std::error::Error for Exhausted {}
