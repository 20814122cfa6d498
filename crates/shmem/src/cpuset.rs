// SPDX-License-Identifier: Apache-2.0

//! Fixed-size CPU set with a stable in-memory layout.
//!
//! The set lives inside shared-memory records, so it must be plain data
//! with an architecture-independent layout: a fixed array of `u64`
//! words, no length field, no heap. The compile-time capacity
//! ([`MAX_CPUS`]) bounds the CPUs a segment can describe; the segment's
//! runtime `system_size` restricts which bits are meaningful.

use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign};
use std::str::FromStr;

/// Compile-time capacity of a [`CpuSet`].
pub const MAX_CPUS: usize = 512;

const WORD_BITS: usize = u64::BITS as usize;
const WORDS: usize = MAX_CPUS / WORD_BITS;

/// A set of CPU ids in `[0, MAX_CPUS)`.
#[repr(C)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CpuSet {
    words: [u64; WORDS],
}

impl CpuSet {
    /// The empty set.
    #[must_use]
    pub const fn new() -> Self {
        CpuSet { words: [0; WORDS] }
    }

    /// A set holding a single CPU.
    #[must_use]
    pub fn single(cpuid: usize) -> Self {
        let mut set = CpuSet::new();
        set.set(cpuid);
        set
    }

    /// A set holding `[0, n)`.
    #[must_use]
    pub fn first_n(n: usize) -> Self {
        let mut set = CpuSet::new();
        for cpuid in 0..n {
            set.set(cpuid);
        }
        set
    }

    /// Adds a CPU to the set.
    ///
    /// # Panics
    /// Panics if `cpuid >= MAX_CPUS`; ids are validated against the
    /// segment's system size before they reach a set.
    pub fn set(&mut self, cpuid: usize) {
        assert!(cpuid < MAX_CPUS, "cpu id {cpuid} exceeds capacity {MAX_CPUS}");
        self.words[cpuid / WORD_BITS] |= 1 << (cpuid % WORD_BITS);
    }

    /// Removes a CPU from the set.
    pub fn clear(&mut self, cpuid: usize) {
        if cpuid < MAX_CPUS {
            self.words[cpuid / WORD_BITS] &= !(1 << (cpuid % WORD_BITS));
        }
    }

    /// Whether the set contains a CPU.
    #[must_use]
    pub fn contains(&self, cpuid: usize) -> bool {
        cpuid < MAX_CPUS && self.words[cpuid / WORD_BITS] & (1 << (cpuid % WORD_BITS)) != 0
    }

    /// Number of CPUs in the set.
    #[must_use]
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Lowest CPU id in the set, if any.
    #[must_use]
    pub fn first(&self) -> Option<usize> {
        self.iter().next()
    }

    /// Iterates CPU ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &word)| {
            (0..WORD_BITS).filter(move |bit| word & (1 << bit) != 0).map(move |bit| i * WORD_BITS + bit)
        })
    }

    /// `self \ other`.
    #[must_use]
    pub fn difference(&self, other: &CpuSet) -> CpuSet {
        let mut out = *self;
        for (w, o) in out.words.iter_mut().zip(other.words.iter()) {
            *w &= !o;
        }
        out
    }

    /// Whether the two sets share no CPU.
    #[must_use]
    pub fn is_disjoint(&self, other: &CpuSet) -> bool {
        self.words.iter().zip(other.words.iter()).all(|(a, b)| a & b == 0)
    }

    /// Whether every CPU of `self` is in `other`.
    #[must_use]
    pub fn is_subset(&self, other: &CpuSet) -> bool {
        self.words.iter().zip(other.words.iter()).all(|(a, b)| a & !b == 0)
    }
}

impl BitOr for CpuSet {
    type Output = CpuSet;

    fn bitor(mut self, rhs: CpuSet) -> CpuSet {
        self |= rhs;
        self
    }
}

impl BitOrAssign for CpuSet {
    fn bitor_assign(&mut self, rhs: CpuSet) {
        for (w, o) in self.words.iter_mut().zip(rhs.words.iter()) {
            *w |= o;
        }
    }
}

impl BitAnd for CpuSet {
    type Output = CpuSet;

    fn bitand(mut self, rhs: CpuSet) -> CpuSet {
        self &= rhs;
        self
    }
}

impl BitAndAssign for CpuSet {
    fn bitand_assign(&mut self, rhs: CpuSet) {
        for (w, o) in self.words.iter_mut().zip(rhs.words.iter()) {
            *w &= o;
        }
    }
}

impl FromIterator<usize> for CpuSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut set = CpuSet::new();
        for cpuid in iter {
            set.set(cpuid);
        }
        set
    }
}

impl fmt::Display for CpuSet {
    /// Renders as sorted ranges: `0-3,7,12-13`. The empty set renders as `-`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "-");
        }
        let mut first = true;
        let mut run_start = None;
        let mut prev = 0usize;
        for cpuid in self.iter() {
            match run_start {
                None => run_start = Some(cpuid),
                Some(start) => {
                    if cpuid != prev + 1 {
                        write_run(f, &mut first, start, prev)?;
                        run_start = Some(cpuid);
                    }
                }
            }
            prev = cpuid;
        }
        if let Some(start) = run_start {
            write_run(f, &mut first, start, prev)?;
        }
        Ok(())
    }
}

fn write_run(f: &mut fmt::Formatter<'_>, first: &mut bool, start: usize, end: usize) -> fmt::Result {
    if !*first {
        write!(f, ",")?;
    }
    *first = false;
    if start == end {
        write!(f, "{start}")
    } else {
        write!(f, "{start}-{end}")
    }
}

impl fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuSet({self})")
    }
}

/// Error parsing a CPU list.
#[derive(thiserror::Error, Debug)]
#[error("invalid cpu list `{0}` (expected e.g. `0-3,7`)")]
pub struct ParseCpuSetError(String);

impl FromStr for CpuSet {
    type Err = ParseCpuSetError;

    /// Parses sorted-range syntax: `0-3,7`. `-` or the empty string is
    /// the empty set.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut set = CpuSet::new();
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed == "-" {
            return Ok(set);
        }
        for part in trimmed.split(',') {
            let parse = |tok: &str| {
                tok.trim()
                    .parse::<usize>()
                    .ok()
                    .filter(|&c| c < MAX_CPUS)
                    .ok_or_else(|| ParseCpuSetError(s.to_owned()))
            };
            match part.split_once('-') {
                Some((lo, hi)) => {
                    let (lo, hi) = (parse(lo)?, parse(hi)?);
                    if lo > hi {
                        return Err(ParseCpuSetError(s.to_owned()));
                    }
                    for cpuid in lo..=hi {
                        set.set(cpuid);
                    }
                }
                None => set.set(parse(part)?),
            }
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn set_clear_contains() {
        let mut set = CpuSet::new();
        assert!(set.is_empty());
        set.set(0);
        set.set(63);
        set.set(64);
        set.set(MAX_CPUS - 1);
        assert!(set.contains(0));
        assert!(set.contains(63));
        assert!(set.contains(64));
        assert!(set.contains(MAX_CPUS - 1));
        assert_eq!(set.count(), 4);
        set.clear(63);
        assert!(!set.contains(63));
        assert_eq!(set.count(), 3);
    }

    #[test]
    fn iterates_in_ascending_order() {
        let set: CpuSet = [5usize, 1, 64, 2].into_iter().collect();
        let cpus: Vec<usize> = set.iter().collect();
        assert_eq!(cpus, vec![1, 2, 5, 64]);
        assert_eq!(set.first(), Some(1));
    }

    #[test]
    fn set_algebra() {
        let a: CpuSet = [0usize, 1, 2].into_iter().collect();
        let b: CpuSet = [2usize, 3].into_iter().collect();
        assert_eq!((a | b).count(), 4);
        assert_eq!((a & b).count(), 1);
        assert_eq!(a.difference(&b).iter().collect::<Vec<_>>(), vec![0, 1]);
        assert!(!a.is_disjoint(&b));
        assert!(a.difference(&b).is_disjoint(&b));
        assert!(CpuSet::single(2).is_subset(&a));
    }

    #[test]
    fn displays_ranges() {
        let set: CpuSet = [0usize, 1, 2, 3, 7, 12, 13].into_iter().collect();
        assert_eq!(set.to_string(), "0-3,7,12-13");
        assert_eq!(CpuSet::new().to_string(), "-");
        assert_eq!(CpuSet::single(9).to_string(), "9");
    }

    #[test]
    fn parses_ranges() {
        let set: CpuSet = "0-3,7,12-13".parse().expect("valid list");
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 1, 2, 3, 7, 12, 13]);
        let empty: CpuSet = "-".parse().expect("empty");
        assert!(empty.is_empty());
        assert!("3-1".parse::<CpuSet>().is_err());
        assert!("a,b".parse::<CpuSet>().is_err());
        assert!(format!("{}", MAX_CPUS).parse::<CpuSet>().is_err());
    }

    #[test]
    fn first_n_fills_prefix() {
        let set = CpuSet::first_n(4);
        assert_eq!(set.to_string(), "0-3");
    }
}
