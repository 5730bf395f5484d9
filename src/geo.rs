//! Census geography identifiers (FIPS codes) and aggregation granularity.

use anyhow::{Result, bail};
use std::fmt;
use std::str::FromStr;

/// Two-digit codes in the 01..=56 range that are not assigned to a state.
pub const NON_STATE_FIPS: &[&str] = &["03", "07", "14", "43", "52"];

/// Aggregation level. Determines the FIPS width, the store column used for
/// grouping and the directory name used by the sample bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Granularity {
    State,
    County,
    Tract,
    Block,
}

impl Granularity {
    /// Number of digits in an identifier at this level.
    pub fn width(self) -> usize {
        match self {
            Granularity::State => 2,
            Granularity::County => 5,
            Granularity::Tract => 11,
            Granularity::Block => 15,
        }
    }

    /// Indexed store column holding identifiers at this level.
    pub fn column(self) -> &'static str {
        match self {
            Granularity::State => "substr(county_fips, 1, 2)",
            Granularity::County => "county_fips",
            Granularity::Tract => "tract_fips",
            Granularity::Block => "block_fips",
        }
    }

    /// Plural path segment, as used in the M-Lab statistics bucket.
    pub fn plural(self) -> &'static str {
        match self {
            Granularity::State => "states",
            Granularity::County => "counties",
            Granularity::Tract => "tracts",
            Granularity::Block => "blocks",
        }
    }

    /// Singular name, as used in provider output file names.
    pub fn singular(self) -> &'static str {
        match self {
            Granularity::State => "state",
            Granularity::County => "county",
            Granularity::Tract => "tract",
            Granularity::Block => "block",
        }
    }

    /// Left-pads a numeric identifier with zeros up to [`Self::width`].
    pub fn pad(self, id: &str) -> String {
        format!("{:0>width$}", id, width = self.width())
    }

    /// Truth that `id` is a digit string of exactly this level's width.
    pub fn matches(self, id: &str) -> bool {
        id.len() == self.width() && id.bytes().all(|b| b.is_ascii_digit())
    }
}

impl FromStr for Granularity {
    type Err = anyhow::Error;

    /// Accepts both singular and plural spellings (`county`, `counties`, ...).
    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "state" | "states" => Granularity::State,
            "county" | "counties" => Granularity::County,
            "tract" | "tracts" => Granularity::Tract,
            "block" | "blocks" => Granularity::Block,
            other => bail!("unknown geography granularity '{other}'"),
        })
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.singular())
    }
}

/// Tract FIPS of a block code: its first 11 characters.
pub fn tract_fips(block_fips: &str) -> &str {
    &block_fips[..Granularity::Tract.width()]
}

/// County FIPS of a block (or tract) code: its first 5 characters.
pub fn county_fips(block_fips: &str) -> &str {
    &block_fips[..Granularity::County.width()]
}

/// Two-digit state codes 01..=56, including the unassigned ones.
pub fn state_codes() -> impl Iterator<Item = String> {
    (1..57).map(|i| format!("{i:02}"))
}

/// Truth that a two-digit code designates an actual state or territory.
pub fn is_state_fips(code: &str) -> bool {
    Granularity::State.matches(code) && !NON_STATE_FIPS.contains(&code)
}
