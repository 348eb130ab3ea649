use std::fmt;

use snafu::{ensure, Location, Snafu};

const SEPARATOR: char = '/';
const LOCK_SUFFIX: &str = "/lock";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("namespace is empty"))]
    Empty {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("namespace {namespace:?} contains an empty path segment"))]
    EmptySegment {
        namespace: String,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("namespace {namespace:?} contains control characters"))]
    ControlCharacter {
        namespace: String,
        #[snafu(implicit)]
        location: Location,
    },
}

/// A validated counter stream name with leading and trailing `/` stripped.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace(String);

impl Namespace {
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let trimmed = raw.trim_matches(SEPARATOR);
        ensure!(!trimmed.is_empty(), EmptySnafu);
        ensure!(
            !trimmed.split(SEPARATOR).any(str::is_empty),
            EmptySegmentSnafu { namespace: raw }
        );
        ensure!(
            !trimmed.chars().any(char::is_control),
            ControlCharacterSnafu { namespace: raw }
        );
        Ok(Self(trimmed.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Counter and lock paths under `root`, which is either empty or an
    /// absolute path without a trailing separator.
    pub fn paths(&self, root: &str) -> CounterPaths {
        let counter = format!("{root}/{}", self.0);
        let lock = format!("{counter}{LOCK_SUFFIX}");
        CounterPaths { counter, lock }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Namespace {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterPaths {
    pub counter: String,
    pub lock: String,
}
