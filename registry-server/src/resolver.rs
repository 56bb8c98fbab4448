//! Semantic-version range resolution.
//!
//! A range is parsed once into a [`VersionRange`] (a conjunction of
//! comparators, or the `latest` alias) and evaluated against a package's known
//! versions. The best match is always the highest satisfying version by semver
//! precedence.
//!
//! Operator spellings live in one table, [`OPERATORS`], shared by the textual
//! form (`>=1.0.0 <2.0.0`) and the URL path form (`gte/1.0.0/lt/2.0.0`).

use semver::Version;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::AppError;

/// Comparison operator of a single comparator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
}

/// `(symbol, path word, operator)`. Longer symbols come first so prefix
/// matching never reads `>=` as `>`.
pub const OPERATORS: &[(&str, &str, Op)] = &[
    (">=", "gte", Op::Gte),
    ("<=", "lte", Op::Lte),
    (">", "gt", Op::Gt),
    ("<", "lt", Op::Lt),
    ("=", "eq", Op::Eq),
];

/// Expressions meaning "highest known version".
pub const LATEST_ALIASES: &[&str] = &["latest", "*", "x", "X", "x.x.x", "X.X.X"];

impl Op {
    fn from_word(word: &str) -> Option<Op> {
        OPERATORS
            .iter()
            .find(|(symbol, name, _)| *name == word || *symbol == word)
            .map(|(_, _, op)| *op)
    }

    fn split_symbol(token: &str) -> Option<(Op, &str)> {
        OPERATORS
            .iter()
            .find_map(|(symbol, _, op)| token.strip_prefix(symbol).map(|rest| (*op, rest)))
    }

    fn symbol(self) -> &'static str {
        OPERATORS
            .iter()
            .find(|(_, _, op)| *op == self)
            .map_or("=", |(symbol, _, _)| symbol)
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RangeError {
    #[error("invalid version '{0}' in range")]
    InvalidVersion(String),

    #[error("operator '{0}' has no version bound")]
    MissingBound(String),

    #[error("unknown comparator '{0}'")]
    UnknownOperator(String),
}

impl From<RangeError> for AppError {
    fn from(err: RangeError) -> Self {
        AppError::Validation(format!("Invalid version range: {}", err))
    }
}

/// One `op version` constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comparator {
    pub op: Op,
    pub version: Version,
}

impl Comparator {
    /// Compares by precedence only; build metadata is ignored.
    pub fn matches(&self, version: &Version) -> bool {
        let ordering = version.cmp_precedence(&self.version);
        match self.op {
            Op::Gt => ordering == Ordering::Greater,
            Op::Gte => ordering != Ordering::Less,
            Op::Lt => ordering == Ordering::Less,
            Op::Lte => ordering != Ordering::Greater,
            Op::Eq => ordering == Ordering::Equal,
        }
    }

    fn same_release(&self, version: &Version) -> bool {
        self.version.major == version.major
            && self.version.minor == version.minor
            && self.version.patch == version.patch
    }
}

/// A parsed range expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionRange {
    /// Highest known version, pre-releases included.
    Latest,
    /// Every comparator must hold.
    All(Vec<Comparator>),
}

fn parse_bound(token: &str) -> Result<Version, RangeError> {
    let trimmed = token.strip_prefix('v').unwrap_or(token);
    Version::parse(trimmed).map_err(|_| RangeError::InvalidVersion(token.to_string()))
}

impl VersionRange {
    /// An exact-version range.
    pub fn exact(version: Version) -> Self {
        VersionRange::All(vec![Comparator {
            op: Op::Eq,
            version,
        }])
    }

    /// Build a range from URL path segments: either a single expression
    /// (`1.2.3`, `latest`, `>=1.0.0`) or alternating operator words and
    /// versions (`gte/1.0.0/lt/2.0.0`).
    pub fn from_path_segments(segments: &[&str]) -> Result<Self, RangeError> {
        match segments {
            [] => Ok(VersionRange::Latest),
            [single] => single.parse(),
            _ => {
                let mut comparators = Vec::with_capacity(segments.len() / 2);
                for pair in segments.chunks(2) {
                    let word = pair[0];
                    let op = Op::from_word(word)
                        .ok_or_else(|| RangeError::UnknownOperator(word.to_string()))?;
                    let bound = pair
                        .get(1)
                        .ok_or_else(|| RangeError::MissingBound(word.to_string()))?;
                    comparators.push(Comparator {
                        op,
                        version: parse_bound(bound)?,
                    });
                }
                Ok(VersionRange::All(comparators))
            }
        }
    }

    /// Whether `version` satisfies the range.
    ///
    /// A pre-release only satisfies a comparator range when one of the
    /// comparators names a pre-release of the same `major.minor.patch`.
    pub fn matches(&self, version: &Version) -> bool {
        match self {
            VersionRange::Latest => true,
            VersionRange::All(comparators) => {
                let prerelease_ok = version.pre.is_empty()
                    || comparators
                        .iter()
                        .any(|c| !c.version.pre.is_empty() && c.same_release(version));
                prerelease_ok && comparators.iter().all(|c| c.matches(version))
            }
        }
    }
}

impl FromStr for VersionRange {
    type Err = RangeError;

    fn from_str(expr: &str) -> Result<Self, Self::Err> {
        let tokens: Vec<&str> = expr
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|token| !token.is_empty())
            .collect();

        if tokens.is_empty() || (tokens.len() == 1 && LATEST_ALIASES.contains(&tokens[0])) {
            return Ok(VersionRange::Latest);
        }

        let mut comparators = Vec::with_capacity(tokens.len());
        let mut iter = tokens.into_iter();
        while let Some(token) = iter.next() {
            let (op, rest) = Op::split_symbol(token).unwrap_or((Op::Eq, token));
            // "> 1.0.0" puts the bound in the next token
            let bound = if rest.is_empty() {
                iter.next()
                    .ok_or_else(|| RangeError::MissingBound(token.to_string()))?
            } else {
                rest
            };
            comparators.push(Comparator {
                op,
                version: parse_bound(bound)?,
            });
        }

        Ok(VersionRange::All(comparators))
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionRange::Latest => f.write_str("latest"),
            VersionRange::All(comparators) => {
                for (i, c) in comparators.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{}{}", c.op.symbol(), c.version)?;
                }
                Ok(())
            }
        }
    }
}

/// The highest version in `versions` satisfying `range`. Strings that are not
/// valid semver are ignored.
pub fn resolve<'a, I>(versions: I, range: &VersionRange) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    versions
        .into_iter()
        .filter_map(|raw| Version::parse(raw).ok().map(|parsed| (parsed, raw)))
        .filter(|(parsed, _)| range.matches(parsed))
        .max_by(|(a, _), (b, _)| a.cmp_precedence(b).then_with(|| a.cmp(b)))
        .map(|(_, raw)| raw.to_string())
}

/// The highest version by semver precedence.
pub fn max_version<'a, I>(versions: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    resolve(versions, &VersionRange::Latest)
}

/// Sort version strings ascending by semver precedence. Unparsable strings
/// sort first, lexically.
pub fn sort_versions(versions: &mut [String]) {
    versions.sort_by(|a, b| match (Version::parse(a), Version::parse(b)) {
        (Ok(a), Ok(b)) => a.cmp_precedence(&b).then_with(|| a.cmp(&b)),
        (Ok(_), Err(_)) => Ordering::Greater,
        (Err(_), Ok(_)) => Ordering::Less,
        (Err(_), Err(_)) => a.cmp(b),
    });
}
