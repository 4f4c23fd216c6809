//! Destination filters for network bridges.
//!
//! Destinations are dot-separated names (`orders.eu.new`). A filter is one
//! or more comma-separated patterns:
//!
//! - `*` matches exactly one segment
//! - `>` matches one or more trailing segments (last position only)
//! - anything else matches literally

use std::{fmt, str::FromStr};

use thiserror::Error;

/// Filter parse errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    /// No patterns
    #[error("empty destination filter")]
    Empty,
    /// A pattern with an empty segment, e.g. `orders..new`
    #[error("empty segment in pattern {0:?}")]
    EmptySegment(String),
    /// `>` somewhere other than the last segment
    #[error("'>' must be the last segment in pattern {0:?}")]
    MisplacedWildcard(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    One,
    Rest,
}

/// Compiled destination filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationFilter {
    source: String,
    patterns: Vec<Vec<Segment>>,
}

impl DestinationFilter {
    /// Compile a filter expression.
    ///
    /// # Errors
    ///
    /// Returns a [`FilterError`] for empty expressions, empty segments or a
    /// misplaced `>`.
    pub fn parse(expression: &str) -> Result<Self, FilterError> {
        let mut patterns = Vec::new();

        for pattern in expression.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let parts: Vec<&str> = pattern.split('.').collect();
            let mut segments = Vec::with_capacity(parts.len());
            for (index, part) in parts.iter().enumerate() {
                let segment = match *part {
                    "" => return Err(FilterError::EmptySegment(pattern.to_string())),
                    "*" => Segment::One,
                    ">" if index + 1 == parts.len() => Segment::Rest,
                    ">" => return Err(FilterError::MisplacedWildcard(pattern.to_string())),
                    literal => Segment::Literal(literal.to_string()),
                };
                segments.push(segment);
            }
            patterns.push(segments);
        }

        if patterns.is_empty() {
            return Err(FilterError::Empty);
        }

        Ok(Self { source: expression.trim().to_string(), patterns })
    }

    /// Filter expression as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// True if any pattern matches `destination`.
    #[must_use]
    pub fn matches(&self, destination: &str) -> bool {
        let names: Vec<&str> = destination.split('.').collect();
        self.patterns.iter().any(|pattern| pattern_matches(pattern, &names))
    }
}

fn pattern_matches(pattern: &[Segment], names: &[&str]) -> bool {
    for (index, segment) in pattern.iter().enumerate() {
        match segment {
            Segment::Rest => return names.len() > index,
            Segment::One => {
                if names.get(index).is_none_or(|name| name.is_empty()) {
                    return false;
                }
            },
            Segment::Literal(literal) => {
                if names.get(index) != Some(&literal.as_str()) {
                    return false;
                }
            },
        }
    }
    pattern.len() == names.len()
}

impl fmt::Display for DestinationFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for DestinationFilter {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
