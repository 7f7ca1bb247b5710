//! Path pattern grammar.
//!
//! A pattern is split on `/`, empty segments ignored. Each segment is one of:
//!
//! - a literal, compared case-sensitively;
//! - `#`, matching exactly one non-empty segment;
//! - a glob with one embedded `#` such as `segment_#.ts`, matching a segment
//!   with that prefix and suffix and a non-empty middle;
//! - `*` as the final segment, matching zero or more remaining segments.

use crate::captures::Captures;
use crate::error::RouteError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Segment {
    Literal(String),
    Any,
    Glob { prefix: String, suffix: String },
    Rest,
}

impl Segment {
    fn parse(raw: &str, pattern: &str) -> Result<Self, RouteError> {
        if raw == "#" {
            return Ok(Self::Any);
        }
        if raw == "*" {
            return Ok(Self::Rest);
        }
        if raw.contains('*') {
            return Err(RouteError::invalid_pattern(
                pattern,
                "'*' must be a whole segment",
            ));
        }
        match raw.matches('#').count() {
            0 => Ok(Self::Literal(raw.to_string())),
            1 => {
                let (prefix, suffix) = raw.split_once('#').unwrap_or((raw, ""));
                Ok(Self::Glob {
                    prefix: prefix.to_string(),
                    suffix: suffix.to_string(),
                })
            }
            _ => Err(RouteError::invalid_pattern(
                pattern,
                "a segment may contain at most one '#'",
            )),
        }
    }

    /// Matches one path segment, returning the captured text for wildcards.
    fn matches<'p>(&self, segment: &'p str) -> Option<Option<&'p str>> {
        match self {
            Self::Literal(lit) => (lit == segment).then_some(None),
            Self::Any => Some(Some(segment)),
            Self::Glob { prefix, suffix } => {
                if segment.len() <= prefix.len() + suffix.len() {
                    return None;
                }
                let middle = segment.strip_prefix(prefix.as_str())?.strip_suffix(suffix.as_str())?;
                Some(Some(middle))
            }
            Self::Rest => None,
        }
    }

    /// Returns true if every segment `other` matches is also matched by `self`.
    fn covers(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Any, Self::Literal(_) | Self::Any | Self::Glob { .. }) => true,
            (Self::Literal(a), Self::Literal(b)) => a == b,
            (Self::Glob { prefix, suffix }, Self::Literal(lit)) => {
                lit.len() > prefix.len() + suffix.len()
                    && lit.starts_with(prefix.as_str())
                    && lit.ends_with(suffix.as_str())
            }
            (
                Self::Glob { prefix, suffix },
                Self::Glob {
                    prefix: other_prefix,
                    suffix: other_suffix,
                },
            ) => other_prefix.starts_with(prefix.as_str()) && other_suffix.ends_with(suffix.as_str()),
            _ => false,
        }
    }
}

/// A parsed route pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    raw: String,
    segments: Vec<Segment>,
}

impl Pattern {
    /// Parses a pattern.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::InvalidPattern`] for an empty pattern, a `*`
    /// that is not the last segment, or a segment with more than one `#`.
    pub fn parse(raw: &str) -> Result<Self, RouteError> {
        if raw.trim().is_empty() {
            return Err(RouteError::invalid_pattern(raw, "pattern is empty"));
        }
        let segments = split_path(raw)
            .map(|s| Segment::parse(s, raw))
            .collect::<Result<Vec<_>, _>>()?;

        if let Some(pos) = segments.iter().position(|s| *s == Segment::Rest) {
            if pos + 1 != segments.len() {
                return Err(RouteError::invalid_pattern(
                    raw,
                    "'*' must be the last segment",
                ));
            }
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    /// Returns the pattern as registered.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Returns true if the pattern contains any wildcard.
    pub fn has_wildcards(&self) -> bool {
        self.segments
            .iter()
            .any(|s| !matches!(s, Segment::Literal(_)))
    }

    /// Matches pre-split path segments, appending wildcard text to
    /// `captures`. On a miss `captures` is left as it was.
    pub(crate) fn matches(&self, path: &[&str], captures: &mut Captures) -> bool {
        let mark = captures.len();
        let mut remaining = path;

        for segment in &self.segments {
            if *segment == Segment::Rest {
                captures.push(remaining.join("/"));
                return true;
            }
            let Some((head, tail)) = remaining.split_first() else {
                captures.truncate(mark);
                return false;
            };
            match segment.matches(head) {
                Some(Some(text)) => captures.push(text),
                Some(None) => {}
                None => {
                    captures.truncate(mark);
                    return false;
                }
            }
            remaining = tail;
        }

        if remaining.is_empty() {
            true
        } else {
            captures.truncate(mark);
            false
        }
    }

    /// Returns true if every path matched by `other` is matched by `self`.
    pub fn covers(&self, other: &Self) -> bool {
        let self_rest = self.segments.last() == Some(&Segment::Rest);
        let other_rest = other.segments.last() == Some(&Segment::Rest);
        let self_fixed = &self.segments[..self.segments.len() - usize::from(self_rest)];
        let other_fixed = &other.segments[..other.segments.len() - usize::from(other_rest)];

        if self_rest {
            // Every path `other` matches has at least `other_fixed.len()` segments.
            if other_fixed.len() < self_fixed.len() {
                return false;
            }
            self_fixed
                .iter()
                .zip(other_fixed)
                .all(|(a, b)| a.covers(b))
        } else {
            !other_rest
                && self_fixed.len() == other_fixed.len()
                && self_fixed
                    .iter()
                    .zip(other_fixed)
                    .all(|(a, b)| a.covers(b))
        }
    }
}

impl std::fmt::Display for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Splits a path on `/`, skipping empty segments.
pub(crate) fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}
