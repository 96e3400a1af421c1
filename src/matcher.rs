use std::collections::BTreeSet;

use globset::{GlobBuilder, GlobMatcher};

use crate::error::{Error, Result};

/// A predicate over entry names.
///
/// Glob lists follow first-match-wins semantics: patterns are tried in
/// order, a leading `!` negates a pattern, and the first pattern that
/// matches decides the outcome. A name matching no pattern is rejected,
/// unless the final pattern was negated (so `"!**/*.aidl"` alone means
/// "everything except aidl files").
#[derive(Debug, Clone)]
pub enum NameMatcher {
    /// Case-insensitive suffix match, e.g. `.class`.
    Extension(String),
    /// Ordered glob list with negation.
    Globs(Vec<GlobPattern>),
    /// Exact-name set.
    Names(BTreeSet<String>),
}

#[derive(Debug, Clone)]
pub struct GlobPattern {
    negated: bool,
    matcher: GlobMatcher,
}

impl NameMatcher {
    pub fn extension(extension: impl Into<String>) -> Self {
        NameMatcher::Extension(extension.into().to_lowercase())
    }

    /// Compiles a glob filter list. `*` stays within one path segment and
    /// `**` crosses segments, so `**/*.class` matches class files at any
    /// depth.
    pub fn globs<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let mut compiled = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let pattern = pattern.as_ref();
            let (negated, raw) = match pattern.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, pattern),
            };
            let matcher = GlobBuilder::new(raw)
                .literal_separator(true)
                .build()
                .map_err(|source| Error::InvalidFilter {
                    pattern: pattern.to_string(),
                    source,
                })?
                .compile_matcher();
            compiled.push(GlobPattern { negated, matcher });
        }
        Ok(NameMatcher::Globs(compiled))
    }

    /// A single glob pattern.
    pub fn glob(pattern: &str) -> Result<Self> {
        NameMatcher::globs(&[pattern])
    }

    pub fn names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        NameMatcher::Names(names.into_iter().map(Into::into).collect())
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            NameMatcher::Extension(extension) => {
                let name = name.as_bytes();
                let extension = extension.as_bytes();
                name.len() >= extension.len()
                    && name[name.len() - extension.len()..].eq_ignore_ascii_case(extension)
            }
            NameMatcher::Globs(patterns) => {
                for pattern in patterns {
                    if pattern.matcher.is_match(name) {
                        return !pattern.negated;
                    }
                }
                patterns.last().map(|p| p.negated).unwrap_or(false)
            }
            NameMatcher::Names(names) => names.contains(name),
        }
    }
}
