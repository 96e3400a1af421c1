use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Magic bytes preceding the zip payload of a jmod file.
pub const JMOD_HEADER: [u8; 4] = *b"JM\x01\x00";

/// The archive formats a class path entry can name, with their fixed
/// nesting order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ArchiveKind {
    Dex,
    Apk,
    Aab,
    Jar,
    Aar,
    War,
    Ear,
    Jmod,
    Zip,
}

impl ArchiveKind {
    /// Nesting order from outermost to innermost. Apk and aab are mutually
    /// exclusive siblings at the top; an output of a given kind flattens
    /// every kind that nests above it.
    pub const NESTING: [ArchiveKind; 7] = [
        ArchiveKind::Aab,
        ArchiveKind::Jar,
        ArchiveKind::Aar,
        ArchiveKind::War,
        ArchiveKind::Ear,
        ArchiveKind::Jmod,
        ArchiveKind::Zip,
    ];

    pub fn extension(self) -> &'static str {
        match self {
            ArchiveKind::Dex => ".dex",
            ArchiveKind::Apk => ".apk",
            ArchiveKind::Aab => ".aab",
            ArchiveKind::Jar => ".jar",
            ArchiveKind::Aar => ".aar",
            ArchiveKind::War => ".war",
            ArchiveKind::Ear => ".ear",
            ArchiveKind::Jmod => ".jmod",
            ArchiveKind::Zip => ".zip",
        }
    }

    /// Detects the archive kind from a file name, if any.
    pub fn from_path(path: &Path) -> Option<ArchiveKind> {
        let name = path.file_name()?.to_str()?.to_lowercase();
        [
            ArchiveKind::Dex,
            ArchiveKind::Apk,
            ArchiveKind::Aab,
            ArchiveKind::Jar,
            ArchiveKind::Aar,
            ArchiveKind::War,
            ArchiveKind::Ear,
            ArchiveKind::Jmod,
            ArchiveKind::Zip,
        ]
        .into_iter()
        .find(|kind| name.ends_with(kind.extension()))
    }
}

impl fmt::Display for ArchiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ArchiveKind::Dex => "dex",
            ArchiveKind::Apk => "apk",
            ArchiveKind::Aab => "aab",
            ArchiveKind::Jar => "jar",
            ArchiveKind::Aar => "aar",
            ArchiveKind::War => "war",
            ArchiveKind::Ear => "ear",
            ArchiveKind::Jmod => "jmod",
            ArchiveKind::Zip => "zip",
        })
    }
}

/// One physical location in an ordered class path: a file or directory,
/// tagged as input or output, with optional per-kind name filters.
/// Immutable once constructed.
#[derive(Debug, Clone)]
pub struct ClassPathEntry {
    path: PathBuf,
    output: bool,
    kind: Option<ArchiveKind>,
    filter: Option<Vec<String>>,
    kind_filters: BTreeMap<ArchiveKind, Vec<String>>,
}

impl ClassPathEntry {
    pub fn new(path: impl Into<PathBuf>, output: bool) -> Self {
        let path = path.into();
        let kind = ArchiveKind::from_path(&path);
        ClassPathEntry {
            path,
            output,
            kind,
            filter: None,
            kind_filters: BTreeMap::new(),
        }
    }

    /// Overrides the extension-derived archive kind (`None` forces a plain
    /// directory).
    pub fn with_kind(mut self, kind: Option<ArchiveKind>) -> Self {
        self.kind = kind;
        self
    }

    /// The base name filter, applied to entries written to this location.
    pub fn with_filter<S: Into<String>>(mut self, patterns: Vec<S>) -> Self {
        self.filter = Some(patterns.into_iter().map(Into::into).collect());
        self
    }

    /// A filter on the names of containing archives of the given kind.
    pub fn with_kind_filter<S: Into<String>>(mut self, kind: ArchiveKind, patterns: Vec<S>) -> Self {
        self.kind_filters
            .insert(kind, patterns.into_iter().map(Into::into).collect());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_output(&self) -> bool {
        self.output
    }

    pub fn kind(&self) -> Option<ArchiveKind> {
        self.kind
    }

    pub fn is_kind(&self, kind: ArchiveKind) -> bool {
        self.kind == Some(kind)
    }

    /// Whether this entry names an archive file rather than a directory.
    pub fn is_archive(&self) -> bool {
        self.kind.is_some()
    }

    pub fn filter(&self) -> Option<&[String]> {
        self.filter.as_deref()
    }

    pub fn kind_filter(&self, kind: ArchiveKind) -> Option<&[String]> {
        self.kind_filters.get(&kind).map(Vec::as_slice)
    }

    pub fn has_filters(&self) -> bool {
        self.filter.is_some() || !self.kind_filters.is_empty()
    }
}

/// An ordered list of class path entries.
#[derive(Debug, Clone, Default)]
pub struct ClassPath {
    entries: Vec<ClassPathEntry>,
}

impl ClassPath {
    pub fn new() -> Self {
        ClassPath::default()
    }

    pub fn push(&mut self, entry: ClassPathEntry) {
        self.entries.push(entry);
    }

    pub fn get(&self, index: usize) -> &ClassPathEntry {
        &self.entries[index]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClassPathEntry> {
        self.entries.iter()
    }

    /// Whether any output entry in `range` refers to the same file as
    /// `entry`. Used to decide which occurrence of a duplicated output file
    /// owns the manifest and which one closes the shared writer.
    pub fn output_file_occurs(
        &self,
        entry: &ClassPathEntry,
        range: std::ops::Range<usize>,
    ) -> bool {
        self.entries[range]
            .iter()
            .any(|other| other.is_output() && other.path() == entry.path())
    }
}

impl FromIterator<ClassPathEntry> for ClassPath {
    fn from_iter<I: IntoIterator<Item = ClassPathEntry>>(iter: I) -> Self {
        ClassPath {
            entries: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_detected_from_the_extension() {
        assert_eq!(
            ClassPathEntry::new("out/app.apk", true).kind(),
            Some(ArchiveKind::Apk)
        );
        assert_eq!(
            ClassPathEntry::new("libs/util.JAR", false).kind(),
            Some(ArchiveKind::Jar)
        );
        assert_eq!(ClassPathEntry::new("out/classes", true).kind(), None);
    }

    #[test]
    fn nesting_runs_from_aab_to_zip() {
        let order = ArchiveKind::NESTING;
        assert_eq!(order.first(), Some(&ArchiveKind::Aab));
        assert_eq!(order.last(), Some(&ArchiveKind::Zip));
        let jar = order.iter().position(|k| *k == ArchiveKind::Jar).unwrap();
        let aar = order.iter().position(|k| *k == ArchiveKind::Aar).unwrap();
        assert!(jar < aar, "a jar contains aars, not the other way around");
    }

    #[test]
    fn output_file_occurrence_scans_only_outputs() {
        let classpath: ClassPath = [
            ClassPathEntry::new("in.jar", false),
            ClassPathEntry::new("out.jar", true),
            ClassPathEntry::new("out.jar", true),
        ]
        .into_iter()
        .collect();

        let entry = classpath.get(1);
        assert!(classpath.output_file_occurs(entry, 2..3));
        assert!(!classpath.output_file_occurs(entry, 0..1));
    }
}
