use std::fmt;
use std::rc::Rc;

/// A named unit of content flowing through a writer chain: a path within an
/// archive, with a back-reference to the entry of the container it came
/// from. Entries are never mutated after creation; renaming produces a new
/// logical name sharing the same parent chain.
#[derive(Clone)]
pub struct DataEntry {
    name: String,
    original_name: String,
    parent: Option<Rc<DataEntry>>,
    directory: bool,
}

impl DataEntry {
    /// A top-level file entry with no containing archive.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        DataEntry {
            original_name: name.clone(),
            name,
            parent: None,
            directory: false,
        }
    }

    /// A file entry read from inside the given container entry.
    pub fn nested(name: impl Into<String>, parent: Rc<DataEntry>) -> Self {
        let name = name.into();
        DataEntry {
            original_name: name.clone(),
            name,
            parent: Some(parent),
            directory: false,
        }
    }

    /// A directory entry.
    pub fn directory(name: impl Into<String>) -> Self {
        let mut entry = DataEntry::new(name);
        entry.directory = true;
        entry
    }

    /// The same underlying content under a new logical name. The original
    /// name is preserved for diagnostics and manifest lookups.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        DataEntry {
            name: name.into(),
            original_name: self.original_name.clone(),
            parent: self.parent.clone(),
            directory: self.directory,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn original_name(&self) -> &str {
        &self.original_name
    }

    pub fn parent(&self) -> Option<&Rc<DataEntry>> {
        self.parent.as_ref()
    }

    pub fn is_directory(&self) -> bool {
        self.directory
    }

    /// The `.class`-stripped name, if this is a class file entry.
    pub fn class_name(&self) -> Option<&str> {
        self.name.strip_suffix(crate::CLASS_FILE_EXTENSION)
    }

    /// Lifts the entry one nesting level up: the result keeps this entry's
    /// name and content but is parented to the grandparent container. Used
    /// when an inner archive is flattened into its surrounding output.
    pub fn reparented(&self) -> Option<DataEntry> {
        let parent = self.parent.as_ref()?;
        Some(DataEntry {
            name: self.name.clone(),
            original_name: self.original_name.clone(),
            parent: parent.parent.clone(),
            directory: self.directory,
        })
    }

    /// Walks the parent chain and renders `outer.apk!inner.jar!Name.class`.
    pub fn full_name(&self) -> String {
        match &self.parent {
            Some(parent) => format!("{}!{}", parent.full_name(), self.name),
            None => self.name.clone(),
        }
    }
}

impl fmt::Debug for DataEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataEntry({})", self.full_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renaming_keeps_parent_and_original_name() {
        let apk = Rc::new(DataEntry::new("app.apk"));
        let entry = DataEntry::nested("com/example/Foo.class", apk.clone());
        let renamed = entry.renamed("classes.dex");

        assert_eq!(renamed.name(), "classes.dex");
        assert_eq!(renamed.original_name(), "com/example/Foo.class");
        assert!(Rc::ptr_eq(renamed.parent().unwrap(), &apk));
    }

    #[test]
    fn class_name_strips_extension() {
        let entry = DataEntry::new("com/example/Foo.class");
        assert_eq!(entry.class_name(), Some("com/example/Foo"));
        assert_eq!(DataEntry::new("res.txt").class_name(), None);
    }

    #[test]
    fn full_name_renders_nesting() {
        let aab = Rc::new(DataEntry::new("a.aab"));
        let apk = Rc::new(DataEntry::nested("b.apk", aab));
        let entry = DataEntry::nested("D.class", apk);
        assert_eq!(entry.full_name(), "a.aab!b.apk!D.class");
    }
}
