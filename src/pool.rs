use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::io;
use std::sync::Arc;

/// One parsed class, as supplied by the class-file library driving this
/// crate. Serialization must produce the canonical binary class-file form;
/// it may be called from worker threads.
pub trait Class: Send + Sync {
    /// The fully-qualified internal name, e.g. `com/example/Foo`.
    fn name(&self) -> &str;

    /// Writes the class out in its canonical binary form.
    fn serialize(&self) -> io::Result<Vec<u8>>;

    /// The dynamic-feature this class belongs to, if any. Classes without a
    /// feature name end up in the base dex files.
    fn feature_name(&self) -> Option<&str> {
        None
    }

    /// The multidex file this class is partitioned into, as a base name
    /// like `classes2.dex`. `None` selects the default dex file.
    fn partition(&self) -> Option<&str> {
        None
    }
}

/// A live mapping from class name to parsed class. The writer chain only
/// ever reads from it.
pub trait ClassPool {
    fn get_class(&self, name: &str) -> Option<Arc<dyn Class>>;

    fn class_names(&self) -> Vec<String>;

    /// All distinct feature names present in the pool.
    fn feature_names(&self) -> BTreeSet<String> {
        self.class_names()
            .iter()
            .filter_map(|name| self.get_class(name))
            .filter_map(|class| class.feature_name().map(str::to_string))
            .collect()
    }
}

/// A map-backed class pool for consumers that already hold their classes in
/// memory.
#[derive(Default)]
pub struct MapClassPool {
    classes: BTreeMap<String, Arc<dyn Class>>,
}

impl MapClassPool {
    pub fn new() -> Self {
        MapClassPool::default()
    }

    pub fn add(&mut self, class: Arc<dyn Class>) {
        self.classes.insert(class.name().to_string(), class);
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

impl ClassPool for MapClassPool {
    fn get_class(&self, name: &str) -> Option<Arc<dyn Class>> {
        self.classes.get(name).cloned()
    }

    fn class_names(&self) -> Vec<String> {
        self.classes.keys().cloned().collect()
    }
}

/// A class whose serialized form is already known. Useful for pools fed
/// from pre-compiled class files and for tests.
pub struct BytesClass {
    name: String,
    data: Vec<u8>,
    feature_name: Option<String>,
    partition: Option<String>,
}

impl BytesClass {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        BytesClass {
            name: name.into(),
            data,
            feature_name: None,
            partition: None,
        }
    }

    pub fn with_feature_name(mut self, feature_name: impl Into<String>) -> Self {
        self.feature_name = Some(feature_name.into());
        self
    }

    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = Some(partition.into());
        self
    }
}

impl Class for BytesClass {
    fn name(&self) -> &str {
        &self.name
    }

    fn serialize(&self) -> io::Result<Vec<u8>> {
        Ok(self.data.clone())
    }

    fn feature_name(&self) -> Option<&str> {
        self.feature_name.as_deref()
    }

    fn partition(&self) -> Option<&str> {
        self.partition.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_names_are_collected_once() {
        let mut pool = MapClassPool::new();
        pool.add(Arc::new(
            BytesClass::new("a/A", vec![1]).with_feature_name("search"),
        ));
        pool.add(Arc::new(
            BytesClass::new("b/B", vec![2]).with_feature_name("search"),
        ));
        pool.add(Arc::new(BytesClass::new("c/C", vec![3])));

        let features = pool.feature_names();
        assert_eq!(features.into_iter().collect::<Vec<_>>(), vec!["search"]);
    }
}
