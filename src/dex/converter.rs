//! The conversion engine boundary and the batch that feeds it.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::class_path::{ArchiveKind, ClassPath};
use crate::error::ConversionError;
use crate::pool::Class;

/// Converts one batch of serialized class files into a single dex
/// container. Implementations may shell out to an external engine; they
/// are invoked once per finished batch.
pub trait DexConverter: Send + Sync {
    fn convert(
        &self,
        class_files: &[Vec<u8>],
        libraries: &[PathBuf],
    ) -> std::result::Result<Vec<u8>, ConversionError>;
}

/// The library archives an engine can use for desugaring context, reduced
/// to those that exist on disk and have a kind the engine accepts.
pub fn library_context(libraries: &ClassPath) -> Vec<PathBuf> {
    const SUPPORTED: [ArchiveKind; 5] = [
        ArchiveKind::Dex,
        ArchiveKind::Apk,
        ArchiveKind::Jar,
        ArchiveKind::Aar,
        ArchiveKind::Zip,
    ];
    libraries
        .iter()
        .filter(|entry| !entry.is_output())
        .filter(|entry| {
            entry
                .kind()
                .map_or(false, |kind| SUPPORTED.contains(&kind))
        })
        .filter(|entry| entry.path().exists())
        .map(|entry| entry.path().to_path_buf())
        .collect()
}

/// The classes accumulated for one dex destination. Classes are collected
/// cheaply while the traversal runs; serialization and conversion happen
/// once, when the batch is materialized.
pub struct DexBatch {
    pending: Mutex<Vec<Arc<dyn Class>>>,
    converter: Arc<dyn DexConverter>,
    libraries: Vec<PathBuf>,
    thread_pool: Arc<rayon::ThreadPool>,
}

impl DexBatch {
    pub fn new(
        converter: Arc<dyn DexConverter>,
        libraries: Vec<PathBuf>,
        thread_pool: Arc<rayon::ThreadPool>,
    ) -> Self {
        DexBatch {
            pending: Mutex::new(Vec::new()),
            converter,
            libraries,
            thread_pool,
        }
    }

    pub fn add_class(&self, class: Arc<dyn Class>) {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(class);
    }

    pub fn is_empty(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_empty()
    }

    /// Serializes the collected classes in parallel, preserving encounter
    /// order, and runs the converter over the results. A class that fails
    /// to serialize is logged and left out rather than failing the batch.
    pub fn materialize(&self) -> std::result::Result<Vec<u8>, ConversionError> {
        let classes = std::mem::take(
            &mut *self
                .pending
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        debug!(classes = classes.len(), "materializing dex batch");
        let class_files: Vec<Vec<u8>> = self.thread_pool.install(|| {
            classes
                .par_iter()
                .map(|class| match class.serialize() {
                    Ok(bytes) => Some(bytes),
                    Err(error) => {
                        warn!(
                            class = class.name(),
                            %error,
                            "skipping class that failed to serialize"
                        );
                        None
                    }
                })
                .collect::<Vec<_>>()
                .into_iter()
                .flatten()
                .collect()
        });
        self.converter.convert(&class_files, &self.libraries)
    }
}

/// Runs the `d8` compiler as an external process, one invocation per
/// batch. Class files are staged in a temporary directory and the
/// resulting container is read back from the output directory.
pub struct D8ProcessConverter {
    program: PathBuf,
    min_api: Option<u32>,
}

impl D8ProcessConverter {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        D8ProcessConverter {
            program: program.into(),
            min_api: None,
        }
    }

    pub fn with_min_api(mut self, min_api: u32) -> Self {
        self.min_api = Some(min_api);
        self
    }

    fn stage(directory: &Path, class_files: &[Vec<u8>]) -> std::io::Result<Vec<PathBuf>> {
        let mut paths = Vec::with_capacity(class_files.len());
        for (index, bytes) in class_files.iter().enumerate() {
            let path = directory.join(format!("{}.class", index));
            fs::write(&path, bytes)?;
            paths.push(path);
        }
        Ok(paths)
    }
}

impl DexConverter for D8ProcessConverter {
    fn convert(
        &self,
        class_files: &[Vec<u8>],
        libraries: &[PathBuf],
    ) -> std::result::Result<Vec<u8>, ConversionError> {
        let work_dir = tempfile::tempdir()?;
        let input_dir = work_dir.path().join("classes");
        let output_dir = work_dir.path().join("out");
        fs::create_dir(&input_dir)?;
        fs::create_dir(&output_dir)?;
        let staged = Self::stage(&input_dir, class_files)?;

        let mut command = Command::new(&self.program);
        command.arg("--output").arg(&output_dir);
        if let Some(min_api) = self.min_api {
            command.arg("--min-api").arg(min_api.to_string());
        }
        for library in libraries {
            command.arg("--lib").arg(library);
        }
        command.args(&staged);

        debug!(program = %self.program.display(), classes = staged.len(), "invoking dex engine");
        let output = command.output()?;
        if !output.status.success() {
            return Err(ConversionError::EngineFailed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        let dex_path = output_dir.join(super::CLASSES_DEX);
        if !dex_path.exists() {
            return Err(ConversionError::MissingOutput);
        }
        Ok(fs::read(&dex_path)?)
    }
}

/// Tracks which classes have already been handed to a converter, so each
/// class is converted at most once per writer.
#[derive(Default)]
pub(crate) struct SeenClasses {
    names: HashSet<String>,
}

impl SeenClasses {
    pub fn first_sighting(&mut self, name: &str) -> bool {
        self.names.insert(name.to_string())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{test_thread_pool, StubConverter, STUB_HEADER};
    use super::*;
    use crate::class_path::ClassPathEntry;
    use crate::pool::BytesClass;
    use std::io;

    #[test]
    fn batch_preserves_encounter_order() {
        let batch = DexBatch::new(Arc::new(StubConverter), Vec::new(), test_thread_pool());
        batch.add_class(Arc::new(BytesClass::new("a/A", vec![1, 1])));
        batch.add_class(Arc::new(BytesClass::new("b/B", vec![2, 2])));
        batch.add_class(Arc::new(BytesClass::new("c/C", vec![3, 3])));

        let dex = batch.materialize().unwrap();
        let mut expected = STUB_HEADER.to_vec();
        expected.extend_from_slice(&[1, 1, 2, 2, 3, 3]);
        assert_eq!(dex, expected);
    }

    #[test]
    fn batch_skips_classes_that_fail_to_serialize() {
        struct Broken;
        impl Class for Broken {
            fn name(&self) -> &str {
                "broken/B"
            }
            fn serialize(&self) -> io::Result<Vec<u8>> {
                Err(io::Error::new(io::ErrorKind::InvalidData, "bad constant"))
            }
        }

        let batch = DexBatch::new(Arc::new(StubConverter), Vec::new(), test_thread_pool());
        batch.add_class(Arc::new(BytesClass::new("a/A", vec![1])));
        batch.add_class(Arc::new(Broken));
        batch.add_class(Arc::new(BytesClass::new("c/C", vec![3])));

        let dex = batch.materialize().unwrap();
        let mut expected = STUB_HEADER.to_vec();
        expected.extend_from_slice(&[1, 3]);
        assert_eq!(dex, expected);
    }

    #[test]
    fn empty_batch_still_produces_a_container() {
        let batch = DexBatch::new(Arc::new(StubConverter), Vec::new(), test_thread_pool());
        assert!(batch.is_empty());
        assert_eq!(batch.materialize().unwrap(), STUB_HEADER.to_vec());
    }

    #[test]
    fn library_context_keeps_supported_existing_archives() {
        let dir = tempfile::tempdir().unwrap();
        let jar = dir.path().join("android.jar");
        let war = dir.path().join("app.war");
        std::fs::write(&jar, b"pk").unwrap();
        std::fs::write(&war, b"pk").unwrap();

        let libraries: ClassPath = [
            ClassPathEntry::new(&jar, false),
            ClassPathEntry::new(&war, false),
            ClassPathEntry::new(dir.path().join("missing.jar"), false),
        ]
        .into_iter()
        .collect();

        assert_eq!(library_context(&libraries), vec![jar]);
    }
}
