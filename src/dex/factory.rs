//! Assembles the chain of dex writers for one output: feature dex files,
//! extra multidex files, and the base dex file, in that routing order.

use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::thread;

use tracing::debug;

use crate::class_path::ClassPath;
use crate::dex::converter::{library_context, DexConverter};
use crate::dex::writer::{ClassPredicate, DexEntryWriter};
use crate::dex::{AAB_BASE, AAB_DEX_INFIX, CLASSES_DEX, CLASSES_PREFIX, DEX_EXTENSION};
use crate::error::{Error, Result};
use crate::pool::ClassPool;
use crate::writer::{shared, NonClosingWriter, SharedWriter};

/// Builds dex writer chains over a shared converter, library context and
/// serialization thread pool.
pub struct DexWriterFactory {
    class_pool: Rc<dyn ClassPool>,
    converter: Arc<dyn DexConverter>,
    libraries: Vec<PathBuf>,
    /// Lay dex files out in app bundle module structure (`base/dex/`).
    app_bundle: bool,
    /// Number of additional `classesN.dex` files beyond the first.
    extra_dex_files: usize,
}

impl DexWriterFactory {
    pub fn new(
        class_pool: Rc<dyn ClassPool>,
        converter: Arc<dyn DexConverter>,
        libraries: &ClassPath,
        app_bundle: bool,
        extra_dex_files: usize,
    ) -> Self {
        DexWriterFactory {
            class_pool,
            converter,
            libraries: library_context(libraries),
            app_bundle,
            extra_dex_files,
        }
    }

    /// The serialization pool defaults to leaving two cores for the rest
    /// of the process.
    pub fn build_thread_pool(thread_count: Option<usize>) -> Result<Arc<rayon::ThreadPool>> {
        let threads = thread_count.unwrap_or_else(|| {
            thread::available_parallelism()
                .map(|n| n.get().saturating_sub(2))
                .unwrap_or(1)
                .max(1)
        });
        debug!(threads, "building dex serialization pool");
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .map(Arc::new)
            .map_err(|source| Error::ThreadPool { source })
    }

    /// Wraps `writer` so class file entries are collected into dex files
    /// and everything else passes through. Feature classes are routed to
    /// per-feature dex files, partitioned classes to their extra dex file,
    /// and the remainder to the base dex file.
    pub fn wrap_in_dex_writer(
        &self,
        writer: SharedWriter,
        thread_pool: Arc<rayon::ThreadPool>,
    ) -> SharedWriter {
        let base_prefix = if self.app_bundle {
            format!("{}{}", AAB_BASE, AAB_DEX_INFIX)
        } else {
            String::new()
        };

        // Base dex file: always present, takes every class nobody else
        // claimed, and owns closing the delegate.
        let mut chain = shared(DexEntryWriter::new(
            self.class_pool.clone(),
            None,
            format!("{}{}", base_prefix, CLASSES_DEX),
            true,
            self.converter.clone(),
            self.libraries.clone(),
            thread_pool.clone(),
            writer.clone(),
            writer.clone(),
        ));

        for index in 0..self.extra_dex_files {
            let dex_file_name = format!("{}{}{}", CLASSES_PREFIX, index + 2, DEX_EXTENSION);
            let partition = dex_file_name.clone();
            let filter: ClassPredicate =
                Rc::new(move |class| class.partition() == Some(partition.as_str()));
            chain = shared(DexEntryWriter::new(
                self.class_pool.clone(),
                Some(filter),
                format!("{}{}", base_prefix, dex_file_name),
                false,
                self.converter.clone(),
                self.libraries.clone(),
                thread_pool.clone(),
                shared(NonClosingWriter::new(writer.clone())),
                chain,
            ));
        }

        for feature in self.class_pool.feature_names() {
            let wanted = feature.clone();
            let filter: ClassPredicate =
                Rc::new(move |class| class.feature_name() == Some(wanted.as_str()));
            chain = shared(DexEntryWriter::new(
                self.class_pool.clone(),
                Some(filter),
                format!("{}/{}{}", feature, AAB_DEX_INFIX, CLASSES_DEX),
                true,
                self.converter.clone(),
                self.libraries.clone(),
                thread_pool.clone(),
                shared(NonClosingWriter::new(writer.clone())),
                chain,
            ));
        }

        chain
    }
}
