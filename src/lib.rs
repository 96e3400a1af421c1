//! Archive-aware data entry writers that package processed JVM classes
//! into dex containers inside nested apk, aab, jar, aar, war, ear, jmod
//! and zip outputs.
//!
//! A writer chain is built by [`DataEntryWriterFactory`] from an output
//! [`ClassPath`]. Entries pushed through the chain are routed by name and
//! by containing archive; class files are collected into per-destination
//! dex batches and converted through a [`DexConverter`] when the
//! destination changes or the chain closes.

pub mod class_path;
pub mod dex;
pub mod entry;
pub mod error;
pub mod matcher;
pub mod pool;
pub mod writer;

pub use class_path::{ArchiveKind, ClassPath, ClassPathEntry};
pub use dex::{D8ProcessConverter, DexConverter, DexWriterFactory};
pub use entry::DataEntry;
pub use error::{ConversionError, Error, Result};
pub use matcher::NameMatcher;
pub use pool::{BytesClass, Class, ClassPool, MapClassPool};
pub use writer::{
    DataEntryWriter, DataEntryWriterFactory, OutputOptions, SharedWriter, WriteOutcome,
};

/// Extension of class file entries.
pub const CLASS_FILE_EXTENSION: &str = ".class";

/// Alignment of page-aligned archive entries, in bytes.
pub const PAGE_ALIGNMENT: u16 = 4096;
