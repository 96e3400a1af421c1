//! Conversion of class files into dex containers, batched per output
//! destination.

mod converter;
mod factory;
mod writer;

pub use converter::{library_context, D8ProcessConverter, DexBatch, DexConverter};
pub use factory::DexWriterFactory;
pub use writer::DexEntryWriter;

/// Name of the first (or only) dex file in a container.
pub const CLASSES_DEX: &str = "classes.dex";

/// Base name shared by all dex files in a container: `classes.dex`,
/// `classes2.dex`, ...
pub const CLASSES_PREFIX: &str = "classes";

pub const DEX_EXTENSION: &str = ".dex";

/// App bundle module layout: the base module, and the subdirectories for
/// dex files and root content within a module.
pub const AAB_BASE: &str = "base/";
pub const AAB_DEX_INFIX: &str = "dex/";
pub const AAB_ROOT_INFIX: &str = "root/";
