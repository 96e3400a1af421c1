//! Builds complete writer chains from output class paths. The chain for
//! one output entry wraps, from the outside in: a cascade to earlier
//! entries, the class/dex routing split, an optional integrity manifest,
//! one archive writer per nesting level, and finally the physical file or
//! directory writer.

use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

use tracing::info;

use crate::class_path::{ArchiveKind, ClassPath, ClassPathEntry, JMOD_HEADER};
use crate::dex::DexWriterFactory;
use crate::error::{Error, Result};
use crate::matcher::NameMatcher;
use crate::pool::ClassPool;
use crate::writer::{
    shared, CascadingWriter, ClassDataEntryWriter, DirectoryWriter, FilteredWriter,
    FixedFileWriter, ManifestWriter, NameFilter, NonClosingWriter, ParentFilter, ParentWriter,
    PrefixAddingWriter, RenamedWriter, SharedWriter, ZipEntryWriter, ZipEntryWriterOptions,
};

/// Class files inside a war or jmod go under this prefix.
const CLASS_FILE_PREFIX: &str = "classes/";

/// Native libraries stored at page boundaries so the runtime can map them
/// straight out of the installed archive.
const PAGE_ALIGNMENT_FILTER: &str = "lib/*/*.so";

/// Output-shaping settings shared by every writer chain the factory
/// builds.
#[derive(Clone)]
pub struct OutputOptions {
    /// Entries that must be stored rather than deflated.
    pub uncompressed_filter: Option<NameMatcher>,
    /// Alignment of stored entry data, in bytes.
    pub uncompressed_alignment: u16,
    /// Page-align native libraries in apks.
    pub page_align_native_libs: bool,
    /// DOS date/time stamped on all archive entries.
    pub modification_time: u32,
    /// Collapse input jars of an aar into one `classes.jar`.
    pub obfuscate: bool,
    /// File names to digest into a control manifest, when set.
    pub checked_file_names: Option<Vec<String>>,
}

impl Default for OutputOptions {
    fn default() -> Self {
        OutputOptions {
            uncompressed_filter: None,
            uncompressed_alignment: 4,
            page_align_native_libs: false,
            modification_time: super::dos_date_time_now(),
            obfuscate: false,
            checked_file_names: None,
        }
    }
}

struct ArchiveLevel {
    kind: ArchiveKind,
    flatten: bool,
    is_output_kind: bool,
    header: Option<Vec<u8>>,
    page_align: bool,
    zip64: bool,
    prefixes: &'static [(&'static str, &'static str)],
}

/// Creates writer chains for output class paths. The factory caches the
/// writer of each outermost output archive, so an output file named by
/// several class path entries is built exactly once.
pub struct DataEntryWriterFactory {
    class_pool: Rc<dyn ClassPool>,
    dex: Option<(DexWriterFactory, Arc<rayon::ThreadPool>)>,
    options: OutputOptions,
    jar_writer_cache: HashMap<PathBuf, SharedWriter>,
}

impl DataEntryWriterFactory {
    pub fn new(class_pool: Rc<dyn ClassPool>, options: OutputOptions) -> Self {
        DataEntryWriterFactory {
            class_pool,
            dex: None,
            options,
            jar_writer_cache: HashMap::new(),
        }
    }

    /// Targets dalvik: class files are converted to dex files through the
    /// given factory instead of being written as class files.
    pub fn with_dex_conversion(
        mut self,
        factory: DexWriterFactory,
        thread_pool: Arc<rayon::ThreadPool>,
    ) -> Self {
        self.dex = Some((factory, thread_pool));
        self
    }

    /// Creates a writer for the output entries in `from..to` of the class
    /// path. Entries later in the range serve as fallbacks for entries
    /// whose filters reject an entry. `extra_writer` receives injected
    /// content such as the control manifest.
    pub fn create_data_entry_writer(
        &mut self,
        class_path: &ClassPath,
        from: usize,
        to: usize,
        extra_writer: Option<SharedWriter>,
    ) -> Result<SharedWriter> {
        let mut writer: Option<SharedWriter> = None;
        for index in (from..to).rev() {
            let entry = class_path.get(index);
            if !entry.is_output() {
                continue;
            }
            // The same output file may occur several times in the class
            // path. Only its first occurrence carries the control
            // manifest, and only its last occurrence closes the cached
            // archive writer.
            let add_manifest = !class_path.output_file_occurs(entry, 0..index);
            let close_cached = !class_path.output_file_occurs(entry, index + 1..class_path.len());
            writer = Some(self.create_class_path_entry_writer(
                entry,
                writer.take(),
                extra_writer.clone(),
                add_manifest,
                close_cached,
            )?);
        }
        writer.ok_or(Error::EmptyOutputRange { from, to })
    }

    fn create_class_path_entry_writer(
        &mut self,
        entry: &ClassPathEntry,
        alternative: Option<SharedWriter>,
        extra_writer: Option<SharedWriter>,
        add_manifest: bool,
        close_cached: bool,
    ) -> Result<SharedWriter> {
        info!(
            kind = %entry
                .kind()
                .map(|kind| kind.to_string())
                .unwrap_or_else(|| "directory".to_string()),
            path = %entry.path().display(),
            filtered = entry.has_filters(),
            "preparing output"
        );

        let base: SharedWriter = if entry.is_archive() {
            shared(FixedFileWriter::new(entry.path()))
        } else {
            shared(DirectoryWriter::new(entry.path()))
        };

        let writer = if entry.is_kind(ArchiveKind::Dex) {
            // A dex file cannot hold resources.
            shared(FilteredWriter::new(
                Box::new(NameFilter::new(NameMatcher::extension(
                    ArchiveKind::Dex.extension(),
                ))),
                Some(base),
                None,
            ))
        } else {
            self.create_archive_chain(entry, base, extra_writer, add_manifest, close_cached)?
        };

        Ok(match alternative {
            Some(alternative) => shared(CascadingWriter::new(writer, alternative)),
            None => writer,
        })
    }

    fn create_archive_chain(
        &mut self,
        entry: &ClassPathEntry,
        base: SharedWriter,
        extra_writer: Option<SharedWriter>,
        add_manifest: bool,
        close_cached: bool,
    ) -> Result<SharedWriter> {
        let is_apk = entry.is_kind(ArchiveKind::Apk);
        let is_aab = entry.is_kind(ArchiveKind::Aab);
        let is_jar = entry.is_kind(ArchiveKind::Jar);
        let is_aar = entry.is_kind(ArchiveKind::Aar);
        let is_war = entry.is_kind(ArchiveKind::War);
        let is_ear = entry.is_kind(ArchiveKind::Ear);
        let is_jmod = entry.is_kind(ArchiveKind::Jmod);
        let is_zip = entry.is_kind(ArchiveKind::Zip);

        // Writing into an archive flattens every input archive that would
        // nest above it, e.g. writing a jar unpacks input zips into it.
        let flatten_aabs = is_apk;
        let flatten_jars = flatten_aabs || is_aab;
        let flatten_aars = flatten_jars || is_jar;
        let flatten_wars = flatten_aars || is_aar;
        let flatten_ears = flatten_wars || is_war;
        let flatten_jmods = flatten_ears || is_ear;
        let flatten_zips = flatten_jmods || is_jmod;

        let mut writer = base;
        writer = self.wrap_in_archive_writer(
            entry,
            writer,
            close_cached,
            ArchiveLevel {
                kind: ArchiveKind::Zip,
                flatten: flatten_zips,
                is_output_kind: is_zip,
                header: None,
                page_align: false,
                zip64: false,
                prefixes: &[],
            },
        )?;
        writer = self.wrap_in_archive_writer(
            entry,
            writer,
            close_cached,
            ArchiveLevel {
                kind: ArchiveKind::Jmod,
                flatten: flatten_jmods,
                is_output_kind: is_jmod,
                header: Some(JMOD_HEADER.to_vec()),
                page_align: false,
                zip64: false,
                prefixes: &[("**/*.class", CLASS_FILE_PREFIX)],
            },
        )?;
        writer = self.wrap_in_archive_writer(
            entry,
            writer,
            close_cached,
            ArchiveLevel {
                kind: ArchiveKind::Ear,
                flatten: flatten_ears,
                is_output_kind: is_ear,
                header: None,
                page_align: false,
                zip64: false,
                prefixes: &[],
            },
        )?;
        writer = self.wrap_in_archive_writer(
            entry,
            writer,
            close_cached,
            ArchiveLevel {
                kind: ArchiveKind::War,
                flatten: flatten_wars,
                is_output_kind: is_war,
                header: None,
                page_align: false,
                zip64: false,
                prefixes: &[("**/*.class", CLASS_FILE_PREFIX)],
            },
        )?;
        writer = self.wrap_in_archive_writer(
            entry,
            writer,
            close_cached,
            ArchiveLevel {
                kind: ArchiveKind::Aar,
                flatten: flatten_aars,
                is_output_kind: is_aar,
                header: None,
                page_align: false,
                zip64: false,
                prefixes: &[],
            },
        )?;

        if is_aar {
            writer = self.wrap_in_aar_jar_renamer(writer);
        }

        writer = self.wrap_in_archive_writer(
            entry,
            writer,
            close_cached,
            ArchiveLevel {
                kind: ArchiveKind::Jar,
                flatten: flatten_jars,
                is_output_kind: is_jar,
                header: None,
                page_align: false,
                zip64: false,
                prefixes: &[],
            },
        )?;

        // An output is an apk or an aab, never both; nested occurrences of
        // the other kind cannot arise.
        writer = if is_aab {
            self.wrap_in_archive_writer(
                entry,
                writer,
                close_cached,
                ArchiveLevel {
                    kind: ArchiveKind::Aab,
                    flatten: flatten_aabs,
                    is_output_kind: true,
                    header: None,
                    page_align: false,
                    zip64: true,
                    prefixes: &[],
                },
            )?
        } else {
            self.wrap_in_archive_writer(
                entry,
                writer,
                close_cached,
                ArchiveLevel {
                    kind: ArchiveKind::Apk,
                    flatten: false,
                    is_output_kind: is_apk,
                    header: None,
                    page_align: self.options.page_align_native_libs,
                    zip64: false,
                    prefixes: &[],
                },
            )?
        };

        // Plain class files bypass dex conversion; their close is owned by
        // the surrounding chain.
        let mut class_writer: SharedWriter = shared(ClassDataEntryWriter::new(
            self.class_pool.clone(),
            shared(NonClosingWriter::new(writer.clone())),
        ));

        // Per-entry name filter. Plain class files are filtered on the
        // class branch; dex files and resources after renaming. Classes
        // headed into dex batches are not name-filtered.
        if let Some(patterns) = entry.filter() {
            let matcher = NameMatcher::globs(patterns)?;
            let class_matcher = matcher.clone();
            class_writer = shared(RenamedWriter::new(
                Box::new(move |name| {
                    class_matcher.matches(name).then(|| name.to_string())
                }),
                class_writer,
            ));
            writer = shared(RenamedWriter::new(
                Box::new(move |name| matcher.matches(name).then(|| name.to_string())),
                writer,
            ));
        }

        if add_manifest {
            if let Some(checked) = &self.options.checked_file_names {
                let destination = extra_writer.unwrap_or_else(|| writer.clone());
                let mut manifest_writer = ManifestWriter::new(
                    NameMatcher::names(checked.iter().cloned()),
                    writer,
                    destination,
                );
                if is_aab {
                    manifest_writer = manifest_writer.with_manifest_name(format!(
                        "{}{}{}",
                        crate::dex::AAB_BASE,
                        crate::dex::AAB_ROOT_INFIX,
                        super::manifest::MANIFEST_NAME,
                    ));
                }
                writer = shared(manifest_writer);
            }
        }

        // With dex conversion the dex writers dispatch every entry
        // themselves: class files are collected into batches and anything
        // else falls through to the archive chain, while still pinning the
        // destination so a forced dex file appears even when no class ever
        // does. Without it, class files split off to the class writer here.
        Ok(match &self.dex {
            Some((factory, thread_pool)) => {
                factory.wrap_in_dex_writer(writer, thread_pool.clone())
            }
            None => shared(FilteredWriter::new(
                Box::new(NameFilter::new(NameMatcher::extension(
                    crate::CLASS_FILE_EXTENSION,
                ))),
                Some(class_writer),
                Some(writer),
            )),
        })
    }

    /// Collapses the jars written into an aar: when obfuscating they all
    /// merge into `classes.jar`, otherwise `classes.jar` keeps its name
    /// and other jars move into `libs/`.
    fn wrap_in_aar_jar_renamer(&self, writer: SharedWriter) -> SharedWriter {
        let renamed: SharedWriter = if self.options.obfuscate {
            shared(RenamedWriter::constant("classes.jar", writer.clone()))
        } else {
            shared(RenamedWriter::new(
                Box::new(|name| {
                    let file_name = name.rsplit('/').next().unwrap_or(name);
                    if file_name == "classes.jar" {
                        Some(file_name.to_string())
                    } else {
                        Some(format!("libs/{}", file_name))
                    }
                }),
                writer.clone(),
            ))
        };
        shared(FilteredWriter::new(
            Box::new(NameFilter::new(NameMatcher::extension(
                ArchiveKind::Jar.extension(),
            ))),
            Some(renamed),
            Some(writer),
        ))
    }

    fn wrap_in_archive_writer(
        &mut self,
        entry: &ClassPathEntry,
        inner: SharedWriter,
        close_cached: bool,
        level: ArchiveLevel,
    ) -> Result<SharedWriter> {
        let zip_writer: SharedWriter = if level.flatten {
            // Unpack matching archives into the surrounding output.
            shared(ParentWriter::new(inner.clone()))
        } else {
            let cached = if level.is_output_kind {
                self.jar_writer_cache.get(entry.path()).cloned()
            } else {
                None
            };
            match cached {
                Some(writer) => writer,
                None => {
                    let writer = self.build_zip_writer(entry, inner.clone(), &level)?;
                    if level.is_output_kind {
                        self.jar_writer_cache
                            .insert(entry.path().to_path_buf(), writer.clone());
                    }
                    writer
                }
            }
        };

        // A cached output archive stays open until its last occurrence in
        // the class path closes it.
        let target = if level.is_output_kind && !close_cached {
            shared(NonClosingWriter::new(zip_writer.clone()))
        } else {
            zip_writer.clone()
        };

        // Apply the per-kind container filter, if any, to the parent.
        let accepted = match entry.kind_filter(level.kind) {
            Some(patterns) => shared(FilteredWriter::new(
                Box::new(ParentFilter::new(Box::new(NameFilter::new(
                    NameMatcher::globs(patterns)?,
                )))),
                Some(target.clone()),
                None,
            )),
            None => target.clone(),
        };

        // Entries inside a container of this kind go into the archive;
        // everything else goes into the archive anyway if this is the
        // output kind, or on to the rest of the chain.
        Ok(shared(FilteredWriter::new(
            Box::new(ParentFilter::new(Box::new(NameFilter::new(
                NameMatcher::extension(level.kind.extension()),
            )))),
            Some(accepted),
            Some(if level.is_output_kind { target } else { inner }),
        )))
    }

    fn build_zip_writer(
        &self,
        entry: &ClassPathEntry,
        inner: SharedWriter,
        level: &ArchiveLevel,
    ) -> Result<SharedWriter> {
        let options = ZipEntryWriterOptions {
            uncompressed_filter: self.options.uncompressed_filter.clone(),
            uncompressed_alignment: self.options.uncompressed_alignment,
            page_alignment_filter: if level.page_align {
                Some(NameMatcher::glob(PAGE_ALIGNMENT_FILTER)?)
            } else {
                None
            },
            page_alignment: crate::PAGE_ALIGNMENT,
            modification_time: self.options.modification_time,
            header: level.header.clone(),
            zip64: level.zip64,
        };
        let file_name = entry.path().display().to_string();
        let mut writer: SharedWriter = shared(ZipEntryWriter::new(
            file_name,
            level.is_output_kind,
            options,
            inner,
        ));

        // Entries matching a prefix pattern are tucked under the prefix;
        // the rest of the archive is untouched.
        let prefixless = writer.clone();
        for (pattern, prefix) in level.prefixes.iter().rev() {
            writer = shared(FilteredWriter::new(
                Box::new(NameFilter::new(NameMatcher::glob(pattern)?)),
                Some(shared(PrefixAddingWriter::new(*prefix, prefixless.clone()))),
                Some(writer),
            ));
        }

        Ok(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::DataEntry;
    use crate::pool::MapClassPool;
    use crate::writer::{DataEntryWriter, WriteOutcome};
    use std::io::Cursor;

    fn factory() -> DataEntryWriterFactory {
        DataEntryWriterFactory::new(Rc::new(MapClassPool::new()), OutputOptions::default())
    }

    #[test]
    fn empty_range_is_an_error() {
        let classpath = ClassPath::new();
        let result = factory().create_data_entry_writer(&classpath, 0, 0, None);
        assert!(matches!(result, Err(Error::EmptyOutputRange { .. })));
    }

    #[test]
    fn dex_output_rejects_resources() {
        let dir = tempfile::tempdir().unwrap();
        let classpath: ClassPath = [ClassPathEntry::new(dir.path().join("out.dex"), true)]
            .into_iter()
            .collect();

        let writer = factory()
            .create_data_entry_writer(&classpath, 0, 1, None)
            .unwrap();
        let outcome = writer
            .borrow_mut()
            .write(&DataEntry::new("res.txt"), &mut Cursor::new(vec![1]))
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Skipped);

        let outcome = writer
            .borrow_mut()
            .write(&DataEntry::new("classes.dex"), &mut Cursor::new(vec![1]))
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Written);
        writer.borrow_mut().close().unwrap();
        assert!(dir.path().join("out.dex").exists());
    }

    #[test]
    fn duplicate_outputs_share_one_cached_archive_writer() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.jar");
        let classpath: ClassPath = [
            ClassPathEntry::new(&out, true).with_filter(vec!["first/**"]),
            ClassPathEntry::new(&out, true),
        ]
        .into_iter()
        .collect();

        let mut factory = factory();
        let writer = factory
            .create_data_entry_writer(&classpath, 0, 2, None)
            .unwrap();
        assert_eq!(factory.jar_writer_cache.len(), 1);

        writer
            .borrow_mut()
            .write(
                &DataEntry::new("first/a.txt"),
                &mut Cursor::new(b"a".to_vec()),
            )
            .unwrap();
        writer
            .borrow_mut()
            .write(
                &DataEntry::new("second/b.txt"),
                &mut Cursor::new(b"b".to_vec()),
            )
            .unwrap();
        writer.borrow_mut().close().unwrap();

        // Both routes land in the same single archive.
        let file = std::fs::File::open(&out).unwrap();
        let archive = zip::ZipArchive::new(file).unwrap();
        let mut names: Vec<&str> = archive.file_names().collect();
        names.sort();
        assert_eq!(names, vec!["first/a.txt", "second/b.txt"]);
    }

    #[test]
    fn war_output_prefixes_class_files() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.war");
        let classpath: ClassPath = [ClassPathEntry::new(&out, true)].into_iter().collect();

        let mut pool = MapClassPool::new();
        pool.add(std::sync::Arc::new(crate::pool::BytesClass::new(
            "com/example/Servlet",
            vec![0xCA],
        )));
        let mut factory =
            DataEntryWriterFactory::new(Rc::new(pool), OutputOptions::default());
        let writer = factory
            .create_data_entry_writer(&classpath, 0, 1, None)
            .unwrap();

        writer
            .borrow_mut()
            .write(
                &DataEntry::new("com/example/Servlet.class"),
                &mut Cursor::new(vec![0]),
            )
            .unwrap();
        writer
            .borrow_mut()
            .write(&DataEntry::new("web.xml"), &mut Cursor::new(vec![1]))
            .unwrap();
        writer.borrow_mut().close().unwrap();

        let file = std::fs::File::open(&out).unwrap();
        let archive = zip::ZipArchive::new(file).unwrap();
        let mut names: Vec<&str> = archive.file_names().collect();
        names.sort();
        assert_eq!(names, vec!["classes/com/example/Servlet.class", "web.xml"]);
    }
}
