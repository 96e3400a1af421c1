//! Archive assembly. A `ZipEntryWriter` collects the entries belonging to
//! one container into an in-memory zip, then hands the finished archive to
//! its delegate as a single blob. Nesting falls out naturally: the blob is
//! itself an entry of the surrounding container.

use std::io::{copy, Cursor, Read, Write};

use chrono::{Datelike, Local, Timelike};
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

use crate::entry::DataEntry;
use crate::error::{Error, Result};
use crate::matcher::NameMatcher;
use crate::writer::{DataEntryWriter, SharedWriter, WriteOutcome};

/// Packs a date and time into the 32-bit DOS format stored in zip local
/// headers: date word in the high half, time word in the low half.
pub fn dos_date_time(
    year: u32,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
    second: u32,
) -> u32 {
    (year.saturating_sub(1980)) << 25
        | (month + 1) << 21
        | day << 16
        | hour << 11
        | minute << 5
        | second >> 1
}

/// The current local time in DOS format.
pub fn dos_date_time_now() -> u32 {
    let now = Local::now();
    dos_date_time(
        now.year().max(1980) as u32,
        now.month0(),
        now.day(),
        now.hour(),
        now.minute(),
        now.second(),
    )
}

/// Behavior knobs for one level of archive writing.
#[derive(Clone)]
pub struct ZipEntryWriterOptions {
    /// Entries matching this are stored rather than deflated.
    pub uncompressed_filter: Option<NameMatcher>,
    /// Data alignment for stored entries, in bytes. 1 disables alignment.
    pub uncompressed_alignment: u16,
    /// Entries matching this are stored and page-aligned, e.g. native
    /// libraries that are mapped directly from the installed apk.
    pub page_alignment_filter: Option<NameMatcher>,
    pub page_alignment: u16,
    /// DOS date/time applied to every entry.
    pub modification_time: u32,
    /// Raw bytes emitted before the zip proper, for formats like jmod that
    /// prepend a magic header.
    pub header: Option<Vec<u8>>,
    /// Whether to emit zip64 records, required for app bundles.
    pub zip64: bool,
}

impl Default for ZipEntryWriterOptions {
    fn default() -> Self {
        ZipEntryWriterOptions {
            uncompressed_filter: None,
            uncompressed_alignment: 1,
            page_alignment_filter: None,
            page_alignment: crate::PAGE_ALIGNMENT,
            modification_time: dos_date_time_now(),
            header: None,
            zip64: false,
        }
    }
}

struct OpenContainer {
    container: DataEntry,
    zip: ZipWriter<Cursor<Vec<u8>>>,
}

/// Builds zip archives in memory and forwards each finished archive to the
/// delegate writer.
///
/// In output-archive mode the writer represents the output file itself:
/// one archive is pinned open for the writer's whole life, every entry
/// lands in it, and the blob is flushed on close. In nested mode archives
/// are keyed by each entry's parent container; when entries for a
/// different container start arriving, the previous archive is finished
/// and written out first. Traversal visits containers contiguously, so one
/// open archive at a time suffices.
pub struct ZipEntryWriter {
    file_name: String,
    inner: SharedWriter,
    options: ZipEntryWriterOptions,
    output_archive: bool,
    current: Option<OpenContainer>,
    closed: bool,
}

impl ZipEntryWriter {
    pub fn new(
        file_name: impl Into<String>,
        output_archive: bool,
        options: ZipEntryWriterOptions,
        inner: SharedWriter,
    ) -> Self {
        ZipEntryWriter {
            file_name: file_name.into(),
            inner,
            options,
            output_archive,
            current: None,
            closed: false,
        }
    }

    /// The container that owns this entry: its parent, or the entry itself
    /// when a bare archive blob is written straight through.
    fn container_of(entry: &DataEntry) -> DataEntry {
        match entry.parent() {
            Some(parent) => (**parent).clone(),
            None => entry.clone(),
        }
    }

    fn open_archive(&self, container: DataEntry) -> Result<OpenContainer> {
        let mut cursor = Cursor::new(Vec::new());
        if let Some(header) = &self.options.header {
            cursor
                .write_all(header)
                .map_err(|source| Error::WriteEntry {
                    name: self.file_name.clone(),
                    source,
                })?;
        }
        debug!(archive = %self.file_name, container = %container.full_name(), "opening archive");
        Ok(OpenContainer {
            container,
            zip: ZipWriter::new(cursor),
        })
    }

    fn ensure_open(&mut self, entry: &DataEntry) -> Result<()> {
        let container = Self::container_of(entry);
        if let Some(open) = &self.current {
            if self.output_archive {
                return Ok(());
            }
            let same = open.container.name() == container.name()
                && self
                    .inner
                    .borrow_mut()
                    .same_output_stream(&open.container, &container)?;
            if same {
                return Ok(());
            }
            self.finish_current()?;
        }
        self.current = Some(self.open_archive(container)?);
        Ok(())
    }

    fn entry_options(&self, entry: &DataEntry) -> SimpleFileOptions {
        let page_aligned = self
            .options
            .page_alignment_filter
            .as_ref()
            .map_or(false, |filter| filter.matches(entry.name()));
        let uncompressed = page_aligned
            || self
                .options
                .uncompressed_filter
                .as_ref()
                .map_or(false, |filter| filter.matches(entry.name()));

        let date = (self.options.modification_time >> 16) as u16;
        let time = self.options.modification_time as u16;
        let timestamp = DateTime::try_from_msdos(date, time).unwrap_or_default();

        let mut options = SimpleFileOptions::default()
            .last_modified_time(timestamp)
            .large_file(self.options.zip64);
        if uncompressed {
            let alignment = if page_aligned {
                self.options.page_alignment
            } else {
                self.options.uncompressed_alignment
            };
            options = options
                .compression_method(CompressionMethod::Stored)
                .with_alignment(alignment);
        } else {
            options = options.compression_method(CompressionMethod::Deflated);
        }
        options
    }

    /// Finishes the open archive and writes the resulting blob to the
    /// delegate under the container's entry.
    fn finish_current(&mut self) -> Result<()> {
        let open = match self.current.take() {
            Some(open) => open,
            None => return Ok(()),
        };
        let wrap = |source| Error::FinishArchive {
            name: self.file_name.clone(),
            source,
        };
        let cursor = open.zip.finish().map_err(wrap)?;
        let bytes = cursor.into_inner();
        debug!(
            archive = %self.file_name,
            container = %open.container.full_name(),
            size = bytes.len(),
            "finished archive"
        );
        let blob = if self.output_archive {
            DataEntry::new(self.file_name.clone())
        } else {
            open.container
        };
        self.inner
            .borrow_mut()
            .write(&blob, &mut Cursor::new(bytes))?;
        Ok(())
    }
}

impl DataEntryWriter for ZipEntryWriter {
    fn create_directory(&mut self, entry: &DataEntry) -> Result<bool> {
        self.ensure_open(entry)?;
        let options = self.entry_options(entry);
        let open = match &mut self.current {
            Some(open) => open,
            None => return Ok(false),
        };
        open.zip
            .add_directory(entry.name(), options)
            .map_err(|source| Error::AddArchiveEntry {
                name: entry.name().to_string(),
                source,
            })?;
        Ok(true)
    }

    fn same_output_stream(&mut self, first: &DataEntry, second: &DataEntry) -> Result<bool> {
        if self.output_archive {
            return Ok(true);
        }
        let first_container = Self::container_of(first);
        let second_container = Self::container_of(second);
        Ok(first_container.name() == second_container.name()
            && self
                .inner
                .borrow_mut()
                .same_output_stream(&first_container, &second_container)?)
    }

    fn write(&mut self, entry: &DataEntry, data: &mut dyn Read) -> Result<WriteOutcome> {
        if entry.is_directory() {
            return match self.create_directory(entry)? {
                true => Ok(WriteOutcome::Written),
                false => Ok(WriteOutcome::Skipped),
            };
        }
        self.ensure_open(entry)?;
        let options = self.entry_options(entry);
        let open = match &mut self.current {
            Some(open) => open,
            None => return Ok(WriteOutcome::Skipped),
        };
        let wrap_zip = |source| Error::AddArchiveEntry {
            name: entry.name().to_string(),
            source,
        };
        open.zip.start_file(entry.name(), options).map_err(wrap_zip)?;
        copy(data, &mut open.zip).map_err(|source| Error::WriteEntry {
            name: entry.name().to_string(),
            source,
        })?;
        Ok(WriteOutcome::Written)
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.finish_current()?;
        self.inner.borrow_mut().close()
    }

    fn print_chain(&self, out: &mut String, prefix: &str) {
        out.push_str(prefix);
        out.push_str(&format!(
            "ZipEntryWriter ({}{})\n",
            self.file_name,
            if self.output_archive { ", output" } else { "" }
        ));
        self.inner.borrow().print_chain(out, &format!("{}  ", prefix));
    }
}
