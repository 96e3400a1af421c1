//! The writer chain: polymorphic stages over `{accepts, write}` composed
//! bottom-up into a delegation graph. Each node wraps one delegate (or an
//! accepted/rejected pair); the owner closes the outermost node, which
//! cascades.

use std::cell::RefCell;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::path::PathBuf;
use std::rc::Rc;

use crate::entry::DataEntry;
use crate::error::{Error, Result};

mod class;
mod factory;
mod filtered;
mod manifest;
mod zip;

pub use class::ClassDataEntryWriter;
pub use factory::{DataEntryWriterFactory, OutputOptions};
pub use filtered::{
    DataEntryFilter, FilteredWriter, NameFilter, NonClosingWriter, ParentFilter, ParentWriter,
    PrefixAddingWriter, RenamedWriter,
};
pub use manifest::{ManifestWriter, MANIFEST_NAME};
pub use self::zip::{dos_date_time, dos_date_time_now, ZipEntryWriter, ZipEntryWriterOptions};

/// What happened to a written entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The bytes were consumed and written out.
    Written,
    /// The entry was diverted; its bytes will be emitted later as part of an
    /// accumulated container (e.g. a dex batch). The incoming stream was
    /// intentionally not read.
    Deferred,
    /// No writer in the chain accepted the entry.
    Skipped,
}

/// One stage in a writer chain.
pub trait DataEntryWriter {
    /// Creates the directory named by the entry, returning whether anything
    /// was created.
    fn create_directory(&mut self, entry: &DataEntry) -> Result<bool>;

    /// Whether both entries would end up in the same physical output
    /// stream. This is the destination-identity test that drives dex batch
    /// finalization.
    fn same_output_stream(&mut self, first: &DataEntry, second: &DataEntry) -> Result<bool>;

    /// Routes the entry, writing `data` to its destination.
    fn write(&mut self, entry: &DataEntry, data: &mut dyn Read) -> Result<WriteOutcome>;

    /// Finalizes any pending output and releases resources. Closing twice
    /// is a no-op for physical writers, so shared nodes may be reached from
    /// several parents.
    fn close(&mut self) -> Result<()>;

    /// Appends a diagnostic dump of this node and everything it wraps.
    fn print_chain(&self, out: &mut String, prefix: &str);
}

/// Writer nodes are shared: the factory may route several chains through
/// one cached archive writer.
pub type SharedWriter = Rc<RefCell<dyn DataEntryWriter>>;

pub fn shared<W: DataEntryWriter + 'static>(writer: W) -> SharedWriter {
    Rc::new(RefCell::new(writer))
}

/// Writes every entry as a file under a base directory, creating
/// intermediate directories as needed.
pub struct DirectoryWriter {
    base: PathBuf,
}

impl DirectoryWriter {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        DirectoryWriter { base: base.into() }
    }

    fn target(&self, entry: &DataEntry) -> PathBuf {
        self.base.join(entry.name().trim_start_matches('/'))
    }
}

impl DataEntryWriter for DirectoryWriter {
    fn create_directory(&mut self, entry: &DataEntry) -> Result<bool> {
        let path = self.target(entry);
        fs::create_dir_all(&path).map_err(|source| Error::CreateDirectory {
            path: path.clone(),
            source,
        })?;
        Ok(true)
    }

    fn same_output_stream(&mut self, first: &DataEntry, second: &DataEntry) -> Result<bool> {
        Ok(first.name() == second.name())
    }

    fn write(&mut self, entry: &DataEntry, data: &mut dyn Read) -> Result<WriteOutcome> {
        if entry.is_directory() {
            self.create_directory(entry)?;
            return Ok(WriteOutcome::Written);
        }
        let path = self.target(entry);
        let wrap = |source| Error::WriteEntry {
            name: entry.name().to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(wrap)?;
        }
        let mut file = File::create(&path).map_err(wrap)?;
        io::copy(data, &mut file).map_err(wrap)?;
        Ok(WriteOutcome::Written)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn print_chain(&self, out: &mut String, prefix: &str) {
        out.push_str(prefix);
        out.push_str(&format!("DirectoryWriter ({})\n", self.base.display()));
    }
}

/// Writes everything it receives to one fixed file, ignoring entry names.
/// An archive writer above it delivers the finished container as a single
/// blob.
pub struct FixedFileWriter {
    path: PathBuf,
}

impl FixedFileWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FixedFileWriter { path: path.into() }
    }
}

impl DataEntryWriter for FixedFileWriter {
    fn create_directory(&mut self, _entry: &DataEntry) -> Result<bool> {
        Ok(false)
    }

    fn same_output_stream(&mut self, _first: &DataEntry, _second: &DataEntry) -> Result<bool> {
        Ok(true)
    }

    fn write(&mut self, _entry: &DataEntry, data: &mut dyn Read) -> Result<WriteOutcome> {
        let wrap = |source| Error::CreateFile {
            path: self.path.clone(),
            source,
        };
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)
            .map_err(wrap)?;
        io::copy(data, &mut file).map_err(wrap)?;
        Ok(WriteOutcome::Written)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn print_chain(&self, out: &mut String, prefix: &str) {
        out.push_str(prefix);
        out.push_str(&format!("FixedFileWriter ({})\n", self.path.display()));
    }
}

/// Tries the primary writer and falls through to the alternative when the
/// primary's filters skip the entry. The factory chains one of these per
/// output class path entry, so writes cascade across an output range.
pub struct CascadingWriter {
    primary: SharedWriter,
    alternative: SharedWriter,
}

impl CascadingWriter {
    pub fn new(primary: SharedWriter, alternative: SharedWriter) -> Self {
        CascadingWriter {
            primary,
            alternative,
        }
    }
}

impl DataEntryWriter for CascadingWriter {
    fn create_directory(&mut self, entry: &DataEntry) -> Result<bool> {
        if self.primary.borrow_mut().create_directory(entry)? {
            return Ok(true);
        }
        self.alternative.borrow_mut().create_directory(entry)
    }

    fn same_output_stream(&mut self, first: &DataEntry, second: &DataEntry) -> Result<bool> {
        Ok(self.primary.borrow_mut().same_output_stream(first, second)?
            && self
                .alternative
                .borrow_mut()
                .same_output_stream(first, second)?)
    }

    fn write(&mut self, entry: &DataEntry, data: &mut dyn Read) -> Result<WriteOutcome> {
        match self.primary.borrow_mut().write(entry, data)? {
            WriteOutcome::Skipped => self.alternative.borrow_mut().write(entry, data),
            outcome => Ok(outcome),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.primary.borrow_mut().close()?;
        self.alternative.borrow_mut().close()
    }

    fn print_chain(&self, out: &mut String, prefix: &str) {
        out.push_str(prefix);
        out.push_str("CascadingWriter\n");
        let nested = format!("{}  ", prefix);
        self.primary.borrow().print_chain(out, &nested);
        self.alternative.borrow().print_chain(out, &nested);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::io::Read;

    /// Records written entries in memory; `same_output_stream` compares a
    /// per-entry stream tag supplied by the test.
    pub struct RecordingWriter {
        pub written: Vec<(String, Vec<u8>)>,
        pub directories: Vec<String>,
        pub closed: u32,
        pub stream_tag: Box<dyn Fn(&DataEntry) -> String>,
    }

    impl RecordingWriter {
        pub fn new() -> Self {
            RecordingWriter {
                written: Vec::new(),
                directories: Vec::new(),
                closed: 0,
                stream_tag: Box::new(|_| "default".to_string()),
            }
        }

        pub fn with_stream_tag(tag: impl Fn(&DataEntry) -> String + 'static) -> Self {
            let mut writer = RecordingWriter::new();
            writer.stream_tag = Box::new(tag);
            writer
        }
    }

    impl DataEntryWriter for RecordingWriter {
        fn create_directory(&mut self, entry: &DataEntry) -> Result<bool> {
            self.directories.push(entry.name().to_string());
            Ok(true)
        }

        fn same_output_stream(&mut self, first: &DataEntry, second: &DataEntry) -> Result<bool> {
            Ok((self.stream_tag)(first) == (self.stream_tag)(second))
        }

        fn write(&mut self, entry: &DataEntry, data: &mut dyn Read) -> Result<WriteOutcome> {
            let mut buffer = Vec::new();
            data.read_to_end(&mut buffer)
                .map_err(|source| Error::WriteEntry {
                    name: entry.name().to_string(),
                    source,
                })?;
            self.written.push((entry.name().to_string(), buffer));
            Ok(WriteOutcome::Written)
        }

        fn close(&mut self) -> Result<()> {
            self.closed += 1;
            Ok(())
        }

        fn print_chain(&self, out: &mut String, prefix: &str) {
            out.push_str(prefix);
            out.push_str("RecordingWriter\n");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingWriter;
    use super::*;
    use crate::matcher::NameMatcher;
    use std::io::Cursor;

    #[test]
    fn cascading_falls_through_on_skip() {
        let first = shared(filtered::FilteredWriter::new(
            Box::new(NameFilter::new(NameMatcher::extension(".dex"))),
            Some(shared(RecordingWriter::new())),
            None,
        ));
        let second = shared(RecordingWriter::new());
        let mut cascade = CascadingWriter::new(first, second.clone());

        let outcome = cascade
            .write(&DataEntry::new("res.txt"), &mut Cursor::new(b"x".to_vec()))
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Written);

        let chain = {
            let mut out = String::new();
            cascade.print_chain(&mut out, "");
            out
        };
        assert!(chain.starts_with("CascadingWriter\n"));
        assert!(chain.contains("  FilteredWriter"));
    }

    #[test]
    fn cascading_create_directory_stops_at_the_first_taker() {
        let primary = Rc::new(RefCell::new(RecordingWriter::new()));
        let alternative = Rc::new(RefCell::new(RecordingWriter::new()));
        let primary_handle: SharedWriter = primary.clone();
        let alternative_handle: SharedWriter = alternative.clone();
        let mut cascade = CascadingWriter::new(primary_handle, alternative_handle);

        assert!(cascade.create_directory(&DataEntry::directory("assets")).unwrap());
        assert_eq!(primary.borrow().directories, vec!["assets"]);
        assert!(alternative.borrow().directories.is_empty());
    }

    #[test]
    fn cascading_create_directory_falls_through_when_filtered() {
        let recorder = Rc::new(RefCell::new(RecordingWriter::new()));
        let recorder_handle: SharedWriter = recorder.clone();
        let primary = shared(filtered::FilteredWriter::new(
            Box::new(NameFilter::new(NameMatcher::extension(".dex"))),
            Some(shared(RecordingWriter::new())),
            None,
        ));
        let mut cascade = CascadingWriter::new(primary, recorder_handle);

        assert!(cascade.create_directory(&DataEntry::directory("assets")).unwrap());
        assert_eq!(recorder.borrow().directories, vec!["assets"]);
    }

    #[test]
    fn directory_entries_become_directories_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = DirectoryWriter::new(dir.path());

        let outcome = writer
            .write(
                &DataEntry::directory("sub/assets"),
                &mut Cursor::new(Vec::new()),
            )
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Written);
        assert!(dir.path().join("sub/assets").is_dir());
    }

    #[test]
    fn directory_writer_keys_streams_by_name() {
        let mut writer = DirectoryWriter::new("/tmp/does-not-matter");
        let a = DataEntry::new("a.dex");
        let b = DataEntry::new("b.dex");
        assert!(writer.same_output_stream(&a, &a).unwrap());
        assert!(!writer.same_output_stream(&a, &b).unwrap());
    }
}
