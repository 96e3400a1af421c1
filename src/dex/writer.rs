//! The accumulate-and-flush state machine that turns streams of class
//! file entries into dex container entries.

use std::io::{Cursor, Read};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

use tracing::debug;

use crate::dex::converter::{DexBatch, DexConverter, SeenClasses};
use crate::entry::DataEntry;
use crate::error::{Error, Result};
use crate::pool::{Class, ClassPool};
use crate::writer::{DataEntryWriter, SharedWriter, WriteOutcome};

/// Selects which pool classes a dex writer collects. Classes it declines
/// are passed on to the next writer in the chain.
pub type ClassPredicate = Rc<dyn Fn(&dyn Class) -> bool>;

/// Collects class file entries destined for one output container into a
/// batch, and flushes the converted dex file when entries for a different
/// destination start arriving or the writer closes.
///
/// The writer is idle until the first class file entry arrives (or, with
/// `force_dex`, until any entry arrives), then accumulates until the
/// destination changes. The dex entry's position in the output container
/// corresponds to the first class that opened the batch.
pub struct DexEntryWriter {
    class_pool: Rc<dyn ClassPool>,
    class_filter: Option<ClassPredicate>,
    dex_file_name: String,
    /// Emit a dex entry even when no classes were collected.
    force_dex: bool,
    converter: Arc<dyn DexConverter>,
    libraries: Vec<PathBuf>,
    thread_pool: Arc<rayon::ThreadPool>,
    dex_writer: SharedWriter,
    other_writer: SharedWriter,
    seen: SeenClasses,
    current: Option<(DataEntry, DexBatch)>,
}

impl DexEntryWriter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        class_pool: Rc<dyn ClassPool>,
        class_filter: Option<ClassPredicate>,
        dex_file_name: impl Into<String>,
        force_dex: bool,
        converter: Arc<dyn DexConverter>,
        libraries: Vec<PathBuf>,
        thread_pool: Arc<rayon::ThreadPool>,
        dex_writer: SharedWriter,
        other_writer: SharedWriter,
    ) -> Self {
        DexEntryWriter {
            class_pool,
            class_filter,
            dex_file_name: dex_file_name.into(),
            force_dex,
            converter,
            libraries,
            thread_pool,
            dex_writer,
            other_writer,
            seen: SeenClasses::default(),
            current: None,
        }
    }

    /// The dex entry that `entry` would contribute to: same container,
    /// fixed dex file name.
    fn destination_for(&self, entry: &DataEntry) -> DataEntry {
        entry.renamed(self.dex_file_name.clone())
    }

    /// Flushes the pending batch if `entry` belongs to a different output
    /// container than the classes collected so far.
    fn finish_if_necessary(&mut self, entry: &DataEntry) -> Result<()> {
        let flush = match &self.current {
            Some((destination, _)) => {
                let next = self.destination_for(entry);
                !self
                    .dex_writer
                    .borrow_mut()
                    .same_output_stream(destination, &next)?
            }
            None => false,
        };
        if flush {
            self.finish()?;
        }
        Ok(())
    }

    fn set_up(&mut self, entry: &DataEntry) {
        if self.current.is_none() {
            let destination = self.destination_for(entry);
            debug!(destination = %destination.full_name(), "opening dex batch");
            self.current = Some((
                destination,
                DexBatch::new(
                    self.converter.clone(),
                    self.libraries.clone(),
                    self.thread_pool.clone(),
                ),
            ));
        }
    }

    /// Converts and writes the pending batch, if any.
    fn finish(&mut self) -> Result<()> {
        let (destination, batch) = match self.current.take() {
            Some(current) => current,
            None => return Ok(()),
        };
        let dex = batch.materialize().map_err(|source| Error::ConvertDex {
            name: destination.full_name(),
            source,
        })?;
        debug!(
            destination = %destination.full_name(),
            size = dex.len(),
            "writing converted dex"
        );
        self.dex_writer
            .borrow_mut()
            .write(&destination, &mut Cursor::new(dex))?;
        Ok(())
    }
}

impl DataEntryWriter for DexEntryWriter {
    fn create_directory(&mut self, entry: &DataEntry) -> Result<bool> {
        self.finish_if_necessary(entry)?;
        self.other_writer.borrow_mut().create_directory(entry)
    }

    fn same_output_stream(&mut self, first: &DataEntry, second: &DataEntry) -> Result<bool> {
        self.dex_writer.borrow_mut().same_output_stream(first, second)
    }

    fn write(&mut self, entry: &DataEntry, data: &mut dyn Read) -> Result<WriteOutcome> {
        self.finish_if_necessary(entry)?;

        let class_name = match entry.class_name() {
            Some(class_name) => class_name,
            None => {
                // Resources never enter the batch, but with force_dex they
                // still pin the destination so an empty container appears.
                if self.force_dex {
                    self.set_up(entry);
                }
                return self.other_writer.borrow_mut().write(entry, data);
            }
        };

        let class = match self.class_pool.get_class(class_name) {
            Some(class) => class,
            // Classes dropped during processing leave stale entries behind;
            // those flow on unchanged.
            None => return self.other_writer.borrow_mut().write(entry, data),
        };
        if let Some(filter) = &self.class_filter {
            if !filter(class.as_ref()) {
                return self.other_writer.borrow_mut().write(entry, data);
            }
        }

        self.set_up(entry);
        if self.seen.first_sighting(class_name) {
            if let Some((_, batch)) = &self.current {
                batch.add_class(class);
            }
        }
        // The class bytes come from the pool at materialize time; the
        // incoming stream is deliberately left unread.
        Ok(WriteOutcome::Deferred)
    }

    fn close(&mut self) -> Result<()> {
        self.finish()?;
        self.dex_writer.borrow_mut().close()?;
        self.other_writer.borrow_mut().close()
    }

    fn print_chain(&self, out: &mut String, prefix: &str) {
        out.push_str(prefix);
        out.push_str(&format!(
            "DexEntryWriter ({}{})\n",
            self.dex_file_name,
            if self.force_dex { ", forced" } else { "" }
        ));
        let nested = format!("{}  ", prefix);
        self.dex_writer.borrow().print_chain(out, &nested);
        self.other_writer.borrow().print_chain(out, &nested);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::converter::testing::{test_thread_pool, StubConverter, STUB_HEADER};
    use crate::dex::CLASSES_DEX;
    use crate::pool::{BytesClass, MapClassPool};
    use crate::writer::testing::RecordingWriter;
    use std::cell::RefCell;

    fn pool_with(classes: &[(&str, u8)]) -> Rc<MapClassPool> {
        let mut pool = MapClassPool::new();
        for (name, byte) in classes {
            pool.add(Arc::new(BytesClass::new(*name, vec![*byte])));
        }
        Rc::new(pool)
    }

    fn writer_over(
        pool: Rc<MapClassPool>,
        force_dex: bool,
        dex_sink: Rc<RefCell<RecordingWriter>>,
        other_sink: Rc<RefCell<RecordingWriter>>,
    ) -> DexEntryWriter {
        let dex_shared: SharedWriter = dex_sink;
        let other_shared: SharedWriter = other_sink;
        DexEntryWriter::new(
            pool,
            None,
            CLASSES_DEX,
            force_dex,
            Arc::new(StubConverter),
            Vec::new(),
            test_thread_pool(),
            dex_shared,
            other_shared,
        )
    }

    #[test]
    fn accumulates_classes_and_flushes_one_dex_on_close() {
        let pool = pool_with(&[("com/example/Foo", 1), ("com/example/Bar", 2)]);
        let dex_sink = Rc::new(RefCell::new(RecordingWriter::new()));
        let other_sink = Rc::new(RefCell::new(RecordingWriter::new()));
        let mut writer = writer_over(pool, false, dex_sink.clone(), other_sink.clone());

        for name in ["com/example/Foo.class", "com/example/Bar.class"] {
            let outcome = writer
                .write(&DataEntry::new(name), &mut Cursor::new(vec![0]))
                .unwrap();
            assert_eq!(outcome, WriteOutcome::Deferred);
        }
        writer
            .write(&DataEntry::new("res.txt"), &mut Cursor::new(vec![9]))
            .unwrap();
        assert!(dex_sink.borrow().written.is_empty());

        writer.close().unwrap();

        let sink = dex_sink.borrow();
        let written = &sink.written;
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].0, CLASSES_DEX);
        let mut expected = STUB_HEADER.to_vec();
        expected.extend_from_slice(&[1, 2]);
        assert_eq!(written[0].1, expected);

        assert_eq!(other_sink.borrow().written[0].0, "res.txt");
    }

    #[test]
    fn duplicate_class_entries_are_converted_once() {
        let pool = pool_with(&[("a/A", 1)]);
        let dex_sink = Rc::new(RefCell::new(RecordingWriter::new()));
        let other_sink = Rc::new(RefCell::new(RecordingWriter::new()));
        let mut writer = writer_over(pool, false, dex_sink.clone(), other_sink);

        writer
            .write(&DataEntry::new("a/A.class"), &mut Cursor::new(vec![0]))
            .unwrap();
        writer
            .write(&DataEntry::new("a/A.class"), &mut Cursor::new(vec![0]))
            .unwrap();
        writer.close().unwrap();

        let mut expected = STUB_HEADER.to_vec();
        expected.push(1);
        assert_eq!(dex_sink.borrow().written[0].1, expected);
    }

    #[test]
    fn destination_change_flushes_the_previous_batch() {
        let pool = pool_with(&[("a/A", 1), ("b/B", 2)]);
        let dex_sink = Rc::new(RefCell::new(RecordingWriter::with_stream_tag(|entry| {
            entry
                .parent()
                .map(|parent| parent.name().to_string())
                .unwrap_or_default()
        })));
        let other_sink = Rc::new(RefCell::new(RecordingWriter::new()));
        let mut writer = writer_over(pool, false, dex_sink.clone(), other_sink);

        let first_apk = Rc::new(DataEntry::new("first.apk"));
        let second_apk = Rc::new(DataEntry::new("second.apk"));
        writer
            .write(
                &DataEntry::nested("a/A.class", first_apk),
                &mut Cursor::new(vec![0]),
            )
            .unwrap();
        writer
            .write(
                &DataEntry::nested("b/B.class", second_apk),
                &mut Cursor::new(vec![0]),
            )
            .unwrap();
        assert_eq!(dex_sink.borrow().written.len(), 1);

        writer.close().unwrap();
        let sink = dex_sink.borrow();
        let written = &sink.written;
        assert_eq!(written.len(), 2);
        assert_eq!(written[0].1[STUB_HEADER.len()..], [1]);
        assert_eq!(written[1].1[STUB_HEADER.len()..], [2]);
    }

    #[test]
    fn unresolved_class_entries_flow_to_the_other_writer() {
        let pool = pool_with(&[]);
        let dex_sink = Rc::new(RefCell::new(RecordingWriter::new()));
        let other_sink = Rc::new(RefCell::new(RecordingWriter::new()));
        let mut writer = writer_over(pool, false, dex_sink.clone(), other_sink.clone());

        writer
            .write(&DataEntry::new("gone/X.class"), &mut Cursor::new(vec![5]))
            .unwrap();
        writer.close().unwrap();

        assert!(dex_sink.borrow().written.is_empty());
        assert_eq!(other_sink.borrow().written[0].0, "gone/X.class");
    }

    #[test]
    fn force_dex_emits_an_empty_container() {
        let pool = pool_with(&[]);
        let dex_sink = Rc::new(RefCell::new(RecordingWriter::new()));
        let other_sink = Rc::new(RefCell::new(RecordingWriter::new()));
        let mut writer = writer_over(pool, true, dex_sink.clone(), other_sink);

        writer
            .write(&DataEntry::new("res.txt"), &mut Cursor::new(vec![9]))
            .unwrap();
        writer.close().unwrap();

        assert_eq!(dex_sink.borrow().written[0].0, CLASSES_DEX);
        assert_eq!(dex_sink.borrow().written[0].1, STUB_HEADER.to_vec());
    }

    #[test]
    fn without_force_dex_an_idle_writer_emits_nothing() {
        let pool = pool_with(&[]);
        let dex_sink = Rc::new(RefCell::new(RecordingWriter::new()));
        let other_sink = Rc::new(RefCell::new(RecordingWriter::new()));
        let mut writer = writer_over(pool, false, dex_sink.clone(), other_sink);

        writer
            .write(&DataEntry::new("res.txt"), &mut Cursor::new(vec![9]))
            .unwrap();
        writer.close().unwrap();
        assert!(dex_sink.borrow().written.is_empty());
    }
}
