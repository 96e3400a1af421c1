//! Routing and renaming stages. These never touch bytes themselves; they
//! decide which delegate (if any) sees an entry, and under what name.

use std::io::Read;

use crate::entry::DataEntry;
use crate::error::Result;
use crate::matcher::NameMatcher;
use crate::writer::{DataEntryWriter, SharedWriter, WriteOutcome};

/// A predicate over data entries.
pub trait DataEntryFilter {
    fn accepts(&self, entry: &DataEntry) -> bool;
    fn describe(&self) -> String;
}

/// Accepts entries whose logical name matches.
pub struct NameFilter {
    matcher: NameMatcher,
}

impl NameFilter {
    pub fn new(matcher: NameMatcher) -> Self {
        NameFilter { matcher }
    }
}

impl DataEntryFilter for NameFilter {
    fn accepts(&self, entry: &DataEntry) -> bool {
        self.matcher.matches(entry.name())
    }

    fn describe(&self) -> String {
        format!("name {:?}", self.matcher)
    }
}

/// Applies another filter to the entry's parent container. Top-level
/// entries, having no parent, are rejected.
pub struct ParentFilter {
    inner: Box<dyn DataEntryFilter>,
}

impl ParentFilter {
    pub fn new(inner: Box<dyn DataEntryFilter>) -> Self {
        ParentFilter { inner }
    }
}

impl DataEntryFilter for ParentFilter {
    fn accepts(&self, entry: &DataEntry) -> bool {
        match entry.parent() {
            Some(parent) => self.inner.accepts(parent),
            None => false,
        }
    }

    fn describe(&self) -> String {
        format!("parent [{}]", self.inner.describe())
    }
}

/// Routes each entry to an accepted or rejected delegate based on a
/// filter. A missing delegate drops the entry.
pub struct FilteredWriter {
    filter: Box<dyn DataEntryFilter>,
    accepted: Option<SharedWriter>,
    rejected: Option<SharedWriter>,
}

impl FilteredWriter {
    pub fn new(
        filter: Box<dyn DataEntryFilter>,
        accepted: Option<SharedWriter>,
        rejected: Option<SharedWriter>,
    ) -> Self {
        FilteredWriter {
            filter,
            accepted,
            rejected,
        }
    }

    fn route(&self, entry: &DataEntry) -> Option<&SharedWriter> {
        if self.filter.accepts(entry) {
            self.accepted.as_ref()
        } else {
            self.rejected.as_ref()
        }
    }
}

impl DataEntryWriter for FilteredWriter {
    fn create_directory(&mut self, entry: &DataEntry) -> Result<bool> {
        match self.route(entry) {
            Some(writer) => writer.borrow_mut().create_directory(entry),
            None => Ok(false),
        }
    }

    fn same_output_stream(&mut self, first: &DataEntry, second: &DataEntry) -> Result<bool> {
        let first_accepted = self.filter.accepts(first);
        if first_accepted != self.filter.accepts(second) {
            return Ok(false);
        }
        let branch = if first_accepted {
            self.accepted.as_ref()
        } else {
            self.rejected.as_ref()
        };
        match branch {
            Some(writer) => writer.borrow_mut().same_output_stream(first, second),
            // Both entries are dropped, so neither produces a stream.
            None => Ok(true),
        }
    }

    fn write(&mut self, entry: &DataEntry, data: &mut dyn Read) -> Result<WriteOutcome> {
        match self.route(entry) {
            Some(writer) => writer.borrow_mut().write(entry, data),
            None => Ok(WriteOutcome::Skipped),
        }
    }

    fn close(&mut self) -> Result<()> {
        if let Some(writer) = &self.accepted {
            writer.borrow_mut().close()?;
        }
        if let Some(writer) = &self.rejected {
            writer.borrow_mut().close()?;
        }
        Ok(())
    }

    fn print_chain(&self, out: &mut String, prefix: &str) {
        out.push_str(prefix);
        out.push_str(&format!("FilteredWriter ({})\n", self.filter.describe()));
        let nested = format!("{}  ", prefix);
        match &self.accepted {
            Some(writer) => writer.borrow().print_chain(out, &nested),
            None => out.push_str(&format!("{}(dropped)\n", nested)),
        }
        match &self.rejected {
            Some(writer) => writer.borrow().print_chain(out, &nested),
            None => out.push_str(&format!("{}(dropped)\n", nested)),
        }
    }
}

/// Rewrites entry names through a function before delegating. A `None`
/// result drops the entry.
pub struct RenamedWriter {
    rename: Box<dyn Fn(&str) -> Option<String>>,
    inner: SharedWriter,
}

impl RenamedWriter {
    pub fn new(rename: Box<dyn Fn(&str) -> Option<String>>, inner: SharedWriter) -> Self {
        RenamedWriter { rename, inner }
    }

    /// Replaces every accepted name with one constant name.
    pub fn constant(name: impl Into<String>, inner: SharedWriter) -> Self {
        let name = name.into();
        RenamedWriter::new(Box::new(move |_| Some(name.clone())), inner)
    }

    /// Strips a leading prefix, dropping entries that lack it.
    pub fn strip_prefix(prefix: impl Into<String>, inner: SharedWriter) -> Self {
        let prefix = prefix.into();
        RenamedWriter::new(
            Box::new(move |name| name.strip_prefix(prefix.as_str()).map(str::to_string)),
            inner,
        )
    }

    fn renamed(&self, entry: &DataEntry) -> Option<DataEntry> {
        (self.rename)(entry.name()).map(|name| entry.renamed(name))
    }
}

impl DataEntryWriter for RenamedWriter {
    fn create_directory(&mut self, entry: &DataEntry) -> Result<bool> {
        match self.renamed(entry) {
            Some(renamed) => self.inner.borrow_mut().create_directory(&renamed),
            None => Ok(false),
        }
    }

    fn same_output_stream(&mut self, first: &DataEntry, second: &DataEntry) -> Result<bool> {
        match (self.renamed(first), self.renamed(second)) {
            (Some(first), Some(second)) => {
                self.inner.borrow_mut().same_output_stream(&first, &second)
            }
            (None, None) => Ok(true),
            _ => Ok(false),
        }
    }

    fn write(&mut self, entry: &DataEntry, data: &mut dyn Read) -> Result<WriteOutcome> {
        match self.renamed(entry) {
            Some(renamed) => self.inner.borrow_mut().write(&renamed, data),
            None => Ok(WriteOutcome::Skipped),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.inner.borrow_mut().close()
    }

    fn print_chain(&self, out: &mut String, prefix: &str) {
        out.push_str(prefix);
        out.push_str("RenamedWriter\n");
        self.inner.borrow().print_chain(out, &format!("{}  ", prefix));
    }
}

/// Prepends a fixed prefix to every entry name.
pub struct PrefixAddingWriter {
    prefix: String,
    inner: SharedWriter,
}

impl PrefixAddingWriter {
    pub fn new(prefix: impl Into<String>, inner: SharedWriter) -> Self {
        PrefixAddingWriter {
            prefix: prefix.into(),
            inner,
        }
    }

    fn prefixed(&self, entry: &DataEntry) -> DataEntry {
        entry.renamed(format!("{}{}", self.prefix, entry.name()))
    }
}

impl DataEntryWriter for PrefixAddingWriter {
    fn create_directory(&mut self, entry: &DataEntry) -> Result<bool> {
        self.inner.borrow_mut().create_directory(&self.prefixed(entry))
    }

    fn same_output_stream(&mut self, first: &DataEntry, second: &DataEntry) -> Result<bool> {
        self.inner
            .borrow_mut()
            .same_output_stream(&self.prefixed(first), &self.prefixed(second))
    }

    fn write(&mut self, entry: &DataEntry, data: &mut dyn Read) -> Result<WriteOutcome> {
        self.inner.borrow_mut().write(&self.prefixed(entry), data)
    }

    fn close(&mut self) -> Result<()> {
        self.inner.borrow_mut().close()
    }

    fn print_chain(&self, out: &mut String, prefix: &str) {
        out.push_str(prefix);
        out.push_str(&format!("PrefixAddingWriter ({})\n", self.prefix));
        self.inner.borrow().print_chain(out, &format!("{}  ", prefix));
    }
}

/// Delegates everything except `close`. Lets one shared delegate survive
/// the close of a wrapping chain when another owner is responsible for
/// finalizing it.
pub struct NonClosingWriter {
    inner: SharedWriter,
}

impl NonClosingWriter {
    pub fn new(inner: SharedWriter) -> Self {
        NonClosingWriter { inner }
    }
}

impl DataEntryWriter for NonClosingWriter {
    fn create_directory(&mut self, entry: &DataEntry) -> Result<bool> {
        self.inner.borrow_mut().create_directory(entry)
    }

    fn same_output_stream(&mut self, first: &DataEntry, second: &DataEntry) -> Result<bool> {
        self.inner.borrow_mut().same_output_stream(first, second)
    }

    fn write(&mut self, entry: &DataEntry, data: &mut dyn Read) -> Result<WriteOutcome> {
        self.inner.borrow_mut().write(entry, data)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn print_chain(&self, out: &mut String, prefix: &str) {
        out.push_str(prefix);
        out.push_str("NonClosingWriter\n");
        self.inner.borrow().print_chain(out, &format!("{}  ", prefix));
    }
}

/// Lifts entries out of their immediate container before delegating, so
/// the contents of a nested archive land directly in the surrounding
/// output. Top-level entries pass through unchanged.
pub struct ParentWriter {
    inner: SharedWriter,
}

impl ParentWriter {
    pub fn new(inner: SharedWriter) -> Self {
        ParentWriter { inner }
    }

    fn lifted(&self, entry: &DataEntry) -> DataEntry {
        entry.reparented().unwrap_or_else(|| entry.clone())
    }
}

impl DataEntryWriter for ParentWriter {
    fn create_directory(&mut self, entry: &DataEntry) -> Result<bool> {
        self.inner.borrow_mut().create_directory(&self.lifted(entry))
    }

    fn same_output_stream(&mut self, first: &DataEntry, second: &DataEntry) -> Result<bool> {
        self.inner
            .borrow_mut()
            .same_output_stream(&self.lifted(first), &self.lifted(second))
    }

    fn write(&mut self, entry: &DataEntry, data: &mut dyn Read) -> Result<WriteOutcome> {
        self.inner.borrow_mut().write(&self.lifted(entry), data)
    }

    fn close(&mut self) -> Result<()> {
        self.inner.borrow_mut().close()
    }

    fn print_chain(&self, out: &mut String, prefix: &str) {
        out.push_str(prefix);
        out.push_str("ParentWriter\n");
        self.inner.borrow().print_chain(out, &format!("{}  ", prefix));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::testing::RecordingWriter;
    use crate::writer::shared;
    use std::io::Cursor;
    use std::rc::Rc;

    #[test]
    fn filtered_writer_routes_by_name() {
        let accepted = Rc::new(std::cell::RefCell::new(RecordingWriter::new()));
        let rejected = Rc::new(std::cell::RefCell::new(RecordingWriter::new()));
        let accepted_shared: SharedWriter = accepted.clone();
        let rejected_shared: SharedWriter = rejected.clone();
        let mut writer = FilteredWriter::new(
            Box::new(NameFilter::new(NameMatcher::extension(".class"))),
            Some(accepted_shared),
            Some(rejected_shared),
        );

        writer
            .write(&DataEntry::new("A.class"), &mut Cursor::new(vec![1]))
            .unwrap();
        writer
            .write(&DataEntry::new("res.txt"), &mut Cursor::new(vec![2]))
            .unwrap();

        assert_eq!(accepted.borrow().written.len(), 1);
        assert_eq!(accepted.borrow().written[0].0, "A.class");
        assert_eq!(rejected.borrow().written.len(), 1);
        assert_eq!(rejected.borrow().written[0].0, "res.txt");
    }

    #[test]
    fn filtered_writer_splits_streams_across_the_filter() {
        let sink = shared(RecordingWriter::new());
        let mut writer = FilteredWriter::new(
            Box::new(NameFilter::new(NameMatcher::extension(".class"))),
            Some(sink.clone()),
            Some(sink),
        );
        let class = DataEntry::new("A.class");
        let resource = DataEntry::new("res.txt");
        assert!(!writer.same_output_stream(&class, &resource).unwrap());
        assert!(writer.same_output_stream(&class, &class).unwrap());
    }

    #[test]
    fn renamed_writer_drops_unmapped_entries() {
        let sink = Rc::new(std::cell::RefCell::new(RecordingWriter::new()));
        let sink_shared: SharedWriter = sink.clone();
        let mut writer = RenamedWriter::strip_prefix("classes/", sink_shared);

        let outcome = writer
            .write(&DataEntry::new("other/B.class"), &mut Cursor::new(vec![2]))
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Skipped);

        writer
            .write(&DataEntry::new("classes/A.class"), &mut Cursor::new(vec![1]))
            .unwrap();
        assert_eq!(sink.borrow().written[0].0, "A.class");
    }

    #[test]
    fn parent_writer_lifts_one_nesting_level() {
        let sink = Rc::new(std::cell::RefCell::new(
            RecordingWriter::with_stream_tag(|entry| entry.full_name()),
        ));
        let sink_shared: SharedWriter = sink.clone();
        let mut writer = ParentWriter::new(sink_shared);

        let outer = Rc::new(DataEntry::new("out.jar"));
        let inner = Rc::new(DataEntry::nested("lib.zip", outer.clone()));
        let entry = DataEntry::nested("res.txt", inner);

        writer.write(&entry, &mut Cursor::new(vec![3])).unwrap();
        assert_eq!(sink.borrow().written[0].0, "res.txt");

        // After lifting, the entry is keyed to the outer container rather
        // than the nested archive it came from.
        let lifted = entry.reparented().unwrap();
        assert!(Rc::ptr_eq(lifted.parent().unwrap(), &outer));
    }

    #[test]
    fn non_closing_writer_swallows_close() {
        let sink = Rc::new(std::cell::RefCell::new(RecordingWriter::new()));
        let sink_shared: SharedWriter = sink.clone();
        let mut writer = NonClosingWriter::new(sink_shared);
        writer.close().unwrap();
        assert_eq!(sink.borrow().closed, 0);
    }
}
