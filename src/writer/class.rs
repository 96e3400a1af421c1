use std::io::{Cursor, Read};

use tracing::debug;

use crate::entry::DataEntry;
use crate::error::{Error, Result};
use crate::pool::ClassPool;
use crate::writer::{DataEntryWriter, SharedWriter, WriteOutcome};

use std::rc::Rc;

/// Writes class file entries from the processed class pool rather than
/// from their incoming bytes, so outputs reflect processing results.
/// Entries whose class is not in the pool are dropped; non-class entries
/// pass through untouched.
pub struct ClassDataEntryWriter {
    class_pool: Rc<dyn ClassPool>,
    inner: SharedWriter,
}

impl ClassDataEntryWriter {
    pub fn new(class_pool: Rc<dyn ClassPool>, inner: SharedWriter) -> Self {
        ClassDataEntryWriter { class_pool, inner }
    }
}

impl DataEntryWriter for ClassDataEntryWriter {
    fn create_directory(&mut self, entry: &DataEntry) -> Result<bool> {
        self.inner.borrow_mut().create_directory(entry)
    }

    fn same_output_stream(&mut self, first: &DataEntry, second: &DataEntry) -> Result<bool> {
        self.inner.borrow_mut().same_output_stream(first, second)
    }

    fn write(&mut self, entry: &DataEntry, data: &mut dyn Read) -> Result<WriteOutcome> {
        let class_name = match entry.class_name() {
            Some(name) => name,
            None => return self.inner.borrow_mut().write(entry, data),
        };
        let class = match self.class_pool.get_class(class_name) {
            Some(class) => class,
            None => {
                debug!(class = class_name, "class not in pool, dropping entry");
                return Ok(WriteOutcome::Skipped);
            }
        };
        let bytes = class.serialize().map_err(|source| Error::WriteEntry {
            name: entry.name().to_string(),
            source,
        })?;
        self.inner.borrow_mut().write(entry, &mut Cursor::new(bytes))
    }

    fn close(&mut self) -> Result<()> {
        self.inner.borrow_mut().close()
    }

    fn print_chain(&self, out: &mut String, prefix: &str) {
        out.push_str(prefix);
        out.push_str("ClassDataEntryWriter\n");
        self.inner.borrow().print_chain(out, &format!("{}  ", prefix));
    }
}
