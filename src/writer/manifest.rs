//! Tamper-detection manifest. Selected entries are digested as they pass
//! through, and a jar-style manifest with their SHA-1 and SHA-256 digests
//! is emitted when the output closes.

use std::collections::BTreeMap;
use std::io::{Cursor, Read};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::entry::DataEntry;
use crate::error::{Error, Result};
use crate::matcher::NameMatcher;
use crate::writer::{DataEntryWriter, SharedWriter, WriteOutcome};

/// Where the manifest lands inside the output.
pub const MANIFEST_NAME: &str = "assets/MANIFEST.MF";

struct EntryDigests {
    sha1: String,
    sha256: String,
}

/// Passes all entries through to the delegate, recording digests of the
/// checked ones. On close, the manifest entry is written to a separate
/// destination writer so it can be routed independently of the content it
/// describes.
pub struct ManifestWriter {
    checked: NameMatcher,
    manifest_name: String,
    inner: SharedWriter,
    manifest_destination: SharedWriter,
    digests: BTreeMap<String, EntryDigests>,
    closed: bool,
}

impl ManifestWriter {
    pub fn new(
        checked: NameMatcher,
        inner: SharedWriter,
        manifest_destination: SharedWriter,
    ) -> Self {
        ManifestWriter {
            checked,
            manifest_name: MANIFEST_NAME.to_string(),
            inner,
            manifest_destination,
            digests: BTreeMap::new(),
            closed: false,
        }
    }

    /// Places the manifest under a different path, e.g. inside the base
    /// module of an app bundle.
    pub fn with_manifest_name(mut self, name: impl Into<String>) -> Self {
        self.manifest_name = name.into();
        self
    }

    fn render(&self) -> String {
        let mut manifest = String::from("Manifest-Version: 1.0\n\n");
        for (name, digests) in &self.digests {
            manifest.push_str(&format!(
                "Name: {}\nSHA1-Digest: {}\nSHA-256-Digest: {}\n\n",
                name, digests.sha1, digests.sha256
            ));
        }
        manifest
    }
}

impl DataEntryWriter for ManifestWriter {
    fn create_directory(&mut self, entry: &DataEntry) -> Result<bool> {
        self.inner.borrow_mut().create_directory(entry)
    }

    fn same_output_stream(&mut self, first: &DataEntry, second: &DataEntry) -> Result<bool> {
        self.inner.borrow_mut().same_output_stream(first, second)
    }

    fn write(&mut self, entry: &DataEntry, data: &mut dyn Read) -> Result<WriteOutcome> {
        if !self.checked.matches(entry.name()) {
            return self.inner.borrow_mut().write(entry, data);
        }
        let mut bytes = Vec::new();
        data.read_to_end(&mut bytes)
            .map_err(|source| Error::WriteEntry {
                name: entry.name().to_string(),
                source,
            })?;
        self.digests.insert(
            entry.name().to_string(),
            EntryDigests {
                sha1: STANDARD.encode(Sha1::digest(&bytes)),
                sha256: STANDARD.encode(Sha256::digest(&bytes)),
            },
        );
        self.inner.borrow_mut().write(entry, &mut Cursor::new(bytes))
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if !self.digests.is_empty() {
            debug!(entries = self.digests.len(), "writing integrity manifest");
            let manifest = self.render();
            self.manifest_destination.borrow_mut().write(
                &DataEntry::new(self.manifest_name.clone()),
                &mut Cursor::new(manifest.into_bytes()),
            )?;
        }
        self.inner.borrow_mut().close()
    }

    fn print_chain(&self, out: &mut String, prefix: &str) {
        out.push_str(prefix);
        out.push_str("ManifestWriter\n");
        self.inner.borrow().print_chain(out, &format!("{}  ", prefix));
    }
}
