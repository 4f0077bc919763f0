//! The scenario file as loaded from disk: exact source text plus node tree.

use crate::error::Result;
use crate::updates::RewriteSet;
use crate::yaml::{self, Node};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// A scenario document whose text is only ever changed through rewrites.
#[derive(Debug, Clone)]
pub struct ScenarioDocument {
    path: Option<PathBuf>,
    source: String,
    root: Node,
}

impl ScenarioDocument {
    /// Reads and parses a scenario file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = fs::read_to_string(path)?;
        let mut doc = Self::parse(source)?;
        doc.path = Some(path.to_path_buf());
        Ok(doc)
    }

    /// Parses scenario text that has no backing file.
    pub fn parse(source: impl Into<String>) -> Result<Self> {
        let source = source.into();
        let root = yaml::parse(&source)?;
        Ok(Self {
            path: None,
            source,
            root,
        })
    }

    /// File the document was loaded from, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Root node of the document.
    pub fn root(&self) -> &Node {
        &self.root
    }

    /// Current text of the document. Unmodified documents return their
    /// source byte for byte.
    pub fn serialize(&self) -> &str {
        &self.source
    }

    /// Applies pending rewrites to the in-memory text and re-reads it.
    ///
    /// Returns the number of edits applied. Nothing touches the disk until
    /// [`save`](Self::save).
    pub fn apply(&mut self, rewrites: &RewriteSet) -> Result<usize> {
        if rewrites.is_empty() {
            return Ok(0);
        }
        let text = rewrites.apply(&self.source)?;
        let root = yaml::parse(&text)?;
        let applied = rewrites.len();
        if text != self.source {
            debug!(edits = applied, "Rewrote scenario text");
        }
        self.source = text;
        self.root = root;
        Ok(applied)
    }

    /// Writes the document back to the file it was loaded from.
    pub fn save(&self) -> Result<()> {
        match &self.path {
            Some(path) => self.save_to(path),
            None => Err(crate::error::ScenarioError::Config(
                "scenario document has no backing file".to_string(),
            )),
        }
    }

    /// Writes the document to `path` atomically, holding an exclusive lock on
    /// a sibling `.lock` file for the duration.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let lock_path = sibling(path, "lock");
        let lock = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;
        lock.lock_exclusive()?;

        let written = atomic_write(path, self.source.as_bytes());

        let _ = lock.unlock();
        drop(lock);
        let _ = fs::remove_file(&lock_path);
        written
    }
}

fn sibling(path: &Path, extension: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(extension);
    path.with_file_name(name)
}

/// Writes data atomically using temp file + rename.
fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let tmp_path = sibling(path, "tmp");
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}
