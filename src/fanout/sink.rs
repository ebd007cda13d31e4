//! Append-only destination files keyed by `(key, origin)`.
//!
//! Rows are staged in memory per destination and only ever reach disk as
//! whole CSV lines, so a destination interrupted at any point is a header
//! plus a prefix of its rows.

use crate::error::{Result, ResultExt as _};
use csv::StringRecord;
use indexmap::IndexMap;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Read as _, Seek as _, SeekFrom, Write as _};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// Staged bytes per destination before it is flushed early.
pub const STAGE_LIMIT: usize = 64 * 1024;

const TAIL_BLOCK: u64 = 8 * 1024;

struct Staged {
    writer: csv::Writer<Vec<u8>>,
    rows: u64,
}

/// The set of destinations touched by one fan-out run.
pub struct Destinations {
    root: PathBuf,
    max_open: usize,
    /// Open handles, least recently used first.
    open: IndexMap<PathBuf, File>,
    staged: IndexMap<PathBuf, Staged>,
    /// Destinations known to already hold a header.
    headed: HashSet<PathBuf>,
    touched: HashSet<PathBuf>,
    rows_written: u64,
}

impl Destinations {
    pub fn new(root: impl Into<PathBuf>, max_open: usize) -> Self {
        Self {
            root: root.into(),
            max_open: max_open.max(1),
            open: IndexMap::new(),
            staged: IndexMap::new(),
            headed: HashSet::new(),
            touched: HashSet::new(),
            rows_written: 0,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Rows that reached disk.
    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    /// Distinct destination files touched so far.
    pub fn destinations(&self) -> usize {
        self.touched.len()
    }

    pub fn open_files(&self) -> usize {
        self.open.len()
    }

    /// Path of the `(key, origin)` destination, or `None` when the key cannot
    /// name a single directory.
    pub fn path_for(&self, key: &str, origin: &str) -> Option<PathBuf> {
        is_plain_component(key).then(|| self.root.join(key).join(origin))
    }

    /// Stage one row for `(key, origin)`. A destination without a header gets
    /// `preamble` and `header` ahead of its first row. Returns `false` when
    /// the key cannot be used as a directory name.
    pub fn stage<I, T>(
        &mut self,
        key: &str,
        origin: &str,
        preamble: &[StringRecord],
        header: &StringRecord,
        record: I,
    ) -> Result<bool>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        let Some(path) = self.path_for(key, origin) else {
            return Ok(false);
        };

        if !self.headed.contains(&path) && !self.staged.contains_key(&path) {
            let has_header = prepare(&path)?;
            let mut writer = stage_writer();
            if !has_header {
                for line in preamble {
                    writer.write_record(line).for_destination(&path)?;
                }
                writer.write_record(header).for_destination(&path)?;
            }
            self.staged.insert(path.clone(), Staged { writer, rows: 0 });
            self.headed.insert(path.clone());
        }

        let staged = self
            .staged
            .entry(path.clone())
            .or_insert_with(|| Staged {
                writer: stage_writer(),
                rows: 0,
            });
        staged.writer.write_record(record).for_destination(&path)?;
        staged.rows += 1;

        if staged.writer.get_ref().len() >= STAGE_LIMIT {
            self.flush_one(&path)?;
        }
        Ok(true)
    }

    /// Write every staged row to disk.
    pub fn flush(&mut self) -> Result<()> {
        let paths: Vec<PathBuf> = self.staged.keys().cloned().collect();
        for path in paths {
            self.flush_one(&path)?;
        }
        Ok(())
    }

    /// Flush and close everything.
    pub fn finish(&mut self) -> Result<()> {
        self.flush()?;
        for (path, file) in self.open.drain(..) {
            file.sync_data().for_destination(&path)?;
        }
        Ok(())
    }

    fn flush_one(&mut self, path: &Path) -> Result<()> {
        let Some(staged) = self.staged.shift_remove(path) else {
            return Ok(());
        };
        let bytes = staged
            .writer
            .into_inner()
            .map_err(|e| std::io::Error::other(e.to_string()))
            .for_destination(path)?;
        if bytes.is_empty() {
            return Ok(());
        }

        let file = self.handle(path)?;
        file.write_all(&bytes).for_destination(path)?;
        self.touched.insert(path.to_path_buf());
        self.rows_written += staged.rows;
        debug!(path = %path.display(), rows = staged.rows, "Flushed staged rows");
        Ok(())
    }

    /// Open handle for `path`, marking it most recently used and closing the
    /// least recently used handle when over the limit.
    fn handle(&mut self, path: &Path) -> Result<&mut File> {
        if let Some(idx) = self.open.get_index_of(path) {
            let last = self.open.len() - 1;
            self.open.move_index(idx, last);
        } else {
            if self.open.len() >= self.max_open
                && let Some((evicted, _)) = self.open.shift_remove_index(0)
            {
                debug!(path = %evicted.display(), "Closed least recently used destination");
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .for_destination(path)?;
            self.open.insert(path.to_path_buf(), file);
        }
        let last = self.open.len() - 1;
        let (_, file) = self
            .open
            .get_index_mut(last)
            .ok_or_else(|| std::io::Error::other("destination handle vanished"))
            .for_destination(path)?;
        Ok(file)
    }
}

impl std::fmt::Debug for Destinations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Destinations")
            .field("root", &self.root)
            .field("open", &self.open.len())
            .field("staged", &self.staged.len())
            .field("destinations", &self.touched.len())
            .field("rows_written", &self.rows_written)
            .finish()
    }
}

fn stage_writer() -> csv::Writer<Vec<u8>> {
    csv::WriterBuilder::new()
        .has_headers(false)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new())
}

fn is_plain_component(key: &str) -> bool {
    let mut components = Path::new(key).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(name)), None) if name == key
    )
}

/// Create the destination's directory and repair a torn final line. Returns
/// whether the destination already holds a header.
fn prepare(path: &Path) -> Result<bool> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).for_destination(parent)?;
    }
    let len = match std::fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e).for_destination(path),
    };
    if len == 0 {
        return Ok(false);
    }
    let kept = trim_torn_tail(path, len)?;
    Ok(kept > 0)
}

/// Cut the file back to just after its last newline. Returns the new length.
fn trim_torn_tail(path: &Path, len: u64) -> Result<u64> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .for_destination(path)?;

    let mut end = len;
    let mut block = vec![0_u8; usize::try_from(TAIL_BLOCK).unwrap_or(8 * 1024)];
    while end > 0 {
        let start = end.saturating_sub(TAIL_BLOCK);
        let size = usize::try_from(end - start).unwrap_or(block.len());
        file.seek(SeekFrom::Start(start)).for_destination(path)?;
        file.read_exact(&mut block[..size]).for_destination(path)?;
        if let Some(pos) = block[..size].iter().rposition(|&b| b == b'\n') {
            let keep = start + pos as u64 + 1;
            if keep < len {
                warn!(
                    path = %path.display(),
                    dropped_bytes = len - keep,
                    "Trimmed incomplete final line"
                );
                file.set_len(keep).for_destination(path)?;
            }
            return Ok(keep);
        }
        end = start;
    }

    warn!(path = %path.display(), dropped_bytes = len, "Trimmed incomplete final line");
    file.set_len(0).for_destination(path)?;
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> StringRecord {
        StringRecord::from(vec!["storeId", "amount"])
    }

    #[test]
    fn test_header_written_once() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut sinks = Destinations::new(dir.path(), 4);
        sinks.stage("1", "a.csv", &[], &header(), ["1", "100"])?;
        sinks.flush()?;
        sinks.stage("1", "a.csv", &[], &header(), ["1", "30"])?;
        sinks.finish()?;

        let text = std::fs::read_to_string(dir.path().join("1").join("a.csv"))?;
        assert_eq!(text, "storeId,amount\n1,100\n1,30\n");
        assert_eq!(sinks.rows_written(), 2);
        assert_eq!(sinks.destinations(), 1);
        Ok(())
    }

    #[test]
    fn test_existing_destination_appends_after_repair() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("7").join("a.csv");
        std::fs::create_dir_all(path.parent().expect("parent"))?;
        std::fs::write(&path, "storeId,amount\n7,1\n7,2")?;

        let mut sinks = Destinations::new(dir.path(), 4);
        sinks.stage("7", "a.csv", &[], &header(), ["7", "3"])?;
        sinks.finish()?;
        assert_eq!(std::fs::read_to_string(&path)?, "storeId,amount\n7,1\n7,3\n");
        Ok(())
    }

    #[test]
    fn test_headerless_fragment_is_rewritten() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("7").join("a.csv");
        std::fs::create_dir_all(path.parent().expect("parent"))?;
        std::fs::write(&path, "storeI")?;

        let mut sinks = Destinations::new(dir.path(), 4);
        sinks.stage("7", "a.csv", &[], &header(), ["7", "3"])?;
        sinks.finish()?;
        assert_eq!(std::fs::read_to_string(&path)?, "storeId,amount\n7,3\n");
        Ok(())
    }

    #[test]
    fn test_open_handles_are_bounded() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut sinks = Destinations::new(dir.path(), 2);
        for key in ["1", "2", "3", "1", "4"] {
            sinks.stage(key, "a.csv", &[], &header(), [key, "5"])?;
            sinks.flush()?;
            assert!(sinks.open_files() <= 2);
        }
        sinks.finish()?;
        assert_eq!(
            std::fs::read_to_string(dir.path().join("1").join("a.csv"))?,
            "storeId,amount\n1,5\n1,5\n"
        );
        assert_eq!(sinks.destinations(), 4);
        Ok(())
    }

    #[test]
    fn test_unsafe_keys_are_refused() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut sinks = Destinations::new(dir.path(), 2);
        for key in ["..", ".", "a/b", ""] {
            assert!(!sinks.stage(key, "a.csv", &[], &header(), [key, "1"])?);
        }
        assert_eq!(sinks.destinations(), 0);
        Ok(())
    }
}
