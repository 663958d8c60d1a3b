//! Durable file primitives: atomic whole-file publication and line-oriented
//! append logs with torn-tail repair.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use memory_kernel_provenance_core::ProvenanceError;
use ulid::Ulid;

pub(crate) fn io_write_error(target: &Path, err: &std::io::Error) -> ProvenanceError {
    ProvenanceError::Write {
        target: target.display().to_string(),
        message: err.to_string(),
    }
}

/// `anyhow::Context`-style mapping of `rusqlite` failures.
pub(crate) trait StorageContext<T> {
    fn storage(self, context: &str) -> Result<T, ProvenanceError>;
}

impl<T> StorageContext<T> for rusqlite::Result<T> {
    fn storage(self, context: &str) -> Result<T, ProvenanceError> {
        self.map_err(|err| ProvenanceError::Storage(format!("{context}: {err}")))
    }
}

/// Publishes `bytes` at `path` so readers see either nothing or the whole file.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent")
    })?;
    fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = parent.join(format!(".{file_name}.tmp-{}", Ulid::new()));

    if let Err(err) = write_then_rename(&tmp_path, path, bytes) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }

    sync_dir(parent)
}

fn write_then_rename(tmp_path: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(tmp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(tmp_path, path)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Splits raw log bytes into complete lines. Bytes after the last newline are
/// an unconfirmed write and are reported separately.
fn split_lines(bytes: &[u8]) -> (Vec<String>, usize) {
    let complete_len = bytes
        .iter()
        .rposition(|byte| *byte == b'\n')
        .map_or(0, |index| index + 1);

    let lines = bytes[..complete_len]
        .split(|byte| *byte == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| String::from_utf8_lossy(line).into_owned())
        .collect();

    (lines, complete_len)
}

/// Reads the complete lines of a log without modifying it. A missing file is
/// an empty log.
pub(crate) fn read_complete_lines(path: &Path) -> std::io::Result<Vec<String>> {
    let mut bytes = Vec::new();
    match File::open(path) {
        Ok(mut file) => {
            file.read_to_end(&mut bytes)?;
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    }
    Ok(split_lines(&bytes).0)
}

/// Append-only newline-delimited log owned by a single writer.
pub(crate) struct LogFile {
    path: PathBuf,
    file: File,
    len: u64,
}

impl LogFile {
    /// Opens (creating if needed) and returns the complete lines already on
    /// disk. A torn final line is truncated away.
    pub(crate) fn open(path: &Path) -> Result<(Self, Vec<String>), ProvenanceError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| io_write_error(parent, &err))?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)
            .map_err(|err| io_write_error(path, &err))?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .map_err(|err| io_write_error(path, &err))?;
        let (lines, complete_len) = split_lines(&bytes);

        if complete_len < bytes.len() {
            tracing::warn!(
                path = %path.display(),
                torn_bytes = bytes.len() - complete_len,
                "truncating torn tail left by an interrupted append"
            );
            file.set_len(complete_len as u64)
                .and_then(|()| file.sync_all())
                .map_err(|err| io_write_error(path, &err))?;
        }

        Ok((
            Self {
                path: path.to_path_buf(),
                file,
                len: complete_len as u64,
            },
            lines,
        ))
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Writes one line. With `durable`, the call returns only after
    /// `sync_data`. On failure the file is cut back to its previous length so
    /// the next append never lands on a partial line.
    pub(crate) fn append_line(&mut self, line: &str, durable: bool) -> Result<(), ProvenanceError> {
        let mut buffer = Vec::with_capacity(line.len() + 1);
        buffer.extend_from_slice(line.as_bytes());
        buffer.push(b'\n');

        let result = self.file.write_all(&buffer).and_then(|()| {
            if durable {
                self.file.sync_data()
            } else {
                Ok(())
            }
        });

        match result {
            Ok(()) => {
                self.len += buffer.len() as u64;
                Ok(())
            }
            Err(err) => {
                if let Err(rollback) = self.file.set_len(self.len) {
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %rollback,
                        "failed to roll back partial append"
                    );
                }
                Err(io_write_error(&self.path, &err))
            }
        }
    }

    pub(crate) fn sync(&mut self) -> Result<(), ProvenanceError> {
        self.file
            .sync_data()
            .map_err(|err| io_write_error(&self.path, &err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn torn_tail_is_truncated_on_open() {
        let dir = must_ok(tempfile::tempdir());
        let path = dir.path().join("log.jsonl");
        must_ok(fs::write(&path, b"{\"a\":1}\n{\"b\":2}\n{\"c\""));

        let (mut log, lines) = must_ok(LogFile::open(&path));
        assert_eq!(lines, vec!["{\"a\":1}".to_string(), "{\"b\":2}".to_string()]);

        must_ok(log.append_line("{\"d\":4}", true));
        let reread = must_ok(read_complete_lines(&path));
        assert_eq!(reread.len(), 3);
        assert_eq!(reread[2], "{\"d\":4}");
    }

    #[test]
    fn readers_ignore_unterminated_lines() {
        let dir = must_ok(tempfile::tempdir());
        let path = dir.path().join("log.jsonl");
        must_ok(fs::write(&path, b"one\ntwo"));
        assert_eq!(must_ok(read_complete_lines(&path)), vec!["one".to_string()]);
        assert!(must_ok(read_complete_lines(&dir.path().join("missing"))).is_empty());
    }

    #[test]
    fn atomic_write_replaces_whole_file() {
        let dir = must_ok(tempfile::tempdir());
        let path = dir.path().join("nested").join("blob");
        must_ok(write_atomic(&path, b"first"));
        must_ok(write_atomic(&path, b"second"));
        assert_eq!(must_ok(fs::read(&path)), b"second");

        let leftovers = must_ok(fs::read_dir(dir.path().join("nested")))
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().contains(".tmp-"))
            .count();
        assert_eq!(leftovers, 0);
    }
}
