//! Device log archive, daily rotation, and hand-off of rotated archives.
//!
//! The archive is a plain text file. Rotation keeps a fixed number of
//! generations next to it (`archive.1` is the newest, `archive.7` the
//! oldest by default).

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Default number of rotated generations kept.
pub const DEFAULT_GENERATIONS: u32 = 7;

/// Sink for device log chunks.
pub trait LogArchive: Send {
    /// Appends one payload under `tag`.
    fn append(&mut self, tag: &str, payload: &[u8]) -> io::Result<()>;
}

/// Rotates the archive.
pub trait LogRotation: Send {
    /// Rotates and returns the path of the newest rotated generation, if the
    /// live file existed.
    fn rotate(&mut self) -> io::Result<Option<PathBuf>>;
}

/// Receives rotated archives, e.g. to mail them off the host.
pub trait ArchiveHandoff: Send {
    /// Hands over a completed archive file.
    fn hand_off(&mut self, path: &Path) -> Result<()>;
}

/// Appends log chunks to a text file, one line per chunk.
#[derive(Debug, Clone)]
pub struct FileLogArchive {
    path: PathBuf,
}

impl FileLogArchive {
    /// Creates an archive writing to `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the archive path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogArchive for FileLogArchive {
    fn append(&mut self, tag: &str, payload: &[u8]) -> io::Result<()> {
        // Reopened per chunk so rotation never leaves us writing to a renamed file
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        let text = String::from_utf8_lossy(payload);
        let text = text.trim_end_matches(['\0', '\r', '\n']);
        writeln!(
            file,
            "{} {}: {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            tag,
            text
        )
    }
}

/// Rotates a file through numbered generations.
#[derive(Debug, Clone)]
pub struct FileRotator {
    path: PathBuf,
    generations: u32,
}

impl FileRotator {
    /// Creates a rotator for `path` keeping `generations` old copies.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, generations: u32) -> Self {
        Self {
            path: path.into(),
            generations: generations.max(1),
        }
    }

    /// Returns the path of generation `n` (`archive.n`).
    #[must_use]
    pub fn generation(&self, n: u32) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    }
}

impl LogRotation for FileRotator {
    fn rotate(&mut self) -> io::Result<Option<PathBuf>> {
        for n in (1..=self.generations).rev() {
            let from = self.generation(n);
            if !from.exists() {
                continue;
            }
            if n == self.generations {
                fs::remove_file(&from)?;
            } else {
                fs::rename(&from, self.generation(n + 1))?;
            }
        }

        if !self.path.exists() {
            tracing::debug!("nothing to rotate at {}", self.path.display());
            return Ok(None);
        }

        let newest = self.generation(1);
        fs::copy(&self.path, &newest)?;
        OpenOptions::new()
            .write(true)
            .open(&self.path)?
            .set_len(0)?;

        tracing::info!("rotated {}", self.path.display());
        Ok(Some(newest))
    }
}

/// Hands archives to an external program, appending the path as the last
/// argument. The program runs detached.
#[derive(Debug, Clone)]
pub struct CommandHandoff {
    program: String,
    args: Vec<String>,
}

impl CommandHandoff {
    /// Builds a hand-off from a command line (`program` followed by its
    /// fixed arguments). Returns `None` for an empty command line.
    #[must_use]
    pub fn from_command_line(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

impl ArchiveHandoff for CommandHandoff {
    fn hand_off(&mut self, path: &Path) -> Result<()> {
        tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(path)
            .spawn()
            .map(|_| ())
            .map_err(|e| Error::Command {
                program: self.program.clone(),
                reason: e.to_string(),
            })?;
        tracing::info!("handed {} to {}", path.display(), self.program);
        Ok(())
    }
}

/// In-memory archive for tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct MemoryArchive {
    pub entries: Vec<(String, Vec<u8>)>,
}

#[cfg(test)]
impl LogArchive for MemoryArchive {
    fn append(&mut self, tag: &str, payload: &[u8]) -> io::Result<()> {
        self.entries.push((tag.to_owned(), payload.to_vec()));
        Ok(())
    }
}
