use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::process::Command;
use std::sync::Arc;

use parking_lot::Mutex;
use regex::Regex;
use tracing::debug;

use crate::value::FileMode;

use super::{VmFault, VmResult};

// ── File handles ────────────────────────────────────────────────────

/// An open host file. Cloning shares the same stream; closing it through
/// any clone closes it for all.
#[derive(Clone)]
pub struct FileHandle(Arc<FileSlot>);

struct FileSlot {
    path: String,
    mode: FileMode,
    /// `None` once closed.
    stream: Mutex<Option<BufReader<File>>>,
}

impl FileHandle {
    pub fn open(path: &str, mode: FileMode) -> VmResult<Self> {
        let mut options = OpenOptions::new();
        match mode {
            FileMode::Read => options.read(true),
            FileMode::Write => options.write(true).create(true).truncate(true),
            FileMode::Append => options.append(true).create(true),
            FileMode::ReadWrite => options.read(true).write(true).create(true),
        };
        let file = options.open(path).map_err(|source| VmFault::FileIo { path: path.to_string(), source })?;
        debug!(path, %mode, "file opened");
        Ok(FileHandle(Arc::new(FileSlot {
            path: path.to_string(),
            mode,
            stream: Mutex::new(Some(BufReader::new(file))),
        })))
    }

    pub fn path(&self) -> &str {
        &self.0.path
    }

    pub fn mode(&self) -> FileMode {
        self.0.mode
    }

    pub fn is_closed(&self) -> bool {
        self.0.stream.lock().is_none()
    }

    pub fn close(&self) -> VmResult<()> {
        match self.0.stream.lock().take() {
            Some(stream) => {
                let file = stream.into_inner();
                file.sync_all().or_else(ignore_unsupported).map_err(|e| self.io_fault(e))?;
                debug!(path = %self.0.path, "file closed");
                Ok(())
            }
            None => Err(VmFault::DoubleClose { path: self.0.path.clone() }),
        }
    }

    /// Everything from the current position to end of file.
    pub fn read_all(&self) -> VmResult<String> {
        self.with_stream("READ_FILE", FileMode::can_read, |stream| {
            let mut content = String::new();
            stream.read_to_string(&mut content)?;
            Ok(content)
        })
    }

    /// Next line without its terminator; `""` at end of file.
    pub fn read_line(&self) -> VmResult<String> {
        self.with_stream("READ_LINE", FileMode::can_read, |stream| {
            let mut line = String::new();
            stream.read_line(&mut line)?;
            if line.ends_with('\n') {
                line.pop();
                if line.ends_with('\r') {
                    line.pop();
                }
            }
            Ok(line)
        })
    }

    /// Write at the current position (always the end for append handles).
    pub fn write(&self, content: &str) -> VmResult<()> {
        self.with_stream("WRITE_FILE", FileMode::can_write, |stream| {
            realign(stream)?;
            stream.get_mut().write_all(content.as_bytes())
        })
    }

    /// Write at the end of the file, whatever the current position.
    pub fn append(&self, content: &str) -> VmResult<()> {
        self.with_stream("APPEND_FILE", FileMode::can_write, |stream| {
            stream.seek(SeekFrom::End(0))?;
            stream.get_mut().write_all(content.as_bytes())
        })
    }

    fn with_stream<T>(
        &self,
        op: &'static str,
        allowed: fn(FileMode) -> bool,
        f: impl FnOnce(&mut BufReader<File>) -> io::Result<T>,
    ) -> VmResult<T> {
        if !allowed(self.0.mode) {
            return Err(VmFault::FileModeMismatch { op, path: self.0.path.clone(), mode: self.0.mode });
        }
        let mut guard = self.0.stream.lock();
        let stream = guard.as_mut().ok_or_else(|| VmFault::UseAfterClose { path: self.0.path.clone() })?;
        f(stream).map_err(|e| self.io_fault(e))
    }

    fn io_fault(&self, source: io::Error) -> VmFault {
        VmFault::FileIo { path: self.0.path.clone(), source }
    }
}

/// Drop read-ahead so the OS position matches what the reader has consumed.
fn realign(stream: &mut BufReader<File>) -> io::Result<()> {
    let pos = stream.stream_position()?;
    stream.seek(SeekFrom::Start(pos))?;
    Ok(())
}

fn ignore_unsupported(e: io::Error) -> io::Result<()> {
    // Pipes and some special files cannot be synced.
    if matches!(e.kind(), io::ErrorKind::InvalidInput | io::ErrorKind::Unsupported) { Ok(()) } else { Err(e) }
}

impl PartialEq for FileHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("path", &self.0.path)
            .field("mode", &self.0.mode)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ── External processes ──────────────────────────────────────────────

/// Run `command` through the platform shell and wait for it. Output goes
/// wherever the VM's own stdout/stderr go.
pub(crate) fn exec_command(command: &str) -> VmResult<i64> {
    let fault = |source: io::Error| VmFault::ProcessExec { command: command.to_string(), source };
    let status = shell(command).status().map_err(fault)?;
    debug!(command, %status, "process finished");
    status
        .code()
        .map(i64::from)
        .ok_or_else(|| fault(io::Error::other("terminated by signal")))
}

#[cfg(windows)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.args(["/C", command]);
    cmd
}

#[cfg(not(windows))]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.args(["-c", command]);
    cmd
}

// ── Regex ───────────────────────────────────────────────────────────

/// Compiled patterns of one execution context, keyed by the pattern as written.
#[derive(Debug, Default)]
pub(crate) struct RegexCache {
    compiled: HashMap<String, Regex>,
}

impl RegexCache {
    /// True when the pattern matches the whole subject, not just a substring.
    pub fn is_match(&mut self, subject: &str, pattern: &str) -> VmResult<bool> {
        if let Some(re) = self.compiled.get(pattern) {
            return Ok(re.is_match(subject));
        }
        let re = Regex::new(&format!("^(?:{pattern})$"))
            .map_err(|source| VmFault::Regex { pattern: pattern.to_string(), source })?;
        let matched = re.is_match(subject);
        self.compiled.insert(pattern.to_string(), re);
        Ok(matched)
    }
}
