//! Command completion markers for interactive shells.
//!
//! After every command the terminal writes a marker command that prints
//! `__AGENTBOX_<token>__:<exit code>`. The marker is emitted by `printf` from
//! two separately quoted pieces, so a tty echo of the marker line itself never
//! contains the contiguous needle.

use uuid::Uuid;

const PREFIX: &str = "__AGENTBOX_";

/// A single-use completion marker.
#[derive(Debug, Clone)]
pub(crate) struct Sentinel {
    token: String,
}

impl Sentinel {
    /// Creates a marker with a fresh random token.
    pub(crate) fn new() -> Self {
        Self {
            token: Uuid::new_v4().simple().to_string(),
        }
    }

    /// Shell command that prints the marker and the previous exit status.
    pub(crate) fn command(&self) -> String {
        format!(
            "printf '%s%s__:%s\\n' '{PREFIX}' '{}' \"$?\"",
            self.token
        )
    }

    fn needle(&self) -> Vec<u8> {
        format!("{PREFIX}{}__:", self.token).into_bytes()
    }
}

/// Accumulates terminal output until a marker line shows up.
#[derive(Debug)]
pub(crate) struct SentinelScanner {
    needle: Vec<u8>,
    /// Bytes that may still contain the start of the needle.
    pending: Vec<u8>,
    output: Vec<u8>,
    limit: usize,
    truncated: bool,
}

/// Output captured before a marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Captured {
    pub output: String,
    pub truncated: bool,
}

impl SentinelScanner {
    /// Watches for `sentinel`, keeping at most `limit` bytes of output.
    pub(crate) fn new(sentinel: &Sentinel, limit: usize) -> Self {
        Self {
            needle: sentinel.needle(),
            pending: Vec::new(),
            output: Vec::new(),
            limit,
            truncated: false,
        }
    }

    /// Feeds a chunk of output.
    ///
    /// Returns `Some(exit_code)` once the full marker line has been seen. The
    /// exit code is `None` if the status field was not a number.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Option<Option<i32>> {
        self.pending.extend_from_slice(chunk);

        if let Some(start) = find(&self.pending, &self.needle) {
            let status_start = start + self.needle.len();
            let newline = self.pending[status_start..].iter().position(|b| *b == b'\n')?;
            let status = String::from_utf8_lossy(&self.pending[status_start..status_start + newline])
                .trim()
                .parse()
                .ok();
            let before: Vec<u8> = self.pending.drain(..start).collect();
            self.keep(&before);
            self.pending.clear();
            return Some(status);
        }

        let hold = self.needle.len().saturating_sub(1);
        if self.pending.len() > hold {
            let flushed: Vec<u8> = self.pending.drain(..self.pending.len() - hold).collect();
            self.keep(&flushed);
        }
        None
    }

    /// Switches to a new marker, treating everything buffered so far as output.
    pub(crate) fn rearm(&mut self, sentinel: &Sentinel) {
        let pending = std::mem::take(&mut self.pending);
        self.keep(&pending);
        self.needle = sentinel.needle();
    }

    /// Returns the output captured so far, with tty line endings normalized.
    pub(crate) fn finish(mut self) -> Captured {
        let pending = std::mem::take(&mut self.pending);
        self.keep(&pending);
        let text = String::from_utf8_lossy(&self.output).replace("\r\n", "\n");
        Captured {
            output: text,
            truncated: self.truncated,
        }
    }

    fn keep(&mut self, bytes: &[u8]) {
        let room = self.limit.saturating_sub(self.output.len());
        if bytes.len() > room {
            self.truncated = true;
        }
        self.output.extend_from_slice(&bytes[..bytes.len().min(room)]);
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
