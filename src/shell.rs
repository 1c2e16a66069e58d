//! Guest-serial protocol plumbing shared by every worker that talks to
//! the emulator over its Unix-domain console sockets.
//!
//! The accumulator is an append-only byte buffer with a `Notify` so
//! waiters wake on new data instead of busy-polling a bounded sleep/read
//! loop.

use once_cell::sync::Lazy;
use regex::bytes::Regex;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::Mutex;
use tokio::sync::Notify;

/// Trailing byte sequence that marks the guest root shell as ready for
/// the next command: a `#` immediately following a newline, once ANSI
/// escapes are stripped.
pub const PROMPT_SENTINEL: u8 = b'#';

static ANSI_ESCAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?-u)(?:\x1B[@-Z\\-_]|[\x80-\x9A\x9C-\x9F]|(?:\x1B\[|\x9B)[0-?]*[ -/]*[@-~])")
        .expect("static ANSI escape pattern is valid")
});

/// Strip ANSI/terminal escape sequences from a byte slice.
pub fn strip_ansi(data: &[u8]) -> Vec<u8> {
    ANSI_ESCAPE.replace_all(data, &b""[..]).into_owned()
}

/// An append-only byte accumulator. Exactly one background reader task
/// appends to each instance; any number of tasks may read it.
#[derive(Debug, Default)]
pub struct ByteAccumulator {
    buf: Mutex<Vec<u8>>,
    notify: Notify,
}

impl ByteAccumulator {
    pub fn new() -> Self {
        Self {
            buf: Mutex::new(Vec::new()),
            notify: Notify::new(),
        }
    }

    pub async fn push(&self, data: &[u8]) {
        let mut guard = self.buf.lock().await;
        guard.extend_from_slice(data);
        drop(guard);
        self.notify.notify_waiters();
    }

    pub async fn snapshot(&self) -> Vec<u8> {
        self.buf.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.buf.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.notify.notified()
    }
}

/// A single direction of a Unix-domain socket connection to the
/// emulator's serial or monitor console.
#[derive(Debug)]
pub struct SocketLink {
    writer: OwnedWriteHalf,
}

impl SocketLink {
    pub fn new(writer: OwnedWriteHalf) -> Self {
        Self { writer }
    }

    pub async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(data).await?;
        self.writer.flush().await
    }

    pub async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
        self.write_all(&bytes).await
    }
}

/// Bounded poll for a filesystem path (the emulator's console sockets)
/// to come into existence.
pub async fn wait_exists(path: &Path, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if path.exists() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Returns `true` once the bytes appended to `buffer` since `since` end,
/// after ANSI stripping, in a newline followed by the prompt sentinel.
/// This is the critical-section proxy: every worker that writes to the
/// serial console holds `session.serial`'s lock across its write and the
/// matching call to this function, which is what makes "one writer at a
/// time" a structural guarantee rather than a convention.
pub async fn wait_shell_prompt(buffer: &ByteAccumulator, since: usize, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        let snapshot = buffer.snapshot().await;
        if snapshot.len() > since && prompt_matches(&strip_ansi(&snapshot[since..])) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        let wait = remaining.min(Duration::from_millis(200));
        let _ = tokio::time::timeout(wait, buffer.notified()).await;
    }
}

fn prompt_matches(window: &[u8]) -> bool {
    if !window.contains(&b'\n') {
        return false;
    }
    let trimmed = {
        let mut end = window.len();
        while end > 0 && (window[end - 1] == b' ' || window[end - 1] == b'\r') {
            end -= 1;
        }
        &window[..end]
    };
    trimmed.last() == Some(&PROMPT_SENTINEL)
}

/// Returns `true` the first time the output appended since `since` does
/// not contain `needle`, or `false` on timeout — used to wait for a probe
/// process (dex2oat, bootanimation) to stop appearing in a `ps` listing.
pub async fn run_and_not_expect(
    link: &mut SocketLink,
    buffer: &ByteAccumulator,
    command: &[u8],
    needle: &[u8],
    poll_interval: Duration,
    timeout: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        let since = buffer.len().await;
        if link.write_all(command).await.is_err() {
            return false;
        }
        tokio::time::sleep(poll_interval).await;
        let snapshot = buffer.snapshot().await;
        let window = strip_ansi(snapshot.get(since..).unwrap_or(&[]));
        if !contains_subslice(&window, needle) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
    }
}

/// Returns `true` once `needle` appears in the bytes appended since
/// `since`, within `timeout` — used by the package-manager readiness
/// probe.
pub async fn wait_for_needle(buffer: &ByteAccumulator, since: usize, needle: &[u8], timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        let snapshot = buffer.snapshot().await;
        if contains_subslice(snapshot.get(since..).unwrap_or(&[]), needle) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        let wait = remaining.min(Duration::from_millis(200));
        let _ = tokio::time::timeout(wait, buffer.notified()).await;
    }
}

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() || haystack.len() < needle.len() {
        return needle.is_empty();
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}
