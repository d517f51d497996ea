//! Marker-framed completion detection over an interactive shell stream.
//!
//! An interactive shell delivers one continuous byte stream with no command
//! boundaries and no exit status. The [`CompletionParser`] restores both by
//! writing, after every command, a statement that prints a fresh marker
//! followed by `$?`:
//!
//! ```text
//! ls /srv
//! echo "__MCP_DONE__7f3""c...$?"
//! ```
//!
//! The statement splits the marker across two adjacent quoted words, so the
//! shell prints the marker contiguously while an echo of the statement itself
//! never contains it.
//!
//! Incoming chunks are appended to a buffer that is re-scanned on every
//! [`feed`](CompletionParser::feed). A marker split across chunks is found as
//! soon as the rest of it arrives, and completion is reported only once the
//! newline that terminates the exit status has been seen.

use thiserror::Error;
use uuid::Uuid;

/// Prefix of the per-command completion marker.
pub const DONE_PREFIX: &str = "__MCP_DONE__";

/// Prefix of the sentinel printed once shell priming has finished.
pub const READY_PREFIX: &str = "__MCP_READY__";

/// Default cap on bytes buffered while waiting for a marker (32 MiB).
pub const DEFAULT_MAX_BUFFER_BYTES: usize = 32 * 1024 * 1024;

const BRACKETED_PASTE_ON: &str = "\x1b[?2004h";
const BRACKETED_PASTE_OFF: &str = "\x1b[?2004l";

/// A unique token that delimits one command's output in the stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Marker {
    text: String,
}

impl Marker {
    /// Creates a marker from a prefix and an explicit token.
    pub fn new(prefix: &str, token: &str) -> Self {
        Self {
            text: format!("{prefix}{token}"),
        }
    }

    /// Creates a fresh completion marker.
    pub fn done() -> Self {
        Self::new(DONE_PREFIX, &fresh_token())
    }

    /// Creates a fresh readiness sentinel.
    pub fn ready() -> Self {
        Self::new(READY_PREFIX, &fresh_token())
    }

    /// Returns the marker text as printed by the shell.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    fn as_bytes(&self) -> &[u8] {
        self.text.as_bytes()
    }

    /// Returns a shell statement that prints the marker, optionally followed
    /// by the last exit status, and a newline.
    pub fn echo_statement(&self, with_status: bool) -> String {
        let mid = self.text.len() / 2;
        let (head, tail) = self.text.split_at(mid);
        let status = if with_status { "$?" } else { "" };
        format!("echo \"{head}\"\"{tail}{status}\"")
    }
}

impl std::fmt::Display for Marker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}

fn fresh_token() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Bytes to write to the shell for one submitted command.
#[derive(Debug, Clone)]
pub struct Submission {
    /// Marker that will terminate this command's output.
    pub marker: Marker,
    /// Command text followed by the marker statement, newline-terminated.
    pub payload: String,
}

/// Result of one completed command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// Everything the command printed, with carriage returns removed and
    /// trailing whitespace trimmed.
    pub output: String,
    /// Exit status reported by the remote shell.
    pub exit_code: i32,
}

impl CommandOutput {
    /// Returns true if the remote command exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Errors raised while scanning the stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The buffer grew past its cap without the expected marker.
    #[error("no completion marker within {limit} buffered bytes")]
    BufferOverflow {
        /// The configured cap.
        limit: usize,
    },
}

/// Incremental parser turning a raw shell stream into command results.
#[derive(Debug)]
pub struct CompletionParser {
    buffer: Vec<u8>,
    expected: Option<Marker>,
    max_buffer_bytes: usize,
    /// Prefix of `buffer` already searched for the current marker or,
    /// once `marker_at` is set, for the status newline.
    scanned: usize,
    /// Offset of the awaited marker once it has been seen.
    marker_at: Option<usize>,
}

impl Default for CompletionParser {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionParser {
    /// Creates a parser with the default buffer cap.
    pub fn new() -> Self {
        Self::with_max_buffer(DEFAULT_MAX_BUFFER_BYTES)
    }

    /// Creates a parser that fails once more than `max_buffer_bytes` are
    /// buffered while a marker is expected.
    pub fn with_max_buffer(max_buffer_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            expected: None,
            max_buffer_bytes: max_buffer_bytes.max(1),
            scanned: 0,
            marker_at: None,
        }
    }

    /// Prepares `command` for submission under a fresh marker.
    pub fn submit(&mut self, command: &str) -> Submission {
        self.submit_with_marker(command, Marker::done())
    }

    /// Prepares `command` for submission under an explicit marker.
    pub fn submit_with_marker(&mut self, command: &str, marker: Marker) -> Submission {
        let command = command.trim_end_matches(['\r', '\n']);
        let payload = format!("{command}\n{}\n", marker.echo_statement(true));
        self.expected = Some(marker.clone());
        self.reset_scan();
        Submission { marker, payload }
    }

    /// Starts waiting for `marker` without submitting a command.
    pub fn expect(&mut self, marker: Marker) {
        self.expected = Some(marker);
        self.reset_scan();
    }

    /// Returns the marker currently awaited, if any.
    pub fn pending(&self) -> Option<&Marker> {
        self.expected.as_ref()
    }

    /// Returns data that arrived after the last completion.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// Drops all buffered data and any awaited marker.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.expected = None;
        self.reset_scan();
    }

    fn reset_scan(&mut self) {
        self.scanned = 0;
        self.marker_at = None;
    }

    /// Appends a chunk and scans the new bytes for the awaited marker.
    ///
    /// Returns `Ok(None)` while more data is needed.
    pub fn feed(&mut self, chunk: impl AsRef<[u8]>) -> Result<Option<CommandOutput>, ParseError> {
        self.buffer.extend_from_slice(chunk.as_ref());

        if let Some(done) = self.try_extract() {
            return Ok(Some(done));
        }

        if self.buffer.len() > self.max_buffer_bytes {
            if self.expected.is_some() {
                return Err(ParseError::BufferOverflow {
                    limit: self.max_buffer_bytes,
                });
            }
            // Idle output from background jobs: keep only the newest bytes.
            let excess = self.buffer.len() - self.max_buffer_bytes;
            self.buffer.drain(..excess);
            self.scanned = self.scanned.saturating_sub(excess);
        }

        Ok(None)
    }

    /// Extracts a completion if the awaited marker and its terminating
    /// newline are both buffered.
    ///
    /// Only bytes not examined by an earlier call are searched, so feeding a
    /// long output in small chunks stays linear.
    pub fn try_extract(&mut self) -> Option<CommandOutput> {
        let needle = self.expected.as_ref()?.as_bytes();
        let start = match self.marker_at {
            Some(start) => start,
            None => {
                // A marker may straddle the previous scan boundary.
                let from = self.scanned.saturating_sub(needle.len().saturating_sub(1));
                match find(&self.buffer[from..], needle) {
                    Some(at) => {
                        self.marker_at = Some(from + at);
                        self.scanned = from + at + needle.len();
                        from + at
                    }
                    None => {
                        self.scanned = self.buffer.len();
                        return None;
                    }
                }
            }
        };

        let status_start = start + needle.len();
        let from = self.scanned.max(status_start);
        let Some(offset) = self.buffer[from..].iter().position(|&b| b == b'\n') else {
            self.scanned = self.buffer.len();
            return None;
        };
        let newline = from + offset;

        let status = String::from_utf8_lossy(&self.buffer[status_start..newline]);
        let exit_code = status.trim().parse::<i32>().unwrap_or(0);
        let output = clean_output(&self.buffer[..start]);

        self.buffer.drain(..=newline);
        self.expected = None;
        self.reset_scan();

        Some(CommandOutput { output, exit_code })
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Strips terminal noise from raw command output.
fn clean_output(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw)
        .replace('\r', "")
        .replace(BRACKETED_PASTE_ON, "")
        .replace(BRACKETED_PASTE_OFF, "");

    let kept: Vec<&str> = text
        .split('\n')
        .filter(|line| !line.contains(READY_PREFIX))
        .collect();

    kept.join("\n").trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser_for(token: &str) -> CompletionParser {
        let mut parser = CompletionParser::new();
        parser.expect(Marker::new(DONE_PREFIX, token));
        parser
    }

    #[test]
    fn test_marker_split_across_chunks() {
        let mut parser = parser_for("tok");

        assert_eq!(parser.feed("abc__MCP_DO").unwrap(), None);
        let done = parser.feed("NE__tok42\nrest").unwrap().unwrap();

        assert_eq!(done.output, "abc");
        assert_eq!(done.exit_code, 42);
        assert_eq!(parser.buffered(), b"rest");
        assert!(parser.pending().is_none());
    }

    #[test]
    fn test_marker_straddling_scanned_prefix() {
        let mut parser = parser_for("tok");

        assert_eq!(parser.feed("x".repeat(100)).unwrap(), None);
        assert_eq!(parser.feed("\n__MCP_").unwrap(), None);
        assert_eq!(parser.feed("DONE__t").unwrap(), None);
        assert_eq!(parser.feed("ok").unwrap(), None);
        assert_eq!(parser.feed("1").unwrap(), None);
        let done = parser.feed("7\nnext").unwrap().unwrap();

        assert_eq!(done.output, "x".repeat(100));
        assert_eq!(done.exit_code, 17);
        assert_eq!(parser.buffered(), b"next");
    }

    #[test]
    fn test_rescans_leftover_for_next_marker() {
        let mut parser = parser_for("one");
        let first = parser
            .feed("a\n__MCP_DONE__one0\nb\n__MCP_DONE__two3\n")
            .unwrap()
            .unwrap();
        assert_eq!(first.output, "a");

        parser.expect(Marker::new(DONE_PREFIX, "two"));
        let second = parser.try_extract().unwrap();
        assert_eq!((second.output.as_str(), second.exit_code), ("b", 3));
    }

    #[test]
    fn test_large_output_in_small_chunks_is_linear() {
        const TOTAL: usize = 8 * 1024 * 1024;
        const CHUNK: usize = 4 * 1024;

        let mut parser = CompletionParser::with_max_buffer(TOTAL * 2);
        parser.expect(Marker::new(DONE_PREFIX, "big"));
        let chunk = vec![b'x'; CHUNK];

        let started = std::time::Instant::now();
        for _ in 0..TOTAL / CHUNK {
            assert_eq!(parser.feed(&chunk).unwrap(), None);
        }
        let done = parser.feed("\n__MCP_DONE__big0\n").unwrap().unwrap();
        let elapsed = started.elapsed();

        assert_eq!(done.output.len(), TOTAL);
        assert!(
            elapsed < std::time::Duration::from_secs(10),
            "feeding took {elapsed:?}"
        );
    }

    #[test]
    fn test_waits_for_status_newline() {
        let mut parser = parser_for("tok");

        assert_eq!(parser.feed("out\n__MCP_DONE__tok4").unwrap(), None);
        let done = parser.feed("2\r\n").unwrap().unwrap();
        assert_eq!(done.output, "out");
        assert_eq!(done.exit_code, 42);
    }

    #[test]
    fn test_empty_output() {
        let mut parser = parser_for("tok");
        let done = parser.feed("__MCP_DONE__tok0\r\n").unwrap().unwrap();
        assert_eq!(done.output, "");
        assert!(done.success());
    }

    #[test]
    fn test_unparseable_status_defaults_to_zero() {
        let mut parser = parser_for("tok");
        let done = parser.feed("x\n__MCP_DONE__tok$?\n").unwrap().unwrap();
        assert_eq!(done.output, "x");
        assert_eq!(done.exit_code, 0);

        let mut parser = parser_for("tok");
        let done = parser.feed("__MCP_DONE__tok\n").unwrap().unwrap();
        assert_eq!(done.exit_code, 0);
    }

    #[test]
    fn test_strips_carriage_returns_and_noise() {
        let mut parser = parser_for("tok");
        let raw = "\x1b[?2004lline one\r\nline two  \r\n__MCP_READY__abc\r\n__MCP_DONE__tok1\r\n";
        let done = parser.feed(raw).unwrap().unwrap();
        assert_eq!(done.output, "line one\nline two");
        assert_eq!(done.exit_code, 1);
    }

    #[test]
    fn test_no_marker_no_completion() {
        let mut parser = CompletionParser::new();
        assert_eq!(parser.feed("__MCP_DONE__tok0\n").unwrap(), None);
        assert_eq!(parser.buffered().len(), 17);
    }

    #[test]
    fn test_other_marker_is_ignored() {
        let mut parser = parser_for("mine");
        assert_eq!(parser.feed("__MCP_DONE__theirs0\n").unwrap(), None);
        let done = parser.feed("__MCP_DONE__mine3\n").unwrap().unwrap();
        assert_eq!(done.output, "__MCP_DONE__theirs0");
        assert_eq!(done.exit_code, 3);
    }

    #[test]
    fn test_submit_payload() {
        let mut parser = CompletionParser::new();
        let marker = Marker::new(DONE_PREFIX, "abcd");
        let submission = parser.submit_with_marker("ls -la\n", marker.clone());

        assert_eq!(
            submission.payload,
            "ls -la\necho \"__MCP_DO\"\"NE__abcd$?\"\n"
        );
        assert!(!submission.payload.contains(marker.as_str()));
        assert_eq!(parser.pending(), Some(&marker));
    }

    #[test]
    fn test_fresh_markers_are_unique() {
        let a = Marker::done();
        let b = Marker::done();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with(DONE_PREFIX));
        assert!(Marker::ready().as_str().starts_with(READY_PREFIX));
    }

    #[test]
    fn test_ready_sentinel_statement_has_no_status() {
        let marker = Marker::new(READY_PREFIX, "r1");
        let stmt = marker.echo_statement(false);
        assert!(!stmt.contains("$?"));
        assert_eq!(stmt.replace('"', "").trim_start_matches("echo "), marker.as_str());
    }

    #[test]
    fn test_overflow_while_waiting() {
        let mut parser = CompletionParser::with_max_buffer(16);
        parser.expect(Marker::new(DONE_PREFIX, "tok"));
        let err = parser.feed("0123456789abcdefXYZ").unwrap_err();
        assert_eq!(err, ParseError::BufferOverflow { limit: 16 });
    }

    #[test]
    fn test_idle_buffer_keeps_newest_bytes() {
        let mut parser = CompletionParser::with_max_buffer(4);
        assert_eq!(parser.feed("abcdefgh").unwrap(), None);
        assert_eq!(parser.buffered(), b"efgh");
    }

    #[test]
    fn test_leftover_belongs_to_next_command() {
        let mut parser = parser_for("one");
        parser.feed("a\n__MCP_DONE__one0\nbg job says hi\n").unwrap().unwrap();

        parser.expect(Marker::new(DONE_PREFIX, "two"));
        let done = parser.feed("b\n__MCP_DONE__two0\n").unwrap().unwrap();
        assert_eq!(done.output, "bg job says hi\nb");
    }

    #[test]
    fn test_clear() {
        let mut parser = parser_for("tok");
        parser.feed("partial").unwrap();
        parser.clear();
        assert!(parser.buffered().is_empty());
        assert!(parser.pending().is_none());
    }
}
