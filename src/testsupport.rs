//! Shared test fixtures for channel, transfer and registry test modules.
//!
//! `FakeShell` stands in for a pseudo-terminal: it echoes typed lines, prints
//! prompts, and answers the handful of commands the frame driver and the
//! transfer engine issue from an in-memory file map. Tests can then exercise
//! framing and transfer logic without spawning a real shell.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::channel::{ChannelIo, ReadOutcome};
use crate::error::SessionError;

static TEST_DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Temporary directory fixture with best-effort cleanup.
#[derive(Debug)]
pub struct TestTempDir {
    path: PathBuf,
}

impl TestTempDir {
    /// Create a unique temporary directory with a readable prefix.
    pub fn new(prefix: &str) -> Self {
        let suffix = TEST_DIR_COUNTER.fetch_add(1, Ordering::Relaxed);
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let dir = std::env::temp_dir().join(format!("shellrelay-{prefix}-{millis}-{suffix}"));
        fs::create_dir_all(&dir).expect("failed to create temporary fixture directory");
        Self { path: dir }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn child(&self, relative: &str) -> PathBuf {
        self.path.join(relative)
    }

    /// Write bytes to a child path, creating parent directories as needed.
    pub fn write_bytes(&self, relative: &str, content: &[u8]) -> PathBuf {
        let path = self.child(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("failed to create parent directories for fixture");
        }
        fs::write(&path, content).expect("failed to write fixture file");
        path
    }
}

impl Drop for TestTempDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

/// Largest chunk handed out by one `read_chunk`, so scanners see split reads.
const FAKE_READ_CHUNK: usize = 1024;

#[derive(Debug)]
struct Heredoc {
    path: String,
    terminator: String,
    body: String,
}

#[derive(Debug)]
struct FakeState {
    prompt: String,
    echo_input: bool,
    outbox: Vec<u8>,
    pending: Vec<u8>,
    canned: HashMap<String, String>,
    files: BTreeMap<String, Vec<u8>>,
    missing_tools: HashSet<String>,
    heredoc: Option<Heredoc>,
    history: Vec<String>,
    swallow_end_marker: bool,
    corrupt_checksums: bool,
    closed: bool,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            prompt: "$ ".into(),
            echo_input: true,
            outbox: Vec::new(),
            pending: Vec::new(),
            canned: HashMap::new(),
            files: BTreeMap::new(),
            missing_tools: HashSet::new(),
            heredoc: None,
            history: Vec::new(),
            swallow_end_marker: false,
            corrupt_checksums: false,
            closed: false,
        }
    }
}

/// In-memory interactive shell implementing [`ChannelIo`].
///
/// Clones share state, so a test can keep a handle while a session owns
/// another.
#[derive(Debug, Clone, Default)]
pub struct FakeShell {
    state: Arc<Mutex<FakeState>>,
}

impl FakeShell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prompt(self, prompt: &str) -> Self {
        self.lock().prompt = prompt.to_string();
        self
    }

    /// Turn terminal echo of typed lines on or off (on by default).
    pub fn with_echo(self, echo: bool) -> Self {
        self.lock().echo_input = echo;
        self
    }

    /// Answer `command` (exact line) with `output`.
    pub fn on_command(&self, command: &str, output: &str) {
        self.lock()
            .canned
            .insert(command.to_string(), output.to_string());
    }

    /// Queue bytes as if the shell printed them unprompted.
    pub fn push_raw(&self, bytes: &[u8]) {
        self.lock().outbox.extend_from_slice(bytes);
    }

    /// Stop printing end markers, so frames can only end by timeout.
    pub fn swallow_end_marker(&self) {
        self.lock().swallow_end_marker = true;
    }

    /// Make every checksum tool report a wrong digest.
    pub fn corrupt_checksums(&self) {
        self.lock().corrupt_checksums = true;
    }

    /// Behave as if `tool` is not installed.
    pub fn without_tool(&self, tool: &str) {
        self.lock().missing_tools.insert(tool.to_string());
    }

    pub fn close(&self) {
        self.lock().closed = true;
    }

    pub fn put_file(&self, path: &str, bytes: &[u8]) {
        self.lock().files.insert(path.to_string(), bytes.to_vec());
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().files.get(path).cloned()
    }

    pub fn file_paths(&self) -> Vec<String> {
        self.lock().files.keys().cloned().collect()
    }

    /// Every line the shell executed, in order.
    pub fn history(&self) -> Vec<String> {
        self.lock().history.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake shell state poisoned")
    }
}

#[async_trait]
impl ChannelIo for FakeShell {
    async fn write_all(&self, data: &[u8]) -> Result<(), SessionError> {
        let mut state = self.lock();
        if state.closed {
            return Err(SessionError::ConnectionLost("fake shell closed".into()));
        }
        state.pending.extend_from_slice(data);
        while let Some(pos) = state.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = state.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]).to_string();
            state.process_line(&line);
        }
        Ok(())
    }

    async fn read_chunk(&self, wait: Duration) -> ReadOutcome {
        if let Some(outcome) = self.try_read() {
            return outcome;
        }
        if wait.is_zero() {
            return ReadOutcome::Idle;
        }
        tokio::time::sleep(wait.min(Duration::from_millis(5))).await;
        self.try_read().unwrap_or(ReadOutcome::Idle)
    }
}

impl FakeShell {
    fn try_read(&self) -> Option<ReadOutcome> {
        let mut state = self.lock();
        if !state.outbox.is_empty() {
            let take = state.outbox.len().min(FAKE_READ_CHUNK);
            return Some(ReadOutcome::Data(state.outbox.drain(..take).collect()));
        }
        state.closed.then_some(ReadOutcome::Closed)
    }
}

impl FakeState {
    fn emit(&mut self, text: &str) {
        let text = text.replace("\r\n", "\n").replace('\n', "\r\n");
        self.outbox.extend_from_slice(text.as_bytes());
    }

    fn process_line(&mut self, line: &str) {
        if self.echo_input {
            self.emit(&format!("{line}\n"));
        }
        if let Some(mut heredoc) = self.heredoc.take() {
            if line.trim() == heredoc.terminator {
                match STANDARD.decode(heredoc.body.as_bytes()) {
                    Ok(bytes) => {
                        self.files.insert(heredoc.path, bytes);
                    }
                    Err(_) => self.emit("base64: invalid input\n"),
                }
                let prompt = self.prompt.clone();
                self.emit(&prompt);
            } else {
                heredoc.body.push_str(line.trim());
                self.heredoc = Some(heredoc);
                self.emit("> ");
            }
            return;
        }

        self.history.push(line.to_string());
        let output = match self.canned.get(line) {
            Some(canned) => canned.clone(),
            None => self.run(line),
        };
        self.emit(&output);
        if self.heredoc.is_none() {
            let prompt = self.prompt.clone();
            self.emit(&prompt);
        } else {
            self.emit("> ");
        }
    }

    fn run(&mut self, line: &str) -> String {
        let words = shell_words(line);
        let Some(tool) = words.first().map(String::as_str) else {
            return String::new();
        };
        let w = |i: usize| words.get(i).map(String::as_str).unwrap_or_default();
        if self.missing_tools.contains(tool) {
            return if line.contains("2>/dev/null") {
                String::new()
            } else {
                format!("sh: 1: {tool}: not found\n")
            };
        }

        match tool {
            "echo" => {
                let text = words[1..].join(" ");
                if self.swallow_end_marker && text.starts_with("SRE_") {
                    String::new()
                } else {
                    format!("{text}\n")
                }
            }
            "printf" if w(1) == "%s" && w(3) == "|" && w(4) == "base64" => {
                self.decode_into(w(2).as_bytes(), w(7))
            }
            "printf" if w(1) == "%s" && w(3) == ">>" => {
                let chunk = w(2).as_bytes().to_vec();
                self.files.entry(w(4).to_string()).or_default().extend(chunk);
                String::new()
            }
            ":" if w(1) == ">" => {
                self.files.insert(w(2).to_string(), Vec::new());
                String::new()
            }
            "base64" if w(1) == "-d" && w(2) == ">" && w(4) == "<<" => {
                self.heredoc = Some(Heredoc {
                    path: w(3).to_string(),
                    terminator: w(5).to_string(),
                    body: String::new(),
                });
                String::new()
            }
            "base64" if w(1) == "-d" && w(3) == ">" => {
                let Some(staged) = self.files.get(w(2)).cloned() else {
                    return format!("base64: {}: No such file or directory\n", w(2));
                };
                let output = self.decode_into(&staged, w(4));
                if w(5) == "&&" && w(6) == "rm" {
                    self.files.remove(w(8));
                }
                output
            }
            "base64" if w(1) == "-w" => match self.files.get(w(3)).cloned() {
                Some(bytes) if w(4) == ">" => {
                    self.files
                        .insert(w(5).to_string(), STANDARD.encode(bytes).into_bytes());
                    String::new()
                }
                Some(bytes) => STANDARD.encode(bytes),
                None => format!("base64: {}: No such file or directory\n", w(3)),
            },
            "base64" => self.encode_file(w(1)),
            "openssl" if w(1) == "base64" => self.encode_file(w(3)),
            "openssl" if w(1) == "dgst" => self.digest(w(3)),
            "sha256sum" => self.digest(w(1)),
            "shasum" => self.digest(w(3)),
            "wc" if w(1) == "-c" && w(2) == "<" => match self.files.get(w(3)) {
                Some(bytes) => format!("{}\n", bytes.len()),
                None => format!("sh: {}: No such file or directory\n", w(3)),
            },
            "tail" if w(1) == "-c" => {
                let start: usize = w(2).trim_start_matches('+').parse().unwrap_or(1);
                let len: usize = w(7).parse().unwrap_or(0);
                match self.files.get(w(3)) {
                    Some(bytes) => {
                        let from = start.saturating_sub(1).min(bytes.len());
                        let to = (from + len).min(bytes.len());
                        String::from_utf8_lossy(&bytes[from..to]).to_string()
                    }
                    None => format!("tail: cannot open '{}' for reading: No such file or directory\n", w(3)),
                }
            }
            "rm" => {
                for path in words.iter().skip(1).filter(|w| !w.starts_with('-')) {
                    self.files.remove(path);
                }
                String::new()
            }
            other => format!("sh: 1: {other}: not found\n"),
        }
    }

    fn decode_into(&mut self, encoded: &[u8], path: &str) -> String {
        match STANDARD.decode(encoded) {
            Ok(bytes) => {
                self.files.insert(path.to_string(), bytes);
                String::new()
            }
            Err(_) => "base64: invalid input\n".into(),
        }
    }

    fn encode_file(&self, path: &str) -> String {
        match self.files.get(path) {
            Some(bytes) => STANDARD.encode(bytes),
            None => format!("base64: {path}: No such file or directory\n"),
        }
    }

    fn digest(&self, path: &str) -> String {
        let Some(bytes) = self.files.get(path) else {
            return String::new();
        };
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        if self.corrupt_checksums {
            hasher.update(b"corrupt");
        }
        format!("{:x}\n", hasher.finalize())
    }
}

/// Split a command line into words, honoring single quotes and backslashes.
fn shell_words(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                for quoted in chars.by_ref() {
                    if quoted == '\'' {
                        break;
                    }
                    current.push(quoted);
                }
            }
            '\\' => {
                in_word = true;
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_dir_fixture_writes_and_resolves_paths() {
        let fixture = TestTempDir::new("fixture");
        let file = fixture.write_bytes("nested/file.bin", b"hello");
        assert_eq!(fs::read(file).unwrap(), b"hello");
    }

    #[test]
    fn shell_words_unquote_like_sh() {
        assert_eq!(
            shell_words(r"printf '%s' 'it'\''s' >> '/tmp/a b'"),
            vec!["printf", "%s", "it's", ">>", "/tmp/a b"]
        );
        assert_eq!(shell_words("cut -d' ' -f1"), vec!["cut", "-d ", "-f1"]);
    }

    #[tokio::test]
    async fn fake_shell_echoes_and_prompts() {
        let shell = FakeShell::new();
        shell.write_all(b"echo 'hi'\n").await.unwrap();
        let ReadOutcome::Data(bytes) = shell.read_chunk(Duration::ZERO).await else {
            panic!("expected data");
        };
        assert_eq!(String::from_utf8_lossy(&bytes), "echo 'hi'\r\nhi\r\n$ ");
    }

    #[tokio::test]
    async fn fake_shell_emulates_inline_upload() {
        let shell = FakeShell::new();
        shell
            .write_all(b"printf '%s' 'aGk=' | base64 -d > '/tmp/x'\n")
            .await
            .unwrap();
        assert_eq!(shell.file("/tmp/x").as_deref(), Some(&b"hi"[..]));
    }
}
