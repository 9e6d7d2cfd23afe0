//! Checkpointed conversation context with an append-only JSONL log.
//!
//! The context is strictly single-writer: exactly one run loop owns and
//! mutates it. Wire consumers may read history snapshots but never mutate.
//!
//! Every state change appends one line-delimited JSON record; the log is
//! forward-only (reverts and clears are recorded as new records, never by
//! rewriting) and is replayed on resume to reconstruct history, the
//! checkpoint stack, and the id counter.
//!
//! ## Schema v1 format
//!
//! ```jsonl
//! { "type": "meta", "schema_version": 1, "ts": "..." }
//! { "type": "message", "message": { ... }, "ts": "..." }
//! { "type": "checkpoint", "id": 0, "history_len": 0, "ts": "..." }
//! { "type": "revert", "checkpoint_id": 0, "ts": "..." }
//! { "type": "clear", "ts": "..." }
//! ```

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::message::Message;

/// Current schema version for new context logs.
pub const SCHEMA_VERSION: u32 = 1;

/// A named position in history that can later be reverted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: u64,
    /// History length at the time the checkpoint was taken.
    pub history_len: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum LogRecord {
    Meta {
        schema_version: u32,
        ts: String,
    },
    Message {
        message: Message,
        ts: String,
    },
    Checkpoint {
        id: u64,
        history_len: usize,
        ts: String,
    },
    Revert {
        checkpoint_id: u64,
        ts: String,
    },
    Clear {
        ts: String,
    },
}

fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Append-only persistence for one context.
#[derive(Debug)]
pub struct ContextLog {
    path: PathBuf,
    is_new: bool,
}

impl ContextLog {
    /// Opens (or creates) a log file. Parent directories are created.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).context("Failed to create context log directory")?;
        }
        let is_new = !path.exists();
        Ok(Self { path, is_new })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&mut self, record: &LogRecord) -> Result<()> {
        if self.is_new {
            self.is_new = false;
            self.write_line(&LogRecord::Meta {
                schema_version: SCHEMA_VERSION,
                ts: timestamp(),
            })?;
        }
        self.write_line(record)
    }

    fn write_line(&self, record: &LogRecord) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context("Failed to open context log")?;
        let json = serde_json::to_string(record).context("Failed to serialize log record")?;
        writeln!(file, "{json}").context("Failed to write to context log")?;
        Ok(())
    }

    /// Reads all records; unparseable lines are skipped best-effort.
    fn read_records(path: &Path) -> Result<Vec<LogRecord>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(path).context("Failed to open context log")?;
        let reader = BufReader::new(file);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line.context("Failed to read context log line")?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogRecord>(&line) {
                Ok(record) => records.push(record),
                Err(e) => debug!("Skipping unparseable context log line: {e}"),
            }
        }
        Ok(records)
    }
}

/// Ordered message history plus checkpoint stack and token bookkeeping.
#[derive(Debug, Default)]
pub struct Context {
    history: Vec<Message>,
    checkpoints: Vec<Checkpoint>,
    /// Monotonic for the life of the context; ids are never reused, even
    /// across reverts and clears.
    next_checkpoint_id: u64,
    token_count: u64,
    log: Option<ContextLog>,
}

impl Context {
    /// Creates an in-memory context with no persistence.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context persisted to an append-only log at `path`.
    ///
    /// # Errors
    /// Returns an error if the log cannot be opened.
    pub fn with_log(path: impl Into<PathBuf>) -> Result<Self> {
        let log = ContextLog::open(path)?;
        Ok(Self {
            log: Some(log),
            ..Self::default()
        })
    }

    /// Reconstructs a context by replaying the log at `path`, then keeps the
    /// log attached for further appends.
    ///
    /// # Errors
    /// Returns an error if the log cannot be read.
    pub fn resume(path: impl Into<PathBuf>) -> Result<Self> {
        let log = ContextLog::open(path)?;
        let records = ContextLog::read_records(log.path())?;

        let mut ctx = Self {
            log: Some(log),
            ..Self::default()
        };
        for record in records {
            match record {
                LogRecord::Meta { .. } => {}
                LogRecord::Message { message, .. } => ctx.history.push(message),
                LogRecord::Checkpoint {
                    id, history_len, ..
                } => {
                    ctx.checkpoints.push(Checkpoint { id, history_len });
                    ctx.next_checkpoint_id = ctx.next_checkpoint_id.max(id + 1);
                }
                LogRecord::Revert { checkpoint_id, .. } => {
                    ctx.apply_revert(checkpoint_id);
                }
                LogRecord::Clear { .. } => {
                    ctx.history.clear();
                    ctx.checkpoints.clear();
                }
            }
        }
        Ok(ctx)
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    pub fn token_count(&self) -> u64 {
        self.token_count
    }

    /// Appends one message, persisting one record.
    ///
    /// # Errors
    /// Returns an error if the log write fails.
    pub fn append(&mut self, message: Message) -> Result<()> {
        if let Some(log) = &mut self.log {
            log.append(&LogRecord::Message {
                message: message.clone(),
                ts: timestamp(),
            })?;
        }
        self.history.push(message);
        Ok(())
    }

    /// Appends several messages, one persisted record each.
    ///
    /// # Errors
    /// Returns an error if a log write fails.
    pub fn append_all(&mut self, messages: impl IntoIterator<Item = Message>) -> Result<()> {
        for message in messages {
            self.append(message)?;
        }
        Ok(())
    }

    /// Takes a checkpoint over the current history length and returns its id.
    /// Ids start at 0 and strictly increase; an id is allocated exactly once.
    ///
    /// # Errors
    /// Returns an error if the log write fails.
    pub fn checkpoint(&mut self) -> Result<u64> {
        let checkpoint = Checkpoint {
            id: self.next_checkpoint_id,
            history_len: self.history.len(),
        };
        self.next_checkpoint_id += 1;
        if let Some(log) = &mut self.log {
            log.append(&LogRecord::Checkpoint {
                id: checkpoint.id,
                history_len: checkpoint.history_len,
                ts: timestamp(),
            })?;
        }
        self.checkpoints.push(checkpoint);
        Ok(checkpoint.id)
    }

    /// Reverts history to the named checkpoint, dropping every later
    /// checkpoint. The target checkpoint itself survives.
    ///
    /// # Panics
    /// Panics if `id` names no live checkpoint — reverting to an unknown id
    /// is a programming error, not a recoverable condition.
    ///
    /// # Errors
    /// Returns an error if the log write fails.
    pub fn revert_to(&mut self, id: u64) -> Result<()> {
        assert!(
            self.checkpoints.iter().any(|c| c.id == id),
            "revert_to: unknown checkpoint id {id}"
        );
        if let Some(log) = &mut self.log {
            log.append(&LogRecord::Revert {
                checkpoint_id: id,
                ts: timestamp(),
            })?;
        }
        self.apply_revert(id);
        Ok(())
    }

    fn apply_revert(&mut self, id: u64) {
        let Some(pos) = self.checkpoints.iter().position(|c| c.id == id) else {
            // Replay can see a revert whose checkpoint was already cleared.
            debug!("Ignoring revert to missing checkpoint {id}");
            return;
        };
        let target_len = self.checkpoints[pos].history_len;
        self.history.truncate(target_len);
        self.checkpoints.truncate(pos + 1);
    }

    /// Reverts to empty: clears history and the checkpoint stack. Used before
    /// a compaction rewrite. The id counter keeps counting.
    ///
    /// # Errors
    /// Returns an error if the log write fails.
    pub fn clear(&mut self) -> Result<()> {
        if let Some(log) = &mut self.log {
            log.append(&LogRecord::Clear { ts: timestamp() })?;
        }
        self.history.clear();
        self.checkpoints.clear();
        self.token_count = 0;
        Ok(())
    }

    /// Advisory token bookkeeping: records the latest observed context-input
    /// figure. Feeds the compaction trigger; never used for mutual exclusion.
    pub fn update_token_count(&mut self, tokens: u64) {
        self.token_count = tokens;
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn push_users(ctx: &mut Context, texts: &[&str]) {
        for text in texts {
            ctx.append(Message::user(*text)).unwrap();
        }
    }

    #[test]
    fn test_first_checkpoint_from_empty_history_is_zero() {
        let mut ctx = Context::new();
        assert_eq!(ctx.checkpoint().unwrap(), 0);
        assert_eq!(ctx.checkpoint().unwrap(), 1);
        assert_eq!(ctx.checkpoints()[0].history_len, 0);
    }

    #[test]
    fn test_checkpoint_revert_roundtrip() {
        let mut ctx = Context::new();
        push_users(&mut ctx, &["one", "two"]);
        let id = ctx.checkpoint().unwrap();
        push_users(&mut ctx, &["three", "four", "five"]);
        assert_eq!(ctx.len(), 5);

        ctx.revert_to(id).unwrap();
        assert_eq!(ctx.len(), 2);
        assert_eq!(ctx.checkpoints().len(), 1);

        // A subsequent append is indistinguishable from appending directly.
        ctx.append(Message::user("three'")).unwrap();
        assert_eq!(ctx.history()[2].text(), "three'");
    }

    #[test]
    fn test_revert_drops_later_checkpoints_but_keeps_target() {
        let mut ctx = Context::new();
        let c0 = ctx.checkpoint().unwrap();
        push_users(&mut ctx, &["a"]);
        let c1 = ctx.checkpoint().unwrap();
        push_users(&mut ctx, &["b"]);
        let _c2 = ctx.checkpoint().unwrap();

        ctx.revert_to(c1).unwrap();
        let live: Vec<u64> = ctx.checkpoints().iter().map(|c| c.id).collect();
        assert_eq!(live, vec![c0, c1]);

        // Ids are never reused after a revert.
        assert_eq!(ctx.checkpoint().unwrap(), 3);
    }

    #[test]
    #[should_panic(expected = "unknown checkpoint id")]
    fn test_revert_to_unknown_id_panics() {
        let mut ctx = Context::new();
        ctx.checkpoint().unwrap();
        ctx.revert_to(42).unwrap();
    }

    #[test]
    fn test_clear_is_revert_to_empty() {
        let mut ctx = Context::new();
        ctx.checkpoint().unwrap();
        push_users(&mut ctx, &["a", "b"]);
        ctx.update_token_count(1234);

        ctx.clear().unwrap();
        assert!(ctx.is_empty());
        assert!(ctx.checkpoints().is_empty());
        assert_eq!(ctx.token_count(), 0);
        // Counter keeps counting.
        assert_eq!(ctx.checkpoint().unwrap(), 1);
    }

    #[test]
    fn test_retroactive_correction_shape() {
        // Five messages, checkpoint-2 taken after the second; reverting and
        // appending one replacement yields exactly checkpoint-2 state + 1.
        let mut ctx = Context::new();
        ctx.checkpoint().unwrap(); // 0
        ctx.append(Message::user("m1")).unwrap();
        ctx.checkpoint().unwrap(); // 1
        ctx.append(Message::user("m2")).unwrap();
        let target = ctx.checkpoint().unwrap(); // 2
        push_users(&mut ctx, &["m3", "m4", "m5"]);
        assert_eq!(ctx.len(), 5);

        ctx.revert_to(target).unwrap();
        ctx.checkpoint().unwrap();
        ctx.append(Message::user("lesson")).unwrap();

        let texts: Vec<String> = ctx.history().iter().map(Message::text).collect();
        assert_eq!(texts, vec!["m1", "m2", "lesson"]);
    }

    #[test]
    fn test_log_replay_reconstructs_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("runs").join("ctx.jsonl");

        {
            let mut ctx = Context::with_log(&path).unwrap();
            ctx.checkpoint().unwrap();
            ctx.append(Message::user("hello")).unwrap();
            ctx.checkpoint().unwrap();
            ctx.append(Message::assistant_text("hi")).unwrap();
        }

        let resumed = Context::resume(&path).unwrap();
        assert_eq!(resumed.len(), 2);
        assert_eq!(resumed.history()[0].text(), "hello");
        assert_eq!(resumed.history()[1].text(), "hi");
        assert_eq!(resumed.checkpoints().len(), 2);

        // The meta line leads the file.
        let content = fs::read_to_string(&path).unwrap();
        let first = content.lines().next().unwrap();
        assert!(first.contains(r#""type":"meta""#));
        assert!(first.contains(r#""schema_version":1"#));
    }

    #[test]
    fn test_log_replay_applies_revert_and_clear() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ctx.jsonl");

        {
            let mut ctx = Context::with_log(&path).unwrap();
            let keep = ctx.checkpoint().unwrap();
            ctx.append(Message::user("kept?")).unwrap();
            ctx.append(Message::user("dropped")).unwrap();
            ctx.revert_to(keep).unwrap();
            ctx.append(Message::user("after-revert")).unwrap();
        }

        let resumed = Context::resume(&path).unwrap();
        assert_eq!(resumed.len(), 1);
        assert_eq!(resumed.history()[0].text(), "after-revert");

        // Resume continues appending to the same log.
        let mut resumed = resumed;
        resumed.clear().unwrap();
        resumed.append(Message::user("fresh")).unwrap();
        let again = Context::resume(&path).unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again.history()[0].text(), "fresh");
    }

    #[test]
    fn test_resume_allocates_fresh_checkpoint_ids() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ctx.jsonl");

        {
            let mut ctx = Context::with_log(&path).unwrap();
            ctx.checkpoint().unwrap();
            ctx.checkpoint().unwrap();
        }

        let mut resumed = Context::resume(&path).unwrap();
        assert_eq!(resumed.checkpoint().unwrap(), 2);
    }

    #[test]
    fn test_replay_skips_garbage_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ctx.jsonl");
        {
            let mut ctx = Context::with_log(&path).unwrap();
            ctx.append(Message::user("good")).unwrap();
        }
        let mut content = fs::read_to_string(&path).unwrap();
        content.push_str("not json at all\n");
        fs::write(&path, content).unwrap();

        let resumed = Context::resume(&path).unwrap();
        assert_eq!(resumed.len(), 1);
    }
}
