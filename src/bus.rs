//! Append-only addressed message log shared by every agent.
//!
//! Records are framed as a delimiter line, three required headers
//! (`timestamp`, `from`, `to`) and a free-text body running to the next
//! delimiter. The bus keeps no delivery state: each recipient owns a
//! [`Mailbox`] cursor (a byte offset into the log) and acknowledges by
//! advancing it.
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use fs2::FileExt;
use tokio::sync::Notify;

use crate::cli::DeliveryMode;

pub const SUPERVISOR_AGENT: &str = "supervisor";
pub const BROADCAST_AGENT: &str = "all";
pub const UNKNOWN_OWNER: &str = "unknown";
pub const MESSAGE_DELIMITER: &str = "=== MESSAGE ===";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Byte offset of the record in the log; defines the global order.
    pub offset: u64,
    pub timestamp: DateTime<Utc>,
    pub from: String,
    pub to: String,
    pub body: String,
}

impl Message {
    pub fn is_for(&self, agent: &str) -> bool {
        self.to == agent || (self.to == BROADCAST_AGENT && self.from != agent)
    }

    pub fn intent(&self) -> Intent {
        parse_intent(&self.body)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QaVerdict {
    Pass,
    Fail,
}

impl QaVerdict {
    pub fn label(self) -> &'static str {
        match self {
            QaVerdict::Pass => "PASS",
            QaVerdict::Fail => "FAIL",
        }
    }
}

/// Command carried by a message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    RunQa,
    QaResult(QaVerdict),
    FixTask { standard_id: String },
    WorkerComplete,
    Exit,
    Note,
}

impl Intent {
    /// Canonical first line for a body carrying this intent.
    pub fn headline(&self) -> String {
        match self {
            Intent::RunQa => "RUN_QA".to_string(),
            Intent::QaResult(verdict) => format!("QA_RESULT: {}", verdict.label()),
            Intent::FixTask { standard_id } => format!("FIX_TASK: {standard_id} failed"),
            Intent::WorkerComplete => "WORKER_COMPLETE".to_string(),
            Intent::Exit => "/exit".to_string(),
            Intent::Note => String::new(),
        }
    }
}

fn is_token_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_'
}

/// Position of `keyword` in `text` where it is not glued to other word characters.
fn find_token(text: &str, keyword: &str) -> Option<usize> {
    let mut cursor = 0usize;
    while let Some(found) = text[cursor..].find(keyword) {
        let start = cursor + found;
        let end = start + keyword.len();
        let before_ok = text[..start]
            .chars()
            .next_back()
            .map(|ch| !is_token_char(ch))
            .unwrap_or(true);
        let after_ok = text[end..]
            .chars()
            .next()
            .map(|ch| !is_token_char(ch))
            .unwrap_or(true);
        if before_ok && after_ok {
            return Some(start);
        }
        cursor = end;
    }
    None
}

fn next_word(text: &str) -> Option<&str> {
    text.split(|ch: char| ch.is_whitespace() || ch == ',' || ch == '.')
        .find(|word| !word.is_empty())
}

fn exit_token(line: &str) -> Option<usize> {
    let mut cursor = 0usize;
    for word in line.split_inclusive(char::is_whitespace) {
        if word.trim_end().trim_end_matches(['.', ',']) == "/exit" {
            return Some(cursor);
        }
        cursor += word.len();
    }
    None
}

/// Intent of a single line; the earliest keyword on the line wins.
fn line_intent(line: &str) -> Option<Intent> {
    let mut found: Vec<(usize, Intent)> = Vec::new();

    if let Some(pos) = exit_token(line) {
        found.push((pos, Intent::Exit));
    }
    if let Some(pos) = find_token(line, "QA_RESULT") {
        let rest = line[pos + "QA_RESULT".len()..].trim_start_matches([':', ' ', '\t']);
        match next_word(rest).map(str::to_ascii_uppercase).as_deref() {
            Some("PASS") => found.push((pos, Intent::QaResult(QaVerdict::Pass))),
            Some("FAIL") => found.push((pos, Intent::QaResult(QaVerdict::Fail))),
            _ => {}
        }
    }
    if let Some(pos) = find_token(line, "FIX_TASK") {
        let rest = line[pos + "FIX_TASK".len()..].trim_start_matches([':', ' ', '\t']);
        if let Some(standard_id) = next_word(rest) {
            found.push((
                pos,
                Intent::FixTask {
                    standard_id: standard_id.to_string(),
                },
            ));
        }
    }
    if let Some(pos) = find_token(line, "RUN_QA") {
        found.push((pos, Intent::RunQa));
    }
    if let Some(pos) = find_token(line, "WORKER_COMPLETE") {
        found.push((pos, Intent::WorkerComplete));
    }

    found
        .into_iter()
        .min_by_key(|(pos, _)| *pos)
        .map(|(_, intent)| intent)
}

/// Parse the intent of a free-text body. The first line carrying a keyword
/// decides; everything after it is payload. Surrounding prose on that line
/// is tolerated as long as the keyword appears as its own token.
pub fn parse_intent(body: &str) -> Intent {
    body.lines().find_map(line_intent).unwrap_or(Intent::Note)
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn escape_body_line(line: &str) -> String {
    if line.trim_start_matches('\\').starts_with(MESSAGE_DELIMITER) {
        format!("\\{line}")
    } else {
        line.to_string()
    }
}

fn unescape_body_line(line: &str) -> &str {
    match line.strip_prefix('\\') {
        Some(rest) if rest.trim_start_matches('\\').starts_with(MESSAGE_DELIMITER) => rest,
        _ => line,
    }
}

pub fn encode_record(timestamp: &DateTime<Utc>, from: &str, to: &str, body: &str) -> String {
    let mut out = String::with_capacity(body.len() + 96);
    out.push_str(MESSAGE_DELIMITER);
    out.push('\n');
    out.push_str(&format!("timestamp: {}\n", format_timestamp(timestamp)));
    out.push_str(&format!("from: {from}\n"));
    out.push_str(&format!("to: {to}\n"));
    for line in body.trim_end_matches('\n').lines() {
        out.push_str(&escape_body_line(line));
        out.push('\n');
    }
    out
}

/// Messages decoded from a slice of the log.
#[derive(Debug, Default)]
pub struct DecodedLog {
    pub messages: Vec<Message>,
    pub malformed: usize,
}

fn decode_record(offset: u64, lines: &[&str]) -> Option<Message> {
    let mut timestamp = None;
    let mut from = None;
    let mut to = None;
    let mut body_start = 0usize;

    for (index, line) in lines.iter().enumerate() {
        let Some((key, value)) = line.split_once(": ") else {
            break;
        };
        match key {
            "timestamp" if timestamp.is_none() => {
                let parsed = DateTime::parse_from_rfc3339(value.trim()).ok()?;
                timestamp = Some(parsed.with_timezone(&Utc));
            }
            "from" if from.is_none() => from = Some(value.trim().to_string()),
            "to" if to.is_none() => to = Some(value.trim().to_string()),
            _ => break,
        }
        body_start = index + 1;
        if timestamp.is_some() && from.is_some() && to.is_some() {
            break;
        }
    }

    let from = from.filter(|v| !v.is_empty())?;
    let to = to.filter(|v| !v.is_empty())?;
    let body = lines[body_start..]
        .iter()
        .map(|line| unescape_body_line(line))
        .collect::<Vec<_>>()
        .join("\n");

    Some(Message {
        offset,
        timestamp: timestamp?,
        from,
        to,
        body: body.trim_end().to_string(),
    })
}

/// Decode every record in `text`, which starts at byte `base_offset` of the log.
pub fn decode_records(text: &str, base_offset: u64) -> DecodedLog {
    let mut decoded = DecodedLog::default();
    let mut current: Option<(u64, Vec<&str>)> = None;
    let mut position = 0usize;

    for raw_line in text.split_inclusive('\n') {
        let line = raw_line.trim_end_matches(['\n', '\r']);
        if line == MESSAGE_DELIMITER {
            if let Some((offset, lines)) = current.take() {
                match decode_record(offset, &lines) {
                    Some(message) => decoded.messages.push(message),
                    None => decoded.malformed += 1,
                }
            }
            current = Some((base_offset + position as u64, Vec::new()));
        } else if let Some((_, lines)) = current.as_mut() {
            lines.push(line);
        } else if !line.trim().is_empty() {
            // Text before the first delimiter cannot be attributed to a record.
            decoded.malformed += 1;
        }
        position += raw_line.len();
    }

    if let Some((offset, lines)) = current {
        match decode_record(offset, &lines) {
            Some(message) => decoded.messages.push(message),
            None => decoded.malformed += 1,
        }
    }

    decoded
}

/// Result of scanning the log from a recipient's offset.
#[derive(Debug, Default)]
pub struct BusRead {
    pub messages: Vec<Message>,
    pub next_offset: u64,
    pub malformed: usize,
}

#[derive(Clone)]
pub struct MessageBus {
    path: PathBuf,
    mode: DeliveryMode,
    write_lock: Arc<Mutex<()>>,
    notifiers: Arc<Mutex<HashMap<String, Arc<Notify>>>>,
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .finish()
    }
}

impl MessageBus {
    pub fn open(root: &Path, mode: DeliveryMode) -> Result<Self> {
        std::fs::create_dir_all(root)
            .with_context(|| format!("failed to create bus directory '{}'", root.display()))?;
        Ok(Self {
            path: root.join("messages.log"),
            mode,
            write_lock: Arc::new(Mutex::new(())),
            notifiers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    fn notifier(&self, agent: &str) -> Arc<Notify> {
        let mut notifiers = self.notifiers.lock().unwrap_or_else(|e| e.into_inner());
        notifiers
            .entry(agent.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Append one message. Returns after the record is flushed to disk.
    pub fn send(&self, from: &str, to: &str, body: &str) -> Result<Message> {
        let from = from.trim();
        let to = to.trim();
        if from.is_empty() || to.is_empty() {
            return Err(anyhow::anyhow!(
                "message sender and recipient are required"
            ));
        }
        if from.contains(char::is_whitespace) || to.contains(char::is_whitespace) {
            return Err(anyhow::anyhow!(
                "agent ids must not contain whitespace (from='{from}', to='{to}')"
            ));
        }

        let timestamp = Utc::now();
        let record = encode_record(&timestamp, from, to, body);

        let offset = {
            let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .with_context(|| format!("failed to open message bus '{}'", self.path.display()))?;
            file.lock_exclusive()
                .with_context(|| format!("failed to lock message bus '{}'", self.path.display()))?;
            let result = append_locked(&mut file, record.as_bytes());
            let unlock = FileExt::unlock(&file);
            let offset = result
                .with_context(|| format!("failed to append to message bus '{}'", self.path.display()))?;
            unlock.with_context(|| format!("failed to unlock message bus '{}'", self.path.display()))?;
            offset
        };

        tracing::debug!(from = from, to = to, offset, "message appended");

        if to == BROADCAST_AGENT {
            let notifiers = self.notifiers.lock().unwrap_or_else(|e| e.into_inner());
            for (agent, notify) in notifiers.iter() {
                if agent != from {
                    notify.notify_one();
                }
            }
        } else {
            self.notifier(to).notify_one();
        }

        Ok(Message {
            offset,
            timestamp,
            from: from.to_string(),
            to: to.to_string(),
            body: body.trim_end().to_string(),
        })
    }

    /// Read every message after `offset`, in append order.
    pub fn read_all_from(&self, offset: u64) -> Result<BusRead> {
        if !self.path.exists() {
            return Ok(BusRead {
                next_offset: offset,
                ..BusRead::default()
            });
        }

        let mut file = File::open(&self.path)
            .with_context(|| format!("failed to open message bus '{}'", self.path.display()))?;
        FileExt::lock_shared(&file)
            .with_context(|| format!("failed to lock message bus '{}'", self.path.display()))?;
        let result = read_locked(&mut file, offset);
        let _ = FileExt::unlock(&file);
        let (bytes, len) =
            result.with_context(|| format!("failed to read message bus '{}'", self.path.display()))?;

        if offset >= len {
            return Ok(BusRead {
                next_offset: offset.max(len),
                ..BusRead::default()
            });
        }

        let text = String::from_utf8_lossy(&bytes);
        let decoded = decode_records(&text, offset);
        if decoded.malformed > 0 {
            tracing::warn!(
                path = %self.path.display(),
                skipped = decoded.malformed,
                "skipped malformed message records"
            );
        }
        Ok(BusRead {
            messages: decoded.messages,
            next_offset: len,
            malformed: decoded.malformed,
        })
    }

    /// Read the messages addressed to `agent` after `offset`.
    pub fn read_from(&self, agent: &str, offset: u64) -> Result<BusRead> {
        let mut read = self.read_all_from(offset)?;
        read.messages.retain(|message| message.is_for(agent));
        Ok(read)
    }

    /// Wait until something may have arrived for `agent`, at most `max`.
    pub async fn wait(&self, agent: &str, max: Duration) {
        match self.mode {
            DeliveryMode::Push => {
                let notify = self.notifier(agent);
                let _ = tokio::time::timeout(max, notify.notified()).await;
            }
            DeliveryMode::Pull => tokio::time::sleep(max).await,
        }
    }
}

fn append_locked(file: &mut File, bytes: &[u8]) -> std::io::Result<u64> {
    let offset = file.seek(SeekFrom::End(0))?;
    file.write_all(bytes)?;
    file.flush()?;
    file.sync_data()?;
    Ok(offset)
}

fn read_locked(file: &mut File, offset: u64) -> std::io::Result<(Vec<u8>, u64)> {
    let len = file.metadata()?.len();
    if offset >= len {
        return Ok((Vec::new(), len));
    }
    file.seek(SeekFrom::Start(offset))?;
    let mut bytes = Vec::with_capacity((len - offset) as usize);
    file.take(len - offset).read_to_end(&mut bytes)?;
    Ok((bytes, len))
}

/// A recipient's view of the bus: its last-acknowledged offset.
#[derive(Debug)]
pub struct Mailbox {
    bus: MessageBus,
    agent: String,
    offset: u64,
    cursor_path: Option<PathBuf>,
}

impl Mailbox {
    pub fn new(bus: MessageBus, agent: &str) -> Self {
        Self {
            bus,
            agent: agent.to_string(),
            offset: 0,
            cursor_path: None,
        }
    }

    /// Mailbox whose cursor survives restarts in `<cursor_dir>/<agent>.offset`.
    pub fn persistent(bus: MessageBus, agent: &str, cursor_dir: &Path) -> Result<Self> {
        let cursor_path = cursor_dir.join(format!("{agent}.offset"));
        let offset = if cursor_path.exists() {
            let raw = std::fs::read_to_string(&cursor_path).with_context(|| {
                format!("failed to read mailbox cursor '{}'", cursor_path.display())
            })?;
            raw.trim().parse::<u64>().with_context(|| {
                format!("invalid mailbox cursor in '{}'", cursor_path.display())
            })?
        } else {
            0
        };
        Ok(Self {
            bus,
            agent: agent.to_string(),
            offset,
            cursor_path: Some(cursor_path),
        })
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Unacknowledged messages, without advancing the cursor.
    pub fn peek(&self) -> Result<Vec<Message>> {
        Ok(self.bus.read_from(&self.agent, self.offset)?.messages)
    }

    /// Unacknowledged messages; the cursor moves past them.
    pub fn receive(&mut self) -> Result<Vec<Message>> {
        let read = self.bus.read_from(&self.agent, self.offset)?;
        self.advance(read.next_offset)?;
        Ok(read.messages)
    }

    /// Acknowledge everything currently in the log without reading it.
    pub fn skip_to_end(&mut self) -> Result<()> {
        let read = self.bus.read_all_from(self.offset)?;
        self.advance(read.next_offset)
    }

    fn advance(&mut self, next_offset: u64) -> Result<()> {
        if next_offset == self.offset {
            return Ok(());
        }
        self.offset = next_offset;
        if let Some(path) = self.cursor_path.as_ref() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create cursor directory '{}'", parent.display())
                })?;
            }
            std::fs::write(path, self.offset.to_string())
                .with_context(|| format!("failed to write mailbox cursor '{}'", path.display()))?;
        }
        Ok(())
    }

    pub async fn wait(&self, max: Duration) {
        self.bus.wait(&self.agent, max).await;
    }
}
