//! Incremental reader for one stage's `raw_output.jsonl`.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::parser::{LineParser, ParsedEntry};
use crate::workflow::models::Stage;

pub const STREAM_FILE: &str = "raw_output.jsonl";
pub const SUMMARY_FILE: &str = "raw_output.json";

/// Directory name fragments that identify a stage's artifact folder in
/// addition to the bare stage name (`plan_3fa9c2`, `sdlc_planner`, ...).
fn stage_aliases(stage: Stage) -> &'static [&'static str] {
    match stage {
        Stage::Clarify => &["clarifier"],
        Stage::Plan => &["planner"],
        Stage::Build => &["builder", "implementor"],
        Stage::Test => &["tester"],
        Stage::Review => &["reviewer"],
        Stage::Document => &["documenter", "docs"],
    }
}

/// Locate the artifact folder for `stage` under an instance's artifact root.
/// Folder names carry arbitrary suffixes, so this matches by pattern and
/// prefers the most recently modified candidate.
pub fn find_stage_dir(instance_dir: &Path, stage: Stage) -> Option<PathBuf> {
    let root = glob::Pattern::escape(&instance_dir.to_string_lossy());
    let mut patterns = vec![
        format!("{}/{}", root, stage.as_str()),
        format!("{}/{}_*", root, stage.as_str()),
        format!("{}/{}-*", root, stage.as_str()),
    ];
    for alias in stage_aliases(stage) {
        patterns.push(format!("{}/*_{}", root, alias));
        patterns.push(format!("{}/*_{}_*", root, alias));
    }

    let mut best: Option<(SystemTime, PathBuf)> = None;
    for pattern in patterns {
        let Ok(paths) = glob::glob(&pattern) else {
            continue;
        };
        for path in paths.flatten() {
            if !path.is_dir() {
                continue;
            }
            let modified = path
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            if best.as_ref().is_none_or(|(t, _)| modified > *t) {
                best = Some((modified, path));
            }
        }
    }
    best.map(|(_, path)| path)
}

/// Read a stage's final summary, if it has been written.
pub async fn read_summary(stage_dir: &Path) -> io::Result<Option<Value>> {
    let path = stage_dir.join(SUMMARY_FILE);
    match tokio::fs::read(&path).await {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring malformed stage summary");
                Ok(None)
            }
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Cursor over one stage log. Tolerates a partial trailing line, a file that
/// does not exist yet, and truncation (which restarts from the beginning).
pub struct StageTail {
    instance_dir: PathBuf,
    stage: Stage,
    stage_dir: Option<PathBuf>,
    offset: u64,
    partial: Vec<u8>,
    parser: LineParser,
    malformed: u64,
}

impl StageTail {
    pub fn new(instance_dir: impl Into<PathBuf>, stage: Stage) -> Self {
        Self::resume_at(instance_dir, stage, 0)
    }

    /// Continue from a previously recorded byte offset.
    pub fn resume_at(instance_dir: impl Into<PathBuf>, stage: Stage, offset: u64) -> Self {
        Self {
            instance_dir: instance_dir.into(),
            stage,
            stage_dir: None,
            offset,
            partial: Vec::new(),
            parser: LineParser::new(),
            malformed: 0,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Bytes consumed so far, excluding any buffered partial line.
    pub fn offset(&self) -> u64 {
        self.offset - self.partial.len() as u64
    }

    pub fn stage_dir(&self) -> Option<&Path> {
        self.stage_dir.as_deref()
    }

    pub fn malformed_lines(&self) -> u64 {
        self.malformed
    }

    /// Read everything appended since the last poll and return the parsed
    /// entries of every complete line.
    pub async fn poll(&mut self) -> io::Result<Vec<ParsedEntry>> {
        if self.stage_dir.is_none() {
            self.stage_dir = find_stage_dir(&self.instance_dir, self.stage);
        }
        let Some(dir) = &self.stage_dir else {
            return Ok(Vec::new());
        };
        let path = dir.join(STREAM_FILE);

        let len = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        if len < self.offset {
            tracing::warn!(
                path = %path.display(),
                offset = self.offset,
                len,
                "log file shrank, restarting from the beginning"
            );
            self.offset = 0;
            self.partial.clear();
            self.parser = LineParser::new();
        }
        if len == self.offset {
            return Ok(Vec::new());
        }

        let mut file = tokio::fs::File::open(&path).await?;
        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut chunk = Vec::with_capacity((len - self.offset) as usize);
        let read = file.read_to_end(&mut chunk).await?;
        self.offset += read as u64;
        self.partial.extend_from_slice(&chunk);

        let mut entries = Vec::new();
        let Some(last_newline) = self.partial.iter().rposition(|b| *b == b'\n') else {
            return Ok(entries);
        };
        let complete: Vec<u8> = self.partial.drain(..=last_newline).collect();
        for raw in complete.split(|b| *b == b'\n') {
            let line = String::from_utf8_lossy(raw);
            match self.parser.parse_line(&line) {
                Ok(parsed) => entries.extend(parsed),
                Err(e) => {
                    self.malformed += 1;
                    tracing::warn!(
                        stage = %self.stage,
                        path = %path.display(),
                        error = %e,
                        "skipping malformed log line"
                    );
                }
            }
        }
        Ok(entries)
    }
}
