//! JSONL trace of adapter calls.
//!
//! One line per settled call. Writing happens on a dedicated thread so the
//! dispatcher never blocks on file IO.

use serde::Serialize;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::mpsc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallTrace {
    pub timestamp_ms: i64,
    pub run_id: Option<String>,
    pub phase: String,
    pub index: usize,
    pub model_id: String,
    pub prompt_template: String,
    pub prompt_hash: String,
    pub latency_ms: u64,
    /// `"ok"` or the item's error code.
    pub outcome: String,
    pub error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("trace channel closed")]
    Closed,
    #[error("trace worker failed: {0}")]
    Join(String),
}

pub trait TraceSink: Send + Sync {
    fn record(&self, event: CallTrace) -> Result<(), TraceError>;
}

#[derive(Clone)]
pub struct JsonlTraceSink {
    sender: mpsc::Sender<CallTrace>,
}

/// Owns the writer thread; `join` after the last sink clone is dropped.
pub struct TraceWorker {
    handle: Option<std::thread::JoinHandle<Result<(), TraceError>>>,
}

impl TraceWorker {
    pub fn join(mut self) -> Result<(), TraceError> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .unwrap_or_else(|_| Err(TraceError::Join("trace worker panicked".to_string()))),
            None => Ok(()),
        }
    }
}

impl JsonlTraceSink {
    pub fn new(path: impl AsRef<Path>) -> Result<(Self, TraceWorker), TraceError> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let (sender, receiver) = mpsc::channel::<CallTrace>();
        let handle = std::thread::spawn(move || write_trace_loop(file, receiver));
        Ok((
            Self { sender },
            TraceWorker {
                handle: Some(handle),
            },
        ))
    }
}

impl TraceSink for JsonlTraceSink {
    fn record(&self, event: CallTrace) -> Result<(), TraceError> {
        self.sender.send(event).map_err(|_| TraceError::Closed)
    }
}

fn write_trace_loop(file: std::fs::File, receiver: mpsc::Receiver<CallTrace>) -> Result<(), TraceError> {
    let mut writer = BufWriter::new(file);
    for event in receiver {
        let line = serde_json::to_string(&event).map_err(|e| TraceError::Serde(e.to_string()))?;
        writeln!(writer, "{line}")?;
        // Keep the file tailable while a long-lived server is running.
        writer.flush()?;
    }
    writer.flush()?;
    Ok(())
}

pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_writes_one_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calls.jsonl");
        let (sink, worker) = JsonlTraceSink::new(&path).unwrap();

        for index in 0..2 {
            sink.record(CallTrace {
                timestamp_ms: now_epoch_ms(),
                run_id: None,
                phase: "primary".into(),
                index,
                model_id: format!("m{index}"),
                prompt_template: "primary_v1".into(),
                prompt_hash: "abc".into(),
                latency_ms: 3,
                outcome: "ok".into(),
                error: None,
            })
            .unwrap();
        }
        drop(sink);
        worker.join().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["model_id"], "m1");
    }
}
