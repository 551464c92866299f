use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::sync::mpsc::{Receiver, Sender};

use crate::{PolicyId, ScenarioId, WorkerId};

/// Scheduler → worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskMessage {
    SetScenario {
        scenario_id: ScenarioId,
        assumptions: Vec<f64>,
    },
    RunPolicy {
        scenario_id: ScenarioId,
        policy_id: PolicyId,
        policy: Vec<f64>,
    },
    Shutdown,
}

/// Worker → scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ResultMessage {
    ScenarioSet {
        worker_id: WorkerId,
        scenario_id: ScenarioId,
    },
    PolicyDone {
        worker_id: WorkerId,
        scenario_id: ScenarioId,
        policy_id: PolicyId,
    },
    Error {
        worker_id: WorkerId,
        error: String,
    },
}

impl ResultMessage {
    pub fn worker_id(&self) -> WorkerId {
        match self {
            ResultMessage::ScenarioSet { worker_id, .. }
            | ResultMessage::PolicyDone { worker_id, .. }
            | ResultMessage::Error { worker_id, .. } => *worker_id,
        }
    }
}

pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    writer.write_all(line.as_bytes())?;
    writer.flush()?;
    Ok(())
}

/// Reads the next non-empty line. `Ok(None)` at end of stream.
pub fn read_message<R: BufRead, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>> {
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let message = serde_json::from_str(trimmed)
            .with_context(|| format!("decode message line: {}", trimmed))?;
        return Ok(Some(message));
    }
}

/// Where a worker blocks for its next task. `Ok(None)` means the scheduler
/// side is gone.
pub trait TaskSource {
    fn recv(&mut self) -> Result<Option<TaskMessage>>;
}

pub trait ResultSink {
    fn send(&mut self, message: ResultMessage) -> Result<()>;
}

/// JSON lines over any reader, e.g. a worker process's stdin.
pub struct LineTaskSource<R> {
    reader: R,
}

impl<R: BufRead> LineTaskSource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl<R: BufRead> TaskSource for LineTaskSource<R> {
    fn recv(&mut self) -> Result<Option<TaskMessage>> {
        read_message(&mut self.reader)
    }
}

/// JSON lines over any writer, e.g. a worker process's stdout.
pub struct LineResultSink<W> {
    writer: W,
}

impl<W: Write> LineResultSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: Write> ResultSink for LineResultSink<W> {
    fn send(&mut self, message: ResultMessage) -> Result<()> {
        write_message(&mut self.writer, &message)
    }
}

impl TaskSource for Receiver<TaskMessage> {
    fn recv(&mut self) -> Result<Option<TaskMessage>> {
        Ok(Receiver::recv(self).ok())
    }
}

impl ResultSink for Sender<ResultMessage> {
    fn send(&mut self, message: ResultMessage) -> Result<()> {
        Sender::send(self, message).map_err(|_| anyhow!("result channel closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn task_wire_format_is_tagged_snake_case() {
        let msg = TaskMessage::RunPolicy {
            scenario_id: 2,
            policy_id: 10,
            policy: vec![1.5],
        };
        let json = serde_json::to_value(&msg).expect("encode");
        assert_eq!(json["type"], "run_policy");
        assert_eq!(json["policy_id"], 10);
        assert_eq!(
            serde_json::to_string(&TaskMessage::Shutdown).expect("encode"),
            r#"{"type":"shutdown"}"#
        );
    }

    #[test]
    fn result_decoding_rejects_unknown_events() {
        let ok: ResultMessage =
            serde_json::from_str(r#"{"event":"scenario_set","worker_id":3,"scenario_id":7}"#)
                .expect("decode");
        assert_eq!(ok.worker_id(), 3);
        let bad = serde_json::from_str::<ResultMessage>(r#"{"event":"heartbeat","worker_id":3}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn line_source_skips_blank_lines_and_signals_eof() {
        let input = "\n{\"type\":\"set_scenario\",\"scenario_id\":1,\"assumptions\":[0.1,0.2]}\n\n{\"type\":\"shutdown\"}\n";
        let mut source = LineTaskSource::new(Cursor::new(input));
        assert_eq!(
            source.recv().expect("first"),
            Some(TaskMessage::SetScenario {
                scenario_id: 1,
                assumptions: vec![0.1, 0.2]
            })
        );
        assert_eq!(source.recv().expect("second"), Some(TaskMessage::Shutdown));
        assert_eq!(source.recv().expect("eof"), None);
    }

    #[test]
    fn line_sink_writes_one_message_per_line() {
        let mut buf = Vec::new();
        {
            let mut sink = LineResultSink::new(&mut buf);
            sink.send(ResultMessage::PolicyDone {
                worker_id: 1,
                scenario_id: 2,
                policy_id: 3,
            })
            .expect("send");
            sink.send(ResultMessage::Error {
                worker_id: 1,
                error: "boom".to_string(),
            })
            .expect("send");
        }
        let text = String::from_utf8(buf).expect("utf8");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"event\":\"policy_done\""));
        assert!(lines[1].contains("\"error\":\"boom\""));
    }

    #[test]
    fn garbage_line_is_an_error_not_eof() {
        let mut source = LineTaskSource::new(Cursor::new("not json\n"));
        assert!(source.recv().is_err());
    }
}
