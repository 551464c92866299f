//! Adapter boundary to the computation engine.
//!
//! The worker only ever sees [`Engine`]: write a vector into a region,
//! recalculate and read a region back, close. [`CommandEngine`] implements
//! it by driving an external bridge program over JSON lines on its
//! stdin/stdout, so the engine itself stays a black box.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::io::{BufRead, BufReader, Write};
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use tracing::{debug, warn};

use crate::error::EngineError;

/// A named rectangular block of the model, e.g. `Inputs!I7:Z7`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub sheet: String,
    pub address: String,
}

impl Region {
    pub fn new(sheet: &str, address: &str) -> Self {
        Self {
            sheet: sheet.to_string(),
            address: address.to_string(),
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!{}", self.sheet, self.address)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineRegions {
    pub assumptions: Region,
    pub policy: Region,
    pub output: Region,
}

pub trait Engine {
    fn write_region(&mut self, region: &Region, values: &[f64]) -> Result<(), EngineError>;

    fn recalculate_and_read(&mut self, region: &Region) -> Result<Vec<f64>, EngineError>;

    /// Best effort; must not fail observably.
    fn close(&mut self);
}

pub trait EngineOpener {
    type Engine: Engine;

    fn open(&self, resource: &Path) -> Result<Self::Engine, EngineError>;
}

/// Owns an open engine and closes it when dropped, whatever path the
/// worker leaves by.
pub struct EngineSession<E: Engine> {
    engine: E,
}

impl<E: Engine> EngineSession<E> {
    pub fn new(engine: E) -> Self {
        Self { engine }
    }
}

impl<E: Engine> Deref for EngineSession<E> {
    type Target = E;

    fn deref(&self) -> &E {
        &self.engine
    }
}

impl<E: Engine> DerefMut for EngineSession<E> {
    fn deref_mut(&mut self) -> &mut E {
        &mut self.engine
    }
}

impl<E: Engine> Drop for EngineSession<E> {
    fn drop(&mut self) {
        self.engine.close();
    }
}

#[derive(Debug, Deserialize)]
struct BridgeReply {
    ok: bool,
    #[serde(default)]
    values: Vec<f64>,
    #[serde(default)]
    error: Option<String>,
}

/// Spawns `command… <model path>` per engine instance.
#[derive(Debug, Clone)]
pub struct CommandEngineOpener {
    command: Vec<String>,
}

impl CommandEngineOpener {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl EngineOpener for CommandEngineOpener {
    type Engine = CommandEngine;

    fn open(&self, resource: &Path) -> Result<CommandEngine, EngineError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| EngineError::Open("engine command is empty".to_string()))?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg(resource)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        let mut child = cmd
            .spawn()
            .map_err(|e| EngineError::Open(format!("spawn {}: {}", program, e)))?;
        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, BufReader::new(stdout)),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(EngineError::Open("engine bridge pipes unavailable".to_string()));
            }
        };
        let mut engine = CommandEngine {
            child,
            stdin: Some(stdin),
            stdout,
            closed: false,
        };
        match engine.read_reply() {
            Ok(reply) if reply.ok => {
                debug!(model = %resource.display(), "engine bridge ready");
                Ok(engine)
            }
            Ok(reply) => {
                engine.close();
                Err(EngineError::Open(
                    reply.error.unwrap_or_else(|| "bridge refused to open model".to_string()),
                ))
            }
            Err(detail) => {
                engine.close();
                Err(EngineError::Open(detail))
            }
        }
    }
}

/// One engine bridge process. Requests and replies are single JSON lines.
pub struct CommandEngine {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    closed: bool,
}

impl CommandEngine {
    fn request(&mut self, payload: &Value) -> Result<BridgeReply, String> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| "engine bridge already closed".to_string())?;
        let mut line = serde_json::to_string(payload).map_err(|e| e.to_string())?;
        line.push('\n');
        stdin
            .write_all(line.as_bytes())
            .and_then(|_| stdin.flush())
            .map_err(|e| format!("send to engine bridge: {}", e))?;
        self.read_reply()
    }

    fn read_reply(&mut self) -> Result<BridgeReply, String> {
        let mut line = String::new();
        let n = self
            .stdout
            .read_line(&mut line)
            .map_err(|e| format!("read from engine bridge: {}", e))?;
        if n == 0 {
            return Err("engine bridge exited".to_string());
        }
        serde_json::from_str(line.trim())
            .map_err(|e| format!("malformed engine bridge reply: {}", e))
    }
}

impl Engine for CommandEngine {
    fn write_region(&mut self, region: &Region, values: &[f64]) -> Result<(), EngineError> {
        let failed = |detail: String| EngineError::Write {
            region: region.to_string(),
            detail,
        };
        let reply = self
            .request(&json!({
                "op": "write",
                "sheet": region.sheet,
                "region": region.address,
                "values": values,
            }))
            .map_err(failed)?;
        if reply.ok {
            Ok(())
        } else {
            Err(failed(reply.error.unwrap_or_default()))
        }
    }

    fn recalculate_and_read(&mut self, region: &Region) -> Result<Vec<f64>, EngineError> {
        let failed = |detail: String| EngineError::Calc {
            region: region.to_string(),
            detail,
        };
        let reply = self
            .request(&json!({
                "op": "calculate",
                "sheet": region.sheet,
                "region": region.address,
            }))
            .map_err(failed)?;
        if reply.ok {
            Ok(reply.values)
        } else {
            Err(failed(reply.error.unwrap_or_default()))
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.request(&json!({"op": "close"})) {
            debug!(error = %e, "engine bridge close request not acknowledged");
        }
        self.stdin.take();
        match self.child.try_wait() {
            Ok(Some(_)) => {}
            _ => {
                if let Err(e) = self.child.kill() {
                    warn!(error = %e, "failed to stop engine bridge");
                }
            }
        }
        let _ = self.child.wait();
    }
}
