//! Scripted processes
//!
//! Stand-ins for PTY sessions: the test decides what a process "prints" and
//! inspects what was written to it. Plug a `ScriptedSpawner` into a
//! `PtyHost` and keep a clone to reach the sessions it creates.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use multiplexer::error::TransportError;
use multiplexer::host::{ProcessIo, ProcessSpawner};
use multiplexer::wire::{SpawnRequest, TerminalId};

#[derive(Debug, Default)]
struct ScriptState {
    output: VecDeque<Vec<u8>>,
    input: Vec<u8>,
    size: (u16, u16),
    running: bool,
    terminated: bool,
    fail_reads: bool,
    /// Max bytes accepted per write; `None` accepts everything
    write_limit: Option<usize>,
}

/// Test-side handle on one scripted process
#[derive(Debug, Clone, Default)]
pub struct ScriptHandle(Rc<RefCell<ScriptState>>);

impl ScriptHandle {
    /// Queue `bytes` to be read by the next pump
    pub fn emit(&self, bytes: &[u8]) {
        self.0.borrow_mut().output.push_back(bytes.to_vec());
    }

    pub fn emit_str(&self, text: &str) {
        self.emit(text.as_bytes());
    }

    /// Everything written to the process so far
    pub fn input(&self) -> Vec<u8> {
        self.0.borrow().input.clone()
    }

    pub fn input_string(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow().input).into_owned()
    }

    /// Let the process exit once its pending output is read
    pub fn exit(&self) {
        self.0.borrow_mut().running = false;
    }

    /// Make every further read fail
    pub fn fail_reads(&self) {
        self.0.borrow_mut().fail_reads = true;
    }

    pub fn limit_writes(&self, max: usize) {
        self.0.borrow_mut().write_limit = Some(max);
    }

    pub fn is_terminated(&self) -> bool {
        self.0.borrow().terminated
    }

    /// Last size as (cols, rows)
    pub fn size(&self) -> (u16, u16) {
        self.0.borrow().size
    }
}

struct ScriptedProcess {
    state: Rc<RefCell<ScriptState>>,
}

impl ProcessIo for ScriptedProcess {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut state = self.state.borrow_mut();
        if state.fail_reads {
            return Err(std::io::Error::other("scripted read failure"));
        }
        let Some(mut chunk) = state.output.pop_front() else {
            return Ok(0);
        };
        if chunk.len() > buf.len() {
            let rest = chunk.split_off(buf.len());
            state.output.push_front(rest);
        }
        buf[..chunk.len()].copy_from_slice(&chunk);
        Ok(chunk.len())
    }

    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        let mut state = self.state.borrow_mut();
        let n = state.write_limit.map_or(data.len(), |max| data.len().min(max));
        state.input.extend_from_slice(&data[..n]);
        Ok(n)
    }

    fn resize(&mut self, cols: u16, rows: u16) -> std::io::Result<()> {
        self.state.borrow_mut().size = (cols, rows);
        Ok(())
    }

    fn is_running(&mut self) -> bool {
        self.state.borrow().running
    }

    fn terminate(&mut self) {
        let mut state = self.state.borrow_mut();
        state.running = false;
        state.terminated = true;
    }

    fn pid(&self) -> Option<u32> {
        None
    }
}

/// Spawner handing out scripted processes
#[derive(Clone, Default)]
pub struct ScriptedSpawner {
    sessions: Rc<RefCell<HashMap<TerminalId, ScriptHandle>>>,
    fail_next: Rc<Cell<usize>>,
}

impl ScriptedSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process spawned for `id`
    pub fn session(&self, id: &TerminalId) -> Option<ScriptHandle> {
        self.sessions.borrow().get(id).cloned()
    }

    /// Fail the next `n` spawns
    pub fn fail_next(&self, n: usize) {
        self.fail_next.set(n);
    }
}

impl ProcessSpawner for ScriptedSpawner {
    fn spawn(&self, request: &SpawnRequest) -> Result<Box<dyn ProcessIo>, TransportError> {
        let failures = self.fail_next.get();
        if failures > 0 {
            self.fail_next.set(failures - 1);
            return Err(TransportError::Spawn {
                id: request.id.clone(),
                reason: "scripted spawn failure".to_string(),
            });
        }

        let handle = ScriptHandle::default();
        {
            let mut state = handle.0.borrow_mut();
            state.running = true;
            state.size = (request.cols, request.rows);
        }
        self.sessions
            .borrow_mut()
            .insert(request.id.clone(), handle.clone());
        Ok(Box::new(ScriptedProcess { state: handle.0 }))
    }
}
