//! Scripted in-memory transport for session tests.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::time::Duration;

use serde_json::Value;

use crate::codec::{Framer, encode_frame};
use crate::transport::Transport;

#[derive(Default)]
pub(crate) struct Script {
    pub written: Vec<u8>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exited: bool,
    pub killed: bool,
    /// Grace period passed to `close`.
    pub closed_with: Option<Duration>,
    /// Every write fails while set.
    pub fail_writes: bool,
    /// Accept at most this many bytes per write.
    pub max_write: Option<usize>,
    pub write_calls: usize,
}

/// Handle the test keeps after boxing the transport into a session.
#[derive(Clone, Default)]
pub(crate) struct ScriptHandle(Rc<RefCell<Script>>);

impl ScriptHandle {
    pub fn transport(&self) -> Box<dyn Transport> {
        Box::new(ScriptedTransport(self.0.clone()))
    }

    pub fn with<T>(&self, f: impl FnOnce(&mut Script) -> T) -> T {
        f(&mut self.0.borrow_mut())
    }

    /// Queue a framed JSON message on the server's stdout.
    pub fn reply(&self, message: &Value) {
        let body = serde_json::to_vec(message).unwrap();
        self.with(|s| s.stdout.extend(encode_frame(&body)));
    }

    pub fn reply_raw(&self, bytes: &[u8]) {
        self.with(|s| s.stdout.extend_from_slice(bytes));
    }

    /// Every complete frame written so far, decoded.
    pub fn frames(&self) -> Vec<Value> {
        let mut framer = Framer::new();
        framer.feed(&self.0.borrow().written);
        let mut out = Vec::new();
        while let Some(body) = framer.next_frame().unwrap() {
            out.push(serde_json::from_slice(&body).unwrap());
        }
        out
    }

    pub fn methods(&self) -> Vec<String> {
        self.frames()
            .iter()
            .map(|f| f["method"].as_str().unwrap_or("<response>").to_string())
            .collect()
    }

    pub fn clear_written(&self) {
        self.with(|s| s.written.clear());
    }
}

struct ScriptedTransport(Rc<RefCell<Script>>);

fn take_up_to(buf: &mut Vec<u8>, max: usize) -> Option<Vec<u8>> {
    if buf.is_empty() {
        return None;
    }
    let n = buf.len().min(max);
    Some(buf.drain(..n).collect())
}

impl Transport for ScriptedTransport {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        let mut script = self.0.borrow_mut();
        script.write_calls += 1;
        if script.fail_writes || script.exited {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "scripted failure"));
        }
        let n = script.max_write.map_or(bytes.len(), |max| max.min(bytes.len()));
        script.written.extend_from_slice(&bytes[..n]);
        Ok(n)
    }

    fn read_stdout(&mut self, max: usize) -> Option<Vec<u8>> {
        take_up_to(&mut self.0.borrow_mut().stdout, max)
    }

    fn read_stderr(&mut self, max: usize) -> Option<Vec<u8>> {
        take_up_to(&mut self.0.borrow_mut().stderr, max)
    }

    fn running(&mut self) -> bool {
        let script = self.0.borrow();
        !script.exited && !script.killed
    }

    fn kill(&mut self) {
        self.0.borrow_mut().killed = true;
    }

    /// Behaves as if the grace period ran out.
    fn close(&mut self, grace: Duration) {
        let mut script = self.0.borrow_mut();
        script.closed_with = Some(grace);
        if !script.exited {
            script.killed = true;
        }
    }
}
