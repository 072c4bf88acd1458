use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Which standard stream a chunk of output belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StdStream {
    Stdout,
    Stderr,
}

type SinkFn = dyn Fn(StdStream, &str) + Send + Sync;

/// Caller-supplied stream handlers. Notifications are fire-and-forget and
/// never part of the [`ExecResult`]; without a handler output goes to `tracing`.
#[derive(Clone, Default)]
pub struct OutputSink {
    handler: Option<Arc<SinkFn>>,
}

impl OutputSink {
    pub fn new(handler: impl Fn(StdStream, &str) + Send + Sync + 'static) -> Self {
        Self {
            handler: Some(Arc::new(handler)),
        }
    }

    pub fn emit(&self, stream: StdStream, text: &str) {
        match &self.handler {
            Some(handler) => handler(stream, text),
            None => match stream {
                StdStream::Stdout => tracing::info!(target: "wbx::stdout", "{text}"),
                StdStream::Stderr => tracing::info!(target: "wbx::stderr", "{text}"),
            },
        }
    }
}

impl fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputSink")
            .field("custom", &self.handler.is_some())
            .finish()
    }
}

/// One logical process invocation.
#[derive(Clone, Debug, Default)]
pub struct ExecRequest {
    pub argv: Vec<String>,
    pub cwd: Option<String>,
    /// Search path handed to the tool (directories, in lookup order).
    pub path: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub sink: OutputSink,
}

impl ExecRequest {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_path<I, S>(mut self, path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.path = path.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_sink(mut self, sink: OutputSink) -> Self {
        self.sink = sink;
        self
    }

    /// The invoked program name (`argv[0]`).
    pub fn program(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }

    pub fn cwd_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.cwd.as_deref().unwrap_or(default)
    }
}

/// Complete outcome of a process. Failures while resolving or running a
/// command travel through here, never as errors.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    pub returncode: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            returncode: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(returncode: i32, stderr: impl Into<String>) -> Self {
        Self {
            returncode,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.returncode == 0
    }
}

/// Accumulates a tool's output while forwarding each chunk to the sink.
#[derive(Debug)]
pub struct OutputCapture {
    sink: OutputSink,
    stdout: String,
    stderr: String,
}

impl OutputCapture {
    pub fn new(sink: OutputSink) -> Self {
        Self {
            sink,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    pub fn print(&mut self, line: &str) {
        self.push(StdStream::Stdout, line);
    }

    pub fn eprint(&mut self, line: &str) {
        self.push(StdStream::Stderr, line);
    }

    /// Record `text` verbatim (no newline appended).
    pub fn push(&mut self, stream: StdStream, text: &str) {
        self.sink.emit(stream, text);
        match stream {
            StdStream::Stdout => self.stdout.push_str(text),
            StdStream::Stderr => self.stderr.push_str(text),
        }
    }

    pub fn println(&mut self, line: &str) {
        self.print(&format!("{line}\n"));
    }

    pub fn eprintln(&mut self, line: &str) {
        self.eprint(&format!("{line}\n"));
    }

    pub fn finish(self, returncode: i32) -> ExecResult {
        ExecResult {
            returncode,
            stdout: self.stdout,
            stderr: self.stderr,
        }
    }
}
