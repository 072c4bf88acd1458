//! Scripted sandbox for tests: records every invocation and replays a fixed
//! list of steps.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use wbx_abi::{ExecRequest, ExecResult, OutputCapture, Sandbox, Spawner};
use wbx_vfs::{Vfs, VfsError};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invocation {
    pub argv: Vec<String>,
    pub cwd: Option<String>,
    pub path: Vec<String>,
}

#[derive(Clone, Debug)]
pub enum Step {
    /// Print the received argv, space-joined, plus a newline.
    Echo,
    Print(String),
    /// Write a file in the tree the tool was built with.
    Write { path: String, contents: String },
    /// Read a file from the attached tree and print it. Fetch and sync
    /// failures are reported to the spawner, as wasm tools do.
    Read(String),
    /// Spawn a nested process and print its stdout.
    Spawn(Vec<String>),
    /// Stop with this exit code.
    Exit(i32),
}

pub struct ScriptedTool {
    name: String,
    vfs: Option<Vfs>,
    steps: Vec<Step>,
    init_error: Option<String>,
    init_calls: AtomicUsize,
    calls: Mutex<Vec<Invocation>>,
}

impl ScriptedTool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vfs: None,
            steps: Vec::new(),
            init_error: None,
            init_calls: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// A tool that prints its argv.
    pub fn echo(name: impl Into<String>) -> Self {
        Self::new(name).step(Step::Echo)
    }

    pub fn with_vfs(mut self, vfs: Vfs) -> Self {
        self.vfs = Some(vfs);
        self
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn failing_init(mut self, message: impl Into<String>) -> Self {
        self.init_error = Some(message.into());
        self
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn init_count(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sandbox for ScriptedTool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self) -> anyhow::Result<()> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        match &self.init_error {
            Some(message) => Err(anyhow::anyhow!("{message}")),
            None => Ok(()),
        }
    }

    async fn execute(&self, request: ExecRequest, spawner: Spawner) -> ExecResult {
        self.calls.lock().unwrap().push(Invocation {
            argv: request.argv.clone(),
            cwd: request.cwd.clone(),
            path: request.path.clone(),
        });
        let mut out = OutputCapture::new(request.sink.clone());
        for step in &self.steps {
            match step {
                Step::Echo => out.println(&request.argv.join(" ")),
                Step::Print(text) => out.print(text),
                Step::Write { path, contents } => {
                    let written = match &self.vfs {
                        Some(vfs) => vfs.write_file(path, contents.clone()).map_err(|e| e.to_string()),
                        None => Err("no filesystem attached".to_string()),
                    };
                    if let Err(message) = written {
                        out.eprintln(&format!("{}: {message}", self.name));
                        return out.finish(1);
                    }
                }
                Step::Read(path) => {
                    let Some(vfs) = &self.vfs else {
                        out.eprintln(&format!("{}: no filesystem attached", self.name));
                        return out.finish(1);
                    };
                    match vfs.read_file(path).await {
                        Ok(bytes) => out.print(&String::from_utf8_lossy(&bytes)),
                        Err(err) => {
                            out.eprintln(&format!("{}: {err}", self.name));
                            if matches!(err, VfsError::Fetch(_) | VfsError::Sync(_)) {
                                spawner.report_fatal(err);
                            }
                            return out.finish(1);
                        }
                    }
                }
                Step::Spawn(argv) => {
                    let mut child = ExecRequest::new(argv.clone());
                    child.cwd = request.cwd.clone();
                    let result = spawner.spawn(child).await;
                    out.print(&result.stdout);
                    if !result.is_success() {
                        out.eprint(&result.stderr);
                    }
                }
                Step::Exit(code) => return out.finish(*code),
            }
        }
        out.finish(0)
    }
}
