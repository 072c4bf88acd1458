//! Process dispatch: turns an argv whose first element is a path in the
//! shared tree into a tool execution.
//!
//! A file is "executable" when its content is a routing directive:
//! `tool;extra;args`. The directive names the registered tool that runs the
//! file and the arguments prepended to the caller's argv. The interpreter
//! path is the one exception and always routes to the bootstrap tool.

use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::Mutex;
use wbx_abi::{DynSandbox, ExecRequest, ExecResult, FatalError, OutputSink, Spawner, StdStream};
use wbx_vfs::path::{resolve, strip_root};
use wbx_vfs::{VfsError, VirtualFileSystem};

use crate::config::EnvConfig;
use crate::error::HostError;
use crate::registry::ToolRegistry;

const SCRIPT_SUFFIX: &str = ".py";

/// Outcome of looking up how a program path should run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    Interpreted { tool: String, extra_args: Vec<String> },
    NotFound { path: String },
    NotExecutable { path: String },
}

/// The routing conventions of an environment.
#[derive(Clone, Debug)]
pub struct DispatchConfig {
    pub toolchain_root: String,
    pub working_dir: String,
    pub interpreter: String,
    pub bootstrap_tool: String,
    pub entry_tool: String,
}

impl From<&EnvConfig> for DispatchConfig {
    fn from(config: &EnvConfig) -> Self {
        Self {
            toolchain_root: config.toolchain_root.clone(),
            working_dir: config.working_dir.clone(),
            interpreter: config.interpreter.clone(),
            bootstrap_tool: config.bootstrap_tool.clone(),
            entry_tool: config.entry_tool.clone(),
        }
    }
}

pub struct Dispatcher {
    fs: Arc<VirtualFileSystem>,
    registry: Arc<ToolRegistry>,
    config: DispatchConfig,
    /// Held for the whole of a top-level execution; nested spawns are
    /// served inside it.
    running: Mutex<()>,
}

impl Dispatcher {
    pub fn new(
        fs: Arc<VirtualFileSystem>,
        registry: Arc<ToolRegistry>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            fs,
            registry,
            config,
            running: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Run a toolchain entry script: `run(["emcc", "-c", "a.c"])` executes
    /// `<toolchain_root>/emcc.py` with the entry tool in the working
    /// directory. A single argument is split on spaces first.
    pub async fn run(&self, args: Vec<String>, sink: OutputSink) -> Result<ExecResult, HostError> {
        let args = split_single(args);
        let Some((script, rest)) = args.split_first() else {
            return Ok(ExecResult::failure(1, "usage: run SCRIPT [ARGS...]"));
        };
        let mut argv = self.interpreter_argv(script);
        argv.extend(rest.iter().cloned());
        let request = ExecRequest::new(argv)
            .with_cwd(self.config.working_dir.clone())
            .with_path([self.config.toolchain_root.clone()])
            .with_sink(sink);
        let Some(tool) = self.registry.get(&self.config.entry_tool) else {
            let message = format!("File is not executable: {}", quoted(&self.config.entry_tool));
            return Ok(refuse(&request, message));
        };

        let _guard = self.running.lock().await;
        self.execute(tool, request).await
    }

    /// Resolve and run one process, then flush filesystem changes to the
    /// durable cache.
    ///
    /// Resolution and tool failures come back as non-zero results; only a
    /// failed fetch or cache sync is an error.
    pub async fn dispatch(&self, request: ExecRequest) -> Result<ExecResult, HostError> {
        let _guard = self.running.lock().await;
        self.dispatch_nested(request).await
    }

    /// Rewrite an argv naming a script under the toolchain root into an
    /// interpreter invocation of that script. The program is resolved
    /// against `cwd` first.
    pub fn rewrite(&self, argv: Vec<String>, cwd: &str) -> Vec<String> {
        let Some(program) = argv.first().and_then(|program| resolve(cwd, program).ok()) else {
            return argv;
        };
        let Some(script) = strip_root(&self.config.toolchain_root, &program) else {
            return argv;
        };
        let name = script.strip_suffix(SCRIPT_SUFFIX).unwrap_or(script);
        let rewritten = self.interpreter_argv(name);
        // The extra arguments of this rewrite were never defined upstream;
        // they are treated as empty until someone decides what they should be.
        if argv.len() > 1 {
            tracing::warn!(
                program = %argv[0],
                dropped = ?&argv[1..],
                "script rewrite drops caller arguments"
            );
        }
        rewritten
    }

    /// Decide how `program` (resolved against `cwd`) runs.
    pub async fn resolve(&self, program: &str, cwd: &str) -> Result<Resolution, HostError> {
        let Ok(path) = resolve(cwd, program) else {
            return Ok(Resolution::NotFound {
                path: program.to_string(),
            });
        };
        if !self.fs.exists(&path) {
            return Ok(Resolution::NotFound {
                path: program.to_string(),
            });
        }
        if path == self.config.interpreter {
            return Ok(Resolution::Interpreted {
                tool: self.config.bootstrap_tool.clone(),
                extra_args: Vec::new(),
            });
        }

        let directive = match self.fs.read_file_utf8(&path).await {
            Ok(text) => text,
            Err(err @ (VfsError::Fetch(_) | VfsError::Sync(_))) => return Err(err.into()),
            Err(err) => {
                tracing::debug!(%path, error = %err, "unreadable directive");
                return Ok(Resolution::NotExecutable {
                    path: program.to_string(),
                });
            }
        };
        let mut tokens = directive.trim_end().split(';').map(str::to_string);
        let tool = tokens.next().unwrap_or_default();
        if !self.registry.contains(&tool) {
            return Ok(Resolution::NotExecutable {
                path: program.to_string(),
            });
        }
        Ok(Resolution::Interpreted {
            tool,
            extra_args: tokens.collect(),
        })
    }

    fn dispatch_nested(&self, mut request: ExecRequest) -> BoxFuture<'_, Result<ExecResult, HostError>> {
        async move {
            let cwd = request.cwd_or("/").to_string();
            request.argv = self.rewrite(std::mem::take(&mut request.argv), &cwd);
            let Some(program) = request.program().map(str::to_string) else {
                return Ok(refuse(&request, "Executable not found: \"\"".to_string()));
            };

            let resolution = self.resolve(&program, &cwd).await?;
            tracing::debug!(%program, ?resolution, "resolved");
            let (tool, extra_args) = match resolution {
                Resolution::NotFound { path } => {
                    return Ok(refuse(&request, format!("Executable not found: {}", quoted(&path))));
                }
                Resolution::NotExecutable { path } => {
                    return Ok(refuse(&request, format!("File is not executable: {}", quoted(&path))));
                }
                Resolution::Interpreted { tool, extra_args } => (tool, extra_args),
            };
            let Some(sandbox) = self.registry.get(&tool) else {
                return Ok(refuse(&request, format!("File is not executable: {}", quoted(&program))));
            };

            let mut argv = extra_args;
            argv.append(&mut request.argv);
            request.argv = argv;
            request.cwd = Some(cwd);
            request.path = vec![self.config.toolchain_root.clone()];
            self.execute(sandbox, request).await
        }
        .boxed()
    }

    /// Run `tool`, serving its nested spawns until it finishes, then push.
    ///
    /// A fatal error from a nested dispatch or reported by the tool itself
    /// fails the execution once the tool returns, and nothing is pushed.
    async fn execute(&self, tool: DynSandbox, request: ExecRequest) -> Result<ExecResult, HostError> {
        tracing::debug!(tool = tool.name(), argv = ?request.argv, "executing");
        let (spawner, mut inbox) = Spawner::channel();
        let reported = spawner.fatal_slot();
        let mut run = std::pin::pin!(tool.execute(request, spawner));
        let mut fatal = None;
        let result = loop {
            tokio::select! {
                result = &mut run => break result,
                Some(msg) = inbox.recv() => {
                    let reply = match self.dispatch_nested(msg.request).await {
                        Ok(result) => result,
                        Err(err) => {
                            let reply = ExecResult::failure(1, err.to_string());
                            fatal.get_or_insert(err);
                            reply
                        }
                    };
                    let _ = msg.reply.send(reply);
                }
            }
        };
        if let Some(err) = fatal {
            return Err(err);
        }
        if let Some(err) = reported.take() {
            return Err(from_tool(err));
        }
        self.fs.push().await?;
        Ok(result)
    }

    fn interpreter_argv(&self, script: &str) -> Vec<String> {
        vec![
            self.config.interpreter.clone(),
            "-E".to_string(),
            format!(
                "{}/{script}{SCRIPT_SUFFIX}",
                self.config.toolchain_root.trim_end_matches('/')
            ),
        ]
    }
}

/// A lone argument is a whole command line: split it on runs of spaces.
fn split_single(args: Vec<String>) -> Vec<String> {
    match args.as_slice() {
        [line] => line
            .split(' ')
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect(),
        _ => args,
    }
}

/// A resolution failure: exit code 1, the message on stderr, nothing on
/// stdout. The message also goes to the caller's sink.
fn refuse(request: &ExecRequest, message: String) -> ExecResult {
    request.sink.emit(StdStream::Stderr, &message);
    ExecResult::failure(1, message)
}

fn from_tool(err: FatalError) -> HostError {
    match err.downcast::<VfsError>() {
        Ok(err) => HostError::Vfs(*err),
        Err(err) => HostError::Runtime(err.to_string()),
    }
}

/// JSON string form, as shown in resolution errors.
fn quoted(path: &str) -> String {
    serde_json::to_string(path).unwrap_or_else(|_| format!("\"{path}\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Invocation, ScriptedTool, Step};
    use wbx_store::{DurableStore, DynStore, MemStore, StoreError, StoreResult};
    use wbx_vfs::{FetchError, Vfs};
    use wbx_vfs::mock::MockFetcher;

    struct Harness {
        dispatcher: Dispatcher,
        fs: Arc<VirtualFileSystem>,
        store: MemStore,
    }

    async fn harness(vfs: Vfs, tools: Vec<(&str, Arc<ScriptedTool>)>) -> Harness {
        let store = MemStore::new();
        let (dispatcher, fs) = dispatcher(vfs, Arc::new(store.clone()), tools).await;
        Harness {
            dispatcher,
            fs,
            store,
        }
    }

    async fn dispatcher(
        vfs: Vfs,
        store: DynStore,
        tools: Vec<(&str, Arc<ScriptedTool>)>,
    ) -> (Dispatcher, Arc<VirtualFileSystem>) {
        let fs = Arc::new(
            VirtualFileSystem::open(vfs, "/cache", "/tmp", store, Arc::new(MockFetcher::new()))
                .await
                .unwrap(),
        );
        let mut registry = ToolRegistry::new();
        for (name, tool) in tools {
            registry.register(name, tool);
        }
        registry.init_all().await.unwrap();
        let dispatcher = Dispatcher::new(
            fs.clone(),
            Arc::new(registry),
            DispatchConfig::from(&EnvConfig::default()),
        );
        (dispatcher, fs)
    }

    /// Starts empty and refuses every write.
    struct ReadOnlyStore;

    impl DurableStore for ReadOnlyStore {
        fn list(&self) -> StoreResult<Vec<String>> {
            Ok(Vec::new())
        }

        fn read(&self, key: &str) -> StoreResult<Vec<u8>> {
            Err(StoreError::NotFound { key: key.into() })
        }

        fn write(&self, key: &str, _bytes: &[u8]) -> StoreResult<()> {
            Err(StoreError::Io {
                path: key.into(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
            })
        }

        fn remove(&self, _key: &str) -> StoreResult<()> {
            Ok(())
        }

        fn contains(&self, _key: &str) -> StoreResult<bool> {
            Ok(false)
        }
    }

    /// Register `path` as a lazy file whose URL the fetcher does not serve.
    async fn install_unreachable(fs: &VirtualFileSystem, path: &str) {
        let digest = wbx_cbor::Digest::sha256_of(path.as_bytes());
        fs.cached_lazy_file(path, 5, &digest, &format!("http://assets.test{path}"))
            .await
            .unwrap();
    }

    fn is_fetch_404(err: &HostError) -> bool {
        matches!(
            err,
            HostError::Vfs(VfsError::Fetch(FetchError::Status { status: 404, .. }))
        )
    }

    fn install(fs: &VirtualFileSystem, path: &str, directive: &str) {
        let (parent, _) = wbx_vfs::path::split_parent(path).unwrap();
        fs.mkdir_tree(parent).unwrap();
        fs.write_file(path, directive.to_string()).unwrap();
    }

    #[tokio::test]
    async fn missing_program_is_not_found() {
        let tool = Arc::new(ScriptedTool::echo("toolA"));
        let h = harness(Vfs::new(), vec![("toolA", tool.clone())]).await;
        let result = h
            .dispatcher
            .dispatch(ExecRequest::new(["/bin/missing", "x"]))
            .await
            .unwrap();
        assert_eq!(result.returncode, 1);
        assert_eq!(result.stdout, "");
        assert_eq!(result.stderr, "Executable not found: \"/bin/missing\"");
        assert_eq!(tool.call_count(), 0);
    }

    #[tokio::test]
    async fn refusals_reach_the_sink() {
        let h = harness(Vfs::new(), vec![]).await;
        let seen = Arc::new(std::sync::Mutex::new(String::new()));
        let sink = {
            let seen = seen.clone();
            OutputSink::new(move |_, text| seen.lock().unwrap().push_str(text))
        };
        h.dispatcher
            .dispatch(ExecRequest::new(["/nope"]).with_sink(sink))
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), "Executable not found: \"/nope\"");
    }

    #[tokio::test]
    async fn unknown_tool_is_not_executable() {
        let tool = Arc::new(ScriptedTool::echo("toolA"));
        let h = harness(Vfs::new(), vec![("toolA", tool.clone())]).await;
        install(&h.fs, "/bin/x", "nosuchtool;--flag");
        let result = h
            .dispatcher
            .dispatch(ExecRequest::new(["/bin/x"]))
            .await
            .unwrap();
        assert_eq!(result.returncode, 1);
        assert_eq!(result.stdout, "");
        assert_eq!(result.stderr, "File is not executable: \"/bin/x\"");
        assert_eq!(tool.call_count(), 0);
    }

    #[tokio::test]
    async fn directive_args_are_prepended() {
        let tool = Arc::new(ScriptedTool::echo("toolA"));
        let h = harness(Vfs::new(), vec![("toolA", tool.clone())]).await;
        install(&h.fs, "/bin/x", "toolA;--flag\n");
        let result = h
            .dispatcher
            .dispatch(ExecRequest::new(["/bin/x", "a.c"]))
            .await
            .unwrap();
        assert!(result.is_success());
        assert_eq!(
            tool.calls(),
            vec![Invocation {
                argv: vec!["--flag".into(), "/bin/x".into(), "a.c".into()],
                cwd: Some("/".into()),
                path: vec!["/emscripten".into()],
            }]
        );
    }

    #[tokio::test]
    async fn echo_directive_scenario() {
        let shell = Arc::new(ScriptedTool::echo("shell"));
        let h = harness(Vfs::new(), vec![("shell", shell.clone())]).await;
        install(&h.fs, "/bin/echo", "shell;echo");
        let result = h
            .dispatcher
            .dispatch(ExecRequest::new(["/bin/echo", "hi"]).with_cwd("/working"))
            .await
            .unwrap();
        assert_eq!(result.stdout, "echo /bin/echo hi\n");
        assert_eq!(shell.calls()[0].argv, vec!["echo", "/bin/echo", "hi"]);
        assert_eq!(shell.calls()[0].cwd.as_deref(), Some("/working"));
    }

    #[tokio::test]
    async fn writes_are_pushed_before_returning() {
        let vfs = Vfs::new();
        let cc = Arc::new(
            ScriptedTool::new("cc")
                .with_vfs(vfs.clone())
                .step(Step::Write {
                    path: "/cache/out.o".into(),
                    contents: "obj".into(),
                }),
        );
        let h = harness(vfs, vec![("cc", cc)]).await;
        install(&h.fs, "/bin/cc", "cc");
        let result = h
            .dispatcher
            .dispatch(ExecRequest::new(["/bin/cc"]))
            .await
            .unwrap();
        assert!(result.is_success());
        assert_eq!(h.store.read("out.o").unwrap(), b"obj");
    }

    #[tokio::test]
    async fn interpreter_path_bypasses_directive() {
        let python = Arc::new(ScriptedTool::echo("python"));
        let h = harness(Vfs::new(), vec![("python", python.clone())]).await;
        let argv = ["/usr/bin/python", "-c", "print(1)"];

        let missing = h.dispatcher.dispatch(ExecRequest::new(argv)).await.unwrap();
        assert_eq!(missing.returncode, 1);

        // Content is a binary image, not a directive.
        install(&h.fs, "/usr/bin/python", "\u{0}asm");
        let result = h.dispatcher.dispatch(ExecRequest::new(argv)).await.unwrap();
        assert!(result.is_success());
        assert_eq!(python.calls()[0].argv, argv);
    }

    #[tokio::test]
    async fn toolchain_scripts_are_rewritten() {
        let python = Arc::new(ScriptedTool::echo("python"));
        let h = harness(Vfs::new(), vec![("python", python.clone())]).await;
        install(&h.fs, "/usr/bin/python", "");
        for program in ["/emscripten/emcc.py", "/emscripten/emcc"] {
            h.dispatcher
                .dispatch(ExecRequest::new([program, "-c", "a.c"]))
                .await
                .unwrap();
        }
        let expected = vec!["/usr/bin/python", "-E", "/emscripten/emcc.py"];
        let calls = python.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|call| call.argv == expected));
        assert_eq!(
            h.dispatcher.rewrite(vec!["/bin/ls".into()], "/"),
            vec!["/bin/ls".to_string()]
        );
    }

    #[tokio::test]
    async fn relative_scripts_are_rewritten_from_cwd() {
        let python = Arc::new(ScriptedTool::echo("python"));
        let h = harness(Vfs::new(), vec![("python", python.clone())]).await;
        install(&h.fs, "/usr/bin/python", "");
        h.dispatcher
            .dispatch(ExecRequest::new(["emcc.py"]).with_cwd("/emscripten"))
            .await
            .unwrap();
        assert_eq!(
            python.calls()[0].argv,
            vec!["/usr/bin/python", "-E", "/emscripten/emcc.py"]
        );
        assert_eq!(
            h.dispatcher.rewrite(vec!["emar".into()], "/emscripten/"),
            vec!["/usr/bin/python", "-E", "/emscripten/emar.py"]
        );
        assert_eq!(
            h.dispatcher.rewrite(vec!["emcc.py".into()], "/working"),
            vec!["emcc.py".to_string()]
        );
    }

    #[tokio::test]
    async fn nested_spawns_go_through_dispatch() {
        let shell = Arc::new(ScriptedTool::echo("shell"));
        let driver = Arc::new(
            ScriptedTool::new("driver")
                .step(Step::Spawn(vec!["/bin/echo".into(), "nested".into()]))
                .step(Step::Spawn(vec!["/bin/nope".into()])),
        );
        let h = harness(
            Vfs::new(),
            vec![("shell", shell.clone()), ("driver", driver)],
        )
        .await;
        install(&h.fs, "/bin/echo", "shell;echo");
        install(&h.fs, "/bin/driver", "driver");

        let result = h
            .dispatcher
            .dispatch(ExecRequest::new(["/bin/driver"]).with_cwd("/working"))
            .await
            .unwrap();
        assert_eq!(result.stdout, "echo /bin/echo nested\n");
        assert_eq!(result.stderr, "Executable not found: \"/bin/nope\"");
        assert_eq!(shell.calls()[0].cwd.as_deref(), Some("/working"));
    }

    #[tokio::test]
    async fn unreachable_directive_fails_dispatch() {
        let tool = Arc::new(ScriptedTool::echo("toolA"));
        let h = harness(Vfs::new(), vec![("toolA", tool.clone())]).await;
        install_unreachable(&h.fs, "/bin/lazy").await;

        let err = h
            .dispatcher
            .resolve("/bin/lazy", "/")
            .await
            .unwrap_err();
        assert!(is_fetch_404(&err), "{err}");
        let err = h
            .dispatcher
            .dispatch(ExecRequest::new(["/bin/lazy"]))
            .await
            .unwrap_err();
        assert!(is_fetch_404(&err), "{err}");
        assert_eq!(tool.call_count(), 0);
    }

    #[tokio::test]
    async fn fatal_nested_spawn_fails_parent_after_it_finishes() {
        let driver = Arc::new(
            ScriptedTool::new("driver")
                .step(Step::Spawn(vec!["/bin/lazy".into()]))
                .step(Step::Print("after\n".into())),
        );
        let h = harness(Vfs::new(), vec![("driver", driver.clone())]).await;
        install(&h.fs, "/bin/driver", "driver");
        install_unreachable(&h.fs, "/bin/lazy").await;

        let seen = Arc::new(std::sync::Mutex::new(String::new()));
        let sink = {
            let seen = seen.clone();
            OutputSink::new(move |_, text| seen.lock().unwrap().push_str(text))
        };
        let err = h
            .dispatcher
            .dispatch(ExecRequest::new(["/bin/driver"]).with_sink(sink))
            .await
            .unwrap_err();
        assert!(is_fetch_404(&err), "{err}");
        // The parent saw a failed child and kept running.
        let seen = seen.lock().unwrap().clone();
        assert!(seen.contains("Status: 404"), "{seen}");
        assert!(seen.ends_with("after\n"), "{seen}");
        assert_eq!(driver.call_count(), 1);
    }

    #[tokio::test]
    async fn fetch_failure_inside_tool_fails_dispatch() {
        let vfs = Vfs::new();
        let reader = Arc::new(
            ScriptedTool::new("reader")
                .with_vfs(vfs.clone())
                .step(Step::Read("/lib/libc.a".into())),
        );
        let h = harness(vfs, vec![("reader", reader.clone())]).await;
        install(&h.fs, "/bin/reader", "reader");
        install_unreachable(&h.fs, "/lib/libc.a").await;

        let err = h
            .dispatcher
            .dispatch(ExecRequest::new(["/bin/reader"]))
            .await
            .unwrap_err();
        assert!(is_fetch_404(&err), "{err}");
        assert_eq!(reader.call_count(), 1);
    }

    #[tokio::test]
    async fn failed_push_fails_dispatch() {
        let vfs = Vfs::new();
        let cc = Arc::new(
            ScriptedTool::new("cc")
                .with_vfs(vfs.clone())
                .step(Step::Write {
                    path: "/cache/out.o".into(),
                    contents: "obj".into(),
                }),
        );
        let (dispatcher, fs) = dispatcher(vfs, Arc::new(ReadOnlyStore), vec![("cc", cc.clone())]).await;
        install(&fs, "/bin/cc", "cc");

        let err = dispatcher
            .dispatch(ExecRequest::new(["/bin/cc"]))
            .await
            .unwrap_err();
        assert!(
            matches!(err, HostError::Vfs(VfsError::Sync(_))),
            "{err}"
        );
        assert_eq!(cc.call_count(), 1);
    }

    #[tokio::test]
    async fn run_invokes_entry_script_in_working_dir() {
        let main = Arc::new(ScriptedTool::echo("main-python"));
        let h = harness(Vfs::new(), vec![("main-python", main.clone())]).await;
        let result = h
            .dispatcher
            .run(vec!["emcc  -c a.c".into()], OutputSink::default())
            .await
            .unwrap();
        assert!(result.is_success());
        assert_eq!(
            main.calls(),
            vec![Invocation {
                argv: ["/usr/bin/python", "-E", "/emscripten/emcc.py", "-c", "a.c"]
                    .map(String::from)
                    .to_vec(),
                cwd: Some("/working".into()),
                path: vec!["/emscripten".into()],
            }]
        );

        let empty = h.dispatcher.run(Vec::new(), OutputSink::default()).await.unwrap();
        assert_eq!(empty.returncode, 1);
    }

    #[test]
    fn single_argument_is_split() {
        assert_eq!(split_single(vec!["a  b c".into()]), vec!["a", "b", "c"]);
        assert_eq!(
            split_single(vec!["a b".into(), "c".into()]),
            vec!["a b", "c"]
        );
    }
}
