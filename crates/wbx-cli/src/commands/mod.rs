pub mod cache;
pub mod exec;
pub mod run;

use std::io::Write;

use anyhow::Result;
use wbx_abi::{ExecResult, OutputSink, StdStream};

use crate::opts::EnvOpts;

/// Stream tool output to the terminal unless the caller asked for JSON.
pub(crate) fn sink(opts: &EnvOpts) -> OutputSink {
    if opts.json {
        return OutputSink::default();
    }
    OutputSink::new(|stream, text| {
        let _ = match stream {
            StdStream::Stdout => std::io::stdout().write_all(text.as_bytes()),
            StdStream::Stderr => std::io::stderr().write_all(text.as_bytes()),
        };
    })
}

/// Report a finished process and return its exit code.
pub(crate) fn finish(opts: &EnvOpts, result: &ExecResult) -> Result<i32> {
    if opts.json {
        println!("{}", serde_json::to_string_pretty(result)?);
    } else {
        std::io::stdout().flush()?;
    }
    Ok(result.returncode)
}
