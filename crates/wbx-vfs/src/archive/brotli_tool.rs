use std::io::{Read, Write};

use async_trait::async_trait;
use wbx_abi::{ExecRequest, ExecResult, OutputCapture, Sandbox, Spawner};

use crate::path::resolve;
use crate::tree::Vfs;

const USAGE: &str = "usage: brotli [--decompress|-d] [-o OUTPUT] FILE";
const BUFFER_SIZE: usize = 4096;
const QUALITY: u32 = 11;
const LG_WINDOW: u32 = 22;

/// `brotli` command running in-process against the shared tree.
///
/// Without `-o`, decompression writes `FILE` minus its `.br` suffix and
/// compression writes `FILE.br`.
pub struct BrotliTool {
    vfs: Vfs,
}

#[derive(Debug, PartialEq, Eq)]
struct Invocation {
    decompress: bool,
    input: String,
    output: Option<String>,
}

impl BrotliTool {
    pub fn new(vfs: Vfs) -> Self {
        Self { vfs }
    }

    async fn run(&self, request: &ExecRequest, out: &mut OutputCapture) -> Result<(), String> {
        let invocation = parse_args(request.argv.get(1..).unwrap_or_default())?;
        let cwd = request.cwd_or("/");
        let input = resolve(cwd, &invocation.input).map_err(|err| err.to_string())?;
        let output = match &invocation.output {
            Some(path) => resolve(cwd, path).map_err(|err| err.to_string())?,
            None if invocation.decompress => input
                .strip_suffix(super::BROTLI_SUFFIX)
                .map(str::to_string)
                .ok_or_else(|| format!("{input}: unknown suffix, use -o"))?,
            None => format!("{input}{}", super::BROTLI_SUFFIX),
        };

        let bytes = self
            .vfs
            .read_file(&input)
            .await
            .map_err(|err| err.to_string())?;
        let decompress = invocation.decompress;
        let converted = tokio::task::spawn_blocking(move || {
            if decompress {
                decompress_bytes(&bytes)
            } else {
                compress_bytes(&bytes)
            }
        })
        .await
        .map_err(|err| err.to_string())?
        .map_err(|err| format!("{input}: {err}"))?;

        self.vfs
            .write_file(&output, converted)
            .map_err(|err| err.to_string())?;
        out.println(&output);
        Ok(())
    }
}

#[async_trait]
impl Sandbox for BrotliTool {
    fn name(&self) -> &str {
        "brotli"
    }

    async fn execute(&self, request: ExecRequest, _spawner: Spawner) -> ExecResult {
        let mut out = OutputCapture::new(request.sink.clone());
        match self.run(&request, &mut out).await {
            Ok(()) => out.finish(0),
            Err(message) => {
                out.eprintln(&format!("brotli: {message}"));
                out.finish(1)
            }
        }
    }
}

fn parse_args(args: &[String]) -> Result<Invocation, String> {
    let mut decompress = false;
    let mut output = None;
    let mut input = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-d" | "--decompress" => decompress = true,
            "-o" | "--output" => {
                let path = iter.next().ok_or_else(|| USAGE.to_string())?;
                output = Some(path.clone());
            }
            flag if flag.starts_with('-') => return Err(format!("unknown option {flag}\n{USAGE}")),
            path if input.is_none() => input = Some(path.to_string()),
            _ => return Err(USAGE.to_string()),
        }
    }
    Ok(Invocation {
        decompress,
        input: input.ok_or_else(|| USAGE.to_string())?,
        output,
    })
}

fn decompress_bytes(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    ::brotli::Decompressor::new(bytes, BUFFER_SIZE).read_to_end(&mut out)?;
    Ok(out)
}

fn compress_bytes(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut writer = ::brotli::CompressorWriter::new(Vec::new(), BUFFER_SIZE, QUALITY, LG_WINDOW);
    writer.write_all(bytes)?;
    writer.flush()?;
    Ok(writer.into_inner())
}
