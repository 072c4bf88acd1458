use anyhow::Result;
use clap::Args;
use wbx_abi::ExecRequest;

use crate::opts::EnvOpts;

#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Working directory inside the virtual tree
    #[arg(long, default_value = "/working")]
    pub cwd: String,

    /// Program path in the virtual tree followed by its arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub argv: Vec<String>,
}

pub async fn cmd_exec(opts: &EnvOpts, args: &ExecArgs) -> Result<i32> {
    let env = opts.start().await?;
    let request = ExecRequest::new(args.argv.iter().cloned())
        .with_cwd(args.cwd.clone())
        .with_sink(super::sink(opts));
    let result = env.exec(request).await?;
    super::finish(opts, &result)
}
