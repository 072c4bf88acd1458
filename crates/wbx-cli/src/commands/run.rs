use anyhow::Result;
use clap::Args;

use crate::opts::EnvOpts;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Entry script name followed by its arguments. A single quoted
    /// argument is split on spaces.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

pub async fn cmd_run(opts: &EnvOpts, args: &RunArgs) -> Result<i32> {
    let env = opts.start().await?;
    let result = env.run(args.args.clone(), super::sink(opts)).await?;
    super::finish(opts, &result)
}
