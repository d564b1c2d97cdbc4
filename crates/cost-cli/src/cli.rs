use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "kubectl-cost",
    version,
    about = "Query the in-cluster cost-analysis API through a Kubernetes port-forward"
)]
pub(crate) struct Args {
    /// Namespace the cost-analysis Service lives in.
    #[arg(long, short = 'N', global = true)]
    pub(crate) namespace: Option<String>,
    #[arg(long, global = true)]
    pub(crate) service_name: Option<String>,
    #[arg(long, global = true)]
    pub(crate) service_port: Option<u16>,
    /// kubeconfig context to use instead of the current one.
    #[arg(long, global = true)]
    pub(crate) context: Option<String>,
    #[arg(long, global = true)]
    pub(crate) kubeconfig: Option<PathBuf>,
    /// Go through the API server's service proxy instead of a port-forward.
    #[arg(long, global = true)]
    pub(crate) use_proxy: bool,
    #[arg(long, global = true, value_parser = humantime::parse_duration)]
    pub(crate) ready_timeout: Option<Duration>,
    #[arg(long, global = true, value_parser = humantime::parse_duration)]
    pub(crate) request_timeout: Option<Duration>,
    /// Defaults file; `~/.config/kubectl-cost/config.toml` is read when present.
    #[arg(long, global = true)]
    pub(crate) config: Option<PathBuf>,
    #[arg(long, short = 'v', global = true)]
    pub(crate) verbose: bool,
    /// Also write daily rolling JSON logs into this directory.
    #[arg(long, global = true)]
    pub(crate) log_file: Option<PathBuf>,
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Print the currency code the cost model is configured with.
    Currency,
    /// Print the cluster id reported by the cost model.
    ClusterId,
    /// Print allocation data for a window.
    Allocation(AllocationArgs),
    /// Print asset data for a window.
    Assets(AssetsArgs),
    /// GET an arbitrary API path and write the body to stdout.
    Get {
        path: String,
        #[arg(long = "param", value_parser = parse_key_val)]
        params: Vec<(String, String)>,
    },
    /// POST to an arbitrary API path and write the body to stdout.
    Post {
        path: String,
        #[arg(long = "param", value_parser = parse_key_val)]
        params: Vec<(String, String)>,
        #[arg(long = "header", value_parser = parse_key_val)]
        headers: Vec<(String, String)>,
        /// Request body, or `@path` to read it from a file.
        #[arg(long, default_value = "")]
        data: String,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct AllocationArgs {
    #[arg(long, default_value = "yesterday")]
    pub(crate) window: String,
    #[arg(long)]
    pub(crate) aggregate: Option<String>,
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub(crate) accumulate: bool,
}

#[derive(clap::Args, Debug)]
pub(crate) struct AssetsArgs {
    #[arg(long, default_value = "yesterday")]
    pub(crate) window: String,
    #[arg(long)]
    pub(crate) aggregate: Option<String>,
}

pub(crate) fn parse_key_val(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{raw}`"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in `{raw}`"));
    }
    Ok((key.to_string(), value.to_string()))
}
