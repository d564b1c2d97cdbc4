mod cli;
mod config;
mod logging;
mod query;

use crate::cli::{Args, Command};
use crate::config::{load_cli_config, resolve_settings, Settings};
use crate::query::QueryBackend;
use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use std::io::Write;
use tokio_util::sync::CancellationToken;
use tunnel_protocol::Request;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = logging::init_tracing(args.verbose, args.log_file.as_deref())?;

    let config = load_cli_config(args.config.as_deref())?;
    let settings = resolve_settings(&args, config)?;
    let shutdown = CancellationToken::new();
    spawn_shutdown_handler(shutdown.clone());

    let kube_config = load_kube_config(&settings).await?;
    let backend = QueryBackend::connect(&settings, kube_config, &shutdown).await?;
    let result = run_command(&args.command, &backend, &settings, &shutdown).await;
    backend.close().await;
    result
}

async fn load_kube_config(settings: &Settings) -> anyhow::Result<kube::Config> {
    let options = KubeConfigOptions {
        context: settings.context.clone(),
        ..Default::default()
    };
    match (&settings.kubeconfig, &settings.context) {
        (Some(path), _) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("failed to read kubeconfig {}", path.display()))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &options)
                .await
                .with_context(|| format!("failed to load kubeconfig {}", path.display()))
        }
        (None, Some(context)) => kube::Config::from_kubeconfig(&options)
            .await
            .with_context(|| format!("failed to load kubeconfig context {context}")),
        (None, None) => kube::Config::infer()
            .await
            .context("failed to infer kubernetes configuration"),
    }
}

async fn run_command(
    command: &Command,
    backend: &QueryBackend,
    settings: &Settings,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let timeout = settings.request_timeout;
    match command {
        Command::Currency => {
            let body = backend.execute(query::configs_request(), timeout, cancel).await?;
            println!("{}", query::decode_currency_code(&body)?);
        }
        Command::ClusterId => {
            let body = backend
                .execute(query::cluster_info_request(), timeout, cancel)
                .await?;
            println!("{}", query::decode_cluster_id(&body)?);
        }
        Command::Allocation(allocation) => {
            let request = query::allocation_request(
                &allocation.window,
                allocation.aggregate.as_deref(),
                allocation.accumulate,
            );
            let body = backend.execute(request, timeout, cancel).await?;
            println!("{}", query::pretty_json(&body)?);
        }
        Command::Assets(assets) => {
            let request = query::assets_request(&assets.window, assets.aggregate.as_deref());
            let body = backend.execute(request, timeout, cancel).await?;
            println!("{}", query::pretty_json(&body)?);
        }
        Command::Get { path, params } => {
            let request = Request::get(path.as_str()).params(params.iter().cloned());
            let body = backend.execute(request, timeout, cancel).await?;
            write_stdout(&body)?;
        }
        Command::Post {
            path,
            params,
            headers,
            data,
        } => {
            let mut request =
                Request::post(path.as_str(), read_body(data)?).params(params.iter().cloned());
            request.headers = headers.clone();
            let body = backend.execute(request, timeout, cancel).await?;
            write_stdout(&body)?;
        }
    }
    Ok(())
}

fn read_body(data: &str) -> anyhow::Result<Bytes> {
    match data.strip_prefix('@') {
        Some(path) => {
            let raw = std::fs::read(path).with_context(|| format!("failed to read {path}"))?;
            Ok(Bytes::from(raw))
        }
        None => Ok(Bytes::copy_from_slice(data.as_bytes())),
    }
}

fn write_stdout(body: &[u8]) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(body).context("failed to write response")?;
    stdout.flush().context("failed to write response")
}

fn spawn_shutdown_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        shutdown.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(signal) => signal,
        Err(err) => {
            tracing::warn!(error = %err, "failed to register SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => tracing::info!("received SIGINT, cancelling"),
            Err(err) => {
                tracing::warn!(error = %err, "failed to register SIGINT handler");
                sigterm.recv().await;
            }
        },
        _ = sigterm.recv() => tracing::info!("received SIGTERM, cancelling"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("received Ctrl-C, cancelling"),
        Err(err) => {
            tracing::warn!(error = %err, "failed to register Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    }
}
