use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use kodetron::config::{CliArgs, Command, Config, ServerConfig};
use kodetron::sandbox::{ExecutionRequest, Sandbox};
use kodetron::web_server::build_server;
use kodetron::worker::{RunHandle, spawn_worker};

#[actix_web::main]
async fn main() -> anyhow::Result<ExitCode> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let Config {
        server: server_config,
        sandbox: sandbox_config,
        trigger_policy,
    } = cli.to_config()?;

    log::info!(
        "Compiler `{}`, compile timeout {} ms, run timeout {} ms",
        sandbox_config.compiler,
        sandbox_config.compile_timeout.0,
        sandbox_config.run_timeout.0
    );

    let shutdown_token = CancellationToken::new();
    let (runner, worker_task) = spawn_worker(
        Sandbox::new(sandbox_config),
        trigger_policy,
        shutdown_token.clone(),
    );

    let exit_code = match cli.command {
        Command::Run { source, input } => run_once(&runner, source, input).await?,
        Command::Serve {
            bind_address,
            bind_port,
        } => {
            let server_config = ServerConfig {
                bind_address: bind_address.or(server_config.bind_address),
                bind_port: bind_port.or(server_config.bind_port),
            };
            serve(server_config, runner).await?;
            ExitCode::SUCCESS
        }
    };

    // Abort anything still in flight and wait for the worker to clean up
    shutdown_token.cancel();
    if let Err(e) = worker_task.await {
        log::error!("Run worker terminated abnormally: {e:?}");
    }

    Ok(exit_code)
}

async fn run_once(
    runner: &RunHandle,
    source: std::path::PathBuf,
    input: Option<std::path::PathBuf>,
) -> anyhow::Result<ExitCode> {
    let source_text = tokio::fs::read_to_string(&source)
        .await
        .with_context(|| format!("Failed to read source file {}", source.display()))?;
    let stdin_text = match input {
        Some(path) => tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read input file {}", path.display()))?,
        None => String::new(),
    };

    let mut pending = runner.submit(ExecutionRequest::new(source_text, stdin_text))?;

    let outcome = tokio::select! {
        outcome = &mut pending => outcome?,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, aborting run...");
            runner.abort();
            pending.await?
        }
    };

    println!("{outcome}");
    if outcome.is_sandbox_failure() {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

async fn serve(server_config: ServerConfig, runner: RunHandle) -> anyhow::Result<()> {
    let server = build_server(server_config, runner).context("Failed to build server")?;
    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
        }
        res_server = server_task => {
            log::error!("Server terminated unexpectedly: {:?}", res_server);
        }
    }

    server_handle.stop(true).await;
    log::info!("Shutdown complete");
    Ok(())
}
