use anyhow::Result;
use clap::Parser;
use vgpu_agent::config::Cli;
use vgpu_agent::config::Commands;
use vgpu_agent::config::DaemonArgs;
use vgpu_agent::logging;
use vgpu_agent::manager::Manager;
use vgpu_agent::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(daemon_args) => run_daemon(*daemon_args).await,
    }
}

async fn run_daemon(daemon_args: DaemonArgs) -> Result<()> {
    let _guard = logging::init(daemon_args.log_dir.as_deref());

    tracing::info!(
        node_name = %daemon_args.node_name,
        plugins = ?daemon_args.plugins,
        "Starting vgpu-agent {}",
        &**version::VERSION
    );

    Manager::new(daemon_args).run().await?;

    tracing::info!("vgpu-agent stopped");
    Ok(())
}
