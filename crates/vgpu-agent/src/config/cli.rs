use clap::Parser;
use clap::Subcommand;

use crate::config::daemon::DaemonArgs;
use crate::version;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the device plugin agent
    Daemon(Box<DaemonArgs>),
}
