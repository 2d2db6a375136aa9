use std::io::{self, BufReader};
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use tracing::info;

use ykrpc::adapters::{PcscBackend, VirtualBackend};
use ykrpc::node::DeviceTree;
use ykrpc::rpc;

#[derive(Parser, Debug)]
#[command(name = "ykrpc")]
#[command(about = "JSON-lines access to attached YubiKeys as a resource tree", version)]
pub struct Cli {
    #[command(flatten)]
    pub verbosity: Verbosity<WarnLevel>,

    /// Device backend (pcsc=system smartcard service, virtual=simulated demo keys)
    #[arg(long, default_value = "pcsc")]
    pub backend: BackendArg,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum BackendArg {
    Pcsc,
    Virtual,
}

impl BackendArg {
    fn tree(self) -> DeviceTree {
        match self {
            BackendArg::Pcsc => DeviceTree::new(Arc::new(PcscBackend), Arc::new(PcscBackend)),
            BackendArg::Virtual => {
                let backend = VirtualBackend::demo();
                DeviceTree::new(Arc::new(backend.clone()), Arc::new(backend))
            }
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .with_writer(io::stderr)
        .init();

    info!("Starting with {:?} backend", cli.backend);
    let mut tree = cli.backend.tree();
    rpc::serve(BufReader::new(io::stdin()), io::stdout(), &mut tree)?;
    Ok(())
}
