use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "meshmon")]
#[command(version = concat!("Ver:", env!("CARGO_PKG_VERSION")))]
#[command(about = "Mesh network health agent with UDP probing and VoIP quality monitoring")]
pub struct Cli {
    /// Configuration file (flat key=value or INI with a [mesh_monitor] section)
    #[arg(short = 'c', long = "config", default_value = "/etc/sipserver.conf")]
    pub config: PathBuf,

    /// Override the mesh DNS domain used to resolve node and phone names
    #[arg(long = "mesh-domain")]
    pub mesh_domain: Option<String>,

    /// Run a single discovery scan and exit
    #[arg(long = "scan-once")]
    pub scan_once: bool,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
