use std::{error::Error, net::SocketAddr};

use clap::Parser;
use cryo_driver::protocol::EchoServer;

#[derive(Debug, Parser)]
struct Cli {
    /// Listen for new connection at address
    address: SocketAddr,
    /// Result items per batch; longer arrays are streamed in partial batches
    #[arg(long, default_value_t = 2)]
    batch_size: usize,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let server = EchoServer::bind(cli.address, cli.batch_size)?;

    server.listen()?;
    Ok(())
}
