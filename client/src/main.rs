use clap::Parser;
use client::network::{self, Client};
use log::info;
use shared::{DirPackageLoader, DEFAULT_PORT, DIRECTORY_PORT};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server (or directory, with --list) to connect to
    #[arg(default_value = "127.0.0.1")]
    host: String,

    /// Port, defaults to the game or directory port
    port: Option<u16>,

    /// Nick to join with
    #[arg(short, long, env = "TABLETOP_NICK", default_value = "player")]
    nick: String,

    /// Directory holding the class packages
    #[arg(short, long, env = "TABLETOP_PACKAGES", default_value = "packages")]
    packages: PathBuf,

    /// List the servers known to a directory instead of joining
    #[arg(short, long)]
    list: bool,

    /// Run the commands in this file once joined
    #[arg(short, long)]
    script: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    if args.list {
        let port = args.port.unwrap_or(DIRECTORY_PORT);
        let addr = network::resolve(&args.host, port).await?;
        network::list_servers(addr).await?;
        return Ok(());
    }

    let port = args.port.unwrap_or(DEFAULT_PORT);
    let addr = network::resolve(&args.host, port).await?;
    info!("Starting client as {:?}", args.nick);
    info!("Type /table, /who or /quit; plain text is chat");

    let loader = Box::new(DirPackageLoader::new(&args.packages));
    let client = Client::new(addr, &args.nick, loader, args.script).await?;
    client.run().await?;

    Ok(())
}
