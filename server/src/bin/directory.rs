use clap::Parser;
use server::directory::DirectoryServer;
use shared::DIRECTORY_PORT;

/// Directory service listing running table servers
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Port to listen on
    #[arg(env = "TABLETOP_DIRECTORY_PORT", default_value_t = DIRECTORY_PORT)]
    port: u16,

    /// Address to bind to
    #[arg(short = 'H', long, default_value = "0.0.0.0")]
    host: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let service = DirectoryServer::bind(&format!("{}:{}", args.host, args.port)).await?;

    tokio::select! {
        result = service.run() => result?,
        _ = tokio::signal::ctrl_c() => log::info!("Directory shutting down"),
    }
    Ok(())
}
