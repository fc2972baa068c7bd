use clap::Parser;
use log::info;
use server::config::{Args, Settings};
use server::network::Server;
use shared::DirPackageLoader;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings = Settings::from(Args::parse());
    info!(
        "Starting table server {:?} with packages from {}",
        settings.name,
        settings.packages.display()
    );

    let loader = Box::new(DirPackageLoader::new(&settings.packages));
    let server = Server::bind(settings, loader).await?;
    server.run().await?;

    Ok(())
}
