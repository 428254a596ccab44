use vpnprov_control_plane::{Config, ControlPlaneServerBuilder, VERSION, server::ControlPlaneServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::args().any(|arg| arg == "--version" || arg == "-V") {
        println!("vpnprov-control-plane {VERSION}");
        return Ok(());
    }

    ControlPlaneServer::init_logging();

    // Load configuration from environment
    let config = Config::from_env()?;

    let server = ControlPlaneServerBuilder::new().with_config(config).build()?;
    server.run().await
}
