use minemock::config_loader::Config;
use minemock::server::MockServer;
use minemock::{logger, metrics};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize the logger
    logger::init_logger();

    // Print banner and startup messages
    println!("█▀▄▀█ █ █▄░█ █▀▀ █▀▄▀█ █▀█ █▀▀ █▄▀");
    println!("█░▀░█ █ █░▀█ ██▄ █░▀░█ █▄█ █▄▄ █░█");

    let config = Config::from_env();
    println!("// Mock server on {}", config.address());
    if config.login.real_server_addr.is_empty() {
        println!("// Proxying disabled, all logins rejected.");
    } else {
        println!(
            "// Whitelisted players forwarded to {}.",
            config.login.real_server_addr
        );
    }
    println!("//////////////////////////////////");

    if !config.metrics_bind_address.is_empty() {
        metrics::spawn_metrics_server(config.metrics_bind_address.parse()?);
    }

    let server = MockServer::start(&config.address(), config.status, config.login).await?;
    server.wait().await;

    Ok(())
}
