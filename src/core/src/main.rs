use clap::error::ErrorKind;
use clap::Parser;
use log::{error, info};
use tcpspy::configuration::Config;
use tcpspy::network::NetworkListener;

#[tokio::main]
async fn main() {
    // https://docs.rs/env_logger/latest/env_logger/
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_target(false)
        .target(env_logger::Target::Stdout)
        .init();

    let config = match Config::try_parse() {
        Ok(config) => config,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => e.exit(),
        Err(e) => {
            println!("{}", e.render());
            std::process::exit(1);
        }
    };

    if let Err(e) = config.validate() {
        println!("{}", e);
        std::process::exit(1);
    }

    println!(
        "Start listening on port {} and forwarding data to {}",
        config.listen_port,
        config.target()
    );

    let listener = match NetworkListener::bind(&config).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Unable to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    };

    if let Err(e) = listener.run(shutdown).await {
        error!("{}, exiting...", e);
        std::process::exit(1);
    }
    info!("stopped");
}
