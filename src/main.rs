mod config;
mod meter;
mod mqtt;
mod sensor;
mod service;

use anyhow::Result;
use clap::Parser;
use log::info;

fn main() -> Result<()> {
    env_logger::init();

    let config = config::Config::parse();

    let identity = service::Identity {
        service_base: config.servicebase.clone(),
        device_instance: config.device_instance,
        connection: config.host.clone(),
    };
    let tree = service::ServiceTree::new(&identity);
    info!("Starting {} v{} as {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"), tree.name());

    let mut meter = meter::Meter::new(tree);
    mqtt::Bridge::connect(&config).run(&mut meter)
}
