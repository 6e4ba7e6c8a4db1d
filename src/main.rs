use clap::{Arg, Command};
use kafexec::executor;
use kafexec::poller::Poller;
use kafexec::publisher;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("kafexec").arg(
        Arg::new("bus")
            .value_name("BUS_ADDR")
            .help("Address of the kaf bus, e.g. 127.0.0.1:7749")
            .required(true),
    )
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let matches = cli().get_matches();
    let bus_addr = matches
        .get_one::<String>("bus")
        .expect("bus is a required argument");

    let client = match reqwest::Client::builder().build() {
        Ok(client) => client,
        Err(e) => {
            tracing::error!(error = %e, "failed to build http client");
            return ExitCode::FAILURE;
        }
    };

    let poller = Poller::new(bus_addr, client.clone());
    let put_url = format!("{}put/xx", poller.base_url());
    let handle = publisher::spawn(client, put_url);

    tracing::info!(base = poller.base_url(), "starting poll loop");
    poller
        .run(move |batch| {
            executor::dispatch_all(batch, handle.clone());
        })
        .await;

    ExitCode::SUCCESS
}
