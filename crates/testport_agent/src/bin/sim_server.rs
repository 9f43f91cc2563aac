use std::env;
use std::process::ExitCode;

use testport_agent::launch::{parse_launch_args, run_sim_server, SimServerOptions};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    init_tracing();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            error!(error = %message, "sim_server_failed");
            eprintln!("{message}");
            ExitCode::from(1)
        }
    }
}

fn run() -> Result<(), String> {
    let launch = parse_launch_args(env::args().skip(1)).map_err(|message| {
        format!("{message}\n\n{}", usage_text())
    })?;
    info!(
        heap_mb = launch.heap_mb,
        jar = ?launch.jar,
        properties = launch.properties.len(),
        "sim_server_launch"
    );
    let options = SimServerOptions::from_launch(launch)?;
    run_sim_server(options).map_err(|error| error.to_string())
}

fn usage_text() -> String {
    "usage: sim_server [-Xmx<mb>M] [-Xms<mb>M] [-D<key>=<value>]... [-jar <server.jar>] [--nogui]"
        .to_string()
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}
