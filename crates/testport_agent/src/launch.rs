//! Command line and update loop of the simulated server binary.

use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::config::{properties_from_env, AgentConfig, Properties};
use crate::host::{AdapterStrategy, GameHost};
use crate::sim::{SimAdapterStrategy, SimHost, SIM_SERVER_VERSION};
use crate::{Agent, AgentStartError};

pub const PROP_NEVER_READY: &str = "testport.sim.neverReady";
pub const PROP_IGNORE_STOP: &str = "testport.sim.ignoreStop";
pub const PROP_READY_DELAY_MS: &str = "testport.sim.readyDelayMs";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LaunchArgs {
    pub properties: Properties,
    pub heap_mb: Option<u32>,
    pub jar: Option<PathBuf>,
    pub nogui: bool,
}

/// Parses a JVM-style server command line (`-Xmx1024M -Dkey=value -jar server.jar --nogui`).
pub fn parse_launch_args<I>(args: I) -> Result<LaunchArgs, String>
where
    I: IntoIterator<Item = String>,
{
    let mut parsed = LaunchArgs::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        if let Some(definition) = arg.strip_prefix("-D") {
            let (key, value) = definition
                .split_once('=')
                .ok_or_else(|| format!("invalid property definition '{arg}' (expected -Dkey=value)"))?;
            parsed.properties.insert(key.to_string(), value.to_string());
        } else if let Some(size) = arg.strip_prefix("-Xmx") {
            parsed.heap_mb = Some(parse_heap_mb(size)?);
        } else if arg.starts_with("-Xms") {
            continue;
        } else if arg == "-jar" {
            let jar = args
                .next()
                .ok_or_else(|| "missing value for -jar".to_string())?;
            parsed.jar = Some(PathBuf::from(jar));
        } else if arg == "--nogui" || arg == "nogui" {
            parsed.nogui = true;
        } else {
            return Err(format!("unrecognized argument '{arg}'"));
        }
    }
    Ok(parsed)
}

fn parse_heap_mb(raw: &str) -> Result<u32, String> {
    let digits = raw.trim_end_matches(['M', 'm']);
    digits
        .parse::<u32>()
        .map_err(|_| format!("invalid heap size '{raw}' (expected megabytes such as 1024M)"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimServerOptions {
    pub properties: Properties,
    pub target_tps: u32,
    pub never_ready: bool,
    pub ignore_stop: bool,
    pub ready_delay: Duration,
}

impl SimServerOptions {
    /// Launch-line properties override values taken from the environment.
    pub fn from_launch(launch: LaunchArgs) -> Result<Self, String> {
        let mut properties = properties_from_env();
        properties.extend(launch.properties);
        let ready_delay = match properties.get(PROP_READY_DELAY_MS) {
            Some(raw) => Duration::from_millis(
                raw.trim()
                    .parse::<u64>()
                    .map_err(|_| format!("invalid {PROP_READY_DELAY_MS} value '{raw}'"))?,
            ),
            None => Duration::ZERO,
        };
        Ok(Self {
            never_ready: flag(&properties, PROP_NEVER_READY),
            ignore_stop: flag(&properties, PROP_IGNORE_STOP),
            ready_delay,
            target_tps: 20,
            properties,
        })
    }
}

fn flag(properties: &Properties, key: &str) -> bool {
    properties
        .get(key)
        .is_some_and(|value| matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

enum Runtime {
    Agent(Agent),
    Standalone(Box<dyn GameHost>),
}

impl Runtime {
    fn host_mut(&mut self) -> &mut dyn GameHost {
        match self {
            Self::Agent(agent) => agent.state_mut().host_mut(),
            Self::Standalone(host) => host.as_mut(),
        }
    }

    fn tick(&mut self) {
        if let Self::Agent(agent) = self {
            agent.tick();
        }
    }

    fn shutdown(self) {
        if let Self::Agent(agent) = self {
            agent.shutdown();
        }
    }
}

/// Runs until `stop` arrives on stdin. Prints the vanilla readiness line once the agent is up.
pub fn run_sim_server(options: SimServerOptions) -> Result<(), AgentStartError> {
    let started_at = Instant::now();
    println!("Starting minecraft server version {SIM_SERVER_VERSION}");
    let host: Box<dyn GameHost> = Box::new(SimHost::new(SIM_SERVER_VERSION));
    let strategies: Vec<Box<dyn AdapterStrategy>> = vec![Box::new(SimAdapterStrategy)];

    let mut runtime = match AgentConfig::from_properties(&options.properties) {
        Ok(config) => Runtime::Agent(Agent::start(config, host, &strategies)?),
        Err(error) => {
            error!(error = %error, "agent_disabled_invalid_config");
            Runtime::Standalone(host)
        }
    };

    if !options.ready_delay.is_zero() {
        thread::sleep(options.ready_delay);
    }
    if options.never_ready {
        warn!("sim_readiness_line_suppressed");
    } else {
        println!(
            "Done ({:.3}s)! For help, type \"help\"",
            started_at.elapsed().as_secs_f64()
        );
    }

    let console = spawn_console_reader();
    let tick_duration = Duration::from_secs(1) / options.target_tps.max(1);
    let mut next_tick = Instant::now();
    loop {
        if drain_console(&console, &mut runtime, options.ignore_stop) {
            break;
        }
        runtime.tick();

        next_tick += tick_duration;
        let now = Instant::now();
        if next_tick > now {
            thread::sleep(next_tick - now);
        } else {
            next_tick = now;
        }
    }

    println!("Stopping server");
    runtime.shutdown();
    info!("sim_server_stopped");
    Ok(())
}

fn spawn_console_reader() -> Receiver<String> {
    let (sender, receiver) = mpsc::channel();
    let spawned = thread::Builder::new()
        .name("sim-console".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else {
                    break;
                };
                if sender.send(line).is_err() {
                    break;
                }
            }
        });
    if let Err(error) = spawned {
        warn!(error = %error, "sim_console_reader_unavailable");
    }
    receiver
}

/// Returns true when the server should stop.
fn drain_console(console: &Receiver<String>, runtime: &mut Runtime, ignore_stop: bool) -> bool {
    loop {
        let line = match console.try_recv() {
            Ok(line) => line,
            Err(TryRecvError::Empty) => return false,
            Err(TryRecvError::Disconnected) => return !ignore_stop,
        };
        let command = line.trim();
        if command.is_empty() {
            continue;
        }
        if command.eq_ignore_ascii_case("stop") {
            if ignore_stop {
                println!("Ignoring stop request");
                continue;
            }
            return true;
        }
        if !runtime.host_mut().dispatch_console_command(command) {
            println!("Unknown or incomplete command: {command}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn parses_jvm_style_launch_line() {
        let parsed = parse_launch_args(args(&[
            "-Xmx512M",
            "-Xms512M",
            "-Dtestport.agent.socketPath=/tmp/a.sock",
            "-Dtestport.agent.expectedSha256=",
            "-jar",
            "server.jar",
            "--nogui",
        ]))
        .expect("parse");
        assert_eq!(parsed.heap_mb, Some(512));
        assert_eq!(parsed.jar, Some(PathBuf::from("server.jar")));
        assert!(parsed.nogui);
        assert_eq!(
            parsed.properties.get("testport.agent.socketPath").map(String::as_str),
            Some("/tmp/a.sock")
        );
        assert_eq!(
            parsed.properties.get("testport.agent.expectedSha256").map(String::as_str),
            Some("")
        );
    }

    #[test]
    fn rejects_malformed_arguments() {
        assert!(parse_launch_args(args(&["-Dnovalue"])).is_err());
        assert!(parse_launch_args(args(&["-jar"])).is_err());
        assert!(parse_launch_args(args(&["-Xmxlots"])).is_err());
        assert!(parse_launch_args(args(&["--fast"])).is_err());
    }

    #[test]
    fn sim_flags_come_from_properties() {
        let mut launch = LaunchArgs::default();
        launch
            .properties
            .insert(PROP_IGNORE_STOP.to_string(), "true".to_string());
        launch
            .properties
            .insert(PROP_READY_DELAY_MS.to_string(), "25".to_string());
        let options = SimServerOptions::from_launch(launch).expect("options");
        assert!(options.ignore_stop);
        assert!(!options.never_ready);
        assert_eq!(options.ready_delay, Duration::from_millis(25));
    }
}
