use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand};
use easelcomm::comm::CommConfig;
use easelcomm::frame::ChannelId;
use easelcomm::link::LinkConfig;
use easelcomm::transport::ServiceId;

use crate::exit::CliResult;
use crate::output::OutputFormat;

pub mod echo;
pub mod send;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve a service and echo every message back on its channel.
    Echo(EchoArgs),
    /// Send a single message.
    Send(SendArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Echo(args) => echo::run(args, format),
        Command::Send(args) => send::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

/// Where the per-service sockets live.
#[derive(Args, Debug, Clone)]
pub struct LinkArgs {
    /// Directory holding the service sockets.
    #[arg(long, value_name = "DIR", env = "EASELCOMM_SOCKET_DIR")]
    pub socket_dir: Option<PathBuf>,
}

impl LinkArgs {
    pub fn comm_config(&self) -> CommConfig {
        let link = match &self.socket_dir {
            Some(dir) => LinkConfig::with_socket_dir(dir),
            None => LinkConfig::default(),
        };
        CommConfig::with_link(link)
    }
}

#[derive(Args, Debug)]
pub struct EchoArgs {
    /// Service to serve (id or name, e.g. 2 or test).
    #[arg(long, short = 's', value_parser = parse_service, default_value = "test")]
    pub service: ServiceId,
    /// Channels to echo (comma-separated).
    #[arg(long, value_delimiter = ',', default_value = "1")]
    pub channels: Vec<ChannelId>,
    /// Keep serving: accept a new peer each time one disconnects.
    #[arg(long)]
    pub persistent: bool,
    /// Pause between sessions with --persistent (e.g. 1s, 200ms).
    #[arg(long, value_parser = parse_duration, default_value = "100ms")]
    pub retry_delay: Duration,
    #[command(flatten)]
    pub link: LinkArgs,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Service to connect to (id or name).
    #[arg(long, short = 's', value_parser = parse_service, default_value = "test")]
    pub service: ServiceId,
    /// Channel to send on.
    #[arg(long, short = 'c', default_value = "1")]
    pub channel: ChannelId,
    /// JSON record body.
    #[arg(long, conflicts_with_all = ["data", "file", "ping"])]
    pub json: Option<String>,
    /// String body.
    #[arg(long, conflicts_with_all = ["json", "file", "ping"])]
    pub data: Option<String>,
    /// Raw body read from a file.
    #[arg(long, conflicts_with_all = ["json", "data", "ping"])]
    pub file: Option<PathBuf>,
    /// Send a ping.
    #[arg(long)]
    pub ping: bool,
    /// Attach the file's contents as a DMA payload.
    #[arg(long, value_name = "FILE")]
    pub payload_file: Option<PathBuf>,
    /// Wait for one reply on the same channel and print it.
    #[arg(long)]
    pub wait: bool,
    /// Maximum time to wait for the reply when --wait is set.
    #[arg(long, value_parser = parse_duration, default_value = "5s")]
    pub wait_timeout: Duration,
    /// Maximum time to wait for the service to come up.
    #[arg(long, value_parser = parse_duration, default_value = "5s")]
    pub connect_timeout: Duration,
    #[command(flatten)]
    pub link: LinkArgs,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Accepts a numeric id or a built-in service name (`model-execution`,
/// `MODEL_EXECUTION`, ...).
pub fn parse_service(input: &str) -> Result<ServiceId, String> {
    let input = input.trim();
    if let Ok(id) = input.parse::<u32>() {
        return Ok(ServiceId(id));
    }
    let wanted = input.to_ascii_uppercase().replace('-', "_");
    (0..ServiceId::USER_START)
        .map(ServiceId)
        .find(|service| service.name() == wanted && wanted != "RESERVED")
        .ok_or_else(|| format!("unknown service: {input}"))
}

/// Parses `500ms`, `2s` or a bare number of seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("duration must not be empty".to_string());
    }

    let (number, millis) = match input.strip_suffix("ms") {
        Some(number) => (number, true),
        None => (input.strip_suffix('s').unwrap_or(input), false),
    };
    let value: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration value: {input}"))?;
    if value == 0 {
        return Err("duration must be greater than zero".to_string());
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn services_parse_by_id_or_name() {
        assert_eq!(parse_service("4"), Ok(ServiceId::MODEL_EXECUTION));
        assert_eq!(parse_service("model-execution"), Ok(ServiceId::MODEL_EXECUTION));
        assert_eq!(parse_service("Test"), Ok(ServiceId::TEST));
        assert_eq!(parse_service("40"), Ok(ServiceId(40)));
        assert!(parse_service("reserved").is_err());
        assert!(parse_service("camera").is_err());
    }

    #[test]
    fn durations_parse_seconds_and_millis() {
        assert_eq!(parse_duration("2s"), Ok(Duration::from_secs(2)));
        assert_eq!(parse_duration("150ms"), Ok(Duration::from_millis(150)));
        assert_eq!(parse_duration("3"), Ok(Duration::from_secs(3)));
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn socket_dir_flows_into_link_config() {
        let args = LinkArgs {
            socket_dir: Some(PathBuf::from("/run/easel")),
        };
        let config = args.comm_config();
        assert_eq!(
            config.link.socket_path(ServiceId::TEST),
            PathBuf::from("/run/easel/service-2.sock")
        );
    }
}
