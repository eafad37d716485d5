mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "easelcomm", version, about = "AP/coprocessor link CLI")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    match cmd::run(cli.command, format) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use easelcomm::transport::ServiceId;

    #[test]
    fn parses_send_subcommand() {
        let cli = Cli::try_parse_from([
            "easelcomm",
            "send",
            "--service",
            "model-execution",
            "--channel",
            "3",
            "--data",
            "hello",
        ])
        .expect("send args should parse");

        match cli.command {
            Command::Send(args) => {
                assert_eq!(args.service, ServiceId::MODEL_EXECUTION);
                assert_eq!(args.channel, 3);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn rejects_conflicting_body_args() {
        let err = Cli::try_parse_from([
            "easelcomm",
            "send",
            "--json",
            "{\"x\":1}",
            "--data",
            "hello",
        ])
        .expect_err("conflicting args should fail");

        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn echo_channels_are_comma_separated() {
        let cli = Cli::try_parse_from(["easelcomm", "echo", "--channels", "1,4,9", "--persistent"])
            .expect("echo args should parse");
        match cli.command {
            Command::Echo(args) => {
                assert_eq!(args.channels, vec![1, 4, 9]);
                assert!(args.persistent);
                assert_eq!(args.service, ServiceId::TEST);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn unknown_service_is_rejected() {
        let err = Cli::try_parse_from(["easelcomm", "send", "--service", "camera"])
            .expect_err("unknown service should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }
}
