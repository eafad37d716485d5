use std::fs;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::Duration;

use easelcomm::comm::{Comm, CommError};
use easelcomm::frame::{ChannelId, Message};
use easelcomm::transport::{HardwareBuffer, Role};

use crate::cmd::SendArgs;
use crate::exit::{comm_error, io_error, CliError, CliResult, FAILURE, SUCCESS, TIMEOUT, USAGE};
use crate::output::{print_reply, OutputFormat, Reply};

/// Message body selected on the command line.
#[derive(Debug, PartialEq)]
enum Body {
    Text(String),
    Record(serde_json::Value),
    Raw(Vec<u8>),
    Ping,
}

pub fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let body = resolve_body(&args)?;
    let payload = args
        .payload_file
        .as_deref()
        .map(read_payload)
        .transpose()?;

    let comm = Comm::new(Role::Client, args.link.comm_config());
    let replies = args.wait.then(|| capture_replies(&comm, args.channel));

    comm.open(args.service, Some(args.connect_timeout))
        .map_err(|err| comm_error("connect failed", err))?;
    let result = exchange(&comm, &args, &body, payload.as_ref(), replies.as_ref());
    comm.close();

    if let Some(reply) = result? {
        print_reply(&reply, args.service, format);
    }
    Ok(SUCCESS)
}

fn exchange(
    comm: &Comm,
    args: &SendArgs,
    body: &Body,
    payload: Option<&HardwareBuffer>,
    replies: Option<&Receiver<Reply>>,
) -> CliResult<Option<Reply>> {
    comm.start_receiving()
        .map_err(|err| comm_error("receive thread failed", err))?;

    let channel = args.channel;
    let sent = match body {
        Body::Text(text) => comm.send_string(channel, text, payload),
        Body::Record(record) => comm.send_record(channel, record, payload),
        Body::Raw(bytes) => comm.send_raw(channel, bytes, payload),
        Body::Ping => comm.send_ping(channel),
    };
    sent.map_err(|err| comm_error("send failed", err))?;
    tracing::debug!(channel, service = %args.service, "message sent");

    match replies {
        Some(replies) => wait_for_reply(replies, args.wait_timeout).map(Some),
        None => Ok(None),
    }
}

fn resolve_body(args: &SendArgs) -> CliResult<Body> {
    if args.ping {
        if args.payload_file.is_some() {
            return Err(CliError::new(USAGE, "--ping cannot carry a payload"));
        }
        return Ok(Body::Ping);
    }
    if let Some(json) = &args.json {
        let record = serde_json::from_str(json)
            .map_err(|err| CliError::new(USAGE, format!("--json is not valid JSON: {err}")))?;
        return Ok(Body::Record(record));
    }
    if let Some(data) = &args.data {
        return Ok(Body::Text(data.clone()));
    }
    if let Some(path) = &args.file {
        let bytes = fs::read(path)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err))?;
        return Ok(Body::Raw(bytes));
    }
    Ok(Body::Raw(Vec::new()))
}

fn read_payload(path: &Path) -> CliResult<HardwareBuffer> {
    let bytes = fs::read(path)
        .map_err(|err| io_error(&format!("failed reading {}", path.display()), err))?;
    if bytes.is_empty() {
        return Err(CliError::new(
            USAGE,
            format!("payload file {} is empty", path.display()),
        ));
    }
    Ok(HardwareBuffer::from_slice(&bytes))
}

/// Route the first messages on `channel` into a queue, payloads pulled.
fn capture_replies(comm: &Comm, channel: ChannelId) -> Receiver<Reply> {
    let (tx, rx) = mpsc::channel();
    comm.register_handler(channel, move |comm: &Comm, message: &Message| {
        let payload = match pull_payload(comm, message) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(
                    channel = message.channel(),
                    error = %err,
                    "could not pull reply payload"
                );
                None
            }
        };
        let _ = tx.send(Reply {
            channel: message.channel(),
            message_type: message.message_type(),
            body: message.body().to_vec(),
            payload,
        });
    });
    rx
}

fn pull_payload(comm: &Comm, message: &Message) -> Result<Option<Vec<u8>>, CommError> {
    match message.payload() {
        Some(descriptor) if descriptor.size > 0 => {
            let mut buffer = HardwareBuffer::zeroed(descriptor.size);
            comm.receive_payload(message, Some(&mut buffer))?;
            Ok(Some(buffer.to_vec()?))
        }
        _ => Ok(None),
    }
}

fn wait_for_reply(replies: &Receiver<Reply>, timeout: Duration) -> CliResult<Reply> {
    replies.recv_timeout(timeout).map_err(|err| match err {
        RecvTimeoutError::Timeout => {
            CliError::new(TIMEOUT, format!("no reply within {timeout:?}"))
        }
        RecvTimeoutError::Disconnected => CliError::new(FAILURE, "reply handler went away"),
    })
}
