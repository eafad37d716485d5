use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use easelcomm::comm::{self, Comm};
use easelcomm::frame::{Message, MessageType};
use easelcomm::transport::{HardwareBuffer, Role, ServiceId};

use crate::cmd::EchoArgs;
use crate::exit::{comm_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::OutputFormat;

pub fn run(args: EchoArgs, _format: OutputFormat) -> CliResult<i32> {
    let comm = Comm::new(Role::Server, args.link.comm_config());
    for &channel in &args.channels {
        comm.register_handler(channel, echo_handler);
    }

    let interrupted = Arc::new(AtomicBool::new(false));
    install_ctrlc_handler(comm.clone(), interrupted.clone())?;

    tracing::info!(
        service = %args.service,
        channels = ?args.channels,
        persistent = args.persistent,
        "echo server starting"
    );

    let result = if args.persistent {
        comm.open_persistent(args.service, args.retry_delay)
    } else {
        serve_once(&comm, args.service)
    };
    comm.close();

    match result {
        Ok(()) => Ok(SUCCESS),
        // Ctrl-C aborts a pending open; that is a clean exit.
        Err(_) if interrupted.load(Ordering::SeqCst) => Ok(SUCCESS),
        Err(err) => Err(comm_error("echo session failed", err)),
    }
}

/// Serve a single peer until it disconnects.
fn serve_once(comm: &Comm, service: ServiceId) -> comm::Result<()> {
    comm.open(service, None)?;
    comm.start_receiving()?;
    comm.join_receiving();
    Ok(())
}

fn install_ctrlc_handler(comm: Comm, interrupted: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        interrupted.store(true, Ordering::SeqCst);
        comm.close();
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}

fn echo_handler(comm: &Comm, message: &Message) {
    if let Err(err) = echo(comm, message) {
        tracing::warn!(channel = message.channel(), error = %err, "echo failed");
    }
}

/// Send `message` back on its channel with the same type, body and payload.
fn echo(comm: &Comm, message: &Message) -> comm::Result<()> {
    let channel = message.channel();
    let payload = match message.payload() {
        Some(descriptor) if descriptor.size > 0 => {
            let mut buffer = HardwareBuffer::zeroed(descriptor.size);
            comm.receive_payload(message, Some(&mut buffer))?;
            Some(buffer)
        }
        _ => None,
    };

    let raw = || Message::from_raw(channel, message.body(), payload.as_ref());
    let reply = match message.message_type() {
        MessageType::Ping => return comm.send_ping(channel),
        MessageType::String => match message.as_str() {
            Some(text) => Message::from_string(channel, text, payload.as_ref()),
            None => raw(),
        },
        MessageType::Record => match message.to_record::<serde_json::Value>() {
            Some(record) => Message::from_record(channel, &record, payload.as_ref())?,
            None => raw(),
        },
        MessageType::Raw => raw(),
    };

    tracing::info!(
        channel,
        size = message.body_size(),
        payload = ?payload.as_ref().map(HardwareBuffer::size),
        "echoing message"
    );
    comm.send_message(&reply, payload.as_ref())
}
