use std::io::{IsTerminal, Write};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use easelcomm::frame::{ChannelId, MessageType};
use easelcomm::transport::ServiceId;
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// A reply captured by `send --wait`, payload already pulled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub channel: ChannelId,
    pub message_type: MessageType,
    pub body: Vec<u8>,
    pub payload: Option<Vec<u8>>,
}

#[derive(Serialize)]
struct ReplyOutput<'a> {
    service: u32,
    service_name: &'a str,
    channel: ChannelId,
    message_type: &'a str,
    body_size: usize,
    body: String,
    payload_size: Option<usize>,
}

pub fn print_reply(reply: &Reply, service: ServiceId, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = ReplyOutput {
                service: service.as_u32(),
                service_name: service.name(),
                channel: reply.channel,
                message_type: type_name(reply.message_type),
                body_size: reply.body.len(),
                body: body_preview(reply),
                payload_size: reply.payload.as_ref().map(Vec::len),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["SERVICE", "CHANNEL", "TYPE", "SIZE", "PAYLOAD", "BODY"])
                .add_row(vec![
                    service.to_string(),
                    reply.channel.to_string(),
                    type_name(reply.message_type).to_string(),
                    reply.body.len().to_string(),
                    payload_size(reply),
                    body_preview(reply),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "service={service} channel={} type={} size={} payload={} body={}",
                reply.channel,
                type_name(reply.message_type),
                reply.body.len(),
                payload_size(reply),
                body_preview(reply)
            );
        }
        OutputFormat::Raw => {
            print_raw(&reply.body);
            if let Some(payload) = &reply.payload {
                print_raw(payload);
            }
        }
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

pub fn type_name(message_type: MessageType) -> &'static str {
    match message_type {
        MessageType::Raw => "raw",
        MessageType::String => "string",
        MessageType::Record => "record",
        MessageType::Ping => "ping",
    }
}

fn payload_size(reply: &Reply) -> String {
    reply
        .payload
        .as_ref()
        .map(|payload| payload.len().to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn body_preview(reply: &Reply) -> String {
    // Strings travel NUL-terminated.
    let body = match reply.message_type {
        MessageType::String => reply.body.strip_suffix(&[0]).unwrap_or(&reply.body),
        _ => &reply.body[..],
    };
    match std::str::from_utf8(body) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", body.len()),
    }
}
