//! Versioned HELLO exchange run on every new link before any message flows.

use std::io::{ErrorKind, Read, Write};
use std::time::Instant;

use easelcomm_frame::{FrameError, FrameKind, FrameReader, FrameWriter, LinkFrame};
use easelcomm_transport::{ServiceId, TransportError};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::HandshakeConfig;

type Result<T> = std::result::Result<T, TransportError>;

const MAX_PROTOCOL_LEN: usize = 32;
const MAX_VERSION_LEN: usize = 16;
const MAX_HELLO_SIZE: usize = 1024;

/// HELLO body, identical in both directions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Hello {
    /// Protocol name. `easelcomm` by default.
    pub protocol: String,
    /// Protocol version, `<major>.<minor>`.
    pub version: String,
    /// Service id the sender opened.
    pub service: u32,
}

impl Hello {
    fn local(config: &HandshakeConfig, service: ServiceId) -> Self {
        Self {
            protocol: config.protocol_name.clone(),
            version: config.protocol_version.clone(),
            service: service.as_u32(),
        }
    }
}

/// Client side: announce ourselves, then check the server's answer.
pub fn handshake_client<R: Read, W: Write>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    service: ServiceId,
    config: &HandshakeConfig,
) -> Result<Hello> {
    validate_protocol_name(&config.protocol_name)?;
    validate_version(&config.protocol_version)?;

    send_hello(writer, &Hello::local(config, service))?;
    let reply = recv_hello(reader, config)?;

    check_peer(&reply, config, service)?;
    if !is_version_compatible(&config.protocol_version, &reply.version)? {
        return Err(TransportError::Handshake(format!(
            "incompatible version '{}' (local '{}')",
            reply.version, config.protocol_version
        )));
    }
    debug!(service = %service, version = %reply.version, "client handshake complete");
    Ok(reply)
}

/// Server side: check the client's HELLO and answer it.
///
/// A rejected client gets no answer; dropping the stream tells it.
pub fn handshake_server<R: Read, W: Write>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    service: ServiceId,
    config: &HandshakeConfig,
) -> Result<Hello> {
    validate_protocol_name(&config.protocol_name)?;
    validate_version(&config.protocol_version)?;

    let hello = recv_hello(reader, config)?;
    check_peer(&hello, config, service)?;
    if !is_version_compatible(&hello.version, &config.protocol_version)? {
        return Err(TransportError::Handshake(format!(
            "incompatible version '{}' (server '{}')",
            hello.version, config.protocol_version
        )));
    }

    send_hello(writer, &Hello::local(config, service))?;
    debug!(service = %service, version = %hello.version, "server handshake complete");
    Ok(hello)
}

fn check_peer(hello: &Hello, config: &HandshakeConfig, service: ServiceId) -> Result<()> {
    validate_protocol_name(&hello.protocol)?;
    validate_version(&hello.version)?;
    if hello.protocol != config.protocol_name {
        return Err(TransportError::Handshake(format!(
            "unknown protocol '{}' (expected '{}')",
            hello.protocol, config.protocol_name
        )));
    }
    if hello.service != service.as_u32() {
        return Err(TransportError::Handshake(format!(
            "peer opened service {} on the socket for {}",
            ServiceId(hello.service),
            service
        )));
    }
    Ok(())
}

fn send_hello<W: Write>(writer: &mut FrameWriter<W>, hello: &Hello) -> Result<()> {
    let body = serde_json::to_vec(hello)
        .map_err(|err| TransportError::Handshake(format!("cannot encode HELLO: {err}")))?;
    writer
        .write_frame(&LinkFrame::new(FrameKind::Hello, 0, body))
        .map_err(|err| match err {
            FrameError::Io(err) => TransportError::Io(err),
            other => TransportError::Handshake(other.to_string()),
        })
}

fn recv_hello<R: Read>(reader: &mut FrameReader<R>, config: &HandshakeConfig) -> Result<Hello> {
    let deadline = Instant::now() + config.timeout;
    loop {
        if Instant::now() >= deadline {
            return Err(TransportError::Timeout(config.timeout));
        }

        match reader.read_frame() {
            Ok(frame) if frame.kind != FrameKind::Hello => {
                return Err(TransportError::Handshake(format!(
                    "expected HELLO, got {:?}",
                    frame.kind
                )));
            }
            Ok(frame) => {
                if frame.body.len() > MAX_HELLO_SIZE {
                    return Err(TransportError::Handshake(format!(
                        "HELLO too large: {} (max {})",
                        frame.body.len(),
                        MAX_HELLO_SIZE
                    )));
                }
                return serde_json::from_slice(&frame.body)
                    .map_err(|err| TransportError::Handshake(format!("malformed HELLO: {err}")));
            }
            Err(FrameError::Io(err))
                if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(FrameError::ConnectionClosed) => {
                return Err(TransportError::Handshake(
                    "connection closed during handshake".to_string(),
                ));
            }
            Err(err) => return Err(TransportError::Handshake(err.to_string())),
        }
    }
}

fn validate_protocol_name(protocol: &str) -> Result<()> {
    if protocol.is_empty() || protocol.len() > MAX_PROTOCOL_LEN {
        return Err(TransportError::Handshake(format!(
            "invalid protocol name length: {}",
            protocol.len()
        )));
    }
    Ok(())
}

fn validate_version(version: &str) -> Result<()> {
    if version.is_empty() || version.len() > MAX_VERSION_LEN {
        return Err(TransportError::Handshake(format!(
            "invalid protocol version length: {}",
            version.len()
        )));
    }
    parse_version(version).map(|_| ())
}

fn is_version_compatible(client_version: &str, server_version: &str) -> Result<bool> {
    let (client_major, client_minor) = parse_version(client_version)?;
    let (server_major, server_minor) = parse_version(server_version)?;

    Ok(client_major == server_major && client_minor >= server_minor)
}

fn parse_version(version: &str) -> Result<(u16, u16)> {
    let invalid =
        |why: &str| TransportError::Handshake(format!("invalid version '{version}': {why}"));

    let (major, minor) = version
        .split_once('.')
        .ok_or_else(|| invalid("expected '<major>.<minor>'"))?;
    if minor.contains('.') {
        return Err(invalid("expected '<major>.<minor>'"));
    }

    let major = major.parse::<u16>().map_err(|_| invalid("non-numeric major"))?;
    let minor = minor.parse::<u16>().map_err(|_| invalid("non-numeric minor"))?;
    Ok((major, minor))
}
