//! The wire protocol: length-prefixed JSON frames over TCP.
//!
//! A request is a 4-byte big-endian length followed by a JSON envelope
//! `{"method": <name>, "body": <request>}`; the response is a length-prefixed
//! JSON body with no envelope. One request per connection.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use raft::{Method, NodeAddr, Transport, TransportError};

/// Upper bound on a single frame; anything larger is a protocol error.
const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

#[derive(Serialize, Deserialize)]
pub(crate) struct Envelope {
    pub method: Method,
    pub body: Box<RawValue>,
}

pub(crate) fn write_frame<W: Write>(writer: &mut W, bytes: &[u8]) -> io::Result<()> {
    let len = bytes.len() as u32;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(bytes)
}

pub(crate) fn read_frame<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds the limit", len),
        ));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// One call against a node: resolve, connect, send the envelope, read the
/// response body. Every step is bounded by `timeout`.
pub fn call(
    addr: &NodeAddr,
    method: Method,
    request: &[u8],
    timeout: Duration,
) -> Result<Bytes, TransportError> {
    let socket = addr.as_str().to_socket_addrs()?.next().ok_or_else(|| {
        TransportError::Io(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("{} does not resolve", addr),
        ))
    })?;
    let mut stream = TcpStream::connect_timeout(&socket, timeout)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    let body = std::str::from_utf8(request)
        .map_err(|err| TransportError::Codec(err.to_string()))
        .and_then(|text| {
            RawValue::from_string(text.to_owned()).map_err(|err| TransportError::Codec(err.to_string()))
        })?;
    let frame = serde_json::to_vec(&Envelope { method, body })
        .map_err(|err| TransportError::Codec(err.to_string()))?;

    write_frame(&mut stream, &frame)?;
    let response = read_frame(&mut stream)?;
    Ok(Bytes::from(response))
}

/// The outbound transport handed to the consensus engine: one connection per
/// call, deadline applied to connect, write and read.
pub struct TcpTransport {
    rpc_timeout: Duration,
}

impl TcpTransport {
    pub fn new(rpc_timeout: Duration) -> Self {
        TcpTransport { rpc_timeout }
    }
}

impl Transport for TcpTransport {
    fn call(
        &self,
        method: Method,
        addr: &NodeAddr,
        request: &[u8],
    ) -> Result<Bytes, TransportError> {
        call(addr, method, request, self.rpc_timeout)
    }
}
