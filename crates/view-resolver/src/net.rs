//! Shared socket plumbing for the DNS listeners and the recurser.

use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

/// Read a DNS message from a TCP stream.
///
/// A DNS TCP message differs from a UDP one only in its big-endian
/// `u16` length prefix.  The prefix is redundant with the counts in
/// the header, but it means the whole message can be read before
/// parsing begins.
pub async fn read_tcp_bytes(stream: &mut TcpStream) -> Result<BytesMut, TcpError> {
    match stream.read_u16().await {
        Ok(size) => {
            let expected = size as usize;
            let mut bytes = BytesMut::with_capacity(expected);
            while bytes.len() < expected {
                match stream.read_buf(&mut bytes).await {
                    Ok(0) => {
                        return Err(TcpError::TooShort {
                            id: id_from_prefix(&bytes),
                            expected,
                            actual: bytes.len(),
                        })
                    }
                    Err(error) => {
                        return Err(TcpError::IO {
                            id: id_from_prefix(&bytes),
                            error,
                        })
                    }
                    _ => (),
                }
            }
            Ok(bytes)
        }
        Err(error) => Err(TcpError::IO { id: None, error }),
    }
}

/// Write a serialised message to a TCP stream, prefixed with its
/// length.  The caller is responsible for having kept the message
/// under the 65535 octet ceiling.
pub async fn send_tcp_bytes(stream: &mut TcpStream, bytes: &[u8]) -> Result<(), io::Error> {
    let len = u16::try_from(bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "message over 65535 octets"))?;

    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(bytes).await?;

    Ok(())
}

/// Send a serialised message to the given address.
pub async fn send_udp_bytes_to(
    socket: &UdpSocket,
    target: SocketAddr,
    bytes: &[u8],
) -> Result<(), io::Error> {
    socket.send_to(bytes, target).await?;
    Ok(())
}

/// The message id, if enough of the message arrived to contain one.
fn id_from_prefix(bytes: &BytesMut) -> Option<u16> {
    if bytes.len() >= 2 {
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    } else {
        None
    }
}

/// An error that can occur when reading a DNS TCP message.
#[derive(Debug)]
pub enum TcpError {
    TooShort {
        id: Option<u16>,
        expected: usize,
        actual: usize,
    },
    IO {
        id: Option<u16>,
        error: io::Error,
    },
}

impl TcpError {
    pub fn id(&self) -> Option<u16> {
        match self {
            TcpError::TooShort { id, .. } | TcpError::IO { id, .. } => *id,
        }
    }
}

impl std::fmt::Display for TcpError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            TcpError::TooShort {
                expected, actual, ..
            } => write!(f, "message ended after {actual} of {expected} octets"),
            TcpError::IO { error, .. } => write!(f, "{error}"),
        }
    }
}

impl std::error::Error for TcpError {}
