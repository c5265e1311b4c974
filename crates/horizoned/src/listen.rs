//! The UDP and TCP listener tasks.  Both hand every query to the
//! shared `Server` on its own task, then shape and send whatever
//! comes back.

use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;

use dns_wire::types::{Message, Opcode, Rcode};
use view_resolver::net::{read_tcp_bytes, send_tcp_bytes, send_udp_bytes_to};

use crate::metrics::{DNS_REQUESTS_TOTAL, DNS_RESPONSES_TOTAL, DNS_RESPONSE_TIME_SECONDS};
use crate::respond::{shape_response, Transport};
use crate::server::Server;

/// Queries larger than this do not happen in practice: even an EDNS0
/// OPT only inflates a question by a dozen octets.
const UDP_RECV_BUFFER: usize = 1232;

/// Parse one raw message and answer it, also reporting any EDNS
/// payload size the query advertised.  `None` means the datagram was
/// not even well-formed enough to merit an error response.
async fn handle_raw_message(
    server: &Server,
    buf: &[u8],
    peer: SocketAddr,
) -> Option<(Message, Option<u16>)> {
    match Message::from_octets(buf) {
        Ok(message) => {
            tracing::trace!(?message, "got message");
            let edns_payload_size = message.edns_udp_payload_size();
            let response = if message.header.is_response {
                Message::make_format_error_response(message.header.id)
            } else if message.header.opcode == Opcode::Standard {
                server.handle_query(&message, peer).await
            } else {
                let mut response = message.make_response();
                response.header.rcode = Rcode::NotImplemented;
                response
            };
            Some((response, edns_payload_size))
        }
        Err(error) => {
            tracing::debug!(?error, ?peer, "could not parse message");
            error
                .id()
                .map(|id| (Message::make_format_error_response(id), None))
        }
    }
}

fn observe_response(response: &Message) {
    DNS_RESPONSES_TOTAL
        .with_label_values(&[
            &response.header.is_authoritative.to_string(),
            &response.header.is_truncated.to_string(),
            &response.header.rcode.to_string(),
        ])
        .inc();
}

pub async fn listen_udp_task(server: Arc<Server>, socket: UdpSocket) {
    let (tx, mut rx) = mpsc::channel::<(Vec<u8>, SocketAddr)>(32);
    let mut buf = vec![0u8; UDP_RECV_BUFFER];

    loop {
        tokio::select! {
            Ok((size, peer)) = socket.recv_from(&mut buf) => {
                tracing::debug!(?peer, "UDP request");
                DNS_REQUESTS_TOTAL.with_label_values(&["udp"]).inc();
                let bytes = BytesMut::from(&buf[..size]);
                let reply = tx.clone();
                let server = server.clone();
                tokio::spawn(async move {
                    let response_timer = DNS_RESPONSE_TIME_SECONDS
                        .with_label_values(&["udp"])
                        .start_timer();
                    if let Some((response, edns_payload_size)) =
                        handle_raw_message(&server, bytes.as_ref(), peer).await
                    {
                        observe_response(&response);
                        let serialised = shape_response(response, Transport::Udp, edns_payload_size);
                        if let Err(error) = reply.send((serialised, peer)).await {
                            tracing::debug!(?peer, ?error, "UDP reply channel error");
                        }
                    }
                    response_timer.observe_duration();
                });
            }

            Some((serialised, peer)) = rx.recv() => {
                if let Err(error) = send_udp_bytes_to(&socket, peer, &serialised).await {
                    tracing::debug!(?peer, ?error, "UDP send error");
                }
            }
        }
    }
}

pub async fn listen_tcp_task(server: Arc<Server>, socket: TcpListener) {
    loop {
        match socket.accept().await {
            Ok((mut stream, peer)) => {
                tracing::debug!(?peer, "TCP request");
                DNS_REQUESTS_TOTAL.with_label_values(&["tcp"]).inc();
                let server = server.clone();
                tokio::spawn(async move {
                    let response_timer = DNS_RESPONSE_TIME_SECONDS
                        .with_label_values(&["tcp"])
                        .start_timer();
                    let response = match read_tcp_bytes(&mut stream).await {
                        Ok(bytes) => handle_raw_message(&server, bytes.as_ref(), peer)
                            .await
                            .map(|(response, _)| response),
                        Err(error) => {
                            tracing::debug!(?peer, %error, "TCP read error");
                            error.id().map(Message::make_format_error_response)
                        }
                    };
                    if let Some(response) = response {
                        observe_response(&response);
                        let serialised = shape_response(response, Transport::Tcp, None);
                        if let Err(error) = send_tcp_bytes(&mut stream, &serialised).await {
                            tracing::debug!(?peer, ?error, "TCP send error");
                        }
                    }
                    response_timer.observe_duration();
                });
            }
            Err(error) => tracing::debug!(?error, "TCP accept error"),
        }
    }
}
