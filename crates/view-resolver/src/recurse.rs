//! Forwarding of unresolved queries to upstream recursive resolvers.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use dns_wire::types::{Message, Rcode};
use dns_wire::{deserialise, serialise};

use crate::net::{read_tcp_bytes, send_tcp_bytes};

/// The port used when an upstream address does not name one.
pub const DNS_PORT: u16 = 53;

/// Forwards a query to an ordered list of upstream resolvers.
///
/// Resolvers are tried strictly in order, one exchange at a time.
/// Each exchange goes over UDP first and is retried over TCP only
/// when the UDP response comes back truncated.  A SERVFAIL response
/// counts as a failure, so the next resolver gets a chance and the
/// caller never caches it.
#[derive(Debug, Clone)]
pub struct Recurser {
    exchange_timeout: Duration,
}

impl Recurser {
    pub fn new(exchange_timeout: Duration) -> Self {
        Self { exchange_timeout }
    }

    /// Try every resolver in order and return the first useful
    /// response.  If all of them fail, the last error is returned.
    pub async fn resolve_try_all(
        &self,
        request: &Message,
        resolvers: &[String],
    ) -> Result<Message, RecurseError> {
        let mut last_error = RecurseError::NoResolvers;

        for resolver in resolvers {
            match self.resolve(request, resolver).await {
                Ok(response) => return Ok(response),
                Err(error) => {
                    tracing::debug!(%resolver, %error, "upstream attempt failed");
                    last_error = error;
                }
            }
        }

        Err(last_error)
    }

    /// One full exchange with one resolver.
    pub async fn resolve(&self, request: &Message, resolver: &str) -> Result<Message, RecurseError> {
        let address = resolver_address(resolver)
            .ok_or_else(|| RecurseError::BadAddress(resolver.to_string()))?;
        let serialised = request.to_octets().map_err(RecurseError::Serialise)?;

        let mut response = self.exchange_udp(address, &serialised).await?;

        if response.header.is_truncated {
            tracing::debug!(%resolver, "upstream response truncated, retrying over tcp");
            response = self.exchange_tcp(address, &serialised).await?;
        }

        if !response.header.is_response || response.header.id != request.header.id {
            return Err(RecurseError::ResponseMismatch);
        }
        if response.header.rcode == Rcode::ServerFailure {
            return Err(RecurseError::UpstreamFailure);
        }

        Ok(response)
    }

    async fn exchange_udp(
        &self,
        address: SocketAddr,
        serialised: &[u8],
    ) -> Result<Message, RecurseError> {
        timeout(self.exchange_timeout, async {
            let socket = UdpSocket::bind("0.0.0.0:0").await?;
            socket.connect(address).await?;
            socket.send(serialised).await?;

            let mut buf = vec![0u8; 4096];
            let size = socket.recv(&mut buf).await?;
            Ok(buf[..size].to_vec())
        })
        .await
        .map_err(|_| RecurseError::Timeout)?
        .map_err(RecurseError::Transport)
        .and_then(|octets| Message::from_octets(&octets).map_err(RecurseError::Deserialise))
    }

    async fn exchange_tcp(
        &self,
        address: SocketAddr,
        serialised: &[u8],
    ) -> Result<Message, RecurseError> {
        timeout(self.exchange_timeout, async {
            let mut stream = TcpStream::connect(address)
                .await
                .map_err(RecurseError::Transport)?;
            send_tcp_bytes(&mut stream, serialised)
                .await
                .map_err(RecurseError::Transport)?;
            let bytes = read_tcp_bytes(&mut stream)
                .await
                .map_err(RecurseError::Stream)?;
            Ok(bytes.to_vec())
        })
        .await
        .map_err(|_| RecurseError::Timeout)?
        .and_then(|octets| Message::from_octets(&octets).map_err(RecurseError::Deserialise))
    }
}

/// Parse a resolver address, defaulting the port to 53.
fn resolver_address(resolver: &str) -> Option<SocketAddr> {
    if let Ok(address) = resolver.parse::<SocketAddr>() {
        return Some(address);
    }
    if let Ok(ip) = resolver.parse::<IpAddr>() {
        return Some(SocketAddr::new(ip, DNS_PORT));
    }
    None
}

/// An error that can occur when forwarding to upstream resolvers.
#[derive(Debug)]
pub enum RecurseError {
    /// There were no resolvers to try.
    NoResolvers,
    /// A resolver address could not be parsed.
    BadAddress(String),
    /// The request could not be serialised.
    Serialise(serialise::Error),
    /// The response could not be parsed.
    Deserialise(deserialise::Error),
    /// A socket operation failed.
    Transport(std::io::Error),
    /// A framed TCP read failed.
    Stream(crate::net::TcpError),
    /// The exchange did not complete in time.
    Timeout,
    /// The upstream answered SERVFAIL.
    UpstreamFailure,
    /// The response does not belong to the request.
    ResponseMismatch,
}

impl std::fmt::Display for RecurseError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            RecurseError::NoResolvers => write!(f, "no upstream resolvers configured"),
            RecurseError::BadAddress(address) => write!(f, "bad resolver address '{address}'"),
            RecurseError::Serialise(error) => write!(f, "could not serialise request: {error}"),
            RecurseError::Deserialise(error) => write!(f, "could not parse response: {error}"),
            RecurseError::Transport(error) => write!(f, "{error}"),
            RecurseError::Stream(error) => write!(f, "{error}"),
            RecurseError::Timeout => write!(f, "timed out"),
            RecurseError::UpstreamFailure => write!(f, "upstream answered SERVFAIL"),
            RecurseError::ResponseMismatch => write!(f, "response does not match request"),
        }
    }
}

impl std::error::Error for RecurseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RecurseError::Serialise(error) => Some(error),
            RecurseError::Deserialise(error) => Some(error),
            RecurseError::Transport(error) => Some(error),
            RecurseError::Stream(error) => Some(error),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dns_wire::types::test_util::*;
    use dns_wire::types::{QueryType, RecordType};
    use std::net::Ipv4Addr;

    fn request() -> Message {
        let mut request = Message::from_question(
            77,
            question("www.example.com.", QueryType::Record(RecordType::A)),
        );
        request.header.recursion_desired = true;
        request
    }

    /// A fake upstream which reads one UDP query and answers it with
    /// whatever `respond` builds from the request.
    async fn fake_upstream<F>(respond: F) -> String
    where
        F: FnOnce(Message) -> Message + Send + 'static,
    {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let address = socket.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let (size, peer) = socket.recv_from(&mut buf).await.unwrap();
            let request = Message::from_octets(&buf[..size]).unwrap();
            let response = respond(request);
            let octets = response.to_octets().unwrap();
            socket.send_to(&octets, peer).await.unwrap();
        });

        address.to_string()
    }

    #[tokio::test]
    async fn resolve_returns_the_upstream_answer() {
        let upstream = fake_upstream(|request| {
            let mut response = request.make_response();
            response
                .answers
                .push(a_record("www.example.com.", Ipv4Addr::new(1, 1, 1, 1)));
            response
        })
        .await;

        let recurser = Recurser::new(Duration::from_secs(2));
        let response = recurser.resolve(&request(), &upstream).await.unwrap();

        assert_eq!(1, response.answers.len());
        assert_eq!(77, response.header.id);
    }

    #[tokio::test]
    async fn resolve_try_all_skips_servfail_resolvers() {
        let failing = fake_upstream(|request| {
            let mut response = request.make_response();
            response.header.rcode = Rcode::ServerFailure;
            response
        })
        .await;
        let working = fake_upstream(|request| {
            let mut response = request.make_response();
            response
                .answers
                .push(a_record("www.example.com.", Ipv4Addr::new(2, 2, 2, 2)));
            response
        })
        .await;

        let recurser = Recurser::new(Duration::from_secs(2));
        let response = recurser
            .resolve_try_all(&request(), &[failing, working])
            .await
            .unwrap();

        assert_eq!(
            Ipv4Addr::new(2, 2, 2, 2),
            match &response.answers[0].data {
                dns_wire::types::RecordData::A { address } => *address,
                other => panic!("expected an A record, got {other:?}"),
            }
        );
    }

    #[tokio::test]
    async fn resolve_retries_over_tcp_when_truncated() {
        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let address = udp.local_addr().unwrap();
        let tcp = tokio::net::TcpListener::bind(address).await.unwrap();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let (size, peer) = udp.recv_from(&mut buf).await.unwrap();
            let request = Message::from_octets(&buf[..size]).unwrap();
            let mut response = request.make_response();
            response.header.is_truncated = true;
            udp.send_to(&response.to_octets().unwrap(), peer)
                .await
                .unwrap();
        });

        tokio::spawn(async move {
            let (mut stream, _) = tcp.accept().await.unwrap();
            let bytes = read_tcp_bytes(&mut stream).await.unwrap();
            let request = Message::from_octets(&bytes).unwrap();
            let mut response = request.make_response();
            response
                .answers
                .push(a_record("www.example.com.", Ipv4Addr::new(3, 3, 3, 3)));
            send_tcp_bytes(&mut stream, &response.to_octets().unwrap())
                .await
                .unwrap();
        });

        let recurser = Recurser::new(Duration::from_secs(2));
        let response = recurser
            .resolve(&request(), &address.to_string())
            .await
            .unwrap();

        assert_eq!(1, response.answers.len());
        assert!(!response.header.is_truncated);
    }

    #[tokio::test]
    async fn resolve_try_all_with_no_resolvers_fails() {
        let recurser = Recurser::new(Duration::from_secs(2));
        let result = recurser.resolve_try_all(&request(), &[]).await;

        assert!(matches!(result, Err(RecurseError::NoResolvers)));
    }

    #[test]
    fn resolver_address_defaults_the_port() {
        assert_eq!(
            Some("1.1.1.1:53".parse().unwrap()),
            resolver_address("1.1.1.1")
        );
        assert_eq!(
            Some("1.1.1.1:5353".parse().unwrap()),
            resolver_address("1.1.1.1:5353")
        );
        assert_eq!(None, resolver_address("not-an-ip"));
    }
}
