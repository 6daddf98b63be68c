use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use trust_dns_resolver::TokioAsyncResolver;

use super::{StageFailure, StageResult};
use crate::descriptor::EndpointDescriptor;

/// Open a TCP connection to the endpoint.
///
/// Name resolution happens inside the timeout and is part of the measured
/// latency, like any client would experience it.
pub async fn connect(
    endpoint: &EndpointDescriptor,
    resolver: &TokioAsyncResolver,
    timeout: Duration,
) -> Result<(TcpStream, StageResult), StageFailure> {
    let start = Instant::now();
    let attempt = async {
        let addr = resolve(&endpoint.host, endpoint.port, resolver).await?;
        TcpStream::connect(addr).await.map_err(classify_io_error)
    };

    match tokio::time::timeout(timeout, attempt).await {
        Ok(Ok(stream)) => Ok((stream, StageResult::from_elapsed(start.elapsed()))),
        Ok(Err(failure)) => Err(failure),
        Err(_) => Err(StageFailure::ConnectTimeout),
    }
}

async fn resolve(
    host: &str,
    port: u16,
    resolver: &TokioAsyncResolver,
) -> Result<SocketAddr, StageFailure> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    let lookup = resolver
        .lookup_ip(host)
        .await
        .map_err(|e| StageFailure::ConnectionError(format!("dns lookup for {host}: {e}")))?;

    lookup
        .iter()
        .next()
        .map(|ip| SocketAddr::new(ip, port))
        .ok_or_else(|| StageFailure::ConnectionError(format!("no address for {host}")))
}

pub(crate) fn classify_io_error(err: io::Error) -> StageFailure {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => StageFailure::ConnectRefused,
        io::ErrorKind::TimedOut => StageFailure::ConnectTimeout,
        _ => StageFailure::ConnectionError(err.to_string()),
    }
}
