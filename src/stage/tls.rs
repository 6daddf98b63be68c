use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_native_tls::{TlsConnector as TokioTlsConnector, TlsStream};
use x509_parser::parse_x509_certificate;

use super::{StageFailure, StageResult};
use crate::descriptor::EndpointDescriptor;

/// Run a TLS handshake over an already connected stream.
///
/// Only the handshake itself is timed. Reality endpoints answer a normal
/// TLS ClientHello, so they go through the same path.
pub async fn handshake<S>(
    stream: S,
    endpoint: &EndpointDescriptor,
    connector: &TokioTlsConnector,
    timeout: Duration,
) -> Result<(TlsStream<S>, StageResult), StageFailure>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let start = Instant::now();
    let server_name = endpoint.tls_server_name();

    let handshake = connector.connect(server_name, stream);
    let tls_stream = match tokio::time::timeout(timeout, handshake).await {
        Ok(Ok(tls_stream)) => tls_stream,
        Ok(Err(e)) => return Err(StageFailure::TlsError(e.to_string())),
        Err(_) => {
            return Err(StageFailure::TlsError(format!(
                "no handshake with {server_name} within {}ms",
                timeout.as_millis()
            )));
        }
    };

    let mut result = StageResult::from_elapsed(start.elapsed());
    result.cert_validity_days = cert_validity_days(&tls_stream);
    Ok((tls_stream, result))
}

fn cert_validity_days<S>(tls_stream: &TlsStream<S>) -> Option<i64>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let cert = tls_stream.get_ref().peer_certificate().ok().flatten()?;
    let cert_der = cert.to_der().ok()?;
    let (_, parsed) = parse_x509_certificate(&cert_der).ok()?;

    let not_after = parsed.validity().not_after.timestamp();
    Some((not_after - Utc::now().timestamp()) / 86400)
}
