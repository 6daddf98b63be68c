use std::fmt::Display;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::Empty;
use hyper::header::{CONNECTION, HOST, USER_AGENT};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};

use super::{StageFailure, StageResult};
use crate::descriptor::EndpointDescriptor;

const PROBE_USER_AGENT: &str = "vlessprobe/1.0";

/// Send `HEAD <path>` over the given stream and accept any status below 400.
///
/// The stream is consumed; it is closed when this returns, whatever the
/// result.
pub async fn head<S>(
    stream: S,
    endpoint: &EndpointDescriptor,
    timeout: Duration,
) -> Result<StageResult, StageFailure>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let start = Instant::now();

    let status = tokio::time::timeout(timeout, send_head(stream, endpoint))
        .await
        .map_err(|_| {
            StageFailure::AppCheckFailed(format!("no response within {}ms", timeout.as_millis()))
        })??;

    if status.is_client_error() || status.is_server_error() {
        return Err(StageFailure::AppCheckFailed(format!("status {status}")));
    }

    let mut result = StageResult::from_elapsed(start.elapsed());
    result.status_code = Some(status.as_u16());
    Ok(result)
}

async fn send_head<S>(stream: S, endpoint: &EndpointDescriptor) -> Result<StatusCode, StageFailure>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(check_failed)?;

    let request = Request::builder()
        .method(Method::HEAD)
        .uri(endpoint.path.as_str())
        .header(HOST, endpoint.http_host())
        .header(USER_AGENT, PROBE_USER_AGENT)
        .header(CONNECTION, "close")
        .body(Empty::<Bytes>::new())
        .map_err(check_failed)?;

    // Drive the connection in place rather than spawning it, so the socket
    // never outlives this stage. Once the connection finishes, the request
    // future holds either the response or the reason there is none.
    let response = sender.send_request(request);
    tokio::pin!(conn);
    tokio::pin!(response);
    let response = tokio::select! {
        response = &mut response => response,
        _ = &mut conn => response.await,
    };

    response.map(|r| r.status()).map_err(check_failed)
}

fn check_failed(err: impl Display) -> StageFailure {
    StageFailure::AppCheckFailed(err.to_string())
}
