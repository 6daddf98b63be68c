pub mod app_check;
pub mod tcp;
pub mod tls;

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_native_tls::TlsConnector as TokioTlsConnector;
use trust_dns_resolver::TokioAsyncResolver;

use crate::descriptor::EndpointDescriptor;

/// One timed step of a probe, in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Connect,
    Tls,
    AppCheck,
    /// End-to-end check through an external proxy runtime.
    External,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::Connect => "connect",
            Stage::Tls => "tls",
            Stage::AppCheck => "http",
            Stage::External => "xray",
        }
    }

    /// Whether the stage latency is part of the ranked total.
    pub fn counts_toward_total(self) -> bool {
        !matches!(self, Stage::AppCheck)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageResult {
    pub latency_ms: u64,
    /// HTTP status, application check only.
    pub status_code: Option<u16>,
    /// Days until the peer certificate expires, TLS stage only.
    pub cert_validity_days: Option<i64>,
}

impl StageResult {
    pub fn new(latency_ms: u64) -> Self {
        Self {
            latency_ms,
            ..Default::default()
        }
    }

    pub fn from_elapsed(elapsed: Duration) -> Self {
        Self::new((elapsed.as_secs_f64() * 1000.0).round() as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StageFailure {
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("connection refused")]
    ConnectRefused,
    #[error("connection error: {0}")]
    ConnectionError(String),
    #[error("tls handshake failed: {0}")]
    TlsError(String),
    #[error("application check failed: {0}")]
    AppCheckFailed(String),
    #[error("external verifier failed: {0}")]
    VerifierFailed(String),
    #[error("not attempted")]
    NotAttempted,
}

impl StageFailure {
    /// Stable short name, used for summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            StageFailure::ConnectTimeout => "connect_timeout",
            StageFailure::ConnectRefused => "connect_refused",
            StageFailure::ConnectionError(_) => "connection_error",
            StageFailure::TlsError(_) => "tls_error",
            StageFailure::AppCheckFailed(_) => "app_check_failed",
            StageFailure::VerifierFailed(_) => "verifier_failed",
            StageFailure::NotAttempted => "not_attempted",
        }
    }
}

pub trait ProbeStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProbeStream for T {}

/// A plain or TLS-wrapped connection, owned by whichever stage runs next.
pub type BoxedStream = Box<dyn ProbeStream>;

/// The three network stages. Each call consumes the connection handed to
/// it, so a failing or timed-out stage drops (closes) the socket.
#[async_trait]
pub trait StageRunner: Send + Sync {
    type Conn: Send;

    async fn connect(
        &self,
        endpoint: &EndpointDescriptor,
        timeout: Duration,
    ) -> Result<(Self::Conn, StageResult), StageFailure>;

    async fn handshake(
        &self,
        conn: Self::Conn,
        endpoint: &EndpointDescriptor,
        timeout: Duration,
    ) -> Result<(Self::Conn, StageResult), StageFailure>;

    async fn app_check(
        &self,
        conn: Self::Conn,
        endpoint: &EndpointDescriptor,
        timeout: Duration,
    ) -> Result<StageResult, StageFailure>;
}

/// Stage runner backed by real sockets.
#[derive(Clone)]
pub struct NetworkStages {
    resolver: TokioAsyncResolver,
    connector: TokioTlsConnector,
}

impl NetworkStages {
    pub fn new(resolver: TokioAsyncResolver, connector: TokioTlsConnector) -> Self {
        Self {
            resolver,
            connector,
        }
    }
}

#[async_trait]
impl StageRunner for NetworkStages {
    type Conn = BoxedStream;

    async fn connect(
        &self,
        endpoint: &EndpointDescriptor,
        timeout: Duration,
    ) -> Result<(BoxedStream, StageResult), StageFailure> {
        let (stream, result) = tcp::connect(endpoint, &self.resolver, timeout).await?;
        let stream: BoxedStream = Box::new(stream);
        Ok((stream, result))
    }

    async fn handshake(
        &self,
        conn: BoxedStream,
        endpoint: &EndpointDescriptor,
        timeout: Duration,
    ) -> Result<(BoxedStream, StageResult), StageFailure> {
        let (stream, result) = tls::handshake(conn, endpoint, &self.connector, timeout).await?;
        let stream: BoxedStream = Box::new(stream);
        Ok((stream, result))
    }

    async fn app_check(
        &self,
        conn: BoxedStream,
        endpoint: &EndpointDescriptor,
        timeout: Duration,
    ) -> Result<StageResult, StageFailure> {
        app_check::head(conn, endpoint, timeout).await
    }
}
