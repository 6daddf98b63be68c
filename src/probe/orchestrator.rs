use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::Prober;
use super::outcome::{AppCheck, ProbeOutcome};
use crate::config::probe_config::ProbeConfig;
use crate::descriptor::EndpointDescriptor;
use crate::stage::{Stage, StageFailure, StageRunner};

#[derive(Debug, Clone)]
pub struct ProbePolicy {
    pub stage_timeout: Duration,
    pub verify_application_layer: bool,
    /// Promote the application check from soft to fatal.
    pub require_application_layer: bool,
}

impl From<&ProbeConfig> for ProbePolicy {
    fn from(config: &ProbeConfig) -> Self {
        Self {
            stage_timeout: Duration::from_millis(config.stage_timeout_ms),
            verify_application_layer: config.verify_application_layer,
            require_application_layer: config.require_application_layer,
        }
    }
}

/// Runs connect, then TLS when the endpoint declares it, then the HTTP
/// check when the transport supports one.
///
/// Connect and TLS gate the outcome and make up its total latency. The HTTP
/// check is recorded but only gates when `require_application_layer` is set.
pub struct StagedProber<R> {
    runner: R,
    policy: ProbePolicy,
}

impl<R: StageRunner> StagedProber<R> {
    pub fn new(runner: R, policy: ProbePolicy) -> Self {
        Self { runner, policy }
    }

    async fn run_stages(&self, index: usize, endpoint: Arc<EndpointDescriptor>) -> ProbeOutcome {
        let timeout = self.policy.stage_timeout;
        let mut stages = Vec::with_capacity(3);

        let (mut conn, connected) = match self.runner.connect(&endpoint, timeout).await {
            Ok(connected) => connected,
            Err(failure) => return ProbeOutcome::failure(index, endpoint, stages, failure),
        };
        stages.push((Stage::Connect, connected.latency_ms));

        let mut cert_validity_days = None;
        if endpoint.security.requires_handshake() {
            match self.runner.handshake(conn, &endpoint, timeout).await {
                Ok((tls_conn, handshake)) => {
                    conn = tls_conn;
                    stages.push((Stage::Tls, handshake.latency_ms));
                    cert_validity_days = handshake.cert_validity_days;
                }
                Err(failure) => {
                    let reason = match failure {
                        StageFailure::TlsError(_) => failure,
                        other => StageFailure::TlsError(other.to_string()),
                    };
                    return ProbeOutcome::failure(index, endpoint, stages, reason);
                }
            }
        }

        if !(endpoint.transport.is_http_upgradeable() && self.policy.verify_application_layer) {
            return ProbeOutcome::success(
                index,
                endpoint,
                stages,
                AppCheck::Skipped,
                cert_validity_days,
            );
        }

        let app_check = match self.runner.app_check(conn, &endpoint, timeout).await {
            Ok(checked) => {
                stages.push((Stage::AppCheck, checked.latency_ms));
                AppCheck::Passed {
                    status: checked.status_code.unwrap_or_default(),
                }
            }
            Err(failure) => {
                let reason = match failure {
                    StageFailure::AppCheckFailed(_) => failure,
                    other => StageFailure::AppCheckFailed(other.to_string()),
                };
                if self.policy.require_application_layer {
                    return ProbeOutcome::failure(index, endpoint, stages, reason);
                }
                AppCheck::Ignored { reason }
            }
        };

        ProbeOutcome::success(index, endpoint, stages, app_check, cert_validity_days)
    }
}

#[async_trait]
impl<R: StageRunner> Prober for StagedProber<R> {
    async fn probe(&self, index: usize, endpoint: Arc<EndpointDescriptor>) -> ProbeOutcome {
        let outcome = self.run_stages(index, endpoint).await;
        match &outcome.failure_reason {
            None => log::debug!(
                "{} ok total={}ms {}",
                outcome.endpoint.authority(),
                outcome.total_latency_ms,
                outcome.stage_breakdown()
            ),
            Some(reason) => log::debug!("{} failed: {}", outcome.endpoint.authority(), reason),
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::parse;
    use crate::stage::StageResult;

    /// Replays fixed stage results instead of touching the network.
    struct ScriptedStages {
        connect: Result<u64, StageFailure>,
        tls: Result<u64, StageFailure>,
        app: Result<(u64, u16), StageFailure>,
    }

    impl ScriptedStages {
        fn ok(connect_ms: u64, tls_ms: u64) -> Self {
            Self {
                connect: Ok(connect_ms),
                tls: Ok(tls_ms),
                app: Ok((40, 200)),
            }
        }
    }

    #[async_trait]
    impl StageRunner for ScriptedStages {
        type Conn = ();

        async fn connect(
            &self,
            _endpoint: &EndpointDescriptor,
            _timeout: Duration,
        ) -> Result<((), StageResult), StageFailure> {
            self.connect.clone().map(|ms| ((), StageResult::new(ms)))
        }

        async fn handshake(
            &self,
            _conn: (),
            _endpoint: &EndpointDescriptor,
            _timeout: Duration,
        ) -> Result<((), StageResult), StageFailure> {
            self.tls.clone().map(|ms| {
                let mut result = StageResult::new(ms);
                result.cert_validity_days = Some(42);
                ((), result)
            })
        }

        async fn app_check(
            &self,
            _conn: (),
            _endpoint: &EndpointDescriptor,
            _timeout: Duration,
        ) -> Result<StageResult, StageFailure> {
            self.app.clone().map(|(ms, status)| {
                let mut result = StageResult::new(ms);
                result.status_code = Some(status);
                result
            })
        }
    }

    fn policy() -> ProbePolicy {
        ProbePolicy {
            stage_timeout: Duration::from_secs(5),
            verify_application_layer: true,
            require_application_layer: false,
        }
    }

    async fn probe_line(runner: ScriptedStages, policy: ProbePolicy, line: &str) -> ProbeOutcome {
        let endpoint = Arc::new(parse(line).expect("valid descriptor"));
        StagedProber::new(runner, policy).probe(0, endpoint).await
    }

    #[tokio::test]
    async fn tls_endpoint_sums_connect_and_handshake() {
        let outcome = probe_line(
            ScriptedStages::ok(50, 80),
            policy(),
            "vless://u1@10.0.0.1:443?security=tls&sni=example.com",
        )
        .await;

        assert!(outcome.succeeded);
        assert_eq!(outcome.total_latency_ms, 130);
        assert_eq!(
            outcome.stage_latencies,
            vec![(Stage::Connect, 50), (Stage::Tls, 80)]
        );
        assert_eq!(outcome.cert_validity_days, Some(42));
        assert_eq!(outcome.app_check, AppCheck::Skipped);
    }

    #[tokio::test]
    async fn connect_timeout_fails_without_latency() {
        let runner = ScriptedStages {
            connect: Err(StageFailure::ConnectTimeout),
            ..ScriptedStages::ok(0, 0)
        };
        let outcome = probe_line(runner, policy(), "vless://u2@10.0.0.2:80").await;

        assert!(!outcome.succeeded);
        assert_eq!(outcome.failure_reason, Some(StageFailure::ConnectTimeout));
        assert_eq!(outcome.total_latency_ms, 0);
        assert!(outcome.stage_latencies.is_empty());
    }

    #[tokio::test]
    async fn plain_endpoint_has_no_tls_stage() {
        let runner = ScriptedStages {
            tls: Err(StageFailure::TlsError("must not run".to_string())),
            ..ScriptedStages::ok(25, 0)
        };
        let outcome = probe_line(runner, policy(), "vless://u@10.0.0.3:80").await;

        assert!(outcome.succeeded);
        assert_eq!(outcome.total_latency_ms, 25);
        assert_eq!(outcome.latency_of(Stage::Tls), None);
        assert_eq!(outcome.latency_of(Stage::AppCheck), None);
    }

    #[tokio::test]
    async fn tls_failure_is_fatal() {
        let runner = ScriptedStages {
            tls: Err(StageFailure::ConnectionError("reset".to_string())),
            ..ScriptedStages::ok(30, 0)
        };
        let outcome =
            probe_line(runner, policy(), "vless://u@10.0.0.4:443?security=reality").await;

        assert!(!outcome.succeeded);
        assert!(matches!(outcome.failure_reason, Some(StageFailure::TlsError(_))));
        assert_eq!(outcome.stage_latencies, vec![(Stage::Connect, 30)]);
    }

    #[tokio::test]
    async fn app_check_latency_is_recorded_but_not_totalled() {
        let outcome = probe_line(
            ScriptedStages::ok(20, 30),
            policy(),
            "vless://u@10.0.0.5:443?security=tls&type=ws&path=%2Fws",
        )
        .await;

        assert!(outcome.succeeded);
        assert_eq!(outcome.total_latency_ms, 50);
        assert_eq!(outcome.latency_of(Stage::AppCheck), Some(40));
        assert_eq!(outcome.app_check, AppCheck::Passed { status: 200 });
    }

    #[tokio::test]
    async fn failed_app_check_is_ignored_by_default() {
        let runner = ScriptedStages {
            app: Err(StageFailure::AppCheckFailed("status 403 Forbidden".to_string())),
            ..ScriptedStages::ok(20, 30)
        };
        let outcome =
            probe_line(runner, policy(), "vless://u@10.0.0.6:443?security=tls&type=ws").await;

        assert!(outcome.succeeded);
        assert_eq!(outcome.total_latency_ms, 50);
        assert_eq!(outcome.latency_of(Stage::AppCheck), None);
        assert!(matches!(outcome.app_check, AppCheck::Ignored { .. }));
    }

    #[tokio::test]
    async fn failed_app_check_gates_when_required() {
        let runner = ScriptedStages {
            app: Err(StageFailure::ConnectionError("reset".to_string())),
            ..ScriptedStages::ok(20, 30)
        };
        let strict = ProbePolicy {
            require_application_layer: true,
            ..policy()
        };
        let outcome = probe_line(runner, strict, "vless://u@10.0.0.7:80?type=httpupgrade").await;

        assert!(!outcome.succeeded);
        assert!(matches!(
            outcome.failure_reason,
            Some(StageFailure::AppCheckFailed(_))
        ));
    }

    #[tokio::test]
    async fn disabled_app_check_is_skipped() {
        let runner = ScriptedStages {
            app: Err(StageFailure::AppCheckFailed("must not run".to_string())),
            ..ScriptedStages::ok(20, 30)
        };
        let relaxed = ProbePolicy {
            verify_application_layer: false,
            ..policy()
        };
        let outcome = probe_line(runner, relaxed, "vless://u@10.0.0.8:80?type=ws").await;

        assert!(outcome.succeeded);
        assert_eq!(outcome.app_check, AppCheck::Skipped);
        assert_eq!(outcome.stage_latencies, vec![(Stage::Connect, 20)]);
    }

    #[tokio::test]
    async fn network_stages_probe_a_local_http_endpoint() {
        use crate::config::app_config::setup_tls_connector;
        use crate::stage::NetworkStages;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use trust_dns_resolver::TokioAsyncResolver;
        use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n")
                .await;
        });

        let stages = NetworkStages::new(
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
            setup_tls_connector(true).unwrap(),
        );
        let endpoint = Arc::new(parse(&format!("vless://u@127.0.0.1:{port}?type=ws")).unwrap());
        let outcome = StagedProber::new(stages, policy()).probe(3, endpoint).await;

        assert_eq!(outcome.index, 3);
        assert!(outcome.succeeded, "{:?}", outcome.failure_reason);
        assert!(outcome.latency_of(Stage::Connect).is_some());
        assert!(matches!(outcome.app_check, AppCheck::Ignored { .. }));
    }
}
