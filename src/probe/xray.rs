use std::io::Write;
use std::net::{Ipv4Addr, TcpListener as StdTcpListener};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};

use super::Prober;
use super::outcome::{AppCheck, ProbeOutcome};
use crate::config::probe_config::VerifierConfig;
use crate::descriptor::{EndpointDescriptor, Security};
use crate::stage::{Stage, StageFailure, StageResult};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const GREETING_TIMEOUT: Duration = Duration::from_millis(500);
const LAUNCH_ATTEMPTS: usize = 3;
const DEFAULT_FINGERPRINT: &str = "chrome";

/// Verifies endpoints by handing them to an Xray runtime.
///
/// The runtime gets a one-outbound config with a local SOCKS inbound; the
/// endpoint passes once that inbound completes a SOCKS greeting and, when a probe
/// URL is configured, a request through it gets any HTTP response.
pub struct XrayProber {
    binary: PathBuf,
    timeout: Duration,
    probe_url: Option<String>,
}

impl XrayProber {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration, probe_url: Option<String>) -> Self {
        Self {
            binary: binary.into(),
            timeout,
            probe_url,
        }
    }

    pub fn from_config(config: &VerifierConfig) -> Self {
        Self::new(
            &config.binary,
            Duration::from_millis(config.timeout_ms),
            config.probe_url.clone(),
        )
    }

    pub async fn verify(&self, endpoint: &EndpointDescriptor) -> Result<StageResult, StageFailure> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut last_exit = None;

        // The local port is free when picked but not reserved, so a runtime
        // that loses it to a neighbour exits and is relaunched on a new one.
        for attempt in 1..=LAUNCH_ATTEMPTS {
            match self.launch(endpoint, deadline).await? {
                Launch::Ready(result) => return Ok(result),
                Launch::Exited(status) => {
                    log::debug!(
                        "xray for {} exited ({status}), attempt {attempt}/{LAUNCH_ATTEMPTS}",
                        endpoint.authority()
                    );
                    last_exit = Some(status);
                }
            }
        }

        let status = last_exit.map(|s| s.to_string()).unwrap_or_default();
        Err(StageFailure::VerifierFailed(format!("runtime exited early ({status})")))
    }

    async fn launch(
        &self,
        endpoint: &EndpointDescriptor,
        deadline: tokio::time::Instant,
    ) -> Result<Launch, StageFailure> {
        let port = free_local_port()?;

        // Removed when dropped, on every path out of this function.
        let mut config_file = tempfile::Builder::new()
            .prefix("vlessprobe-")
            .suffix(".json")
            .tempfile()
            .map_err(verifier_failed)?;
        serde_json::to_writer(&mut config_file, &build_config(endpoint, port))
            .map_err(verifier_failed)?;
        config_file.flush().map_err(verifier_failed)?;

        let start = Instant::now();
        let mut child = Command::new(&self.binary)
            .arg("run")
            .arg("-config")
            .arg(config_file.path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                StageFailure::VerifierFailed(format!("spawn {}: {e}", self.binary.display()))
            })?;

        let ready = tokio::time::timeout_at(deadline, self.wait_ready(&mut child, port)).await;
        if let Err(e) = child.kill().await {
            log::debug!("xray for {} already gone: {e}", endpoint.authority());
        }
        if let Err(e) = config_file.close() {
            log::warn!("failed to remove xray config for {}: {e}", endpoint.authority());
        }

        match ready {
            Ok(Ok(None)) => Ok(Launch::Ready(StageResult::from_elapsed(start.elapsed()))),
            Ok(Ok(Some(status))) => Ok(Launch::Exited(status)),
            Ok(Err(failure)) => Err(failure),
            Err(_) => Err(StageFailure::ConnectTimeout),
        }
    }

    /// Wait until the runtime answers on its SOCKS port. Returns the exit
    /// status instead if the runtime quits first.
    async fn wait_ready(
        &self,
        child: &mut Child,
        port: u16,
    ) -> Result<Option<ExitStatus>, StageFailure> {
        loop {
            if let Some(status) = child.try_wait().map_err(verifier_failed)? {
                return Ok(Some(status));
            }
            if socks_ready(port).await {
                break;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        if let Some(url) = &self.probe_url {
            let proxy = reqwest::Proxy::all(format!("socks5h://127.0.0.1:{port}"))
                .map_err(verifier_failed)?;
            let client = reqwest::Client::builder()
                .proxy(proxy)
                .timeout(self.timeout)
                .danger_accept_invalid_certs(true)
                .build()
                .map_err(verifier_failed)?;
            client.get(url).send().await.map_err(verifier_failed)?;
        }

        Ok(None)
    }
}

enum Launch {
    Ready(StageResult),
    Exited(ExitStatus),
}

/// Offer a SOCKS5 greeting with "no authentication" and expect it accepted.
/// A bare TCP accept is not enough, the port may belong to someone else.
async fn socks_ready(port: u16) -> bool {
    let greeting = async {
        let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await?;
        stream.write_all(&[0x05, 0x01, 0x00]).await?;
        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await?;
        Ok::<_, std::io::Error>(reply == [0x05, 0x00])
    };
    matches!(tokio::time::timeout(GREETING_TIMEOUT, greeting).await, Ok(Ok(true)))
}

#[async_trait]
impl Prober for XrayProber {
    async fn probe(&self, index: usize, endpoint: Arc<EndpointDescriptor>) -> ProbeOutcome {
        match self.verify(&endpoint).await {
            Ok(result) => ProbeOutcome::success(
                index,
                endpoint,
                vec![(Stage::External, result.latency_ms)],
                AppCheck::Skipped,
                None,
            ),
            Err(failure) => {
                log::debug!("{} failed: {}", endpoint.authority(), failure);
                ProbeOutcome::failure(index, endpoint, Vec::new(), failure)
            }
        }
    }
}

/// Minimal Xray config: SOCKS in on `local_port`, the endpoint out.
pub fn build_config(endpoint: &EndpointDescriptor, local_port: u16) -> Value {
    let fingerprint = endpoint.fingerprint().unwrap_or(DEFAULT_FINGERPRINT);

    let mut stream = json!({ "network": endpoint.transport.as_str() });
    match endpoint.security {
        Security::Reality => {
            stream["security"] = json!("reality");
            stream["realitySettings"] = json!({
                "serverName": endpoint.server_name,
                "publicKey": endpoint.public_key(),
                "shortId": endpoint.short_id(),
                "fingerprint": fingerprint,
                "spiderX": endpoint.spider_x().unwrap_or("/"),
            });
        }
        Security::Tls => {
            let alpn = endpoint.alpn();
            stream["security"] = json!("tls");
            stream["tlsSettings"] = json!({
                "serverName": endpoint.server_name,
                "allowInsecure": true,
                "fingerprint": fingerprint,
                "alpn": if alpn.is_empty() { Value::Null } else { json!(alpn) },
            });
        }
        Security::None => {}
    }

    let mut outbound = json!({
        "protocol": "vless",
        "settings": {
            "vnext": [{
                "address": endpoint.host,
                "port": endpoint.port,
                "users": [{
                    "id": endpoint.identity,
                    "encryption": "none",
                    "flow": endpoint.flow(),
                }],
            }],
        },
        "streamSettings": stream,
    });
    if endpoint.mux_enabled() {
        outbound["mux"] = json!({ "enabled": true });
    }

    json!({
        "log": { "loglevel": "none" },
        "inbounds": [{
            "port": local_port,
            "listen": "127.0.0.1",
            "protocol": "socks",
        }],
        "outbounds": [
            outbound,
            { "protocol": "freedom", "tag": "direct" },
        ],
    })
}

fn free_local_port() -> Result<u16, StageFailure> {
    let listener = StdTcpListener::bind((Ipv4Addr::LOCALHOST, 0)).map_err(verifier_failed)?;
    let port = listener.local_addr().map_err(verifier_failed)?.port();
    Ok(port)
}

fn verifier_failed(err: impl std::fmt::Display) -> StageFailure {
    StageFailure::VerifierFailed(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::parse;
    use tokio::net::TcpListener;

    #[test]
    fn reality_config_carries_key_material() {
        let endpoint = parse(
            "vless://uuid-9@203.0.113.7:443?security=reality&sni=www.example.com&pbk=PUB&sid=0f&flow=xtls-rprx-vision&mux=1",
        )
        .unwrap();
        let config = build_config(&endpoint, 10808);

        assert_eq!(config["inbounds"][0]["port"], 10808);
        assert_eq!(config["inbounds"][0]["protocol"], "socks");

        let outbound = &config["outbounds"][0];
        assert_eq!(outbound["protocol"], "vless");
        assert_eq!(outbound["settings"]["vnext"][0]["address"], "203.0.113.7");
        assert_eq!(outbound["settings"]["vnext"][0]["port"], 443);
        assert_eq!(outbound["settings"]["vnext"][0]["users"][0]["id"], "uuid-9");
        assert_eq!(
            outbound["settings"]["vnext"][0]["users"][0]["flow"],
            "xtls-rprx-vision"
        );
        assert_eq!(outbound["mux"]["enabled"], true);

        let stream = &outbound["streamSettings"];
        assert_eq!(stream["network"], "tcp");
        assert_eq!(stream["security"], "reality");
        assert_eq!(stream["realitySettings"]["serverName"], "www.example.com");
        assert_eq!(stream["realitySettings"]["publicKey"], "PUB");
        assert_eq!(stream["realitySettings"]["shortId"], "0f");
        assert_eq!(stream["realitySettings"]["fingerprint"], "chrome");
        assert_eq!(stream["realitySettings"]["spiderX"], "/");

        assert_eq!(config["outbounds"][1]["protocol"], "freedom");
    }

    #[test]
    fn tls_config_relaxes_verification() {
        let endpoint =
            parse("vless://u@h.example:8443?security=tls&type=ws&fp=firefox&alpn=h2,http/1.1")
                .unwrap();
        let config = build_config(&endpoint, 20000);
        let stream = &config["outbounds"][0]["streamSettings"];

        assert_eq!(stream["network"], "ws");
        assert_eq!(stream["tlsSettings"]["allowInsecure"], true);
        assert_eq!(stream["tlsSettings"]["fingerprint"], "firefox");
        assert_eq!(stream["tlsSettings"]["alpn"], json!(["h2", "http/1.1"]));
        assert!(stream["tlsSettings"]["serverName"].is_null());
        assert!(config["outbounds"][0].get("mux").is_none());
    }

    #[test]
    fn plain_config_has_no_security_block() {
        let endpoint = parse("vless://u@h.example:80").unwrap();
        let config = build_config(&endpoint, 20001);
        let stream = &config["outbounds"][0]["streamSettings"];

        assert!(stream.get("security").is_none());
        assert!(config["outbounds"][0]["settings"]["vnext"][0]["users"][0]["flow"].is_null());
    }

    #[tokio::test]
    async fn missing_runtime_fails_the_endpoint() {
        let prober = XrayProber::new(
            "/nonexistent/xray-runtime",
            Duration::from_millis(500),
            None,
        );
        let endpoint = Arc::new(parse("vless://u@127.0.0.1:443").unwrap());
        let outcome = prober.probe(7, endpoint).await;

        assert_eq!(outcome.index, 7);
        assert!(!outcome.succeeded);
        assert!(matches!(
            outcome.failure_reason,
            Some(StageFailure::VerifierFailed(_))
        ));
    }

    #[tokio::test]
    async fn readiness_requires_a_socks_greeting() {
        let socks = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let socks_port = socks.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = socks.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            socket.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            socket.write_all(&[0x05, 0x00]).await.unwrap();
        });

        let squatter = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let squatter_port = squatter.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = squatter.accept().await.unwrap();
            let _ = socket.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
        });

        assert!(socks_ready(socks_port).await);
        assert!(!socks_ready(squatter_port).await);
        assert!(!socks_ready(free_local_port().unwrap()).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runtime_that_exits_fails_the_endpoint() {
        // `false run -config <file>` exits immediately with status 1.
        let prober = XrayProber::new("false", Duration::from_secs(2), None);
        let endpoint = parse("vless://u@127.0.0.1:443").unwrap();

        let err = prober.verify(&endpoint).await.unwrap_err();
        assert!(matches!(err, StageFailure::VerifierFailed(_)), "{err:?}");
    }
}
