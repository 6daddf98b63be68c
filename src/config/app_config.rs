use std::env;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_native_tls::TlsConnector as TokioTlsConnector;
use trust_dns_resolver::{
    TokioAsyncResolver,
    config::{NameServerConfig, NameServerConfigGroup, Protocol, ResolverConfig, ResolverOpts},
};

use super::ConfigError;
use super::probe_config::ProbeConfig;

const DEFAULT_CONFIG_FILE: &str = "config.yml";
const DEFAULT_INPUT_FILE: &str = "servers.txt";
const DEFAULT_OUTPUT_FILE: &str = "servers_ranked.txt";
const DEFAULT_DNS_HOSTS: &str = "1.1.1.1,8.8.8.8";

pub struct AppConfig {
    pub probe: ProbeConfig,
    pub input_file: PathBuf,
    pub output_file: PathBuf,
    pub dns_hosts: Vec<String>,
}

/// Load the application configuration from a YAML file and environment variables.
/// The YAML file is named by `CONFIG_FILE`; when that is unset and `config.yml`
/// does not exist, defaults apply. `INPUT_FILE`, `OUTPUT_FILE` and `DNS_HOSTS`
/// come from the environment.
pub fn load_config() -> Result<AppConfig, ConfigError> {
    load_config_from(|key| env::var(key).ok())
}

/// Same as [`load_config`], with environment lookups going through `var`.
pub fn load_config_from(var: impl Fn(&str) -> Option<String>) -> Result<AppConfig, ConfigError> {
    let probe = match var("CONFIG_FILE") {
        Some(path) => read_probe_config(Path::new(&path))?,
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
            read_probe_config(Path::new(DEFAULT_CONFIG_FILE))?
        }
        None => {
            log::info!("No {DEFAULT_CONFIG_FILE} found, using default probe settings");
            ProbeConfig::default()
        }
    };
    probe.validate()?;

    let dns_hosts: Vec<String> = var("DNS_HOSTS")
        .unwrap_or_else(|| DEFAULT_DNS_HOSTS.to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    log::info!("Using DNS hosts: {:?}", dns_hosts);

    let input_file = var("INPUT_FILE").unwrap_or_else(|| DEFAULT_INPUT_FILE.to_string());
    let output_file = var("OUTPUT_FILE").unwrap_or_else(|| DEFAULT_OUTPUT_FILE.to_string());

    Ok(AppConfig {
        probe,
        input_file: PathBuf::from(input_file),
        output_file: PathBuf::from(output_file),
        dns_hosts,
    })
}

fn read_probe_config(path: &Path) -> Result<ProbeConfig, ConfigError> {
    let config_str = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    if config_str.trim().is_empty() {
        return Ok(ProbeConfig::default());
    }

    serde_yaml::from_str(&config_str).map_err(|source| ConfigError::Yaml {
        path: path.to_path_buf(),
        source,
    })
}

/// Setup a TLS connector, optionally accepting certificates that do not verify.
pub fn setup_tls_connector(
    accept_invalid_certs: bool,
) -> Result<TokioTlsConnector, native_tls::Error> {
    let mut builder = native_tls::TlsConnector::builder();
    builder.danger_accept_invalid_certs(accept_invalid_certs);
    builder.danger_accept_invalid_hostnames(accept_invalid_certs);
    let connector = builder.build()?;
    Ok(TokioTlsConnector::from(connector))
}

/// Setup a DNS resolver using the provided DNS hosts.
/// The resolver queries the hosts over TCP with 2 attempts, a 100ms timeout and a
/// cache of 1024 entries. An empty list falls back to the system configuration.
/// # Arguments
///     * `dns_hosts` - DNS server IPs (e.g., "1.1.1.1")
pub fn setup_resolver(dns_hosts: &[String]) -> Result<TokioAsyncResolver, ConfigError> {
    if dns_hosts.is_empty() {
        return Ok(TokioAsyncResolver::tokio_from_system_conf()?);
    }

    let mut opts = ResolverOpts::default();
    opts.attempts = 2;
    opts.timeout = Duration::from_millis(100);
    opts.cache_size = 1024;

    let mut name_servers = NameServerConfigGroup::new();

    for host in dns_hosts {
        let ip: IpAddr = host
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("DNS host '{host}' is not an IP address")))?;
        name_servers.push(NameServerConfig {
            socket_addr: (ip, 53).into(),
            protocol: Protocol::Tcp,
            tls_dns_name: None,
            trust_negative_responses: false,
            bind_addr: None,
        });
    }

    let resolver_config = ResolverConfig::from_parts(None, vec![], name_servers);
    Ok(TokioAsyncResolver::tokio(resolver_config, opts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn reads_named_config_file_and_env() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "latency_ceiling_ms: 250\ntop_n: 3").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let config = load_config_from(env_of(&[
            ("CONFIG_FILE", path.as_str()),
            ("INPUT_FILE", "in.txt"),
            ("OUTPUT_FILE", "out.txt"),
            ("DNS_HOSTS", " 9.9.9.9 , ,1.0.0.1"),
        ]))
        .expect("valid config");

        assert_eq!(config.probe.latency_ceiling_ms, 250);
        assert_eq!(config.probe.top_n, Some(3));
        assert_eq!(config.input_file, PathBuf::from("in.txt"));
        assert_eq!(config.output_file, PathBuf::from("out.txt"));
        assert_eq!(config.dns_hosts, vec!["9.9.9.9", "1.0.0.1"]);
    }

    #[test]
    fn empty_config_file_means_defaults() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let config = load_config_from(env_of(&[("CONFIG_FILE", path.as_str())])).unwrap();
        assert_eq!(config.probe.stage_timeout_ms, 5000);
        assert_eq!(config.dns_hosts, vec!["1.1.1.1", "8.8.8.8"]);
        assert_eq!(config.input_file, PathBuf::from(DEFAULT_INPUT_FILE));
    }

    #[test]
    fn missing_named_config_file_is_an_error() {
        let result = load_config_from(env_of(&[("CONFIG_FILE", "/nonexistent/vlessprobe.yml")]));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "concurrency_limit: 0").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let result = load_config_from(env_of(&[("CONFIG_FILE", path.as_str())]));
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn malformed_yaml_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "stage_timeout_ms: [nope").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let result = load_config_from(env_of(&[("CONFIG_FILE", path.as_str())]));
        assert!(matches!(result, Err(ConfigError::Yaml { .. })));
    }

    #[tokio::test]
    async fn resolver_rejects_non_ip_hosts() {
        let result = setup_resolver(&["dns.example".to_string()]);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
        assert!(setup_resolver(&["1.1.1.1".to_string()]).is_ok());
    }

    #[test]
    fn tls_connector_builds_in_both_modes() {
        assert!(setup_tls_connector(true).is_ok());
        assert!(setup_tls_connector(false).is_ok());
    }
}
