use std::collections::HashMap;

use url::form_urlencoded;

use super::model::{EndpointDescriptor, Security, TransportType};

const SCHEME: &str = "vless://";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("not a vless:// descriptor")]
    NotRecognized,
    #[error("malformed authority: {0}")]
    MalformedAuthority(String),
}

/// Descriptors accepted from a whole input list, in input order.
#[derive(Debug, Default)]
pub struct ParsedBatch {
    pub endpoints: Vec<EndpointDescriptor>,
    /// Blank lines, comments and other schemes.
    pub unrecognized: usize,
    /// `vless://` lines that could not be turned into an endpoint.
    pub malformed: usize,
}

/// Parse one descriptor line.
///
/// The trimmed line is kept verbatim as `raw_text`, labels with spaces
/// included. Only a trailing `# latency=<n>ms` annotation is dropped, so
/// lines we wrote ourselves read back unchanged.
pub fn parse(line: &str) -> Result<EndpointDescriptor, ParseError> {
    let raw_text = strip_annotation(line.trim());
    let rest = match raw_text.get(..SCHEME.len()) {
        Some(prefix) if prefix.eq_ignore_ascii_case(SCHEME) => &raw_text[SCHEME.len()..],
        _ => return Err(ParseError::NotRecognized),
    };

    let (main, fragment) = match rest.split_once('#') {
        Some((main, fragment)) => (main, Some(fragment)),
        None => (rest, None),
    };
    let (authority, query) = main.split_once('?').unwrap_or((main, ""));
    let authority = authority.trim_end_matches('/');

    let (identity, host_port) = authority
        .rsplit_once('@')
        .ok_or_else(|| ParseError::MalformedAuthority("missing '@'".to_string()))?;
    let (host, port) = split_host_port(host_port)?;

    let params = parse_query(query);
    let first = |name: &str| first_param(&params, name);

    let transport = TransportType::from_param(first("type"));
    let security = match Security::from_param(first("security")) {
        Some(security) => security,
        None => {
            log::debug!(
                "{host}:{port}: unknown security '{}', probing without TLS",
                first("security")
            );
            Security::None
        }
    };
    let server_name = Some(first("sni"))
        .filter(|s| !s.is_empty())
        .map(String::from);
    let path = match first("path") {
        "" => "/".to_string(),
        p if p.starts_with('/') => p.to_string(),
        p => format!("/{p}"),
    };
    let label = fragment
        .filter(|f| !f.is_empty())
        .map(|f| {
            urlencoding::decode(f)
                .map(|decoded| decoded.into_owned())
                .unwrap_or_else(|_| f.to_string())
        });

    Ok(EndpointDescriptor {
        identity: identity.to_string(),
        host,
        port,
        transport,
        security,
        server_name,
        path,
        label,
        params,
        raw_text: raw_text.to_string(),
    })
}

/// Parse a newline-separated list; bad lines are counted and skipped.
pub fn parse_batch(text: &str) -> ParsedBatch {
    let mut batch = ParsedBatch::default();

    for (line_no, line) in text.lines().enumerate() {
        match parse(line) {
            Ok(endpoint) => batch.endpoints.push(endpoint),
            Err(ParseError::NotRecognized) => batch.unrecognized += 1,
            Err(e) => {
                log::debug!("line {}: skipped: {}", line_no + 1, e);
                batch.malformed += 1;
            }
        }
    }

    batch
}

/// Drop a `  # latency=183ms` suffix as written by `aggregate::render`.
fn strip_annotation(line: &str) -> &str {
    let Some((head, tail)) = line.rsplit_once("# latency=") else {
        return line;
    };
    let ours = head.ends_with(char::is_whitespace)
        && tail
            .strip_suffix("ms")
            .is_some_and(|ms| !ms.is_empty() && ms.bytes().all(|b| b.is_ascii_digit()));
    if ours { head.trim_end() } else { line }
}

fn split_host_port(host_port: &str) -> Result<(String, u16), ParseError> {
    let (host, port) = if let Some(bracketed) = host_port.strip_prefix('[') {
        let (host, tail) = bracketed
            .split_once(']')
            .ok_or_else(|| ParseError::MalformedAuthority("unclosed '['".to_string()))?;
        let port = tail
            .strip_prefix(':')
            .ok_or_else(|| ParseError::MalformedAuthority("missing port".to_string()))?;
        (host, port)
    } else {
        host_port
            .rsplit_once(':')
            .ok_or_else(|| ParseError::MalformedAuthority("missing port".to_string()))?
    };

    if host.is_empty() {
        return Err(ParseError::MalformedAuthority("empty host".to_string()));
    }

    let port: u16 = port
        .parse()
        .map_err(|_| ParseError::MalformedAuthority(format!("invalid port '{port}'")))?;
    if port == 0 {
        return Err(ParseError::MalformedAuthority("port 0".to_string()));
    }

    Ok((host.to_string(), port))
}

fn first_param<'a>(params: &'a HashMap<String, Vec<String>>, name: &str) -> &'a str {
    params
        .get(name)
        .and_then(|values| values.first())
        .map(String::as_str)
        .unwrap_or("")
}

fn parse_query(query: &str) -> HashMap<String, Vec<String>> {
    let mut params: HashMap<String, Vec<String>> = HashMap::new();
    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        params
            .entry(key.into_owned())
            .or_default()
            .push(value.into_owned());
    }
    params
}
