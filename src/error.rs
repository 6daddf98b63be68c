use std::fmt::Write;
use std::io;
use std::path::PathBuf;

use crate::config::ConfigError;

/// Errors that stop the whole batch. Anything scoped to one line or one
/// endpoint is reported through `ParseError` or `StageFailure` instead.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("configuration error")]
    Config(#[from] ConfigError),
    #[error("failed to build TLS connector")]
    Tls(#[from] native_tls::Error),
    #[error("failed to read input list {}", .path.display())]
    ReadInput {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write ranked list {}", .path.display())]
    WriteOutput {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Render an error with its whole `source()` chain.
pub fn report(mut err: &(dyn std::error::Error + 'static)) -> String {
    let mut s = format!("{}", err);
    while let Some(src) = err.source() {
        let _ = write!(s, "\n\nCaused by: {}", src);
        err = src;
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_includes_causes() {
        let err = AppError::ReadInput {
            path: PathBuf::from("servers.txt"),
            source: io::Error::new(io::ErrorKind::NotFound, "no such file"),
        };
        assert_eq!(
            report(&err),
            "failed to read input list servers.txt\n\nCaused by: no such file"
        );
    }

    #[test]
    fn config_errors_chain_through() {
        let err = AppError::from(ConfigError::Invalid("top_n must be positive when set".into()));
        let rendered = report(&err);
        assert!(rendered.starts_with("configuration error"));
        assert!(rendered.contains("Caused by: invalid configuration: top_n"));
    }
}
