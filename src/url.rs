//! Connection URI parsing for the zync:// scheme.

use anyhow::{bail, Context, Result};

use crate::protocol::DEFAULT_PORT;

/// Normalizes a `--connect` argument to a dialable `host:port`.
///
/// Accepts a bare `host`, `host:port`, or a `zync://host[:port][/...]` URI;
/// the default port is appended when none is given.
pub fn resolve_addr(uri: &str) -> Result<String> {
    let trimmed = uri.trim();
    let mut rest = trimmed;
    if let Some(idx) = trimmed.find("://") {
        let scheme = trimmed[..idx].to_ascii_lowercase();
        if scheme != "zync" {
            bail!("unsupported scheme: '{}'; only 'zync' is supported", scheme);
        }
        rest = &trimmed[idx + 3..];
    }
    let host_port = rest.split('/').next().unwrap_or(rest);
    if host_port.is_empty() {
        bail!("missing host in '{}'", uri);
    }
    match host_port.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port: u16 = port
                .parse()
                .with_context(|| format!("invalid port in '{}'", uri))?;
            Ok(format!("{}:{}", host, port))
        }
        _ => Ok(format!("{}:{}", host_port, DEFAULT_PORT)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_host_gets_default_port() {
        assert_eq!(resolve_addr("localhost").unwrap(), "localhost:20741");
        assert_eq!(resolve_addr("10.0.0.7").unwrap(), "10.0.0.7:20741");
    }

    #[test]
    fn test_explicit_port_is_kept() {
        assert_eq!(resolve_addr("localhost:9000").unwrap(), "localhost:9000");
    }

    #[test]
    fn test_zync_scheme() {
        assert_eq!(resolve_addr("zync://sync.lan").unwrap(), "sync.lan:20741");
        assert_eq!(resolve_addr("zync://sync.lan:81").unwrap(), "sync.lan:81");
        assert_eq!(resolve_addr("ZYNC://sync.lan/ignored").unwrap(), "sync.lan:20741");
    }

    #[test]
    fn test_rejects_other_schemes() {
        assert!(resolve_addr("http://example.com").is_err());
        assert!(resolve_addr("ssh://example.com").is_err());
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(resolve_addr("zync://").is_err());
        assert!(resolve_addr("host:notaport").is_err());
        assert!(resolve_addr("host:99999").is_err());
    }
}
