//! Origin & Admission Filter - stateless checks applied before a
//! WebSocket handshake is accepted.

use crate::config::Config;
use crate::error::AdmissionError;
use tracing::warn;

/// Request-time facts the filter needs; gathered by the WS event loop
/// (`ws.rs`) from the upgrade request headers before a session exists.
pub struct AdmissionRequest<'a> {
    pub path: &'a str,
    pub origin: Option<&'a str>,
    pub host: Option<&'a str>,
}

/// Evaluates the four admission checks, in order, and logs a categorized
/// warning on rejection.
pub fn check(
    req: &AdmissionRequest,
    cfg: &Config,
    client_count: usize,
    connected_once: bool,
) -> Result<(), AdmissionError> {
    if cfg.once && connected_once {
        warn!("refusing connection: already serving a client (--once)");
        return Err(AdmissionError::OnceExhausted);
    }
    if cfg.max_clients > 0 && client_count >= cfg.max_clients {
        warn!(max_clients = cfg.max_clients, "refusing connection: at capacity");
        return Err(AdmissionError::AtCapacity);
    }
    if req.path != cfg.ws_path {
        warn!(path = req.path, "refusing connection: illegal ws path");
        return Err(AdmissionError::WrongPath(req.path.to_string()));
    }
    if cfg.check_origin && !origin_matches_host(req.origin, req.host) {
        warn!(
            origin = req.origin.unwrap_or(""),
            host = req.host.unwrap_or(""),
            "refusing connection: origin/host mismatch"
        );
        return Err(AdmissionError::OriginMismatch);
    }
    Ok(())
}

/// Normalizes an `Origin` header's host (stripping default ports 80/443,
/// keeping non-default ports as `host:port`) and compares it
/// case-insensitively against the `Host` header.
fn origin_matches_host(origin: Option<&str>, host: Option<&str>) -> bool {
    let (Some(origin), Some(host)) = (origin, host) else {
        return false;
    };

    let Some(normalized) = normalize_origin(origin) else {
        return false;
    };

    normalized.eq_ignore_ascii_case(host)
}

fn normalize_origin(origin: &str) -> Option<String> {
    // `Origin` headers are always `scheme://host[:port]`, no path.
    let without_scheme = origin.split("://").nth(1).unwrap_or(origin);
    let (address, port) = match without_scheme.rsplit_once(':') {
        Some((addr, port_str)) => match port_str.parse::<u16>() {
            Ok(port) => (addr, Some(port)),
            Err(_) => (without_scheme, None),
        },
        None => (without_scheme, None),
    };

    let is_default_port = matches!(port, None | Some(80) | Some(443));
    Some(if is_default_port {
        address.to_string()
    } else {
        format!("{address}:{}", port.unwrap())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(once: bool, max_clients: usize, check_origin: bool) -> Config {
        Config {
            bind: "127.0.0.1:7681".parse().unwrap(),
            command: "cat".to_string(),
            argv: vec!["cat".to_string()],
            ws_path: "/ws".to_string(),
            credential: None,
            prefs_json: "{}".to_string(),
            reconnect: 10,
            sig: nix::sys::signal::Signal::SIGHUP,
            readonly: false,
            once,
            check_origin,
            max_clients,
        }
    }

    #[test]
    fn accepts_default_port_80_against_bare_host() {
        assert!(origin_matches_host(Some("http://h:80"), Some("h")));
    }

    #[test]
    fn accepts_default_port_443_against_bare_host() {
        assert!(origin_matches_host(Some("https://h:443"), Some("h")));
    }

    #[test]
    fn rejects_non_default_port_mismatch() {
        assert!(!origin_matches_host(Some("http://h:81"), Some("h")));
    }

    #[test]
    fn accepts_case_insensitive_host() {
        assert!(origin_matches_host(Some("http://Example.com"), Some("example.com")));
    }

    #[test]
    fn once_policy_rejects_second_client() {
        let cfg = config(true, 0, false);
        let req = AdmissionRequest {
            path: "/ws",
            origin: None,
            host: None,
        };
        assert_eq!(
            check(&req, &cfg, 1, true).unwrap_err(),
            AdmissionError::OnceExhausted
        );
    }

    #[test]
    fn max_clients_rejects_at_capacity() {
        let cfg = config(false, 2, false);
        let req = AdmissionRequest {
            path: "/ws",
            origin: None,
            host: None,
        };
        assert_eq!(
            check(&req, &cfg, 2, false).unwrap_err(),
            AdmissionError::AtCapacity
        );
        assert!(check(&req, &cfg, 1, false).is_ok());
    }

    #[test]
    fn wrong_path_is_rejected() {
        let cfg = config(false, 0, false);
        let req = AdmissionRequest {
            path: "/other",
            origin: None,
            host: None,
        };
        assert_eq!(
            check(&req, &cfg, 0, false).unwrap_err(),
            AdmissionError::WrongPath("/other".to_string())
        );
    }

    #[test]
    fn origin_check_enforced_when_enabled() {
        let cfg = config(false, 0, true);
        let req = AdmissionRequest {
            path: "/ws",
            origin: Some("http://h:81"),
            host: Some("h"),
        };
        assert_eq!(
            check(&req, &cfg, 0, false).unwrap_err(),
            AdmissionError::OriginMismatch
        );
    }
}
