//! Dial-string parsing, ported from the source's `net.c`.
//!
//! Only the string-to-target translation is in scope here; actual
//! connection establishment goes through the hub's blocking primitives
//! (`hub::socket`, `hub::wait`, ...), not through this module.

use crate::err::{Error, Result};

/// What a dial string names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialTarget {
    /// `host:port` or `[ipv6]:port`. `host` is empty for `:port` (any address).
    Inet { host: String, port: u16 },
    /// A filesystem path for an `AF_UNIX` socket.
    Unix(String),
    /// A bare integer: adopt an already-open, presumably inherited, fd.
    Fd(i32),
}

fn bad(msg: &str) -> Error {
    Error::Addr(msg.to_string())
}

fn parse_port(s: &str) -> Result<u16> {
    if s.is_empty() {
        return Ok(0);
    }
    s.parse().map_err(|_| bad("invalid port"))
}

/// Parses a dial string per spec.md's `host:port` / `[ipv6]:port` /
/// `/unix/path` / bare-fd grammar.
pub fn parse(dial: &str) -> Result<DialTarget> {
    if !dial.is_empty() && dial.bytes().all(|b| b.is_ascii_digit()) {
        return dial.parse::<i32>().map(DialTarget::Fd).map_err(|_| bad("fd out of range"));
    }

    if let Some(rest) = dial.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(|| bad("unterminated ipv6 literal"))?;
        let port_str = tail.strip_prefix(':').ok_or_else(|| bad("missing port after ipv6 literal"))?;
        return Ok(DialTarget::Inet {
            host: host.to_string(),
            port: parse_port(port_str)?,
        });
    }

    match dial.find(':') {
        Some(idx) => {
            let (host, rest) = dial.split_at(idx);
            Ok(DialTarget::Inet {
                host: host.to_string(),
                port: parse_port(&rest[1..])?,
            })
        }
        None => Ok(DialTarget::Unix(dial.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_port() {
        assert_eq!(
            parse("example.com:8080").unwrap(),
            DialTarget::Inet { host: "example.com".into(), port: 8080 }
        );
    }

    #[test]
    fn parses_ipv6_literal() {
        assert_eq!(
            parse("[::1]:53").unwrap(),
            DialTarget::Inet { host: "::1".into(), port: 53 }
        );
    }

    #[test]
    fn parses_unix_path() {
        assert_eq!(parse("/tmp/sock").unwrap(), DialTarget::Unix("/tmp/sock".into()));
    }

    #[test]
    fn parses_bare_fd() {
        assert_eq!(parse("17").unwrap(), DialTarget::Fd(17));
    }

    #[test]
    fn empty_host_defaults_to_any() {
        assert_eq!(parse(":9000").unwrap(), DialTarget::Inet { host: "".into(), port: 9000 });
    }
}
