#![forbid(unsafe_code)]

pub mod endpoint {
	use std::net::SocketAddr;

	/// URI scheme accepted in front of a bind endpoint.
	pub const TCP_SCHEME: &str = "tcp://";

	/// Parsed `tcp://host:port` endpoint (scheme optional).
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct TcpEndpoint {
		pub host: String,
		pub port: u16,
	}

	impl TcpEndpoint {
		/// Returns `host:port` (host preserved, IPv6 stays bracketed).
		pub fn hostport(&self) -> String {
			format!("{}:{}", self.host, self.port)
		}

		/// Convert to `SocketAddr` only if the host is an IP literal.
		pub fn to_socket_addr_if_ip_literal(&self) -> Result<SocketAddr, String> {
			self.hostport()
				.parse()
				.map_err(|_| format!("host must be an IP literal (DNS names not supported here): {}", self.host))
		}

		/// Parse `tcp://host:port` or bare `host:port`.
		pub fn parse(s: &str) -> Result<Self, String> {
			let s = s.trim();
			if s.is_empty() {
				return Err("endpoint must be non-empty (expected tcp://host:port)".to_string());
			}

			let rest = match s.split_once("://") {
				Some(_) => s
					.strip_prefix(TCP_SCHEME)
					.ok_or_else(|| format!("unsupported scheme (expected tcp://host:port): {s}"))?,
				None => s,
			};

			if rest.contains('/') || rest.contains('?') || rest.contains('#') {
				return Err(format!("invalid endpoint (expected tcp://host:port without path/query/fragment): {s}"));
			}

			let (host, port_str) = rest
				.rsplit_once(':')
				.ok_or_else(|| format!("invalid endpoint (missing :port, expected tcp://host:port): {s}"))?;

			let host = host.trim();
			if host.is_empty() {
				return Err(format!("invalid endpoint host (expected tcp://host:port): {s}"));
			}

			if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
				return Err(format!(
					"invalid endpoint host (IPv6 must be bracketed like tcp://[::1]:8080): {s}"
				));
			}

			// Port 0 asks the OS for an ephemeral port; valid for a listener.
			let port: u16 = port_str
				.trim()
				.parse()
				.map_err(|_| format!("invalid endpoint port (expected 0..=65535): {s}"))?;

			Ok(Self {
				host: host.to_string(),
				port,
			})
		}
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn parses_ipv4_with_and_without_scheme() {
			let e = TcpEndpoint::parse("tcp://0.0.0.0:8080").unwrap();
			assert_eq!(e.host, "0.0.0.0");
			assert_eq!(e.port, 8080);

			let bare = TcpEndpoint::parse("127.0.0.1:9000").unwrap();
			assert_eq!(bare.hostport(), "127.0.0.1:9000");
		}

		#[test]
		fn parses_bracketed_ipv6() {
			let e = TcpEndpoint::parse("tcp://[::1]:8080").unwrap();
			assert_eq!(e.host, "[::1]");
			assert_eq!(e.hostport(), "[::1]:8080");
		}

		#[test]
		fn rejects_unbracketed_ipv6() {
			let err = TcpEndpoint::parse("tcp://::1:8080").unwrap_err();
			assert!(err.to_lowercase().contains("ipv6"));
		}

		#[test]
		fn rejects_foreign_scheme() {
			let err = TcpEndpoint::parse("quic://127.0.0.1:8080").unwrap_err();
			assert!(err.contains("scheme"));
		}

		#[test]
		fn rejects_path_and_missing_port() {
			assert!(TcpEndpoint::parse("tcp://127.0.0.1:8080/").is_err());
			assert!(TcpEndpoint::parse("tcp://127.0.0.1").is_err());
			assert!(TcpEndpoint::parse("tcp://127.0.0.1:99999").is_err());
		}

		#[test]
		fn port_zero_is_allowed_for_ephemeral_bind() {
			let e = TcpEndpoint::parse("tcp://127.0.0.1:0").unwrap();
			assert_eq!(e.port, 0);
		}

		#[test]
		fn to_socket_addr_if_ip_literal() {
			let e = TcpEndpoint::parse("tcp://[::1]:8080").unwrap();
			assert_eq!(e.to_socket_addr_if_ip_literal().unwrap().to_string(), "[::1]:8080");

			let dns = TcpEndpoint::parse("tcp://chat.example.com:8080").unwrap();
			assert!(dns.to_socket_addr_if_ip_literal().is_err());
		}
	}
}
