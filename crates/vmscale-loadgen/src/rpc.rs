//! Plain HTTP GET against the load generator.
//!
//! One connection per call: the control surface is called a handful of
//! times per second at most, and the targets may still be booting, so
//! there is nothing to gain from pooling.

use std::time::Duration;

use http_body_util::BodyExt;
use thiserror::Error;
use tracing::debug;

use vmscale_core::Retryable;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("connect to {address} failed: {reason}")]
    Connect { address: String, reason: String },

    #[error("request to {uri} timed out after {timeout:?}")]
    Timeout { uri: String, timeout: Duration },

    #[error("{uri} returned HTTP {status}")]
    Status { uri: String, status: u16 },

    #[error("reading body from {uri} failed: {reason}")]
    Body { uri: String, reason: String },

    #[error("invalid address {0:?}")]
    InvalidAddress(String),
}

impl Retryable for RpcError {
    fn is_retryable(&self) -> bool {
        !matches!(self, RpcError::InvalidAddress(_))
    }
}

/// Append the default HTTP port when `address` does not carry one.
pub(crate) fn with_default_port(address: &str) -> Result<String, RpcError> {
    let address = address.trim();
    if address.is_empty() || address.contains('/') {
        return Err(RpcError::InvalidAddress(address.to_string()));
    }
    let has_port = match address.rsplit_once(':') {
        Some((host, port)) => {
            !host.is_empty() && (!host.contains(':') || host.ends_with(']')) && port.parse::<u16>().is_ok()
        }
        None => false,
    };
    if has_port {
        Ok(address.to_string())
    } else {
        Ok(format!("{address}:80"))
    }
}

/// GET `http://{address}{path_and_query}` and return the body as text.
///
/// Succeeds only on a 2xx status with a UTF-8 body.
pub async fn http_get(
    address: &str,
    path_and_query: &str,
    timeout: Duration,
) -> Result<String, RpcError> {
    let authority = with_default_port(address)?;
    let uri = format!("http://{authority}{path_and_query}");

    let result = tokio::time::timeout(timeout, async {
        let stream = tokio::net::TcpStream::connect(&authority)
            .await
            .map_err(|e| RpcError::Connect {
                address: authority.clone(),
                reason: e.to_string(),
            })?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| RpcError::Connect {
                address: authority.clone(),
                reason: e.to_string(),
            })?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method("GET")
            .uri(path_and_query)
            .header("host", &authority)
            .header("user-agent", "vmscale/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
            .map_err(|_| RpcError::InvalidAddress(uri.clone()))?;

        let resp = sender.send_request(req).await.map_err(|e| RpcError::Connect {
            address: authority.clone(),
            reason: e.to_string(),
        })?;

        let status = resp.status();
        if !status.is_success() {
            debug!(%status, %uri, "load generator returned non-2xx");
            return Err(RpcError::Status {
                uri: uri.clone(),
                status: status.as_u16(),
            });
        }

        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| RpcError::Body {
                uri: uri.clone(),
                reason: e.to_string(),
            })?
            .to_bytes();

        String::from_utf8(body.to_vec()).map_err(|e| RpcError::Body {
            uri: uri.clone(),
            reason: e.to_string(),
        })
    })
    .await;

    match result {
        Ok(outcome) => outcome,
        Err(_) => {
            debug!(%uri, "load generator request timed out");
            Err(RpcError::Timeout { uri, timeout })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_port_is_added() {
        assert_eq!(
            with_default_port("ec2-1-2-3-4.compute.amazonaws.com").unwrap(),
            "ec2-1-2-3-4.compute.amazonaws.com:80"
        );
        assert_eq!(with_default_port("10.0.0.5").unwrap(), "10.0.0.5:80");
    }

    #[test]
    fn explicit_port_is_kept() {
        assert_eq!(with_default_port("127.0.0.1:7000").unwrap(), "127.0.0.1:7000");
        assert_eq!(with_default_port("[::1]:8080").unwrap(), "[::1]:8080");
    }

    #[test]
    fn bracketed_ipv6_without_port_gets_default() {
        assert_eq!(with_default_port("[::1]").unwrap(), "[::1]:80");
    }

    #[test]
    fn empty_or_path_address_is_rejected() {
        assert!(matches!(with_default_port(""), Err(RpcError::InvalidAddress(_))));
        assert!(matches!(
            with_default_port("host/path"),
            Err(RpcError::InvalidAddress(_))
        ));
    }

    #[test]
    fn only_invalid_address_is_fatal() {
        assert!(!RpcError::InvalidAddress("x".into()).is_retryable());
        assert!(RpcError::Status { uri: "u".into(), status: 503 }.is_retryable());
        assert!(
            RpcError::Timeout { uri: "u".into(), timeout: Duration::from_secs(1) }.is_retryable()
        );
    }

    #[tokio::test]
    async fn refused_connection_is_connect_error() {
        // Bind then drop to get a port nobody listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = http_get(&addr.to_string(), "/", Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Connect { .. }), "got {err:?}");
    }
}
