//! Proxy request parsing: CONNECT tunnels and absolute-form HTTP requests

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use url::Url;

/// Upper bound on the request head
const MAX_HEAD_BYTES: usize = 16 * 1024;

/// Headers meant for us, never for the origin
const PROXY_HEADERS: [&str; 2] = ["proxy-connection", "proxy-authorization"];

/// What the client asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestType {
    /// CONNECT method for HTTPS tunneling
    Connect { host: String, port: u16 },
    /// Absolute-form request to be forwarded, with its origin-form target
    Forward {
        host: String,
        port: u16,
        path: String,
    },
    /// Origin-form request addressed to the proxy itself
    NotProxy,
}

/// Parsed request line and headers, kept in order so they can be replayed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Parse a request head, up to and including the blank line
    pub fn parse(head: &str) -> anyhow::Result<Self> {
        let mut lines = head.lines();
        let first_line = lines
            .next()
            .ok_or_else(|| anyhow::anyhow!("Empty request"))?;

        let parts: Vec<&str> = first_line.split_whitespace().collect();
        let [method, target, version] = parts.as_slice() else {
            anyhow::bail!("Invalid request line: {first_line:?}");
        };

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| anyhow::anyhow!("Invalid header line: {line:?}"))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Ok(Self {
            method: method.to_string(),
            target: target.to_string(),
            version: version.to_string(),
            headers,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn classify(&self) -> anyhow::Result<RequestType> {
        if self.method.eq_ignore_ascii_case("CONNECT") {
            let (host, port) = split_authority(&self.target, None)?;
            return Ok(RequestType::Connect { host, port });
        }

        match Url::parse(&self.target) {
            Ok(url) if url.has_host() => {
                let host = url
                    .host_str()
                    .ok_or_else(|| anyhow::anyhow!("No host in URL"))?
                    .trim_start_matches('[')
                    .trim_end_matches(']')
                    .to_string();
                let port = url
                    .port_or_known_default()
                    .ok_or_else(|| anyhow::anyhow!("Unknown URL scheme: {}", url.scheme()))?;
                let mut path = url.path().to_string();
                if let Some(query) = url.query() {
                    path.push('?');
                    path.push_str(query);
                }
                Ok(RequestType::Forward { host, port, path })
            }
            _ => Ok(RequestType::NotProxy),
        }
    }

    /// Serialize the head, optionally with a different request target and
    /// without the proxy-only headers.
    pub fn to_bytes(&self, target: Option<&str>, strip_proxy_headers: bool) -> Vec<u8> {
        let mut out = format!(
            "{} {} {}\r\n",
            self.method,
            target.unwrap_or(&self.target),
            self.version
        );
        for (name, value) in &self.headers {
            if strip_proxy_headers
                && PROXY_HEADERS
                    .iter()
                    .any(|h| name.eq_ignore_ascii_case(h))
            {
                continue;
            }
            out.push_str(&format!("{name}: {value}\r\n"));
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}

/// A request read off a client connection
#[derive(Debug)]
pub struct ProxyRequest {
    pub head: RequestHead,
    pub kind: RequestType,
    /// Bytes the client sent after the head
    pub buffered: Vec<u8>,
}

impl ProxyRequest {
    /// URL handed to `FindProxyForURL`
    pub fn pac_url(&self) -> String {
        match &self.kind {
            RequestType::Connect { host, port } => {
                let host = bracket_ipv6(host);
                if *port == 443 {
                    format!("https://{host}/")
                } else {
                    format!("https://{host}:{port}/")
                }
            }
            _ => self.head.target.clone(),
        }
    }
}

fn bracket_ipv6(host: &str) -> String {
    if host.contains(':') {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}

/// Split `host:port`, accepting bracketed IPv6 literals
fn split_authority(authority: &str, default_port: Option<u16>) -> anyhow::Result<(String, u16)> {
    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow::anyhow!("Invalid host:port format"))?;
        (host, rest.strip_prefix(':'))
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    let port = match (port, default_port) {
        (Some(port), _) => port
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid port number: {port}"))?,
        (None, Some(default)) => default,
        (None, None) => anyhow::bail!("Invalid host:port format"),
    };
    if host.is_empty() {
        anyhow::bail!("Missing host in {authority:?}");
    }

    Ok((host.to_string(), port))
}

/// Read and parse one request head from a client stream
///
/// Returns the request and the stream, so the caller can keep tunneling.
pub async fn read_request(stream: TcpStream) -> anyhow::Result<(ProxyRequest, TcpStream)> {
    let mut reader = BufReader::with_capacity(MAX_HEAD_BYTES, stream);
    let mut head = Vec::new();

    // Read headers until we find \r\n\r\n (end of headers)
    loop {
        let mut line = Vec::new();
        let n = reader.read_until(b'\n', &mut line).await?;

        if n == 0 {
            anyhow::bail!("Connection closed before request received");
        }

        head.extend_from_slice(&line);

        let blank = line == b"\r\n" || line == b"\n";
        if blank && head.len() > line.len() {
            break;
        }

        if head.len() > MAX_HEAD_BYTES {
            anyhow::bail!("HTTP headers too large (>16KB)");
        }
    }

    let head = RequestHead::parse(&String::from_utf8_lossy(&head))?;
    let kind = head.classify()?;

    // Pipelined data already pulled into the buffer
    let buffered = reader.buffer().to_vec();
    let stream = reader.into_inner();

    Ok((
        ProxyRequest {
            head,
            kind,
            buffered,
        },
        stream,
    ))
}

/// Send HTTP 200 response to indicate successful CONNECT
pub async fn send_connect_success(stream: &mut TcpStream) -> anyhow::Result<()> {
    let response = "HTTP/1.1 200 Connection Established\r\n\r\n";
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// Send HTTP error response with a plain-text body
pub async fn send_error_response(
    stream: &mut TcpStream,
    status: u16,
    message: &str,
    body: &str,
) -> anyhow::Result<()> {
    let body = format!("{body}\n");
    let response = format!(
        "HTTP/1.1 {status} {message}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(request: &str) -> RequestType {
        RequestHead::parse(request).unwrap().classify().unwrap()
    }

    #[test]
    fn test_parse_connect_request() {
        let request = "CONNECT example.com:443 HTTP/1.1\r\nHost: example.com\r\n\r\n";
        assert_eq!(
            classify(request),
            RequestType::Connect {
                host: "example.com".to_string(),
                port: 443
            }
        );
    }

    #[test]
    fn test_parse_connect_with_whitespace() {
        let request = "CONNECT  example.com:8443  HTTP/1.1\r\n\r\n";
        assert_eq!(
            classify(request),
            RequestType::Connect {
                host: "example.com".to_string(),
                port: 8443
            }
        );
    }

    #[test]
    fn test_parse_connect_ipv6() {
        let request = "CONNECT [::1]:443 HTTP/1.1\r\n\r\n";
        assert_eq!(
            classify(request),
            RequestType::Connect {
                host: "::1".to_string(),
                port: 443
            }
        );
    }

    #[test]
    fn test_parse_connect_invalid_port() {
        let head = RequestHead::parse("CONNECT example.com:invalid HTTP/1.1\r\n\r\n").unwrap();
        assert!(head.classify().is_err());
    }

    #[test]
    fn test_parse_connect_no_port() {
        let head = RequestHead::parse("CONNECT example.com HTTP/1.1\r\n\r\n").unwrap();
        assert!(head.classify().is_err());
    }

    #[test]
    fn test_parse_http_request() {
        let request = "GET http://example.com/path?q=1 HTTP/1.1\r\nHost: example.com\r\n\r\n";
        assert_eq!(
            classify(request),
            RequestType::Forward {
                host: "example.com".to_string(),
                port: 80,
                path: "/path?q=1".to_string()
            }
        );
    }

    #[test]
    fn test_origin_form_is_not_a_proxy_request() {
        let request = "GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n";
        assert_eq!(classify(request), RequestType::NotProxy);
    }

    #[test]
    fn test_invalid_request_line() {
        assert!(RequestHead::parse("GET\r\n\r\n").is_err());
        assert!(RequestHead::parse("GET / HTTP/1.1\r\nbroken header\r\n\r\n").is_err());
    }

    #[test]
    fn test_rewrite_strips_proxy_headers() {
        let head = RequestHead::parse(
            "GET http://example.com/a HTTP/1.1\r\nHost: example.com\r\nProxy-Connection: keep-alive\r\nProxy-Authorization: Basic Zm9vOmJhcg==\r\nAccept: */*\r\n\r\n",
        )
        .unwrap();

        let rewritten = String::from_utf8(head.to_bytes(Some("/a"), true)).unwrap();
        assert_eq!(
            rewritten,
            "GET /a HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n"
        );

        let forwarded = String::from_utf8(head.to_bytes(None, false)).unwrap();
        assert!(forwarded.starts_with("GET http://example.com/a HTTP/1.1\r\n"));
        assert!(forwarded.contains("Proxy-Authorization: Basic Zm9vOmJhcg==\r\n"));
        assert_eq!(head.header("proxy-connection"), Some("keep-alive"));
    }

    #[test]
    fn test_pac_url() {
        let request = |kind, target: &str| ProxyRequest {
            head: RequestHead {
                method: "GET".to_string(),
                target: target.to_string(),
                version: "HTTP/1.1".to_string(),
                headers: Vec::new(),
            },
            kind,
            buffered: Vec::new(),
        };

        let connect = request(
            RequestType::Connect {
                host: "example.com".to_string(),
                port: 443,
            },
            "example.com:443",
        );
        assert_eq!(connect.pac_url(), "https://example.com/");

        let connect = request(
            RequestType::Connect {
                host: "::1".to_string(),
                port: 8443,
            },
            "[::1]:8443",
        );
        assert_eq!(connect.pac_url(), "https://[::1]:8443/");

        let forward = request(
            RequestType::Forward {
                host: "example.com".to_string(),
                port: 80,
                path: "/".to_string(),
            },
            "http://example.com/",
        );
        assert_eq!(forward.pac_url(), "http://example.com/");
    }

    #[test]
    fn test_large_headers_parsing() {
        let mut large_request = String::from("CONNECT example.com:443 HTTP/1.1\r\n");
        for i in 0..100 {
            large_request.push_str(&format!("X-Custom-Header-{i}: value\r\n"));
        }
        large_request.push_str("\r\n");

        let head = RequestHead::parse(&large_request).unwrap();
        assert_eq!(head.headers.len(), 100);
        assert!(matches!(head.classify().unwrap(), RequestType::Connect { .. }));
    }
}
