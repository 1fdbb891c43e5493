//! HTTP proxy front end
//!
//! Each client connection carries one proxy request. The PAC verdict picks
//! the route, then bytes are copied both ways until either side closes.

use crate::http_connect::{self, ProxyRequest, RequestType};
use pac_engine::{PacResolver, ProxyDirective};
use std::sync::Arc;
use tokio::io::{copy_bidirectional, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, info, warn};

/// Accept clients forever, one task per connection.
pub async fn run(listener: TcpListener, resolver: Arc<PacResolver>) -> anyhow::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        debug!("Accepted connection from {}", peer);

        let resolver = resolver.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(socket, resolver).await {
                warn!("Error handling client {}: {:#}", peer, e);
            }
        });
    }
}

async fn handle_client(client: TcpStream, resolver: Arc<PacResolver>) -> anyhow::Result<()> {
    let (request, mut client) = http_connect::read_request(client).await?;

    let (host, port) = match &request.kind {
        RequestType::Connect { host, port } | RequestType::Forward { host, port, .. } => {
            (host.clone(), *port)
        }
        RequestType::NotProxy => {
            debug!("Rejecting non-proxy request for {}", request.head.target);
            http_connect::send_error_response(
                &mut client,
                400,
                "Bad Request",
                "This is a proxy server. Does not respond to non-proxy requests.",
            )
            .await?;
            return Ok(());
        }
    };

    let url = request.pac_url();
    let lookup = {
        let resolver = resolver.clone();
        let url = url.clone();
        tokio::task::spawn_blocking(move || resolver.resolve(&url)).await?
    };
    let directive = match lookup {
        Ok(directive) => directive,
        Err(e) => {
            warn!("No route for {}: {}", url, e);
            http_connect::send_error_response(&mut client, 502, "Bad Gateway", &e.to_string())
                .await?;
            return Ok(());
        }
    };
    info!("{} {} via {}", request.head.method, url, directive);

    let upstream = match connect_upstream(&resolver, &directive, &host, port).await {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!("Failed to reach {}:{} via {}: {:#}", host, port, directive, e);
            http_connect::send_error_response(
                &mut client,
                502,
                "Bad Gateway",
                &format!("{e:#}"),
            )
            .await?;
            return Ok(());
        }
    };

    relay(client, upstream, &request, &directive).await
}

/// Open the connection the directive asks for. For `PROXY` this is a
/// connection to the proxy itself, otherwise a stream to the origin.
async fn connect_upstream(
    resolver: &Arc<PacResolver>,
    directive: &ProxyDirective,
    host: &str,
    port: u16,
) -> anyhow::Result<TcpStream> {
    let timeout = resolver.registry().settings().dial_timeout;

    match directive {
        ProxyDirective::Direct => {
            let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
                .await
                .map_err(|_| anyhow::anyhow!("connection to {host}:{port} timed out"))??;
            Ok(stream)
        }
        ProxyDirective::Proxy { .. } => dial_registry(resolver, directive).await,
        ProxyDirective::Socks5 { .. } => {
            let stream = dial_registry(resolver, directive).await?;
            let socks = tokio::time::timeout(
                timeout,
                Socks5Stream::connect_with_socket(stream, (host, port)),
            )
            .await
            .map_err(|_| anyhow::anyhow!("SOCKS5 handshake with {directive} timed out"))??;
            Ok(socks.into_inner())
        }
    }
}

/// Take an upstream connection from the health registry, reusing the one
/// left over from a probe when there is one.
async fn dial_registry(
    resolver: &Arc<PacResolver>,
    directive: &ProxyDirective,
) -> anyhow::Result<TcpStream> {
    let dialed = {
        let resolver = resolver.clone();
        let directive = directive.clone();
        tokio::task::spawn_blocking(move || resolver.dial(&directive)).await??
    };
    let stream = dialed.ok_or_else(|| anyhow::anyhow!("{directive} has no upstream address"))?;

    stream.set_nonblocking(true)?;
    Ok(TcpStream::from_std(stream)?)
}

async fn relay(
    mut client: TcpStream,
    mut upstream: TcpStream,
    request: &ProxyRequest,
    directive: &ProxyDirective,
) -> anyhow::Result<()> {
    match (&request.kind, directive) {
        // The upstream proxy answers the CONNECT or request itself
        (_, ProxyDirective::Proxy { .. }) => {
            upstream.write_all(&request.head.to_bytes(None, false)).await?;
        }
        (RequestType::Connect { .. }, _) => {
            http_connect::send_connect_success(&mut client).await?;
        }
        (RequestType::Forward { path, .. }, _) => {
            upstream
                .write_all(&request.head.to_bytes(Some(path), true))
                .await?;
        }
        (RequestType::NotProxy, _) => anyhow::bail!("Cannot relay a non-proxy request"),
    }

    if !request.buffered.is_empty() {
        upstream.write_all(&request.buffered).await?;
    }
    upstream.flush().await?;

    let (sent, received) = copy_bidirectional(&mut client, &mut upstream).await?;
    debug!(
        "Closed {} ({} bytes sent, {} bytes received)",
        request.pac_url(),
        sent,
        received
    );
    Ok(())
}
