//! Forward handler for non-CONNECT requests.
//!
//! # Responsibilities
//! - Resolve the origin and dial it
//! - Rewrite the request to origin-form with hop-by-hop headers stripped
//! - Stream the request body up and the response back
//!
//! # Design Decisions
//! - One round-trip per client connection; no upstream connection reuse
//! - A 504 is only possible before the first response byte reaches the client

use std::net::IpAddr;
use std::time::Instant;

use tokio::io::AsyncWriteExt;

use crate::error::ProxyError;
use crate::http::body::{relay_body, BodyFraming};
use crate::http::request::{Origin, ParsedRequest, Version};
use crate::http::response::{read_response_head, ResponseHead};
use crate::http::server::ProxyContext;
use crate::net::connection::ClientConnection;
use crate::observability::metrics;
use crate::security::headers::{outbound_request_headers, outbound_response_headers, ProxySignature};

/// Summary of a completed round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardOutcome {
    pub status: u16,
    pub request_body_bytes: u64,
    pub response_body_bytes: u64,
}

/// Serialize the origin-form request head.
pub fn build_request_head(
    request: &ParsedRequest,
    origin: &Origin,
    client_ip: IpAddr,
    signature: &ProxySignature,
    framing: BodyFraming,
) -> Vec<u8> {
    let headers = outbound_request_headers(
        &request.headers,
        &origin.host_header,
        client_ip,
        signature,
        framing,
    );

    let mut head = format!(
        "{} {} {}\r\n",
        request.method,
        origin.path_and_query,
        Version::Http11
    )
    .into_bytes();
    headers.write_to(&mut head);
    head.extend_from_slice(b"\r\n");
    head
}

/// Serialize a response head for the client.
pub fn build_response_head(head: &ResponseHead, framing: BodyFraming) -> Vec<u8> {
    let mut bytes = head.status_line().into_bytes();
    outbound_response_headers(&head.headers, framing).write_to(&mut bytes);
    bytes.extend_from_slice(b"\r\n");
    bytes
}

/// Proxy one request to its origin and stream the response back.
pub async fn handle_forward(
    ctx: &ProxyContext,
    client: &mut ClientConnection,
    request: &ParsedRequest,
) -> Result<ForwardOutcome, ProxyError> {
    let started = Instant::now();

    let origin = request.origin().ok_or_else(|| {
        ProxyError::BadTarget(format!(
            "{} request without an http absolute target or Host header",
            request.method
        ))
    })?;
    let request_framing = request.body_framing()?;

    let mut upstream = ctx.dialer.dial(&origin.host, origin.port).await?;
    tracing::debug!(
        method = %request.method,
        origin = %origin.host_header,
        path = %origin.path_and_query,
        remote_addr = %upstream.remote_addr(),
        dial_ms = upstream.dial_duration().as_millis() as u64,
        "Forwarding request"
    );

    let head = build_request_head(
        request,
        &origin,
        client.peer_addr().ip(),
        &ctx.signature,
        request_framing,
    );
    match tokio::time::timeout(ctx.timeouts.upstream, upstream.writer.write_all(&head)).await {
        Ok(result) => result.map_err(ProxyError::UpstreamIo)?,
        Err(_) => return Err(ProxyError::UpstreamTimeout(ctx.timeouts.upstream)),
    }
    let request_body_bytes = relay_body(
        &mut client.reader,
        &mut upstream.writer,
        request_framing,
        ctx.timeouts.idle,
        ctx.limits.max_chunk_line_bytes,
    )
    .await
    .map_err(ProxyError::from_request_body)?;

    let response = loop {
        let head = match tokio::time::timeout(
            ctx.timeouts.upstream,
            read_response_head(&mut upstream.reader, ctx.limits.max_header_bytes),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(ProxyError::UpstreamTimeout(ctx.timeouts.upstream)),
        };

        if !head.is_interim() {
            break head;
        }
        // HTTP/1.0 clients do not understand interim responses.
        if request.version == Version::Http11 {
            client
                .send(&build_response_head(&head, BodyFraming::Empty))
                .await
                .map_err(ProxyError::ClientWrite)?;
        }
    };

    let response_framing = response.framing(request.is_head())?;
    client
        .send(&build_response_head(&response, response_framing))
        .await
        .map_err(ProxyError::ClientWrite)?;

    let response_body_bytes = relay_body(
        &mut upstream.reader,
        &mut client.writer,
        response_framing,
        ctx.timeouts.idle,
        ctx.limits.max_chunk_line_bytes,
    )
    .await
    .map_err(ProxyError::from_response_body)?;

    metrics::record_request(&request.method, response.code, started);
    tracing::info!(
        method = %request.method,
        origin = %origin.host_header,
        status = response.code,
        request_body_bytes,
        response_body_bytes,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Request forwarded"
    );

    Ok(ForwardOutcome {
        status: response.code,
        request_body_bytes,
        response_body_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::headers::Headers;
    use crate::http::request::read_request;
    use std::net::Ipv4Addr;

    async fn parse(input: &[u8]) -> ParsedRequest {
        let mut reader = input;
        read_request(&mut reader, 4096).await.unwrap()
    }

    #[tokio::test]
    async fn request_head_is_origin_form_without_hop_by_hop() {
        let request = parse(
            b"POST http://127.0.0.1:9001/echo HTTP/1.1\r\nHost: 127.0.0.1:9001\r\nContent-Length: 4\r\nProxy-Connection: keep-alive\r\n\r\n",
        )
        .await;
        let origin = request.origin().unwrap();
        let head = build_request_head(
            &request,
            &origin,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            &ProxySignature::new("LocalhostProxy/1.0"),
            request.body_framing().unwrap(),
        );

        assert_eq!(
            String::from_utf8(head).unwrap(),
            "POST /echo HTTP/1.1\r\n\
             Host: 127.0.0.1:9001\r\n\
             Content-Length: 4\r\n\
             Via: 1.1 LocalhostProxy/1.0\r\n\
             X-Forwarded-For: 127.0.0.1\r\n\
             \r\n"
        );
    }

    #[tokio::test]
    async fn http_10_request_goes_upstream_as_11() {
        let request = parse(b"GET /x HTTP/1.0\r\nHost: h\r\n\r\n").await;
        let origin = request.origin().unwrap();
        let head = build_request_head(
            &request,
            &origin,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            &ProxySignature::new("p"),
            BodyFraming::Empty,
        );
        assert!(head.starts_with(b"GET /x HTTP/1.1\r\nHost: h\r\n"));
    }

    #[test]
    fn response_head_matches_origin_minus_hop_by_hop() {
        let mut headers = Headers::new();
        headers.push("Content-Length", "5");
        headers.push("Connection", "close");
        let head = ResponseHead {
            code: 200,
            reason: "OK".into(),
            headers,
        };
        assert_eq!(
            build_response_head(&head, BodyFraming::Length(5)),
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n"
        );
    }
}
