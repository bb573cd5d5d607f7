//! Header manipulation for forwarded messages.
//!
//! # Responsibilities
//! - Strip hop-by-hop headers, including those named by `Connection`
//! - Pin `Host` to the resolved origin authority
//! - Append this proxy to `Via` and the client to `X-Forwarded-For`
//!
//! # Design Decisions
//! - Header order is preserved; stripping only removes lines
//! - Inbound `Transfer-Encoding` is never copied line by line; when a
//!   transfer-coded body is relayed the full coding list is restated as one
//!   header, since the body bytes still carry every coding

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use crate::http::body::BodyFraming;
use crate::http::headers::{Header, Headers};

/// Headers that never cross this proxy (RFC 7230 section 6.1, plus `Proxy-Connection`).
pub const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// The fixed hop-by-hop set extended with the tokens of one message's `Connection` header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HopByHopHeaders {
    listed: Vec<String>,
}

impl HopByHopHeaders {
    pub fn for_message(headers: &Headers) -> Self {
        Self {
            listed: headers
                .list_values("connection")
                .map(str::to_ascii_lowercase)
                .collect(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        HOP_BY_HOP_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name))
            || self.listed.iter().any(|h| h.eq_ignore_ascii_case(name))
    }

    /// Copy `headers` without any hop-by-hop lines.
    pub fn strip(&self, headers: &Headers) -> Headers {
        headers
            .iter()
            .filter(|h| !self.contains(&h.name))
            .cloned()
            .collect()
    }
}

/// Process-wide identity written into `Via`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySignature(Arc<str>);

impl ProxySignature {
    pub fn new(name: &str) -> Self {
        Self(Arc::from(name))
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    /// `1.1 <name>`
    pub fn via_entry(&self) -> String {
        format!("1.1 {}", self.0)
    }
}

impl fmt::Display for ProxySignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Headers for the request sent to the origin.
pub fn outbound_request_headers(
    inbound: &Headers,
    host: &str,
    client_ip: IpAddr,
    signature: &ProxySignature,
    framing: BodyFraming,
) -> Headers {
    let chunked = framing == BodyFraming::Chunked;
    let mut host_written = false;

    let mut out: Headers = HopByHopHeaders::for_message(inbound)
        .strip(inbound)
        .into_iter()
        .filter_map(|h| {
            if h.is("host") {
                if host_written {
                    return None;
                }
                host_written = true;
                return Some(Header::new(h.name, host));
            }
            if chunked && h.is("content-length") {
                return None;
            }
            Some(h)
        })
        .collect();

    if !host_written {
        out.insert(0, "Host", host);
    }
    out.append_to_list("Via", &signature.via_entry());
    out.append_to_list("X-Forwarded-For", &client_ip.to_canonical().to_string());
    if chunked {
        out.push("Transfer-Encoding", relayed_codings(inbound));
    }
    out
}

/// Headers for the response sent back to the client.
pub fn outbound_response_headers(inbound: &Headers, framing: BodyFraming) -> Headers {
    let mut out = HopByHopHeaders::for_message(inbound).strip(inbound);

    match framing {
        BodyFraming::Chunked => {
            out = out.into_iter().filter(|h| !h.is("content-length")).collect();
            out.push("Transfer-Encoding", relayed_codings(inbound));
        }
        BodyFraming::Close if inbound.contains("transfer-encoding") => {
            out.push("Transfer-Encoding", relayed_codings(inbound));
        }
        _ => {}
    }
    out
}

/// Every inbound transfer-coding in order, joined into one list value.
fn relayed_codings(inbound: &Headers) -> String {
    let codings: Vec<_> = inbound.list_values("transfer-encoding").collect();
    if codings.is_empty() {
        return "chunked".to_string();
    }
    codings.join(", ")
}
