use rand::RngCore;
use rand_chacha::ChaCha20Rng;
use sha1::{Digest, Sha1};

// https://tools.ietf.org/html/rfc6455#section-1.3
const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const WEBSOCKET_VERSION: &str = "13";

/// A parsed client opening-handshake request.
#[derive(Debug)]
pub(crate) struct RequestHead {
    pub resource: String,
    pub key: String,
}

pub(crate) fn generate_key(rng: &mut ChaCha20Rng) -> String {
    let mut rand_bytes = [0u8; 16];
    rng.fill_bytes(&mut rand_bytes);
    base64::encode(rand_bytes)
}

pub(crate) fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    base64::encode(hasher.finalize())
}

pub(crate) fn make_request(host: &str, resource: &str, key: &str) -> Vec<u8> {
    let headers = [
        ("Host", host),
        ("Upgrade", "websocket"),
        ("Connection", "Upgrade"),
        ("Sec-WebSocket-Key", key),
        ("Sec-WebSocket-Version", WEBSOCKET_VERSION),
    ];

    let mut req = format!("GET {} HTTP/1.1\r\n", resource);
    for (field, value) in headers {
        req.push_str(&format!("{}: {}\r\n", field, value));
    }
    req.push_str("\r\n");
    req.into_bytes()
}

pub(crate) fn make_response(key: &str) -> Vec<u8> {
    let mut resp = String::from("HTTP/1.1 101 Switching Protocols\r\n");
    resp.push_str("Upgrade: websocket\r\n");
    resp.push_str("Connection: Upgrade\r\n");
    resp.push_str(&format!("Sec-WebSocket-Accept: {}\r\n", accept_key(key)));
    resp.push_str("\r\n");
    resp.into_bytes()
}

pub(crate) fn make_reject_response() -> Vec<u8> {
    b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n".to_vec()
}

/// Validates a client opening-handshake head (everything before the blank
/// line, CRLF separated).
pub(crate) fn parse_request(head: &str) -> Result<RequestHead, &'static str> {
    let mut lines = head.split("\r\n");
    let request_line = lines.next().ok_or("empty request")?;

    let mut parts = request_line.split_whitespace();
    if parts.next() != Some("GET") {
        return Err("handshake request is not a GET");
    }
    let resource = parts.next().ok_or("missing request target")?;
    if parts.next() != Some("HTTP/1.1") || parts.next().is_some() {
        return Err("malformed request line");
    }

    let headers = parse_headers(lines)?;
    if !header_eq(&headers, "upgrade", "websocket") {
        return Err("missing or invalid Upgrade header");
    }
    if !connection_upgrades(&headers) {
        return Err("missing or invalid Connection header");
    }
    if header(&headers, "sec-websocket-version") != Some(WEBSOCKET_VERSION) {
        return Err("unsupported Sec-WebSocket-Version");
    }
    let key = header(&headers, "sec-websocket-key").ok_or("missing Sec-WebSocket-Key")?;

    Ok(RequestHead {
        resource: resource.to_owned(),
        key: key.to_owned(),
    })
}

/// Validates a server opening-handshake response head against the key the
/// client sent.
pub(crate) fn parse_response(head: &str, key: &str) -> Result<(), &'static str> {
    let mut lines = head.split("\r\n");
    let status_line = lines.next().ok_or("empty response")?;

    let mut parts = status_line.split_whitespace();
    if parts.next() != Some("HTTP/1.1") {
        return Err("response is not HTTP/1.1");
    }
    if parts.next() != Some("101") {
        return Err("server refused the upgrade");
    }

    let headers = parse_headers(lines)?;
    if !header_eq(&headers, "upgrade", "websocket") {
        return Err("missing or invalid Upgrade header");
    }
    if !connection_upgrades(&headers) {
        return Err("missing or invalid Connection header");
    }
    if header(&headers, "sec-websocket-accept") != Some(accept_key(key).as_str()) {
        return Err("invalid Sec-WebSocket-Accept key");
    }
    Ok(())
}

fn parse_headers<'a>(
    lines: impl Iterator<Item = &'a str>,
) -> Result<Vec<(String, &'a str)>, &'static str> {
    let mut headers = Vec::new();
    for line in lines.filter(|line| !line.is_empty()) {
        let (name, value) = line.split_once(':').ok_or("malformed header line")?;
        headers.push((name.trim().to_ascii_lowercase(), value.trim()));
    }
    Ok(headers)
}

fn header<'a>(headers: &[(String, &'a str)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(field, _)| field == name)
        .map(|(_, value)| *value)
}

fn header_eq(headers: &[(String, &str)], name: &str, expected: &str) -> bool {
    matches!(header(headers, name), Some(value) if value.eq_ignore_ascii_case(expected))
}

fn connection_upgrades(headers: &[(String, &str)]) -> bool {
    matches!(
        header(headers, "connection"),
        Some(value) if value
            .split(',')
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
    )
}
