use bytes::{BufMut, Bytes, BytesMut};

/// Header fields advertised to relay clients when no upstream header was
/// captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcyResponse {
    pub content_type: String,
    pub name: Option<String>,
    pub genre: Option<String>,
    pub url: Option<String>,
    pub bitrate_kbps: Option<u32>,
    pub meta_interval: Option<usize>,
}

impl Default for IcyResponse {
    fn default() -> Self {
        Self {
            content_type: "audio/mpeg".to_string(),
            name: None,
            genre: None,
            url: None,
            bitrate_kbps: None,
            meta_interval: None,
        }
    }
}

/// The response header sent to every admitted client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseHeader {
    /// Bytes captured from the upstream connection, sent verbatim.
    Captured(Bytes),
    /// Rendered per client; `icy-metaint` only appears for clients that
    /// negotiated metadata.
    Generated(IcyResponse),
}

impl ResponseHeader {
    #[must_use]
    pub fn render(&self, wants_metadata: bool) -> Bytes {
        match self {
            Self::Captured(bytes) => bytes.clone(),
            Self::Generated(response) => render_icy(response, wants_metadata),
        }
    }
}

fn render_icy(response: &IcyResponse, wants_metadata: bool) -> Bytes {
    let mut out = BytesMut::with_capacity(256);
    out.put_slice(b"ICY 200 OK\r\n");

    let optional = [
        ("icy-name", response.name.as_deref()),
        ("icy-genre", response.genre.as_deref()),
        ("icy-url", response.url.as_deref()),
    ];
    for (field, value) in optional {
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            put_field(&mut out, field, value);
        }
    }
    if let Some(bitrate) = response.bitrate_kbps.filter(|&b| b > 0) {
        put_field(&mut out, "icy-br", &bitrate.to_string());
    }
    put_field(&mut out, "content-type", &response.content_type);
    if let Some(interval) = response.meta_interval.filter(|_| wants_metadata) {
        put_field(&mut out, "icy-metaint", &interval.to_string());
    }

    out.put_slice(b"\r\n");
    out.freeze()
}

fn put_field(out: &mut BytesMut, field: &str, value: &str) {
    out.put_slice(field.as_bytes());
    out.put_u8(b':');
    // Values come from upstream headers and config; never let them end the line.
    for byte in value.bytes().filter(|b| *b != b'\r' && *b != b'\n') {
        out.put_u8(byte);
    }
    out.put_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn station() -> IcyResponse {
        IcyResponse {
            content_type: "audio/mpeg".to_string(),
            name: Some("Night Drive".to_string()),
            genre: Some("Synthwave".to_string()),
            url: None,
            bitrate_kbps: Some(128),
            meta_interval: Some(8192),
        }
    }

    #[test]
    fn test_generated_header_with_metadata() {
        let header = ResponseHeader::Generated(station()).render(true);
        assert_eq!(
            &header[..],
            b"ICY 200 OK\r\n\
              icy-name:Night Drive\r\n\
              icy-genre:Synthwave\r\n\
              icy-br:128\r\n\
              content-type:audio/mpeg\r\n\
              icy-metaint:8192\r\n\
              \r\n"
        );
    }

    #[test]
    fn test_generated_header_without_metadata() {
        let header = ResponseHeader::Generated(station()).render(false);
        let text = String::from_utf8(header.to_vec()).unwrap();
        assert!(!text.contains("icy-metaint"));
        assert!(text.ends_with("content-type:audio/mpeg\r\n\r\n"));
    }

    #[test]
    fn test_captured_header_is_verbatim() {
        let captured = Bytes::from_static(b"ICY 200 OK\r\nicy-metaint:16000\r\n\r\n");
        let header = ResponseHeader::Captured(captured.clone());
        assert_eq!(header.render(true), captured);
        assert_eq!(header.render(false), captured);
    }

    #[test]
    fn test_field_values_cannot_break_lines() {
        let response = IcyResponse {
            name: Some("Evil\r\nicy-metaint:1".to_string()),
            ..IcyResponse::default()
        };
        let header = ResponseHeader::Generated(response).render(false);
        let text = String::from_utf8(header.to_vec()).unwrap();
        assert!(text.contains("icy-name:Evilicy-metaint:1\r\n"));
        assert_eq!(text.matches("\r\n").count(), 4);
    }
}
