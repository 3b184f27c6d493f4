// Relay client request header
//
// Clients send a minimal HTTP-style request terminated by a line holding only
// the line terminator. The only tag that changes relay behaviour is
// `Icy-MetaData:`, matched case-insensitively. Its value is the number right
// after any leading whitespace, so `Icy-MetaData: 1` enables metadata while
// `Icy-MetaData: no, v2` does not. A missing tag disables it.

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

use crate::error::{RelayError, Result};

pub const DEFAULT_MAX_HEADER_BYTES: usize = 8192;

const ICY_METADATA_TAG: &str = "Icy-MetaData:";
const USER_AGENT_TAG: &str = "User-Agent:";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayRequest {
    pub request_line: String,
    pub wants_metadata: bool,
    pub user_agent: Option<String>,
}

/// Read a request header from `reader`, up to `max_len` bytes.
pub async fn read_request<R>(reader: &mut R, max_len: usize) -> Result<RelayRequest>
where
    R: AsyncRead + Unpin,
{
    let mut header = Vec::with_capacity(512);
    let mut buf = [0u8; 512];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Err(RelayError::ClientClosed);
        }
        let scan_from = header.len().saturating_sub(2);
        header.extend_from_slice(&buf[..n]);

        if let Some(end) = header_end(&header, scan_from) {
            trace!(len = end, "Read relay request header");
            return Ok(parse_request(&String::from_utf8_lossy(&header[..end])));
        }
        if header.len() > max_len {
            return Err(RelayError::HeaderTooLarge { limit: max_len });
        }
    }
}

/// Offset just past the first line consisting only of the line terminator.
fn header_end(buf: &[u8], scan_from: usize) -> Option<usize> {
    // Back up to the start of the line containing `scan_from`.
    let mut line_start = buf[..scan_from]
        .iter()
        .rposition(|&b| b == b'\n')
        .map_or(0, |i| i + 1);

    for (i, &b) in buf.iter().enumerate().skip(line_start) {
        if b == b'\n' {
            let line = &buf[line_start..i];
            if line.is_empty() || line == b"\r" {
                return Some(i + 1);
            }
            line_start = i + 1;
        }
    }
    None
}

#[must_use]
pub fn parse_request(header: &str) -> RelayRequest {
    let mut lines = header.lines().map(|line| line.trim_end_matches('\r'));
    let mut request = RelayRequest {
        request_line: lines.next().unwrap_or_default().to_string(),
        ..RelayRequest::default()
    };

    for line in lines {
        if let Some(value) = tag_value(line, ICY_METADATA_TAG) {
            request.wants_metadata = parse_flag(value);
        } else if let Some(value) = tag_value(line, USER_AGENT_TAG) {
            request.user_agent = Some(value.trim().to_string());
        }
    }

    request
}

/// The rest of `line` after `tag`, compared case-insensitively.
fn tag_value<'a>(line: &'a str, tag: &str) -> Option<&'a str> {
    let head = line.get(..tag.len())?;
    head.eq_ignore_ascii_case(tag).then(|| &line[tag.len()..])
}

fn parse_flag(value: &str) -> bool {
    let digits: String = value
        .trim_start()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse::<u64>().is_ok_and(|n| n != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_metadata_tag() {
        let cases = [
            ("GET / HTTP/1.0\r\nIcy-MetaData:1\r\n\r\n", true),
            ("GET / HTTP/1.0\r\nicy-metadata: 1\r\n\r\n", true),
            ("GET / HTTP/1.0\r\nICY-METADATA:\t1\r\n\r\n", true),
            ("GET / HTTP/1.0\r\nIcy-MetaData:0\r\n\r\n", false),
            ("GET / HTTP/1.0\r\nIcy-MetaData:\r\n\r\n", false),
            ("GET / HTTP/1.0\r\nHost: x\r\n\r\n", false),
            ("GET / HTTP/1.0\r\nX-Icy-MetaData:1\r\n\r\n", false),
            ("GET / HTTP/1.0\r\nIcy-MetaData: no, v2\r\n\r\n", false),
            ("GET / HTTP/1.0\r\nIcy-MetaData:=1\r\n\r\n", false),
        ];
        for (header, expected) in cases {
            assert_eq!(parse_request(header).wants_metadata, expected, "{header:?}");
        }
    }

    #[test]
    fn test_parse_request_fields() {
        let request =
            parse_request("GET /stream HTTP/1.1\r\nUser-Agent: WinampMPEG/5.0\r\nIcy-MetaData: 1\r\n");
        assert_eq!(request.request_line, "GET /stream HTTP/1.1");
        assert_eq!(request.user_agent.as_deref(), Some("WinampMPEG/5.0"));
        assert!(request.wants_metadata);
    }

    #[test]
    fn test_header_end() {
        assert_eq!(header_end(b"GET / HTTP/1.0\r\n\r\n", 0), Some(18));
        assert_eq!(header_end(b"GET / HTTP/1.0\n\nrest", 0), Some(16));
        assert_eq!(header_end(b"GET / HTTP/1.0\r\nHost: a\r\n", 0), None);
        assert_eq!(header_end(b"\r\n", 0), Some(2));
        // a terminator split across reads is found when rescanning
        assert_eq!(header_end(b"GET /\r\nA: b\r\n\r\n", 12), Some(15));
    }

    #[tokio::test]
    async fn test_read_request_across_reads() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            for piece in ["GET / HTTP/1.0\r\nIcy-Me", "taData: 1\r", "\n\r", "\n"] {
                client.write_all(piece.as_bytes()).await.unwrap();
                tokio::task::yield_now().await;
            }
            client
        });

        let request = read_request(&mut server, DEFAULT_MAX_HEADER_BYTES)
            .await
            .unwrap();
        assert!(request.wants_metadata);
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_read_request_limits() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        {
            use tokio::io::AsyncWriteExt;
            client.write_all(&[b'a'; 200]).await.unwrap();
        }
        assert!(matches!(
            read_request(&mut server, 100).await,
            Err(RelayError::HeaderTooLarge { limit: 100 })
        ));

        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        assert!(matches!(
            read_request(&mut server, 100).await,
            Err(RelayError::ClientClosed)
        ));
    }
}
