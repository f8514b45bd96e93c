//! Multipart image upload to the backend.

use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

/// Multipart boundary used for every upload.
pub const BOUNDARY: &str = "----CamNodeBoundary";

/// Size of each body chunk handed to the connection.
pub const CHUNK_SIZE: usize = 4096;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(15);

/// Upload failures. The messages are the result infos reported to the
/// operator.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("invalid upload URL")]
    InvalidUrl(String),

    #[error("connection failed")]
    ConnectionFailed(#[source] reqwest::Error),

    #[error("send failed")]
    SendFailed(#[source] reqwest::Error),

    #[error("response timeout")]
    ResponseTimeout,

    #[error("upload failed (HTTP {0})")]
    Rejected(u16),

    #[error("HTTP client setup failed: {0}")]
    Client(#[source] reqwest::Error),
}

impl UploadError {
    /// Metric label.
    pub fn outcome(&self) -> &'static str {
        match self {
            UploadError::InvalidUrl(_) => "invalid_url",
            UploadError::ConnectionFailed(_) => "connection_failed",
            UploadError::SendFailed(_) => "send_failed",
            UploadError::ResponseTimeout => "timeout",
            UploadError::Rejected(_) => "rejected",
            UploadError::Client(_) => "client_error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// A parsed upload URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl UploadTarget {
    /// Parse `[scheme://]host[:port][/path]`. The scheme defaults to `http`
    /// and the path to `/`.
    pub fn parse(url: &str) -> Result<Self, UploadError> {
        let invalid = || UploadError::InvalidUrl(url.to_string());
        let url = url.trim();

        let (scheme, rest) = match url.split_once("://") {
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("http") => (Scheme::Http, rest),
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("https") => (Scheme::Https, rest),
            Some(_) => return Err(invalid()),
            None => (Scheme::Http, url),
        };

        let (authority, path) = match rest.find(['/', '?']) {
            Some(i) if rest[i..].starts_with('?') => (&rest[..i], format!("/{}", &rest[i..])),
            Some(i) => (&rest[..i], rest[i..].to_string()),
            None => (rest, "/".to_string()),
        };

        let (host, port) = split_host_port(authority).ok_or_else(invalid)?;
        if host.is_empty() || host.contains(['@', ' ']) {
            return Err(invalid());
        }

        let port = match port {
            Some(port) => match port.parse::<u16>() {
                Ok(port) if port != 0 => port,
                _ => return Err(invalid()),
            },
            None => scheme.default_port(),
        };

        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
            path,
        })
    }

    /// Absolute URL for the HTTP client.
    pub fn url(&self) -> String {
        format!(
            "{}://{}:{}{}",
            self.scheme.as_str(),
            self.host,
            self.port,
            self.path
        )
    }
}

fn split_host_port(authority: &str) -> Option<(&str, Option<&str>)> {
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        let port = match after {
            "" => None,
            _ => Some(after.strip_prefix(':')?),
        };
        // Keep the brackets so the host can be put back into a URL.
        let bracketed = &authority[..host.len() + 2];
        return Some((bracketed, port));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) => Some((host, Some(port))),
        None => Some((authority, None)),
    }
}

/// A `multipart/form-data` body with a `fileName` field and a `file` part.
#[derive(Debug, Clone)]
pub struct MultipartImage {
    preamble: Bytes,
    image: Bytes,
    epilogue: Bytes,
}

impl MultipartImage {
    pub fn new(file_name: &str, jpeg: Bytes) -> Self {
        let preamble = format!(
            "--{BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"fileName\"\r\n\r\n\
             {file_name}\r\n\
             --{BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\n\
             Content-Type: image/jpeg\r\n\r\n"
        );
        let epilogue = format!("\r\n--{BOUNDARY}--\r\n");

        Self {
            preamble: Bytes::from(preamble),
            image: jpeg,
            epilogue: Bytes::from(epilogue),
        }
    }

    pub fn content_type() -> String {
        format!("multipart/form-data; boundary={BOUNDARY}")
    }

    /// Exact body length, known before anything is sent.
    pub fn content_length(&self) -> usize {
        self.preamble.len() + self.image.len() + self.epilogue.len()
    }

    /// Body chunks in order; the image is split into [`CHUNK_SIZE`] slices
    /// without copying.
    pub fn chunks(&self) -> Vec<Bytes> {
        let mut chunks = Vec::with_capacity(2 + self.image.len().div_ceil(CHUNK_SIZE));
        chunks.push(self.preamble.clone());
        let mut offset = 0;
        while offset < self.image.len() {
            let end = (offset + CHUNK_SIZE).min(self.image.len());
            chunks.push(self.image.slice(offset..end));
            offset = end;
        }
        chunks.push(self.epilogue.clone());
        chunks
    }
}

/// Upload client settings.
#[derive(Debug, Clone, Copy)]
pub struct UploadSettings {
    pub connect_timeout: Duration,
    /// Bound on sending the body and receiving the status line.
    pub response_timeout: Duration,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }
}

/// Single-attempt image uploader.
#[derive(Clone)]
pub struct Uploader {
    client: reqwest::Client,
    settings: UploadSettings,
}

impl Uploader {
    pub fn new(settings: UploadSettings) -> Result<Self, UploadError> {
        let client = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout)
            .pool_max_idle_per_host(0)
            .build()
            .map_err(UploadError::Client)?;
        Ok(Self { client, settings })
    }

    /// Upload one JPEG. Returns the HTTP status on a 2xx answer.
    pub async fn upload(
        &self,
        target: &UploadTarget,
        file_name: &str,
        jpeg: Bytes,
    ) -> Result<u16, UploadError> {
        let body = MultipartImage::new(file_name, jpeg);
        let content_length = body.content_length();
        let chunks = body.chunks();
        let stream = futures_util::stream::iter(chunks.into_iter().map(Ok::<_, std::io::Error>));

        let request = self
            .client
            .post(target.url())
            .header(http::header::CONTENT_TYPE, MultipartImage::content_type())
            .header(http::header::CONTENT_LENGTH, content_length)
            .body(reqwest::Body::wrap_stream(stream));

        tracing::debug!(
            url = %target.url(),
            file_name = %file_name,
            content_length,
            "Uploading image"
        );

        let response = match tokio::time::timeout(self.settings.response_timeout, request.send())
            .await
        {
            Err(_) => return Err(UploadError::ResponseTimeout),
            Ok(Err(e)) if e.is_connect() => return Err(UploadError::ConnectionFailed(e)),
            Ok(Err(e)) if e.is_timeout() => return Err(UploadError::ResponseTimeout),
            Ok(Err(e)) => return Err(UploadError::SendFailed(e)),
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        if status.is_success() {
            Ok(status.as_u16())
        } else {
            Err(UploadError::Rejected(status.as_u16()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_url() {
        let target = UploadTarget::parse("https://files.example.com:8443/api/upload").unwrap();
        assert_eq!(target.scheme, Scheme::Https);
        assert_eq!(target.host, "files.example.com");
        assert_eq!(target.port, 8443);
        assert_eq!(target.path, "/api/upload");
    }

    #[test]
    fn parse_applies_defaults() {
        let target = UploadTarget::parse("192.168.1.20").unwrap();
        assert_eq!(target.scheme, Scheme::Http);
        assert_eq!(target.port, 80);
        assert_eq!(target.path, "/");

        let target = UploadTarget::parse("https://backend/upload").unwrap();
        assert_eq!(target.port, 443);
        assert_eq!(target.url(), "https://backend:443/upload");
    }

    #[test]
    fn parse_keeps_query() {
        let target = UploadTarget::parse("http://h:8080/up?cam=1").unwrap();
        assert_eq!(target.path, "/up?cam=1");
        let target = UploadTarget::parse("http://h?cam=1").unwrap();
        assert_eq!(target.path, "/?cam=1");
    }

    #[test]
    fn parse_ipv6_host() {
        let target = UploadTarget::parse("http://[::1]:9000/u").unwrap();
        assert_eq!(target.host, "[::1]");
        assert_eq!(target.port, 9000);
    }

    #[test]
    fn parse_rejects_garbage() {
        for url in ["", "ftp://host/x", "http://", "http://host:0/", "http://host:99999/", "http://host:abc/"] {
            assert!(
                matches!(UploadTarget::parse(url), Err(UploadError::InvalidUrl(_))),
                "accepted {url:?}"
            );
        }
    }

    #[test]
    fn multipart_layout() {
        let body = MultipartImage::new("esp32cam_7.jpg", Bytes::from_static(b"JPEGDATA"));
        let joined: Vec<u8> = body.chunks().concat();
        let text = String::from_utf8(joined).unwrap();

        assert!(text.starts_with("------CamNodeBoundary\r\n"));
        assert!(text.contains("name=\"fileName\"\r\n\r\nesp32cam_7.jpg\r\n"));
        assert!(text.contains("filename=\"esp32cam_7.jpg\"\r\nContent-Type: image/jpeg\r\n\r\nJPEGDATA"));
        assert!(text.ends_with("\r\n------CamNodeBoundary--\r\n"));
        assert_eq!(text.len(), body.content_length());
    }

    #[test]
    fn image_split_into_fixed_chunks() {
        let image = Bytes::from(vec![0u8; CHUNK_SIZE * 2 + 10]);
        let body = MultipartImage::new("a.jpg", image);
        let sizes: Vec<usize> = body.chunks().iter().map(Bytes::len).collect();

        assert_eq!(sizes.len(), 5);
        assert_eq!(&sizes[1..4], &[CHUNK_SIZE, CHUNK_SIZE, 10]);
    }

    #[test]
    fn error_messages_are_result_infos() {
        assert_eq!(UploadError::ResponseTimeout.to_string(), "response timeout");
        assert_eq!(UploadError::Rejected(500).to_string(), "upload failed (HTTP 500)");
        assert_eq!(
            UploadError::InvalidUrl("x".into()).to_string(),
            "invalid upload URL"
        );
    }
}
