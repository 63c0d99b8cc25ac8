//! HTTP request detection and Host/Authorization scanning.

use super::ContentFilter;
use crate::{HeaderLenMode, MAX_HEADER_LENGTH, MAX_SCAN_BYTES};

pub const HOST_HEADER: &[u8] = b"Host: ";
pub const AUTH_HEADER: &[u8] = b"Authorization: ";
pub const CLOUD_API_HOST: &[u8] = b"amazonaws.com";

const HTTP_METHODS: [&[u8]; 7] = [
    b"GET", b"POST", b"PUT", b"DELETE", b"HEAD", b"OPTIONS", b"PATCH",
];

/// Scratch space the header scanner fills in. Lives in a per-CPU map on the
/// kernel side, so it is reset before every scan rather than reallocated.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RequestHeaders {
    pub host_len: u32,
    pub auth_len: u32,
    pub line_start: u32,
    pub host: [u8; MAX_HEADER_LENGTH],
    pub auth: [u8; MAX_HEADER_LENGTH],
}

impl RequestHeaders {
    pub const fn zeroed() -> Self {
        RequestHeaders {
            host_len: 0,
            auth_len: 0,
            line_start: 0,
            host: [0; MAX_HEADER_LENGTH],
            auth: [0; MAX_HEADER_LENGTH],
        }
    }

    pub fn reset(&mut self) {
        self.host_len = 0;
        self.auth_len = 0;
        self.line_start = 0;
    }

    /// The recorded Host line, including the `Host: ` prefix.
    pub fn host(&self) -> &[u8] {
        let len = (self.host_len as usize).min(MAX_HEADER_LENGTH);
        &self.host[..len]
    }

    pub fn authorization(&self) -> &[u8] {
        let len = (self.auth_len as usize).min(MAX_HEADER_LENGTH);
        &self.auth[..len]
    }
}

#[inline(always)]
fn starts_with(data: &[u8], prefix: &[u8]) -> bool {
    if data.len() < prefix.len() {
        return false;
    }
    let mut i = 0;
    while i < prefix.len() {
        if data[i] != prefix[i] {
            return false;
        }
        i += 1;
    }
    true
}

/// True when `data` opens with a known method followed by a space.
pub fn is_http_request(data: &[u8]) -> bool {
    if data.len() < 4 {
        return false;
    }
    for method in HTTP_METHODS {
        if data.len() > method.len() && starts_with(data, method) && data[method.len()] == b' ' {
            return true;
        }
    }
    false
}

/// Bounded length of the line `[line_start, index)`.
///
/// `Masked` keeps the low bits only, so a 260-byte line is treated as a
/// 4-byte one; `Clamped` truncates to `MAX_HEADER_LENGTH`.
#[inline(always)]
pub fn line_length(index: u32, line_start: u32, mode: HeaderLenMode) -> usize {
    let raw = index.wrapping_sub(line_start) as usize;
    match mode {
        HeaderLenMode::Masked => raw & MAX_HEADER_LENGTH,
        HeaderLenMode::Clamped => raw.min(MAX_HEADER_LENGTH),
    }
}

/// Walks `data` line by line, recording the last Host and Authorization
/// lines seen. Lines are terminated by `\n`; a trailing line without one is
/// ignored. At most `MAX_SCAN_BYTES` bytes are examined.
pub fn parse_headers(data: &[u8], req: &mut RequestHeaders, mode: HeaderLenMode) {
    let end = data.len().min(MAX_SCAN_BYTES);
    let mut index = 0usize;
    while index < end {
        if data[index] == b'\n' {
            let start = req.line_start as usize;
            let len = line_length(index as u32, req.line_start, mode);
            if start + len <= data.len() {
                let line = &data[start..start + len];
                if len >= HOST_HEADER.len() && starts_with(line, HOST_HEADER) {
                    req.host[..len].copy_from_slice(line);
                    req.host_len = len as u32;
                } else if len >= AUTH_HEADER.len() && starts_with(line, AUTH_HEADER) {
                    req.auth[..len].copy_from_slice(line);
                    req.auth_len = len as u32;
                }
            }
            if index + 1 < data.len() {
                req.line_start = (index + 1) as u32;
            }
        }
        index += 1;
    }
}

/// True when the recorded Host line contains `amazonaws.com`.
pub fn is_cloud_api_call(req: &RequestHeaders) -> bool {
    let host = req.host();
    if host.len() < CLOUD_API_HOST.len() {
        return false;
    }
    let mut i = 0;
    while i + CLOUD_API_HOST.len() <= host.len() {
        if starts_with(&host[i..], CLOUD_API_HOST) {
            return true;
        }
        i += 1;
    }
    false
}

/// Forwards HTTP requests whose Host header names a cloud API endpoint.
pub struct HttpCloudHostFilter<'a> {
    headers: &'a mut RequestHeaders,
    mode: HeaderLenMode,
}

impl<'a> HttpCloudHostFilter<'a> {
    pub fn new(headers: &'a mut RequestHeaders, mode: HeaderLenMode) -> Self {
        Self { headers, mode }
    }
}

impl ContentFilter for HttpCloudHostFilter<'_> {
    fn should_forward(&mut self, fragment: &[u8]) -> bool {
        if !is_http_request(fragment) {
            return false;
        }
        self.headers.reset();
        parse_headers(fragment, self.headers, self.mode);
        is_cloud_api_call(self.headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(data: &[u8], mode: HeaderLenMode) -> RequestHeaders {
        let mut req = RequestHeaders::zeroed();
        parse_headers(data, &mut req, mode);
        req
    }

    fn forwards(data: &[u8], mode: HeaderLenMode) -> bool {
        let mut req = RequestHeaders::zeroed();
        HttpCloudHostFilter::new(&mut req, mode).should_forward(data)
    }

    /// `Host: s3.amazonaws.com` padded with `x` to `total` bytes.
    fn long_host_request(total: usize) -> Vec<u8> {
        let mut line = b"Host: s3.amazonaws.com".to_vec();
        line.resize(total, b'x');
        let mut req = b"GET / HTTP/1.1\n".to_vec();
        req.extend_from_slice(&line);
        req.extend_from_slice(b"\n\n");
        req
    }

    #[test]
    fn test_recognizes_methods() {
        for data in [&b"GET / HTTP/1.1"[..], b"POST /x", b"PUT /", b"DELETE /a", b"HEAD /", b"OPTIONS *", b"PATCH /p"] {
            assert!(is_http_request(data), "{:?}", data);
        }
    }

    #[test]
    fn test_rejects_non_requests() {
        assert!(!is_http_request(b"GET"));
        assert!(!is_http_request(b"GETX / HTTP/1.1"));
        assert!(!is_http_request(b"HTTP/1.1 200 OK"));
        assert!(!is_http_request(b"get / HTTP/1.1"));
        assert!(!is_http_request(b""));
    }

    #[test]
    fn test_extracts_host_and_authorization() {
        let req = scan(
            b"GET / HTTP/1.1\r\nHost: s3.amazonaws.com\r\nAuthorization: AWS4 abc\r\n\r\n",
            HeaderLenMode::Masked,
        );
        assert_eq!(req.host(), b"Host: s3.amazonaws.com\r");
        assert_eq!(req.authorization(), b"Authorization: AWS4 abc\r");
    }

    #[test]
    fn test_last_line_without_newline_is_ignored() {
        let req = scan(b"GET / HTTP/1.1\nHost: s3.amazonaws.com", HeaderLenMode::Masked);
        assert_eq!(req.host_len, 0);
    }

    #[test]
    fn test_header_prefix_is_case_sensitive() {
        let req = scan(b"GET / HTTP/1.1\nhost: s3.amazonaws.com\n", HeaderLenMode::Masked);
        assert_eq!(req.host_len, 0);
    }

    #[test]
    fn test_line_length_modes() {
        assert_eq!(line_length(100, 0, HeaderLenMode::Masked), 100);
        assert_eq!(line_length(100, 0, HeaderLenMode::Clamped), 100);
        assert_eq!(line_length(260, 0, HeaderLenMode::Masked), 4);
        assert_eq!(line_length(260, 0, HeaderLenMode::Clamped), MAX_HEADER_LENGTH);
        assert_eq!(line_length(256, 1, HeaderLenMode::Masked), 255);
    }

    #[test]
    fn test_forwards_cloud_host() {
        assert!(forwards(b"GET / HTTP/1.1\r\nHost: s3.amazonaws.com\r\n\r\n", HeaderLenMode::Masked));
        assert!(forwards(b"POST /q HTTP/1.1\nHost: sqs.us-east-1.amazonaws.com\n\n", HeaderLenMode::Clamped));
    }

    #[test]
    fn test_drops_other_hosts_and_non_http() {
        assert!(!forwards(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n", HeaderLenMode::Masked));
        assert!(!forwards(b"HTTP/1.1 200 OK\r\nHost: s3.amazonaws.com\r\n\r\n", HeaderLenMode::Masked));
        assert!(!forwards(b"GET / HTTP/1.1\r\n\r\n", HeaderLenMode::Masked));
    }

    #[test]
    fn test_cloud_host_must_appear_in_host_line() {
        assert!(!forwards(
            b"GET /amazonaws.com HTTP/1.1\r\nHost: example.com\r\n\r\n",
            HeaderLenMode::Masked
        ));
    }

    #[test]
    fn test_masked_long_host_line_wraps_and_misses() {
        // 260 & 255 == 4, shorter than the Host prefix
        let data = long_host_request(260);
        assert!(!forwards(&data, HeaderLenMode::Masked));
        assert_eq!(scan(&data, HeaderLenMode::Masked).host_len, 0);
    }

    #[test]
    fn test_clamped_long_host_line_keeps_prefix() {
        let data = long_host_request(260);
        assert!(forwards(&data, HeaderLenMode::Clamped));
        assert_eq!(scan(&data, HeaderLenMode::Clamped).host_len as usize, MAX_HEADER_LENGTH);
    }

    #[test]
    fn test_scan_stops_at_limit() {
        let mut data = b"GET / HTTP/1.1\n".to_vec();
        data.resize(MAX_SCAN_BYTES, b'a');
        data.extend_from_slice(b"\nHost: s3.amazonaws.com\n");
        assert!(!forwards(&data, HeaderLenMode::Clamped));
    }

    #[test]
    fn test_reset_clears_previous_scan() {
        let mut req = RequestHeaders::zeroed();
        assert!(HttpCloudHostFilter::new(&mut req, HeaderLenMode::Masked)
            .should_forward(b"GET / HTTP/1.1\nHost: s3.amazonaws.com\n"));
        assert!(!HttpCloudHostFilter::new(&mut req, HeaderLenMode::Masked)
            .should_forward(b"GET / HTTP/1.1\nHost: example.com\n"));
    }
}
