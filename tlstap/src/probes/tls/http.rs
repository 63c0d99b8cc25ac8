//! Best-effort HTTP/1.x summaries of captured plaintext.

use serde::Serialize;

const MAX_HEADERS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HttpSummary {
    Request {
        method: String,
        path: String,
        host: Option<String>,
        has_authorization: bool,
    },
    Response {
        status: u16,
        reason: Option<String>,
    },
}

/// Parses the start of `data` as an HTTP request or response. Headers are
/// only reported once the header block is complete.
pub fn summarize(data: &[u8]) -> Option<HttpSummary> {
    summarize_request(data).or_else(|| summarize_response(data))
}

fn summarize_request(data: &[u8]) -> Option<HttpSummary> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let status = req.parse(data).ok()?;

    let method = req.method?.to_string();
    let path = req.path?.to_string();

    let mut host = None;
    let mut has_authorization = false;
    if status.is_complete() {
        for header in req.headers.iter() {
            if header.name.eq_ignore_ascii_case("host") {
                host = Some(String::from_utf8_lossy(header.value).to_string());
            } else if header.name.eq_ignore_ascii_case("authorization") {
                has_authorization = true;
            }
        }
    }

    Some(HttpSummary::Request {
        method,
        path,
        host,
        has_authorization,
    })
}

fn summarize_response(data: &[u8]) -> Option<HttpSummary> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);
    resp.parse(data).ok()?;

    Some(HttpSummary::Response {
        status: resp.code?,
        reason: resp.reason.map(str::to_string),
    })
}

impl std::fmt::Display for HttpSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpSummary::Request {
                method,
                path,
                host,
                has_authorization,
            } => {
                write!(f, "{} {}", method, path)?;
                if let Some(host) = host {
                    write!(f, " host={}", host)?;
                }
                if *has_authorization {
                    write!(f, " auth=present")?;
                }
                Ok(())
            }
            HttpSummary::Response { status, reason } => match reason {
                Some(reason) => write!(f, "HTTP {} {}", status, reason),
                None => write!(f, "HTTP {}", status),
            },
        }
    }
}
