pub mod mem;
pub mod sigv4;

use bytes::Bytes;
use http::{Method, StatusCode};
use thiserror::Error;

// Every request carries the API version header
pub const GLACIER_VERSION: &str = "2012-06-01";

pub const H_GLACIER_VERSION: &str = "x-amz-glacier-version";
pub const H_PART_SIZE: &str = "x-amz-part-size";
pub const H_ARCHIVE_DESCRIPTION: &str = "x-amz-archive-description";
pub const H_UPLOAD_ID: &str = "x-amz-multipart-upload-id";
pub const H_TREE_HASH: &str = "x-amz-sha256-tree-hash";
pub const H_CONTENT_SHA256: &str = "x-amz-content-sha256";
pub const H_ARCHIVE_SIZE: &str = "x-amz-archive-size";
pub const H_ARCHIVE_ID: &str = "x-amz-archive-id";
pub const H_LOCATION: &str = "location";
pub const H_CONTENT_RANGE: &str = "content-range";
pub const H_CONTENT_LENGTH: &str = "content-length";
pub const H_CONTENT_TYPE: &str = "content-type";

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Request {
            method,
            path: path.into(),
            headers: vec![(H_GLACIER_VERSION.to_string(), GLACIER_VERSION.to_string())],
            body: Bytes::new(),
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Response {
            status,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

// Performs one signed HTTP exchange. Implementations are borrowed by
// sessions, never owned, and must be reentrant; all session state lives on
// the session side.
pub trait Executor {
    fn execute(&self, request: Request) -> Result<Response, TransportError>;
}

pub fn format_content_range(first: u64, last: u64) -> String {
    format!("bytes {}-{}/*", first, last)
}

pub fn parse_content_range(value: &str) -> Option<(u64, u64)> {
    let range = value.strip_prefix("bytes ")?.strip_suffix("/*")?;
    let (first, last) = range.split_once('-')?;
    Some((first.parse().ok()?, last.parse().ok()?))
}

#[cfg(test)]
mod test_wire {
    use super::*;

    #[test]
    fn content_range_round_trip() {
        let header = format_content_range(0, 1048575);
        assert_eq!(header, "bytes 0-1048575/*");
        assert_eq!(parse_content_range(&header), Some((0, 1048575)));
    }

    #[test]
    fn content_range_rejects_garbage() {
        assert_eq!(parse_content_range("bytes 0-10"), None);
        assert_eq!(parse_content_range("0-10/*"), None);
        assert_eq!(parse_content_range("bytes ten-20/*"), None);
    }

    #[test]
    fn every_request_carries_the_version_header() {
        let req = Request::new(Method::GET, "/");
        assert_eq!(req.get_header(H_GLACIER_VERSION), Some(GLACIER_VERSION));
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let resp = Response::new(StatusCode::CREATED).with_header("X-Amz-Archive-Id", "abc");
        assert_eq!(resp.get_header(H_ARCHIVE_ID), Some("abc"));
    }
}
