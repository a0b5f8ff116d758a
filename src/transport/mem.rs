use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};

use bytes::{Bytes, BytesMut};
use http::{Method, StatusCode};

use crate::hash;
use crate::transport::{
    parse_content_range, Executor, Request, Response, TransportError, GLACIER_VERSION,
    H_ARCHIVE_DESCRIPTION, H_ARCHIVE_ID, H_ARCHIVE_SIZE, H_CONTENT_RANGE, H_CONTENT_SHA256,
    H_GLACIER_VERSION, H_LOCATION, H_PART_SIZE, H_TREE_HASH, H_UPLOAD_ID,
};

// In-memory stand-in for the Glacier service. It implements the four
// multipart routes against local state, checks the same things the real
// service checks (hashes, ranges, sizes), and keeps a request log so tests
// can count wire traffic. Scripted faults are consumed one per request.
pub struct MemGlacier {
    inner: RefCell<Inner>,
}

struct Inner {
    next_id: u64,
    uploads: HashMap<String, Upload>,
    archives: HashMap<String, Archive>,
    requests: Vec<(Method, String)>,
    faults: VecDeque<Fault>,
}

struct Upload {
    vault: String,
    part_size: u64,
    parts: Vec<StoredPart>,
}

struct StoredPart {
    first: u64,
    data: Bytes,
}

#[derive(Clone)]
pub struct Archive {
    pub vault: String,
    pub size: u64,
    pub tree_hash: String,
    pub data: Bytes,
}

pub enum Fault {
    Status(StatusCode),
    Disconnect,
}

impl MemGlacier {
    pub fn new() -> Self {
        MemGlacier {
            inner: RefCell::new(Inner {
                next_id: 0,
                uploads: HashMap::new(),
                archives: HashMap::new(),
                requests: Vec::new(),
                faults: VecDeque::new(),
            }),
        }
    }

    // The next request is answered with this status instead of being routed
    pub fn push_failure(&self, status: StatusCode) {
        self.inner.borrow_mut().faults.push_back(Fault::Status(status));
    }

    // The next request fails at the transport level
    pub fn push_disconnect(&self) {
        self.inner.borrow_mut().faults.push_back(Fault::Disconnect);
    }

    pub fn requests(&self) -> Vec<(Method, String)> {
        self.inner.borrow().requests.clone()
    }

    pub fn request_count(&self, method: &Method, path: &str) -> usize {
        self.inner
            .borrow()
            .requests
            .iter()
            .filter(|(m, p)| m == method && p == path)
            .count()
    }

    pub fn archive(&self, archive_id: &str) -> Option<Archive> {
        self.inner.borrow().archives.get(archive_id).cloned()
    }

    pub fn upload_exists(&self, upload_id: &str) -> bool {
        self.inner.borrow().uploads.contains_key(upload_id)
    }
}

impl Executor for MemGlacier {
    fn execute(&self, request: Request) -> Result<Response, TransportError> {
        let mut inner = self.inner.borrow_mut();
        inner
            .requests
            .push((request.method.clone(), request.path.clone()));

        match inner.faults.pop_front() {
            Some(Fault::Status(status)) => return Ok(Response::new(status)),
            Some(Fault::Disconnect) => {
                return Err(TransportError::Connection("scripted disconnect".to_string()))
            }
            None => (),
        }

        if request.get_header(H_GLACIER_VERSION) != Some(GLACIER_VERSION) {
            return Ok(bad_request("missing or wrong x-amz-glacier-version"));
        }

        let segments: Vec<&str> = request.path.trim_start_matches('/').split('/').collect();
        match (&request.method, &segments[..]) {
            (&Method::POST, ["-", "vaults", vault, "multipart-uploads"]) => {
                Ok(inner.initiate(vault, &request))
            }
            (&Method::PUT, ["-", "vaults", _, "multipart-uploads", upload_id]) => {
                Ok(inner.upload_part(upload_id, &request))
            }
            (&Method::POST, ["-", "vaults", _, "multipart-uploads", upload_id]) => {
                Ok(inner.complete(upload_id, &request))
            }
            (&Method::DELETE, ["-", "vaults", _, "multipart-uploads", upload_id]) => {
                Ok(inner.abort(upload_id))
            }
            _ => Ok(Response::new(StatusCode::NOT_FOUND)),
        }
    }
}

fn bad_request(message: &str) -> Response {
    let mut resp = Response::new(StatusCode::BAD_REQUEST);
    resp.body = Bytes::copy_from_slice(message.as_bytes());
    resp
}

impl Inner {
    fn fresh_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{:04}", prefix, self.next_id)
    }

    fn initiate(&mut self, vault: &str, request: &Request) -> Response {
        let part_size: u64 = match request.get_header(H_PART_SIZE).and_then(|v| v.parse().ok()) {
            Some(n) => n,
            None => return bad_request("missing x-amz-part-size"),
        };
        if !part_size.is_power_of_two() || part_size < (1 << 20) || part_size > (4 << 30) {
            return bad_request("part size out of range");
        }
        if let Some(desc) = request.get_header(H_ARCHIVE_DESCRIPTION) {
            if desc.len() > 1024 {
                return bad_request("description too long");
            }
        }

        let upload_id = self.fresh_id("upload");
        self.uploads.insert(
            upload_id.clone(),
            Upload {
                vault: vault.to_string(),
                part_size,
                parts: Vec::new(),
            },
        );

        Response::new(StatusCode::CREATED)
            .with_header(H_UPLOAD_ID, upload_id.clone())
            .with_header(
                H_LOCATION,
                format!("/-/vaults/{}/multipart-uploads/{}", vault, upload_id),
            )
    }

    fn upload_part(&mut self, upload_id: &str, request: &Request) -> Response {
        let upload = match self.uploads.get_mut(upload_id) {
            Some(u) => u,
            None => return Response::new(StatusCode::NOT_FOUND),
        };

        let (first, last) = match request
            .get_header(H_CONTENT_RANGE)
            .and_then(parse_content_range)
        {
            Some(range) => range,
            None => return bad_request("missing or malformed content-range"),
        };

        let len = request.body.len() as u64;
        if len == 0 || last < first || last - first + 1 != len {
            return bad_request("content-range does not match body length");
        }
        if len > upload.part_size {
            return bad_request("part exceeds the agreed part size");
        }

        let flat = hash::to_hex(&hash::sha256(&request.body));
        if request.get_header(H_CONTENT_SHA256) != Some(flat.as_str()) {
            return bad_request("x-amz-content-sha256 mismatch");
        }
        // unwrap: len > 0 was checked above
        let root = hash::to_hex(&hash::part_root(&request.body).unwrap());
        if request.get_header(H_TREE_HASH) != Some(root.as_str()) {
            return bad_request("x-amz-sha256-tree-hash mismatch");
        }

        // Re-uploading a range replaces the previous body for that range
        upload.parts.retain(|p| p.first != first);
        upload.parts.push(StoredPart {
            first,
            data: request.body.clone(),
        });

        Response::new(StatusCode::NO_CONTENT)
    }

    fn complete(&mut self, upload_id: &str, request: &Request) -> Response {
        let upload = match self.uploads.get(upload_id) {
            Some(u) => u,
            None => return Response::new(StatusCode::NOT_FOUND),
        };

        let claimed_size: u64 = match request
            .get_header(H_ARCHIVE_SIZE)
            .and_then(|v| v.parse().ok())
        {
            Some(n) => n,
            None => return bad_request("missing x-amz-archive-size"),
        };
        let claimed_root = match request.get_header(H_TREE_HASH) {
            Some(h) => h.to_string(),
            None => return bad_request("missing x-amz-sha256-tree-hash"),
        };

        let mut parts: Vec<&StoredPart> = upload.parts.iter().collect();
        parts.sort_by_key(|p| p.first);

        let mut assembled = BytesMut::new();
        for part in &parts {
            if part.first != assembled.len() as u64 {
                return bad_request("uploaded ranges are not contiguous");
            }
            assembled.extend_from_slice(&part.data);
        }
        let assembled = assembled.freeze();

        if assembled.is_empty() {
            return bad_request("no parts uploaded");
        }
        if assembled.len() as u64 != claimed_size {
            return bad_request("x-amz-archive-size mismatch");
        }

        // Parts are whole multiples of 1MiB (except the tail), so the root
        // over the assembled stream must equal the root over part roots the
        // client computed
        // unwrap: assembled is non-empty
        let actual_root = hash::to_hex(&hash::part_root(&assembled).unwrap());
        if actual_root != claimed_root {
            return bad_request("x-amz-sha256-tree-hash mismatch");
        }

        let vault = upload.vault.clone();
        let archive_id = self.fresh_id("archive");
        self.archives.insert(
            archive_id.clone(),
            Archive {
                vault: vault.clone(),
                size: claimed_size,
                tree_hash: claimed_root,
                data: assembled,
            },
        );
        self.uploads.remove(upload_id);

        Response::new(StatusCode::CREATED)
            .with_header(H_ARCHIVE_ID, archive_id.clone())
            .with_header(
                H_LOCATION,
                format!("/-/vaults/{}/archives/{}", vault, archive_id),
            )
    }

    fn abort(&mut self, upload_id: &str) -> Response {
        match self.uploads.remove(upload_id) {
            Some(_) => Response::new(StatusCode::NO_CONTENT),
            None => Response::new(StatusCode::NOT_FOUND),
        }
    }
}
