use std::thread::sleep;
use std::time::Duration;

use bytes::Bytes;
use http::{Method, StatusCode};
use log::{debug, info, warn};
use thiserror::Error;

use crate::hash::{self, Hash};
use crate::transport::{
    format_content_range, Executor, Request, Response, TransportError, H_ARCHIVE_DESCRIPTION,
    H_ARCHIVE_ID, H_ARCHIVE_SIZE, H_CONTENT_LENGTH, H_CONTENT_RANGE, H_CONTENT_SHA256,
    H_CONTENT_TYPE, H_LOCATION, H_PART_SIZE, H_TREE_HASH, H_UPLOAD_ID,
};

pub const MIN_PART_SIZE: u64 = 1 << 20;
pub const MAX_PART_SIZE: u64 = 4 << 30;
pub const DEFAULT_PART_SIZE: u64 = 128 << 20;
pub const MAX_PARTS: usize = 10_000;

// Per-part and whole-session retry allowances; the session allowance grows
// by two per GiB confirmed uploaded
pub const BLOCK_RETRIES: u32 = 10;
pub const TOTAL_RETRIES: u32 = 100;
pub const SLEEP_TIME: Duration = Duration::from_secs(300);

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("session is closed")]
    AlreadyClosed,
    #[error("transient upload failure: {0}")]
    TransientUpload(String),
    #[error("permanent upload failure: {0}")]
    PermanentUpload(String),
    #[error("archive rejected by the service: {0}")]
    HashMismatch(String),
    #[error("archive contains no data")]
    EmptyArchive,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl UploadError {
    fn retriable(&self) -> bool {
        matches!(
            self,
            UploadError::TransientUpload(_) | UploadError::Transport(_)
        )
    }
}

// One confirmed part: where its bytes sit in the archive and the tree-hash
// root the service accepted for them
#[derive(Debug, Clone)]
pub struct PartRecord {
    pub index: usize,
    pub offset: u64,
    pub len: u64,
    pub root: Hash,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub block_retries: u32,
    pub total_retries: u32,
    pub sleep_time: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            block_retries: BLOCK_RETRIES,
            total_retries: TOTAL_RETRIES,
            sleep_time: SLEEP_TIME,
        }
    }
}

enum State {
    Open,
    Completed,
    Aborted,
}

pub struct MultipartSession<'a, E: Executor> {
    executor: &'a E,
    vault: String,
    upload_id: String,
    part_size: u64,
    parts: Vec<PartRecord>,
    uploaded: u64,
    retries_spent: u32,
    retry: RetryPolicy,
    state: State,
}

impl<'a, E: Executor> MultipartSession<'a, E> {
    // A failed initiate never produces a session, so there is nothing to
    // poison; the caller simply holds an error
    pub fn initiate(
        executor: &'a E,
        vault: &str,
        part_size: u64,
        description: Option<&str>,
    ) -> Result<Self, UploadError> {
        validate_vault_name(vault)?;
        validate_part_size(part_size)?;
        if let Some(desc) = description {
            validate_description(desc)?;
        }

        let mut request = Request::new(
            Method::POST,
            format!("/-/vaults/{}/multipart-uploads", vault),
        )
        .header(H_PART_SIZE, part_size.to_string());
        if let Some(desc) = description.filter(|d| !d.is_empty()) {
            request = request.header(H_ARCHIVE_DESCRIPTION, desc);
        }

        let response = executor.execute(request)?;
        if response.status != StatusCode::CREATED {
            return Err(UploadError::PermanentUpload(format!(
                "initiate rejected: {}",
                body_message(&response)
            )));
        }
        let upload_id = match response.get_header(H_UPLOAD_ID) {
            Some(id) => id.to_string(),
            None => {
                return Err(UploadError::PermanentUpload(
                    "initiate response carried no upload id".to_string(),
                ))
            }
        };

        info!(
            "initiated upload {} (vault {}, part size {})",
            upload_id, vault, part_size
        );
        Ok(MultipartSession {
            executor,
            vault: vault.to_string(),
            upload_id,
            part_size,
            parts: Vec::new(),
            uploaded: 0,
            retries_spent: 0,
            retry: RetryPolicy::default(),
            state: State::Open,
        })
    }

    // Rebuild an Open session around an upload id issued earlier. The part
    // records come from an external store; listing parts from the service is
    // the caller's job.
    pub fn resume(
        executor: &'a E,
        vault: &str,
        part_size: u64,
        upload_id: &str,
        parts: Vec<PartRecord>,
    ) -> Result<Self, UploadError> {
        validate_vault_name(vault)?;
        validate_part_size(part_size)?;
        if upload_id.is_empty() {
            return Err(UploadError::InvalidArgument("empty upload id".to_string()));
        }
        if parts.len() > MAX_PARTS {
            return Err(UploadError::InvalidArgument(format!(
                "{} parts exceeds the {} part limit",
                parts.len(),
                MAX_PARTS
            )));
        }

        let mut offset = 0u64;
        for (i, record) in parts.iter().enumerate() {
            if record.index != i || record.offset != offset {
                return Err(UploadError::InvalidArgument(format!(
                    "part records are not contiguous at index {}",
                    i
                )));
            }
            if record.len == 0 || record.len > part_size {
                return Err(UploadError::InvalidArgument(format!(
                    "part {} length {} violates the part size {}",
                    i, record.len, part_size
                )));
            }
            if i + 1 < parts.len() && record.len != part_size {
                return Err(UploadError::InvalidArgument(format!(
                    "part {} is short but is not the final part",
                    i
                )));
            }
            offset += record.len;
        }

        info!(
            "resumed upload {} (vault {}, {} parts, {} bytes)",
            upload_id,
            vault,
            parts.len(),
            offset
        );
        Ok(MultipartSession {
            executor,
            vault: vault.to_string(),
            upload_id: upload_id.to_string(),
            part_size,
            parts,
            uploaded: offset,
            retries_spent: 0,
            retry: RetryPolicy::default(),
            state: State::Open,
        })
    }

    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    pub fn vault(&self) -> &str {
        &self.vault
    }

    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    pub fn parts(&self) -> &[PartRecord] {
        &self.parts
    }

    pub fn uploaded_bytes(&self) -> u64 {
        self.uploaded
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, State::Open)
    }

    pub fn set_retry_policy(&mut self, retry: RetryPolicy) {
        self.retry = retry;
    }

    pub fn upload_part(&mut self, data: Bytes) -> Result<(), UploadError> {
        self.ensure_open()?;

        let len = data.len() as u64;
        let Some(root) = hash::part_root(&data) else {
            return Err(UploadError::InvalidArgument(
                "part must not be empty".to_string(),
            ));
        };
        if len > self.part_size {
            return Err(UploadError::InvalidArgument(format!(
                "part of {} bytes exceeds the part size {}",
                len, self.part_size
            )));
        }
        if let Some(last) = self.parts.last() {
            if last.len != self.part_size {
                return Err(UploadError::InvalidArgument(
                    "a short part is final; no further parts may follow".to_string(),
                ));
            }
        }
        if self.parts.len() >= MAX_PARTS {
            return Err(UploadError::InvalidArgument(format!(
                "archive would exceed the {} part limit",
                MAX_PARTS
            )));
        }

        let index = self.parts.len();
        let first = self.uploaded;
        let last = first + len - 1;
        let flat = hash::sha256(&data);

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let request = Request::new(Method::PUT, self.upload_path())
                .header(H_CONTENT_RANGE, format_content_range(first, last))
                .header(H_CONTENT_LENGTH, len.to_string())
                .header(H_CONTENT_TYPE, "application/octet-stream")
                .header(H_TREE_HASH, hash::to_hex(&root))
                .header(H_CONTENT_SHA256, hash::to_hex(&flat))
                .body(data.clone());

            match self.send_part(request) {
                Ok(()) => break,
                Err(err) if err.retriable() => {
                    self.backoff(attempt, &format!("part {}", index), &err)?
                }
                Err(err) => {
                    self.state = State::Aborted;
                    return Err(err);
                }
            }
        }

        debug!(
            "part {} confirmed: bytes {}-{} ({} bytes)",
            index, first, last, len
        );
        self.parts.push(PartRecord {
            index,
            offset: first,
            len,
            root,
        });
        self.uploaded += len;
        Ok(())
    }

    pub fn complete(&mut self) -> Result<(String, String, String), UploadError> {
        self.ensure_open()?;

        let roots: Vec<Hash> = self.parts.iter().map(|p| p.root).collect();
        let root = match hash::tree_hash(&roots) {
            Some(root) => root,
            None => return Err(UploadError::EmptyArchive),
        };
        let root_hex = hash::to_hex(&root);
        let total = self.uploaded;

        let mut attempt = 0u32;
        let response = loop {
            attempt += 1;
            let request = Request::new(Method::POST, self.upload_path())
                .header(H_TREE_HASH, root_hex.clone())
                .header(H_ARCHIVE_SIZE, total.to_string());

            match self.send_complete(request) {
                Ok(response) => break response,
                Err(err) if err.retriable() => self.backoff(attempt, "complete", &err)?,
                Err(err) => {
                    self.state = State::Aborted;
                    return Err(err);
                }
            }
        };

        let archive_id = match response.get_header(H_ARCHIVE_ID) {
            Some(id) => id.to_string(),
            None => {
                self.state = State::Aborted;
                return Err(UploadError::PermanentUpload(
                    "complete response carried no archive id".to_string(),
                ));
            }
        };
        let location = response.get_header(H_LOCATION).unwrap_or_default().to_string();

        info!(
            "completed archive {} ({} bytes, {} parts, tree hash {})",
            archive_id,
            total,
            self.parts.len(),
            root_hex
        );
        self.state = State::Completed;
        Ok((archive_id, location, root_hex))
    }

    // Idempotent: a closed session stays closed, whichever way it closed
    pub fn abort(&mut self) -> Result<(), UploadError> {
        match self.state {
            State::Completed | State::Aborted => return Ok(()),
            State::Open => (),
        }
        self.state = State::Aborted;

        let request = Request::new(Method::DELETE, self.upload_path());
        let response = self.executor.execute(request)?;
        match response.status {
            // The service already forgot about it; that is what we wanted
            StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => {
                info!("aborted upload {}", self.upload_id);
                Ok(())
            }
            _ => Err(UploadError::PermanentUpload(format!(
                "abort rejected: {}",
                body_message(&response)
            ))),
        }
    }

    fn ensure_open(&self) -> Result<(), UploadError> {
        match self.state {
            State::Open => Ok(()),
            _ => Err(UploadError::AlreadyClosed),
        }
    }

    fn upload_path(&self) -> String {
        format!(
            "/-/vaults/{}/multipart-uploads/{}",
            self.vault, self.upload_id
        )
    }

    fn send_part(&self, request: Request) -> Result<(), UploadError> {
        let response = self.executor.execute(request)?;
        match response.status {
            StatusCode::NO_CONTENT => Ok(()),
            status if retriable_status(status) => Err(UploadError::TransientUpload(format!(
                "part upload returned {}",
                status
            ))),
            _ => Err(UploadError::PermanentUpload(format!(
                "part rejected: {}",
                body_message(&response)
            ))),
        }
    }

    fn send_complete(&self, request: Request) -> Result<Response, UploadError> {
        let response = self.executor.execute(request)?;
        match response.status {
            StatusCode::CREATED => Ok(response),
            status if retriable_status(status) => Err(UploadError::TransientUpload(format!(
                "complete returned {}",
                status
            ))),
            // Tree-hash and size complaints come back as 400
            StatusCode::BAD_REQUEST => Err(UploadError::HashMismatch(body_message(&response))),
            _ => Err(UploadError::PermanentUpload(format!(
                "complete rejected: {}",
                body_message(&response)
            ))),
        }
    }

    fn total_allowed(&self) -> u32 {
        self.retry.total_retries + 2 * self.uploaded.div_ceil(1 << 30) as u32
    }

    // Sleeps before the next attempt, or poisons the session when either the
    // per-part or the whole-session allowance is spent
    fn backoff(&mut self, attempt: u32, what: &str, err: &UploadError) -> Result<(), UploadError> {
        if attempt >= self.retry.block_retries || self.retries_spent >= self.total_allowed() {
            self.state = State::Aborted;
            return Err(UploadError::PermanentUpload(format!(
                "{} failed after {} attempts: {}",
                what, attempt, err
            )));
        }
        self.retries_spent += 1;

        let pause = self.retry.sleep_time * attempt;
        warn!(
            "{} attempt {} failed: {}; retrying in {:?}",
            what, attempt, err, pause
        );
        sleep(pause);
        Ok(())
    }
}

fn retriable_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT || status.is_server_error()
}

fn body_message(response: &Response) -> String {
    if response.body.is_empty() {
        format!("status {}", response.status)
    } else {
        format!(
            "status {}: {}",
            response.status,
            String::from_utf8_lossy(&response.body)
        )
    }
}

fn validate_vault_name(vault: &str) -> Result<(), UploadError> {
    if vault.is_empty() || vault.len() > 255 {
        return Err(UploadError::InvalidArgument(format!(
            "vault name must be 1..255 characters, got {}",
            vault.len()
        )));
    }
    if !vault
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-')
    {
        return Err(UploadError::InvalidArgument(format!(
            "vault name {:?} contains characters outside [A-Za-z0-9._-]",
            vault
        )));
    }
    Ok(())
}

fn validate_part_size(part_size: u64) -> Result<(), UploadError> {
    if !part_size.is_power_of_two() || !(MIN_PART_SIZE..=MAX_PART_SIZE).contains(&part_size) {
        return Err(UploadError::InvalidArgument(format!(
            "part size must be a power of two between {} and {}, got {}",
            MIN_PART_SIZE, MAX_PART_SIZE, part_size
        )));
    }
    Ok(())
}

fn validate_description(description: &str) -> Result<(), UploadError> {
    if description.len() > 1024 {
        return Err(UploadError::InvalidArgument(format!(
            "description of {} bytes exceeds 1024",
            description.len()
        )));
    }
    if !description.bytes().all(|b| (0x20..=0x7E).contains(&b)) {
        return Err(UploadError::InvalidArgument(
            "description contains bytes outside printable ASCII".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod test_validation {
    use super::*;

    #[test]
    fn vault_names() {
        assert!(validate_vault_name("backups").is_ok());
        assert!(validate_vault_name("a").is_ok());
        assert!(validate_vault_name("Backup.2024_q1-full").is_ok());
        assert!(validate_vault_name(&"v".repeat(255)).is_ok());

        assert!(validate_vault_name("").is_err());
        assert!(validate_vault_name(&"v".repeat(256)).is_err());
        assert!(validate_vault_name("has space").is_err());
        assert!(validate_vault_name("slash/name").is_err());
        assert!(validate_vault_name("umlaut-ü").is_err());
    }

    #[test]
    fn part_sizes() {
        assert!(validate_part_size(MIN_PART_SIZE).is_ok());
        assert!(validate_part_size(DEFAULT_PART_SIZE).is_ok());
        assert!(validate_part_size(MAX_PART_SIZE).is_ok());

        assert!(validate_part_size(0).is_err());
        assert!(validate_part_size(MIN_PART_SIZE - 1).is_err());
        assert!(validate_part_size(3 << 20).is_err());
        assert!(validate_part_size(MAX_PART_SIZE * 2).is_err());
    }

    #[test]
    fn descriptions() {
        assert!(validate_description("").is_ok());
        assert!(validate_description("holiday photos 2024").is_ok());
        assert!(validate_description(&"d".repeat(1024)).is_ok());

        assert!(validate_description(&"d".repeat(1025)).is_err());
        assert!(validate_description("line\nbreak").is_err());
        assert!(validate_description("tab\there").is_err());
        assert!(validate_description("élan").is_err());
    }
}
