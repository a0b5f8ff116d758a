use std::io;

use log::debug;

use crate::buf::PartBuffer;
use crate::transport::Executor;
use crate::upload::{MultipartSession, RetryPolicy, UploadError};

// What a successful close leaves behind; the permanent handle plus the
// digest the service accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveReceipt {
    pub archive_id: String,
    pub location: String,
    pub tree_hash: String,
}

// Streaming sink over one multipart session. Bytes go in through write in
// any chunking the caller likes; whole parts leave as soon as they fill.
pub struct ArchiveWriter<'a, E: Executor> {
    session: MultipartSession<'a, E>,
    buffer: PartBuffer,
    receipt: Option<ArchiveReceipt>,
}

impl<'a, E: Executor> ArchiveWriter<'a, E> {
    pub fn create(
        executor: &'a E,
        vault: &str,
        part_size: u64,
        description: Option<&str>,
    ) -> Result<Self, UploadError> {
        let session = MultipartSession::initiate(executor, vault, part_size, description)?;
        Ok(ArchiveWriter::from_session(session))
    }

    // Wrap an already-open (e.g. resumed) session
    pub fn from_session(session: MultipartSession<'a, E>) -> Self {
        let part_size = session.part_size() as usize;
        ArchiveWriter {
            session,
            buffer: PartBuffer::new(part_size),
            receipt: None,
        }
    }

    pub fn session(&self) -> &MultipartSession<'a, E> {
        &self.session
    }

    pub fn set_retry_policy(&mut self, retry: RetryPolicy) {
        self.session.set_retry_policy(retry);
    }

    pub fn write(&mut self, data: &[u8]) -> Result<(), UploadError> {
        if self.receipt.is_some() || !self.session.is_open() {
            return Err(UploadError::AlreadyClosed);
        }

        self.buffer.append(data);
        while let Some(part) = self.buffer.drain_full_part() {
            self.session.upload_part(part)?;
        }
        Ok(())
    }

    // Idempotent: the first successful close uploads the remainder and
    // completes; later calls return the recorded receipt with no network
    // traffic
    pub fn close(&mut self) -> Result<ArchiveReceipt, UploadError> {
        if let Some(receipt) = &self.receipt {
            return Ok(receipt.clone());
        }

        let tail = self.buffer.drain_final();
        if !tail.is_empty() {
            debug!("uploading final short part of {} bytes", tail.len());
            self.session.upload_part(tail)?;
        } else if self.session.parts().is_empty() {
            // Glacier archives must hold at least one byte
            return Err(UploadError::EmptyArchive);
        }

        let (archive_id, location, tree_hash) = self.session.complete()?;
        let receipt = ArchiveReceipt {
            archive_id,
            location,
            tree_hash,
        };
        self.receipt = Some(receipt.clone());
        Ok(receipt)
    }

    pub fn archive_id(&mut self) -> Result<String, UploadError> {
        Ok(self.close()?.archive_id)
    }

    pub fn location(&mut self) -> Result<String, UploadError> {
        Ok(self.close()?.location)
    }

    pub fn tree_hash_hex(&mut self) -> Result<String, UploadError> {
        Ok(self.close()?.tree_hash)
    }

    pub fn abort(&mut self) -> Result<(), UploadError> {
        self.session.abort()
    }
}

// Lets any io::copy-style producer drive the writer; close still has to be
// called to finalize the archive
impl<E: Executor> io::Write for ArchiveWriter<'_, E> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        ArchiveWriter::write(self, buf).map_err(io::Error::other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash;
    use crate::transport::mem::MemGlacier;
    use crate::upload::MIN_PART_SIZE;
    use http::{Method, StatusCode};
    use std::time::Duration;

    const PART: u64 = MIN_PART_SIZE;

    fn open_writer(glacier: &MemGlacier) -> ArchiveWriter<'_, MemGlacier> {
        let mut writer = ArchiveWriter::create(glacier, "vault", PART, None).unwrap();
        writer.set_retry_policy(RetryPolicy {
            sleep_time: Duration::ZERO,
            ..RetryPolicy::default()
        });
        writer
    }

    fn expected_root(data: &[u8]) -> String {
        hash::to_hex(&hash::part_root(data).unwrap())
    }

    #[test]
    fn single_byte_archive() {
        let glacier = MemGlacier::new();
        let mut writer = open_writer(&glacier);

        writer.write(b"a").unwrap();
        let receipt = writer.close().unwrap();

        assert_eq!(
            receipt.tree_hash,
            "ca978112ca1bbdcafac231b39a23dc4da786eff8147c4e72b9807785afee48bb"
        );

        let archive = glacier.archive(&receipt.archive_id).unwrap();
        assert_eq!(archive.size, 1);
        assert_eq!(&archive.data[..], b"a");
        assert_eq!(writer.session().parts().len(), 1);
    }

    #[test]
    fn one_mib_of_zeroes() {
        let glacier = MemGlacier::new();
        let mut writer = open_writer(&glacier);

        writer.write(&vec![0u8; PART as usize]).unwrap();
        let receipt = writer.close().unwrap();

        assert_eq!(
            receipt.tree_hash,
            "30e14955ebf1352266dc2ff8067e68104607e750abb9d3b36582b8af909fcb58"
        );
        assert_eq!(writer.session().parts().len(), 1);
    }

    #[test]
    fn three_mib_in_one_part() {
        let glacier = MemGlacier::new();
        let data = vec![0xFF; 3 << 20];

        let mut writer = ArchiveWriter::create(&glacier, "vault", 4 << 20, None).unwrap();
        writer.write(&data).unwrap();
        let receipt = writer.close().unwrap();

        assert_eq!(writer.session().parts().len(), 1);
        assert_eq!(receipt.tree_hash, expected_root(&data));
    }

    #[test]
    fn chunked_writes_match_one_shot() {
        // 10MiB dribbled in as 7-byte writes must hash and store exactly as
        // a single write would; MemGlacier recomputes the root server-side,
        // so a wrong buffer seam fails the upload outright
        let glacier = MemGlacier::new();
        let full: Vec<u8> = (0..10 * (1usize << 20)).map(|i| i as u8).collect();

        let mut writer = open_writer(&glacier);
        for chunk in full.chunks(7) {
            writer.write(chunk).unwrap();
        }
        let receipt = writer.close().unwrap();

        assert_eq!(receipt.tree_hash, expected_root(&full));
        let archive = glacier.archive(&receipt.archive_id).unwrap();
        assert_eq!(&archive.data[..], &full[..]);
        assert_eq!(writer.session().parts().len(), 10);
    }

    #[test]
    fn straddling_write_splits_into_two_parts() {
        let glacier = MemGlacier::new();
        let data = vec![5u8; PART as usize + PART as usize / 2];

        let mut writer = open_writer(&glacier);
        writer.write(&data).unwrap();
        let receipt = writer.close().unwrap();

        let parts = writer.session().parts();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].len, PART);
        assert_eq!(parts[1].len, PART / 2);
        assert_eq!(parts[1].offset, PART);
        assert_eq!(receipt.tree_hash, expected_root(&data));
    }

    #[test]
    fn close_is_idempotent() {
        let glacier = MemGlacier::new();
        let mut writer = open_writer(&glacier);
        writer.write(b"payload").unwrap();

        let first = writer.close().unwrap();
        let traffic = glacier.requests().len();

        let second = writer.close().unwrap();
        assert_eq!(first, second);
        assert_eq!(glacier.requests().len(), traffic);

        // Accessors answer from the receipt, also without network traffic
        assert_eq!(writer.archive_id().unwrap(), first.archive_id);
        assert_eq!(writer.location().unwrap(), first.location);
        assert_eq!(writer.tree_hash_hex().unwrap(), first.tree_hash);
        assert_eq!(glacier.requests().len(), traffic);
    }

    #[test]
    fn empty_archive_cannot_close() {
        let glacier = MemGlacier::new();
        let mut writer = open_writer(&glacier);

        assert!(matches!(writer.close(), Err(UploadError::EmptyArchive)));
        assert!(matches!(
            writer.archive_id(),
            Err(UploadError::EmptyArchive)
        ));
    }

    #[test]
    fn write_after_close_is_rejected() {
        let glacier = MemGlacier::new();
        let mut writer = open_writer(&glacier);
        writer.write(b"data").unwrap();
        writer.close().unwrap();

        assert!(matches!(
            writer.write(b"more"),
            Err(UploadError::AlreadyClosed)
        ));
    }

    #[test]
    fn write_after_abort_is_rejected() {
        let glacier = MemGlacier::new();
        let mut writer = open_writer(&glacier);
        writer.write(b"data").unwrap();
        writer.abort().unwrap();

        assert!(matches!(
            writer.write(b"more"),
            Err(UploadError::AlreadyClosed)
        ));
    }

    #[test]
    fn mid_stream_retry_keeps_the_data_intact() {
        let glacier = MemGlacier::new();
        let full = vec![9u8; 2 * PART as usize + 512];

        let mut writer = open_writer(&glacier);
        writer.write(&full[..PART as usize + 100]).unwrap();

        // The next full part hits a 500 first
        glacier.push_failure(StatusCode::INTERNAL_SERVER_ERROR);
        writer.write(&full[PART as usize + 100..]).unwrap();
        let receipt = writer.close().unwrap();

        let path = format!(
            "/-/vaults/vault/multipart-uploads/{}",
            writer.session().upload_id()
        );
        assert_eq!(glacier.request_count(&Method::PUT, &path), 4);
        assert_eq!(&glacier.archive(&receipt.archive_id).unwrap().data[..], &full[..]);
    }

    #[test]
    fn io_write_copy() {
        use std::io::{copy, Cursor};

        let glacier = MemGlacier::new();
        let full = vec![3u8; PART as usize + 17];

        let mut writer = open_writer(&glacier);
        copy(&mut Cursor::new(&full), &mut writer).unwrap();
        let receipt = writer.close().unwrap();

        assert_eq!(&glacier.archive(&receipt.archive_id).unwrap().data[..], &full[..]);
    }
}
