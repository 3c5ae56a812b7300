//! Local staging of downloaded objects.
//!
//! A [`StagedObject`] owns its temporary file: dropping it removes the file,
//! whichever way the copy that created it ends.

use crate::error::{CopyError, StoreError};
use crate::model::{Checksum, ObjectBody};
use bytes::{Bytes, BytesMut};
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

const CHUNK_SIZE: usize = 1024 * 1024;

/// Worker-private staging directory.
#[derive(Clone, Debug)]
pub struct StagingArea {
    dir: PathBuf,
    worker: usize,
    quota: Option<u64>,
}

impl StagingArea {
    pub fn new(dir: impl Into<PathBuf>, worker: usize) -> Self {
        Self {
            dir: dir.into(),
            worker,
            quota: None,
        }
    }

    /// Caps the bytes staged for one object. Going over reports
    /// [`io::ErrorKind::StorageFull`], exactly like a full disk.
    pub fn with_quota(mut self, quota: Option<u64>) -> Self {
        self.quota = quota;
        self
    }

    /// Streams `reader` into a fresh temporary file, hashing as it goes.
    pub async fn stage<R>(&self, what: &str, reader: &mut R) -> Result<StagedObject, CopyError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.stage_segmented(what, reader, u64::MAX).await
    }

    /// Like [`stage`](Self::stage), additionally hashing every
    /// `segment_size` slice of the stream on its own.
    pub async fn stage_segmented<R>(
        &self,
        what: &str,
        reader: &mut R,
        segment_size: u64,
    ) -> Result<StagedObject, CopyError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let segment_size = segment_size.max(1);
        let named = tempfile::Builder::new()
            .prefix(&format!("store-migrate-w{:02}-", self.worker))
            .suffix(".part")
            .tempfile_in(&self.dir)
            .map_err(|e| CopyError::staging(what, e))?;
        let (std_file, path) = named.into_parts();
        let mut file = tokio::fs::File::from_std(std_file);

        let mut whole = md5::Context::new();
        let mut segment = md5::Context::new();
        let mut in_segment = 0u64;
        let mut segments = Vec::new();
        let mut length = 0u64;
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = reader
                .read(&mut buf)
                .await
                .map_err(|e| StoreError::io(what, e))?;
            if n == 0 {
                break;
            }
            if self.quota.is_some_and(|q| length + n as u64 > q) {
                let full = io::Error::new(io::ErrorKind::StorageFull, "staging quota exhausted");
                return Err(CopyError::staging(what, full));
            }
            whole.consume(&buf[..n]);
            file.write_all(&buf[..n])
                .await
                .map_err(|e| CopyError::staging(what, e))?;
            length += n as u64;

            let mut chunk = &buf[..n];
            while !chunk.is_empty() {
                let take = (segment_size - in_segment).min(chunk.len() as u64) as usize;
                segment.consume(&chunk[..take]);
                in_segment += take as u64;
                chunk = &chunk[take..];
                if in_segment == segment_size {
                    let done = std::mem::replace(&mut segment, md5::Context::new());
                    segments.push(Checksum::from_digest(done.compute()));
                    in_segment = 0;
                }
            }
        }
        file.flush().await.map_err(|e| CopyError::staging(what, e))?;

        // A short tail, or an empty stream, still forms a segment.
        if in_segment > 0 || segments.is_empty() {
            segments.push(Checksum::from_digest(segment.compute()));
        }

        Ok(StagedObject {
            path,
            length,
            checksum: Checksum::from_digest(whole.compute()),
            segments,
        })
    }
}

/// A fully staged object. The file is deleted when this is dropped.
#[derive(Debug)]
pub struct StagedObject {
    path: TempPath,
    length: u64,
    checksum: Checksum,
    segments: Vec<Checksum>,
}

impl StagedObject {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    /// MD5 of the bytes that were staged.
    pub fn checksum(&self) -> &Checksum {
        &self.checksum
    }

    /// MD5 of each staged segment, in order.
    pub fn segment_checksums(&self) -> &[Checksum] {
        &self.segments
    }

    /// Upload body for `length` bytes starting at `offset`.
    pub fn body(&self, offset: u64, length: u64) -> ObjectBody {
        ObjectBody::File {
            path: self.path.to_path_buf(),
            offset,
            length,
        }
    }
}

/// Reads a whole object into memory, hashing as it goes.
pub async fn buffer<R>(
    what: &str,
    reader: &mut R,
    size_hint: u64,
) -> Result<(Bytes, Checksum), CopyError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut data = BytesMut::with_capacity(size_hint as usize);
    let mut context = md5::Context::new();
    let mut buf = vec![0u8; CHUNK_SIZE.min(size_hint.max(1) as usize)];
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| StoreError::io(what, e))?;
        if n == 0 {
            break;
        }
        context.consume(&buf[..n]);
        data.extend_from_slice(&buf[..n]);
    }
    Ok((data.freeze(), Checksum::from_digest(context.compute())))
}
