use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Destination object metadata key carrying the source checksum.
pub const OLD_HASH_KEY: &str = "old-hash";
/// Destination container metadata key naming the region it was migrated from.
pub const ORIGIN_REGION_KEY: &str = "origin-region";
/// Object metadata key marking a manifest: `<segments container>/<segment prefix>`.
pub const MANIFEST_KEY: &str = "object-manifest";
/// Suffix of the auxiliary container holding large-object segments.
pub const SEGMENTS_SUFFIX: &str = "_segments";

pub type Metadata = BTreeMap<String, String>;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
}

impl Tenant {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerEntry {
    pub name: String,
    pub object_count: u64,
    pub bytes: u64,
}

/// Existence plus container-level metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContainerStat {
    pub metadata: Metadata,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectEntry {
    pub name: String,
    pub size: u64,
    pub checksum: Checksum,
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectStat {
    pub size: u64,
    pub checksum: Checksum,
    pub last_modified: Option<DateTime<Utc>>,
    pub metadata: Metadata,
}

impl ObjectStat {
    /// Source checksum recorded by a previous migration, if any.
    pub fn old_hash(&self) -> Option<Checksum> {
        self.metadata.get(OLD_HASH_KEY).map(|v| Checksum::new(v))
    }

    /// `<segments container>/<prefix>` when this object is a manifest.
    pub fn manifest_pointer(&self) -> Option<&str> {
        self.metadata.get(MANIFEST_KEY).map(String::as_str)
    }
}

/// Ordered segment references for a dynamic large object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestRef {
    pub segments_container: String,
    pub prefix: String,
    pub segments: Vec<String>,
}

impl ManifestRef {
    /// Value stored under [`MANIFEST_KEY`] on the manifest object.
    pub fn pointer(&self) -> String {
        format!("{}/{}", self.segments_container, self.prefix)
    }

    /// Splits a [`MANIFEST_KEY`] value back into (segments container, prefix).
    pub fn parse_pointer(pointer: &str) -> Option<(&str, &str)> {
        pointer.split_once('/')
    }
}

/// Upload payload: either buffered bytes or a byte range of a staged file.
#[derive(Clone, Debug)]
pub enum ObjectBody {
    Memory(Bytes),
    File {
        path: PathBuf,
        offset: u64,
        length: u64,
    },
}

impl ObjectBody {
    pub fn len(&self) -> u64 {
        match self {
            ObjectBody::Memory(bytes) => bytes.len() as u64,
            ObjectBody::File { length, .. } => *length,
        }
    }
}

/// Content hash as reported by a store (an ETag), normalised to bare lowercase.
///
/// Plain hex values are MD5 content digests. Values shaped `<hex>-<parts>`
/// are composite multipart digests and cannot be recomputed from the bytes
/// alone without knowing the original part layout.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Checksum(String);

impl Checksum {
    pub fn new(raw: &str) -> Self {
        Checksum(raw.trim().trim_matches('"').to_ascii_lowercase())
    }

    pub fn from_digest(digest: md5::Digest) -> Self {
        Checksum(format!("{:x}", digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A bare 128-bit hex digest that can be recomputed from the content.
    pub fn is_digest(&self) -> bool {
        self.0.len() == 32 && self.0.chars().all(|c| c.is_ascii_hexdigit())
    }

    pub fn is_composite(&self) -> bool {
        match self.0.rsplit_once('-') {
            Some((hash, parts)) => {
                !hash.is_empty()
                    && hash.chars().all(|c| c.is_ascii_hexdigit())
                    && !parts.is_empty()
                    && parts.chars().all(|c| c.is_ascii_digit())
            }
            None => false,
        }
    }

    /// Multipart-style checksum over ordered part digests:
    /// `md5(concat(raw part digests))-<count>`.
    ///
    /// Returns `None` when any part is not a plain content digest.
    pub fn composite(parts: &[Checksum]) -> Option<Checksum> {
        let mut context = md5::Context::new();
        for part in parts {
            let raw = hex::decode(part.as_str()).ok()?;
            if raw.len() != 16 {
                return None;
            }
            context.consume(&raw);
        }
        Some(Checksum(format!("{:x}-{}", context.compute(), parts.len())))
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub fn is_segments_container(name: &str) -> bool {
    name.ends_with(SEGMENTS_SUFFIX)
}

pub fn segments_container_for(name: &str) -> String {
    format!("{}{}", name, SEGMENTS_SUFFIX)
}
