use crate::model::{ManifestRef, segments_container_for};

pub const GIB: u64 = 1024 * 1024 * 1024;
/// Objects at or above this size are segmented (the source's multipart boundary).
pub const DEFAULT_LARGE_OBJECT_THRESHOLD: u64 = 5 * GIB;
pub const DEFAULT_SEGMENT_SIZE: u64 = 2 * GIB;

/// One byte range of a large object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub index: usize,
    pub offset: u64,
    pub length: u64,
    pub name: String,
}

/// Deterministic split of an object into ordered segments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentPlan {
    pub segments_container: String,
    pub prefix: String,
    pub segments: Vec<Segment>,
}

impl SegmentPlan {
    /// Plans `ceil(size / segment_size)` segments; only the last may be short.
    /// An empty object still gets one (empty) segment.
    pub fn new(container: &str, object: &str, size: u64, segment_size: u64) -> Self {
        let segment_size = segment_size.max(1);
        let prefix = format!("{}/{}/{}", object, size, segment_size);
        let count = size.div_ceil(segment_size).max(1);

        let segments = (0..count)
            .map(|i| {
                let offset = i * segment_size;
                Segment {
                    index: i as usize,
                    offset,
                    length: segment_size.min(size - offset.min(size)),
                    name: format!("{}/{:08}", prefix, i),
                }
            })
            .collect();

        Self {
            segments_container: segments_container_for(container),
            prefix,
            segments,
        }
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn manifest(&self) -> ManifestRef {
        ManifestRef {
            segments_container: self.segments_container.clone(),
            prefix: self.prefix.clone(),
            segments: self.segments.iter().map(|s| s.name.clone()).collect(),
        }
    }
}
