use crate::RequestPath;

/// Identifies the codec used for a block of compressed data. Only the code that decompresses
/// data assigns meaning to it.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct CompressionTag(pub u64);

/// Describes where compressed data lives in an archive and how large it will be once
/// decompressed. Requests carry this without looking at it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompressionInfo {
    // The archive file the compressed data is stored in
    pub archive_filename: RequestPath,
    pub compression_tag: CompressionTag,
    // Offset of the compressed data in the archive
    pub offset: u64,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    // Data may be stored uncompressed in an archive, in which case the sizes are equal
    pub is_compressed: bool,
}

impl CompressionInfo {
    pub fn new(
        archive_filename: RequestPath,
        compression_tag: CompressionTag,
        offset: u64,
        compressed_size: u64,
        uncompressed_size: u64,
    ) -> Self {
        CompressionInfo {
            archive_filename,
            compression_tag,
            offset,
            compressed_size,
            uncompressed_size,
            is_compressed: true,
        }
    }

    pub fn uncompressed(
        archive_filename: RequestPath,
        offset: u64,
        size: u64,
    ) -> Self {
        CompressionInfo {
            archive_filename,
            compression_tag: CompressionTag::default(),
            offset,
            compressed_size: size,
            uncompressed_size: size,
            is_compressed: false,
        }
    }
}
