// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Protected content.
//!
//! [`ProtectedPacker`] wraps the packer of a codec and describes, for every hardware round, which
//! bytes of the slice data buffer are encrypted. Slice data is submitted as received: the
//! accelerator decrypts it itself using the segments of the `EncryptionParameter` buffer.

use log::debug;

use crate::accel::AccelError;
use crate::accel::Accelerator;
use crate::accel::BufferType;
use crate::packer::layout::LayoutWriter;
use crate::packer::layout::VA_PADDING_LOW;
use crate::packer::Continuation;
use crate::packer::FrameContext;
use crate::packer::PackError;
use crate::packer::PackResult;
use crate::packer::Packer;
use crate::packer::SliceChunk;
use crate::packer::SliceDataWriter;
use crate::Codec;

pub const VA_ENCRYPTION_TYPE_SUBSAMPLE_CTR: u32 = 0x04;
pub const VA_ENCRYPTION_TYPE_SUBSAMPLE_CBC: u32 = 0x08;

const AES_BLOCK_SIZE: usize = 16;
const IV_FIELD_SIZE: usize = 64;

pub const ENCRYPTION_HEADER_SIZE: usize = 16;
pub const ENCRYPTION_SEGMENT_SIZE: usize = 96;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EncryptionScheme {
    /// AES-CTR, `cenc`.
    #[default]
    Ctr,
    /// AES-CBC with a pattern, `cbcs`.
    Cbc,
}

impl EncryptionScheme {
    fn va_type(self) -> u32 {
        match self {
            EncryptionScheme::Ctr => VA_ENCRYPTION_TYPE_SUBSAMPLE_CTR,
            EncryptionScheme::Cbc => VA_ENCRYPTION_TYPE_SUBSAMPLE_CBC,
        }
    }
}

/// Pattern of encrypted and clear blocks within the encrypted part of a subsample.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EncryptionPattern {
    pub crypt_byte_block: u32,
    pub skip_byte_block: u32,
}

/// A run of clear bytes followed by a run of encrypted bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Subsample {
    pub clear_bytes: usize,
    pub encrypted_bytes: usize,
}

/// How the payload of a slice is encrypted. Bytes past the last subsample are clear.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceEncryption {
    pub scheme: EncryptionScheme,
    pub pattern: EncryptionPattern,
    /// Initialization vector, or initial counter block, of the slice.
    pub iv: [u8; 16],
    pub subsamples: Vec<Subsample>,
}

/// `VAEncryptionSegmentInfo`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EncryptionSegment {
    /// Offset of the segment in the slice data buffer.
    pub start: usize,
    pub length: usize,
    /// Bytes of the current AES block already consumed when the segment starts.
    pub partial_aes_block_size: usize,
    /// Clear bytes at the start of the segment.
    pub init_byte_length: usize,
    pub iv: [u8; 16],
}

impl EncryptionSegment {
    fn write(&self, w: &mut LayoutWriter) -> PackResult<()> {
        let mut iv = [0u8; IV_FIELD_SIZE];
        iv[..self.iv.len()].copy_from_slice(&self.iv);

        w.u32(narrow_u32("segment_start_offset", self.start)?)
            .u32(narrow_u32("segment_length", self.length)?)
            .u32(narrow_u32("partial_aes_block_size", self.partial_aes_block_size)?)
            .u32(narrow_u32("init_byte_length", self.init_byte_length)?)
            .bytes(&iv)
            .reserved(VA_PADDING_LOW);
        Ok(())
    }
}

fn narrow_u32(field: &'static str, value: usize) -> PackResult<u32> {
    u32::try_from(value).map_err(|_| PackError::FieldOutOfRange {
        field,
        value: value as i64,
    })
}

/// Advances a big endian counter block by `blocks`.
fn advance_counter(iv: &[u8; 16], blocks: usize) -> [u8; 16] {
    let counter = u128::from_be_bytes(*iv).wrapping_add(blocks as u128);
    counter.to_be_bytes()
}

/// Computes the segments covering `chunk`, a piece of a slice of `payload_len` bytes.
///
/// Subsamples are expressed on the payload. The prefix the packer writes before it is clear, and
/// so are the bytes past the last subsample.
pub fn chunk_segments(
    chunk: &SliceChunk,
    payload_len: usize,
    encryption: Option<&SliceEncryption>,
) -> Vec<EncryptionSegment> {
    let iv = encryption.map(|e| e.iv).unwrap_or_default();

    // Subsamples on the data as written, prefix included.
    let mut subsamples: Vec<Subsample> = encryption
        .map(|e| e.subsamples.clone())
        .unwrap_or_default();
    let covered: usize = subsamples
        .iter()
        .map(|s| s.clear_bytes + s.encrypted_bytes)
        .sum();
    if covered < payload_len {
        subsamples.push(Subsample {
            clear_bytes: payload_len - covered,
            encrypted_bytes: 0,
        });
    }
    if let Some(first) = subsamples.first_mut() {
        first.clear_bytes += chunk.prefix_len;
    }

    let chunk_start = chunk.source_offset;
    let chunk_end = chunk.source_offset + chunk.size;

    let mut segments = Vec::new();
    let mut pos = 0;
    let mut encrypted_before = 0;

    for subsample in subsamples {
        let clear_end = pos + subsample.clear_bytes;
        let end = clear_end + subsample.encrypted_bytes;

        let start = std::cmp::max(pos, chunk_start);
        let stop = std::cmp::min(end, chunk_end);
        if start < stop {
            let clear = clear_end.saturating_sub(start).min(stop - start);
            let consumed = encrypted_before + start.saturating_sub(clear_end);

            segments.push(EncryptionSegment {
                start: chunk.buffer_offset + (start - chunk_start),
                length: stop - start,
                partial_aes_block_size: consumed % AES_BLOCK_SIZE,
                init_byte_length: clear,
                iv: advance_counter(&iv, consumed / AES_BLOCK_SIZE),
            });
        }

        encrypted_before += subsample.encrypted_bytes;
        pos = end;
        if pos >= chunk_end {
            break;
        }
    }

    segments
}

/// Packer of protected content, on top of the packer of the codec.
pub struct ProtectedPacker {
    inner: Box<dyn Packer>,
    /// Segments of the round being packed.
    segments: Vec<EncryptionSegment>,
    scheme: Option<EncryptionScheme>,
    pattern: EncryptionPattern,
}

impl ProtectedPacker {
    pub fn new(inner: Box<dyn Packer>) -> Self {
        Self {
            inner,
            segments: Vec::new(),
            scheme: None,
            pattern: Default::default(),
        }
    }

    pub fn segments(&self) -> &[EncryptionSegment] {
        &self.segments
    }

    fn encryption_parameters(&self) -> PackResult<Vec<u8>> {
        let scheme = self.scheme.unwrap_or_default();

        let mut w = LayoutWriter::new();
        w.u32(scheme.va_type())
            .u32(narrow_u32("num_segments", self.segments.len())?)
            .u32(self.pattern.crypt_byte_block)
            .u32(self.pattern.skip_byte_block);
        for segment in &self.segments {
            segment.write(&mut w)?;
        }

        let size = ENCRYPTION_HEADER_SIZE + self.segments.len() * ENCRYPTION_SEGMENT_SIZE;
        w.finish("VAEncryptionParameters", 4, size)
    }
}

impl Packer for ProtectedPacker {
    fn codec(&self) -> Codec {
        self.inner.codec()
    }

    fn begin_frame(&mut self, accel: &mut Accelerator, frame: &FrameContext) -> PackResult<()> {
        self.segments.clear();
        self.scheme = None;
        self.inner.begin_frame(accel, frame)
    }

    fn pack_picture_parameters(
        &mut self,
        accel: &mut Accelerator,
        frame: &FrameContext,
    ) -> PackResult<()> {
        self.inner.pack_picture_parameters(accel, frame)
    }

    fn pack_quantization_matrices(
        &mut self,
        accel: &mut Accelerator,
        frame: &FrameContext,
    ) -> PackResult<()> {
        self.inner.pack_quantization_matrices(accel, frame)
    }

    fn pack_slice_parameters(
        &mut self,
        accel: &mut Accelerator,
        frame: &FrameContext,
        index: usize,
        consumed: &mut usize,
        writer: &mut SliceDataWriter,
    ) -> PackResult<Continuation> {
        let slice = &frame.slices[index];

        if let Some(encryption) = &slice.encryption {
            match self.scheme {
                None => {
                    self.scheme = Some(encryption.scheme);
                    self.pattern = encryption.pattern;
                }
                Some(scheme) if scheme != encryption.scheme => {
                    return Err(PackError::Unsupported(format!(
                        "slice {} uses {:?} in a {:?} frame",
                        index, encryption.scheme, scheme
                    )));
                }
                Some(_) => (),
            }
        }

        let written = writer.chunks().len();
        let continuation = self
            .inner
            .pack_slice_parameters(accel, frame, index, consumed, writer)?;

        if writer.chunks().len() > written {
            if let Some(chunk) = writer.last_chunk() {
                let segments =
                    chunk_segments(chunk, slice.payload.len(), slice.encryption.as_ref());
                self.segments.extend(segments);
            }
        }

        Ok(continuation)
    }

    fn pack_processing_info(
        &mut self,
        accel: &mut Accelerator,
        frame: &FrameContext,
    ) -> PackResult<()> {
        self.inner.pack_processing_info(accel, frame)
    }

    fn execute(&mut self, accel: &mut Accelerator) -> PackResult<()> {
        let bytes = self.encryption_parameters()?;
        accel
            .get_comp_buffer(BufferType::EncryptionParameter, bytes.len(), 0)?
            .fill(&bytes)?;

        match self.inner.execute(accel) {
            Ok(()) => {
                debug!("Submitted {} encryption segments", self.segments.len());
                self.segments.clear();
                Ok(())
            }
            // Kept for the retry.
            Err(e @ PackError::Accel(AccelError::Busy)) => Err(e),
            Err(e) => {
                self.segments.clear();
                Err(e)
            }
        }
    }

    fn end_frame(&mut self, accel: &mut Accelerator) -> PackResult<()> {
        self.inner.end_frame(accel)
    }
}
