// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Serialization of the accelerator structures.
//!
//! The accelerator consumes C structures laid out with natural alignment on a little endian
//! machine. [`LayoutWriter`] appends fields one by one, inserting the padding the C compiler
//! would, so a structure is written by listing its members in declaration order.

use byteorder::ByteOrder;
use byteorder::LittleEndian;

use crate::align_up;
use crate::packer::PackError;
use crate::packer::PackResult;

/// `VA_PADDING_LOW`
pub const VA_PADDING_LOW: usize = 4;
/// `VA_PADDING_MEDIUM`
pub const VA_PADDING_MEDIUM: usize = 8;

#[derive(Debug, Default)]
pub struct LayoutWriter {
    buf: Vec<u8>,
}

impl LayoutWriter {
    pub fn new() -> Self {
        Default::default()
    }

    /// Reserves a naturally aligned field of `size` bytes and returns it.
    fn field(&mut self, size: usize) -> &mut [u8] {
        let start = align_up(self.buf.len(), size);
        self.buf.resize(start + size, 0);
        &mut self.buf[start..]
    }

    /// Current size, i.e. the offset of the next field if it needs no padding.
    pub fn offset(&self) -> usize {
        self.buf.len()
    }

    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.field(1)[0] = value;
        self
    }

    pub fn i8(&mut self, value: i8) -> &mut Self {
        self.u8(value as u8)
    }

    pub fn u16(&mut self, value: u16) -> &mut Self {
        LittleEndian::write_u16(self.field(2), value);
        self
    }

    pub fn i16(&mut self, value: i16) -> &mut Self {
        LittleEndian::write_i16(self.field(2), value);
        self
    }

    pub fn u32(&mut self, value: u32) -> &mut Self {
        LittleEndian::write_u32(self.field(4), value);
        self
    }

    pub fn i32(&mut self, value: i32) -> &mut Self {
        LittleEndian::write_i32(self.field(4), value);
        self
    }

    pub fn bytes(&mut self, values: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(values);
        self
    }

    pub fn i8s(&mut self, values: &[i8]) -> &mut Self {
        values.iter().for_each(|v| {
            self.i8(*v);
        });
        self
    }

    pub fn u16s(&mut self, values: &[u16]) -> &mut Self {
        values.iter().for_each(|v| {
            self.u16(*v);
        });
        self
    }

    pub fn i16s(&mut self, values: &[i16]) -> &mut Self {
        values.iter().for_each(|v| {
            self.i16(*v);
        });
        self
    }

    /// `uint32_t va_reserved[count]`
    pub fn reserved(&mut self, count: usize) -> &mut Self {
        (0..count).for_each(|_| {
            self.u32(0);
        });
        self
    }

    /// Pads the structure to `alignment` and returns its bytes, checking the final size.
    pub fn finish(mut self, name: &'static str, alignment: usize, size: usize) -> PackResult<Vec<u8>> {
        let len = align_up(self.buf.len(), alignment);
        self.buf.resize(len, 0);

        if self.buf.len() != size {
            return Err(PackError::Other(anyhow::anyhow!(
                "{} serialized to {} bytes instead of {}",
                name,
                self.buf.len(),
                size
            )));
        }

        Ok(self.buf)
    }
}

/// Builder for the `union { struct { ... } bits; uint32_t value; }` members of the accelerator
/// structures. Fields are pushed from the least significant bit up.
#[derive(Debug, Default)]
pub struct BitField {
    value: u32,
    pos: u32,
}

impl BitField {
    pub fn new() -> Self {
        Default::default()
    }

    /// Appends `value` on `width` bits, failing if it does not fit.
    pub fn push(mut self, field: &'static str, value: u32, width: u32) -> PackResult<Self> {
        debug_assert!(self.pos + width <= 32);

        if width < 32 && value >> width != 0 {
            return Err(PackError::FieldOutOfRange {
                field,
                value: i64::from(value),
            });
        }

        self.value |= value << self.pos;
        self.pos += width;
        Ok(self)
    }

    pub fn flag(mut self, value: bool) -> Self {
        self.value |= (value as u32) << self.pos;
        self.pos += 1;
        self
    }

    pub fn bits(&self) -> u32 {
        self.value
    }
}

/// Converts `value` to the type of its accelerator field, failing if it does not fit.
pub fn narrow<T: TryFrom<i64>>(field: &'static str, value: impl Into<i64>) -> PackResult<T> {
    let value = value.into();
    T::try_from(value).map_err(|_| PackError::FieldOutOfRange { field, value })
}
