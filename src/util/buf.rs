//! MessagePack primitives on top of `bytes`.
//!
//! Only the subset needed by the proxy protocol is supported: nil, bool, integers, bin, str and
//!  array headers. Structures are always written as arrays with a fixed number of fields, which
//!  is what the native peer expects; we call these array headers 'object headers'.

use bytes::{Buf, BufMut, Bytes};

use crate::error::FormatError;

pub const MP_NIL: u8 = 0xc0;
const MP_FALSE: u8 = 0xc2;
const MP_TRUE: u8 = 0xc3;
const MP_BIN8: u8 = 0xc4;
const MP_BIN16: u8 = 0xc5;
const MP_BIN32: u8 = 0xc6;
const MP_UINT8: u8 = 0xcc;
const MP_UINT16: u8 = 0xcd;
const MP_UINT32: u8 = 0xce;
const MP_UINT64: u8 = 0xcf;
const MP_INT8: u8 = 0xd0;
const MP_INT16: u8 = 0xd1;
const MP_INT32: u8 = 0xd2;
const MP_INT64: u8 = 0xd3;
const MP_STR8: u8 = 0xd9;
const MP_STR16: u8 = 0xda;
const MP_STR32: u8 = 0xdb;
const MP_ARRAY16: u8 = 0xdc;
const MP_ARRAY32: u8 = 0xdd;


macro_rules! get_checked_impl {
    ($checked_getter: ident, $ty:ty, $getter: ident) => {
        fn $checked_getter(&mut self) -> anyhow::Result<$ty> {
            if self.remaining() < size_of::<$ty>() {
                return Err(FormatError::Underflow(stringify!($ty)).into());
            }
            Ok(self.$getter())
        }
    }
}


pub trait MpackBufExt: Buf {
    get_checked_impl!(checked_get_u8, u8, get_u8);
    get_checked_impl!(checked_get_u16, u16, get_u16);
    get_checked_impl!(checked_get_u32, u32, get_u32);
    get_checked_impl!(checked_get_u64, u64, get_u64);
    get_checked_impl!(checked_get_i8, i8, get_i8);
    get_checked_impl!(checked_get_i16, i16, get_i16);
    get_checked_impl!(checked_get_i32, i32, get_i32);
    get_checked_impl!(checked_get_i64, i64, get_i64);

    fn mp_peek_nil(&self) -> bool {
        self.chunk().first() == Some(&MP_NIL)
    }

    fn mp_get_nil(&mut self) -> anyhow::Result<()> {
        match self.checked_get_u8()? {
            MP_NIL => Ok(()),
            marker => Err(FormatError::Marker { marker, expected: "nil" }.into()),
        }
    }

    fn mp_get_bool(&mut self) -> anyhow::Result<bool> {
        match self.checked_get_u8()? {
            MP_FALSE => Ok(false),
            MP_TRUE => Ok(true),
            marker => Err(FormatError::Marker { marker, expected: "bool" }.into()),
        }
    }

    /// Reads any integer encoding as i128, so that the typed getters can do a single range check
    fn mp_get_int(&mut self) -> anyhow::Result<i128> {
        let marker = self.checked_get_u8()?;
        let value = match marker {
            0x00..=0x7f => marker as i128,
            0xe0..=0xff => (marker as i8) as i128,
            MP_UINT8 => self.checked_get_u8()? as i128,
            MP_UINT16 => self.checked_get_u16()? as i128,
            MP_UINT32 => self.checked_get_u32()? as i128,
            MP_UINT64 => self.checked_get_u64()? as i128,
            MP_INT8 => self.checked_get_i8()? as i128,
            MP_INT16 => self.checked_get_i16()? as i128,
            MP_INT32 => self.checked_get_i32()? as i128,
            MP_INT64 => self.checked_get_i64()? as i128,
            _ => return Err(FormatError::Marker { marker, expected: "integer" }.into()),
        };
        Ok(value)
    }

    fn mp_get_u64(&mut self) -> anyhow::Result<u64> {
        let v = self.mp_get_int()?;
        u64::try_from(v).map_err(|_| FormatError::OutOfRange("u64").into())
    }

    fn mp_get_u32(&mut self) -> anyhow::Result<u32> {
        let v = self.mp_get_int()?;
        u32::try_from(v).map_err(|_| FormatError::OutOfRange("u32").into())
    }

    fn mp_get_u16(&mut self) -> anyhow::Result<u16> {
        let v = self.mp_get_int()?;
        u16::try_from(v).map_err(|_| FormatError::OutOfRange("u16").into())
    }

    fn mp_get_u8(&mut self) -> anyhow::Result<u8> {
        let v = self.mp_get_int()?;
        u8::try_from(v).map_err(|_| FormatError::OutOfRange("u8").into())
    }

    fn mp_get_i32(&mut self) -> anyhow::Result<i32> {
        let v = self.mp_get_int()?;
        i32::try_from(v).map_err(|_| FormatError::OutOfRange("i32").into())
    }

    fn mp_get_bin(&mut self) -> anyhow::Result<Bytes> {
        let len = match self.checked_get_u8()? {
            MP_BIN8 => self.checked_get_u8()? as usize,
            MP_BIN16 => self.checked_get_u16()? as usize,
            MP_BIN32 => self.checked_get_u32()? as usize,
            marker => return Err(FormatError::Marker { marker, expected: "bin" }.into()),
        };
        if self.remaining() < len {
            return Err(FormatError::Underflow("bin").into());
        }
        Ok(self.copy_to_bytes(len))
    }

    /// bin with a fixed size, e.g. an IPv4 address
    fn mp_get_bin_fixed<const N: usize>(&mut self, what: &'static str) -> anyhow::Result<[u8; N]> {
        let bin = self.mp_get_bin()?;
        <[u8; N]>::try_from(bin.as_ref())
            .map_err(|_| FormatError::FixedSize { what, actual: bin.len() }.into())
    }

    fn mp_get_str(&mut self) -> anyhow::Result<String> {
        let marker = self.checked_get_u8()?;
        let len = match marker {
            0xa0..=0xbf => (marker & 0x1f) as usize,
            MP_STR8 => self.checked_get_u8()? as usize,
            MP_STR16 => self.checked_get_u16()? as usize,
            MP_STR32 => self.checked_get_u32()? as usize,
            _ => return Err(FormatError::Marker { marker, expected: "str" }.into()),
        };
        if self.remaining() < len {
            return Err(FormatError::Underflow("str").into());
        }
        let raw = self.copy_to_bytes(len);
        String::from_utf8(raw.to_vec())
            .map_err(|_| FormatError::Utf8.into())
    }

    /// nil is read as an empty string, which is how the native peer writes absent strings
    fn mp_get_opt_str(&mut self) -> anyhow::Result<String> {
        if self.mp_peek_nil() {
            self.mp_get_nil()?;
            return Ok(String::new());
        }
        self.mp_get_str()
    }

    fn mp_get_object_header(&mut self) -> anyhow::Result<usize> {
        let marker = self.checked_get_u8()?;
        let len = match marker {
            0x90..=0x9f => (marker & 0x0f) as usize,
            MP_ARRAY16 => self.checked_get_u16()? as usize,
            MP_ARRAY32 => self.checked_get_u32()? as usize,
            _ => return Err(FormatError::Marker { marker, expected: "object header" }.into()),
        };
        Ok(len)
    }

    /// Reads an object header and fails unless it has exactly `expected` fields
    fn mp_get_object(&mut self, expected: usize) -> anyhow::Result<()> {
        let actual = self.mp_get_object_header()?;
        if actual != expected {
            return Err(FormatError::FieldCount { expected: expected.to_string(), actual }.into());
        }
        Ok(())
    }
}

impl <T: Buf> MpackBufExt for T {}


pub trait MpackBufMutExt: BufMut {
    fn mp_put_nil(&mut self) {
        self.put_u8(MP_NIL);
    }

    fn mp_put_bool(&mut self, v: bool) {
        self.put_u8(if v { MP_TRUE } else { MP_FALSE });
    }

    /// Writes the shortest encoding of an unsigned value
    fn mp_put_u64(&mut self, v: u64) {
        if v < 0x80 {
            self.put_u8(v as u8);
        }
        else if v <= u8::MAX as u64 {
            self.put_u8(MP_UINT8);
            self.put_u8(v as u8);
        }
        else if v <= u16::MAX as u64 {
            self.put_u8(MP_UINT16);
            self.put_u16(v as u16);
        }
        else if v <= u32::MAX as u64 {
            self.put_u8(MP_UINT32);
            self.put_u32(v as u32);
        }
        else {
            self.put_u8(MP_UINT64);
            self.put_u64(v);
        }
    }

    fn mp_put_i64(&mut self, v: i64) {
        if v >= 0 {
            self.mp_put_u64(v as u64);
        }
        else if v >= -32 {
            self.put_i8(v as i8);
        }
        else if v >= i8::MIN as i64 {
            self.put_u8(MP_INT8);
            self.put_i8(v as i8);
        }
        else if v >= i16::MIN as i64 {
            self.put_u8(MP_INT16);
            self.put_i16(v as i16);
        }
        else if v >= i32::MIN as i64 {
            self.put_u8(MP_INT32);
            self.put_i32(v as i32);
        }
        else {
            self.put_u8(MP_INT64);
            self.put_i64(v);
        }
    }

    fn mp_put_bin(&mut self, v: &[u8]) {
        let len = v.len();
        if len <= u8::MAX as usize {
            self.put_u8(MP_BIN8);
            self.put_u8(len as u8);
        }
        else if len <= u16::MAX as usize {
            self.put_u8(MP_BIN16);
            self.put_u16(len as u16);
        }
        else {
            self.put_u8(MP_BIN32);
            self.put_u32(len as u32);
        }
        self.put_slice(v);
    }

    fn mp_put_str(&mut self, v: &str) {
        let len = v.len();
        if len < 32 {
            self.put_u8(0xa0 | len as u8);
        }
        else if len <= u8::MAX as usize {
            self.put_u8(MP_STR8);
            self.put_u8(len as u8);
        }
        else if len <= u16::MAX as usize {
            self.put_u8(MP_STR16);
            self.put_u16(len as u16);
        }
        else {
            self.put_u8(MP_STR32);
            self.put_u32(len as u32);
        }
        self.put_slice(v.as_bytes());
    }

    fn mp_put_object_header(&mut self, num_fields: usize) {
        if num_fields < 16 {
            self.put_u8(0x90 | num_fields as u8);
        }
        else if num_fields <= u16::MAX as usize {
            self.put_u8(MP_ARRAY16);
            self.put_u16(num_fields as u16);
        }
        else {
            self.put_u8(MP_ARRAY32);
            self.put_u32(num_fields as u32);
        }
    }
}

impl <T: BufMut> MpackBufMutExt for T {}


#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use rstest::rstest;

    use super::*;
    use crate::error::is_format_error;

    #[rstest]
    #[case::fixint(5, vec![0x05])]
    #[case::fixint_max(127, vec![0x7f])]
    #[case::uint8(128, vec![0xcc, 0x80])]
    #[case::uint16(300, vec![0xcd, 0x01, 0x2c])]
    #[case::uint32(70000, vec![0xce, 0x00, 0x01, 0x11, 0x70])]
    #[case::uint64(u32::MAX as u64 + 1, vec![0xcf, 0, 0, 0, 1, 0, 0, 0, 0])]
    fn test_put_u64(#[case] value: u64, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        buf.mp_put_u64(value);
        assert_eq!(buf.as_ref(), expected.as_slice());

        let mut b: &[u8] = &buf;
        assert_eq!(b.mp_get_u64().unwrap(), value);
        assert!(b.is_empty());
    }

    #[rstest]
    #[case::neg_fixint(-1, vec![0xff])]
    #[case::neg_fixint_min(-32, vec![0xe0])]
    #[case::int8(-33, vec![0xd0, 0xdf])]
    #[case::int16(-1000, vec![0xd1, 0xfc, 0x18])]
    #[case::error_code(-38, vec![0xd0, 0xda])]
    #[case::positive(7, vec![0x07])]
    fn test_put_i64(#[case] value: i64, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        buf.mp_put_i64(value);
        assert_eq!(buf.as_ref(), expected.as_slice());

        let mut b: &[u8] = &buf;
        assert_eq!(b.mp_get_int().unwrap(), value as i128);
    }

    #[test]
    fn test_get_u32_accepts_signed_encoding() {
        let mut b: &[u8] = &[0xd2, 0, 0, 0, 9];
        assert_eq!(b.mp_get_u32().unwrap(), 9);
    }

    #[test]
    fn test_get_u32_rejects_negative() {
        let mut b: &[u8] = &[0xff];
        assert!(is_format_error(&b.mp_get_u32().unwrap_err()));
    }

    #[rstest]
    #[case::short("abc")]
    #[case::str8("this string is longer than thirty one bytes")]
    #[case::empty("")]
    fn test_str(#[case] s: &str) {
        let mut buf = BytesMut::new();
        buf.mp_put_str(s);
        let mut b: &[u8] = &buf;
        assert_eq!(b.mp_get_str().unwrap(), s);
        assert!(b.is_empty());
    }

    #[test]
    fn test_opt_str_nil() {
        let mut b: &[u8] = &[MP_NIL];
        assert_eq!(b.mp_get_opt_str().unwrap(), "");
    }

    #[test]
    fn test_bin_fixed_size_mismatch() {
        let mut buf = BytesMut::new();
        buf.mp_put_bin(&[1, 2, 3, 4, 5, 6]);
        let mut b: &[u8] = &buf;
        let err = b.mp_get_bin_fixed::<4>("ipv4 address").unwrap_err();
        assert_eq!(err.downcast_ref::<FormatError>(), Some(&FormatError::FixedSize { what: "ipv4 address", actual: 6 }));
    }

    #[test]
    fn test_bin_underflow() {
        let mut b: &[u8] = &[MP_BIN8, 5, 1, 2];
        assert!(is_format_error(&b.mp_get_bin().unwrap_err()));
    }

    #[rstest]
    #[case::fix(3)]
    #[case::array16(20)]
    fn test_object_header(#[case] n: usize) {
        let mut buf = BytesMut::new();
        buf.mp_put_object_header(n);
        let mut b: &[u8] = &buf;
        assert!(b.mp_get_object(n).is_ok());
    }

    #[test]
    fn test_object_field_count_mismatch() {
        let mut buf = BytesMut::new();
        buf.mp_put_object_header(4);
        let mut b: &[u8] = &buf;
        let err = b.mp_get_object(5).unwrap_err();
        assert_eq!(err.downcast_ref::<FormatError>(), Some(&FormatError::FieldCount { expected: "5".to_string(), actual: 4 }));
    }

    #[test]
    fn test_bool_and_nil() {
        let mut buf = BytesMut::new();
        buf.mp_put_bool(true);
        buf.mp_put_nil();
        buf.mp_put_bool(false);
        let mut b: &[u8] = &buf;
        assert!(b.mp_get_bool().unwrap());
        assert!(b.mp_peek_nil());
        b.mp_get_nil().unwrap();
        assert!(!b.mp_get_bool().unwrap());
    }
}
