use std::fmt::{Debug, Display, Formatter};

use bytes::{Buf, BufMut};
use uuid::Uuid;

use crate::util::buf::{MpackBufExt, MpackBufMutExt};

/// Identifies sockets, links, proxies and streams in message envelopes. References are
///  generated locally and compared by value.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Default)]
pub struct Reference(Uuid);

impl Debug for Reference {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.0)
    }
}

impl Display for Reference {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl Reference {
    pub const NULL: Reference = Reference(Uuid::nil());

    pub fn new_random() -> Reference {
        Reference(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Reference {
        Reference(Uuid::from_bytes(bytes))
    }

    pub fn is_null(&self) -> bool {
        self.0.is_nil()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.mp_put_bin(self.0.as_bytes());
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Reference> {
        let raw = buf.mp_get_bin_fixed::<16>("reference")?;
        Ok(Reference::from_bytes(raw))
    }
}

impl From<Uuid> for Reference {
    fn from(value: Uuid) -> Self {
        Reference(value)
    }
}


#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;

    #[test]
    fn test_null() {
        assert!(Reference::NULL.is_null());
        assert!(Reference::default().is_null());
        assert!(!Reference::new_random().is_null());
    }

    #[test]
    fn test_ser_is_bin16() {
        let r = Reference::new_random();
        let mut buf = BytesMut::new();
        r.ser(&mut buf);
        assert_eq!(buf.len(), 18);
        assert_eq!(&buf[..2], &[0xc4, 16]);

        let mut b: &[u8] = &buf;
        assert_eq!(Reference::deser(&mut b).unwrap(), r);
    }
}
