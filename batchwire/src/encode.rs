//! Parameter value encoding.
use bytes::Buf;

use crate::{
    ext::BindParams,
    protocol::{Oid, PgType},
    value::ValueRef,
};

/// Value that can be encoded to be bound to sql parameter.
pub trait Encode<'q> {
    fn encode(self) -> Encoded<'q>;
}

/// Postgres encoded value.
#[derive(Debug, Clone)]
pub struct Encoded<'q> {
    value: ValueRef<'q>,
    is_null: bool,
    oid: Oid,
}

impl<'q> Encoded<'q> {
    pub(crate) fn null(oid: Oid) -> Self {
        Self { value: ValueRef::Slice(&[]), oid, is_null: true }
    }

    pub(crate) fn value(&self) -> &ValueRef<'q> {
        &self.value
    }

    pub fn oid(&self) -> Oid {
        self.oid
    }
}

impl Buf for Encoded<'_> {
    fn remaining(&self) -> usize {
        self.value.remaining()
    }

    fn chunk(&self) -> &[u8] {
        self.value.chunk()
    }

    fn advance(&mut self, cnt: usize) {
        self.value.advance(cnt);
    }
}

impl BindParams for Encoded<'_> {
    fn size(&self) -> i32 {
        match self.is_null {
            true => -1,
            false => self.remaining().try_into().expect("parameter value too large for protocol"),
        }
    }
}

macro_rules! encode {
    (<$lf:tt>$ty:ty) => {
        impl<$lf> Encode<$lf> for &$lf $ty {
            fn encode(self) -> Encoded<$lf> {
                Encoded { value: self.into(), oid: <$ty>::OID, is_null: false }
            }
        }
    };
    ($ty:ty) => {
        impl Encode<'static> for $ty {
            fn encode(self) -> Encoded<'static> {
                Encoded { value: self.into(), oid: Self::OID, is_null: false }
            }
        }
    };
}

encode!(bool);
encode!(i16);
encode!(i32);
encode!(i64);
encode!(String);
encode!(<'a> str);
encode!(<'a> String);

impl<'q, T> Encode<'q> for Option<T>
where
    T: Encode<'q> + PgType,
{
    fn encode(self) -> Encoded<'q> {
        match self {
            Some(value) => value.encode(),
            None => Encoded::null(T::OID),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_encodes_as_negative_size() {
        let encoded = Option::<i32>::None.encode();
        assert_eq!(encoded.size(), -1);
        assert_eq!(encoded.oid(), 23);
    }

    #[test]
    fn int_encodes_big_endian() {
        let encoded = 7i32.encode();
        assert_eq!(encoded.size(), 4);
        assert_eq!(encoded.chunk(), &7i32.to_be_bytes()[..]);
    }

    #[test]
    fn str_encodes_borrowed() {
        let encoded = "waffles".encode();
        assert_eq!(encoded.size(), 7);
        assert_eq!(encoded.chunk(), b"waffles");
    }
}
