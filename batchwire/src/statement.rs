use std::sync::atomic::{AtomicU16, Ordering};

/// A generated server-side prepared statement name.
///
/// Statement names are process-unique so one connection cache can never
/// collide with another connection preparing the same text.
#[derive(Clone, PartialEq, Eq)]
pub struct StatementName([u8; 6]);

impl StatementName {
    pub(crate) fn next() -> Self {
        static ID: AtomicU16 = AtomicU16::new(0);

        let id = ID.fetch_add(1, Ordering::SeqCst);
        let mut buf = [b'b', b'0', b'0', b'0', b'0', b'0'];
        let len = buf.len();

        let mut b = itoa::Buffer::new();
        let id = b.format(id);
        let i = id.as_bytes();
        buf[len - i.len()..].copy_from_slice(i);

        Self(buf)
    }

    pub fn as_str(&self) -> &str {
        // SAFETY: string only construction and is immutable
        unsafe { std::str::from_utf8_unchecked(&self.0[..]) }
    }
}

impl std::fmt::Display for StatementName {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Debug for StatementName {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_tuple("StatementName").field(&self.as_str()).finish()
    }
}

impl AsRef<str> for StatementName {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::StatementName;

    #[test]
    fn names_are_unique() {
        let a = StatementName::next();
        let b = StatementName::next();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 6);
        assert!(a.as_str().starts_with('b'));
    }
}
