//! Server-side statement and portal names, and the per-connection
//! prepared-statement cache.
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU16, Ordering};

use lru::LruCache;

use crate::protocol::Oid;
use crate::row::RowDescription;

#[derive(Clone, PartialEq, Eq)]
pub struct Id([u8; 6]);

impl Id {
    pub(crate) fn unnamed() -> Self {
        Self([b'?'; 6])
    }

    pub(crate) fn next(prefix: u8, atomic: &AtomicU16) -> Self {
        let id = atomic.fetch_add(1, Ordering::SeqCst);
        let mut buf = [prefix, b'0', b'0', b'0', b'0', b'0'];
        let len = buf.len();

        let mut b = itoa::Buffer::new();
        let id = b.format(id);
        let i = id.as_bytes();
        buf[len - i.len()..].copy_from_slice(i);

        Self(buf)
    }

    pub fn as_str(&self) -> &str {
        if self.is_unnamed() {
            return "";
        }
        // SAFETY: string only construction and is immutable
        unsafe { std::str::from_utf8_unchecked(&self.0[..]) }
    }

    pub fn is_unnamed(&self) -> bool {
        self.0[0] == b'?'
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Debug for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_tuple("Id").field(&self.as_str()).finish()
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

macro_rules! delegate {
    ($name:ident, $prefix:literal) => {
        #[derive(Clone, PartialEq, Eq)]
        pub struct $name(Id);

        impl $name {
            pub(crate) fn unnamed() -> Self {
                Self(Id::unnamed())
            }

            pub(crate) fn next() -> Self {
                static ID: AtomicU16 = AtomicU16::new(0);
                Self(Id::next($prefix, &ID))
            }
        }

        impl std::ops::Deref for $name {
            type Target = Id;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.debug_tuple(stringify!($name)).field(&self.as_str()).finish()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

delegate!(StatementName, b's');
delegate!(PortalName, b'p');

/// A prepared statement tracked by the cache.
///
/// `name` is `None` while the statement still runs through the unnamed
/// one-shot path; promotion fills it in.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub name: Option<StatementName>,
    /// Uses of this SQL text so far, including the current one.
    pub uses: u32,
    /// Parameter oids declared at Parse time.
    pub param_oids: Vec<Oid>,
    /// Result shape from the statement's first Describe, once known.
    pub row_desc: Option<RowDescription>,
}

/// Outcome of a cache lookup: how this execution should address the server.
#[derive(Debug)]
pub enum Prepared {
    /// Statement is named and parsed on the server; Bind directly to it.
    Cached(StatementName),
    /// Parse a named statement this time and cache it.
    Promote(StatementName),
    /// Parse the unnamed statement, one-shot.
    OneShot,
}

/// Bounded per-connection prepared-statement cache with use counting.
///
/// A SQL text is promoted to a named server-side statement once its use
/// count reaches the prepare threshold. Eviction hands the victim's name
/// back so the connection can issue a lazy `Close`.
pub struct StatementCache {
    stmts: LruCache<u64, PreparedStatement>,
    threshold: u32,
}

impl std::fmt::Debug for StatementCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatementCache")
            .field("len", &self.stmts.len())
            .field("threshold", &self.threshold)
            .finish()
    }
}

impl StatementCache {
    pub fn new(capacity: NonZeroUsize, threshold: u32) -> Self {
        Self { stmts: LruCache::new(capacity), threshold }
    }

    /// Record one use of `sqlid` and decide how to execute it.
    ///
    /// Returns the decision and, on insertion overflow, the evicted
    /// statement whose server-side name must be closed.
    pub fn acquire(&mut self, sqlid: u64, param_oids: &[Oid]) -> (Prepared, Option<StatementName>) {
        if let Some(entry) = self.stmts.get_mut(&sqlid) {
            entry.uses = entry.uses.saturating_add(1);
            if let Some(name) = &entry.name {
                return (Prepared::Cached(name.clone()), None);
            }
            if self.threshold != 0 && entry.uses >= self.threshold {
                let name = StatementName::next();
                entry.name = Some(name.clone());
                return (Prepared::Promote(name), None);
            }
            return (Prepared::OneShot, None);
        }

        let mut entry = PreparedStatement {
            name: None,
            uses: 1,
            param_oids: param_oids.to_vec(),
            row_desc: None,
        };

        // threshold 1 promotes on first use; 0 disables promotion entirely
        let decision = if self.threshold == 1 {
            let name = StatementName::next();
            entry.name = Some(name.clone());
            Prepared::Promote(name)
        } else {
            Prepared::OneShot
        };

        let evicted = self
            .stmts
            .push(sqlid, entry)
            .and_then(|(_, victim)| victim.name);

        (decision, evicted)
    }

    /// Name a statement unconditionally, bypassing the threshold. Used by
    /// explicit prepare. Returns the name and any evicted victim to close.
    pub fn force_promote(&mut self, sqlid: u64) -> (StatementName, Option<StatementName>) {
        if let Some(entry) = self.stmts.get_mut(&sqlid) {
            if let Some(name) = &entry.name {
                return (name.clone(), None);
            }
            let name = StatementName::next();
            entry.name = Some(name.clone());
            return (name, None);
        }

        let name = StatementName::next();
        let entry = PreparedStatement {
            name: Some(name.clone()),
            uses: 1,
            param_oids: Vec::new(),
            row_desc: None,
        };
        let evicted = self.stmts.push(sqlid, entry).and_then(|(_, victim)| victim.name);
        (name, evicted)
    }

    /// Drop a cached statement, e.g. after the server reported it missing.
    pub fn forget(&mut self, sqlid: u64) {
        self.stmts.pop(&sqlid);
    }

    pub fn get(&mut self, sqlid: u64) -> Option<&PreparedStatement> {
        self.stmts.get(&sqlid)
    }

    /// Attach the described result shape to a cached statement.
    pub fn set_row_desc(&mut self, sqlid: u64, desc: RowDescription) {
        if let Some(entry) = self.stmts.get_mut(&sqlid) {
            entry.row_desc = Some(desc);
        }
    }

    pub fn len(&self) -> usize {
        self.stmts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stmts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(capacity: usize, threshold: u32) -> StatementCache {
        StatementCache::new(NonZeroUsize::new(capacity).unwrap(), threshold)
    }

    #[test]
    fn names_are_distinct_and_displayable() {
        let a = StatementName::next();
        let b = StatementName::next();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with('s'));
        assert_eq!(StatementName::unnamed().as_str(), "");
        assert!(PortalName::next().as_str().starts_with('p'));
    }

    #[test]
    fn promotes_at_threshold() {
        let mut cache = cache(8, 2);
        let (first, _) = cache.acquire(1, &[]);
        assert!(matches!(first, Prepared::OneShot));
        let (second, _) = cache.acquire(1, &[]);
        assert!(matches!(second, Prepared::Promote(_)));
        let (third, _) = cache.acquire(1, &[]);
        assert!(matches!(third, Prepared::Cached(_)));
    }

    #[test]
    fn threshold_one_promotes_immediately() {
        let mut cache = cache(8, 1);
        let (first, _) = cache.acquire(7, &[]);
        assert!(matches!(first, Prepared::Promote(_)));
        let (second, _) = cache.acquire(7, &[]);
        assert!(matches!(second, Prepared::Cached(_)));
    }

    #[test]
    fn threshold_zero_never_promotes() {
        let mut cache = cache(8, 0);
        for _ in 0..10 {
            let (decision, _) = cache.acquire(3, &[]);
            assert!(matches!(decision, Prepared::OneShot));
        }
    }

    #[test]
    fn eviction_returns_named_victim() {
        let mut cache = cache(2, 1);
        let (_, none) = cache.acquire(1, &[]);
        assert!(none.is_none());
        let (_, none) = cache.acquire(2, &[]);
        assert!(none.is_none());
        // 1 is now the least recently used entry
        let (_, evicted) = cache.acquire(3, &[]);
        assert!(evicted.is_some());
        assert!(cache.get(1).is_none());
        assert!(cache.get(2).is_some());
    }
}
