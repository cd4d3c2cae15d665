//! Content fingerprinting: per-chunk digests and the folded whole-file digest.
//!
//! Both sides of the protocol use the same streaming MD5. The whole-file
//! digest is a *hash of chunk hashes*: each chunk's hex digest is fed, in
//! chunk-index order, into a fresh context. Server-side deduplication keys on
//! this composition, so it must never be replaced by a raw-bytes hash.

use md5::Context;

/// Length of a hex-encoded digest.
pub const DIGEST_HEX_LEN: usize = 32;

/// Digest a contiguous byte range in one shot.
pub fn digest_bytes(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// Fold per-chunk digests (in chunk-index order) into the whole-file digest.
///
/// Consumes the hex string bytes of each digest, not the raw digest bytes.
pub fn fold_digests<I, S>(digests: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut ctx = Context::new();
    for digest in digests {
        ctx.consume(digest.as_ref().as_bytes());
    }
    format!("{:x}", ctx.compute())
}

/// Incremental digester for data that arrives in pieces.
pub struct Digester {
    ctx: Context,
}

impl Digester {
    pub fn new() -> Self {
        Self {
            ctx: Context::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.ctx.consume(data);
    }

    pub fn finish(self) -> String {
        format!("{:x}", self.ctx.compute())
    }
}

impl Default for Digester {
    fn default() -> Self {
        Self::new()
    }
}

/// Check that a string is a well-formed lowercase hex digest.
///
/// Digests name files inside the chunk store, so anything that fails this
/// check must be rejected before it reaches a path join.
pub fn is_valid_digest(s: &str) -> bool {
    s.len() == DIGEST_HEX_LEN
        && s.bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_known_vectors() {
        assert_eq!(digest_bytes(b""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(
            digest_bytes(b"hello world"),
            "5eb63bbbe01eeed093cb22bb8f5acdc3"
        );
    }

    #[test]
    fn digester_matches_one_shot() {
        let mut d = Digester::new();
        d.update(b"hello ");
        d.update(b"world");
        assert_eq!(d.finish(), digest_bytes(b"hello world"));
    }

    #[test]
    fn fold_is_order_sensitive() {
        let a = digest_bytes(b"first");
        let b = digest_bytes(b"second");
        assert_ne!(fold_digests([&a, &b]), fold_digests([&b, &a]));
    }

    #[test]
    fn fold_consumes_hex_strings() {
        let a = digest_bytes(b"first");
        let expected = digest_bytes(a.as_bytes());
        assert_eq!(fold_digests([&a]), expected);
    }

    #[test]
    fn valid_digest_format() {
        assert!(is_valid_digest("d41d8cd98f00b204e9800998ecf8427e"));
        assert!(!is_valid_digest("D41D8CD98F00B204E9800998ECF8427E"));
        assert!(!is_valid_digest("d41d8cd9"));
        assert!(!is_valid_digest("../../../../etc/passwd-padding-xx"));
    }
}
