//! Content fingerprints for the compile cache

use crate::engine::CompileOptions;
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::fmt;
use std::path::Path;

const DOMAIN_TAG: &[u8] = b"loadstar-compile-cache";
const ROOT_PLACEHOLDER: &[u8] = b"<root>";

/// SHA-256 over the source, engine version and compile options
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Fingerprint a source for the given engine and options.
    ///
    /// With `portable_root` set, absolute paths under that root are rewritten
    /// before hashing so the same project checked out elsewhere produces the
    /// same fingerprint.
    pub fn compute(
        source: &[u8],
        engine_version: &str,
        options: &CompileOptions,
        portable_root: Option<&Path>,
    ) -> Self {
        let source = match portable_root {
            Some(root) => normalize_portable(source, root),
            None => Cow::Borrowed(source),
        };
        // Options serialize infallibly: plain enums and bools
        let options = serde_json::to_vec(options).unwrap_or_default();

        let mut hasher = Sha256::new();
        for field in [
            DOMAIN_TAG,
            &*source,
            engine_version.as_bytes(),
            options.as_slice(),
            &[portable_root.is_some() as u8][..],
        ] {
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field);
        }
        Self(hasher.finalize().into())
    }

    /// Wrap raw digest bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex, used as the entry file name
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64-character hex string
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let bytes: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &self.to_hex()[..12])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Replace every occurrence of `root` (in either separator style) with a
/// placeholder and canonicalize separators in the rest of that path.
fn normalize_portable<'a>(source: &'a [u8], root: &Path) -> Cow<'a, [u8]> {
    let root = root.to_string_lossy();
    let root = root.trim_end_matches(['/', '\\']);
    // A bare "/" or drive letter would match far too much
    if root.len() < 2 {
        return Cow::Borrowed(source);
    }

    let mut variants = vec![
        root.as_bytes().to_vec(),
        root.replace('\\', "/").into_bytes(),
        root.replace('/', "\\").into_bytes(),
    ];
    variants.sort();
    variants.dedup();

    if !variants
        .iter()
        .any(|v| source.windows(v.len()).any(|w| w == v.as_slice()))
    {
        return Cow::Borrowed(source);
    }

    let mut out = Vec::with_capacity(source.len());
    let mut i = 0;
    while i < source.len() {
        let matched = variants
            .iter()
            .find(|v| source[i..].starts_with(v))
            .map(|v| v.len());
        match matched {
            Some(len) => {
                out.extend_from_slice(ROOT_PLACEHOLDER);
                i += len;
                while i < source.len() && !is_path_delimiter(source[i]) {
                    out.push(if source[i] == b'\\' { b'/' } else { source[i] });
                    i += 1;
                }
            }
            None => {
                out.push(source[i]);
                i += 1;
            }
        }
    }
    Cow::Owned(out)
}

fn is_path_delimiter(b: u8) -> bool {
    b.is_ascii_whitespace() || matches!(b, b'"' | b'\'' | b'`' | b'(' | b')' | b',' | b';')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ModuleKind;

    fn opts() -> CompileOptions {
        CompileOptions::default()
    }

    #[test]
    fn test_fingerprint_covers_all_inputs() {
        let base = Fingerprint::compute(b"x = 1", "1.0", &opts(), None);
        assert_eq!(base, Fingerprint::compute(b"x = 1", "1.0", &opts(), None));
        assert_ne!(base, Fingerprint::compute(b"x = 2", "1.0", &opts(), None));
        assert_ne!(base, Fingerprint::compute(b"x = 1", "1.1", &opts(), None));
        assert_ne!(
            base,
            Fingerprint::compute(b"x = 1", "1.0", &CompileOptions::for_kind(ModuleKind::Esm), None)
        );
    }

    #[test]
    fn test_field_boundaries_do_not_collide() {
        let a = Fingerprint::compute(b"ab", "c", &opts(), None);
        let b = Fingerprint::compute(b"a", "bc", &opts(), None);
        assert_ne!(a, b);
    }

    #[test]
    fn test_portable_ignores_checkout_location() {
        let one = Fingerprint::compute(
            b"load('/home/alice/proj/lib/a.js')",
            "1.0",
            &opts(),
            Some(Path::new("/home/alice/proj")),
        );
        let two = Fingerprint::compute(
            b"load('/srv/build/proj/lib/a.js')",
            "1.0",
            &opts(),
            Some(Path::new("/srv/build/proj/")),
        );
        assert_eq!(one, two);

        let non_portable = Fingerprint::compute(b"load('/home/alice/proj/lib/a.js')", "1.0", &opts(), None);
        assert_ne!(one, non_portable);
    }

    #[test]
    fn test_portable_canonicalizes_separators_under_root() {
        let normalized = normalize_portable(br#"p = "C:\work\app\src\x.js"; s = "a\nb""#, Path::new(r"C:\work\app"));
        assert_eq!(&*normalized, &br#"p = "<root>/src/x.js"; s = "a\nb""#[..]);
    }

    #[test]
    fn test_hex_round_trip() {
        let fp = Fingerprint::compute(b"", "v", &opts(), None);
        assert_eq!(fp.to_hex().len(), 64);
        assert_eq!(Fingerprint::from_hex(&fp.to_hex()), Some(fp));
        assert_eq!(Fingerprint::from_hex("zz"), None);
        assert_eq!(Fingerprint::from_hex("abcd"), None);
    }
}
