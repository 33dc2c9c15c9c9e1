//! SHA-512 digests of the produced files and the checksum manifest.
use sha2::{Digest, Sha512};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;
use tracing::{error, info};

/// The digest algorithm label written to the metadata. Changing the
/// algorithm means changing this label and the metadata format version.
pub const CHECKSUM_TYPE: &str = "SHA-512";

// Use a 1 MiB buffer so memory use does not depend on the image size.
const BUFFER_SIZE: usize = 1024 * 1024;

/// Digests of all output files of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChecksumSet {
    /// `(file name, hex digest)` in directory enumeration order.
    entries: Vec<(String, String)>,
    /// Whether the manifest file was written.
    pub persisted: bool,
}

impl ChecksumSet {
    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    pub fn get(&self, file_name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(name, _)| name == file_name)
            .map(|(_, digest)| digest.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The digests keyed by file name, as embedded in the metadata.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.entries.iter().cloned().collect()
    }

    /// Manifest text: one `<digest> <file name>` line per file.
    pub fn manifest(&self) -> String {
        self.entries
            .iter()
            .map(|(name, digest)| format!("{digest} {name}\n"))
            .collect()
    }
}

/// Hex-encoded SHA-512 of a file, read in fixed-size chunks.
pub fn sha512_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha512::new();
    let mut buf = vec![0u8; BUFFER_SIZE];

    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Whether `file_name` ends in `.<extension>` and has something before it.
/// `extension` may itself contain dots, as in `tar.gz`.
pub fn has_extension(file_name: &str, extension: &str) -> bool {
    file_name
        .strip_suffix(extension)
        .and_then(|stem| stem.strip_suffix('.'))
        .is_some_and(|stem| !stem.is_empty())
}

/// Computes digests for every regular file in `dir` (not recursive) whose
/// name ends in `.<extension>`, and writes the manifest to
/// `manifest_path`.
///
/// A manifest that cannot be written is reported through
/// [`ChecksumSet::persisted`]; the digests are returned either way so they
/// can still go into the metadata. Files that cannot be read are logged and
/// left out.
pub fn checksum_directory(dir: &Path, extension: &str, manifest_path: &Path) -> ChecksumSet {
    let mut set = ChecksumSet::default();

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            error!("cannot list {}: {e}", dir.display());
            return set;
        }
    };

    for entry in entries.filter_map(Result::ok) {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if !path.is_file() || !has_extension(&name, extension) {
            continue;
        }

        match sha512_file(&path) {
            Ok(digest) => {
                info!("{CHECKSUM_TYPE} {name}: {digest}");
                set.entries.push((name, digest));
            }
            Err(e) => error!("cannot checksum {}: {e}", path.display()),
        }
    }

    set.persisted = match write_manifest(&set, manifest_path) {
        Ok(()) => true,
        Err(e) => {
            error!("error writing checksum file {}: {e}", manifest_path.display());
            false
        }
    };

    set
}

fn write_manifest(set: &ChecksumSet, path: &Path) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    out.write_all(set.manifest().as_bytes())?;
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    // SHA-512 of the empty string.
    const EMPTY_SHA512: &str = "cf83e1357eefb8bdf1542850d66d8007d620e4050b5715dc83f4a921d36ce9ce47d0d13c5d85f2b0ff8318d2877eec2f63b931bd47417a81a538327af927da3e";
    // SHA-512 of "abc" (FIPS 180-2 example).
    const ABC_SHA512: &str = "ddaf35a193617abacc417349ae20413112e6fa4e89a97ea20a9eeee64b55d39a2192992a274fc1a836ba3c23a3feebbd454d4423643ce80e2a9ac94fa54ca49f";

    #[test]
    fn known_digests() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("empty.img"), b"").unwrap();
        fs::write(dir.path().join("abc.img"), b"abc").unwrap();

        assert_eq!(sha512_file(&dir.path().join("empty.img")).unwrap(), EMPTY_SHA512);
        assert_eq!(sha512_file(&dir.path().join("abc.img")).unwrap(), ABC_SHA512);
    }

    #[test]
    fn digest_spans_chunk_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..BUFFER_SIZE * 2 + 17).map(|i| (i % 251) as u8).collect();
        let path = dir.path().join("big.img");
        fs::write(&path, &data).unwrap();

        let expected = format!("{:x}", Sha512::digest(&data));
        assert_eq!(sha512_file(&path).unwrap(), expected);
    }

    #[test]
    fn only_matching_extension_is_checksummed() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("disc.img"), b"abc").unwrap();
        fs::write(dir.path().join("disc.map"), b"# map").unwrap();
        fs::write(dir.path().join("imgr.log"), b"log").unwrap();
        fs::create_dir(dir.path().join("sub.img")).unwrap();
        let manifest = dir.path().join("checksums.sha512");

        let set = checksum_directory(dir.path(), "img", &manifest);

        assert!(set.persisted);
        assert_eq!(set.len(), 1);
        assert_eq!(set.get("disc.img"), Some(ABC_SHA512));
        assert_eq!(
            fs::read_to_string(&manifest).unwrap(),
            format!("{ABC_SHA512} disc.img\n")
        );
    }

    #[test]
    fn extensions_match_whole_suffixes() {
        assert!(has_extension("disc.img", "img"));
        assert!(has_extension("disc.tar.gz", "tar.gz"));
        assert!(!has_extension("disc.gz", "tar.gz"));
        assert!(!has_extension("discimg", "img"));
        assert!(!has_extension(".img", "img"));
        assert!(!has_extension("disc.img.part", "img"));
    }

    #[test]
    fn multi_dot_extension_is_checksummed() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("disc.tar.gz"), b"abc").unwrap();
        fs::write(dir.path().join("other.gz"), b"abc").unwrap();
        let manifest = dir.path().join("checksums.sha512");

        let set = checksum_directory(dir.path(), "tar.gz", &manifest);

        assert_eq!(set.len(), 1);
        assert_eq!(set.get("disc.tar.gz"), Some(ABC_SHA512));
    }

    #[test]
    fn manifest_is_identical_across_runs() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            fs::write(dir.path().join(format!("part{i}.img")), vec![i as u8; 100]).unwrap();
        }
        let manifest = dir.path().join("checksums.sha512");

        checksum_directory(dir.path(), "img", &manifest);
        let first = fs::read(&manifest).unwrap();
        checksum_directory(dir.path(), "img", &manifest);
        let second = fs::read(&manifest).unwrap();

        assert_eq!(first, second);
        assert_eq!(String::from_utf8(first).unwrap().lines().count(), 5);
    }

    #[test]
    fn unwritable_manifest_still_returns_digests() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("disc.img"), b"abc").unwrap();
        let manifest = dir.path().join("missing-subdir").join("checksums.sha512");

        let set = checksum_directory(dir.path(), "img", &manifest);

        assert!(!set.persisted);
        assert_eq!(set.to_map().get("disc.img").map(String::as_str), Some(ABC_SHA512));
    }
}
