//! gzip and tar.gz payloads for archive entries.
//!
//! Gzip output carries a zero mtime and no file name so identical input
//! compresses to identical bytes. Directories are tarred under one top-level
//! component, which [`extract_tar_gz`] strips again.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::{Compression, GzBuilder};

pub fn gzip_reader<R: Read>(mut reader: R) -> io::Result<Vec<u8>> {
    let mut encoder = GzBuilder::new().write(Vec::new(), Compression::default());
    io::copy(&mut reader, &mut encoder)?;
    encoder.finish()
}

pub fn gzip_bytes(data: &[u8]) -> io::Result<Vec<u8>> {
    gzip_reader(data)
}

/// Stream a file through gzip.
pub fn gzip_file(path: &Path) -> io::Result<Vec<u8>> {
    gzip_reader(File::open(path)?)
}

/// tar.gz a directory with its contents under `top` inside the archive.
pub fn tar_gz_dir(src: &Path, top: &str) -> io::Result<Vec<u8>> {
    let encoder = GzBuilder::new().write(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder.append_dir_all(top, src)?;
    builder.into_inner()?.finish()
}

pub fn gunzip(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

pub fn gunzip_to(data: &[u8], dest: &Path) -> io::Result<()> {
    let mut file = File::create(dest)?;
    io::copy(&mut GzDecoder::new(data), &mut file)?;
    file.flush()
}

/// Drop the first path component; `None` for the top-level entry itself or
/// for anything that would escape the destination.
fn strip_first_component(path: &Path) -> Option<PathBuf> {
    let mut components = path.components();
    components.next()?;
    let mut rest = PathBuf::new();
    for c in components {
        match c {
            Component::Normal(part) => rest.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    (!rest.as_os_str().is_empty()).then_some(rest)
}

/// Extract a tar.gz into `dest`, stripping one leading component.
///
/// Returns the number of entries written.
pub fn extract_tar_gz(data: &[u8], dest: &Path) -> io::Result<usize> {
    std::fs::create_dir_all(dest)?;
    let mut archive = tar::Archive::new(GzDecoder::new(data));
    let mut count = 0;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let Some(relative) = strip_first_component(&path) else {
            continue;
        };
        let target = dest.join(&relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry.unpack(&target)?;
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn gzip_is_deterministic() {
        let a = gzip_bytes(b"port=8080\n").unwrap();
        let b = gzip_bytes(b"port=8080\n").unwrap();
        assert_eq!(a, b);
        assert_eq!(gunzip(&a).unwrap(), b"port=8080\n");
    }

    #[test]
    fn tar_strips_the_top_component() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("css")).unwrap();
        std::fs::write(src.path().join("index.html"), "<h1>hi</h1>").unwrap();
        std::fs::write(src.path().join("css/site.css"), "body{}").unwrap();

        let payload = tar_gz_dir(src.path(), "static").unwrap();
        let out = tempfile::tempdir().unwrap();
        extract_tar_gz(&payload, out.path()).unwrap();

        assert_eq!(
            std::fs::read_to_string(out.path().join("index.html")).unwrap(),
            "<h1>hi</h1>"
        );
        assert_eq!(
            std::fs::read_to_string(out.path().join("css/site.css")).unwrap(),
            "body{}"
        );
        assert!(!out.path().join("static").exists());
    }

    #[test]
    fn strip_rejects_parent_components() {
        assert_eq!(strip_first_component(Path::new("top")), None);
        assert_eq!(
            strip_first_component(Path::new("top/a/b")),
            Some(PathBuf::from("a/b"))
        );
        assert_eq!(strip_first_component(Path::new("top/../etc")), None);
    }

    proptest! {
        #[test]
        fn gunzip_inverts_gzip(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let packed = gzip_bytes(&data).unwrap();
            prop_assert_eq!(gunzip(&packed).unwrap(), data);
        }
    }
}
