// src/fetch/archive.rs

//! Source archive unpacking

use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::debug;
use xz2::read::XzDecoder;

/// Kinds of source files the fetcher understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar,
    TarGz,
    TarXz,
    TarZst,
    /// Not an archive: the file itself is the source (a script, a patch)
    Plain,
}

impl ArchiveFormat {
    /// Detect the format from a file name or URL
    pub fn from_name(name: &str) -> Self {
        let name = name.to_ascii_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Self::TarGz
        } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
            Self::TarXz
        } else if name.ends_with(".tar.zst") || name.ends_with(".tar.zstd") {
            Self::TarZst
        } else if name.ends_with(".tar") {
            Self::Tar
        } else {
            Self::Plain
        }
    }
}

/// Unpack `archive` into `dest` and return the source root
///
/// Tarballs conventionally wrap their tree in one top-level directory;
/// when that is all the archive contains, that directory is the root.
pub fn unpack(archive: &Path, file_name: &str, dest: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dest)?;
    let format = ArchiveFormat::from_name(file_name);
    debug!("Unpacking {} ({:?}) into {}", archive.display(), format, dest.display());

    let file = BufReader::new(File::open(archive)?);
    match format {
        ArchiveFormat::Tar => unpack_tar(file, dest)?,
        ArchiveFormat::TarGz => unpack_tar(GzDecoder::new(file), dest)?,
        ArchiveFormat::TarXz => unpack_tar(XzDecoder::new(file), dest)?,
        ArchiveFormat::TarZst => unpack_tar(zstd::stream::read::Decoder::new(file)?, dest)?,
        ArchiveFormat::Plain => {
            if file_name.is_empty() || file_name.contains('/') {
                return Err(Error::InvalidPath(format!(
                    "cannot stage source file named '{}'",
                    file_name
                )));
            }
            fs::copy(archive, dest.join(file_name))?;
            return Ok(dest.to_path_buf());
        }
    }

    Ok(source_root(dest)?)
}

fn unpack_tar<R: Read>(reader: R, dest: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    // Entries with absolute paths or `..` components are skipped by tar
    archive.unpack(dest)?;
    Ok(())
}

fn source_root(dest: &Path) -> std::io::Result<PathBuf> {
    let entries: Vec<_> = fs::read_dir(dest)?.filter_map(|e| e.ok()).collect();
    if entries.len() == 1 && entries[0].file_type().map(|t| t.is_dir()).unwrap_or(false) {
        return Ok(entries[0].path());
    }
    Ok(dest.to_path_buf())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;
    use tempfile::TempDir;

    /// Write a gzipped tarball containing `files` under `top/`
    pub(crate) fn make_tarball(path: &Path, top: &str, files: &[(&str, &str)]) {
        let file = File::create(path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder
                .append_data(&mut header, format!("{}/{}", top, name), contents.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap().flush().unwrap();
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(ArchiveFormat::from_name("git-1.7.tar.gz"), ArchiveFormat::TarGz);
        assert_eq!(ArchiveFormat::from_name("x.TGZ"), ArchiveFormat::TarGz);
        assert_eq!(ArchiveFormat::from_name("x.tar.xz"), ArchiveFormat::TarXz);
        assert_eq!(ArchiveFormat::from_name("x.tar.zst"), ArchiveFormat::TarZst);
        assert_eq!(ArchiveFormat::from_name("x.tar"), ArchiveFormat::Tar);
        assert_eq!(ArchiveFormat::from_name("install.sh"), ArchiveFormat::Plain);
    }

    #[test]
    fn test_unpack_enters_single_top_level_directory() {
        let dir = TempDir::new().unwrap();
        let tarball = dir.path().join("hello-1.0.tar.gz");
        make_tarball(&tarball, "hello-1.0", &[("configure", "#!/bin/sh\n"), ("src/main.c", "int main;")]);

        let root = unpack(&tarball, "hello-1.0.tar.gz", &dir.path().join("out")).unwrap();
        assert_eq!(root, dir.path().join("out/hello-1.0"));
        assert!(root.join("configure").is_file());
        assert!(root.join("src/main.c").is_file());
    }

    #[test]
    fn test_unpack_plain_file_is_copied() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("install.sh");
        fs::write(&script, "echo hi").unwrap();

        let root = unpack(&script, "install.sh", &dir.path().join("out")).unwrap();
        assert_eq!(fs::read_to_string(root.join("install.sh")).unwrap(), "echo hi");
    }

    #[test]
    fn test_unpack_corrupt_archive_fails() {
        let dir = TempDir::new().unwrap();
        let bogus = dir.path().join("broken.tar.gz");
        fs::write(&bogus, "definitely not gzip").unwrap();

        assert!(unpack(&bogus, "broken.tar.gz", &dir.path().join("out")).is_err());
    }
}
