//! Archive extraction module
//!
//! Unpacks tar.gz, tar.zst, tar and zip source archives into a build
//! directory. Anything else is treated as a single file and copied as-is.

use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use thiserror::Error;
use zip::ZipArchive;
use zstd::stream::Decoder as ZstdDecoder;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Archive error: {0}")]
    Archive(String),
}

/// Source artifact format, detected from the file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactFormat {
    TarGz,
    TarZst,
    Tar,
    Zip,
    Plain,
}

/// Detect archive format from file extension
pub fn detect_format(path: &Path) -> ArtifactFormat {
    let path_str = path.to_string_lossy().to_lowercase();

    if path_str.ends_with(".tar.zst") || path_str.ends_with(".tzst") {
        ArtifactFormat::TarZst
    } else if path_str.ends_with(".tar.gz") || path_str.ends_with(".tgz") {
        ArtifactFormat::TarGz
    } else if path_str.ends_with(".tar") {
        ArtifactFormat::Tar
    } else if path_str.ends_with(".zip") {
        ArtifactFormat::Zip
    } else {
        ArtifactFormat::Plain
    }
}

/// Extract `archive_path` into `dest_dir` and return the source root: the
/// single top-level directory when the archive has exactly one, otherwise
/// `dest_dir` itself.
///
/// `name_hint` is the original file name, used for format detection since
/// cached artifacts carry a digest prefix.
///
/// # Errors
///
/// Returns an error if the archive is corrupt or contains paths escaping
/// `dest_dir`.
pub fn unpack_source(
    archive_path: &Path,
    name_hint: &str,
    dest_dir: &Path,
) -> Result<PathBuf, ExtractError> {
    fs::create_dir_all(dest_dir)?;
    match detect_format(Path::new(name_hint)) {
        ArtifactFormat::TarZst => {
            let reader = BufReader::new(File::open(archive_path)?);
            extract_tar(ZstdDecoder::new(reader)?, dest_dir)?;
        }
        ArtifactFormat::TarGz => {
            let reader = BufReader::new(File::open(archive_path)?);
            extract_tar(flate2::read::GzDecoder::new(reader), dest_dir)?;
        }
        ArtifactFormat::Tar => {
            extract_tar(BufReader::new(File::open(archive_path)?), dest_dir)?;
        }
        ArtifactFormat::Zip => extract_zip(archive_path, dest_dir)?,
        ArtifactFormat::Plain => {
            let filename = Path::new(name_hint)
                .file_name()
                .ok_or_else(|| ExtractError::Archive("Invalid filename".to_string()))?;
            fs::copy(archive_path, dest_dir.join(filename))?;
            return Ok(dest_dir.to_path_buf());
        }
    }
    source_root(dest_dir)
}

/// Descend into the only entry of `dir` when it is a directory.
fn source_root(dir: &Path) -> Result<PathBuf, ExtractError> {
    let entries: Vec<_> = fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    if let [only] = entries.as_slice() {
        if only.file_type()?.is_dir() {
            return Ok(only.path());
        }
    }
    Ok(dir.to_path_buf())
}

/// Extract a tar archive from a reader
fn extract_tar<R: Read>(reader: R, dest_dir: &Path) -> Result<(), ExtractError> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let relative_path: PathBuf = entry.path()?.components().collect();

        // Sanitize path to prevent Zip Slip
        if relative_path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir | std::path::Component::RootDir))
        {
            return Err(ExtractError::Archive(format!(
                "Invalid path in archive: {}",
                relative_path.display()
            )));
        }

        if !entry.unpack_in(dest_dir)? {
            return Err(ExtractError::Archive(format!(
                "Refusing to unpack outside destination: {}",
                relative_path.display()
            )));
        }
    }

    Ok(())
}

/// Extract a zip archive
fn extract_zip(archive_path: &Path, dest_dir: &Path) -> Result<(), ExtractError> {
    let file = File::open(archive_path)?;
    let mut archive = ZipArchive::new(file).map_err(|e| ExtractError::Archive(e.to_string()))?;

    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| ExtractError::Archive(e.to_string()))?;
        let Some(relative_path) = file.enclosed_name() else {
            continue;
        };

        let absolute_path = dest_dir.join(&relative_path);
        if file.is_dir() {
            fs::create_dir_all(&absolute_path)?;
            continue;
        }
        if let Some(p) = absolute_path.parent() {
            fs::create_dir_all(p)?;
        }

        let mut outfile = File::create(&absolute_path)?;
        io::copy(&mut file, &mut outfile)?;

        #[cfg(unix)]
        if let Some(mode) = file.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&absolute_path, fs::Permissions::from_mode(mode))?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tar_gz(path: &Path, files: &[(&str, &str)]) {
        let file = File::create(path).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, body) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, name, body.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn test_detect_format() {
        assert_eq!(detect_format(Path::new("a.tar.gz")), ArtifactFormat::TarGz);
        assert_eq!(detect_format(Path::new("a.TGZ")), ArtifactFormat::TarGz);
        assert_eq!(detect_format(Path::new("a.tar.zst")), ArtifactFormat::TarZst);
        assert_eq!(detect_format(Path::new("a.zip")), ArtifactFormat::Zip);
        assert_eq!(detect_format(Path::new("a.sh")), ArtifactFormat::Plain);
    }

    #[test]
    fn test_single_top_level_dir_is_source_root() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("redis-5.0.14.tar.gz");
        write_tar_gz(
            &archive,
            &[
                ("redis-5.0.14/Makefile", "all:\n"),
                ("redis-5.0.14/src/server.c", "int main(){}\n"),
            ],
        );

        let dest = tmp.path().join("work");
        let root = unpack_source(&archive, "redis-5.0.14.tar.gz", &dest).unwrap();
        assert_eq!(root, dest.join("redis-5.0.14"));
        assert!(root.join("src/server.c").exists());
    }

    #[test]
    fn test_flat_archive_root_is_dest() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("flat.tar.gz");
        write_tar_gz(&archive, &[("a.txt", "a"), ("b.txt", "b")]);

        let dest = tmp.path().join("work");
        let root = unpack_source(&archive, "flat.tar.gz", &dest).unwrap();
        assert_eq!(root, dest);
    }

    #[test]
    fn test_plain_file_is_copied() {
        let tmp = tempfile::tempdir().unwrap();
        let cached = tmp.path().join("abc--install.sh");
        File::create(&cached)
            .unwrap()
            .write_all(b"#!/bin/sh\n")
            .unwrap();

        let dest = tmp.path().join("work");
        let root = unpack_source(&cached, "install.sh", &dest).unwrap();
        assert_eq!(root, dest);
        assert!(dest.join("install.sh").exists());
    }
}
