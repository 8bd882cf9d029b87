//! KL-032: Archive extraction (tar, tar.gz, tar.bz2, tar.zst, zip).

use super::{contained, opt_str, str_param, u64_param, Action, ExecContext};
use crate::core::error::ActionError;
use crate::core::types::Params;
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

/// `extract`: unpack `archive` (relative to the work dir) into `dest`,
/// dropping the first `strip_dirs` path components.
#[derive(Debug, Clone, Copy)]
pub struct Extract;

impl Action for Extract {
    fn execute(&self, ctx: &ExecContext, params: &Params) -> Result<(), ActionError> {
        let archive = contained(&ctx.work_dir, str_param(params, "archive")?, "archive")?;
        let dest = match opt_str(params, "dest") {
            None | Some(".") => ctx.work_dir.clone(),
            Some(d) => contained(&ctx.work_dir, d, "dest")?,
        };
        let strip = u64_param(params, "strip_dirs", 0)? as usize;
        let format = match opt_str(params, "format") {
            Some(f) => f.to_string(),
            None => super::composite::infer_archive_format(&archive.to_string_lossy())
                .ok_or_else(|| ActionError::MissingParam {
                    param: "format".into(),
                })?
                .to_string(),
        };
        extract(&archive, &dest, &format, strip)
    }
}

/// Drop the first `strip` normal components; None when nothing remains or
/// the entry tries to escape.
fn strip_components(path: &Path, strip: usize) -> Option<PathBuf> {
    let mut normal = Vec::new();
    for c in path.components() {
        match c {
            Component::Normal(part) => normal.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if normal.len() <= strip {
        return None;
    }
    Some(normal[strip..].iter().collect())
}

fn io_err(context: String) -> impl FnOnce(std::io::Error) -> ActionError {
    move |e| ActionError::io(context, e)
}

/// Extract an archive file into `dest`.
pub fn extract(archive: &Path, dest: &Path, format: &str, strip: usize) -> Result<(), ActionError> {
    std::fs::create_dir_all(dest).map_err(io_err(format!("create {}", dest.display())))?;
    let file = File::open(archive).map_err(io_err(format!("open {}", archive.display())))?;
    let ctx = format!("extract {}", archive.display());
    match format {
        "tar" => extract_tar(file, dest, strip, &ctx),
        "tar.gz" | "tgz" => extract_tar(flate2::read::GzDecoder::new(file), dest, strip, &ctx),
        "tar.bz2" => extract_tar(bzip2::read::BzDecoder::new(file), dest, strip, &ctx),
        "tar.zst" => {
            let decoder = zstd::stream::read::Decoder::new(file).map_err(io_err(ctx.clone()))?;
            extract_tar(decoder, dest, strip, &ctx)
        }
        "zip" => extract_zip(file, dest, strip, &ctx),
        other => Err(ActionError::InvalidParam {
            param: "format".into(),
            reason: format!("unsupported archive format '{}'", other),
        }),
    }
}

fn extract_tar<R: Read>(reader: R, dest: &Path, strip: usize, ctx: &str) -> Result<(), ActionError> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    let entries = archive.entries().map_err(io_err(ctx.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(io_err(ctx.to_string()))?;
        let path = entry.path().map_err(io_err(ctx.to_string()))?.into_owned();
        let Some(rel) = strip_components(&path, strip) else {
            continue;
        };
        let target = dest.join(rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(io_err(format!("create {}", parent.display())))?;
        }
        entry
            .unpack(&target)
            .map_err(io_err(format!("{}: {}", ctx, path.display())))?;
    }
    Ok(())
}

fn extract_zip(file: File, dest: &Path, strip: usize, ctx: &str) -> Result<(), ActionError> {
    let zip_err = |e: zip::result::ZipError| ActionError::io(ctx.to_string(), std::io::Error::other(e));
    let mut archive = zip::ZipArchive::new(file).map_err(zip_err)?;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(zip_err)?;
        let Some(path) = entry.enclosed_name() else {
            continue;
        };
        let Some(rel) = strip_components(&path, strip) else {
            continue;
        };
        let target = dest.join(rel);
        if entry.is_dir() {
            std::fs::create_dir_all(&target).map_err(io_err(format!("create {}", target.display())))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(io_err(format!("create {}", parent.display())))?;
        }
        let mut out =
            File::create(&target).map_err(io_err(format!("create {}", target.display())))?;
        std::io::copy(&mut entry, &mut out).map_err(io_err(format!("write {}", target.display())))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode & 0o7777))
                    .map_err(io_err(format!("chmod {}", target.display())))?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Platform;
    use std::io::Write;

    fn ctx(work: &Path) -> ExecContext {
        ExecContext {
            tool: "t".into(),
            version: "1.0.0".into(),
            platform: Platform::new("linux", "amd64"),
            work_dir: work.to_path_buf(),
            install_dir: work.join("install"),
            search_path: vec![],
        }
    }

    fn build_tar_gz(path: &Path) {
        let file = File::create(path).unwrap();
        let enc = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(enc);
        for (name, body) in [("t-1.0.0/bin/t", "#!/bin/sh\necho t\n"), ("t-1.0.0/README", "hi")] {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, name, body.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn test_kl032_extract_tar_gz_strip() {
        let dir = tempfile::tempdir().unwrap();
        build_tar_gz(&dir.path().join("t.tar.gz"));
        let params: Params = serde_json::from_value(serde_json::json!({
            "archive": "t.tar.gz", "format": "tar.gz", "strip_dirs": 1, "dest": "."
        }))
        .unwrap();
        Extract.execute(&ctx(dir.path()), &params).unwrap();
        assert!(dir.path().join("bin/t").is_file());
        assert_eq!(std::fs::read_to_string(dir.path().join("README")).unwrap(), "hi");
    }

    #[test]
    fn test_kl032_extract_infers_format() {
        let dir = tempfile::tempdir().unwrap();
        build_tar_gz(&dir.path().join("t.tgz"));
        let params: Params =
            serde_json::from_value(serde_json::json!({"archive": "t.tgz", "dest": "out"})).unwrap();
        Extract.execute(&ctx(dir.path()), &params).unwrap();
        assert!(dir.path().join("out/t-1.0.0/bin/t").is_file());
    }

    #[test]
    fn test_kl032_extract_zip() {
        let dir = tempfile::tempdir().unwrap();
        let zpath = dir.path().join("t.zip");
        {
            let mut zw = zip::ZipWriter::new(File::create(&zpath).unwrap());
            let opts = zip::write::SimpleFileOptions::default();
            zw.start_file("pkg/tool.exe", opts).unwrap();
            zw.write_all(b"binary").unwrap();
            zw.finish().unwrap();
        }
        extract(&zpath, &dir.path().join("x"), "zip", 1).unwrap();
        assert_eq!(std::fs::read(dir.path().join("x/tool.exe")).unwrap(), b"binary");
    }

    #[test]
    fn test_kl032_unsupported_format() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rar"), b"x").unwrap();
        let err = extract(&dir.path().join("a.rar"), dir.path(), "rar", 0).unwrap_err();
        assert!(matches!(err, ActionError::InvalidParam { .. }));
    }

    #[test]
    fn test_kl032_archive_outside_workdir_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let params: Params =
            serde_json::from_value(serde_json::json!({"archive": "../t.tar.gz"})).unwrap();
        assert!(Extract.execute(&ctx(dir.path()), &params).is_err());
    }

    #[test]
    fn test_kl032_strip_components() {
        assert_eq!(
            strip_components(Path::new("a/b/c"), 1),
            Some(PathBuf::from("b/c"))
        );
        assert_eq!(strip_components(Path::new("./a/b"), 0), Some(PathBuf::from("a/b")));
        assert_eq!(strip_components(Path::new("a"), 1), None);
        assert_eq!(strip_components(Path::new("../evil"), 0), None);
        assert_eq!(strip_components(Path::new("/abs"), 0), None);
    }
}
