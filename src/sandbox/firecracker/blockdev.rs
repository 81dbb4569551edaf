//! Ephemeral ext4 image staging without root: `mke2fs -d` to build images
//! from directories, `fuse2fs` to fold workspace changes back out.

use std::path::Path;

use tokio::process::Command;

use crate::sandbox::SandboxError;
use crate::sandbox::bwrap::shell_quote;

/// Create an ext4 image populated from `dir` at `image_path`.
pub async fn create_image_from_dir(
    dir: &Path,
    image_path: &Path,
    size_mib: u32,
) -> Result<(), SandboxError> {
    if dir.as_os_str().is_empty() {
        return Err(SandboxError::InvalidRequest("source directory is required".into()));
    }
    if image_path.as_os_str().is_empty() {
        return Err(SandboxError::InvalidRequest("image path is required".into()));
    }
    if size_mib == 0 {
        return Err(SandboxError::InvalidRequest("image size must be > 0 MiB".into()));
    }

    // -F: create even though the target is not a device
    // -d: populate from directory
    let output = Command::new("mke2fs")
        .args(["-t", "ext4", "-F", "-d"])
        .arg(dir)
        .arg(image_path)
        .arg(format!("{size_mib}M"))
        .output()
        .await
        .map_err(|e| SandboxError::Stage(format!("run mke2fs: {e}")))?;

    if !output.status.success() {
        return Err(SandboxError::Stage(format!(
            "mke2fs: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Extract the contents of an ext4 image into `dir` via a read-only
/// fuse2fs mount.
///
/// The copy is hardened against a hostile guest image:
///   - symlinks are never followed during the copy
///   - setuid/setgid bits are stripped from everything extracted
///   - symlinks pointing outside the destination are removed
pub async fn extract_image_to_dir(image_path: &Path, dir: &Path) -> Result<(), SandboxError> {
    if image_path.as_os_str().is_empty() {
        return Err(SandboxError::InvalidRequest("image path is required".into()));
    }
    if dir.as_os_str().is_empty() {
        return Err(SandboxError::InvalidRequest(
            "destination directory is required".into(),
        ));
    }

    // The cp exit code is captured separately: unmount/rmdir cleanup may
    // fail even after a successful copy.
    let script = format!(
        r#"
MOUNT_DIR=$(mktemp -d)
DST={dst}
trap 'fusermount -u "$MOUNT_DIR" 2>/dev/null; rmdir "$MOUNT_DIR" 2>/dev/null' EXIT

fuse2fs {img} "$MOUNT_DIR" -o ro,fakeroot || exit 1

cp -rp --no-preserve=links "$MOUNT_DIR"/. "$DST"/
CP_EXIT=$?

find "$DST" -perm /6000 -exec chmod ug-s {{}} + 2>/dev/null || true

find "$DST" -type l | while IFS= read -r link; do
  target=$(readlink -f "$link" 2>/dev/null) || true
  case "$target" in
    "$DST"/*) ;;
    *) rm -f "$link" ;;
  esac
done

fusermount -u "$MOUNT_DIR" 2>/dev/null || true
rmdir "$MOUNT_DIR" 2>/dev/null || true
exit $CP_EXIT
"#,
        dst = shell_quote(&dir.to_string_lossy()),
        img = shell_quote(&image_path.to_string_lossy()),
    );

    let output = Command::new("/bin/sh")
        .arg("-c")
        .arg(script)
        .output()
        .await
        .map_err(|e| SandboxError::Stage(format!("run fuse2fs extract: {e}")))?;

    if !output.status.success() {
        return Err(SandboxError::Stage(format!(
            "fuse2fs extract: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_rejects_bad_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let img = dir.path().join("x.ext4");
        assert!(create_image_from_dir(Path::new(""), &img, 1).await.is_err());
        assert!(
            create_image_from_dir(dir.path(), Path::new(""), 1)
                .await
                .is_err()
        );
        assert!(create_image_from_dir(dir.path(), &img, 0).await.is_err());
    }

    #[tokio::test]
    async fn extract_rejects_bad_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let img = dir.path().join("x.ext4");
        assert!(extract_image_to_dir(Path::new(""), dir.path()).await.is_err());
        assert!(extract_image_to_dir(&img, Path::new("")).await.is_err());
    }
}
