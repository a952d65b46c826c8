use crate::ops::cli::ExitError;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    DryRun,
    Real,
}

impl Mode {
    pub fn from_dry_run(dry_run: bool) -> Self {
        if dry_run { Mode::DryRun } else { Mode::Real }
    }
}

pub fn is_test_root(root: &Path) -> bool {
    root != Path::new("/")
}

/// Installing packages and binding :80 for ACME validation both need root.
pub fn require_root(root: &Path) -> Result<(), ExitError> {
    if is_test_root(root) {
        return Ok(());
    }
    // SAFETY: geteuid has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        return Err(ExitError::new(
            2,
            "permission_denied: must run as root (hint: run via sudo)",
        ));
    }
    Ok(())
}

pub fn ensure_dir(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)
}

pub fn write_bytes_if_changed(path: &Path, bytes: &[u8]) -> io::Result<bool> {
    write_if_changed(path, bytes, None)
}

pub fn write_string_if_changed(path: &Path, content: &str) -> io::Result<bool> {
    write_if_changed(path, content.as_bytes(), None)
}

/// Like [`write_string_if_changed`] for secret material: the file is 0600
/// from the moment it is created.
pub fn write_private_if_changed(path: &Path, content: &str) -> io::Result<bool> {
    write_if_changed(path, content.as_bytes(), Some(0o600))
}

fn write_if_changed(path: &Path, bytes: &[u8], mode: Option<u32>) -> io::Result<bool> {
    if let Ok(existing) = fs::read(path)
        && existing == bytes
    {
        if let Some(mode) = mode {
            chmod(path, mode)?;
        }
        return Ok(false);
    }
    stage_file(path, bytes, mode)?.commit()?.finish();
    Ok(true)
}

/// Content written next to its destination, not yet moved into place.
#[derive(Debug)]
pub struct StagedFile {
    tmp: PathBuf,
    dest: PathBuf,
}

/// A committed [`StagedFile`]; holds the replaced file until `finish`.
#[derive(Debug)]
pub struct Committed {
    dest: PathBuf,
    previous: Option<PathBuf>,
}

pub fn stage_file(path: &Path, bytes: &[u8], mode: Option<u32>) -> io::Result<StagedFile> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }

    let tmp = tmp_path_next_to(path);
    let _ = fs::remove_file(&tmp);
    let mut opts = fs::OpenOptions::new();
    opts.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        if let Some(mode) = mode {
            opts.mode(mode);
        }
    }
    #[cfg(not(unix))]
    let _ = mode;

    let written = opts.open(&tmp).and_then(|mut f| {
        f.write_all(bytes)?;
        f.sync_all()
    });
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(StagedFile {
        tmp,
        dest: path.to_path_buf(),
    })
}

impl StagedFile {
    pub fn commit(self) -> io::Result<Committed> {
        let previous = if self.dest.is_file() {
            let keep = sibling_path(&self.dest, "prev");
            if let Err(e) = fs::rename(&self.dest, &keep) {
                self.discard();
                return Err(e);
            }
            Some(keep)
        } else {
            None
        };

        if let Err(e) = fs::rename(&self.tmp, &self.dest) {
            if let Some(keep) = &previous {
                let _ = fs::rename(keep, &self.dest);
            }
            self.discard();
            return Err(e);
        }
        Ok(Committed {
            dest: self.dest,
            previous,
        })
    }

    pub fn discard(self) {
        let _ = fs::remove_file(&self.tmp);
    }
}

impl Committed {
    /// Drops the replaced file.
    pub fn finish(self) {
        if let Some(previous) = self.previous {
            let _ = fs::remove_file(previous);
        }
    }

    /// Puts the replaced file back, or removes the new one if there was none.
    pub fn undo(self) -> io::Result<()> {
        match self.previous {
            Some(previous) => fs::rename(previous, &self.dest),
            None => fs::remove_file(&self.dest),
        }
    }
}

#[cfg(unix)]
pub fn chmod(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(mode);
    fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
pub fn chmod(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

pub fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::metadata(path)
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.exists()
    }
}

pub fn tmp_path_next_to(path: &Path) -> PathBuf {
    sibling_path(path, "tmp")
}

fn sibling_path(path: &Path, tag: &str) -> PathBuf {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file = path
        .file_name()
        .unwrap_or_else(|| std::ffi::OsStr::new("tmp"));
    parent.join(format!(
        ".{}.{tag}.{}",
        file.to_string_lossy(),
        std::process::id()
    ))
}

/// Runs `program` and fails on a non-zero exit; in dry-run mode only prints it.
pub fn run_or_print(mode: Mode, program: &str, args: &[&str], hint: &str) -> Result<(), ExitError> {
    if mode == Mode::DryRun {
        eprintln!("would run: {program} {}", args.join(" "));
        return Ok(());
    }

    let status = Command::new(program)
        .args(args)
        .status()
        .map_err(|e| ExitError::new(3, format!("install_failed: {hint}: {e}")))?;

    if !status.success() {
        return Err(ExitError::new(
            3,
            format!(
                "install_failed: {hint} (exit={})",
                status.code().unwrap_or(-1)
            ),
        ));
    }
    Ok(())
}

/// Like [`run_or_print`] but hands back captured stdout/stderr instead of judging them.
pub fn run_captured(mode: Mode, program: &str, args: &[&str]) -> io::Result<Option<Output>> {
    if mode == Mode::DryRun {
        eprintln!("would run: {program} {}", args.join(" "));
        return Ok(None);
    }
    Command::new(program).args(args).output().map(Some)
}

pub fn stderr_text(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_if_changed_reports_changes_and_creates_parents() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a/b/c.txt");
        assert!(write_string_if_changed(&path, "x").unwrap());
        assert!(!write_string_if_changed(&path, "x").unwrap());
        assert!(write_string_if_changed(&path, "y").unwrap());
        assert_eq!(fs::read_to_string(&path).unwrap(), "y");
        assert!(!tmp_path_next_to(&path).exists());
    }

    #[test]
    fn dry_run_does_not_execute() {
        run_or_print(Mode::DryRun, "/definitely/not/here", &["x"], "nothing").unwrap();
        assert!(
            run_captured(Mode::DryRun, "/definitely/not/here", &[])
                .unwrap()
                .is_none()
        );
    }

    #[cfg(unix)]
    #[test]
    fn real_mode_reports_exit_code() {
        let err = run_or_print(Mode::Real, "sh", &["-c", "exit 7"], "exit check").unwrap_err();
        assert_eq!(err.code, 3);
        assert!(err.message.contains("exit=7"));

        let out = run_captured(Mode::Real, "sh", &["-c", "echo oops >&2"])
            .unwrap()
            .unwrap();
        assert_eq!(stderr_text(&out), "oops");
    }

    #[cfg(unix)]
    #[test]
    fn private_write_is_0600_even_over_a_stale_temp() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(".confidential");
        fs::write(tmp_path_next_to(&path), "stale").unwrap();

        assert!(write_private_if_changed(&path, "id\npw\n").unwrap());
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(fs::read_to_string(&path).unwrap(), "id\npw\n");
        assert!(!tmp_path_next_to(&path).exists());
    }

    #[test]
    fn committed_file_can_be_undone() {
        let tmp = tempfile::tempdir().unwrap();
        let existing = tmp.path().join("config.json");
        fs::write(&existing, "old").unwrap();
        let fresh = tmp.path().join("new.json");

        let a = stage_file(&existing, b"new", None).unwrap().commit().unwrap();
        let b = stage_file(&fresh, b"new", None).unwrap().commit().unwrap();
        assert_eq!(fs::read_to_string(&existing).unwrap(), "new");

        a.undo().unwrap();
        b.undo().unwrap();
        assert_eq!(fs::read_to_string(&existing).unwrap(), "old");
        assert!(!fresh.exists());
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 1);
    }

    #[test]
    fn failed_stage_leaves_the_destination_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        fs::write(&path, "old").unwrap();
        fs::create_dir_all(tmp_path_next_to(&path)).unwrap();

        assert!(stage_file(&path, b"new", None).is_err());
        assert_eq!(fs::read_to_string(&path).unwrap(), "old");
    }
}
