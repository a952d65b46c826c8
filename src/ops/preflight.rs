use crate::ops::cli::{Command, ExitError, FileArgs, XrayCommand};
use crate::ops::paths::Paths;
use crate::ops::util::is_test_root;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TargetKind {
    Dir,
    File,
}

#[derive(Debug, Clone)]
struct Target {
    kind: TargetKind,
    path: PathBuf,
    purpose: &'static str,
}

/// Checks that every path the command is about to write can be written,
/// before any package gets installed.
pub fn preflight(paths: &Paths, files: &FileArgs, command: &Command) -> Result<(), ExitError> {
    match command {
        Command::Status(_) | Command::Secrets(_) => Ok(()),

        Command::Provision(args) => {
            if args.dry_run {
                return Ok(());
            }
            let mut targets = vec![
                Target::dir(paths.tmp_dir(), "download workspace"),
                Target::dir(paths.map_abs(&files.keys_dir), "certificate key dir"),
                Target::dir(paths.usr_local_etc_xray_dir(), "xray config dir"),
                Target::file(paths.usr_local_etc_xray_config(), "xray config"),
                Target::file(files.confidential.clone(), "secret pair"),
                Target::file(args.clients_out.clone(), "client links"),
            ];
            if !args.skip_nginx {
                targets.extend([
                    Target::dir(paths.etc_nginx_dir(), "nginx config dir"),
                    Target::file(paths.etc_nginx_conf(), "nginx config"),
                ]);
            }
            check_targets(paths, &targets)
        }

        Command::Certs(args) => {
            if args.dry_run {
                return Ok(());
            }
            let mut targets = vec![Target::dir(
                paths.map_abs(&files.keys_dir),
                "certificate key dir",
            )];
            if !args.skip_install {
                targets.push(Target::dir(paths.tmp_dir(), "download workspace"));
            }
            check_targets(paths, &targets)
        }

        Command::Nginx(args) => {
            if args.dry_run {
                return Ok(());
            }
            check_targets(
                paths,
                &[
                    Target::dir(paths.etc_nginx_dir(), "nginx config dir"),
                    Target::file(paths.etc_nginx_conf(), "nginx config"),
                ],
            )
        }

        Command::Xray(XrayCommand::Install(args)) => {
            if args.dry_run {
                return Ok(());
            }
            check_targets(
                paths,
                &[Target::dir(paths.tmp_dir(), "download workspace")],
            )
        }
        Command::Xray(XrayCommand::Config(args)) => {
            if args.dry_run {
                return Ok(());
            }
            check_targets(
                paths,
                &[
                    Target::dir(paths.usr_local_etc_xray_dir(), "xray config dir"),
                    Target::file(paths.usr_local_etc_xray_config(), "xray config"),
                    Target::file(files.confidential.clone(), "secret pair"),
                ],
            )
        }
        Command::Xray(XrayCommand::Restart(_)) => Ok(()),

        Command::Links(args) => {
            if args.dry_run {
                return Ok(());
            }
            check_targets(
                paths,
                &[Target::file(args.clients_out.clone(), "client links")],
            )
        }
    }
}

impl Target {
    fn dir(path: PathBuf, purpose: &'static str) -> Self {
        Self {
            kind: TargetKind::Dir,
            path,
            purpose,
        }
    }

    fn file(path: PathBuf, purpose: &'static str) -> Self {
        Self {
            kind: TargetKind::File,
            path,
            purpose,
        }
    }
}

fn check_targets(paths: &Paths, targets: &[Target]) -> Result<(), ExitError> {
    for t in targets {
        if t.path.as_os_str().is_empty() {
            continue;
        }
        let res = match t.kind {
            TargetKind::Dir => check_writable_dir(&t.path),
            TargetKind::File => check_writable_file(&t.path),
        };
        if let Err(e) = res {
            return Err(ExitError::new(6, format_preflight_error(t, &e, paths)));
        }
    }

    Ok(())
}

fn format_preflight_error(t: &Target, e: &io::Error, paths: &Paths) -> String {
    let hint = if !is_test_root(paths.root()) {
        match e.kind() {
            io::ErrorKind::PermissionDenied => {
                " (hint: run via sudo / ensure directory ownership & mode)"
            }
            _ => "",
        }
    } else {
        ""
    };

    format!(
        "preflight_failed: cannot write {} ({}) at {}: {}{}",
        t.purpose,
        match t.kind {
            TargetKind::Dir => "dir",
            TargetKind::File => "file",
        },
        t.path.display(),
        e,
        hint
    )
}

fn check_writable_file(path: &Path) -> io::Result<()> {
    if path.exists() && path.is_dir() {
        return Err(io::Error::other("path exists but is a directory"));
    }

    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => check_writable_dir(parent)?,
        _ => check_writable_dir(Path::new("."))?,
    }

    Ok(())
}

fn check_writable_dir(path: &Path) -> io::Result<()> {
    // If some intermediate component is a file, later writes will fail in confusing ways.
    check_no_non_dir_prefixes(path)?;

    let existing = find_existing_ancestor(path)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no existing ancestor"))?;
    if !existing.is_dir() {
        return Err(io::Error::other("existing ancestor is not a directory"));
    }

    // Best-effort: validate write+exec by creating a temp file and removing it.
    let tmp = existing.join(format!(
        ".relay-ops.preflight.{}.{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos()
    ));
    let f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&tmp);
    match f {
        Ok(_) => {
            let _ = fs::remove_file(&tmp);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn find_existing_ancestor(path: &Path) -> Option<PathBuf> {
    let mut cur = path.to_path_buf();
    loop {
        if cur.exists() {
            return Some(cur);
        }
        if !cur.pop() {
            return None;
        }
    }
}

fn check_no_non_dir_prefixes(path: &Path) -> io::Result<()> {
    let mut cur = PathBuf::new();
    for comp in path.components() {
        cur.push(comp);
        if cur.exists() && !cur.is_dir() {
            return Err(io::Error::other(format!(
                "path component is not a directory: {}",
                cur.display()
            )));
        }
    }
    Ok(())
}
