use crate::ops::cli::ExitError;
use crate::ops::paths::Paths;
use crate::ops::util::{Mode, is_test_root};
use std::process::{Command, Stdio};

pub fn restart_service(paths: &Paths, mode: Mode, service: &str) -> Result<(), ExitError> {
    if mode == Mode::DryRun {
        eprintln!("would restart service (init-system auto): {service}");
        return Ok(());
    }

    if is_test_root(paths.root()) {
        return Err(ExitError::new(
            6,
            "restart_failed: service restart requires real system environment (use --dry-run for tests)",
        ));
    }

    // Try systemd first, then OpenRC.
    let systemd = Command::new("systemctl")
        .args(["restart", format!("{service}.service").as_str()])
        .stderr(Stdio::piped())
        .output();
    if let Ok(out) = &systemd
        && out.status.success()
    {
        return Ok(());
    }

    let openrc_ok = Command::new("rc-service")
        .args([service, "restart"])
        .status()
        .map(|s| s.success())
        .unwrap_or(false);
    if openrc_ok {
        return Ok(());
    }

    let detail = match systemd {
        Ok(out) => String::from_utf8_lossy(&out.stderr).trim().to_string(),
        Err(e) => e.to_string(),
    };
    Err(ExitError::new(
        6,
        format!(
            "restart_failed: failed to restart {service}: {detail} (hint: run via sudo; ensure systemctl/rc-service exists)"
        ),
    ))
}
