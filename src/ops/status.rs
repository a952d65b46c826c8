use crate::domains::DomainRegistry;
use crate::ops::acme::read_account_email;
use crate::ops::cli::{ExitError, FileArgs, StatusArgs};
use crate::ops::context::RunCtx;
use crate::ops::paths::Paths;
use crate::ops::util::{Mode, is_executable};
use crate::xray::template::certificate_paths;
use serde::Serialize;
use std::path::Path;
use std::process::Command;

pub async fn cmd_status(paths: Paths, files: FileArgs, args: StatusArgs) -> Result<(), ExitError> {
    let ctx = RunCtx::new(paths, files, Mode::Real);
    let span = ctx.component("status");
    let (paths, files) = (&ctx.paths, &ctx.files);
    let xray = bin_status(paths, Path::new("/usr/local/bin/xray"), &["version"]);
    let nginx = bin_status(paths, Path::new("/usr/sbin/nginx"), &["-v"]);
    let acme_sh = bin_status(paths, &files.acme_sh, &["--version"]);

    let xray_config = file_status(paths, Path::new(crate::xray::XRAY_CONFIG_PATH));
    let nginx_config = file_status(paths, Path::new("/etc/nginx/nginx.conf"));
    let secrets_present = files.confidential.exists();
    let acme_account = read_account_email(paths, &span);
    let certificates = DomainRegistry::load(&files.domains)
        .map(|registry| cert_status(paths, &files.keys_dir, &registry))
        .unwrap_or_default();

    if args.json {
        let out = StatusJson {
            xray,
            nginx,
            acme_sh,
            xray_config,
            nginx_config,
            secrets_present,
            acme_account,
            certificates,
        };
        let s = serde_json::to_string_pretty(&out)
            .map_err(|e| ExitError::new(2, format!("invalid_args: {e}")))?;
        println!("{s}");
        return Ok(());
    }

    for (name, bin) in [("xray", &xray), ("nginx", &nginx), ("acme.sh", &acme_sh)] {
        println!(
            "{name}: {} ({})",
            if bin.present { "present" } else { "missing" },
            bin.path.as_deref().unwrap_or("-")
        );
    }
    for (name, file) in [("xray_config", &xray_config), ("nginx_config", &nginx_config)] {
        println!(
            "{name}: {} ({})",
            if file.exists { "present" } else { "missing" },
            file.path
        );
    }
    println!(
        "secrets: {}",
        if secrets_present { "present" } else { "missing" }
    );
    println!("acme_account: {}", acme_account.as_deref().unwrap_or("-"));
    for cert in &certificates {
        println!(
            "cert {}: {}",
            cert.domain,
            if cert.installed { "installed" } else { "missing" }
        );
    }

    Ok(())
}

#[derive(Debug, Serialize)]
struct StatusJson {
    xray: BinInfo,
    nginx: BinInfo,
    acme_sh: BinInfo,
    xray_config: FileInfo,
    nginx_config: FileInfo,
    secrets_present: bool,
    acme_account: Option<String>,
    certificates: Vec<CertInfo>,
}

#[derive(Debug, Serialize)]
struct BinInfo {
    present: bool,
    version: Option<String>,
    path: Option<String>,
}

#[derive(Debug, Serialize)]
struct FileInfo {
    path: String,
    exists: bool,
}

#[derive(Debug, Serialize)]
struct CertInfo {
    domain: String,
    installed: bool,
}

fn bin_status(paths: &Paths, abs: &Path, version_args: &[&str]) -> BinInfo {
    let mapped = paths.map_abs(abs);
    let present = mapped.exists() && is_executable(&mapped);
    let path = if present {
        Some(abs.display().to_string())
    } else {
        None
    };

    let version = if present && paths.root() == Path::new("/") {
        Command::new(abs)
            .args(version_args)
            .output()
            .ok()
            .map(|o| {
                // nginx prints its version on stderr.
                let out = if o.stdout.is_empty() { o.stderr } else { o.stdout };
                String::from_utf8_lossy(&out).lines().next().unwrap_or("").trim().to_string()
            })
            .filter(|s| !s.is_empty())
    } else {
        None
    };

    BinInfo {
        present,
        version,
        path,
    }
}

fn file_status(paths: &Paths, abs: &Path) -> FileInfo {
    FileInfo {
        path: abs.display().to_string(),
        exists: paths.map_abs(abs).is_file(),
    }
}

fn cert_status(paths: &Paths, keys_dir: &Path, registry: &DomainRegistry) -> Vec<CertInfo> {
    let keys_dir = paths.map_abs(keys_dir);
    let keys_dir = keys_dir.to_string_lossy();
    registry
        .issue_cert_addresses()
        .into_iter()
        .map(|domain| {
            let (fullchain, key) = certificate_paths(&keys_dir, domain);
            CertInfo {
                domain: domain.to_string(),
                installed: Path::new(&fullchain).is_file() && Path::new(&key).is_file(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn certificates_are_checked_under_the_mapped_key_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::new(tmp.path().to_path_buf());
        let registry = DomainRegistry::parse(
            "[a]\naddress = a.example.net\nissue_cert = yes\n\n[b]\naddress = b.example.net\nissue_cert = 1\n",
        )
        .unwrap();

        let keys = tmp.path().join("keys");
        fs::create_dir_all(&keys).unwrap();
        fs::write(keys.join("a.example.net.pem"), "cert").unwrap();
        fs::write(keys.join("a.example.net-key.pem"), "key").unwrap();
        fs::write(keys.join("b.example.net.pem"), "cert").unwrap();

        let certs = cert_status(&paths, Path::new("/keys"), &registry);
        let summary: Vec<(&str, bool)> = certs
            .iter()
            .map(|c| (c.domain.as_str(), c.installed))
            .collect();
        assert_eq!(
            summary,
            vec![("a.example.net", true), ("b.example.net", false)]
        );
    }

    #[test]
    fn missing_binaries_have_no_path() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::new(tmp.path().to_path_buf());
        let info = bin_status(&paths, Path::new("/usr/local/bin/xray"), &["version"]);
        assert!(!info.present);
        assert_eq!(info.path, None);
        assert_eq!(info.version, None);
    }
}
