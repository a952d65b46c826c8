use crate::domains::DomainRegistry;
use crate::ops::cli::{CertsArgs, ExitError, FileArgs};
use crate::ops::context::RunCtx;
use crate::ops::download::download_to_path;
use crate::ops::paths::Paths;
use crate::ops::platform::{Distro, Package, install_packages};
use crate::ops::util::{Mode, ensure_dir, require_root, run_captured, run_or_print, stderr_text};
use crate::secrets::generate_account_email;
use crate::xray::template::certificate_paths;
use serde_json::Value;
use std::fs;
use std::path::Path;
use tracing::{Span, info, warn};

pub const ACME_INSTALL_URL: &str = "https://get.acme.sh";
pub const ACME_DEFAULT_CA: &str = "letsencrypt";
/// acme.sh exits with 2 when a certificate is still valid and renewal was skipped.
const ACME_SKIPPED_EXIT: i32 = 2;

pub async fn cmd_certs(paths: Paths, files: FileArgs, args: CertsArgs) -> Result<(), ExitError> {
    let ctx = RunCtx::new(paths, files, Mode::from_dry_run(args.dry_run));
    let registry = ctx.load_registry()?;
    let certs = CertOrchestrator::new(&ctx);
    if !args.skip_install {
        let distro = ctx.distro()?;
        certs.install_acme(distro).await?;
    }
    let issued = certs.install_certs(&registry)?;
    info!(parent: ctx.span(), count = issued.len(), "certificates installed");
    Ok(())
}

/// Drives acme.sh through install, account registration, issuance and installation.
pub struct CertOrchestrator<'a> {
    ctx: &'a RunCtx,
    acme_sh: String,
    span: Span,
}

impl<'a> CertOrchestrator<'a> {
    pub fn new(ctx: &'a RunCtx) -> Self {
        let acme_sh = ctx
            .paths
            .map_abs(&ctx.files.acme_sh)
            .to_string_lossy()
            .into_owned();
        Self {
            ctx,
            acme_sh,
            span: ctx.component("certs"),
        }
    }

    pub async fn install_acme(&self, distro: Distro) -> Result<(), ExitError> {
        let mode = self.ctx.mode;
        require_root(self.ctx.paths.root())?;

        info!(parent: &self.span, ?distro, "installing acme.sh prerequisites");
        install_packages(mode, distro, &[Package::Curl, Package::Socat, Package::Cron])?;
        // Standalone validation binds :80 through socat.
        run_or_print(
            mode,
            "setcap",
            &["cap_net_bind_service=+ep", "/usr/bin/socat"],
            "grant socat low-port bind",
        )?;

        let script = self.ctx.paths.tmp_dir().join("get-acme.sh");
        if mode == Mode::DryRun {
            eprintln!("would download: {ACME_INSTALL_URL} -> {}", script.display());
        } else {
            download_to_path(ACME_INSTALL_URL, &script)
                .await
                .map_err(|e| ExitError::new(3, format!("download_failed: {e:#}")))?;
        }
        let script = script.to_string_lossy();
        run_or_print(mode, "sh", &[script.as_ref()], "install acme.sh")?;
        run_or_print(
            mode,
            &self.acme_sh,
            &["--set-default-ca", "--server", ACME_DEFAULT_CA],
            "set default CA",
        )?;

        let keys_dir = self.ctx.keys_dir_on_disk();
        if mode == Mode::DryRun {
            eprintln!("would create dir: {}", keys_dir.display());
        } else {
            ensure_dir(&keys_dir).map_err(|e| {
                ExitError::new(4, format!("filesystem_error: {}: {e}", keys_dir.display()))
            })?;
        }
        info!(parent: &self.span, "acme.sh installed");
        Ok(())
    }

    /// Email of the acme.sh account on record, if any.
    pub fn account_email(&self) -> Option<String> {
        read_account_email(&self.ctx.paths, &self.span)
    }

    pub fn register_account(&self, email: &str) -> Result<(), ExitError> {
        info!(parent: &self.span, email, "registering acme account");
        let Some(out) = self.acme(&["--register-account", "-m", email])? else {
            return Ok(());
        };
        let stderr = stderr_text(&out);
        if !out.status.success() {
            return Err(ExitError::new(
                5,
                format!(
                    "cert_failed: register account {email} (exit={}): {stderr}",
                    out.status.code().unwrap_or(-1)
                ),
            ));
        }
        if !stderr.is_empty() {
            warn!(parent: &self.span, %stderr, "acme.sh reported warnings during registration");
        }
        Ok(())
    }

    pub fn issue_cert(&self, domain: &str) -> Result<(), ExitError> {
        info!(parent: &self.span, domain, "issuing certificate");
        let Some(out) = self.acme(&["--issue", "-d", domain, "--standalone"])? else {
            return Ok(());
        };
        let stderr = stderr_text(&out);
        let code = out.status.code();
        let exited_ok = out.status.success() || code == Some(ACME_SKIPPED_EXIT);
        if !exited_ok || !stderr.is_empty() {
            return Err(ExitError::new(
                5,
                format!(
                    "cert_failed: issue {domain} (exit={}): {stderr} (hint: make sure {domain} resolves to this host in DNS)",
                    code.unwrap_or(-1)
                ),
            ));
        }
        if code == Some(ACME_SKIPPED_EXIT) {
            info!(parent: &self.span, domain, "certificate still valid, renewal skipped");
        }
        Ok(())
    }

    pub fn install_cert(&self, domain: &str) -> Result<(), ExitError> {
        let keys_dir = self.ctx.keys_dir_on_disk();
        let (fullchain, key) = certificate_paths(&keys_dir.to_string_lossy(), domain);
        let Some(out) = self.acme(&[
            "--installcert",
            "-d",
            domain,
            "--key-file",
            key.as_str(),
            "--fullchain-file",
            fullchain.as_str(),
        ])?
        else {
            return Ok(());
        };
        let stderr = stderr_text(&out);
        if !out.status.success() || !stderr.is_empty() {
            return Err(ExitError::new(
                5,
                format!(
                    "cert_failed: install {domain} (exit={}): {stderr}",
                    out.status.code().unwrap_or(-1)
                ),
            ));
        }
        info!(parent: &self.span, domain, %fullchain, "certificate installed");
        Ok(())
    }

    /// Issues and installs every flagged domain in registry order, stopping at
    /// the first failure. Returns the domains handled.
    pub fn install_certs(&self, registry: &DomainRegistry) -> Result<Vec<String>, ExitError> {
        match self.account_email() {
            Some(email) => info!(parent: &self.span, %email, "using existing acme account"),
            None => self.register_account(&generate_account_email())?,
        }

        let domains = registry.issue_cert_addresses();
        if domains.is_empty() {
            warn!(parent: &self.span, "no domain is flagged with issue_cert");
        }
        for domain in &domains {
            self.issue_cert(domain)?;
            self.install_cert(domain)?;
        }

        let keys_dir = self.ctx.keys_dir_on_disk();
        let keys_dir = keys_dir.to_string_lossy();
        run_or_print(
            self.ctx.mode,
            "chown",
            &["-R", "nobody", keys_dir.as_ref()],
            "hand key dir to nobody",
        )?;

        Ok(domains.into_iter().map(str::to_string).collect())
    }

    fn acme(&self, args: &[&str]) -> Result<Option<std::process::Output>, ExitError> {
        run_captured(self.ctx.mode, &self.acme_sh, args).map_err(|e| {
            ExitError::new(
                3,
                format!(
                    "install_failed: run {}: {e} (hint: install acme.sh first)",
                    self.acme_sh
                ),
            )
        })
    }
}

/// Reads the account email acme.sh stored for the first CA that has one.
pub fn read_account_email(paths: &Paths, span: &Span) -> Option<String> {
    paths
        .acme_account_files()
        .iter()
        .find_map(|file| account_email_from_file(file, span))
}

fn account_email_from_file(file: &Path, span: &Span) -> Option<String> {
    let raw = fs::read_to_string(file).ok()?;
    let email = serde_json::from_str::<Value>(&raw)
        .ok()
        .and_then(|doc| parse_account_email(&doc));
    if email.is_none() {
        warn!(parent: span, file = %file.display(), "acme account file has no mailto contact");
    }
    email
}

fn parse_account_email(doc: &Value) -> Option<String> {
    let contact = doc.get("contact")?.as_array()?.first()?.as_str()?;
    let (_, email) = contact.split_once("mailto:")?;
    let email = email.trim();
    (!email.is_empty()).then(|| email.to_string())
}
