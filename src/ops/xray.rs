use crate::domains::DomainRegistry;
use crate::ops::cli::{
    ExitError, FileArgs, TemplateArgs, XrayConfigArgs, XrayInstallArgs, XrayRestartArgs,
};
use crate::ops::context::RunCtx;
use crate::ops::download::{download_to_path, fetch_text};
use crate::ops::paths::Paths;
use crate::ops::platform::{Distro, Package, install_packages};
use crate::ops::service::restart_service;
use crate::ops::util::{Mode, require_root, run_or_print, stage_file};
use crate::secrets::SecretPair;
use crate::xray::template::{MutateOptions, mutate, parse_template, render_config};
use serde_json::Value;
use std::fs;
use std::path::PathBuf;
use tracing::{Span, info, warn};

pub const XRAY_INSTALL_SCRIPT_URL: &str =
    "https://github.com/XTLS/Xray-install/raw/main/install-release.sh";

pub async fn cmd_xray_install(
    paths: Paths,
    files: FileArgs,
    args: XrayInstallArgs,
) -> Result<(), ExitError> {
    let ctx = RunCtx::new(paths, files, Mode::from_dry_run(args.dry_run));
    XrayInstaller::new(&ctx).install(ctx.distro()?).await
}

pub async fn cmd_xray_config(
    paths: Paths,
    files: FileArgs,
    args: XrayConfigArgs,
) -> Result<(), ExitError> {
    let ctx = RunCtx::new(paths, files, Mode::from_dry_run(args.dry_run));
    let registry = ctx.load_registry()?;
    let xray = XrayInstaller::new(&ctx);
    let Some(doc) = xray
        .fetch_template(&TemplateSource::from_args(&args.template))
        .await?
    else {
        return Ok(());
    };
    xray.configure(doc, &registry)?;
    Ok(())
}

pub async fn cmd_xray_restart(
    paths: Paths,
    files: FileArgs,
    args: XrayRestartArgs,
) -> Result<(), ExitError> {
    let ctx = RunCtx::new(paths, files, Mode::from_dry_run(args.dry_run));
    XrayInstaller::new(&ctx).restart(&args.service_name)
}

/// Where the base server template comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateSource {
    Url(String),
    File(PathBuf),
}

impl TemplateSource {
    pub fn from_args(args: &TemplateArgs) -> Self {
        match &args.template_file {
            Some(path) => Self::File(path.clone()),
            None => Self::Url(args.template_url.clone()),
        }
    }
}

pub struct XrayInstaller<'a> {
    ctx: &'a RunCtx,
    span: Span,
}

impl<'a> XrayInstaller<'a> {
    pub fn new(ctx: &'a RunCtx) -> Self {
        Self {
            ctx,
            span: ctx.component("xray"),
        }
    }

    pub async fn install(&self, distro: Distro) -> Result<(), ExitError> {
        let mode = self.ctx.mode;
        require_root(self.ctx.paths.root())?;
        info!(parent: &self.span, ?distro, "installing xray");
        install_packages(mode, distro, &[Package::Socat])?;

        let script = self.ctx.paths.tmp_dir().join("install-release.sh");
        if mode == Mode::DryRun {
            eprintln!(
                "would download: {XRAY_INSTALL_SCRIPT_URL} -> {}",
                script.display()
            );
        } else {
            download_to_path(XRAY_INSTALL_SCRIPT_URL, &script)
                .await
                .map_err(|e| ExitError::new(3, format!("download_failed: {e:#}")))?;
        }
        let script = script.to_string_lossy();
        run_or_print(mode, "bash", &[script.as_ref(), "install"], "install xray")?;
        info!(parent: &self.span, "xray installed");
        Ok(())
    }

    /// Loads and parses the base template. A remote template is not fetched in
    /// dry-run mode, which yields `None`.
    pub async fn fetch_template(&self, source: &TemplateSource) -> Result<Option<Value>, ExitError> {
        let raw = match source {
            TemplateSource::Url(url) if self.ctx.mode == Mode::DryRun => {
                eprintln!("would download: {url}");
                eprintln!(
                    "would write file: {}",
                    self.ctx.paths.usr_local_etc_xray_config().display()
                );
                return Ok(None);
            }
            TemplateSource::Url(url) => fetch_text(url)
                .await
                .map_err(|e| ExitError::new(3, format!("download_failed: {e:#}")))?,
            TemplateSource::File(path) => fs::read_to_string(path).map_err(|e| {
                ExitError::new(2, format!("invalid_template: {}: {e}", path.display()))
            })?,
        };
        let doc = parse_template(&raw)
            .map_err(|e| ExitError::new(2, format!("invalid_template: {e}")))?;
        info!(parent: &self.span, ?source, "template loaded");
        Ok(Some(doc))
    }

    /// Generates a fresh secret pair, applies it to `doc` and writes the
    /// server config. The pair is persisted only once the mutation succeeded,
    /// and the config and secret file are replaced together or not at all.
    pub fn configure(&self, mut doc: Value, registry: &DomainRegistry) -> Result<SecretPair, ExitError> {
        let secrets = SecretPair::generate();
        let opts = MutateOptions {
            keys_dir: self.ctx.keys_dir_in_config(),
        };
        let report = mutate(&mut doc, registry, &secrets, &opts)
            .map_err(|e| ExitError::new(2, format!("invalid_template: {e}")))?;
        let rendered =
            render_config(&doc).map_err(|e| ExitError::new(2, format!("invalid_template: {e}")))?;
        info!(
            parent: &self.span,
            ids = report.ids_rewritten,
            passwords = report.passwords_rewritten,
            certificates = report.certificates.len(),
            "template mutated"
        );

        let config = self.ctx.paths.usr_local_etc_xray_config();
        let confidential = &self.ctx.files.confidential;
        if self.ctx.mode == Mode::DryRun {
            eprintln!("would write file: {}", config.display());
            eprintln!("would write file: {}", confidential.display());
            return Ok(secrets);
        }

        let fs_err = |path: &std::path::Path, e: std::io::Error| {
            ExitError::new(4, format!("filesystem_error: {}: {e}", path.display()))
        };
        let staged_config =
            stage_file(&config, rendered.as_bytes(), None).map_err(|e| fs_err(&config, e))?;
        let staged_secrets = match stage_file(
            confidential,
            secrets.to_file_contents().as_bytes(),
            Some(0o600),
        ) {
            Ok(staged) => staged,
            Err(e) => {
                staged_config.discard();
                return Err(fs_err(confidential, e));
            }
        };

        let config_written = match staged_config.commit() {
            Ok(committed) => committed,
            Err(e) => {
                staged_secrets.discard();
                return Err(fs_err(&config, e));
            }
        };
        match staged_secrets.commit() {
            Ok(committed) => {
                committed.finish();
                config_written.finish();
            }
            Err(e) => {
                if let Err(undo) = config_written.undo() {
                    warn!(parent: &self.span, error = %undo, "failed to restore the previous xray config");
                }
                return Err(fs_err(confidential, e));
            }
        }
        info!(parent: &self.span, config = %config.display(), "xray config written");
        Ok(secrets)
    }

    pub fn restart(&self, service: &str) -> Result<(), ExitError> {
        restart_service(&self.ctx.paths, self.ctx.mode, service)?;
        info!(parent: &self.span, service, "service restarted");
        Ok(())
    }
}
