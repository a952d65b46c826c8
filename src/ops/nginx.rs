use crate::domains::DomainRegistry;
use crate::ops::cli::{ExitError, FileArgs, NginxArgs};
use crate::ops::context::RunCtx;
use crate::ops::download::{fetch_text, replace_file_with_backup};
use crate::ops::paths::Paths;
use crate::ops::platform::{Distro, Package, install_packages};
use crate::ops::service::restart_service;
use crate::ops::util::{Mode, require_root};
use tracing::{Span, info};

pub const NGINX_TEMPLATE_URL: &str =
    "https://raw.githubusercontent.com/XTLS/Xray-examples/main/All-in-One-fallbacks-Nginx/nginx.conf";
pub const NGINX_SERVICE_NAME: &str = "nginx";
/// Host placeholder used by the upstream nginx config.
const PLACEHOLDER_HOST: &str = "example.com";

pub async fn cmd_nginx(paths: Paths, files: FileArgs, args: NginxArgs) -> Result<(), ExitError> {
    let ctx = RunCtx::new(paths, files, Mode::from_dry_run(args.dry_run));
    let registry = ctx.load_registry()?;
    let nginx = NginxInstaller::new(&ctx);
    if !args.skip_install {
        nginx.install(ctx.distro()?)?;
    }
    nginx.configure(&args.nginx_template_url, &registry).await?;
    if !args.no_restart {
        nginx.restart()?;
    }
    Ok(())
}

/// Substitutes every placeholder host with the space-separated registry addresses.
pub fn render_site_config(raw: &str, registry: &DomainRegistry) -> String {
    raw.replace(PLACEHOLDER_HOST, &registry.addresses().join(" "))
}

pub struct NginxInstaller<'a> {
    ctx: &'a RunCtx,
    span: Span,
}

impl<'a> NginxInstaller<'a> {
    pub fn new(ctx: &'a RunCtx) -> Self {
        Self {
            ctx,
            span: ctx.component("nginx"),
        }
    }

    pub fn install(&self, distro: Distro) -> Result<(), ExitError> {
        require_root(self.ctx.paths.root())?;
        info!(parent: &self.span, ?distro, "installing nginx");
        install_packages(self.ctx.mode, distro, &[Package::Nginx])
    }

    /// Downloads the upstream config, renders it for `registry` and writes it.
    pub async fn configure(&self, url: &str, registry: &DomainRegistry) -> Result<(), ExitError> {
        let dest = self.ctx.paths.etc_nginx_conf();
        if self.ctx.mode == Mode::DryRun {
            eprintln!("would download: {url}");
            eprintln!("would write file: {}", dest.display());
            return Ok(());
        }

        let raw = fetch_text(url)
            .await
            .map_err(|e| ExitError::new(3, format!("download_failed: {e:#}")))?;
        self.write_config(&render_site_config(&raw, registry))
    }

    pub fn write_config(&self, rendered: &str) -> Result<(), ExitError> {
        let dest = self.ctx.paths.etc_nginx_conf();
        if self.ctx.mode == Mode::DryRun {
            eprintln!("would write file: {}", dest.display());
            return Ok(());
        }
        let backup = replace_file_with_backup(&dest, rendered.as_bytes()).map_err(|e| {
            ExitError::new(4, format!("filesystem_error: {}: {e:#}", dest.display()))
        })?;
        match backup {
            Some(backup) => info!(
                parent: &self.span,
                dest = %dest.display(),
                backup = %backup.display(),
                "nginx config replaced"
            ),
            None => info!(parent: &self.span, dest = %dest.display(), "nginx config written"),
        }
        Ok(())
    }

    pub fn restart(&self) -> Result<(), ExitError> {
        restart_service(&self.ctx.paths, self.ctx.mode, NGINX_SERVICE_NAME)?;
        info!(parent: &self.span, "nginx restarted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    const REGISTRY: &str = "\
[entry-domain]
address = relay.example.net
issue_cert = true

[trojan-h2]
address = t.example.net
";

    fn files() -> FileArgs {
        FileArgs {
            domains: PathBuf::from("domains.ini"),
            confidential: PathBuf::from(".confidential"),
            keys_dir: PathBuf::from("/keys"),
            acme_sh: PathBuf::from("/root/.acme.sh/acme.sh"),
        }
    }

    #[test]
    fn every_placeholder_becomes_the_address_list() {
        let registry = DomainRegistry::parse(REGISTRY).unwrap();
        let raw = "server_name example.com;\n# example.com again\nlisten 80;\n";
        assert_eq!(
            render_site_config(raw, &registry),
            "server_name relay.example.net t.example.net;\n# relay.example.net t.example.net again\nlisten 80;\n"
        );
        assert_eq!(render_site_config("listen 80;", &registry), "listen 80;");
    }

    #[test]
    fn write_config_keeps_a_backup() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = RunCtx::new(Paths::new(tmp.path().to_path_buf()), files(), Mode::Real);
        let conf = ctx.paths.etc_nginx_conf();
        fs::create_dir_all(conf.parent().unwrap()).unwrap();
        fs::write(&conf, "distro default\n").unwrap();

        let nginx = NginxInstaller::new(&ctx);
        nginx.write_config("rendered\n").unwrap();

        assert_eq!(fs::read_to_string(&conf).unwrap(), "rendered\n");
        let backups: Vec<_> = fs::read_dir(conf.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("nginx.conf.bak."))
            .collect();
        assert_eq!(backups.len(), 1);
    }

    #[test]
    fn dry_run_leaves_the_filesystem_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = RunCtx::new(Paths::new(tmp.path().to_path_buf()), files(), Mode::DryRun);
        let nginx = NginxInstaller::new(&ctx);
        nginx.install(Distro::Debian).unwrap();
        nginx.write_config("rendered\n").unwrap();
        nginx.restart().unwrap();
        assert!(!ctx.paths.etc_nginx_conf().exists());
    }
}
