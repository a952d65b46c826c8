use crate::ops::acme::CertOrchestrator;
use crate::ops::cli::{ExitError, FileArgs, ProvisionArgs};
use crate::ops::context::RunCtx;
use crate::ops::links::write_links;
use crate::ops::nginx::NginxInstaller;
use crate::ops::paths::Paths;
use crate::ops::util::Mode;
use crate::ops::xray::{TemplateSource, XrayInstaller};
use crate::secrets::SecretPair;
use tracing::info;

/// Runs the whole pipeline in order, stopping at the first failing step:
/// acme.sh, certificates, nginx, Xray install, Xray config, restarts, links.
pub async fn cmd_provision(
    paths: Paths,
    files: FileArgs,
    args: ProvisionArgs,
) -> Result<(), ExitError> {
    let ctx = RunCtx::new(paths, files, Mode::from_dry_run(args.dry_run));
    let registry = ctx.load_registry()?;
    info!(parent: ctx.span(), domains = registry.entries().len(), "provisioning started");

    let installs = !(args.skip_acme_install && args.skip_nginx && args.skip_xray_install);
    let distro = if installs { Some(ctx.distro()?) } else { None };

    let certs = CertOrchestrator::new(&ctx);
    if let Some(distro) = distro
        && !args.skip_acme_install
    {
        certs.install_acme(distro).await?;
    }
    certs.install_certs(&registry)?;

    let nginx = NginxInstaller::new(&ctx);
    if !args.skip_nginx {
        if let Some(distro) = distro {
            nginx.install(distro)?;
        }
        nginx.configure(&args.nginx_template_url, &registry).await?;
    }

    let xray = XrayInstaller::new(&ctx);
    if let Some(distro) = distro
        && !args.skip_xray_install
    {
        xray.install(distro).await?;
    }
    let doc = xray
        .fetch_template(&TemplateSource::from_args(&args.template))
        .await?;
    let preview = match doc {
        Some(doc) => Some(xray.configure(doc, &registry)?),
        None => None,
    };

    if !args.no_restart {
        if !args.skip_nginx {
            nginx.restart()?;
        }
        xray.restart(&args.service_name)?;
    }

    // Links come from the persisted pair so they always match what the server runs.
    let secrets = match ctx.mode {
        Mode::Real => ctx.load_secrets()?,
        Mode::DryRun => preview.unwrap_or_else(SecretPair::generate),
    };
    write_links(&ctx, &registry, &secrets, &args.clients_out)?;

    info!(parent: ctx.span(), "provisioning finished");
    Ok(())
}
