use crate::domains::DomainRegistry;
use crate::ops::cli::{ExitError, FileArgs, LinksArgs};
use crate::ops::context::RunCtx;
use crate::ops::paths::Paths;
use crate::ops::util::{Mode, write_private_if_changed};
use crate::secrets::SecretPair;
use crate::subscription::build_raw_text;
use std::path::Path;
use tracing::info;

pub async fn cmd_links(paths: Paths, files: FileArgs, args: LinksArgs) -> Result<(), ExitError> {
    let ctx = RunCtx::new(paths, files, Mode::from_dry_run(args.dry_run));
    let registry = ctx.load_registry()?;
    let secrets = ctx.load_secrets()?;
    write_links(&ctx, &registry, &secrets, &args.clients_out)
}

/// Prints the client links and stores them in `out` (mode 0600).
pub fn write_links(
    ctx: &RunCtx,
    registry: &DomainRegistry,
    secrets: &SecretPair,
    out: &Path,
) -> Result<(), ExitError> {
    let span = ctx.component("links");
    let text = build_raw_text(registry, secrets)
        .map_err(|e| ExitError::new(2, format!("invalid_domains: {e}")))?;

    if ctx.mode == Mode::DryRun {
        eprintln!("would write file: {}", out.display());
    } else {
        write_private_if_changed(out, &text)
            .map_err(|e| ExitError::new(4, format!("filesystem_error: {}: {e}", out.display())))?;
        info!(parent: &span, out = %out.display(), "client links written");
    }

    println!("{text}");
    Ok(())
}
