use crate::domains::DomainRegistry;
use crate::ops::cli::{ExitError, FileArgs};
use crate::ops::paths::Paths;
use crate::ops::platform::{Distro, detect_distro};
use crate::ops::util::Mode;
use crate::secrets::SecretPair;
use std::path::PathBuf;
use tracing::{Span, info_span};

/// State shared by every step of one invocation.
///
/// Components log under [`RunCtx::component`] spans, so every line carries the
/// run it belongs to without a process-wide logger per module.
#[derive(Debug)]
pub struct RunCtx {
    pub paths: Paths,
    pub files: FileArgs,
    pub mode: Mode,
    span: Span,
}

impl RunCtx {
    pub fn new(paths: Paths, files: FileArgs, mode: Mode) -> Self {
        let span = info_span!(
            "run",
            root = %paths.root().display(),
            dry_run = (mode == Mode::DryRun)
        );
        Self {
            paths,
            files,
            mode,
            span,
        }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn component(&self, name: &'static str) -> Span {
        info_span!(parent: &self.span, "component", name)
    }

    pub fn load_registry(&self) -> Result<DomainRegistry, ExitError> {
        DomainRegistry::load(&self.files.domains)
            .map_err(|e| ExitError::new(2, format!("invalid_domains: {e}")))
    }

    pub fn load_secrets(&self) -> Result<SecretPair, ExitError> {
        SecretPair::load(&self.files.confidential)
            .map_err(|e| ExitError::new(2, format!("invalid_secrets: {e}")))
    }

    pub fn distro(&self) -> Result<Distro, ExitError> {
        detect_distro(&self.paths).map_err(|e| ExitError::new(2, e))
    }

    /// Key directory as handed to external tools (follows `--root`).
    pub fn keys_dir_on_disk(&self) -> PathBuf {
        self.paths.map_abs(&self.files.keys_dir)
    }

    /// Key directory as referenced from the generated Xray config.
    pub fn keys_dir_in_config(&self) -> String {
        self.files.keys_dir.to_string_lossy().into_owned()
    }
}
