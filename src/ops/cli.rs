use crate::ops::acme;
use crate::ops::links;
use crate::ops::nginx;
use crate::ops::paths::Paths;
use crate::ops::preflight;
use crate::ops::provision;
use crate::ops::secrets;
use crate::ops::status;
use crate::ops::xray;
use crate::xray::{DEFAULT_TEMPLATE_URL, XRAY_SERVICE_NAME};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "relay-ops",
    about = "Provision an Xray relay host: certificates, nginx, Xray and client links",
    version = crate::version::VERSION,
    disable_help_subcommand = true,
    args_conflicts_with_subcommands = true
)]
pub struct Cli {
    /// Redirect all filesystem writes under this root (test-only).
    #[arg(long, global = true, hide = true, default_value = "/")]
    pub root: PathBuf,

    #[command(flatten)]
    pub files: FileArgs,

    /// Arguments for the default `provision` command.
    #[command(flatten)]
    pub provision: ProvisionArgs,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Inputs and outputs shared by every command.
#[derive(Args, Debug, Clone)]
pub struct FileArgs {
    /// Domain registry (one INI section per domain).
    #[arg(
        long,
        global = true,
        env = "RELAY_DOMAINS_FILE",
        value_name = "PATH",
        default_value = "domains.ini"
    )]
    pub domains: PathBuf,

    /// Persisted client identifier and password.
    #[arg(
        long,
        global = true,
        env = "RELAY_CONFIDENTIAL_FILE",
        value_name = "PATH",
        default_value = ".confidential"
    )]
    pub confidential: PathBuf,

    /// Where issued certificates and keys are installed.
    #[arg(
        long,
        global = true,
        env = "RELAY_KEYS_DIR",
        value_name = "PATH",
        default_value = "/keys"
    )]
    pub keys_dir: PathBuf,

    #[arg(
        long,
        global = true,
        env = "RELAY_ACME_SH",
        value_name = "PATH",
        default_value = "/root/.acme.sh/acme.sh"
    )]
    pub acme_sh: PathBuf,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the whole pipeline (default).
    Provision(ProvisionArgs),

    /// Install acme.sh, then issue and install every flagged certificate.
    Certs(CertsArgs),

    /// Install nginx and write its config for the registry domains.
    Nginx(NginxArgs),

    #[command(subcommand)]
    Xray(XrayCommand),

    /// Render client links from the persisted secrets.
    Links(LinksArgs),

    #[command(subcommand)]
    Secrets(SecretsCommand),

    Status(StatusArgs),
}

#[derive(Args, Debug, Clone)]
pub struct TemplateArgs {
    #[arg(
        long,
        env = "RELAY_TEMPLATE_URL",
        value_name = "URL",
        default_value = DEFAULT_TEMPLATE_URL,
        conflicts_with = "template_file"
    )]
    pub template_url: String,

    /// Read the base template from a local file instead of downloading it.
    #[arg(long, value_name = "PATH")]
    pub template_file: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ProvisionArgs {
    #[command(flatten)]
    pub template: TemplateArgs,

    #[arg(
        long,
        env = "RELAY_NGINX_TEMPLATE_URL",
        value_name = "URL",
        default_value = nginx::NGINX_TEMPLATE_URL
    )]
    pub nginx_template_url: String,

    #[arg(long, value_name = "NAME", default_value = XRAY_SERVICE_NAME)]
    pub service_name: String,

    #[arg(long, value_name = "PATH", default_value = "clients.conf")]
    pub clients_out: PathBuf,

    /// Skip installing acme.sh and its prerequisites.
    #[arg(long)]
    pub skip_acme_install: bool,

    /// Skip installing and configuring nginx.
    #[arg(long)]
    pub skip_nginx: bool,

    /// Skip running the Xray installer.
    #[arg(long)]
    pub skip_xray_install: bool,

    /// Do not restart services after writing their configs.
    #[arg(long)]
    pub no_restart: bool,

    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args, Debug, Clone)]
pub struct CertsArgs {
    /// Assume acme.sh is already installed.
    #[arg(long)]
    pub skip_install: bool,

    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args, Debug, Clone)]
pub struct NginxArgs {
    #[arg(
        long,
        env = "RELAY_NGINX_TEMPLATE_URL",
        value_name = "URL",
        default_value = nginx::NGINX_TEMPLATE_URL
    )]
    pub nginx_template_url: String,

    /// Only write the config; assume nginx is installed.
    #[arg(long)]
    pub skip_install: bool,

    #[arg(long)]
    pub no_restart: bool,

    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Subcommand, Debug)]
pub enum XrayCommand {
    /// Run the official Xray installer.
    Install(XrayInstallArgs),
    /// Generate fresh secrets and write the server config from the template.
    Config(XrayConfigArgs),
    Restart(XrayRestartArgs),
}

#[derive(Args, Debug, Clone)]
pub struct XrayInstallArgs {
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args, Debug, Clone)]
pub struct XrayConfigArgs {
    #[command(flatten)]
    pub template: TemplateArgs,

    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args, Debug, Clone)]
pub struct XrayRestartArgs {
    /// Service name to restart (systemd: `<name>.service`, OpenRC: `rc-service <name> restart`).
    #[arg(long, value_name = "NAME", default_value = XRAY_SERVICE_NAME)]
    pub service_name: String,

    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args, Debug, Clone)]
pub struct LinksArgs {
    #[arg(long, value_name = "PATH", default_value = "clients.conf")]
    pub clients_out: PathBuf,

    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Subcommand, Debug)]
pub enum SecretsCommand {
    Show(SecretsShowArgs),
}

#[derive(Args, Debug, Clone)]
pub struct SecretsShowArgs {
    /// Print the password in clear text.
    #[arg(long)]
    pub reveal: bool,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug)]
pub struct ExitError {
    pub code: i32,
    pub message: String,
}

impl ExitError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

pub async fn run() -> i32 {
    let cli = Cli::parse();
    let paths = Paths::new(cli.root.clone());
    let files = cli.files;
    let command = cli.command.unwrap_or(Command::Provision(cli.provision));

    if let Err(e) = preflight::preflight(&paths, &files, &command) {
        eprintln!("{}", e.message);
        return e.code;
    }

    let res: Result<(), ExitError> = match command {
        Command::Provision(args) => provision::cmd_provision(paths, files, args).await,
        Command::Certs(args) => acme::cmd_certs(paths, files, args).await,
        Command::Nginx(args) => nginx::cmd_nginx(paths, files, args).await,
        Command::Xray(cmd) => match cmd {
            XrayCommand::Install(args) => xray::cmd_xray_install(paths, files, args).await,
            XrayCommand::Config(args) => xray::cmd_xray_config(paths, files, args).await,
            XrayCommand::Restart(args) => xray::cmd_xray_restart(paths, files, args).await,
        },
        Command::Links(args) => links::cmd_links(paths, files, args).await,
        Command::Secrets(SecretsCommand::Show(args)) => {
            secrets::cmd_secrets_show(paths, files, args).await
        }
        Command::Status(args) => status::cmd_status(paths, files, args).await,
    };

    match res {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("{}", e.message);
            e.code
        }
    }
}
