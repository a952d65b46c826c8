use crate::ops::cli::ExitError;
use crate::ops::paths::Paths;
use crate::ops::util::{Mode, run_or_print};
use std::fs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distro {
    Arch,
    Debian,
    Alpine,
}

pub fn detect_distro(paths: &Paths) -> Result<Distro, String> {
    if let Ok(v) = std::env::var("RELAY_OPS_DISTRO") {
        return parse_distro(&v).ok_or_else(|| format!("unknown RELAY_OPS_DISTRO={v}"));
    }

    let content = fs::read_to_string(paths.os_release())
        .map_err(|e| format!("read /etc/os-release: {e}"))?;

    let mut id = None::<String>;
    for line in content.lines() {
        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        if k == "ID" {
            id = Some(v.trim_matches('"').to_string());
            break;
        }
    }

    match id.as_deref() {
        Some("arch") => Ok(Distro::Arch),
        Some("debian") | Some("ubuntu") => Ok(Distro::Debian),
        Some("alpine") => Ok(Distro::Alpine),
        Some(other) => Err(format!("unsupported distro: ID={other}")),
        None => Err("unsupported distro: missing ID in /etc/os-release".to_string()),
    }
}

fn parse_distro(v: &str) -> Option<Distro> {
    match v {
        "arch" => Some(Distro::Arch),
        "debian" | "ubuntu" => Some(Distro::Debian),
        "alpine" => Some(Distro::Alpine),
        _ => None,
    }
}

/// Generic package names the provisioning steps ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Package {
    Curl,
    Socat,
    Cron,
    Nginx,
}

impl Distro {
    pub fn package_name(self, package: Package) -> &'static str {
        match (self, package) {
            (_, Package::Curl) => "curl",
            (_, Package::Socat) => "socat",
            (_, Package::Nginx) => "nginx",
            (Distro::Debian, Package::Cron) => "cron",
            (Distro::Arch, Package::Cron) => "cronie",
            (Distro::Alpine, Package::Cron) => "dcron",
        }
    }

    /// Commands that refresh the package index, run once before installing.
    pub fn refresh_command(self) -> Option<(&'static str, Vec<&'static str>)> {
        match self {
            Distro::Debian => Some(("apt-get", vec!["update"])),
            Distro::Alpine => Some(("apk", vec!["update"])),
            Distro::Arch => None,
        }
    }

    pub fn install_command(self, packages: &[Package]) -> (&'static str, Vec<&'static str>) {
        let names = packages.iter().map(|p| self.package_name(*p));
        match self {
            Distro::Debian => ("apt-get", ["install", "-y"].into_iter().chain(names).collect()),
            Distro::Arch => (
                "pacman",
                ["-S", "--noconfirm", "--needed"]
                    .into_iter()
                    .chain(names)
                    .collect(),
            ),
            Distro::Alpine => ("apk", ["add"].into_iter().chain(names).collect()),
        }
    }
}

pub fn install_packages(mode: Mode, distro: Distro, packages: &[Package]) -> Result<(), ExitError> {
    if let Some((program, args)) = distro.refresh_command() {
        run_or_print(mode, program, &args, "refresh package index")?;
    }
    let (program, args) = distro.install_command(packages);
    let hint = format!("install {}", args[args.len() - packages.len()..].join(" "));
    run_or_print(mode, program, &args, &hint)
}
