use crate::domains::{DomainRegistry, ENTRY_DOMAIN};
use crate::secrets::SecretPair;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTemplate {
    pub protocol: &'static str,
    pub transport: &'static str,
    pub template: &'static str,
}

impl LinkTemplate {
    /// HTTP/2 links carry a per-protocol SNI taken from the `{protocol}-h2` domain.
    pub fn needs_sni(&self) -> bool {
        self.transport == "h2"
    }

    pub fn sni_section(&self) -> String {
        format!("{}-{}", self.protocol, self.transport)
    }
}

pub const LINK_TEMPLATES: [LinkTemplate; 8] = [
    LinkTemplate {
        protocol: "trojan",
        transport: "tcp",
        template: "trojan://{password}@{entryaddress}:443?security=tls&type=tcp#Trojan-TCP",
    },
    LinkTemplate {
        protocol: "trojan",
        transport: "ws",
        template: "trojan://{password}@{entryaddress}:443?security=tls&type=ws&path=/trojanws?ed=2048#Trojan-WS",
    },
    LinkTemplate {
        protocol: "trojan",
        transport: "grpc",
        template: "trojan://{password}@{entryaddress}:443?security=tls&type=grpc&serviceName=trgrpc#Trojan-gRPC",
    },
    LinkTemplate {
        protocol: "trojan",
        transport: "h2",
        template: "trojan://{password}@{entryaddress}:443?sni={sni}&security=tls&type=http&path=/trh2#Trojan-H2",
    },
    LinkTemplate {
        protocol: "vless",
        transport: "tcp",
        template: "vless://{uuid}@{entryaddress}:443?security=tls&type=tcp#Vless-TCP",
    },
    LinkTemplate {
        protocol: "vless",
        transport: "ws",
        template: "vless://{uuid}@{entryaddress}:443?security=tls&type=ws&path=/vlws?ed%3D204&host={entryaddress}#Vless-WS",
    },
    LinkTemplate {
        protocol: "vless",
        transport: "grpc",
        template: "vless://{uuid}@{entryaddress}:443?security=tls&type=grpc&serviceName=vlgrpc#Vless-gRPC",
    },
    LinkTemplate {
        protocol: "vless",
        transport: "h2",
        template: "vless://{uuid}@{entryaddress}:443?sni={sni}&security=tls&type=http&path=/vlh2#Vless-H2",
    },
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    MissingDomain { section: String },
}

impl std::fmt::Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingDomain { section } => {
                write!(f, "domain registry has no [{section}] section")
            }
        }
    }
}

impl std::error::Error for LinkError {}

/// One URI per template, in template order.
pub fn build_raw_lines(
    registry: &DomainRegistry,
    secrets: &SecretPair,
) -> Result<Vec<String>, LinkError> {
    let entry = registry
        .address(ENTRY_DOMAIN)
        .ok_or_else(|| LinkError::MissingDomain {
            section: ENTRY_DOMAIN.to_string(),
        })?;
    render_lines(entry, secrets, |section| registry.address(section))
}

/// Newline-separated, without a trailing newline.
pub fn build_raw_text(registry: &DomainRegistry, secrets: &SecretPair) -> Result<String, LinkError> {
    Ok(build_raw_lines(registry, secrets)?.join("\n"))
}

pub fn render_lines<'a>(
    entry_address: &str,
    secrets: &SecretPair,
    sni_for: impl Fn(&str) -> Option<&'a str>,
) -> Result<Vec<String>, LinkError> {
    LINK_TEMPLATES
        .iter()
        .map(|t| -> Result<String, LinkError> {
            let sni = if t.needs_sni() {
                let section = t.sni_section();
                Some(sni_for(&section).ok_or(LinkError::MissingDomain { section })?)
            } else {
                None
            };
            Ok(substitute(t.template, |field| match field {
                "entryaddress" => Some(entry_address),
                "uuid" => Some(secrets.id.as_str()),
                "password" => Some(secrets.password.as_str()),
                "sni" => sni,
                _ => None,
            }))
        })
        .collect()
}

// Single left-to-right pass so substituted values are never re-expanded.
// Unknown `{name}` placeholders are kept verbatim.
fn substitute<'v>(template: &str, lookup: impl Fn(&str) -> Option<&'v str>) -> String {
    let mut out = String::with_capacity(template.len() + 64);
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let name = &after[..close];
                match lookup(name) {
                    Some(v) => out.push_str(v),
                    None => {
                        out.push('{');
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
