use std::collections::BTreeMap;
use std::path::Path;

/// Section holding the public entry point every client connects to.
pub const ENTRY_DOMAIN: &str = "entry-domain";

const DEFAULT_SECTION: &str = "DEFAULT";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainEntry {
    /// Section key, e.g. `entry-domain` or `trojan-h2`.
    pub name: String,
    pub address: String,
    pub issue_cert: bool,
}

/// Hostnames of one relay, read from an INI-style file with one section per domain:
///
/// ```ini
/// [entry-domain]
/// address = vpn.example.com
/// issue_cert = true
///
/// [trojan-h2]
/// address = trh2.example.com
/// issue_cert = true
/// ```
///
/// A `[DEFAULT]` section provides fallback values for every other section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainRegistry {
    entries: Vec<DomainEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainsError {
    Read { path: String, reason: String },
    MissingSectionHeader { line: usize },
    InvalidLine { line: usize, content: String },
    DuplicateSection { section: String },
    DuplicateKey { section: String, key: String, line: usize },
    MissingAddress { section: String },
}

impl std::fmt::Display for DomainsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read { path, reason } => write!(f, "read domain registry {path}: {reason}"),
            Self::MissingSectionHeader { line } => {
                write!(f, "domain registry line {line}: key outside of any [section]")
            }
            Self::InvalidLine { line, content } => {
                write!(f, "domain registry line {line}: cannot parse {content:?}")
            }
            Self::DuplicateSection { section } => {
                write!(f, "domain registry: section [{section}] appears more than once")
            }
            Self::DuplicateKey { section, key, line } => {
                write!(
                    f,
                    "domain registry line {line}: key {key:?} repeated in section [{section}]"
                )
            }
            Self::MissingAddress { section } => {
                write!(f, "domain registry: section [{section}] has no address")
            }
        }
    }
}

impl std::error::Error for DomainsError {}

impl DomainRegistry {
    pub fn load(path: &Path) -> Result<Self, DomainsError> {
        let raw = std::fs::read_to_string(path).map_err(|e| DomainsError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, DomainsError> {
        let mut defaults: BTreeMap<String, String> = BTreeMap::new();
        let mut sections: Vec<(String, BTreeMap<String, String>)> = Vec::new();
        let mut in_default = false;

        for (idx, line) in raw.lines().enumerate() {
            let line_no = idx + 1;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                let name = name.trim();
                if name == DEFAULT_SECTION {
                    in_default = true;
                    continue;
                }
                if sections.iter().any(|(n, _)| n == name) {
                    return Err(DomainsError::DuplicateSection {
                        section: name.to_string(),
                    });
                }
                in_default = false;
                sections.push((name.to_string(), BTreeMap::new()));
                continue;
            }

            let Some((key, value)) = split_key_value(line) else {
                return Err(DomainsError::InvalidLine {
                    line: line_no,
                    content: line.to_string(),
                });
            };

            let (section, target) = if in_default {
                (DEFAULT_SECTION, &mut defaults)
            } else {
                match sections.last_mut() {
                    Some((name, kv)) => (name.as_str(), kv),
                    None => return Err(DomainsError::MissingSectionHeader { line: line_no }),
                }
            };
            if target.contains_key(&key) {
                return Err(DomainsError::DuplicateKey {
                    section: section.to_string(),
                    key,
                    line: line_no,
                });
            }
            target.insert(key, value);
        }

        let mut entries = Vec::with_capacity(sections.len());
        for (name, kv) in sections {
            let lookup = |key: &str| kv.get(key).or_else(|| defaults.get(key));
            let address = lookup("address")
                .filter(|a| !a.is_empty())
                .ok_or_else(|| DomainsError::MissingAddress {
                    section: name.clone(),
                })?
                .clone();
            let issue_cert = lookup("issue_cert").is_some_and(|v| parse_flag(v));
            entries.push(DomainEntry {
                name,
                address,
                issue_cert,
            });
        }

        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[DomainEntry] {
        &self.entries
    }

    pub fn get(&self, name: &str) -> Option<&DomainEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn address(&self, name: &str) -> Option<&str> {
        self.get(name).map(|e| e.address.as_str())
    }

    /// All addresses, in file order.
    pub fn addresses(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.address.as_str()).collect()
    }

    /// Addresses flagged `issue_cert`, in file order.
    pub fn issue_cert_addresses(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| e.issue_cert)
            .map(|e| e.address.as_str())
            .collect()
    }
}

fn split_key_value(line: &str) -> Option<(String, String)> {
    let pos = line.find(['=', ':'])?;
    let key = line[..pos].trim();
    if key.is_empty() {
        return None;
    }
    let value = line[pos + 1..].trim();
    Some((key.to_ascii_lowercase(), value.to_string()))
}

// Any non-empty value enables the flag unless it is one of the usual "off" words.
fn parse_flag(v: &str) -> bool {
    let v = v.trim();
    if v.is_empty() {
        return false;
    }
    !matches!(
        v.to_ascii_lowercase().as_str(),
        "0" | "false" | "no" | "off"
    )
}
