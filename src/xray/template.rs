use serde_json::{Value, json};

use crate::domains::DomainRegistry;
use crate::secrets::SecretPair;

/// Tag of the inbound that terminates TLS on :443 and owns the fallbacks.
pub const PRIMARY_INBOUND_TAG: &str = "Vless-TCP-XTLS";
/// Protocols whose HTTP/2 backend is reached through a `@{protocol}-h2` fallback.
pub const H2_FALLBACK_PROTOCOLS: [&str; 3] = ["trojan", "vless", "vmess"];
/// The shadowsocks H2 backend listens on a plain port instead of a named socket.
pub const SHADOWSOCKS_FALLBACK_DEST: u64 = 4003;
pub const SHADOWSOCKS_DOMAIN: &str = "shadowsocks-h2";
pub const OCSP_STAPLING_SECS: u64 = 3600;
pub const DEFAULT_KEYS_DIR: &str = "/keys";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    Parse { reason: String },
    Serialize { reason: String },
    MissingInbounds,
    MissingPrimaryInbound { tag: &'static str },
    MissingTlsSettings { tag: String },
    MissingFallbacks { tag: String },
    MissingFallback { marker: String },
    AmbiguousFallback { marker: String, count: usize },
    MissingDomain { section: String },
}

impl std::fmt::Display for TemplateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse { reason } => write!(f, "template is not valid JSON5: {reason}"),
            Self::Serialize { reason } => write!(f, "serialize xray config: {reason}"),
            Self::MissingInbounds => write!(f, "template has no inbounds array"),
            Self::MissingPrimaryInbound { tag } => {
                write!(f, "template has no inbound tagged {tag}")
            }
            Self::MissingTlsSettings { tag } => {
                write!(f, "inbound {tag} has no streamSettings.tlsSettings")
            }
            Self::MissingFallbacks { tag } => {
                write!(f, "inbound {tag} has no settings.fallbacks")
            }
            Self::MissingFallback { marker } => {
                write!(f, "template has no fallback for {marker}")
            }
            Self::AmbiguousFallback { marker, count } => {
                write!(f, "template has {count} fallbacks matching {marker}, expected 1")
            }
            Self::MissingDomain { section } => {
                write!(f, "domain registry has no [{section}] section")
            }
        }
    }
}

impl std::error::Error for TemplateError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutateOptions {
    /// Directory the ACME client installs `{domain}.pem` / `{domain}-key.pem` into.
    pub keys_dir: String,
}

impl Default for MutateOptions {
    fn default() -> Self {
        Self {
            keys_dir: DEFAULT_KEYS_DIR.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationReport {
    pub ids_rewritten: usize,
    pub passwords_rewritten: usize,
    /// Domains that received a certificate entry, in registry order.
    pub certificates: Vec<String>,
}

/// Parses a template that may use JSON5 relaxations (comments, trailing commas,
/// unquoted keys).
pub fn parse_template(raw: &str) -> Result<Value, TemplateError> {
    let doc: Value = json5::from_str(raw).map_err(|e| TemplateError::Parse {
        reason: e.to_string(),
    })?;
    if !doc.is_object() {
        return Err(TemplateError::Parse {
            reason: "top-level value is not an object".to_string(),
        });
    }
    Ok(doc)
}

/// Strict, pretty-printed JSON with sorted keys and a trailing newline.
pub fn render_config(doc: &Value) -> Result<String, TemplateError> {
    let s = serde_json::to_string_pretty(doc).map_err(|e| TemplateError::Serialize {
        reason: e.to_string(),
    })?;
    Ok(s + "\n")
}

/// `(fullchain, key)` file paths the ACME client installs `domain` into.
pub fn certificate_paths(keys_dir: &str, domain: &str) -> (String, String) {
    let dir = keys_dir.trim_end_matches('/');
    (
        format!("{dir}/{domain}.pem"),
        format!("{dir}/{domain}-key.pem"),
    )
}

pub fn certificate_entries(keys_dir: &str, domains: &[&str]) -> Vec<Value> {
    domains
        .iter()
        .map(|domain| {
            let (certificate_file, key_file) = certificate_paths(keys_dir, domain);
            json!({
                "ocspStapling": OCSP_STAPLING_SECS,
                "certificateFile": certificate_file,
                "keyFile": key_file,
            })
        })
        .collect()
}

/// Turns the generic template into this relay's config.
///
/// Every lookup that can fail runs before the first write, so on error `doc` is
/// left exactly as it was. Applying the same secrets and registry twice yields
/// the same document.
pub fn mutate(
    doc: &mut Value,
    registry: &DomainRegistry,
    secrets: &SecretPair,
    opts: &MutateOptions,
) -> Result<MutationReport, TemplateError> {
    let inbounds = doc
        .get("inbounds")
        .and_then(Value::as_array)
        .ok_or(TemplateError::MissingInbounds)?;
    let primary = find_primary_inbound(inbounds)?;
    let primary_inbound = &inbounds[primary];
    let primary_tag = primary_inbound
        .get("tag")
        .and_then(Value::as_str)
        .unwrap_or(PRIMARY_INBOUND_TAG)
        .to_string();

    if primary_inbound
        .pointer("/streamSettings/tlsSettings")
        .and_then(Value::as_object)
        .is_none()
    {
        return Err(TemplateError::MissingTlsSettings { tag: primary_tag });
    }
    let fallbacks = primary_inbound
        .pointer("/settings/fallbacks")
        .and_then(Value::as_array)
        .ok_or_else(|| TemplateError::MissingFallbacks {
            tag: primary_tag.clone(),
        })?;

    let mut renames: Vec<(usize, String)> = Vec::with_capacity(H2_FALLBACK_PROTOCOLS.len() + 1);
    for protocol in H2_FALLBACK_PROTOCOLS {
        let marker = format!("{protocol}-h2");
        let idx = find_unique_fallback(fallbacks, &marker, |dest| {
            dest.as_str().is_some_and(|s| s.contains(marker.as_str()))
        })?;
        renames.push((idx, domain_address(registry, &marker)?));
    }
    let idx = find_unique_fallback(
        fallbacks,
        &SHADOWSOCKS_FALLBACK_DEST.to_string(),
        is_shadowsocks_dest,
    )?;
    renames.push((idx, domain_address(registry, SHADOWSOCKS_DOMAIN)?));

    let tls_domains = registry.issue_cert_addresses();
    let certificates = certificate_entries(&opts.keys_dir, &tls_domains);

    let mut report = MutationReport {
        certificates: tls_domains.iter().map(|d| d.to_string()).collect(),
        ..MutationReport::default()
    };

    let Some(inbounds) = doc.get_mut("inbounds").and_then(Value::as_array_mut) else {
        return Err(TemplateError::MissingInbounds);
    };
    for inbound in inbounds.iter_mut() {
        report.ids_rewritten += rewrite_client_ids(inbound, &secrets.id);
        report.passwords_rewritten += rewrite_passwords(inbound, &secrets.password);
    }

    let primary_inbound = &mut inbounds[primary];
    if let Some(tls) = primary_inbound
        .pointer_mut("/streamSettings/tlsSettings")
        .and_then(Value::as_object_mut)
    {
        tls.insert("certificates".to_string(), Value::Array(certificates));
    }
    if let Some(fallbacks) = primary_inbound
        .pointer_mut("/settings/fallbacks")
        .and_then(Value::as_array_mut)
    {
        for (idx, name) in renames {
            if let Some(fallback) = fallbacks.get_mut(idx).and_then(Value::as_object_mut) {
                fallback.insert("name".to_string(), Value::String(name));
            }
        }
    }

    Ok(report)
}

fn find_primary_inbound(inbounds: &[Value]) -> Result<usize, TemplateError> {
    let wanted = PRIMARY_INBOUND_TAG.to_ascii_lowercase();
    inbounds
        .iter()
        .position(|inbound| {
            inbound
                .get("tag")
                .and_then(Value::as_str)
                .is_some_and(|tag| tag.to_ascii_lowercase() == wanted)
        })
        .ok_or(TemplateError::MissingPrimaryInbound {
            tag: PRIMARY_INBOUND_TAG,
        })
}

fn find_unique_fallback(
    fallbacks: &[Value],
    marker: &str,
    matches_dest: impl Fn(&Value) -> bool,
) -> Result<usize, TemplateError> {
    let hits: Vec<usize> = fallbacks
        .iter()
        .enumerate()
        .filter(|(_, f)| f.get("dest").is_some_and(&matches_dest))
        .map(|(idx, _)| idx)
        .collect();
    match hits.as_slice() {
        [idx] => Ok(*idx),
        [] => Err(TemplateError::MissingFallback {
            marker: marker.to_string(),
        }),
        many => Err(TemplateError::AmbiguousFallback {
            marker: marker.to_string(),
            count: many.len(),
        }),
    }
}

fn is_shadowsocks_dest(dest: &Value) -> bool {
    match dest {
        Value::Number(n) => {
            n.as_u64() == Some(SHADOWSOCKS_FALLBACK_DEST)
                || n.as_f64() == Some(SHADOWSOCKS_FALLBACK_DEST as f64)
        }
        _ => false,
    }
}

fn domain_address(registry: &DomainRegistry, section: &str) -> Result<String, TemplateError> {
    registry
        .address(section)
        .map(str::to_string)
        .ok_or_else(|| TemplateError::MissingDomain {
            section: section.to_string(),
        })
}

fn clients_mut(inbound: &mut Value) -> Option<&mut Vec<Value>> {
    inbound
        .pointer_mut("/settings/clients")
        .and_then(Value::as_array_mut)
}

fn rewrite_client_ids(inbound: &mut Value, id: &str) -> usize {
    let Some(clients) = clients_mut(inbound) else {
        return 0;
    };
    let mut n = 0;
    for client in clients.iter_mut().filter_map(Value::as_object_mut) {
        if client.contains_key("id") {
            client.insert("id".to_string(), Value::String(id.to_string()));
            n += 1;
        }
    }
    n
}

// Only fields that already hold a non-empty password are replaced.
fn rewrite_passwords(inbound: &mut Value, password: &str) -> usize {
    let mut n = 0;
    if let Some(clients) = clients_mut(inbound) {
        for client in clients.iter_mut().filter_map(Value::as_object_mut) {
            if client.get("password").is_some_and(has_password) {
                client.insert("password".to_string(), Value::String(password.to_string()));
                n += 1;
            }
        }
    }
    if let Some(settings) = inbound.get_mut("settings").and_then(Value::as_object_mut)
        && settings.get("password").is_some_and(has_password)
    {
        settings.insert("password".to_string(), Value::String(password.to_string()));
        n += 1;
    }
    n
}

fn has_password(v: &Value) -> bool {
    match v {
        Value::String(s) => !s.is_empty(),
        Value::Null | Value::Bool(false) => false,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const TEMPLATE: &str = r#"{
  // All-in-One fallbacks, trimmed
  "log": { "loglevel": "warning" },
  "inbounds": [
    {
      "port": 443,
      "protocol": "vless",
      "tag": "Vless-TCP-XTLS",
      "settings": {
        "clients": [
          { "id": "", "flow": "xtls-rprx-vision", "email": "xtls@example.com" },
        ],
        "decryption": "none",
        "fallbacks": [
          { "dest": "@trojan-tcp", "xver": 2 },
          { "path": "/vlws", "dest": "@vless-ws", "xver": 2 },
          { "name": "trh2.example.com", "alpn": "h2", "dest": "@trojan-h2", "xver": 2 },
          { "name": "vlh2.example.com", "alpn": "h2", "dest": "@vless-h2", "xver": 2 },
          { "name": "vmh2.example.com", "alpn": "h2", "dest": "@vmess-h2", "xver": 2 },
          { "name": "ssh2.example.com", "alpn": "h2", "dest": 4003 },
          { "dest": "/dev/shm/h1.sock", "xver": 2 },
        ],
      },
      "streamSettings": {
        "network": "tcp",
        "security": "tls",
        "tlsSettings": {
          "certificates": [
            { "ocspStapling": 3600, "certificateFile": "/etc/ssl/xray/cert.pem", "keyFile": "/etc/ssl/xray/privkey.key" },
          ],
        },
      },
    },
    {
      "listen": "@trojan-tcp",
      "protocol": "trojan",
      "settings": {
        "clients": [ { "password": "desdemona99", "level": 0, "email": "love@example.com" } ],
        "fallbacks": [ { "dest": "8080" } ],
      },
    },
    {
      "listen": "@vless-ws",
      "protocol": "vless",
      "settings": { "clients": [ { "id": "90e4903e-66a4-45f7-abda-fd5d5ed7f797", "level": 0 } ], "decryption": "none" },
    },
    {
      "listen": "@vmess-h2",
      "protocol": "vmess",
      "settings": { "clients": [ { "id": "90e4903e-66a4-45f7-abda-fd5d5ed7f797", "level": 0 } ] },
    },
    {
      listen: "127.0.0.1",
      port: 4003,
      protocol: "shadowsocks",
      settings: { method: "chacha20-ietf-poly1305", password: "desdemona99", network: "tcp,udp" },
    },
  ],
  "outbounds": [ { "protocol": "freedom" } ],
}"#;

    const DOMAINS: &str = "\
[entry-domain]
address = vpn.example.com
issue_cert = true

[trojan-h2]
address = tr.relay.test
issue_cert = true

[vless-h2]
address = vl.relay.test
issue_cert = true

[vmess-h2]
address = vm.relay.test

[shadowsocks-h2]
address = ss.relay.test
issue_cert = true
";

    fn secrets() -> SecretPair {
        SecretPair {
            id: "11111111-1111-1111-1111-111111111111".to_string(),
            password: "Sup3rSecret".to_string(),
        }
    }

    fn fallback_name(doc: &Value, dest: Value) -> Option<String> {
        doc.pointer("/inbounds/0/settings/fallbacks")?
            .as_array()?
            .iter()
            .find(|f| f.get("dest") == Some(&dest))?
            .get("name")?
            .as_str()
            .map(str::to_string)
    }

    fn mutated() -> (Value, MutationReport) {
        let mut doc = parse_template(TEMPLATE).unwrap();
        let registry = DomainRegistry::parse(DOMAINS).unwrap();
        let report = mutate(&mut doc, &registry, &secrets(), &MutateOptions::default()).unwrap();
        (doc, report)
    }

    #[test]
    fn parse_accepts_comments_trailing_commas_and_bare_keys() {
        let doc = parse_template(TEMPLATE).unwrap();
        assert_eq!(doc["inbounds"].as_array().unwrap().len(), 5);
        assert_eq!(doc["inbounds"][4]["port"], json!(4003));
    }

    #[test]
    fn parse_rejects_non_object() {
        assert!(matches!(
            parse_template("[1, 2]"),
            Err(TemplateError::Parse { .. })
        ));
        assert!(matches!(
            parse_template("{ not json"),
            Err(TemplateError::Parse { .. })
        ));
    }

    #[test]
    fn every_client_id_is_rewritten() {
        let (doc, report) = mutated();
        assert_eq!(report.ids_rewritten, 3);
        for inbound in doc["inbounds"].as_array().unwrap() {
            let Some(clients) = inbound.pointer("/settings/clients").and_then(Value::as_array)
            else {
                continue;
            };
            for client in clients {
                if let Some(id) = client.get("id") {
                    assert_eq!(id, "11111111-1111-1111-1111-111111111111");
                }
            }
        }
    }

    #[test]
    fn passwords_are_rewritten_in_clients_and_settings() {
        let (doc, report) = mutated();
        assert_eq!(report.passwords_rewritten, 2);
        assert_eq!(
            doc.pointer("/inbounds/1/settings/clients/0/password"),
            Some(&json!("Sup3rSecret"))
        );
        assert_eq!(
            doc.pointer("/inbounds/4/settings/password"),
            Some(&json!("Sup3rSecret"))
        );
        // vless clients never had a password and must not gain one
        assert_eq!(doc.pointer("/inbounds/2/settings/clients/0/password"), None);
    }

    #[test]
    fn certificates_match_flagged_domains() {
        let (doc, report) = mutated();
        assert_eq!(
            report.certificates,
            [
                "vpn.example.com",
                "tr.relay.test",
                "vl.relay.test",
                "ss.relay.test"
            ]
        );
        let certs = doc
            .pointer("/inbounds/0/streamSettings/tlsSettings/certificates")
            .unwrap();
        assert_eq!(
            certs,
            &json!([
                { "ocspStapling": 3600, "certificateFile": "/keys/vpn.example.com.pem", "keyFile": "/keys/vpn.example.com-key.pem" },
                { "ocspStapling": 3600, "certificateFile": "/keys/tr.relay.test.pem", "keyFile": "/keys/tr.relay.test-key.pem" },
                { "ocspStapling": 3600, "certificateFile": "/keys/vl.relay.test.pem", "keyFile": "/keys/vl.relay.test-key.pem" },
                { "ocspStapling": 3600, "certificateFile": "/keys/ss.relay.test.pem", "keyFile": "/keys/ss.relay.test-key.pem" },
            ])
        );
    }

    #[test]
    fn certificate_paths_follow_keys_dir() {
        let entries = certificate_entries("/srv/keys/", &["a.test"]);
        assert_eq!(
            entries,
            vec![json!({
                "ocspStapling": 3600,
                "certificateFile": "/srv/keys/a.test.pem",
                "keyFile": "/srv/keys/a.test-key.pem",
            })]
        );
    }

    #[test]
    fn fallback_names_come_from_registry() {
        let (doc, _) = mutated();
        assert_eq!(
            fallback_name(&doc, json!("@trojan-h2")).as_deref(),
            Some("tr.relay.test")
        );
        assert_eq!(
            fallback_name(&doc, json!("@vless-h2")).as_deref(),
            Some("vl.relay.test")
        );
        assert_eq!(
            fallback_name(&doc, json!("@vmess-h2")).as_deref(),
            Some("vm.relay.test")
        );
        assert_eq!(
            fallback_name(&doc, json!(4003)).as_deref(),
            Some("ss.relay.test")
        );
        assert_eq!(fallback_name(&doc, json!("@trojan-tcp")), None);
    }

    #[test]
    fn mutation_is_idempotent() {
        let (mut doc, _) = mutated();
        let once = doc.clone();
        let registry = DomainRegistry::parse(DOMAINS).unwrap();
        mutate(&mut doc, &registry, &secrets(), &MutateOptions::default()).unwrap();
        assert_eq!(doc, once);
    }

    #[test]
    fn missing_vless_h2_fallback_fails_without_touching_doc() {
        let raw = TEMPLATE.replace("\"@vless-h2\"", "\"@vless-grpc\"");
        let mut doc = parse_template(&raw).unwrap();
        let before = doc.clone();
        let registry = DomainRegistry::parse(DOMAINS).unwrap();

        let err = mutate(&mut doc, &registry, &secrets(), &MutateOptions::default()).unwrap_err();
        assert_eq!(
            err,
            TemplateError::MissingFallback {
                marker: "vless-h2".to_string()
            }
        );
        assert_eq!(doc, before);
    }

    #[test]
    fn duplicate_fallback_is_ambiguous() {
        let raw = TEMPLATE.replace("\"@vmess-h2\", \"xver\"", "\"@trojan-h2\", \"xver\"");
        let mut doc = parse_template(&raw).unwrap();
        let registry = DomainRegistry::parse(DOMAINS).unwrap();

        let err = mutate(&mut doc, &registry, &secrets(), &MutateOptions::default()).unwrap_err();
        assert_eq!(
            err,
            TemplateError::AmbiguousFallback {
                marker: "trojan-h2".to_string(),
                count: 2
            }
        );
    }

    #[test]
    fn missing_shadowsocks_port_fallback_fails() {
        let raw = TEMPLATE.replace("\"dest\": 4003", "\"dest\": 4004");
        let mut doc = parse_template(&raw).unwrap();
        let registry = DomainRegistry::parse(DOMAINS).unwrap();

        let err = mutate(&mut doc, &registry, &secrets(), &MutateOptions::default()).unwrap_err();
        assert_eq!(
            err,
            TemplateError::MissingFallback {
                marker: "4003".to_string()
            }
        );
    }

    #[test]
    fn primary_inbound_tag_is_case_insensitive_and_required() {
        let raw = TEMPLATE.replace("\"Vless-TCP-XTLS\"", "\"vless-tcp-xtls\"");
        let mut doc = parse_template(&raw).unwrap();
        let registry = DomainRegistry::parse(DOMAINS).unwrap();
        mutate(&mut doc, &registry, &secrets(), &MutateOptions::default()).unwrap();

        let raw = TEMPLATE.replace("\"Vless-TCP-XTLS\"", "\"Vless-TCP\"");
        let mut doc = parse_template(&raw).unwrap();
        let err = mutate(&mut doc, &registry, &secrets(), &MutateOptions::default()).unwrap_err();
        assert_eq!(
            err,
            TemplateError::MissingPrimaryInbound {
                tag: PRIMARY_INBOUND_TAG
            }
        );
    }

    #[test]
    fn missing_registry_section_fails() {
        let mut doc = parse_template(TEMPLATE).unwrap();
        let registry =
            DomainRegistry::parse("[entry-domain]\naddress = vpn.example.com\n").unwrap();
        let err = mutate(&mut doc, &registry, &secrets(), &MutateOptions::default()).unwrap_err();
        assert_eq!(
            err,
            TemplateError::MissingDomain {
                section: "trojan-h2".to_string()
            }
        );
    }

    #[test]
    fn rendered_config_is_strict_json() {
        let (doc, _) = mutated();
        let rendered = render_config(&doc).unwrap();
        assert!(rendered.ends_with("}\n"));
        assert!(!rendered.contains("//"));
        let reparsed: Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(reparsed, doc);
        assert_eq!(render_config(&reparsed).unwrap(), rendered);
    }
}
