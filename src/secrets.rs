use rand::Rng;
use rand::rngs::OsRng;
use std::path::Path;

use crate::ops::util::write_private_if_changed;

const LOWERCASE: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const UPPERCASE: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &[u8] = b"0123456789";

pub const DEFAULT_PASSWORD_LEN: usize = 16;
pub const DEFAULT_EMAIL_PART_LEN: usize = 8;

/// Character classes a generated password draws from.
///
/// Lowercase letters are always part of the alphabet. Every character is drawn
/// independently from the combined alphabet, so an enabled class is not guaranteed
/// to appear in any particular password.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PasswordPolicy {
    pub len: usize,
    pub use_upper: bool,
    pub use_digits: bool,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            len: DEFAULT_PASSWORD_LEN,
            use_upper: true,
            use_digits: true,
        }
    }
}

impl PasswordPolicy {
    pub fn alphabet(&self) -> Vec<u8> {
        let mut chars = LOWERCASE.to_vec();
        if self.use_upper {
            chars.extend_from_slice(UPPERCASE);
        }
        if self.use_digits {
            chars.extend_from_slice(DIGITS);
        }
        chars
    }
}

pub fn generate_password<R: Rng + ?Sized>(rng: &mut R, policy: &PasswordPolicy) -> String {
    let alphabet = policy.alphabet();
    random_string(rng, &alphabet, policy.len)
}

/// `{user}@{domain}.com`, lowercase letters only.
pub fn generate_email<R: Rng + ?Sized>(rng: &mut R, user_len: usize, domain_len: usize) -> String {
    let user = random_string(rng, LOWERCASE, user_len);
    let domain = random_string(rng, LOWERCASE, domain_len);
    format!("{user}@{domain}.com")
}

pub fn generate_account_email() -> String {
    generate_email(&mut OsRng, DEFAULT_EMAIL_PART_LEN, DEFAULT_EMAIL_PART_LEN)
}

pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn random_string<R: Rng + ?Sized>(rng: &mut R, alphabet: &[u8], len: usize) -> String {
    (0..len)
        .map(|_| alphabet[rng.gen_range(0..alphabet.len())] as char)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretsError {
    Missing { path: String },
    Read { path: String, reason: String },
    Malformed { path: String, reason: String },
    Write { path: String, reason: String },
}

impl std::fmt::Display for SecretsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing { path } => write!(f, "secret file not found: {path}"),
            Self::Read { path, reason } => write!(f, "read secret file {path}: {reason}"),
            Self::Malformed { path, reason } => write!(f, "malformed secret file {path}: {reason}"),
            Self::Write { path, reason } => write!(f, "write secret file {path}: {reason}"),
        }
    }
}

impl std::error::Error for SecretsError {}

/// Client identifier and password shared by the server config and the client links.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretPair {
    pub id: String,
    pub password: String,
}

impl std::fmt::Debug for SecretPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretPair")
            .field("id", &self.id)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl SecretPair {
    pub fn generate() -> Self {
        Self {
            id: generate_id(),
            password: generate_password(&mut OsRng, &PasswordPolicy::default()),
        }
    }

    /// Two lines: identifier, then password.
    pub fn to_file_contents(&self) -> String {
        format!("{}\n{}\n", self.id, self.password)
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        let lines: Vec<&str> = raw
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        match lines.as_slice() {
            [id, password] => Ok(Self {
                id: id.to_string(),
                password: password.to_string(),
            }),
            other => Err(format!("expected 2 non-empty lines, got {}", other.len())),
        }
    }

    pub fn load(path: &Path) -> Result<Self, SecretsError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SecretsError::Missing {
                    path: path.display().to_string(),
                });
            }
            Err(e) => {
                return Err(SecretsError::Read {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                });
            }
        };
        Self::parse(&raw).map_err(|reason| SecretsError::Malformed {
            path: path.display().to_string(),
            reason,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), SecretsError> {
        let to_err = |e: std::io::Error| SecretsError::Write {
            path: path.display().to_string(),
            reason: e.to_string(),
        };
        write_private_if_changed(path, &self.to_file_contents()).map_err(to_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn password_has_requested_length_and_alphabet() {
        let mut rng = StdRng::seed_from_u64(7);
        let policy = PasswordPolicy::default();
        for _ in 0..200 {
            let pw = generate_password(&mut rng, &policy);
            assert_eq!(pw.len(), 16);
            assert!(pw.chars().all(|c| c.is_ascii_alphanumeric()));
        }
    }

    #[test]
    fn password_respects_disabled_classes() {
        let mut rng = StdRng::seed_from_u64(8);
        let policy = PasswordPolicy {
            len: 64,
            use_upper: false,
            use_digits: false,
        };
        for _ in 0..50 {
            let pw = generate_password(&mut rng, &policy);
            assert_eq!(pw.len(), 64);
            assert!(pw.chars().all(|c| c.is_ascii_lowercase()));
        }

        let digits_only_extra = PasswordPolicy {
            len: 32,
            use_upper: false,
            use_digits: true,
        };
        let pw = generate_password(&mut rng, &digits_only_extra);
        assert!(
            pw.chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        );
    }

    #[test]
    fn zero_length_password_is_empty() {
        let mut rng = StdRng::seed_from_u64(9);
        let policy = PasswordPolicy {
            len: 0,
            ..PasswordPolicy::default()
        };
        assert_eq!(generate_password(&mut rng, &policy), "");
    }

    #[test]
    fn email_shape() {
        let mut rng = StdRng::seed_from_u64(10);
        let email = generate_email(&mut rng, 8, 8);
        let (user, rest) = email.split_once('@').unwrap();
        let domain = rest.strip_suffix(".com").unwrap();
        assert_eq!(user.len(), 8);
        assert_eq!(domain.len(), 8);
        assert!(user.chars().chain(domain.chars()).all(|c| c.is_ascii_lowercase()));
    }

    #[test]
    fn generated_id_is_uuid_v4() {
        let id = generate_id();
        let parsed = uuid::Uuid::parse_str(&id).unwrap();
        assert_eq!(parsed.get_version_num(), 4);
    }

    #[test]
    fn pair_save_then_load() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(".confidential");
        let pair = SecretPair::generate();
        pair.save(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw, format!("{}\n{}\n", pair.id, pair.password));
        assert_eq!(SecretPair::load(&path).unwrap(), pair);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn load_distinguishes_missing_and_malformed() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(".confidential");
        assert!(matches!(
            SecretPair::load(&path),
            Err(SecretsError::Missing { .. })
        ));

        std::fs::write(&path, "only-one-line\n").unwrap();
        assert!(matches!(
            SecretPair::load(&path),
            Err(SecretsError::Malformed { .. })
        ));
    }

    #[test]
    fn debug_output_hides_password() {
        let pair = SecretPair {
            id: "id".to_string(),
            password: "hunter2".to_string(),
        };
        assert!(!format!("{pair:?}").contains("hunter2"));
    }
}
