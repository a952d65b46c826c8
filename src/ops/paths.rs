use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Paths {
    root: PathBuf,
}

impl Paths {
    pub fn new(root: PathBuf) -> Self {
        let root = if root.as_os_str().is_empty() {
            PathBuf::from("/")
        } else {
            root
        };
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn map_abs(&self, abs: &Path) -> PathBuf {
        if abs == Path::new("/") {
            return self.root.clone();
        }
        let stripped = abs.strip_prefix("/").unwrap_or(abs);
        self.root.join(stripped)
    }

    pub fn os_release(&self) -> PathBuf {
        self.map_abs(Path::new("/etc/os-release"))
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.map_abs(Path::new("/tmp/relay-ops"))
    }

    pub fn acme_home(&self) -> PathBuf {
        self.map_abs(Path::new("/root/.acme.sh"))
    }

    /// Account files acme.sh writes per CA, ZeroSSL (its historical default) first.
    pub fn acme_account_files(&self) -> [PathBuf; 2] {
        let ca = self.acme_home().join("ca");
        [
            ca.join("acme.zerossl.com/v2/DV90/account.json"),
            ca.join("acme-v02.api.letsencrypt.org/directory/account.json"),
        ]
    }

    pub fn usr_local_etc_xray_dir(&self) -> PathBuf {
        self.map_abs(Path::new("/usr/local/etc/xray"))
    }

    pub fn usr_local_etc_xray_config(&self) -> PathBuf {
        self.map_abs(Path::new(crate::xray::XRAY_CONFIG_PATH))
    }

    pub fn etc_nginx_dir(&self) -> PathBuf {
        self.map_abs(Path::new("/etc/nginx"))
    }

    pub fn etc_nginx_conf(&self) -> PathBuf {
        self.etc_nginx_dir().join("nginx.conf")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_abs_redirects_under_root() {
        let paths = Paths::new(PathBuf::from("/tmp/t"));
        assert_eq!(
            paths.usr_local_etc_xray_config(),
            PathBuf::from("/tmp/t/usr/local/etc/xray/config.json")
        );
        assert_eq!(paths.map_abs(Path::new("/")), PathBuf::from("/tmp/t"));

        let real = Paths::new(PathBuf::new());
        assert_eq!(real.root(), Path::new("/"));
        assert_eq!(
            real.etc_nginx_conf(),
            PathBuf::from("/etc/nginx/nginx.conf")
        );
    }
}
