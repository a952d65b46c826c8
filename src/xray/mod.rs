pub mod template;

/// All-in-One fallbacks template published by XTLS.
pub const DEFAULT_TEMPLATE_URL: &str =
    "https://raw.githubusercontent.com/XTLS/Xray-examples/main/All-in-One-fallbacks-Nginx/server.json";

/// Config path used by the official Xray installer.
pub const XRAY_CONFIG_PATH: &str = "/usr/local/etc/xray/config.json";

pub const XRAY_SERVICE_NAME: &str = "xray";
