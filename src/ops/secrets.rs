use crate::ops::cli::{ExitError, FileArgs, SecretsShowArgs};
use crate::ops::context::RunCtx;
use crate::ops::paths::Paths;
use crate::ops::util::Mode;

pub async fn cmd_secrets_show(
    paths: Paths,
    files: FileArgs,
    args: SecretsShowArgs,
) -> Result<(), ExitError> {
    let ctx = RunCtx::new(paths, files, Mode::Real);
    let secrets = ctx.load_secrets()?;

    let password = if args.reveal {
        secrets.password
    } else {
        redact(&secrets.password)
    };
    println!("id: {}", secrets.id);
    println!("password: {password}");
    Ok(())
}

fn redact(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    let len = chars.len();
    if len <= 8 {
        return "*".repeat(len);
    }
    let head: String = chars[..2].iter().collect();
    let tail: String = chars[len - 2..].iter().collect();
    format!("{head}{}{tail}", "*".repeat(len - 4))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_keeps_only_the_edges() {
        assert_eq!(redact(""), "");
        assert_eq!(redact("short"), "*****");
        assert_eq!(redact("abcdefghijklmnop"), "ab************op");
    }
}
