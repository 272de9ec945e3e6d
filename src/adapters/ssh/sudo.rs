//! Sudo command wrapping
//!
//! Four password-delivery methods, each producing one remote command
//! string from the caller's command. The password is shell-escaped exactly
//! once per embedding; masking for logs happens at the call sites via
//! [`crate::secrets::SecurePasswordHandler::mask_password`].

use tracing::warn;

use crate::command::{SudoMethod, SudoOptions};
use crate::error::{Error, Result};
use crate::escape::quote_unix;
use crate::secrets::escape_single_quotes;

/// Wrap `command` according to the sudo options. Returns the command
/// unchanged when sudo is disabled.
pub fn apply_sudo(command: &str, sudo: &SudoOptions) -> Result<String> {
    if !sudo.enabled {
        return Ok(command.to_string());
    }

    let user_flag = sudo
        .user
        .as_ref()
        .map(|u| format!("-u {} ", quote_unix(u)))
        .unwrap_or_default();
    let prompt = sudo.prompt.as_deref().unwrap_or("");
    let wrapped = quote_unix(command);

    match sudo.method {
        SudoMethod::Stdin => {
            let password = require_password(sudo)?;
            warn!("sudo stdin method exposes the password to remote process listings");
            Ok(format!(
                "printf '%s\\n' '{}' | sudo -S -p '{}' {}sh -c {}",
                escape_single_quotes(password),
                prompt,
                user_flag,
                wrapped
            ))
        }
        SudoMethod::Echo => {
            let password = require_password(sudo)?;
            warn!(
                "sudo echo method is insecure (password visible in process listings \
                 and shell history); prefer secure-askpass"
            );
            Ok(format!(
                "echo '{}' | sudo -S -p '{}' {}sh -c {}",
                escape_single_quotes(password),
                prompt,
                user_flag,
                wrapped
            ))
        }
        SudoMethod::Askpass => {
            let askpass = sudo.askpass_path.as_deref().ok_or_else(|| {
                Error::adapter("ssh", "askpass method requires an askpass path")
            })?;
            if askpass.trim().is_empty() {
                return Err(Error::adapter("ssh", "invalid askpass path"));
            }
            Ok(format!(
                "SUDO_ASKPASS={} sudo -A {}sh -c {}",
                quote_unix(askpass),
                user_flag,
                wrapped
            ))
        }
        SudoMethod::SecureAskpass => {
            let password = require_password(sudo)?;
            let script = format!(
                "/tmp/askpass-{}.sh",
                uuid::Uuid::new_v4().simple()
            );
            // One &&-joined remote sequence: write the one-shot askpass
            // script (0700), run sudo -A against it, remove the script.
            // The password is embedded exactly once, single-quote escaped.
            let askpass_line = format!("echo '{}'", escape_single_quotes(password));
            Ok(format!(
                "printf '%s\\n' '#!/bin/sh' {} > {script} && chmod 700 {script} && \
                 SUDO_ASKPASS={script} sudo -A {user_flag}sh -c {wrapped} && rm -f {script}",
                quote_unix(&askpass_line),
                script = script,
                user_flag = user_flag,
                wrapped = wrapped,
            ))
        }
    }
}

fn require_password(sudo: &SudoOptions) -> Result<&str> {
    sudo.password
        .as_deref()
        .ok_or_else(|| Error::adapter("ssh", "sudo is enabled but no password is configured"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sudo(method: SudoMethod) -> SudoOptions {
        SudoOptions {
            enabled: true,
            password: Some("pw!".to_string()),
            prompt: None,
            method,
            user: None,
            askpass_path: None,
        }
    }

    #[test]
    fn test_disabled_passes_through() {
        let opts = SudoOptions::default();
        assert_eq!(apply_sudo("whoami", &opts).unwrap(), "whoami");
    }

    #[test]
    fn test_stdin_method_shape() {
        let out = apply_sudo("whoami", &sudo(SudoMethod::Stdin)).unwrap();
        assert!(out.contains("sudo -S"));
        assert!(out.contains("printf '%s\\n' 'pw!'"));
        assert!(out.ends_with("sh -c whoami"));
    }

    #[test]
    fn test_secure_askpass_shape() {
        let out = apply_sudo("whoami", &sudo(SudoMethod::SecureAskpass)).unwrap();
        assert!(out.contains("/tmp/askpass-"));
        assert!(out.contains("chmod 700"));
        assert!(out.contains("sudo -A"));
        assert!(out.contains("rm -f /tmp/askpass-"));
        // Single &&-joined sequence.
        assert_eq!(out.matches(" && ").count(), 3);
        // Password embedded exactly once.
        assert_eq!(out.matches("pw!").count(), 1);
    }

    #[test]
    fn test_secure_askpass_escapes_quotes_once() {
        let mut opts = sudo(SudoMethod::SecureAskpass);
        opts.password = Some("it's".to_string());
        let out = apply_sudo("id", &opts).unwrap();
        // The inner echo line carries the '\'' rewrite; it appears inside
        // an outer single-quoted printf argument.
        assert!(out.contains("it'\\''"));
    }

    #[test]
    fn test_askpass_requires_path() {
        let mut opts = sudo(SudoMethod::Askpass);
        assert!(apply_sudo("id", &opts).is_err());
        opts.askpass_path = Some("/usr/local/bin/askpass".to_string());
        let out = apply_sudo("id", &opts).unwrap();
        assert!(out.starts_with("SUDO_ASKPASS=/usr/local/bin/askpass sudo -A"));
        assert!(!out.contains("pw!"), "askpass method must not embed the password");
    }

    #[test]
    fn test_target_user_flag() {
        let mut opts = sudo(SudoMethod::Stdin);
        opts.user = Some("deploy".to_string());
        let out = apply_sudo("id", &opts).unwrap();
        assert!(out.contains("-u deploy "));
    }
}
