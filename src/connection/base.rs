//! State and behavior shared by all transports.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{ConnectionConfig, ConnectionError, ConnectionResult};

/// Privilege escalation method
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BecomeMethod {
    /// `sudo [-u user] cmd`
    Sudo,
    /// `su - [user] -c 'cmd'`
    Su,
    /// `doas [-u user] cmd`
    Doas,
    /// Any other method, prefixed verbatim
    Other(String),
}

impl BecomeMethod {
    /// Parse a method name; an empty name means sudo
    pub fn parse(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "" | "sudo" => BecomeMethod::Sudo,
            "su" => BecomeMethod::Su,
            "doas" => BecomeMethod::Doas,
            _ => BecomeMethod::Other(name.trim().to_string()),
        }
    }

    /// Wrap `command` so it runs as `user`
    ///
    /// Prefix-style methods only escalate the first word of their argument,
    /// so compound scripts are handed to `/bin/sh -c` under the prefix.
    pub fn wrap(&self, command: &str, user: Option<&str>) -> String {
        let script;
        let command = if !matches!(self, BecomeMethod::Su) && is_compound(command) {
            script = format!("/bin/sh -c {}", shell_quote(command));
            script.as_str()
        } else {
            command
        };
        match (self, user) {
            (BecomeMethod::Sudo, Some(user)) => format!("sudo -u {} {}", user, command),
            (BecomeMethod::Sudo, None) => format!("sudo {}", command),
            (BecomeMethod::Su, Some(user)) => {
                format!("su - {} -c {}", user, shell_quote(command))
            }
            (BecomeMethod::Su, None) => format!("su - -c {}", shell_quote(command)),
            (BecomeMethod::Doas, Some(user)) => format!("doas -u {} {}", user, command),
            (BecomeMethod::Doas, None) => format!("doas {}", command),
            (BecomeMethod::Other(method), _) => format!("{} {}", method, command),
        }
    }
}

impl fmt::Display for BecomeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BecomeMethod::Sudo => f.write_str("sudo"),
            BecomeMethod::Su => f.write_str("su"),
            BecomeMethod::Doas => f.write_str("doas"),
            BecomeMethod::Other(method) => f.write_str(method),
        }
    }
}

/// Quote a string for POSIX shells using single quotes
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Whether `command` has shell syntax outside quotes, or starts with a builtin
pub fn is_compound(command: &str) -> bool {
    const BUILTINS: &[&str] = &["cd", "export", "set", "unset", ".", "source", "exec", "umask", "ulimit"];

    if command
        .split_whitespace()
        .next()
        .map_or(false, |word| BUILTINS.contains(&word))
    {
        return true;
    }

    let mut chars = command.chars().peekable();
    let mut single = false;
    let mut double = false;
    while let Some(c) = chars.next() {
        match c {
            '\\' if !single => {
                chars.next();
            }
            '\'' if !double => single = !single,
            '"' if !single => double = !double,
            '`' if !single => return true,
            '$' if !single && chars.peek() == Some(&'(') => return true,
            ';' | '&' | '|' | '<' | '>' | '\n' | '(' | ')' if !single && !double => return true,
            _ => {}
        }
    }
    false
}

/// Configuration plus connected flag, embedded in every transport
#[derive(Debug)]
pub struct BaseConnection {
    config: ConnectionConfig,
    connected: AtomicBool,
}

impl BaseConnection {
    /// Create disconnected state for `config`
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            connected: AtomicBool::new(false),
        }
    }

    /// The connection configuration
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Whether the transport reported a successful connect
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Update the connected flag
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Fail with [`ConnectionError::NotConnected`] unless connected
    pub fn ensure_connected(&self) -> ConnectionResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ConnectionError::NotConnected)
        }
    }

    /// The configured escalation method
    pub fn become_method(&self) -> BecomeMethod {
        BecomeMethod::parse(self.config.become_method.as_deref().unwrap_or(""))
    }

    /// Rewrite `command` for privilege escalation.
    ///
    /// Returns the command unchanged when escalation is disabled.
    pub fn apply_become(&self, command: &str) -> String {
        if !self.config.r#become {
            return command.to_string();
        }
        self.become_method()
            .wrap(command, self.config.become_user.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(method: Option<&str>, user: Option<&str>) -> BaseConnection {
        let mut config = ConnectionConfig::new("web1");
        config.r#become = true;
        config.become_method = method.map(String::from);
        config.become_user = user.map(String::from);
        BaseConnection::new(config)
    }

    #[test]
    fn test_become_disabled_is_identity() {
        let base = BaseConnection::new(ConnectionConfig::new("web1"));
        assert_eq!(base.apply_become("whoami"), "whoami");
    }

    #[test]
    fn test_sudo_with_user() {
        assert_eq!(
            base(Some("sudo"), Some("root")).apply_become("whoami"),
            "sudo -u root whoami"
        );
    }

    #[test]
    fn test_sudo_without_user() {
        assert_eq!(base(Some("sudo"), None).apply_become("whoami"), "sudo whoami");
    }

    #[test]
    fn test_default_method_is_sudo() {
        assert_eq!(
            base(None, Some("app")).apply_become("id"),
            "sudo -u app id"
        );
    }

    #[test]
    fn test_su_quotes_command() {
        assert_eq!(
            base(Some("su"), Some("root")).apply_become("whoami"),
            "su - root -c 'whoami'"
        );
        assert_eq!(
            base(Some("su"), None).apply_become("echo 'hi'"),
            "su - -c 'echo '\\''hi'\\'''"
        );
    }

    #[test]
    fn test_doas() {
        assert_eq!(
            base(Some("doas"), Some("root")).apply_become("whoami"),
            "doas -u root whoami"
        );
        assert_eq!(base(Some("doas"), None).apply_become("whoami"), "doas whoami");
    }

    #[test]
    fn test_unknown_method_prefixes() {
        assert_eq!(
            base(Some("pbrun"), Some("root")).apply_become("whoami"),
            "pbrun whoami"
        );
    }

    #[test]
    fn test_sudo_runs_compound_script_in_shell() {
        assert_eq!(
            base(Some("sudo"), Some("root")).apply_become("cd '/tmp' && pwd"),
            "sudo -u root /bin/sh -c 'cd '\\''/tmp'\\'' && pwd'"
        );
        assert_eq!(
            base(Some("doas"), None).apply_become("cat > /etc/motd"),
            "doas /bin/sh -c 'cat > /etc/motd'"
        );
    }

    #[test]
    fn test_su_compound_is_not_double_wrapped() {
        assert_eq!(
            base(Some("su"), Some("root")).apply_become("id; pwd"),
            "su - root -c 'id; pwd'"
        );
    }

    #[test]
    fn test_is_compound() {
        assert!(!is_compound("whoami"));
        assert!(!is_compound("echo 'a;b' \"x|y\""));
        assert!(!is_compound("/bin/sh -c 'echo $HOME | wc -c'"));
        assert!(is_compound("mkdir -p /a && chmod 755 /a"));
        assert!(is_compound("echo \"$(id -u)\""));
        assert!(is_compound("export A=1"));
        assert!(is_compound("cd /tmp"));
        assert!(is_compound("cat <<'EOF'\nhi\nEOF"));
    }

    #[test]
    fn test_connected_flag() {
        let base = BaseConnection::new(ConnectionConfig::new("web1"));
        assert!(matches!(
            base.ensure_connected(),
            Err(ConnectionError::NotConnected)
        ));
        base.set_connected(true);
        assert!(base.ensure_connected().is_ok());
    }
}
