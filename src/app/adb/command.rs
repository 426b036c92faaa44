use std::path::Path;

const DEVICE_FLAG: &str = "-s";

/// A fully qualified adb invocation as an argument vector. Never passed through a shell
/// on the host side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdbCommand {
    args: Vec<String>,
    qualified: bool,
}

/// Prefixes `-s <device>` when a device is given and non-empty. With no device, adb picks
/// the only attached device itself (and errors out when there are several).
pub fn build<I, S>(subcommand: I, device: Option<&str>) -> AdbCommand
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let device = device.map(str::trim).filter(|value| !value.is_empty());
    let mut args = Vec::new();
    if let Some(device) = device {
        args.push(DEVICE_FLAG.to_string());
        args.push(device.to_string());
    }
    args.extend(subcommand.into_iter().map(Into::into));
    AdbCommand {
        args,
        qualified: device.is_some(),
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn is_shell_safe(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.' | '/' | ':' | '=' | '@' | '%' | '+' | ',')
}

/// Quotes one argument for the device's `sh`. `adb shell` joins its arguments with
/// spaces before the device shell parses them, so anything beyond plain words must be
/// single-quoted to arrive as one argument.
pub fn quote_device_arg(arg: &str) -> String {
    if !arg.is_empty() && arg.chars().all(is_shell_safe) {
        return arg.to_string();
    }
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('\'');
    for ch in arg.chars() {
        match ch {
            '\'' => quoted.push_str("'\\''"),
            other => quoted.push(other),
        }
    }
    quoted.push('\'');
    quoted
}

impl AdbCommand {
    /// Each argument reaches the device command as exactly one word.
    pub fn shell<I, S>(device: Option<&str>, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut sub = vec!["shell".to_string()];
        sub.extend(command.into_iter().map(|arg| quote_device_arg(&arg.into())));
        build(sub, device)
    }

    /// A script the device shell interprets as written (globs included). Callers quote
    /// any variable parts with [`quote_device_arg`].
    pub fn shell_script(device: Option<&str>, script: impl Into<String>) -> Self {
        build(["shell".to_string(), script.into()], device)
    }

    pub fn push(device: Option<&str>, local: impl AsRef<Path>, remote: &str) -> Self {
        build(
            ["push".to_string(), path_arg(local.as_ref()), remote.to_string()],
            device,
        )
    }

    pub fn pull(device: Option<&str>, remote: &str, local: impl AsRef<Path>) -> Self {
        build(
            ["pull".to_string(), remote.to_string(), path_arg(local.as_ref())],
            device,
        )
    }

    pub fn exec_out<I, S>(device: Option<&str>, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut sub = vec!["exec-out".to_string()];
        sub.extend(command.into_iter().map(|arg| quote_device_arg(&arg.into())));
        build(sub, device)
    }

    pub fn devices() -> Self {
        build(["devices", "-l"], None)
    }

    pub fn connect(address: &str) -> Self {
        build(["connect", address.trim()], None)
    }

    pub fn root(device: Option<&str>) -> Self {
        build(["root"], device)
    }

    pub fn version() -> Self {
        build(["version"], None)
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn device(&self) -> Option<&str> {
        if self.qualified {
            self.args.get(1).map(String::as_str)
        } else {
            None
        }
    }

    /// The part after the device qualifier.
    pub fn subcommand(&self) -> &[String] {
        if self.qualified {
            &self.args[2..]
        } else {
            &self.args
        }
    }

    /// Human-readable rendering for logs and error messages.
    pub fn display(&self) -> String {
        let mut rendered = String::from("adb");
        for arg in &self.args {
            rendered.push(' ');
            if arg.is_empty() || arg.chars().any(char::is_whitespace) {
                rendered.push('"');
                rendered.push_str(&arg.replace('"', "\\\""));
                rendered.push('"');
            } else {
                rendered.push_str(arg);
            }
        }
        rendered
    }
}
