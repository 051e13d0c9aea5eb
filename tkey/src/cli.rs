//! Command-line parsing.

use std::path::PathBuf;

use anyhow::{Result, bail};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shell {
    Bash,
    Fish,
}

impl Shell {
    /// The line that points `SSH_AUTH_SOCK` at `socket`.
    pub fn export_line(self, socket: &str) -> String {
        match self {
            Self::Bash => format!("export SSH_AUTH_SOCK='{socket}'"),
            Self::Fish => format!("setenv SSH_AUTH_SOCK '{socket}'"),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct AgentArgs {
    pub config: PathBuf,
    pub socket: PathBuf,
    /// Overrides the configured backend; empty disables it.
    pub proxy: Option<String>,
    pub shell: Shell,
    pub quiet: bool,
    pub systemd: bool,
    /// Print confirmation codes instead of raising a desktop notification.
    pub console: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Agent(AgentArgs),
    Config { config: PathBuf, proxy: Option<String> },
    Help,
}

pub fn print_help() {
    println!(
        "\
tkey - SSH agent that signs through a remote trust authority

USAGE:
    tkey <command> [options]

COMMANDS:
    agent                               Run the agent
      --config <path>                   Config file (default: ~/.config/tk-ssh.json)
      --socket <path>                   Socket to listen on (default: {socket})
      --proxy <path>                    Forward unknown keys to the agent at <path>
      --shell bash|fish                 Syntax of the SSH_AUTH_SOCK line (default: bash)
      --quiet                           Do not print the SSH_AUTH_SOCK line
      --systemd                         Listen on sockets passed by systemd
      --console                         Print confirmation codes instead of notifying

    config                              Edit the config file
      --config <path>                   Config file (default: ~/.config/tk-ssh.json)
      --proxy <path>                    Set the default backend agent ('' clears it)

    help                                Show this help

Set RUST_LOG to adjust log verbosity.",
        socket = default_socket_path().display()
    );
}

/// Parse everything after the program name.
pub fn parse(args: &[String]) -> Result<Command> {
    let Some((cmd, rest)) = args.split_first() else {
        return Ok(Command::Help);
    };
    match cmd.as_str() {
        "agent" => parse_agent(rest).map(Command::Agent),
        "config" => parse_config(rest),
        "help" | "--help" | "-h" => Ok(Command::Help),
        other => bail!("unknown command: {other}"),
    }
}

/// Splits `--name value`, `--name=value`, and the single-dash forms.
struct Flags<'a> {
    args: std::slice::Iter<'a, String>,
}

impl<'a> Flags<'a> {
    fn new(args: &'a [String]) -> Self {
        Self { args: args.iter() }
    }

    /// Next flag name with its inline value, if any.
    fn next_flag(&mut self) -> Option<Result<(&'a str, Option<&'a str>)>> {
        let arg = self.args.next()?;
        let Some(flag) = arg.strip_prefix("--").or_else(|| arg.strip_prefix('-')) else {
            return Some(Err(anyhow::anyhow!("unexpected argument: {arg}")));
        };
        Some(Ok(match flag.split_once('=') {
            Some((name, value)) => (name, Some(value)),
            None => (flag, None),
        }))
    }

    fn value(&mut self, name: &str, inline: Option<&'a str>) -> Result<&'a str> {
        match inline {
            Some(value) => Ok(value),
            None => match self.args.next() {
                Some(value) => Ok(value.as_str()),
                None => bail!("--{name} requires a value"),
            },
        }
    }
}

fn parse_agent(args: &[String]) -> Result<AgentArgs> {
    let mut parsed = AgentArgs {
        config: tkey_core::config::default_config_path(),
        socket: default_socket_path(),
        proxy: None,
        shell: Shell::Bash,
        quiet: false,
        systemd: false,
        console: false,
    };

    let mut flags = Flags::new(args);
    while let Some(flag) = flags.next_flag() {
        let (name, inline) = flag?;
        match name {
            "config" | "c" => parsed.config = flags.value(name, inline)?.into(),
            "socket" => parsed.socket = flags.value(name, inline)?.into(),
            "proxy" => parsed.proxy = Some(flags.value(name, inline)?.to_string()),
            "shell" => {
                parsed.shell = match flags.value(name, inline)? {
                    "bash" => Shell::Bash,
                    "fish" => Shell::Fish,
                    other => bail!("unsupported shell '{other}': use bash or fish"),
                }
            }
            "quiet" | "q" => parsed.quiet = true,
            "systemd" => parsed.systemd = true,
            "console" => parsed.console = true,
            other => bail!("unknown option for agent: --{other}"),
        }
    }
    Ok(parsed)
}

fn parse_config(args: &[String]) -> Result<Command> {
    let mut config = tkey_core::config::default_config_path();
    let mut proxy = None;

    let mut flags = Flags::new(args);
    while let Some(flag) = flags.next_flag() {
        let (name, inline) = flag?;
        match name {
            "config" | "c" => config = flags.value(name, inline)?.into(),
            "proxy" => proxy = Some(flags.value(name, inline)?.to_string()),
            other => bail!("unknown option for config: --{other}"),
        }
    }
    Ok(Command::Config { config, proxy })
}

const SOCKET_NAME: &str = "tk-ssh-auth.sock";

/// `$XDG_RUNTIME_DIR` on Linux, `$TMPDIR` on macOS, `/tmp` otherwise.
pub fn default_socket_path() -> PathBuf {
    let dir = if cfg!(target_os = "linux") {
        std::env::var_os("XDG_RUNTIME_DIR")
    } else if cfg!(target_os = "macos") {
        std::env::var_os("TMPDIR")
    } else {
        None
    };
    dir.filter(|d| !d.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(SOCKET_NAME)
}
