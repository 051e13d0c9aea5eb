//! Showing the confirmation code to the user.

use std::process::Stdio;

use anyhow::{Context as _, Result, bail};
use async_trait::async_trait;
use tkey_core::Notifier;
use tkey_core::notify::{APP_NAME, CONFIRM_MESSAGE};
use tokio::io::AsyncWriteExt as _;
use tokio::process::Command;
use tracing::debug;

/// Socket-activation variables must not reach helper processes.
const ACTIVATION_VARS: [&str; 2] = ["LISTEN_PID", "LISTEN_FDS"];

fn console_line(otp: &str) -> String {
    format!("{CONFIRM_MESSAGE}: {otp}")
}

/// Prints the code on stdout.
#[derive(Debug, Default)]
pub struct ConsoleNotifier;

#[async_trait]
impl Notifier for ConsoleNotifier {
    async fn notify(&self, otp: &str) {
        println!("{}", console_line(otp));
    }
}

/// Desktop notification through the platform's helper, falling back to the
/// console when the helper is missing or fails.
#[derive(Debug, Default)]
pub struct DesktopNotifier;

#[async_trait]
impl Notifier for DesktopNotifier {
    async fn notify(&self, otp: &str) {
        if let Err(e) = desktop_notify(otp).await {
            debug!(error = %e, "desktop notification failed, printing code");
            println!("{}", console_line(otp));
        }
    }
}

fn helper(program: &str) -> Command {
    let mut cmd = Command::new(program);
    for var in ACTIVATION_VARS {
        cmd.env_remove(var);
    }
    cmd.stdout(Stdio::null()).stderr(Stdio::null());
    cmd
}

async fn run(mut cmd: Command) -> Result<()> {
    let status = cmd.status().await.context("spawn notification helper")?;
    if !status.success() {
        bail!("notification helper exited with {status}");
    }
    Ok(())
}

async fn desktop_notify(otp: &str) -> Result<()> {
    if cfg!(target_os = "macos") {
        let script = format!(
            "display notification \"{otp}\" with title \"{APP_NAME}\" \
             subtitle \"{CONFIRM_MESSAGE}\""
        );
        let mut cmd = helper("osascript");
        cmd.arg("-e").arg(script);
        run(cmd).await
    } else if cfg!(windows) || (cfg!(target_os = "linux") && in_path("msg.exe")) {
        windows_message(otp).await
    } else {
        let mut cmd = helper("notify-send");
        cmd.arg(APP_NAME).arg(format!("{CONFIRM_MESSAGE} \nCode: {otp}"));
        run(cmd).await
    }
}

/// `msg.exe`, which WSL also exposes; the text goes in on stdin.
async fn windows_message(otp: &str) -> Result<()> {
    let mut child = helper("msg.exe")
        .arg("*")
        .stdin(Stdio::piped())
        .spawn()
        .context("spawn msg.exe")?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(format!("{CONFIRM_MESSAGE} \r\nCode: {otp}").as_bytes())
            .await?;
    }
    let status = child.wait().await?;
    if !status.success() {
        bail!("msg.exe exited with {status}");
    }
    Ok(())
}

fn in_path(program: &str) -> bool {
    std::env::var_os("PATH")
        .is_some_and(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
}
