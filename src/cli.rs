//! Interactive control shell
//!
//! ```text
//! list              Show available sites and their state
//! enable <site>     Link, load and start a site
//! disable <site>    Stop a site and remove its link
//! testconf <site>   Parse and validate a site file
//! reload            Resynchronize with sites-enabled
//! log <site>        Follow a site's backend output (Ctrl-C to stop)
//! help              Show this help
//! exit              Leave the shell
//! ```

use crate::error::GatewayError;
use crate::lifecycle::ServerManager;
use crate::process::LogChannel;
use std::future::Future;
use std::io::{self, Write};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

const HELP: &str = "\
Commands:
    list              Show available sites and their state
    enable <site>     Link, load and start a site
    disable <site>    Stop a site and remove its link
    testconf <site>   Parse and validate a site file
    reload            Resynchronize with sites-enabled
    log <site>        Follow a site's backend output (Ctrl-C to stop)
    help              Show this help
    exit              Leave the shell
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    List,
    Enable(String),
    Disable(String),
    TestConf(String),
    Reload,
    Log(String),
    Help,
    Exit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("usage: {0}")]
    Usage(&'static str),

    #[error("unknown command '{0}', type 'help' for the list")]
    Unknown(String),
}

impl ShellCommand {
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let args: Vec<&str> = line.split_whitespace().collect();
        let Some(command) = args.first() else {
            return Ok(ShellCommand::Help);
        };

        let site = |usage: &'static str| match args.as_slice() {
            [_, name] => Ok(name.to_string()),
            _ => Err(ParseError::Usage(usage)),
        };
        let bare = |command: ShellCommand, usage: &'static str| {
            if args.len() == 1 {
                Ok(command)
            } else {
                Err(ParseError::Usage(usage))
            }
        };

        match command.to_ascii_lowercase().as_str() {
            "list" | "ls" => bare(ShellCommand::List, "list"),
            "enable" => site("enable <site>").map(ShellCommand::Enable),
            "disable" => site("disable <site>").map(ShellCommand::Disable),
            "testconf" => site("testconf <site>").map(ShellCommand::TestConf),
            "reload" => bare(ShellCommand::Reload, "reload"),
            "log" | "logs" => site("log <site>").map(ShellCommand::Log),
            "help" | "?" => Ok(ShellCommand::Help),
            "exit" | "quit" => Ok(ShellCommand::Exit),
            other => Err(ParseError::Unknown(other.to_string())),
        }
    }
}

/// Whether the shell keeps reading commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

pub struct Shell {
    manager: Arc<ServerManager>,
}

impl Shell {
    pub fn new(manager: Arc<ServerManager>) -> Self {
        Self { manager }
    }

    /// Read commands from stdin until `exit` or end of input
    pub async fn run(&self) -> io::Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdout = io::stdout();

        loop {
            write!(stdout, "sitegate> ")?;
            stdout.flush()?;

            let Some(line) = lines.next_line().await? else {
                writeln!(stdout)?;
                return Ok(());
            };
            if line.trim().is_empty() {
                continue;
            }

            match ShellCommand::parse(&line) {
                Ok(command) => {
                    if self.execute(command, &mut stdout).await? == Flow::Exit {
                        return Ok(());
                    }
                }
                Err(e) => writeln!(stdout, "{}", e)?,
            }
        }
    }

    /// Run one command and write its output to `out`. Failures of the
    /// command are reported to `out`; only write errors are returned.
    pub async fn execute<W: Write>(&self, command: ShellCommand, out: &mut W) -> io::Result<Flow> {
        debug!(command = ?command, "Shell command");
        match command {
            ShellCommand::List => self.list(out)?,
            ShellCommand::Enable(name) => report(out, self.enable(&name).await, |out| {
                writeln!(out, "site '{}' enabled and started", name)
            })?,
            ShellCommand::Disable(name) => report(out, self.disable(&name).await, |out| {
                writeln!(out, "site '{}' disabled", name)
            })?,
            ShellCommand::TestConf(name) => self.testconf(&name, out)?,
            ShellCommand::Reload => self.reload(out).await?,
            ShellCommand::Log(name) => {
                let server_name = self.server_name(&name);
                match self.manager.backends().log_channel(&server_name) {
                    Some(channel) => {
                        writeln!(out, "following '{}', Ctrl-C to stop", name)?;
                        let interrupt = async {
                            let _ = tokio::signal::ctrl_c().await;
                        };
                        let lines = tail_log(channel, out, interrupt).await?;
                        writeln!(out, "-- {} lines --", lines)?;
                    }
                    None => writeln!(out, "no backend log for site '{}'", name)?,
                }
            }
            ShellCommand::Help => write!(out, "{}", HELP)?,
            ShellCommand::Exit => return Ok(Flow::Exit),
        }
        Ok(Flow::Continue)
    }

    fn list<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let sites = self.manager.sites();
        let available = sites.available_sites();
        if available.is_empty() {
            return writeln!(out, "no sites available");
        }

        writeln!(out, "{:<24} {:<9} {:<8} BACKEND", "SITE", "ENABLED", "STATUS")?;
        for name in available {
            let server_name = self.server_name(&name);
            let enabled = if sites.is_enabled(&name) { "yes" } else { "no" };
            let status = if self.manager.is_running(&server_name) {
                "running"
            } else {
                "stopped"
            };
            let backend = match self.manager.backends().pid(&server_name) {
                Some(pid) if self.manager.backends().is_running(&server_name) => {
                    format!("pid {}", pid)
                }
                _ => "-".to_string(),
            };
            writeln!(out, "{:<24} {:<9} {:<8} {}", name, enabled, status, backend)?;
        }
        Ok(())
    }

    async fn enable(&self, name: &str) -> Result<(), GatewayError> {
        let sites = self.manager.sites();
        sites.enable(name)?;

        let config = match sites.load(name).and_then(|c| c.validate().map(|_| c)) {
            Ok(config) => config,
            Err(e) => {
                // A site that cannot load is not left enabled
                let _ = sites.disable(name);
                return Err(e);
            }
        };

        let server_name = config.server_name.clone();
        self.manager.init_site(config).await?;
        self.manager.start_server(&server_name).await
    }

    async fn disable(&self, name: &str) -> Result<(), GatewayError> {
        let sites = self.manager.sites();
        if !sites.is_enabled(name) {
            return Err(GatewayError::NotEnabled(name.to_string()));
        }

        let server_name = self.server_name(name);
        self.manager.stop_server_if_running(&server_name).await?;
        self.manager.backends().stop(&server_name).await;
        self.manager.registry().remove(&server_name);
        sites.disable(name)
    }

    fn testconf<W: Write>(&self, name: &str, out: &mut W) -> io::Result<()> {
        match self.manager.sites().load(name).and_then(|c| c.validate().map(|_| c)) {
            Ok(config) => {
                writeln!(out, "configuration of '{}' is valid", name)?;
                writeln!(out, "  server_name  {}", config.server_name)?;
                writeln!(out, "  listen       {}", config.listen)?;
                writeln!(out, "  root         {}", config.root.display())?;
                if config.wants_auto_cert() {
                    writeln!(out, "  tls          automatic")?;
                } else if config.uses_manual_tls() {
                    writeln!(out, "  tls          certificate files")?;
                }
                if let Some(backend) = &config.backend {
                    writeln!(
                        out,
                        "  backend      {} -> 127.0.0.1:{} ({})",
                        backend.route,
                        backend.internal_port,
                        backend.entry_path().display()
                    )?;
                }
                Ok(())
            }
            Err(e) => writeln!(out, "error: {}", e),
        }
    }

    async fn reload<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let report = self.manager.reload().await;
        writeln!(out, "reloaded, {} site(s) running", report.running.len())?;
        for (name, error) in &report.failed {
            writeln!(out, "  {}: {}", name, error)?;
        }
        Ok(())
    }

    /// Lifecycle name of a site directory. Falls back to the directory name
    /// when the file cannot be parsed.
    fn server_name(&self, name: &str) -> String {
        self.manager
            .sites()
            .load(name)
            .map(|c| c.server_name.to_ascii_lowercase())
            .unwrap_or_else(|_| name.to_ascii_lowercase())
    }
}

fn report<W, F>(out: &mut W, result: Result<(), GatewayError>, on_success: F) -> io::Result<()>
where
    W: Write,
    F: FnOnce(&mut W) -> io::Result<()>,
{
    match result {
        Ok(()) => on_success(out),
        Err(e) => writeln!(out, "error: {}", e),
    }
}

/// Copy log lines to `out` until the channel closes or `interrupt` fires.
/// Returns the number of lines written.
pub async fn tail_log<W, F>(channel: LogChannel, out: &mut W, interrupt: F) -> io::Result<usize>
where
    W: Write,
    F: Future<Output = ()>,
{
    tokio::pin!(interrupt);
    let mut count = 0;

    loop {
        tokio::select! {
            line = channel.recv() => match line {
                Some(line) => {
                    writeln!(out, "{}", line)?;
                    out.flush()?;
                    count += 1;
                }
                None => return Ok(count),
            },
            _ = &mut interrupt => return Ok(count),
        }
    }
}
