//! # Command Line Interface
//!
//! Argument parsing and command implementations for syncpair.
//!
//! ## Commands
//!
//! - `init` - Write a default configuration file
//! - `run` - Start the node and an interactive console
//! - `status` - Show the saved node record
//! - `folder` - Select the sync folder
//! - `port` - Change the listening port
//!
//! The console started by `run` takes the commands `connect`, `port`,
//! `folder`, `sync`, `status`, `help` and `quit`. Pairing requests from the
//! peer show up as `[y/N]` questions on the same console.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use colored::*;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::address::PeerAddress;
use crate::config::Config;
use crate::frontend::{Frontend, LogFrontend, PairingPolicy};
use crate::node::{NodeStatus, Startup, SyncNode};

#[derive(Parser)]
#[command(name = "syncpair")]
#[command(about = "Mirror a folder between two paired machines")]
#[command(version = "1.0.0")]
pub struct Cli {
    /// Configuration file to use instead of the default location
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Node record file to use instead of the configured one
    #[arg(long, global = true)]
    pub state: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a default configuration file
    Init,

    /// Start the node with an interactive console
    Run(RunArgs),

    /// Show the saved node record
    Status,

    /// Select the sync folder without starting the node
    Folder {
        /// Folder whose top-level files are mirrored
        path: PathBuf,
    },

    /// Change the listening port without starting the node
    Port {
        #[arg(value_parser = clap::value_parser!(u16).range(1024..))]
        port: u16,
    },
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Listen on this port (saved for later runs)
    #[arg(short, long, value_parser = clap::value_parser!(u16).range(1024..))]
    pub port: Option<u16>,

    /// Select this sync folder before starting
    #[arg(short, long)]
    pub folder: Option<PathBuf>,

    /// How to answer pairing requests
    #[arg(long, value_enum)]
    pub pairing: Option<PairingPolicy>,

    /// Host to advertise and bind instead of the detected one
    #[arg(long)]
    pub host: Option<String>,
}

/// A line typed at the `run` console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Connect(String),
    Port(String),
    Folder(PathBuf),
    Sync,
    Status,
    Help,
    Quit,
}

impl ConsoleCommand {
    /// `Ok(None)` for a blank line, `Err` with a usage hint otherwise.
    pub fn parse(line: &str) -> std::result::Result<Option<Self>, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        let (word, rest) = line
            .split_once(char::is_whitespace)
            .map(|(word, rest)| (word, rest.trim()))
            .unwrap_or((line, ""));
        let argument = |what: &str| {
            if rest.is_empty() {
                Err(format!("usage: {word} <{what}>"))
            } else {
                Ok(rest.to_string())
            }
        };

        let command = match word.to_ascii_lowercase().as_str() {
            "connect" => Self::Connect(argument("host:port")?),
            "port" => Self::Port(argument("port")?),
            "folder" => Self::Folder(PathBuf::from(argument("path")?)),
            "sync" => Self::Sync,
            "status" => Self::Status,
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => return Err(format!("unknown command {other:?}, type 'help'")),
        };
        Ok(Some(command))
    }
}

struct PairingPrompt {
    question: String,
    reply: oneshot::Sender<bool>,
}

/// Front end for the `run` console. Consent questions are handed to the
/// console loop, which owns stdin.
pub struct ConsoleFrontend {
    prompts: mpsc::UnboundedSender<PairingPrompt>,
    policy: PairingPolicy,
}

#[async_trait::async_trait]
impl Frontend for ConsoleFrontend {
    fn notify(&self, title: &str, message: &str) {
        println!("{} {}", format!("{title}:").green().bold(), message);
    }

    fn warn(&self, title: &str, message: &str) {
        println!("{} {}", format!("{title}:").yellow().bold(), message);
    }

    fn report_error(&self, title: &str, message: &str) {
        eprintln!("{} {}", format!("{title}:").red().bold(), message.red());
    }

    async fn confirm(&self, title: &str, message: &str) -> bool {
        match self.policy {
            PairingPolicy::Always => return true,
            PairingPolicy::Never => return false,
            PairingPolicy::Ask => {}
        }

        let (reply, answer) = oneshot::channel();
        let prompt = PairingPrompt {
            question: format!("{title}: {message}"),
            reply,
        };
        if self.prompts.send(prompt).is_err() {
            return false;
        }
        answer.await.unwrap_or(false)
    }
}

pub async fn init(config_path: Option<PathBuf>) -> Result<()> {
    info!("Initializing syncpair...");

    let config = Config::init(config_path.as_deref()).await?;
    println!("✅ Configuration written to {}", config.config_path().display());
    println!("   Node state will be kept in {}", config.state_path()?.display());
    println!("   Start the node with: syncpair run --folder <path>");
    Ok(())
}

/// Start the node and drive it from the terminal until `quit` or Ctrl-C.
pub async fn run(config_path: Option<PathBuf>, state: Option<PathBuf>, args: RunArgs) -> Result<()> {
    let config = Config::load(config_path.as_deref()).await?;
    let options = config.node_options(args.host, state)?;
    let policy = args.pairing.unwrap_or(config.pairing);

    let (prompts, prompt_rx) = mpsc::unbounded_channel();
    let frontend = Arc::new(ConsoleFrontend { prompts, policy });
    let (node, startup) = SyncNode::open(options, frontend);
    describe_startup(&node, &startup);

    if let Some(port) = args.port {
        node.set_port(port).await?;
    }
    if let Some(folder) = args.folder {
        node.set_directory(folder).await?;
    }
    node.start().await?;

    println!("💚 syncpair is running as {}. Type 'help' for commands.", node.address());
    let result = console(Arc::clone(&node), prompt_rx).await;

    println!("🛑 syncpair stopping...");
    node.shutdown().await?;
    result
}

pub async fn show_status(config_path: Option<PathBuf>, state: Option<PathBuf>) -> Result<()> {
    let node = open_offline(config_path.as_deref(), state).await?;
    print_status(&node.status().await);
    Ok(())
}

pub async fn set_folder(config_path: Option<PathBuf>, state: Option<PathBuf>, path: PathBuf) -> Result<()> {
    let node = open_offline(config_path.as_deref(), state).await?;
    let changes = node.set_directory(path).await?;

    if let Some(folder) = node.directory() {
        println!("✅ Sync folder set to {}", folder.display());
    }
    println!("   {} file(s) will be sent on the next sync", changes.changes.len());
    Ok(())
}

pub async fn set_port(config_path: Option<PathBuf>, state: Option<PathBuf>, port: u16) -> Result<()> {
    let node = open_offline(config_path.as_deref(), state).await?;
    node.set_port(port).await?;

    println!("✅ Port set to {}", port);
    println!("   Your peer has to connect to {} again", node.address());
    Ok(())
}

async fn open_offline(config_path: Option<&Path>, state: Option<PathBuf>) -> Result<Arc<SyncNode>> {
    let config = Config::load(config_path).await?;
    let options = config.node_options(None, state)?;
    let (node, _) = SyncNode::open(options, Arc::new(LogFrontend::new(config.pairing)));
    Ok(node)
}

fn describe_startup(node: &SyncNode, startup: &Startup) {
    match startup {
        Startup::Restored => match node.peer() {
            Some(peer) => println!("🔄 Restored node state, paired with {}", peer),
            None => println!("🔄 Restored node state, not paired yet"),
        },
        Startup::Fresh => println!("🆕 No saved node state, starting fresh"),
        // The node already reported the corruption through the front end.
        Startup::Recovered(_) => {}
    }
}

async fn console(node: Arc<SyncNode>, mut prompts: mpsc::UnboundedReceiver<PairingPrompt>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut questions: VecDeque<PairingPrompt> = VecDeque::new();
    let mut running: Option<JoinHandle<Result<()>>> = None;

    print_help();
    loop {
        tokio::select! {
            Some(prompt) = prompts.recv() => {
                if stdin_open {
                    println!("{} {} [y/N]", "?".cyan().bold(), prompt.question);
                    questions.push_back(prompt);
                } else {
                    println!("Declined ({}): nobody is reading the console", prompt.question);
                    let _ = prompt.reply.send(false);
                }
            }
            finished = join_running(&mut running) => {
                finished?;
            }
            line = lines.next_line(), if stdin_open => {
                let Some(line) = line? else {
                    stdin_open = false;
                    for prompt in questions.drain(..) {
                        let _ = prompt.reply.send(false);
                    }
                    println!("Console input closed; still serving the peer until Ctrl-C.");
                    continue;
                };

                if let Some(prompt) = questions.pop_front() {
                    let accepted = matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes");
                    let _ = prompt.reply.send(accepted);
                    continue;
                }

                match ConsoleCommand::parse(&line) {
                    Ok(None) => {}
                    Ok(Some(ConsoleCommand::Quit)) => break,
                    Ok(Some(ConsoleCommand::Help)) => print_help(),
                    Ok(Some(_)) if running.is_some() => {
                        println!("{}", "Still busy with the previous command".yellow());
                    }
                    Ok(Some(command)) => {
                        running = Some(tokio::spawn(execute(Arc::clone(&node), command)));
                    }
                    Err(usage) => println!("{}", usage.red()),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        }
    }

    if let Some(handle) = running.take() {
        handle.abort();
    }
    Ok(())
}

/// Wait for the background command, or forever when none is running.
async fn join_running(running: &mut Option<JoinHandle<Result<()>>>) -> Result<()> {
    let Some(handle) = running.as_mut() else {
        return std::future::pending().await;
    };

    let outcome = handle.await;
    *running = None;
    match outcome {
        Ok(result) => result,
        Err(e) => {
            warn!("Console command failed to complete: {}", e);
            Ok(())
        }
    }
}

/// Run one console command. Errors were already shown by the node; only
/// fatal ones end the console.
async fn execute(node: Arc<SyncNode>, command: ConsoleCommand) -> Result<()> {
    let outcome = match command {
        ConsoleCommand::Connect(input) => match input.parse::<PeerAddress>() {
            Ok(target) => node.connect(&target).await.map(|_| ()),
            Err(e) => {
                println!("{}", e.to_string().red());
                Ok(())
            }
        },
        ConsoleCommand::Port(input) => match input.parse::<u16>() {
            Ok(port) => node.set_port(port).await,
            Err(_) => {
                println!("{}", format!("invalid port {input:?} (must be between 1024 and 65535)").red());
                Ok(())
            }
        },
        ConsoleCommand::Folder(path) => node.set_directory(path).await.map(|_| ()),
        ConsoleCommand::Sync => match node.scan().await {
            Ok(_) => node.sync_now().await.map(|_| ()),
            Err(e) => Err(e),
        },
        ConsoleCommand::Status => {
            print_status(&node.status().await);
            Ok(())
        }
        ConsoleCommand::Help => {
            print_help();
            Ok(())
        }
        ConsoleCommand::Quit => Ok(()),
    };

    match outcome {
        Err(e) if e.is_fatal() => Err(e.into()),
        _ => Ok(()),
    }
}

fn print_help() {
    println!("Commands:");
    println!("  connect <host:port>  pair with a peer");
    println!("  port <port>          listen on another port (1024-65535)");
    println!("  folder <path>        choose the folder to mirror");
    println!("  sync                 scan the folder and push changes to the peer");
    println!("  status               show node status");
    println!("  quit                 save and exit");
}

fn print_status(status: &NodeStatus) {
    let endpoint = if status.running {
        "running".green()
    } else {
        "stopped".yellow()
    };
    println!("📡 Node {} ({})", status.address, endpoint);

    match &status.peer {
        Some(peer) => println!("🤝 Paired with {}", peer),
        None => println!("🤝 {}", "Not paired".yellow()),
    }

    match &status.folder {
        Some(folder) => {
            println!("📂 {} ({} files tracked)", folder.display(), status.tracked_files);
            if !status.pending.is_empty() {
                println!(
                    "   Pending: {} deletion(s), {} change(s)",
                    status.pending.deletions.len(),
                    status.pending.changes.len()
                );
            }
        }
        None => println!("📂 {}", "No sync folder selected".yellow()),
    }

    let last_sync = status
        .last_sync
        .map(format_time_ago)
        .unwrap_or_else(|| "never".to_string());
    println!("🕒 Last sync: {}", last_sync);
    println!("💾 State: {}", status.state_file.display());
}

fn format_time_ago(timestamp: chrono::DateTime<chrono::Utc>) -> String {
    let now = chrono::Utc::now();
    let duration = now.signed_duration_since(timestamp);

    if duration.num_seconds() < 60 {
        "just now".to_string()
    } else if duration.num_minutes() < 60 {
        format!("{} minutes ago", duration.num_minutes())
    } else if duration.num_hours() < 24 {
        format!("{} hours ago", duration.num_hours())
    } else {
        format!("{} days ago", duration.num_days())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_console_commands() {
        assert_eq!(ConsoleCommand::parse("   "), Ok(None));
        assert_eq!(
            ConsoleCommand::parse("connect 10.0.0.2:6666"),
            Ok(Some(ConsoleCommand::Connect("10.0.0.2:6666".into())))
        );
        assert_eq!(
            ConsoleCommand::parse("folder /tmp/my docs"),
            Ok(Some(ConsoleCommand::Folder(PathBuf::from("/tmp/my docs"))))
        );
        assert_eq!(ConsoleCommand::parse("SYNC"), Ok(Some(ConsoleCommand::Sync)));
        assert_eq!(ConsoleCommand::parse("exit"), Ok(Some(ConsoleCommand::Quit)));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(ConsoleCommand::parse("connect").unwrap_err().contains("usage"));
        assert!(ConsoleCommand::parse("port").unwrap_err().contains("usage"));
        assert!(ConsoleCommand::parse("dance").unwrap_err().contains("unknown command"));
    }

    #[test]
    fn test_format_time_ago() {
        let now = Utc::now();
        assert_eq!(format_time_ago(now), "just now");
        assert_eq!(format_time_ago(now - Duration::minutes(5)), "5 minutes ago");
        assert_eq!(format_time_ago(now - Duration::hours(3)), "3 hours ago");
        assert_eq!(format_time_ago(now - Duration::days(2)), "2 days ago");
    }

    #[test]
    fn test_cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "syncpair", "--state", "/tmp/s.json", "run", "--port", "7000", "--pairing", "always",
        ])
        .unwrap();
        assert_eq!(cli.state, Some(PathBuf::from("/tmp/s.json")));
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.port, Some(7000));
                assert_eq!(args.pairing, Some(PairingPolicy::Always));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_cli_rejects_privileged_port() {
        assert!(Cli::try_parse_from(["syncpair", "port", "80"]).is_err());
    }

    #[tokio::test]
    async fn test_console_frontend_policy_shortcuts() {
        let (prompts, mut rx) = mpsc::unbounded_channel();
        let always = ConsoleFrontend {
            prompts: prompts.clone(),
            policy: PairingPolicy::Always,
        };
        assert!(always.confirm("Pair", "?").await);

        let ask = ConsoleFrontend {
            prompts,
            policy: PairingPolicy::Ask,
        };
        let answer = tokio::spawn(async move { ask.confirm("Pair", "peer?").await });
        let prompt = rx.recv().await.unwrap();
        assert!(prompt.question.contains("peer?"));
        prompt.reply.send(true).unwrap();
        assert!(answer.await.unwrap());
    }
}
