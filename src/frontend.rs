//! Callbacks from the sync node into whatever presents it to a user.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{error, info, warn};

/// Presentation layer the node reports to.
///
/// `confirm` is awaited by the RPC task serving a pairing request, so an
/// implementation may take as long as the user needs to answer.
#[async_trait]
pub trait Frontend: Send + Sync {
    fn notify(&self, title: &str, message: &str);

    fn warn(&self, title: &str, message: &str);

    fn report_error(&self, title: &str, message: &str);

    async fn confirm(&self, title: &str, message: &str) -> bool;
}

/// How a node without an interactive user answers pairing requests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PairingPolicy {
    /// Ask the user; declines when nobody can answer.
    #[default]
    Ask,
    Always,
    Never,
}

impl fmt::Display for PairingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PairingPolicy::Ask => "ask",
            PairingPolicy::Always => "always",
            PairingPolicy::Never => "never",
        };
        f.write_str(name)
    }
}

/// Headless front end that writes every message to the log.
#[derive(Clone, Debug, Default)]
pub struct LogFrontend {
    policy: PairingPolicy,
}

impl LogFrontend {
    pub fn new(policy: PairingPolicy) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl Frontend for LogFrontend {
    fn notify(&self, title: &str, message: &str) {
        info!("{}: {}", title, message);
    }

    fn warn(&self, title: &str, message: &str) {
        warn!("{}: {}", title, message);
    }

    fn report_error(&self, title: &str, message: &str) {
        error!("{}: {}", title, message);
    }

    async fn confirm(&self, title: &str, message: &str) -> bool {
        let accepted = self.policy == PairingPolicy::Always;
        info!(
            "{}: {} -> {} (pairing policy: {})",
            title,
            message,
            if accepted { "accepted" } else { "declined" },
            self.policy
        );
        accepted
    }
}
