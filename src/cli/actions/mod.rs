mod run;

use crate::{config::CheckerConfig, pulse::Output};
use std::net::IpAddr;

/// Action enum representing each possible command
#[derive(Debug)]
pub enum Action {
    Monitor {
        config: CheckerConfig,
        interval: u16,
        listen: Option<IpAddr>,
        port: u16,
        output: Output,
    },
}

impl Action {
    /// Execute the action
    ///
    /// # Errors
    ///
    /// Returns an error if the action fails to execute
    pub async fn execute(self) -> anyhow::Result<()> {
        run::execute(self).await
    }
}
