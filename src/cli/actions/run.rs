use super::Action;

/// Execute the action's business logic by delegating to the appropriate module
pub async fn execute(action: Action) -> anyhow::Result<()> {
    match action {
        Action::Monitor {
            config,
            interval,
            listen,
            port,
            output,
        } => crate::pulse::start(config, interval, listen, port, output).await,
    }
}
