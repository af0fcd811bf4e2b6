use clap::Parser;
use kafka_monitor::cli::{apply_overrides, do_selected_operation, CliFlags, ExitStatus};
use kafka_monitor::config::{load_configuration, ConfigStruct};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let flags = CliFlags::parse();

    let mut configuration = match &flags.config {
        Some(path) => match load_configuration(path) {
            Ok(configuration) => configuration,
            Err(e) => {
                error!(error = %e, path = %path.display(), "Unable to load configuration");
                std::process::exit(ExitStatus::ConfigurationError.code());
            }
        },
        None => ConfigStruct::default(),
    };
    apply_overrides(&mut configuration, &flags);

    let status = do_selected_operation(&configuration, &flags, &mut std::io::stdout()).await;
    std::process::exit(status.code());
}
