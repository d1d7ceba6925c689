//! Cohort API server binary.

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("cohort_api=info,tower_http=info")),
        )
        .with(fmt::layer().with_target(true).with_line_number(true))
        .init();

    cohort_api::server::run_from_env().await
}
