use clap::Parser;
use petpal::{Engine, SystemClock};
use petpal_web::{Settings, start_server};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(settings.log_level.into()),
        )
        .with_target(false)
        .init();

    tracing::info!(
        backend = ?settings.backend,
        feeding_time = %settings.feeding_time.format(petpal::FEEDING_TIME_FORMAT),
        "starting PetPal"
    );

    let hardware = settings.hardware()?;
    let engine = Engine::start(settings.engine_config(), hardware, Arc::new(SystemClock));
    let server = start_server(engine.clone(), settings.server_config()).await?;

    // Ctrl-C takes the same path as POST /shutdown.
    let on_signal = engine.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received");
            on_signal.shutdown().await;
        }
    });

    server.await?;
    engine.shutdown().await;
    Ok(())
}
