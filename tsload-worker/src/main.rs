//! Bulk load a serialized time-series dataset into PostgreSQL.
use std::sync::Arc;

use envconfig::Envconfig;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use tsload_common::metrics::{serve, setup_metrics_router};
use tsload_common::pg::PgConnector;
use tsload_worker::config::Config;
use tsload_worker::error::LoadError;
use tsload_worker::loader::Loader;
use tsload_worker::source::FileDataSource;

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy(),
    );
    tracing_subscriber::registry().with(log_layer).init();
}

#[tokio::main]
async fn main() -> Result<(), LoadError> {
    setup_tracing();
    info!("starting tsload");

    let config = Config::init_from_env().expect("Invalid configuration:");

    if config.metrics_enabled {
        let bind = config.bind();
        tokio::task::spawn(async move {
            let router = setup_metrics_router().expect("failed to build metrics recorder");
            serve(router, &bind)
                .await
                .expect("failed to start serving metrics");
        });
    }

    let connector = PgConnector::new(&config.database_url, config.db_name.as_str())?;
    let source = FileDataSource::open(&config.file)?;
    let loader = Loader::new(config, Arc::new(connector));

    match loader.run(source).await {
        Ok(summary) => {
            summary.log();
            Ok(())
        }
        Err(err) => {
            error!("load failed: {}", err);
            Err(err)
        }
    }
}
