use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;

use grocery_classifier::config::{AllowedOrigins, AppConfig};
use grocery_classifier::dispatcher::InferenceDispatcher;
use grocery_classifier::handlers::{self, AppState};
use grocery_classifier::labels::ClassLabelTable;
use grocery_classifier::logging::setup_logging;
use grocery_classifier::registry::{ArtifactSource, ModelRegistry};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    setup_logging(config.environment);
    tracing::info!(
        environment = config.environment.as_str(),
        layout = ?config.layout,
        "Starting prediction service"
    );

    let source = ArtifactSource::from_config(&config.source)?;

    let labels_path = source.fetch(&config.labels_file)?;
    let labels = ClassLabelTable::load(&labels_path)?;
    tracing::info!(classes = labels.len(), "Loaded class labels");

    let registry = ModelRegistry::load(&source, config.layout)?;

    let dispatcher = InferenceDispatcher::new(Arc::new(registry), Arc::new(labels), config.layout);
    let state = web::Data::new(AppState::new(
        dispatcher,
        config.max_concurrent_inferences,
        config.max_upload_bytes,
    ));

    let origins = config.allowed_origins.clone();
    tracing::info!("Server running at http://{}", config.bind_address);

    HttpServer::new(move || {
        App::new()
            .wrap(cors(&origins))
            .wrap(middleware::Logger::default())
            .app_data(state.clone())
            .configure(handlers::configure)
    })
    .bind(config.bind_address)
    .with_context(|| format!("failed to bind {}", config.bind_address))?
    .run()
    .await?;

    Ok(())
}

fn cors(origins: &AllowedOrigins) -> Cors {
    let cors = Cors::default().allow_any_method().allow_any_header();
    match origins {
        AllowedOrigins::Any => cors.allow_any_origin(),
        AllowedOrigins::List(list) => list
            .iter()
            .fold(cors.supports_credentials(), |cors, origin| {
                cors.allowed_origin(origin)
            }),
    }
}
