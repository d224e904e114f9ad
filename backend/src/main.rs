use actix_cors::Cors;
use actix_web::{App, HttpServer, web};
use aws_config::BehaviorVersion;
use aws_sdk_dynamodb::Client as DynamoDbClient;
use aws_sdk_s3::Client as S3Client;
use ingest_backend::classifier::{Classifier, LocalModel, RemoteVisionService};
use ingest_backend::config::{AppConfig, StorageBackend};
use ingest_backend::context::AppContext;
use ingest_backend::db::{DynamoDbRepository, MemoryResultStore, ResultStore};
use ingest_backend::pipeline::IngestionPipeline;
use ingest_backend::routes::configure_routes;
use ingest_backend::storage::{MemoryObjectStore, ObjectStore, S3Service};
use std::sync::Arc;

fn startup_error(what: &str, e: impl std::fmt::Display) -> std::io::Error {
    log::error!("{}: {}", what, e);
    std::io::Error::other(format!("{what}: {e}"))
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = AppConfig::load().map_err(|e| startup_error("Invalid configuration", e))?;
    log::info!("Project is {}", config.project_id);

    let bucket_name = config.bucket_name();
    log::info!("Initialising access to storage bucket {}", bucket_name);

    let object_store: Arc<dyn ObjectStore>;
    let result_store: Arc<dyn ResultStore>;
    match config.storage_backend {
        StorageBackend::Aws => {
            let aws_config = aws_config::defaults(BehaviorVersion::latest()).load().await;
            object_store = Arc::new(S3Service::new(
                S3Client::new(&aws_config),
                bucket_name,
                config.public_base_url(),
            ));
            log::info!("Using DynamoDB table {}", config.results_table);
            result_store = Arc::new(DynamoDbRepository::new(
                DynamoDbClient::new(&aws_config),
                config.results_table.clone(),
            ));
        }
        StorageBackend::Memory => {
            log::warn!("Using in-memory storage; uploads and results are lost on restart");
            object_store = Arc::new(MemoryObjectStore::new(bucket_name, config.public_base_url()));
            result_store = Arc::new(MemoryResultStore::new());
        }
    }

    log::info!("Initialising local classifier");
    let local_model = LocalModel::load(
        &config.model_path,
        &config.labels_path,
        config.torch_input_size,
    )
    .map_err(|e| startup_error("Model loading failed", e))?;
    let classes = local_model.sorted_vocabulary();

    log::info!("Initialising Vision API client");
    let vision = RemoteVisionService::new(&config.vision)
        .map_err(|e| startup_error("Vision API client setup failed", e))?;

    let pipeline = IngestionPipeline::new(object_store, result_store, config.ingest_concurrency);
    let local_classifier: Arc<dyn Classifier> = Arc::new(local_model);
    let vision_classifier: Arc<dyn Classifier> = Arc::new(vision);
    let ctx = web::Data::new(AppContext {
        pipeline,
        local_classifier,
        vision_classifier,
        classes,
    });

    log::info!("Initialisation complete");

    let bind_address = config.bind_address();
    log::info!("Starting server on {}", bind_address);

    HttpServer::new(move || {
        App::new()
            .wrap(
                Cors::default()
                    .allow_any_origin()
                    .allowed_methods(vec!["GET", "POST", "OPTIONS"])
                    .allowed_headers(vec![
                        actix_web::http::header::ACCEPT,
                        actix_web::http::header::CONTENT_TYPE,
                    ])
                    .max_age(3600),
            )
            .app_data(ctx.clone())
            .configure(configure_routes)
    })
    .bind(&bind_address)?
    .run()
    .await
}
