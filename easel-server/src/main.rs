use anyhow::{Context, Result};
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use clap::Parser;
use easel_core::{
    DeviceMap, Dispatcher, Error, GenerationRequest, HubFactory, ModelRegistry, PipelineSettings,
    SchedulerKind,
};
use image::DynamicImage;
use serde::Serialize;
use std::{io::Cursor, path::PathBuf, sync::Arc};
use tokio::net::TcpListener;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Easel image generation server")]
struct Args {
    /// Run pipelines on this accelerator ordinal instead of the CPU
    #[arg(long)]
    gpu: Option<usize>,

    /// Path to a JSON model registry; the built-in registry is used when absent
    #[arg(long)]
    registry: Option<PathBuf>,

    /// Output image width in pixels
    #[arg(long, default_value_t = easel_core::DEFAULT_WIDTH)]
    width: usize,

    /// Output image height in pixels
    #[arg(long, default_value_t = easel_core::DEFAULT_HEIGHT)]
    height: usize,

    /// Sampling scheduler family
    #[arg(long, default_value = "uni-pc-multistep")]
    scheduler: SchedulerKind,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000)]
    port: u16,
}

fn image_to_base64_png(img: &DynamicImage) -> Result<String> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)?;
    Ok(BASE64_STANDARD.encode(&bytes))
}

#[derive(Serialize)]
struct GenerationResponse {
    image: String,
}

#[derive(Serialize)]
struct ModelsResponse {
    default: String,
    models: Vec<String>,
}

// Application state containing the dispatcher; pipelines load lazily on the
// first request that needs them.
#[derive(Clone)]
struct AppState(Arc<Dispatcher>);

async fn generate_image_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GenerationRequest>,
) -> impl IntoResponse {
    match state.0.generate(req).await {
        Ok(image) => match image_to_base64_png(&image) {
            Ok(encoded) => Json(GenerationResponse { image: encoded }).into_response(),
            Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {e:?}")).into_response(),
        },
        Err(e) => {
            let status = match &e {
                Error::UnknownModel(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, format!("Error: {e}")).into_response()
        }
    }
}

async fn list_models_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let registry = state.0.registry();
    Json(ModelsResponse {
        default: registry.default_key().to_string(),
        models: registry.keys().map(str::to_string).collect(),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let registry = match &args.registry {
        Some(path) => ModelRegistry::from_path(path)?,
        None => ModelRegistry::default(),
    };

    let settings = PipelineSettings {
        device_map: args.gpu.map_or(DeviceMap::ForceCpu, DeviceMap::Ordinal),
        scheduler: args.scheduler,
        width: args.width,
        height: args.height,
    };

    let dispatcher = Dispatcher::new(registry, settings, HubFactory::new()?);
    let app_state = AppState(Arc::new(dispatcher));
    let shared_state = Arc::new(app_state);

    // --- Build axum router with shared state ---
    let app = Router::new()
        .route("/v1/images/generations", post(generate_image_handler))
        .route("/v1/models", get(list_models_handler))
        .with_state(shared_state);

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
