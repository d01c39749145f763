mod app;
mod config;
mod editor;
mod error;
mod geometry;
mod loader;
mod processing;
mod session;
mod state;
mod viewer;

use app::CutterApp;
use config::AppConfig;
use session::PreviewBackend;

const BACKEND_ENV: &str = "PHOTO_CUTTER_PREVIEW_BACKEND";

fn parse_preview_backend(value: &str) -> PreviewBackend {
    match value.trim().to_ascii_lowercase().as_str() {
        "cpu" | "workers" => PreviewBackend::Cpu,
        "gpu" | "wgpu" | "gpu_pipeline" => PreviewBackend::Gpu,
        _ => PreviewBackend::Auto,
    }
}

fn resolve_preview_backend(config: &AppConfig, env_value: Option<&str>) -> PreviewBackend {
    if let Some(raw) = env_value {
        return parse_preview_backend(raw);
    }
    if let Some(raw) = config.preview_backend.as_deref() {
        return parse_preview_backend(raw);
    }
    PreviewBackend::Auto
}

fn report_preview_backend(backend: PreviewBackend) {
    let status = processing::gpu_pipeline::runtime_status();
    let adapter_desc = match (
        status.adapter_name.as_deref(),
        status.adapter_backend.as_deref(),
    ) {
        (Some(name), Some(api)) => format!(
            "{} ({}, driver {})",
            name,
            api,
            status.adapter_driver.as_deref().unwrap_or("unknown")
        ),
        (Some(name), None) => name.to_string(),
        _ => "n/a".to_string(),
    };
    match backend {
        PreviewBackend::Cpu => tracing::info!("preview backend = cpu workers"),
        PreviewBackend::Auto if status.available => {
            tracing::info!("preview backend = auto (gpu on {adapter_desc})")
        }
        PreviewBackend::Auto => tracing::info!("preview backend = auto (gpu unavailable, cpu workers)"),
        PreviewBackend::Gpu if status.available => {
            tracing::info!("preview backend = gpu ({adapter_desc})")
        }
        PreviewBackend::Gpu => {
            tracing::warn!("preview backend = gpu requested, but no adapter; using cpu workers")
        }
    }
}

fn main() -> eframe::Result {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = AppConfig::load();
    let env_backend = std::env::var(BACKEND_ENV).ok();
    let preview_backend = resolve_preview_backend(&config, env_backend.as_deref());
    report_preview_backend(preview_backend);

    let width = config.window_width.unwrap_or(1280.0);
    let height = config.window_height.unwrap_or(800.0);

    let native_options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_title("Photo Cutter")
            .with_app_id("photo-cutter")
            .with_drag_and_drop(true)
            .with_inner_size([width, height]),
        ..Default::default()
    };

    eframe::run_native(
        "photo-cutter",
        native_options,
        Box::new(|cc| Ok(Box::new(CutterApp::new(cc, config, preview_backend)))),
    )
}
