use std::path::{Path, PathBuf};
use std::sync::{Arc, mpsc};
use std::time::{Duration, Instant};

use image::DynamicImage;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{
    CompressionType as PngCompressionType, FilterType as PngFilterType, PngEncoder,
};
use image::codecs::webp::WebPEncoder;

use crate::config::AppConfig;
use crate::editor::InteractionMode;
use crate::geometry::Quad;
use crate::processing::gpu_pipeline;
use crate::session::{PreviewBackend, RenderSession};
use crate::state::{MAX_RESULT_DIM, ResultSizePolicy, ResultSpec, SourceImage};
use crate::viewer::{ResultView, SourceView};

enum LoadEvent {
    Loaded { path: PathBuf, source: SourceImage },
    Failed { path: PathBuf, error: String },
}

enum ExportEvent {
    Finished(Result<PathBuf, String>),
}

#[derive(Clone, Copy)]
struct ExportOptions {
    format: ExportFormat,
    jpg_quality: u8,
    png_compression: u8,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ExportFormat {
    Jpg,
    Png,
    Webp,
}

impl ExportFormat {
    const ALL: [ExportFormat; 3] = [ExportFormat::Jpg, ExportFormat::Png, ExportFormat::Webp];

    fn label(self) -> &'static str {
        match self {
            ExportFormat::Jpg => "JPG",
            ExportFormat::Png => "PNG",
            ExportFormat::Webp => "WebP",
        }
    }

    fn extension(self) -> &'static str {
        match self {
            ExportFormat::Jpg => "jpg",
            ExportFormat::Png => "png",
            ExportFormat::Webp => "webp",
        }
    }
}

pub struct CutterApp {
    session: RenderSession,
    source_view: SourceView,
    result_view: ResultView,
    open_path: String,
    current_path: Option<PathBuf>,
    loading: bool,
    load_rx: mpsc::Receiver<LoadEvent>,
    load_tx: mpsc::Sender<LoadEvent>,
    status: String,
    size_policy: ResultSizePolicy,
    result_width: u32,
    result_height: u32,
    show_export_window: bool,
    export_dir: String,
    export_format: ExportFormat,
    export_jpg_quality: u8,
    export_png_compression: u8,
    export_in_progress: bool,
    export_status: String,
    export_rx: Option<mpsc::Receiver<ExportEvent>>,
    config: AppConfig,
}

impl CutterApp {
    pub fn new(
        cc: &eframe::CreationContext<'_>,
        config: AppConfig,
        preview_backend: PreviewBackend,
    ) -> Self {
        let settings = config.session_settings(preview_backend);
        let mut session = RenderSession::new(settings);
        let repaint = cc.egui_ctx.clone();
        session.set_notifier(move || repaint.request_repaint());

        let export_dir = config
            .export_dir
            .clone()
            .unwrap_or_else(default_export_dir);
        let open_path = config
            .last_open_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let initial = session.result_spec();
        let (load_tx, load_rx) = mpsc::channel();
        Self {
            session,
            source_view: SourceView::default(),
            result_view: ResultView::default(),
            open_path,
            current_path: None,
            loading: false,
            load_rx,
            load_tx,
            status: String::new(),
            size_policy: settings.size_policy,
            result_width: initial.width,
            result_height: initial.height,
            show_export_window: false,
            export_dir: export_dir.display().to_string(),
            export_format: ExportFormat::Jpg,
            export_jpg_quality: 90,
            export_png_compression: 6,
            export_in_progress: false,
            export_status: String::new(),
            export_rx: None,
            config,
        }
    }

    fn open(&mut self, path: PathBuf, ctx: &egui::Context) {
        if !crate::loader::is_supported_image(&path) {
            self.status = format!("Unsupported file: {}", path.display());
            return;
        }
        self.open_path = path.display().to_string();
        self.current_path = Some(path.clone());
        self.loading = true;
        self.status = format!("Loading {}...", file_name(&path));

        let tx = self.load_tx.clone();
        let ctx2 = ctx.clone();
        std::thread::spawn(move || {
            let event = match crate::loader::load_source(&path) {
                Ok(source) => LoadEvent::Loaded { path, source },
                Err(err) => LoadEvent::Failed {
                    path,
                    error: format!("{err:#}"),
                },
            };
            let _ = tx.send(event);
            ctx2.request_repaint();
        });
    }

    fn poll_load_events(&mut self) {
        while let Ok(event) = self.load_rx.try_recv() {
            match event {
                LoadEvent::Loaded { path, source } => {
                    if self.current_path.as_ref() != Some(&path) {
                        continue;
                    }
                    self.loading = false;
                    self.status = format!(
                        "{} ({}x{})",
                        file_name(&path),
                        source.width(),
                        source.height()
                    );
                    self.session.set_source(source);
                    let spec = self.session.result_spec();
                    self.result_width = spec.width;
                    self.result_height = spec.height;
                }
                LoadEvent::Failed { path, error } => {
                    if self.current_path.as_ref() != Some(&path) {
                        continue;
                    }
                    tracing::warn!(path = %path.display(), "open failed: {error}");
                    self.loading = false;
                    self.status = format!("Could not open image: {error}");
                }
            }
        }
    }

    fn handle_dropped_files(&mut self, ctx: &egui::Context) {
        let dropped: Vec<PathBuf> = ctx.input(|i| {
            i.raw
                .dropped_files
                .iter()
                .filter_map(|f| f.path.clone())
                .collect()
        });
        if let Some(path) = dropped.into_iter().next() {
            self.open(path, ctx);
        }
    }

    fn apply_result_size(&mut self) {
        match ResultSpec::new(self.result_width, self.result_height) {
            Ok(spec) => {
                self.session.set_result_spec(spec);
                if let ResultSizePolicy::Fixed(_) = self.size_policy {
                    if spec.width == spec.height {
                        self.size_policy = ResultSizePolicy::Fixed(spec.width);
                    }
                }
            }
            Err(err) => self.status = err.to_string(),
        }
    }

    fn start_export(&mut self, ctx: &egui::Context) {
        let output_dir = expand_home_prefix(&self.export_dir);
        if output_dir.as_os_str().is_empty() {
            self.export_status = "Output path is empty".to_string();
            return;
        }
        let Some((source, quad, result)) = self.session.snapshot() else {
            self.export_status = "No image open".to_string();
            return;
        };
        let stem = self
            .current_path
            .as_deref()
            .and_then(|p| p.file_stem())
            .and_then(|s| s.to_str())
            .unwrap_or("image")
            .to_string();
        let options = ExportOptions {
            format: self.export_format,
            jpg_quality: self.export_jpg_quality.clamp(1, 100),
            png_compression: self.export_png_compression.min(9),
        };

        let (tx, rx) = mpsc::channel();
        let ctx2 = ctx.clone();
        std::thread::spawn(move || {
            let outcome = export_cutout(&source, &quad, result, &stem, &output_dir, options)
                .map_err(|err| format!("{err:#}"));
            let _ = tx.send(ExportEvent::Finished(outcome));
            ctx2.request_repaint();
        });

        self.export_in_progress = true;
        self.export_status = "Exporting...".to_string();
        self.export_rx = Some(rx);
    }

    fn poll_export_events(&mut self) {
        let Some(rx) = self.export_rx.take() else {
            return;
        };
        match rx.try_recv() {
            Ok(ExportEvent::Finished(outcome)) => {
                self.export_in_progress = false;
                self.export_status = match outcome {
                    Ok(path) => format!("Saved {}", path.display()),
                    Err(err) => format!("Export failed: {err}"),
                };
            }
            Err(mpsc::TryRecvError::Empty) => self.export_rx = Some(rx),
            Err(mpsc::TryRecvError::Disconnected) => {
                self.export_in_progress = false;
                self.export_status = "Export failed: worker exited".to_string();
            }
        }
    }

    fn show_toolbar(&mut self, ui: &mut egui::Ui, ctx: &egui::Context) {
        ui.horizontal(|ui| {
            ui.add(
                egui::TextEdit::singleline(&mut self.open_path)
                    .hint_text("Image path")
                    .desired_width(360.0)
                    .font(egui::TextStyle::Monospace),
            );
            if ui
                .add_enabled(!self.loading, egui::Button::new("Open"))
                .clicked()
            {
                let path = expand_home_prefix(self.open_path.trim());
                self.open(path, ctx);
            }
            if self.loading {
                ui.spinner();
            }

            ui.separator();
            let mut backend = self.session.backend();
            egui::ComboBox::from_id_salt("backend")
                .selected_text(format!("Render: {}", backend.label()))
                .show_ui(ui, |ui| {
                    for b in PreviewBackend::ALL {
                        ui.selectable_value(&mut backend, b, b.label());
                    }
                });
            if backend != self.session.backend() {
                self.session.set_backend(backend);
            }

            let mut mode = self.session.editor().mode();
            egui::ComboBox::from_id_salt("interaction_mode")
                .selected_text(mode.label())
                .show_ui(ui, |ui| {
                    for m in InteractionMode::ALL {
                        ui.selectable_value(&mut mode, m, m.label());
                    }
                });
            if mode != self.session.editor().mode() {
                self.session.set_mode(mode);
            }

            ui.separator();
            if ui
                .add_enabled(self.session.source().is_some(), egui::Button::new("Export"))
                .clicked()
            {
                self.show_export_window = true;
            }
        });
    }

    fn show_result_panel(&mut self, ui: &mut egui::Ui) {
        ui.label(egui::RichText::new("Result").strong());
        ui.add_space(4.0);
        ui.horizontal(|ui| {
            ui.label("Size");
            ui.add(
                egui::DragValue::new(&mut self.result_width)
                    .range(1_u32..=MAX_RESULT_DIM)
                    .suffix(" px"),
            );
            ui.label("x");
            ui.add(
                egui::DragValue::new(&mut self.result_height)
                    .range(1_u32..=MAX_RESULT_DIM)
                    .suffix(" px"),
            );
            if ui.button("Apply").clicked() {
                self.apply_result_size();
            }
        });
        let mut half = self.size_policy == ResultSizePolicy::HalfSource;
        if ui
            .checkbox(&mut half, "New images: half the source size")
            .changed()
        {
            self.size_policy = if half {
                ResultSizePolicy::HalfSource
            } else {
                ResultSizePolicy::Fixed(self.result_width)
            };
        }
        ui.separator();
        self.result_view.show(ui, &self.session);
    }

    fn show_export_dialog(&mut self, ctx: &egui::Context) {
        let mut open = self.show_export_window;
        egui::Window::new("Export")
            .open(&mut open)
            .default_size([480.0, 240.0])
            .default_pos([40.0, 70.0])
            .show(ctx, |ui| {
                ui.label("Output Directory");
                ui.add(
                    egui::TextEdit::singleline(&mut self.export_dir)
                        .desired_width(ui.available_width())
                        .font(egui::TextStyle::Monospace),
                );

                ui.add_space(8.0);
                egui::ComboBox::from_label("Format")
                    .selected_text(self.export_format.label())
                    .show_ui(ui, |ui| {
                        for fmt in ExportFormat::ALL {
                            ui.selectable_value(&mut self.export_format, fmt, fmt.label());
                        }
                    });

                ui.add_space(8.0);
                match self.export_format {
                    ExportFormat::Jpg => {
                        ui.horizontal(|ui| {
                            ui.label("JPEG Quality");
                            ui.add(
                                egui::Slider::new(&mut self.export_jpg_quality, 1_u8..=100_u8)
                                    .clamping(egui::SliderClamping::Always),
                            );
                        });
                    }
                    ExportFormat::Png => {
                        ui.horizontal(|ui| {
                            ui.label("PNG Compression");
                            ui.add(
                                egui::Slider::new(&mut self.export_png_compression, 0_u8..=9_u8)
                                    .clamping(egui::SliderClamping::Always),
                            );
                        });
                    }
                    ExportFormat::Webp => {
                        ui.label(egui::RichText::new("WebP export is lossless").weak());
                    }
                }

                ui.add_space(8.0);
                let spec = self.session.result_spec();
                let label = if self.export_in_progress {
                    "Exporting...".to_string()
                } else {
                    format!("Export {}x{}", spec.width, spec.height)
                };
                if ui
                    .add_enabled(!self.export_in_progress, egui::Button::new(label))
                    .clicked()
                {
                    self.start_export(ctx);
                }
                if !self.export_status.is_empty() {
                    ui.separator();
                    ui.label(&self.export_status);
                }
            });
        self.show_export_window = open;
    }
}

impl eframe::App for CutterApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        if let Some(rect) = ctx.input(|i| i.viewport().inner_rect) {
            self.config.window_width = Some(rect.width());
            self.config.window_height = Some(rect.height());
        }

        self.poll_load_events();
        self.poll_export_events();
        self.handle_dropped_files(ctx);

        let now = Instant::now();
        self.session.tick(now);
        if let Some(wait) = self.session.next_wake(now) {
            ctx.request_repaint_after(wait);
        }

        egui::TopBottomPanel::top("toolbar").show(ctx, |ui| {
            self.show_toolbar(ui, ctx);
        });

        egui::TopBottomPanel::bottom("status").show(ctx, |ui| {
            ui.horizontal(|ui| {
                if let Some(notice) = self.session.notice(now) {
                    ui.colored_label(egui::Color32::from_rgb(230, 120, 90), notice);
                    ctx.request_repaint_after(Duration::from_millis(500));
                } else {
                    ui.label(&self.status);
                }
            });
        });

        egui::SidePanel::right("result_panel")
            .min_width(280.0)
            .default_width(420.0)
            .show(ctx, |ui| {
                self.show_result_panel(ui);
            });

        egui::CentralPanel::default().show(ctx, |ui| {
            self.source_view.show(ui, &mut self.session);
        });

        if self.show_export_window {
            self.show_export_dialog(ctx);
        }
    }

    fn on_exit(&mut self, _gl: Option<&eframe::glow::Context>) {
        self.config.last_open_path = self.current_path.clone();
        self.config.export_dir = Some(expand_home_prefix(&self.export_dir));
        self.config.preview_backend = Some(backend_key(self.session.backend()).to_string());
        self.config.interaction_mode = Some(self.session.editor().mode());
        self.config.set_size_policy(self.size_policy);
        self.config.save();
    }
}

fn backend_key(backend: PreviewBackend) -> &'static str {
    match backend {
        PreviewBackend::Cpu => "cpu",
        PreviewBackend::Gpu => "gpu",
        PreviewBackend::Auto => "auto",
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .unwrap_or_default()
        .to_string_lossy()
        .into_owned()
}

fn default_export_dir() -> PathBuf {
    dirs::picture_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Cutouts")
}

fn expand_home_prefix(raw: &str) -> PathBuf {
    if raw == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"));
    }
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(raw)
}

/// Full-resolution render of the selection, written without overwriting.
fn export_cutout(
    source: &Arc<SourceImage>,
    quad: &Quad,
    result: ResultSpec,
    stem: &str,
    output_dir: &Path,
    options: ExportOptions,
) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(output_dir)?;
    let started = Instant::now();
    let image = crate::processing::warp::warp_parallel(source, quad, result)?;
    let output_path = build_output_path(stem, output_dir, options.format);
    write_cutout(&DynamicImage::ImageRgba8(image), &output_path, options)?;
    tracing::info!(
        path = %output_path.display(),
        elapsed_ms = started.elapsed().as_secs_f64() * 1000.0,
        gpu = gpu_pipeline::is_available(),
        "cutout exported"
    );
    Ok(output_path)
}

fn build_output_path(stem: &str, output_dir: &Path, format: ExportFormat) -> PathBuf {
    let base = output_dir.join(format!("{}-cutout.{}", stem, format.extension()));
    if !base.exists() {
        return base;
    }
    for n in 2..10000 {
        let candidate = output_dir.join(format!("{}-cutout-{}.{}", stem, n, format.extension()));
        if !candidate.exists() {
            return candidate;
        }
    }
    output_dir.join(format!("{}-cutout-final.{}", stem, format.extension()))
}

fn write_cutout(
    rendered: &DynamicImage,
    output_path: &Path,
    options: ExportOptions,
) -> anyhow::Result<()> {
    let file = std::fs::File::create(output_path)?;
    let writer = std::io::BufWriter::new(file);
    match options.format {
        ExportFormat::Jpg => {
            // JPEG has no alpha channel.
            let rgb = DynamicImage::ImageRgb8(rendered.to_rgb8());
            let encoder = JpegEncoder::new_with_quality(writer, options.jpg_quality.clamp(1, 100));
            rgb.write_with_encoder(encoder)?;
        }
        ExportFormat::Png => {
            let compression = PngCompressionType::Level(options.png_compression.min(9));
            let encoder =
                PngEncoder::new_with_quality(writer, compression, PngFilterType::Adaptive);
            rendered.write_with_encoder(encoder)?;
        }
        ExportFormat::Webp => {
            let encoder = WebPEncoder::new_lossless(writer);
            rendered.write_with_encoder(encoder)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use image::{ImageBuffer, Rgba};

    use super::{ExportFormat, ExportOptions, build_output_path, export_cutout};
    use crate::geometry::Quad;
    use crate::state::{ResultSpec, SourceImage};

    fn scratch_dir(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "photo-cutter-app-{}-{}",
            tag,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn output_path_never_overwrites() {
        let dir = scratch_dir("paths");
        let first = build_output_path("photo", &dir, ExportFormat::Png);
        assert_eq!(first, dir.join("photo-cutout.png"));
        std::fs::write(&first, b"x").unwrap();
        let second = build_output_path("photo", &dir, ExportFormat::Png);
        assert_eq!(second, dir.join("photo-cutout-2.png"));
        assert_eq!(
            build_output_path("photo", &dir, ExportFormat::Jpg),
            dir.join("photo-cutout.jpg")
        );
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn export_writes_result_at_configured_size() {
        let dir = scratch_dir("export");
        let source = Arc::new(
            SourceImage::new(ImageBuffer::from_fn(40, 30, |x, y| {
                Rgba([x as u8, y as u8, 0, 255])
            }))
            .unwrap(),
        );
        let options = ExportOptions {
            format: ExportFormat::Png,
            jpg_quality: 90,
            png_compression: 6,
        };
        let path = export_cutout(
            &source,
            &Quad::centered(40, 30),
            ResultSpec::new(20, 15).unwrap(),
            "fixture",
            &dir,
            options,
        )
        .unwrap();

        let written = image::open(&path).unwrap().into_rgba8();
        assert_eq!(written.dimensions(), (20, 15));
        assert_eq!(written.get_pixel(0, 0).0, [10, 7, 0, 255]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn jpeg_export_drops_alpha() {
        let dir = scratch_dir("jpeg");
        let source = Arc::new(
            SourceImage::new(ImageBuffer::from_pixel(8, 8, Rgba([200, 100, 50, 128]))).unwrap(),
        );
        let options = ExportOptions {
            format: ExportFormat::Jpg,
            jpg_quality: 95,
            png_compression: 6,
        };
        let path = export_cutout(
            &source,
            &Quad::full_image(8, 8),
            ResultSpec::new(8, 8).unwrap(),
            "flat",
            &dir,
            options,
        )
        .unwrap();
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("jpg"));
        let written = image::open(&path).unwrap();
        assert_eq!((written.width(), written.height()), (8, 8));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
