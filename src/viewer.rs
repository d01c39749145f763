use image::RgbaImage;

use crate::editor::EditorState;
use crate::geometry::{Corner, Point, Quad, ViewportRect, to_image_space};
use crate::session::RenderSession;

const HANDLE_RADIUS: f32 = 6.0;
const OUTLINE: egui::Color32 = egui::Color32::from_rgb(255, 196, 0);

/// Cached egui texture for an image that changes by revision.
#[derive(Default)]
struct CachedTexture {
    key: Option<u64>,
    handle: Option<egui::TextureHandle>,
}

impl CachedTexture {
    fn get(
        &mut self,
        ctx: &egui::Context,
        name: &str,
        key: u64,
        image: &RgbaImage,
    ) -> egui::TextureHandle {
        if self.key == Some(key) {
            if let Some(handle) = &self.handle {
                return handle.clone();
            }
        }
        let size = [image.width() as usize, image.height() as usize];
        let color = egui::ColorImage::from_rgba_unmultiplied(size, image.as_raw());
        let handle = ctx.load_texture(name, color, egui::TextureOptions::NEAREST);
        self.key = Some(key);
        self.handle = Some(handle.clone());
        handle
    }
}

/// Source image with the editable quad drawn on top.
#[derive(Default)]
pub struct SourceView {
    texture: CachedTexture,
}

impl SourceView {
    pub fn show(&mut self, ui: &mut egui::Ui, session: &mut RenderSession) {
        let Some(source) = session.source().cloned() else {
            ui.centered_and_justified(|ui| {
                ui.label("Open an image or drop one here");
            });
            return;
        };
        let tex = self
            .texture
            .get(ui.ctx(), "source_tex", source.id(), source.pixels());
        let (w, h) = (source.width(), source.height());

        let rect = fit_rect(ui.available_size(), w, h);
        let (rect, response) = ui.allocate_exact_size(rect, egui::Sense::click_and_drag());
        let viewport = viewport_of(rect);
        let pointer = |pos: egui::Pos2| {
            to_image_space(Point::new(pos.x as f64, pos.y as f64), viewport, w, h)
        };

        let (pressed, released, pos) = ui.input(|i| {
            (
                i.pointer.primary_pressed(),
                i.pointer.primary_released(),
                i.pointer.interact_pos(),
            )
        });
        if pressed && response.hovered() {
            if let Some(at) = pos.and_then(pointer) {
                session.pointer_down(at);
            }
        } else if response.dragged() {
            if let Some(at) = pos.and_then(pointer) {
                session.pointer_move(at);
            }
        }
        if released {
            session.pointer_up();
        }
        if matches!(session.editor().state(), EditorState::Dragging { .. }) {
            ui.ctx().set_cursor_icon(egui::CursorIcon::Grabbing);
        } else if response.hovered() {
            ui.ctx().set_cursor_icon(egui::CursorIcon::Crosshair);
        }

        let painter = ui.painter_at(rect);
        let full_uv = egui::Rect::from_min_max(egui::pos2(0.0, 0.0), egui::pos2(1.0, 1.0));
        painter.image(tex.id(), rect, full_uv, egui::Color32::WHITE);
        paint_overlay(
            &painter,
            &tex,
            rect,
            (w, h),
            &session.quad(),
            session.editor().selected(),
        );
    }
}

/// Latest warped result, scaled to fit.
#[derive(Default)]
pub struct ResultView {
    texture: CachedTexture,
}

impl ResultView {
    pub fn show(&mut self, ui: &mut egui::Ui, session: &RenderSession) {
        let Some(result) = session.last_result() else {
            let size = egui::vec2(ui.available_width(), 160.0);
            ui.allocate_ui(size, |ui| {
                ui.centered_and_justified(|ui| {
                    if session.busy() {
                        ui.spinner();
                    } else {
                        ui.label(egui::RichText::new("No result yet").weak());
                    }
                });
            });
            return;
        };
        let tex = self
            .texture
            .get(ui.ctx(), "result_tex", session.revision(), result);
        let max = egui::vec2(ui.available_width(), ui.available_height().max(160.0));
        let size = fit_rect(max, result.width(), result.height());
        let (rect, _) = ui.allocate_exact_size(size, egui::Sense::hover());
        ui.painter().image(
            tex.id(),
            rect,
            egui::Rect::from_min_max(egui::pos2(0.0, 0.0), egui::pos2(1.0, 1.0)),
            egui::Color32::WHITE,
        );
        if session.busy() {
            ui.painter()
                .rect_filled(rect, 0.0, egui::Color32::from_black_alpha(40));
        }
    }
}

fn paint_overlay(
    painter: &egui::Painter,
    tex: &egui::TextureHandle,
    rect: egui::Rect,
    (w, h): (u32, u32),
    quad: &Quad,
    selected: Option<Corner>,
) {
    // Dim everything, then repaint the selected region at full brightness.
    painter.rect_filled(rect, 0.0, egui::Color32::from_black_alpha(140));
    let corners = quad.points().map(|p| image_to_screen(p, rect, w, h));
    let mut mesh = egui::Mesh::with_texture(tex.id());
    for (screen, p) in corners.iter().zip(quad.points()) {
        mesh.vertices.push(egui::epaint::Vertex {
            pos: *screen,
            uv: egui::pos2((p.x / w as f64) as f32, (p.y / h as f64) as f32),
            color: egui::Color32::WHITE,
        });
    }
    mesh.add_triangle(0, 1, 2);
    mesh.add_triangle(0, 2, 3);
    painter.add(egui::Shape::mesh(mesh));
    painter.add(egui::Shape::closed_line(
        corners.to_vec(),
        egui::Stroke::new(1.5, OUTLINE),
    ));

    for (corner, pos) in Corner::ALL.into_iter().zip(corners) {
        let fill = if selected == Some(corner) {
            OUTLINE
        } else {
            egui::Color32::from_black_alpha(180)
        };
        painter.circle(pos, HANDLE_RADIUS, fill, egui::Stroke::new(1.5, OUTLINE));
        painter.text(
            pos + egui::vec2(HANDLE_RADIUS + 2.0, -HANDLE_RADIUS - 2.0),
            egui::Align2::LEFT_BOTTOM,
            corner.label(),
            egui::FontId::proportional(14.0),
            egui::Color32::WHITE,
        );
    }
}

/// Largest size with the image's aspect ratio that fits `avail`.
fn fit_rect(avail: egui::Vec2, w: u32, h: u32) -> egui::Vec2 {
    let size = egui::vec2(w as f32, h as f32);
    let scale = (avail.x / size.x).min(avail.y / size.y);
    if scale.is_finite() && scale > 0.0 {
        size * scale
    } else {
        egui::vec2(1.0, 1.0)
    }
}

fn viewport_of(rect: egui::Rect) -> ViewportRect {
    ViewportRect {
        left: rect.left() as f64,
        top: rect.top() as f64,
        width: rect.width() as f64,
        height: rect.height() as f64,
    }
}

fn image_to_screen(p: Point, rect: egui::Rect, w: u32, h: u32) -> egui::Pos2 {
    egui::pos2(
        rect.left() + (p.x / w as f64) as f32 * rect.width(),
        rect.top() + (p.y / h as f64) as f32 * rect.height(),
    )
}

#[cfg(test)]
mod tests {
    use super::{fit_rect, image_to_screen, viewport_of};
    use crate::geometry::{Point, to_image_space};

    #[test]
    fn fit_rect_preserves_aspect() {
        assert_eq!(
            fit_rect(egui::vec2(400.0, 400.0), 800, 600),
            egui::vec2(400.0, 300.0)
        );
        assert_eq!(
            fit_rect(egui::vec2(1000.0, 300.0), 800, 600),
            egui::vec2(400.0, 300.0)
        );
        assert_eq!(fit_rect(egui::vec2(0.0, 0.0), 8, 6), egui::vec2(1.0, 1.0));
    }

    #[test]
    fn screen_mapping_inverts_pointer_mapping() {
        let rect = egui::Rect::from_min_size(egui::pos2(32.0, 16.0), egui::vec2(256.0, 128.0));
        let p = Point::new(384.0, 96.0);
        let screen = image_to_screen(p, rect, 1024, 512);
        assert_eq!(screen, egui::pos2(128.0, 40.0));
        let back = to_image_space(
            Point::new(screen.x as f64, screen.y as f64),
            viewport_of(rect),
            1024,
            512,
        )
        .unwrap();
        assert_eq!(back, p);
    }
}
