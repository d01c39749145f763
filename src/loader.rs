use std::path::Path;

use anyhow::Context;
use image::DynamicImage;

use crate::state::SourceImage;

static RAW_EXTS: &[&str] = &["raf", "dng", "nef", "cr2", "arw"];
static SUPPORTED_IMAGE_EXTS: &[&str] = &[
    "jpg", "jpeg", "png", "tiff", "tif", "webp", "bmp", "gif", "raf", "dng", "nef", "cr2", "arw",
];

fn has_extension(path: &Path, exts: &[&str]) -> bool {
    let Some(ext) = path.extension().map(|e| e.to_string_lossy()) else {
        return false;
    };
    exts.iter().any(|known| ext.eq_ignore_ascii_case(known))
}

pub fn is_raw_image(path: &Path) -> bool {
    has_extension(path, RAW_EXTS)
}

/// Returns `true` if the path has an extension the loader can decode.
pub fn is_supported_image(path: &Path) -> bool {
    has_extension(path, SUPPORTED_IMAGE_EXTS)
}

/// Decode `path` and publish it as an RGBA8 source.
pub fn load_source(path: &Path) -> anyhow::Result<SourceImage> {
    let img = open_image(path)?;
    let (w, h) = (img.width(), img.height());
    let source = SourceImage::new(img.into_rgba8())
        .with_context(|| format!("unusable image {}", path.display()))?;
    tracing::debug!(path = %path.display(), width = w, height = h, "image decoded");
    Ok(source)
}

/// Open an image, falling back to raw decoding for RAW extensions.
pub fn open_image(path: &Path) -> anyhow::Result<DynamicImage> {
    open_image_with_hooks(path, open_standard, develop_raw)
}

fn open_standard(path: &Path) -> anyhow::Result<DynamicImage> {
    Ok(image::open(path)?)
}

fn develop_raw(path: &Path) -> anyhow::Result<DynamicImage> {
    let raw = rawler::decode_file(path)?;
    let develop = rawler::imgop::develop::RawDevelop::default();
    let intermediate = develop.develop_intermediate(&raw)?;
    intermediate
        .to_dynamic_image()
        .ok_or_else(|| anyhow::anyhow!("raw develop produced invalid image"))
}

fn open_image_with_hooks<FStandard, FRaw>(
    path: &Path,
    open_standard: FStandard,
    open_raw: FRaw,
) -> anyhow::Result<DynamicImage>
where
    FStandard: Fn(&Path) -> anyhow::Result<DynamicImage>,
    FRaw: Fn(&Path) -> anyhow::Result<DynamicImage>,
{
    let standard_err = match open_standard(path) {
        Ok(img) => return Ok(img),
        Err(err) => err,
    };
    if !is_raw_image(path) {
        return Err(standard_err.context(format!("failed to open {}", path.display())));
    }
    open_raw(path).with_context(|| format!("raw decode failed for {}", path.display()))
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::path::Path;

    use image::{DynamicImage, ImageBuffer, Rgba};

    use super::{is_raw_image, is_supported_image, load_source, open_image_with_hooks};

    fn img(px: [u8; 4]) -> DynamicImage {
        DynamicImage::ImageRgba8(ImageBuffer::from_pixel(1, 1, Rgba(px)))
    }

    #[test]
    fn raw_falls_back_after_standard_decode_fails() {
        let raw_calls = Cell::new(0);
        let out = open_image_with_hooks(
            Path::new("/tmp/test.dng"),
            |_: &Path| anyhow::bail!("unsupported"),
            |_: &Path| {
                raw_calls.set(raw_calls.get() + 1);
                Ok(img([4, 5, 6, 255]))
            },
        )
        .expect("raw fallback should succeed");
        assert_eq!(raw_calls.get(), 1);
        assert_eq!(out.to_rgba8().get_pixel(0, 0).0, [4, 5, 6, 255]);
    }

    #[test]
    fn standard_decode_skips_raw_path() {
        let raw_calls = Cell::new(0);
        let out = open_image_with_hooks(
            Path::new("/tmp/test.nef"),
            |_: &Path| Ok(img([1, 1, 1, 255])),
            |_: &Path| {
                raw_calls.set(raw_calls.get() + 1);
                Ok(img([9, 9, 9, 255]))
            },
        )
        .unwrap();
        assert_eq!(raw_calls.get(), 0);
        assert_eq!(out.to_rgba8().get_pixel(0, 0).0, [1, 1, 1, 255]);
    }

    #[test]
    fn non_raw_failure_reports_path() {
        let raw_calls = Cell::new(0);
        let err = open_image_with_hooks(
            Path::new("/tmp/broken.png"),
            |_: &Path| anyhow::bail!("bad header"),
            |_: &Path| {
                raw_calls.set(raw_calls.get() + 1);
                Ok(img([0, 0, 0, 255]))
            },
        )
        .unwrap_err();
        assert_eq!(raw_calls.get(), 0);
        assert!(format!("{err:#}").contains("/tmp/broken.png"));
        assert!(format!("{err:#}").contains("bad header"));
    }

    #[test]
    fn extension_checks_are_case_insensitive() {
        assert!(is_raw_image(Path::new("/tmp/a.RAF")));
        assert!(!is_raw_image(Path::new("/tmp/a.jpg")));
        assert!(is_supported_image(Path::new("/tmp/a.JPEG")));
        assert!(!is_supported_image(Path::new("/tmp/a.txt")));
        assert!(!is_supported_image(Path::new("/tmp/noext")));
    }

    #[test]
    fn load_source_decodes_png_to_rgba() {
        let dir = std::env::temp_dir().join(format!("photo-cutter-loader-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("fixture.png");
        let fixture = ImageBuffer::from_fn(6, 4, |x, y| Rgba([x as u8 * 10, y as u8 * 10, 0, 255]));
        fixture.save(&path).unwrap();

        let source = load_source(&path).unwrap();
        assert_eq!((source.width(), source.height()), (6, 4));
        assert_eq!(source.as_raw(), fixture.as_raw());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
