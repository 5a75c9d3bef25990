//! Page splitting: one spread page → two half-page PDFs and two PNG rasters.
//!
//! ## Geometry
//!
//! The cut is a hard vertical edge at exactly half the displayed page width.
//! There is no gutter trimming, overlap or layout detection: a single-column
//! page is split down the middle like any other.
//!
//! * **PDF halves** copy the source page into a fresh single-page document
//!   and narrow its media and crop boxes to one half of the visible box
//!   (crop box, else media box). The box origin need not be zero, and for
//!   `/Rotate 90` or `270` the midline runs along user-space `y`. Page
//!   content is untouched, so the original image resolution is preserved.
//! * **PNG halves** come from a single full-page render cut at
//!   `floor(W_px / 2)`, so left width + right width is exactly the rendered
//!   width with no pixel lost or duplicated.
//!
//! ## Why spawn_blocking?
//!
//! pdfium is a C++ library with thread-local state; every call here happens
//! on tokio's blocking pool with a freshly bound `Pdfium` instance.

use crate::error::SplitError;
use crate::layout::{OutputLayout, Side};
use crate::output::{Document, PageInfo};
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::future::Future;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// PDF points per inch.
const POINTS_PER_INCH: f32 = 72.0;

/// Output paths for one half of a page.
#[derive(Debug, Clone)]
pub struct HalfTarget {
    pub side: Side,
    pub pdf: PathBuf,
    pub png: PathBuf,
}

/// Output paths for both halves of a page.
#[derive(Debug, Clone)]
pub struct SplitTargets {
    pub left: HalfTarget,
    pub right: HalfTarget,
}

impl SplitTargets {
    pub fn new(layout: &OutputLayout, document: &Document, page: usize) -> Self {
        let target = |side| {
            let id = document.half_page(page, side);
            HalfTarget {
                side,
                pdf: layout.half_pdf(&id),
                png: layout.half_png(&id),
            }
        };
        Self {
            left: target(Side::Left),
            right: target(Side::Right),
        }
    }

    pub fn paths(&self) -> [&Path; 4] {
        [
            &self.left.pdf,
            &self.left.png,
            &self.right.pdf,
            &self.right.png,
        ]
    }
}

/// Splits source pages into half-page artifacts.
pub trait PageSplitter: Send + Sync {
    /// Page geometry of every page, in order.
    fn pages(&self, pdf: &Path) -> impl Future<Output = Result<Vec<PageInfo>, SplitError>> + Send;

    /// Write both halves of `page` to `targets`.
    fn split_page(
        &self,
        pdf: &Path,
        page: PageInfo,
        targets: &SplitTargets,
    ) -> impl Future<Output = Result<(), SplitError>> + Send;
}

impl<T: PageSplitter> PageSplitter for &T {
    fn pages(&self, pdf: &Path) -> impl Future<Output = Result<Vec<PageInfo>, SplitError>> + Send {
        (**self).pages(pdf)
    }

    fn split_page(
        &self,
        pdf: &Path,
        page: PageInfo,
        targets: &SplitTargets,
    ) -> impl Future<Output = Result<(), SplitError>> + Send {
        (**self).split_page(pdf, page, targets)
    }
}

// ── Geometry ─────────────────────────────────────────────────────────────

/// A rectangle in PDF user space, in points (origin bottom-left).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageRect {
    pub left: f32,
    pub bottom: f32,
    pub right: f32,
    pub top: f32,
}

impl PageRect {
    pub fn new(left: f32, bottom: f32, right: f32, top: f32) -> Self {
        Self {
            left,
            bottom,
            right,
            top,
        }
    }

    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.top - self.bottom
    }

    fn from_pdf(rect: &PdfRect) -> Self {
        Self::new(
            rect.left().value,
            rect.bottom().value,
            rect.right().value,
            rect.top().value,
        )
    }

    fn to_pdf(self) -> PdfRect {
        PdfRect::new_from_values(self.bottom, self.left, self.top, self.right)
    }
}

/// Split the visible box into its on-screen left and right halves.
///
/// `rotation` is the page's `/Rotate` in degrees. The cut is always the
/// vertical midline of the page as displayed, which in user space is
/// `x = mid` for 0/180 and `y = mid` for 90/270. Halves come back in display
/// order `[left, right]`.
pub fn split_bounds(visible: PageRect, rotation: u16) -> [PageRect; 2] {
    let PageRect {
        left,
        bottom,
        right,
        top,
    } = visible;
    let mid_x = (left + right) / 2.0;
    let mid_y = (bottom + top) / 2.0;
    let low_x = PageRect::new(left, bottom, mid_x, top);
    let high_x = PageRect::new(mid_x, bottom, right, top);
    let low_y = PageRect::new(left, bottom, right, mid_y);
    let high_y = PageRect::new(left, mid_y, right, top);
    match rotation % 360 {
        // user +y points right on screen
        90 => [low_y, high_y],
        180 => [high_x, low_x],
        // user +y points left on screen
        270 => [high_y, low_y],
        _ => [low_x, high_x],
    }
}

fn rotation_degrees(rotation: PdfPageRenderRotation) -> u16 {
    match rotation {
        PdfPageRenderRotation::None => 0,
        PdfPageRenderRotation::Degrees90 => 90,
        PdfPageRenderRotation::Degrees180 => 180,
        PdfPageRenderRotation::Degrees270 => 270,
    }
}

/// Crop box, else media box, else the displayed size un-rotated to user
/// space with its origin at zero.
fn visible_box(page: &PdfPage<'_>, rotation: u16) -> PageRect {
    let boundaries = page.boundaries();
    match boundaries.crop().or_else(|_| boundaries.media()) {
        Ok(boundary) => PageRect::from_pdf(&boundary.bounds),
        Err(_) => {
            let (w, h) = (page.width().value, page.height().value);
            if rotation % 180 == 90 {
                PageRect::new(0.0, 0.0, h, w)
            } else {
                PageRect::new(0.0, 0.0, w, h)
            }
        }
    }
}

/// Pixel widths of the two halves; the right half takes the odd pixel.
pub fn split_pixels(width: u32) -> (u32, u32) {
    let left = width / 2;
    (left, width - left)
}

/// Cut a rendered page into its left and right halves.
pub fn split_image(image: &DynamicImage) -> (DynamicImage, DynamicImage) {
    let (left_w, right_w) = split_pixels(image.width());
    let h = image.height();
    (
        image.crop_imm(0, 0, left_w, h),
        image.crop_imm(left_w, 0, right_w, h),
    )
}

/// Pixel size of a full-page render at `dpi`, longest edge capped at
/// `max_px` with the aspect ratio preserved.
pub fn render_size(width_pt: f32, height_pt: f32, dpi: u32, max_px: u32) -> (u32, u32) {
    let max_px = max_px.max(1);
    let scale = dpi as f32 / POINTS_PER_INCH;
    let raw_w = (width_pt * scale).max(1.0);
    let raw_h = (height_pt * scale).max(1.0);

    let longest = raw_w.max(raw_h);
    if longest > max_px as f32 {
        let ratio = max_px as f32 / longest;
        let w = ((raw_w * ratio) as u32).clamp(1, max_px);
        let h = ((raw_h * ratio) as u32).clamp(1, max_px);
        (w, h)
    } else {
        (raw_w.round() as u32, raw_h.round() as u32)
    }
}

// ── pdfium binding ───────────────────────────────────────────────────────

/// Bind the pdfium library.
///
/// Discovery order:
/// 1. `explicit` path (config `pdfium_lib_path`)
/// 2. `PDFIUM_LIB_PATH` environment variable
/// 3. Alongside the running executable
/// 4. System library search paths
pub fn bind_pdfium(explicit: Option<&Path>) -> Result<Pdfium, String> {
    let from_env = std::env::var_os("PDFIUM_LIB_PATH")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from);
    if let Some(path) = explicit.map(Path::to_path_buf).or(from_env) {
        let path = path.as_path();
        debug!(path = %path.display(), "Binding pdfium from explicit path");
        let lib = if path.is_dir() {
            Pdfium::pdfium_platform_library_name_at_path(path)
        } else {
            path.to_path_buf()
        };
        let bindings = Pdfium::bind_to_library(&lib)
            .map_err(|e| format!("cannot load '{}': {e}", lib.display()))?;
        return Ok(Pdfium::new(bindings));
    }

    if let Some(exe_dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        let lib = Pdfium::pdfium_platform_library_name_at_path(&exe_dir);
        if let Ok(bindings) = Pdfium::bind_to_library(&lib) {
            debug!(dir = %exe_dir.display(), "Bound pdfium next to executable");
            return Ok(Pdfium::new(bindings));
        }
    }

    let bindings = Pdfium::bind_to_system_library().map_err(|e| format!("{e}"))?;
    Ok(Pdfium::new(bindings))
}

// ── pdfium splitter ──────────────────────────────────────────────────────

/// [`PageSplitter`] backed by pdfium-render.
#[derive(Debug, Clone)]
pub struct PdfiumSplitter {
    dpi: u32,
    max_rendered_pixels: u32,
    lib_path: Option<PathBuf>,
}

impl PdfiumSplitter {
    pub fn new(dpi: u32, max_rendered_pixels: u32, lib_path: Option<PathBuf>) -> Self {
        Self {
            dpi,
            max_rendered_pixels,
            lib_path,
        }
    }

    /// Fail fast if pdfium cannot be bound at all.
    pub fn check_binding(&self) -> Result<(), String> {
        bind_pdfium(self.lib_path.as_deref()).map(|_| ())
    }
}

impl PageSplitter for PdfiumSplitter {
    async fn pages(&self, pdf: &Path) -> Result<Vec<PageInfo>, SplitError> {
        let pdf = pdf.to_path_buf();
        let lib = self.lib_path.clone();
        tokio::task::spawn_blocking(move || pages_blocking(lib.as_deref(), &pdf))
            .await
            .map_err(|e| SplitError::Render {
                page: 0,
                detail: format!("inspect task panicked: {e}"),
            })?
    }

    async fn split_page(
        &self,
        pdf: &Path,
        page: PageInfo,
        targets: &SplitTargets,
    ) -> Result<(), SplitError> {
        let pdf = pdf.to_path_buf();
        let lib = self.lib_path.clone();
        let targets = targets.clone();
        let (dpi, max_px) = (self.dpi, self.max_rendered_pixels);
        tokio::task::spawn_blocking(move || {
            split_page_blocking(lib.as_deref(), &pdf, page, dpi, max_px, &targets)
        })
        .await
        .map_err(|e| SplitError::Render {
            page: page.index,
            detail: format!("split task panicked: {e}"),
        })?
    }
}

fn load_error(pdf: &Path, e: PdfiumError) -> SplitError {
    SplitError::Load {
        path: pdf.to_path_buf(),
        detail: format!("{e:?}"),
    }
}

fn pages_blocking(lib: Option<&Path>, pdf: &Path) -> Result<Vec<PageInfo>, SplitError> {
    let pdfium = bind_pdfium(lib).map_err(SplitError::Binding)?;
    let document = pdfium
        .load_pdf_from_file(pdf, None)
        .map_err(|e| load_error(pdf, e))?;

    let pages = document
        .pages()
        .iter()
        .enumerate()
        .map(|(i, page)| PageInfo {
            index: i + 1,
            width: page.width().value,
            height: page.height().value,
        })
        .collect::<Vec<_>>();
    debug!("{}: {} pages", pdf.display(), pages.len());
    Ok(pages)
}

fn split_page_blocking(
    lib: Option<&Path>,
    pdf: &Path,
    page: PageInfo,
    dpi: u32,
    max_px: u32,
    targets: &SplitTargets,
) -> Result<(), SplitError> {
    let pdfium = bind_pdfium(lib).map_err(SplitError::Binding)?;
    let source = pdfium
        .load_pdf_from_file(pdf, None)
        .map_err(|e| load_error(pdf, e))?;

    let total = source.pages().len() as usize;
    if page.index == 0 || page.index > total {
        return Err(SplitError::PageOutOfRange {
            page: page.index,
            total,
        });
    }
    let page_index = u16::try_from(page.index - 1).map_err(|_| SplitError::PageOutOfRange {
        page: page.index,
        total,
    })?;

    let render_err = |detail: String| SplitError::Render {
        page: page.index,
        detail,
    };

    let src_page = source
        .pages()
        .get(page_index)
        .map_err(|e| render_err(format!("{e:?}")))?;
    let width = src_page.width().value;
    let height = src_page.height().value;

    let (w_px, h_px) = render_size(width, height, dpi, max_px);
    let uncapped = render_size(width, height, dpi, u32::MAX);
    if (w_px, h_px) != uncapped {
        warn!(
            page = page.index,
            capped_width = w_px,
            capped_height = h_px,
            "Render capped to {max_px}px"
        );
    }
    let render_config = PdfRenderConfig::new()
        .set_target_width(w_px as i32)
        .set_maximum_height(h_px as i32);
    let bitmap = src_page
        .render_with_config(&render_config)
        .map_err(|e| render_err(format!("{e:?}")))?;
    let image = bitmap.as_image();
    let (left_img, right_img) = split_image(&image);

    let rotation = src_page.rotation().map(rotation_degrees).unwrap_or(0);
    let visible = visible_box(&src_page, rotation);
    let [left_bounds, right_bounds] = split_bounds(visible, rotation);
    for (target, bounds, img) in [
        (&targets.left, left_bounds, left_img),
        (&targets.right, right_bounds, right_img),
    ] {
        write_half_pdf(&pdfium, &source, page_index, bounds, &target.pdf)
            .map_err(|e| match e {
                HalfWriteError::Pdfium(detail) => render_err(detail),
                HalfWriteError::Io(detail) => SplitError::Write {
                    path: target.pdf.clone(),
                    detail,
                },
            })?;
        write_png(&img, &target.png)?;
        debug!(
            page = page.index,
            side = %target.side,
            rotation,
            box_width_pt = bounds.width(),
            box_height_pt = bounds.height(),
            width_px = img.width(),
            "Wrote half page"
        );
    }
    Ok(())
}

enum HalfWriteError {
    Pdfium(String),
    Io(String),
}

fn write_half_pdf(
    pdfium: &Pdfium,
    source: &PdfDocument<'_>,
    page_index: u16,
    bounds: PageRect,
    dest: &Path,
) -> Result<(), HalfWriteError> {
    let pdfium_err = |e: PdfiumError| HalfWriteError::Pdfium(format!("{e:?}"));

    let mut half_doc = pdfium.create_new_pdf().map_err(pdfium_err)?;
    half_doc
        .pages_mut()
        .copy_page_from_document(source, page_index, 0)
        .map_err(pdfium_err)?;
    {
        let mut half_page = half_doc.pages().get(0).map_err(pdfium_err)?;
        let rect = bounds.to_pdf();
        half_page
            .boundaries_mut()
            .set_media(rect)
            .map_err(pdfium_err)?;
        half_page
            .boundaries_mut()
            .set_crop(rect)
            .map_err(pdfium_err)?;
    }

    let staged = staging_file(dest).map_err(HalfWriteError::Io)?;
    half_doc.save_to_file(staged.path()).map_err(pdfium_err)?;
    staged
        .persist(dest)
        .map(|_| ())
        .map_err(|e| HalfWriteError::Io(e.error.to_string()))
}

fn write_png(image: &DynamicImage, dest: &Path) -> Result<(), SplitError> {
    let write_err = |detail: String| SplitError::Write {
        path: dest.to_path_buf(),
        detail,
    };
    let staged = staging_file(dest).map_err(write_err)?;
    image
        .save_with_format(staged.path(), image::ImageFormat::Png)
        .map_err(|e| write_err(e.to_string()))?;
    staged
        .persist(dest)
        .map(|_| ())
        .map_err(|e| write_err(e.error.to_string()))
}

/// Temp file next to `dest`; dropped (and deleted) unless persisted.
fn staging_file(dest: &Path) -> Result<NamedTempFile, String> {
    let parent = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    tempfile::Builder::new()
        .prefix(".split-")
        .tempfile_in(parent)
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    #[test]
    fn halves_cover_page_exactly() {
        for width in [1.0f32, 595.0, 841.89, 1190.55, 1683.78, 2383.94, 7.5] {
            let [l, r] = split_bounds(PageRect::new(0.0, 0.0, width, 842.0), 0);
            assert_eq!(l.width() + r.width(), width, "width {width}");
            assert_eq!(l.right, r.left, "no gap or overlap at {width}");
            assert_eq!(l.left, 0.0);
            assert_eq!(r.right, width);
            assert_eq!(l.top, 842.0);
        }
    }

    #[test]
    fn halves_follow_crop_box_origin() {
        // MediaBox [0 0 1224 792], CropBox [36 0 1224 792]
        let [l, r] = split_bounds(PageRect::new(36.0, 0.0, 1224.0, 792.0), 0);
        assert_eq!(l, PageRect::new(36.0, 0.0, 630.0, 792.0));
        assert_eq!(r, PageRect::new(630.0, 0.0, 1224.0, 792.0));

        let [l, r] = split_bounds(PageRect::new(10.0, 20.0, 610.0, 420.0), 0);
        assert_eq!((l.left, l.right, r.left, r.right), (10.0, 310.0, 310.0, 610.0));
        assert_eq!((l.bottom, l.top), (20.0, 420.0));
    }

    #[test]
    fn quarter_turns_cut_along_user_y() {
        // portrait user space shown as a landscape spread
        let visible = PageRect::new(0.0, 10.0, 842.0, 1200.0);

        let [l, r] = split_bounds(visible, 90);
        assert_eq!(l, PageRect::new(0.0, 10.0, 842.0, 605.0));
        assert_eq!(r, PageRect::new(0.0, 605.0, 842.0, 1200.0));

        let [l, r] = split_bounds(visible, 270);
        assert_eq!(l, PageRect::new(0.0, 605.0, 842.0, 1200.0));
        assert_eq!(r, PageRect::new(0.0, 10.0, 842.0, 605.0));

        // displayed half width is half the displayed width
        assert_eq!(l.height() + r.height(), visible.height());
        assert_eq!(l.width(), visible.width());
    }

    #[test]
    fn half_turn_swaps_sides() {
        let visible = PageRect::new(0.0, 0.0, 1190.0, 842.0);
        let [l, r] = split_bounds(visible, 180);
        assert_eq!(l, PageRect::new(595.0, 0.0, 1190.0, 842.0));
        assert_eq!(r, PageRect::new(0.0, 0.0, 595.0, 842.0));
        assert_eq!(split_bounds(visible, 360), split_bounds(visible, 0));
    }

    #[test]
    fn pixel_halves_sum_to_width() {
        for w in [0u32, 1, 2, 3, 2479, 2480, 4961] {
            let (l, r) = split_pixels(w);
            assert_eq!(l + r, w);
            assert!(r - l <= 1, "at most one pixel remainder");
        }
    }

    #[test]
    fn split_image_keeps_each_side_content() {
        // left 3 columns red, right 4 columns blue
        let mut img = RgbaImage::from_pixel(7, 2, Rgba([0, 0, 255, 255]));
        for x in 0..3 {
            for y in 0..2 {
                img.put_pixel(x, y, Rgba([255, 0, 0, 255]));
            }
        }
        let (left, right) = split_image(&DynamicImage::ImageRgba8(img));
        assert_eq!(left.width() + right.width(), 7);
        assert_eq!(left.height(), 2);
        assert_eq!(right.height(), 2);
        assert_eq!(left.to_rgba8().get_pixel(0, 0), &Rgba([255, 0, 0, 255]));
        assert_eq!(right.to_rgba8().get_pixel(3, 1), &Rgba([0, 0, 255, 255]));
    }

    #[test]
    fn render_size_follows_dpi() {
        // A3 landscape spread at 300 DPI
        let (w, h) = render_size(1190.55, 841.89, 300, 8000);
        assert_eq!((w, h), (4961, 3508));
    }

    #[test]
    fn render_size_is_capped() {
        let (w, h) = render_size(2383.94, 1683.78, 600, 8000);
        assert_eq!(w, 8000);
        assert!(h < 8000);
        let ratio = w as f32 / h as f32;
        assert!((ratio - 2383.94 / 1683.78).abs() < 0.01);
    }

    #[test]
    fn zero_pixel_cap_does_not_panic() {
        assert_eq!(render_size(100.0, 100.0, 300, 0), (1, 1));
    }

    #[test]
    fn targets_follow_layout() {
        let layout = OutputLayout::new("/out");
        let doc = Document::from_path("/in/2024.pdf");
        let t = SplitTargets::new(&layout, &doc, 7);
        assert_eq!(t.left.pdf, PathBuf::from("/out/2024/pdf_pages/2024_p07_L.pdf"));
        assert_eq!(t.right.png, PathBuf::from("/out/2024/pdf_pages/2024_p07_R.png"));
        assert_eq!(t.paths().len(), 4);
    }

    #[test]
    fn png_is_written_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("pdf_pages").join("2024_p01_L.png");
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(4, 3, Rgba([9, 9, 9, 255])));
        write_png(&img, &dest).unwrap();

        let back = image::open(&dest).unwrap();
        assert_eq!((back.width(), back.height()), (4, 3));
        let names: Vec<_> = std::fs::read_dir(dest.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("2024_p01_L.png")]);
    }
}
