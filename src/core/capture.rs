/*
 * The capture contract used by the export driver, plus a file-backed renderer.
 *
 * A capture service renders whatever is effectively visible in the tree at the
 * moment of the call, fitted into a fixed canvas with a transparent background.
 * The export driver isolates one layer before calling it, so in practice the output
 * shows that single layer.
 *
 * `CoreImageCaptureService` stands in for the host editor's renderer when working
 * on a document description on disk: every content layer may point at an image
 * file (`LayerNode::source`), and the service composites those files.
 */
use super::layer_tree::{LayerId, LayerTree};
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat, RgbaImage};
use serde::{Deserialize, Serialize};
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanvasSize {
    pub width: u32,
    pub height: u32,
}

impl CanvasSize {
    pub fn new(width: u32, height: u32) -> Self {
        CanvasSize { width, height }
    }
}

impl Default for CanvasSize {
    fn default() -> Self {
        CanvasSize::new(200, 200)
    }
}

impl std::fmt::Display for CanvasSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Debug)]
pub enum CaptureError {
    Io(io::Error),
    Image(image::ImageError),
    UnknownLayer(LayerId),
    MissingSource(LayerId),
    EmptyCanvas,
    Host(String),
}

impl From<io::Error> for CaptureError {
    fn from(err: io::Error) -> Self {
        CaptureError::Io(err)
    }
}

impl From<image::ImageError> for CaptureError {
    fn from(err: image::ImageError) -> Self {
        CaptureError::Image(err)
    }
}

impl std::fmt::Display for CaptureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureError::Io(e) => write!(f, "Capture I/O error: {e}"),
            CaptureError::Image(e) => write!(f, "Image processing error: {e}"),
            CaptureError::UnknownLayer(id) => write!(f, "Layer {id} does not exist"),
            CaptureError::MissingSource(id) => {
                write!(f, "Layer {id} has no pixel source to render")
            }
            CaptureError::EmptyCanvas => write!(f, "Canvas size must be non-zero"),
            CaptureError::Host(msg) => write!(f, "Host capture failed: {msg}"),
        }
    }
}

impl std::error::Error for CaptureError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CaptureError::Io(e) => Some(e),
            CaptureError::Image(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, CaptureError>;

/*
 * Renders the effectively visible content of `tree` into an encoded image of
 * exactly `size`. `node` names the layer the caller is interested in; renderers may
 * use it to validate the request.
 */
pub trait CaptureOperations: Send + Sync {
    fn capture(&self, tree: &LayerTree, node: LayerId, size: CanvasSize) -> Result<Vec<u8>>;
}

/*
 * Composites the source images of all effectively visible content layers into a
 * transparent RGBA canvas and encodes it as PNG. Layers are painted bottom-most
 * first (pre-order lists the top-most layer first). Each image is scaled down to
 * fit the canvas if needed and centred.
 */
pub struct CoreImageCaptureService {
    base_dir: Option<PathBuf>,
}

impl CoreImageCaptureService {
    /*
     * `base_dir` resolves relative `source` paths, typically the directory that
     * holds the document description.
     */
    pub fn new(base_dir: Option<PathBuf>) -> Self {
        CoreImageCaptureService { base_dir }
    }

    fn resolve_source(&self, source: &Path) -> PathBuf {
        match &self.base_dir {
            Some(base) if source.is_relative() => base.join(source),
            _ => source.to_path_buf(),
        }
    }

    fn paint(&self, canvas: &mut RgbaImage, source: &Path) -> Result<()> {
        let path = self.resolve_source(source);
        log::trace!("ImageCapture: Painting {path:?}");
        let mut layer_image = image::open(&path)?;
        if layer_image.width() > canvas.width() || layer_image.height() > canvas.height() {
            layer_image = layer_image.resize(canvas.width(), canvas.height(), FilterType::Lanczos3);
        }
        let x = (i64::from(canvas.width()) - i64::from(layer_image.width())) / 2;
        let y = (i64::from(canvas.height()) - i64::from(layer_image.height())) / 2;
        imageops::overlay(canvas, &layer_image.to_rgba8(), x, y);
        Ok(())
    }
}

impl Default for CoreImageCaptureService {
    fn default() -> Self {
        Self::new(None)
    }
}

impl CaptureOperations for CoreImageCaptureService {
    fn capture(&self, tree: &LayerTree, node: LayerId, size: CanvasSize) -> Result<Vec<u8>> {
        if size.width == 0 || size.height == 0 {
            return Err(CaptureError::EmptyCanvas);
        }
        let target = tree.get(node).ok_or(CaptureError::UnknownLayer(node))?;
        if !target.is_group() && target.source.is_none() {
            return Err(CaptureError::MissingSource(node));
        }

        let painted: Vec<&Path> = tree
            .pre_order()
            .filter(|&id| tree.is_effectively_visible(id))
            .filter_map(|id| tree.get(id))
            .filter(|layer| !layer.is_group())
            .filter_map(|layer| layer.source.as_deref())
            .collect();

        let mut canvas = RgbaImage::new(size.width, size.height);
        for source in painted.iter().rev() {
            self.paint(&mut canvas, source)?;
        }

        let mut encoded = Vec::new();
        DynamicImage::ImageRgba8(canvas).write_to(&mut Cursor::new(&mut encoded), ImageFormat::Png)?;
        log::debug!(
            "ImageCapture: Rendered {node} from {} source image(s) at {size}.",
            painted.len()
        );
        Ok(encoded)
    }
}
