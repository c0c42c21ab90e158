//! Typed `Image` component.
//!
//! [`ImageComponent`] is the compile-time checked counterpart of the
//! `Image.*` exec-table entries. [`image_exec_table`] binds any
//! implementation back into string dispatch so both call styles reach the
//! same object.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shim_runtime_common::BackendError;
use shim_runtime_core::{ExecContext, ExecTable};

/// Component name used in exec tables.
pub const IMAGE: &str = "Image";

/// Metadata of a loaded image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// MIME type (e.g. `image/png`).
    pub mime: String,
    /// Decoded size in bytes.
    pub size: u64,
}

impl ImageInfo {
    /// Info for a decoded RGBA image of the given dimensions.
    pub fn new(width: u32, height: u32, mime: impl Into<String>) -> Self {
        Self {
            width,
            height,
            mime: mime.into(),
            size: rgba_size(width, height),
        }
    }
}

/// Image operations a backend provides.
pub trait ImageComponent: Send + Sync + fmt::Debug {
    /// Current image metadata.
    fn info(&self) -> ImageInfo;

    /// Resize to fit `width` x `height`.
    ///
    /// With `crop`, the result is exactly `width` x `height`; otherwise the
    /// aspect ratio is preserved. A `resize` event carrying the new
    /// [`ImageInfo`] is triggered on the caller.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::InvalidArgument`] for zero dimensions.
    fn resize(
        &self,
        ctx: &ExecContext,
        width: u32,
        height: u32,
        crop: bool,
    ) -> Result<ImageInfo, BackendError>;
}

/// In-memory [`ImageComponent`] that only tracks metadata.
#[derive(Debug)]
pub struct ScriptedImage {
    info: Mutex<ImageInfo>,
}

impl ScriptedImage {
    /// Create an image with the given initial metadata.
    pub fn new(info: ImageInfo) -> Self {
        Self {
            info: Mutex::new(info),
        }
    }
}

impl ImageComponent for ScriptedImage {
    fn info(&self) -> ImageInfo {
        self.info.lock().clone()
    }

    fn resize(
        &self,
        ctx: &ExecContext,
        width: u32,
        height: u32,
        crop: bool,
    ) -> Result<ImageInfo, BackendError> {
        if width == 0 || height == 0 {
            return Err(BackendError::invalid_argument(format!(
                "cannot resize to {width}x{height}"
            )));
        }

        let resized = {
            let mut info = self.info.lock();
            if info.width == 0 || info.height == 0 {
                return Err(BackendError::exec_failed(IMAGE, "resize", "image not loaded"));
            }
            let (w, h) = if crop {
                (width, height)
            } else {
                fit(info.width, info.height, width, height)
            };
            info.width = w;
            info.height = h;
            info.size = rgba_size(w, h);
            info.clone()
        };

        let payload = serde_json::to_value(&resized)
            .map_err(|e| BackendError::exec_failed(IMAGE, "resize", e.to_string()))?;
        ctx.caller().trigger("resize", payload);
        Ok(resized)
    }
}

/// Bind `Image.getInfo` and `Image.resize` to a typed component.
///
/// `resize` takes `[width, height, crop?]`.
pub fn image_exec_table(image: Arc<dyn ImageComponent>) -> ExecTable {
    let for_info = image.clone();
    ExecTable::new()
        .method(IMAGE, "getInfo", move |_, _| to_json(&for_info.info()))
        .method(IMAGE, "resize", move |ctx, args| {
            let width = arg_u32(args, 0, "width")?;
            let height = arg_u32(args, 1, "height")?;
            let crop = args.get(2).and_then(Value::as_bool).unwrap_or(false);
            to_json(&image.resize(ctx, width, height, crop)?)
        })
}

fn to_json(info: &ImageInfo) -> Result<Value, BackendError> {
    serde_json::to_value(info).map_err(|e| BackendError::exec_failed(IMAGE, "getInfo", e.to_string()))
}

fn arg_u32(args: &[Value], index: usize, name: &str) -> Result<u32, BackendError> {
    args.get(index)
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| BackendError::invalid_argument(format!("{name} must be a u32")))
}

// Largest size with the original aspect ratio that fits in the box.
fn fit(width: u32, height: u32, max_w: u32, max_h: u32) -> (u32, u32) {
    let (w, h) = (u64::from(width), u64::from(height));
    let (bw, bh) = (u64::from(max_w), u64::from(max_h));
    let (nw, nh) = if w * bh > h * bw {
        (bw, (h * bw / w).max(1))
    } else {
        ((w * bh / h).max(1), bh)
    };
    (
        u32::try_from(nw).unwrap_or(u32::MAX),
        u32::try_from(nh).unwrap_or(u32::MAX),
    )
}

fn rgba_size(width: u32, height: u32) -> u64 {
    u64::from(width) * u64::from(height) * 4
}
