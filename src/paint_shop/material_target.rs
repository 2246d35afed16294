//! Seam between the paint shop and whatever holds the loaded model.

use std::sync::Arc;

use crate::error::Result;
use crate::gpu::GpuImage;

/// Replacement content for a material slot.
#[derive(Clone, Debug)]
pub enum OverrideSource {
    /// A GPU image, usually a paint-shop output kept live by the output cache.
    Image(GpuImage),
    /// Encoded image bytes, decoded and uploaded by the target.
    Bytes(Arc<[u8]>),
}

/// What happened to an override write.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OverrideOutcome {
    Applied,
    /// Nothing is loaded; the write was dropped, not queued.
    NoModelLoaded,
}

/// A live model whose named texture slots can be read and overridden.
pub trait MaterialTarget: Send + Sync {
    /// Stable name of the seat showing the model. Paint-shop outputs are
    /// kept per seat so two seats never share a render target.
    fn seat(&self) -> &str;

    /// Identity of the loaded model, `None` while empty.
    fn model_id(&self) -> Option<String>;

    /// Currently applied skin, if any.
    fn skin_id(&self) -> Option<String>;

    /// Encoded bytes of a texture entry, current skin first.
    fn texture_bytes(&self, name: &str) -> Option<Arc<[u8]>>;

    /// Install (`Some`) or revert (`None`) the override of `slot`.
    fn set_override(&self, slot: &str, source: Option<OverrideSource>) -> Result<OverrideOutcome>;
}

/// Target with nothing loaded. Used for bakes that only read raw bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoModel;

impl MaterialTarget for NoModel {
    fn seat(&self) -> &str {
        ""
    }

    fn model_id(&self) -> Option<String> {
        None
    }

    fn skin_id(&self) -> Option<String> {
        None
    }

    fn texture_bytes(&self, _name: &str) -> Option<Arc<[u8]>> {
        None
    }

    fn set_override(&self, _slot: &str, _source: Option<OverrideSource>) -> Result<OverrideOutcome> {
        Ok(OverrideOutcome::NoModelLoaded)
    }
}
