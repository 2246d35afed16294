//! Texture output cache: one persistent render target per seat and slot.
//!
//! Targets are keyed by the [`MaterialTarget::seat`] as well as the slot
//! name, so two cars overriding the same slot never draw into one image.
//!
//! [`MaterialTarget::seat`]: super::MaterialTarget::seat

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::Result;
use crate::gpu::{GpuImage, SharedBackend};

use super::effects::{fingerprint, Effect, EffectInputs, EffectPipeline};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct OutputKey {
    seat: String,
    slot: String,
}

impl OutputKey {
    fn new(seat: &str, slot: &str) -> Self {
        Self {
            seat: seat.to_string(),
            slot: slot.to_string(),
        }
    }

    fn label(&self) -> String {
        format!("{}/{}", self.seat, self.slot)
    }
}

struct OutputEntry {
    image: GpuImage,
    /// Identity of the composite currently held by `image`.
    fingerprint: Option<u64>,
}

pub struct OutputCache {
    backend: SharedBackend,
    entries: Mutex<HashMap<OutputKey, OutputEntry>>,
}

impl OutputCache {
    pub fn new(backend: SharedBackend) -> Self {
        Self {
            backend,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The target for `slot` of `seat`, allocated on first use and
    /// reallocated when the requested size differs.
    pub fn get_or_create(&self, seat: &str, slot: &str, width: u32, height: u32) -> Result<GpuImage> {
        let mut entries = self.entries.lock();
        self.entry(&mut entries, OutputKey::new(seat, slot), (width, height))
            .map(|e| e.image.clone())
    }

    fn entry<'a>(
        &self,
        entries: &'a mut HashMap<OutputKey, OutputEntry>,
        key: OutputKey,
        size: (u32, u32),
    ) -> Result<&'a mut OutputEntry> {
        let entry = match entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().image.size() != size {
                    let label = occupied.key().label();
                    log::debug!(
                        "Reallocating output `{label}` {:?} -> {:?}",
                        occupied.get().image.size(),
                        size
                    );
                    *occupied.get_mut() = OutputEntry {
                        image: GpuImage::target(&self.backend, size.0, size.1, &label)?,
                        fingerprint: None,
                    };
                }
                occupied.into_mut()
            }
            Entry::Vacant(vacant) => {
                let image = GpuImage::target(&self.backend, size.0, size.1, &vacant.key().label())?;
                vacant.insert(OutputEntry {
                    image,
                    fingerprint: None,
                })
            }
        };
        Ok(entry)
    }

    /// Draw `effect` into the target of `slot` on `seat` unless the exact
    /// same composite is already there. Returns the target and whether a
    /// draw happened.
    pub fn composite(
        &self,
        pipeline: &EffectPipeline,
        seat: &str,
        slot: &str,
        effect: &Effect,
        inputs: &EffectInputs<'_>,
        size: (u32, u32),
    ) -> Result<(GpuImage, bool)> {
        let fp = fingerprint(effect, inputs, size);
        let mut entries = self.entries.lock();
        let entry = self.entry(&mut entries, OutputKey::new(seat, slot), size)?;
        if entry.fingerprint == Some(fp) {
            log::debug!("Output `{seat}/{slot}` already up to date");
            return Ok((entry.image.clone(), false));
        }
        entry.fingerprint = None;
        pipeline.draw_into(effect, inputs, &entry.image)?;
        entry.fingerprint = Some(fp);
        Ok((entry.image.clone(), true))
    }

    pub fn get(&self, seat: &str, slot: &str) -> Option<GpuImage> {
        self.entries
            .lock()
            .get(&OutputKey::new(seat, slot))
            .map(|e| e.image.clone())
    }

    /// Slots with a target on `seat`, sorted.
    pub fn slots(&self, seat: &str) -> Vec<String> {
        let mut slots: Vec<String> = self
            .entries
            .lock()
            .keys()
            .filter(|k| k.seat == seat)
            .map(|k| k.slot.clone())
            .collect();
        slots.sort();
        slots
    }

    pub fn remove(&self, seat: &str, slot: &str) -> Option<GpuImage> {
        self.entries
            .lock()
            .remove(&OutputKey::new(seat, slot))
            .map(|e| e.image)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Release every target (images still shared elsewhere stay alive until
    /// their last handle drops).
    pub fn dispose_all(&self) {
        let drained = std::mem::take(&mut *self.entries.lock());
        if !drained.is_empty() {
            log::debug!("Disposing {} output targets", drained.len());
        }
    }
}

impl std::fmt::Debug for OutputCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<String> = self.entries.lock().keys().map(OutputKey::label).collect();
        keys.sort();
        f.debug_struct("OutputCache").field("targets", &keys).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::CpuBackend;
    use std::sync::Arc;

    fn setup() -> (SharedBackend, EffectPipeline, OutputCache) {
        let backend: SharedBackend = Arc::new(CpuBackend::new());
        (
            backend.clone(),
            EffectPipeline::new(backend.clone()),
            OutputCache::new(backend),
        )
    }

    #[test]
    fn test_get_or_create_reuses_and_reallocates() {
        let (_backend, _pipeline, cache) = setup();
        let a = cache.get_or_create("main", "body", 8, 8).unwrap();
        let b = cache.get_or_create("main", "body", 8, 8).unwrap();
        assert!(a.same_as(&b));
        let c = cache.get_or_create("main", "body", 16, 8).unwrap();
        assert!(!a.same_as(&c));
        assert_eq!(c.size(), (16, 8));
        assert_eq!(cache.slots("main"), vec!["body".to_string()]);
    }

    #[test]
    fn test_identical_composite_skips_draw() {
        let (backend, pipeline, cache) = setup();
        let red = Effect::Fill {
            color: [1.0, 0.0, 0.0, 1.0],
        };
        let (_, drew) = cache.composite(&pipeline, "main", "body", &red, &[None; 4], (4, 4)).unwrap();
        assert!(drew);
        let (_, drew) = cache.composite(&pipeline, "main", "body", &red, &[None; 4], (4, 4)).unwrap();
        assert!(!drew);
        assert_eq!(backend.stats().draws, 1);

        let green = Effect::Fill {
            color: [0.0, 1.0, 0.0, 1.0],
        };
        let (img, drew) = cache.composite(&pipeline, "main", "body", &green, &[None; 4], (4, 4)).unwrap();
        assert!(drew);
        assert_eq!(img.read_pixels().unwrap().get_pixel(0, 0).0, [0, 255, 0, 255]);
    }

    #[test]
    fn test_seats_get_separate_targets() {
        let (_backend, pipeline, cache) = setup();
        let red = Effect::Fill {
            color: [1.0, 0.0, 0.0, 1.0],
        };
        let blue = Effect::Fill {
            color: [0.0, 0.0, 1.0, 1.0],
        };
        let (left, _) = cache.composite(&pipeline, "left", "rims", &red, &[None; 4], (2, 2)).unwrap();
        let (right, _) = cache.composite(&pipeline, "right", "rims", &blue, &[None; 4], (2, 2)).unwrap();
        assert!(!left.same_as(&right));
        assert_eq!(left.read_pixels().unwrap().get_pixel(0, 0).0, [255, 0, 0, 255]);
        assert_eq!(cache.slots("left"), vec!["rims".to_string()]);
        assert_eq!(cache.len(), 2);

        assert!(cache.remove("right", "rims").is_some());
        assert!(cache.get("right", "rims").is_none());
        assert!(cache.get("left", "rims").unwrap().same_as(&left));
    }

    #[test]
    fn test_dispose_all_releases_targets() {
        let (backend, _pipeline, cache) = setup();
        cache.get_or_create("main", "a", 2, 2).unwrap();
        cache.get_or_create("main", "b", 2, 2).unwrap();
        assert_eq!(backend.stats().live_images, 2);
        cache.dispose_all();
        assert!(cache.is_empty());
        assert_eq!(backend.stats().live_images, 0);
    }
}
