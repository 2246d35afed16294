//! A viewport seat holding at most one car.
//!
//! * `Empty → Loading → Ready → (Loading | Empty)`.
//! * Every set-car request gets a new request id. Only the latest request may
//!   attach; older results are dropped on arrival.
//! * Presentation state lives on the slot, not the car, so it survives swaps
//!   and is applied the moment a car attaches.
//! * All methods take `&self`. The internal lock is never held across an
//!   await or a container read.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::container::{Aabb, ContainerReader};
use super::pool::EvictionPool;
use super::resource::{CarAggregates, CarResource, DecodedCar, PresentationState};
use crate::error::{Error, Result};
use crate::gpu::{GpuImage, SharedBackend};
use crate::paint_shop::{MaterialTarget, OverrideOutcome, OverrideSource};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Empty,
    Loading,
    Ready,
}

/// How a set-car request ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetCarOutcome {
    /// Read, decoded and uploaded.
    Loaded,
    /// Taken back from the pool without re-uploading.
    Reattached,
    /// The car was already in the slot; only the skin was applied.
    AlreadyActive,
    /// A newer request won; this result was dropped.
    Superseded,
    Cancelled,
}

#[derive(Default)]
struct SlotInner {
    car: Option<CarResource>,
    latest_request: u64,
    /// Car id of the in-flight latest request.
    pending: Option<String>,
    presentation: PresentationState,
    requested_skin: Option<String>,
}

enum Begin {
    Done(SetCarOutcome),
    Load(u64),
}

pub struct CarSlot {
    name: String,
    backend: SharedBackend,
    reader: Arc<dyn ContainerReader>,
    pool: Arc<Mutex<EvictionPool>>,
    inner: Mutex<SlotInner>,
}

impl CarSlot {
    pub fn new(
        name: impl Into<String>,
        backend: SharedBackend,
        reader: Arc<dyn ContainerReader>,
        pool: Arc<Mutex<EvictionPool>>,
    ) -> Self {
        Self {
            name: name.into(),
            backend,
            reader,
            pool,
            inner: Mutex::new(SlotInner::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // ─── Loading ──────────────────────────────────────────────────────────────

    /// Load `id` on the calling thread.
    pub fn set_car(&self, id: &str, skin: Option<&str>) -> Result<SetCarOutcome> {
        let request = match self.begin(id, skin) {
            Begin::Done(outcome) => return Ok(outcome),
            Begin::Load(request) => request,
        };
        let decoded = self
            .reader
            .read(id)
            .map(|description| DecodedCar::decode(description, skin));
        self.complete(id, request, decoded, None)
    }

    /// Load `id` with the container read and texture decode on a blocking
    /// worker. GPU upload and attach happen on the awaiting task.
    pub async fn set_car_async(
        &self,
        id: &str,
        skin: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<SetCarOutcome> {
        let request = match self.begin(id, skin) {
            Begin::Done(outcome) => return Ok(outcome),
            Begin::Load(request) => request,
        };

        let reader = Arc::clone(&self.reader);
        let owned_id = id.to_string();
        let owned_skin = skin.map(str::to_string);
        let decoded = tokio::task::spawn_blocking(move || {
            reader
                .read(&owned_id)
                .map(|description| DecodedCar::decode(description, owned_skin.as_deref()))
        })
        .await
        .unwrap_or_else(|e| Err(Error::load_failure(id, e)));

        self.complete(id, request, decoded, Some(&cancel))
    }

    /// Detach the current car into the pool. In-flight loads are superseded.
    pub fn clear_car(&self) {
        let mut inner = self.inner.lock();
        inner.latest_request += 1;
        inner.pending = None;
        if let Some(car) = inner.car.take() {
            log::info!("[{}] cleared `{}`", self.name, car.id());
            self.pool.lock().admit(car);
        }
    }

    /// Fast paths under the lock: same car, or a pooled car.
    fn begin(&self, id: &str, skin: Option<&str>) -> Begin {
        let mut inner = self.inner.lock();
        inner.latest_request += 1;
        inner.requested_skin = skin.map(str::to_string);

        if inner.car.as_ref().is_some_and(|car| car.id() == id) {
            inner.pending = None;
            if let Some(car) = inner.car.as_mut() {
                apply_skin_or_warn(car, skin);
            }
            log::debug!("[{}] `{id}` already active", self.name);
            return Begin::Done(SetCarOutcome::AlreadyActive);
        }

        let pooled = self.pool.lock().take(id);
        if let Some(car) = pooled {
            self.attach(&mut inner, car);
            log::info!("[{}] reattached `{id}`", self.name);
            return Begin::Done(SetCarOutcome::Reattached);
        }

        inner.pending = Some(id.to_string());
        log::debug!("[{}] loading `{id}` (request {})", self.name, inner.latest_request);
        Begin::Load(inner.latest_request)
    }

    /// Decode → GPU build → attach, checking supersession and cancellation
    /// between stages.
    fn complete(
        &self,
        id: &str,
        request: u64,
        decoded: Result<DecodedCar>,
        cancel: Option<&CancellationToken>,
    ) -> Result<SetCarOutcome> {
        let decoded = match decoded {
            Ok(decoded) => decoded,
            Err(e) => return Err(self.fail(id, request, e)),
        };
        if let Some(outcome) = self.interrupted(id, request, cancel) {
            return Ok(outcome);
        }

        let car = match CarResource::build(&self.backend, decoded) {
            Ok(car) => car,
            Err(e) => return Err(self.fail(id, request, Error::load_failure(id, e))),
        };
        if let Some(outcome) = self.interrupted(id, request, cancel) {
            return Ok(outcome);
        }

        let mut inner = self.inner.lock();
        if inner.latest_request != request {
            log::warn!("[{}] dropping superseded `{id}`", self.name);
            return Ok(SetCarOutcome::Superseded);
        }
        self.attach(&mut inner, car);
        log::info!("[{}] loaded `{id}`", self.name);
        Ok(SetCarOutcome::Loaded)
    }

    fn interrupted(
        &self,
        id: &str,
        request: u64,
        cancel: Option<&CancellationToken>,
    ) -> Option<SetCarOutcome> {
        let mut inner = self.inner.lock();
        if inner.latest_request != request {
            log::warn!("[{}] dropping superseded `{id}`", self.name);
            return Some(SetCarOutcome::Superseded);
        }
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            inner.pending = None;
            log::debug!("[{}] load of `{id}` cancelled", self.name);
            return Some(SetCarOutcome::Cancelled);
        }
        None
    }

    fn fail(&self, id: &str, request: u64, error: Error) -> Error {
        let mut inner = self.inner.lock();
        if inner.latest_request == request {
            inner.pending = None;
        }
        log::warn!("[{}] failed to load `{id}`: {error}", self.name);
        error
    }

    /// Apply requested skin and presentation, then swap; the outgoing car
    /// goes to the pool.
    fn attach(&self, inner: &mut SlotInner, mut car: CarResource) {
        apply_skin_or_warn(&mut car, inner.requested_skin.as_deref());
        car.apply_presentation(&inner.presentation);
        inner.pending = None;
        if let Some(old) = inner.car.replace(car) {
            self.pool.lock().admit(old);
        }
    }

    // ─── Skins & LODs ─────────────────────────────────────────────────────────

    /// Select a skin (`None` = original textures). While empty the choice is
    /// remembered for the next car.
    pub fn select_skin(&self, skin: Option<&str>) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(car) = inner.car.as_mut() {
            car.apply_skin(skin)?;
        }
        inner.requested_skin = skin.map(str::to_string);
        Ok(())
    }

    pub fn select_next_skin(&self) -> Result<Option<String>> {
        self.step_skin(1)
    }

    pub fn select_previous_skin(&self) -> Result<Option<String>> {
        self.step_skin(-1)
    }

    fn step_skin(&self, step: isize) -> Result<Option<String>> {
        let mut inner = self.inner.lock();
        let Some(car) = inner.car.as_mut() else {
            return Ok(None);
        };
        let skins = car.skin_ids();
        if skins.is_empty() {
            return Ok(None);
        }
        let len = skins.len() as isize;
        let next = match car.current_skin().and_then(|s| skins.iter().position(|k| k == s)) {
            Some(i) => (i as isize + step).rem_euclid(len),
            None if step > 0 => 0,
            None => len - 1,
        };
        let skin = skins[next as usize].clone();
        car.apply_skin(Some(&skin))?;
        inner.requested_skin = Some(skin.clone());
        Ok(Some(skin))
    }

    /// Clamped. Returns the LOD now shown, `None` while empty.
    pub fn select_lod(&self, lod: usize) -> Option<usize> {
        let mut inner = self.inner.lock();
        let car = inner.car.as_mut()?;
        car.select_lod(lod);
        Some(car.lod())
    }

    pub fn select_next_lod(&self) -> Option<usize> {
        let lod = self.lod()?;
        self.select_lod(lod + 1)
    }

    pub fn select_previous_lod(&self) -> Option<usize> {
        let lod = self.lod()?;
        self.select_lod(lod.saturating_sub(1))
    }

    // ─── Presentation ─────────────────────────────────────────────────────────

    fn update_presentation(&self, f: impl FnOnce(&mut PresentationState)) {
        let mut inner = self.inner.lock();
        f(&mut inner.presentation);
        let state = inner.presentation.clone();
        if let Some(car) = inner.car.as_mut() {
            car.apply_presentation(&state);
        }
    }

    pub fn set_lights(&self, on: bool) {
        self.update_presentation(|p| p.lights = on);
    }

    pub fn set_brake_lights(&self, on: bool) {
        self.update_presentation(|p| p.brake_lights = on);
    }

    pub fn set_left_door_open(&self, open: bool) {
        self.update_presentation(|p| p.left_door_open = open);
    }

    pub fn set_right_door_open(&self, open: bool) {
        self.update_presentation(|p| p.right_door_open = open);
    }

    pub fn set_steering_angle(&self, degrees: f32) {
        self.update_presentation(|p| p.steering_angle = degrees);
    }

    pub fn presentation(&self) -> PresentationState {
        self.inner.lock().presentation.clone()
    }

    // ─── Inspection ───────────────────────────────────────────────────────────

    pub fn state(&self) -> SlotState {
        let inner = self.inner.lock();
        if inner.pending.is_some() {
            SlotState::Loading
        } else if inner.car.is_some() {
            SlotState::Ready
        } else {
            SlotState::Empty
        }
    }

    /// Run `f` against the attached car.
    pub fn with_car<R>(&self, f: impl FnOnce(&CarResource) -> R) -> Option<R> {
        self.inner.lock().car.as_ref().map(f)
    }

    pub fn car_id(&self) -> Option<String> {
        self.with_car(|car| car.id().to_string())
    }

    pub fn skin_ids(&self) -> Vec<String> {
        self.with_car(CarResource::skin_ids).unwrap_or_default()
    }

    pub fn current_skin(&self) -> Option<String> {
        self.with_car(|car| car.current_skin().map(str::to_string))
            .flatten()
    }

    pub fn lod(&self) -> Option<usize> {
        self.with_car(CarResource::lod)
    }

    pub fn lod_count(&self) -> usize {
        self.with_car(CarResource::lod_count).unwrap_or(0)
    }

    pub fn bounding_box(&self) -> Option<Aabb> {
        self.with_car(CarResource::bounding_box)
    }

    pub fn stable_bounding_box(&self) -> Option<Aabb> {
        self.with_car(CarResource::stable_bounding_box)
    }

    pub fn aggregates(&self) -> Option<CarAggregates> {
        self.with_car(CarResource::aggregates)
    }

    /// Texture currently bound to `slot` (override, skin or original).
    pub fn effective_texture(&self, slot: &str) -> Option<GpuImage> {
        self.with_car(|car| car.effective_texture(slot)).flatten()
    }
}

fn apply_skin_or_warn(car: &mut CarResource, skin: Option<&str>) {
    if let Err(e) = car.apply_skin(skin) {
        log::warn!("{}: {e}, showing original textures", car.id());
        if let Err(e) = car.apply_skin(None) {
            log::warn!("{}: {e}", car.id());
        }
    }
}

impl MaterialTarget for CarSlot {
    fn seat(&self) -> &str {
        &self.name
    }

    fn model_id(&self) -> Option<String> {
        self.car_id()
    }

    fn skin_id(&self) -> Option<String> {
        self.current_skin()
    }

    fn texture_bytes(&self, name: &str) -> Option<Arc<[u8]>> {
        self.with_car(|car| car.texture_bytes(name)).flatten()
    }

    fn set_override(&self, slot: &str, source: Option<OverrideSource>) -> Result<OverrideOutcome> {
        let mut inner = self.inner.lock();
        match inner.car.as_mut() {
            Some(car) => {
                car.set_override(slot, source)?;
                Ok(OverrideOutcome::Applied)
            }
            None => Ok(OverrideOutcome::NoModelLoaded),
        }
    }
}

impl std::fmt::Debug for CarSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CarSlot")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("car", &self.car_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::car::container::MemoryContainer;
    use crate::car::fixtures::test_car;
    use crate::config::PaintShopConfig;
    use crate::gpu::CpuBackend;
    use crate::paint_shop::{FlakesRequest, PaintShop};
    use glam::Vec3;
    use std::time::Duration;

    fn setup(ids: &[&str], capacity: usize) -> (SharedBackend, Arc<MemoryContainer>, CarSlot) {
        let backend: SharedBackend = Arc::new(CpuBackend::new());
        let container = Arc::new(MemoryContainer::new());
        for id in ids {
            container.insert(test_car(id));
        }
        let slot = CarSlot::new(
            "main",
            backend.clone(),
            container.clone(),
            Arc::new(Mutex::new(EvictionPool::new(capacity))),
        );
        (backend, container, slot)
    }

    #[tokio::test]
    async fn test_latest_request_wins() {
        let (backend, container, slot) = setup(&["slow", "fast"], 2);
        container.set_delay("slow", Duration::from_millis(200));

        let (slow, fast) = tokio::join!(
            slot.set_car_async("slow", None, CancellationToken::new()),
            slot.set_car_async("fast", None, CancellationToken::new()),
        );
        assert_eq!(slow.unwrap(), SetCarOutcome::Superseded);
        assert_eq!(fast.unwrap(), SetCarOutcome::Loaded);
        assert_eq!(slot.car_id().as_deref(), Some("fast"));
        assert_eq!(slot.state(), SlotState::Ready);
        // Only the winner's buffers are alive
        assert_eq!(backend.stats().live_buffers, 6);
    }

    #[tokio::test]
    async fn test_cancelled_load_never_attaches() {
        let (backend, _container, slot) = setup(&["abc"], 2);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = slot.set_car_async("abc", None, cancel).await.unwrap();
        assert_eq!(outcome, SetCarOutcome::Cancelled);
        assert_eq!(slot.state(), SlotState::Empty);
        assert_eq!(backend.stats().live_buffers, 0);
    }

    #[tokio::test]
    async fn test_cancel_mid_load_keeps_ready_car() {
        let (backend, container, slot) = setup(&["a", "b"], 2);
        slot.set_car("a", None).unwrap();
        container.set_delay("b", Duration::from_millis(200));

        let cancel = CancellationToken::new();
        let (outcome, ()) = tokio::join!(
            slot.set_car_async("b", None, cancel.clone()),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                assert_eq!(slot.state(), SlotState::Loading);
                cancel.cancel();
            },
        );
        assert_eq!(outcome.unwrap(), SetCarOutcome::Cancelled);
        assert_eq!(slot.car_id().as_deref(), Some("a"));
        assert_eq!(slot.state(), SlotState::Ready);
        // Nothing of `b` survives; `a` never went to the pool
        assert_eq!(backend.stats().live_buffers, 6);
        assert_eq!(slot.pool.lock().len(), 0);
    }

    #[test]
    fn test_failed_load_keeps_current_car() {
        let (_backend, _container, slot) = setup(&["abc"], 2);
        assert_eq!(slot.set_car("abc", None).unwrap(), SetCarOutcome::Loaded);
        let err = slot.set_car("ghost", None).unwrap_err();
        assert!(err.is_load_failure());
        assert_eq!(slot.car_id().as_deref(), Some("abc"));
        assert_eq!(slot.state(), SlotState::Ready);
    }

    #[test]
    fn test_swap_pools_and_reattaches_without_upload() {
        let (backend, _container, slot) = setup(&["a", "b", "c"], 1);
        slot.set_car("a", None).unwrap();
        slot.set_car("b", None).unwrap();
        let created = backend.stats().images_created;

        assert_eq!(slot.set_car("a", None).unwrap(), SetCarOutcome::Reattached);
        assert_eq!(backend.stats().images_created, created);
        assert_eq!(backend.stats().live_buffers, 12);

        // Capacity 1: pooling `a` again evicts `b`
        slot.set_car("c", None).unwrap();
        assert_eq!(backend.stats().live_buffers, 12);
        assert_eq!(slot.set_car("b", None).unwrap(), SetCarOutcome::Loaded);
    }

    #[test]
    fn test_same_id_applies_skin_only() {
        let (_backend, _container, slot) = setup(&["abc"], 2);
        slot.set_car("abc", Some("red")).unwrap();
        assert_eq!(slot.current_skin().as_deref(), Some("red"));
        assert_eq!(
            slot.set_car("abc", Some("blue")).unwrap(),
            SetCarOutcome::AlreadyActive
        );
        assert_eq!(slot.current_skin().as_deref(), Some("blue"));
    }

    #[test]
    fn test_presentation_set_while_empty_applies_on_load() {
        let (_backend, _container, slot) = setup(&["abc"], 2);
        slot.set_lights(true);
        slot.set_left_door_open(true);
        slot.set_steering_angle(15.0);
        assert_eq!(slot.state(), SlotState::Empty);

        slot.set_car("abc", None).unwrap();
        let applied = slot.with_car(|car| car.presentation().clone()).unwrap();
        assert!(applied.lights);
        assert!(applied.left_door_open);
        assert_eq!(applied.steering_angle, 15.0);
        assert_eq!(slot.bounding_box().unwrap().min, Vec3::new(-0.6, 0.0, 0.0));
        assert_eq!(slot.stable_bounding_box().unwrap().min, Vec3::ZERO);
    }

    #[test]
    fn test_skin_and_lod_stepping() {
        let (_backend, _container, slot) = setup(&["abc"], 2);
        assert_eq!(slot.select_next_skin().unwrap(), None);
        slot.set_car("abc", None).unwrap();
        assert_eq!(slot.skin_ids(), vec!["blue".to_string(), "red".to_string()]);
        assert_eq!(slot.select_next_skin().unwrap().as_deref(), Some("blue"));
        assert_eq!(slot.select_next_skin().unwrap().as_deref(), Some("red"));
        assert_eq!(slot.select_next_skin().unwrap().as_deref(), Some("blue"));
        assert_eq!(slot.select_previous_skin().unwrap().as_deref(), Some("red"));
        assert!(slot.select_skin(Some("chrome")).unwrap_err().is_source_unavailable());

        assert_eq!(slot.lod_count(), 2);
        assert_eq!(slot.select_next_lod(), Some(1));
        assert_eq!(slot.select_next_lod(), Some(1));
        assert_eq!(slot.aggregates().unwrap().node_count, 1);
        assert_eq!(slot.select_previous_lod(), Some(0));
        assert_eq!(slot.aggregates().unwrap().node_count, 2);
    }

    #[test]
    fn test_clear_pools_outgoing_car() {
        let (backend, _container, slot) = setup(&["abc"], 2);
        slot.set_car("abc", None).unwrap();
        slot.clear_car();
        assert_eq!(slot.state(), SlotState::Empty);
        assert_eq!(backend.stats().live_buffers, 6);
        assert_eq!(slot.set_car("abc", None).unwrap(), SetCarOutcome::Reattached);
    }

    #[test]
    fn test_overrides_without_car_are_dropped() {
        let (_backend, _container, slot) = setup(&["abc"], 2);
        let shop = PaintShop::new(slot.backend.clone(), PaintShopConfig::default());
        let outcome = shop
            .override_texture_color(&slot, "body_detail", [1.0, 0.0, 0.0, 1.0])
            .unwrap();
        assert_eq!(outcome, OverrideOutcome::NoModelLoaded);

        // Not queued for the next car
        slot.set_car("abc", None).unwrap();
        let px = slot.effective_texture("body_detail").unwrap().read_pixels().unwrap();
        assert_eq!(px.get_pixel(0, 0).0, [255, 255, 255, 255]);
    }

    #[test]
    fn test_material_slot_names_accept_overrides() {
        let (backend, _container, slot) = setup(&["abc"], 2);
        let shop = PaintShop::new(backend, PaintShopConfig::default());
        slot.set_car("abc", Some("blue")).unwrap();

        let outcome = shop
            .override_texture_color(&slot, "base_color", [0.0, 1.0, 0.0, 1.0])
            .unwrap();
        assert_eq!(outcome, OverrideOutcome::Applied);
        let px = slot.effective_texture("body_detail").unwrap().read_pixels().unwrap();
        assert_eq!(px.get_pixel(0, 0).0, [0, 255, 0, 255]);

        // The slot's own texture reverts the override
        let outcome = shop
            .override_texture(&slot, "base_color", Some(&crate::TextureRecipe::input_slot()))
            .unwrap();
        assert_eq!(outcome, OverrideOutcome::Applied);
        let px = slot.effective_texture("base_color").unwrap().read_pixels().unwrap();
        assert_eq!(px.get_pixel(0, 0).0, [0, 0, 255, 255]);
    }

    #[tokio::test]
    async fn test_flakes_on_loaded_car() {
        let (backend, _container, slot) = setup(&["abc"], 2);
        let shop = PaintShop::new(backend.clone(), PaintShopConfig::default());
        let outcome = slot
            .set_car_async("abc", Some("red"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, SetCarOutcome::Loaded);

        let request = FlakesRequest {
            color: [0.0, 0.0, 1.0],
            flakes: 0.5,
        };
        let outcome = shop
            .override_texture_flakes(&slot, "body_detail", &request)
            .unwrap();
        assert_eq!(outcome, OverrideOutcome::Applied);

        let px = slot.effective_texture("body_detail").unwrap().read_pixels().unwrap();
        assert_eq!(px.dimensions(), (256, 256));
        assert!(px.pixels().all(|p| p[0] == 0 && p[1] == 0 && p[2] == 255));
        let first = px.get_pixel(0, 0)[3];
        assert!(px.pixels().any(|p| p[3] != first));

        shop.override_texture_flakes(&slot, "body_detail", &request)
            .unwrap();
        assert_eq!(backend.stats().draws, 1);
    }
}
