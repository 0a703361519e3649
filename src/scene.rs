//! Per-view, per-frame scene SoA (spec §3 "Scene SoA").
//!
//! `RenderPass::generate` needs, for a visible-renderable range, O(1)
//! access to everything a command needs without walking the renderable
//! manager's sparse map per primitive. `Scene::prepare` snapshots that
//! data once per view per frame into flat arrays indexed by a transient
//! visible-renderable index, plus a prefix sum of primitive counts so the
//! command generator can locate a renderable's command-buffer sub-slice
//! in O(1) (spec §4.2 "Generation").

use glam::Vec3;

use crate::driver::DescriptorSetHandle;
use crate::renderable::{InstancingRef, MorphingRef, RenderableInstance, RenderableManager, SkinningRef, VisibilityPack};

/// One bit per rendering purpose a renderable may be visible for this
/// frame (main view, shadow cascades 0..3, …). Bit layout is a build-time
/// choice left to the caller; this crate only tests membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VisibleMask(pub u32);

impl VisibleMask {
    #[must_use]
    pub fn intersects(self, pass_mask: VisibleMask) -> bool {
        self.0 & pass_mask.0 != 0
    }
}

/// One entry the caller hands to [`Scene::prepare`]: a renderable that
/// survived culling, its world-space AABB center (for the depth-sort
/// key), and which passes it's visible for this frame.
#[derive(Debug, Clone, Copy)]
pub struct VisibleRenderable {
    pub instance: RenderableInstance,
    pub world_center: Vec3,
    pub visible_mask: VisibleMask,
}

/// Flat, per-frame snapshot of the renderables visible to one view.
///
/// Every array below is indexed by the same transient index, `0..len()`.
/// Rebuilt every frame by [`Scene::prepare`]; nothing here outlives the
/// frame it was built for.
#[derive(Default)]
pub struct Scene {
    renderable: Vec<RenderableInstance>,
    world_center: Vec<Vec3>,
    visibility: Vec<VisibilityPack>,
    skinning: Vec<Option<SkinningRef>>,
    morphing: Vec<Option<MorphingRef>>,
    instancing: Vec<Option<InstancingRef>>,
    visible_mask: Vec<VisibleMask>,
    channel: Vec<u8>,
    ubo_bytes: Vec<Vec<u8>>,
    descriptor_set: Vec<DescriptorSetHandle>,
    /// `primitive_prefix_sum[i]` = total primitive count over renderables
    /// `[0, i)`; `primitive_prefix_sum[len()]` is the grand total.
    primitive_prefix_sum: Vec<u32>,
}

impl Scene {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.renderable.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.renderable.is_empty()
    }

    /// Rebuilds the SoA from `visible`, snapshotting each renderable's
    /// current component data out of `renderables`. Clears any prior
    /// frame's contents first.
    pub fn prepare(&mut self, visible: &[VisibleRenderable], renderables: &RenderableManager) {
        self.clear();
        self.primitive_prefix_sum.push(0);
        let mut running = 0u32;

        for entry in visible {
            self.renderable.push(entry.instance);
            self.world_center.push(entry.world_center);
            self.visibility.push(renderables.visibility(entry.instance));
            self.skinning.push(renderables.skinning(entry.instance));
            self.morphing.push(renderables.morphing(entry.instance));
            self.instancing.push(renderables.instancing(entry.instance));
            self.visible_mask.push(entry.visible_mask);
            self.channel.push(renderables.channels(entry.instance));
            self.descriptor_set.push(renderables.descriptor_set(entry.instance));
            self.ubo_bytes.push(Vec::new());

            running += renderables.primitives(entry.instance).len() as u32;
            self.primitive_prefix_sum.push(running);
        }
    }

    fn clear(&mut self) {
        self.renderable.clear();
        self.world_center.clear();
        self.visibility.clear();
        self.skinning.clear();
        self.morphing.clear();
        self.instancing.clear();
        self.visible_mask.clear();
        self.channel.clear();
        self.ubo_bytes.clear();
        self.descriptor_set.clear();
        self.primitive_prefix_sum.clear();
    }

    #[must_use]
    pub fn renderable(&self, index: usize) -> RenderableInstance {
        self.renderable[index]
    }

    #[must_use]
    pub fn world_center(&self, index: usize) -> Vec3 {
        self.world_center[index]
    }

    #[must_use]
    pub fn visibility(&self, index: usize) -> VisibilityPack {
        self.visibility[index]
    }

    #[must_use]
    pub fn skinning(&self, index: usize) -> Option<SkinningRef> {
        self.skinning[index]
    }

    #[must_use]
    pub fn morphing(&self, index: usize) -> Option<MorphingRef> {
        self.morphing[index]
    }

    #[must_use]
    pub fn instancing(&self, index: usize) -> Option<InstancingRef> {
        self.instancing[index]
    }

    #[must_use]
    pub fn visible_mask(&self, index: usize) -> VisibleMask {
        self.visible_mask[index]
    }

    #[must_use]
    pub fn channel(&self, index: usize) -> u8 {
        self.channel[index]
    }

    #[must_use]
    pub fn descriptor_set(&self, index: usize) -> DescriptorSetHandle {
        self.descriptor_set[index]
    }

    #[must_use]
    pub fn ubo_bytes(&self, index: usize) -> &[u8] {
        &self.ubo_bytes[index]
    }

    pub fn set_ubo_bytes(&mut self, index: usize, bytes: Vec<u8>) {
        self.ubo_bytes[index] = bytes;
    }

    /// Number of primitives owned by the renderable at `index`.
    #[must_use]
    pub fn primitive_count(&self, index: usize) -> u32 {
        self.primitive_prefix_sum[index + 1] - self.primitive_prefix_sum[index]
    }

    /// Total primitive count across every visible renderable in this
    /// snapshot.
    #[must_use]
    pub fn total_primitive_count(&self) -> u32 {
        self.primitive_prefix_sum.last().copied().unwrap_or(0)
    }

    /// Command-buffer offset, in units of "commands per primitive", at
    /// which renderable `index`'s commands start (spec §4.2 Generation).
    #[must_use]
    pub fn primitive_offset(&self, index: usize) -> u32 {
        self.primitive_prefix_sum[index]
    }
}
