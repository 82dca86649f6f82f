//! Suspendable ray state for partial traversal.

#![allow(dead_code)]
use super::compute_idx;
use crate::core::error::{Error, Result};
use crate::core::geometry::{Ray, Transform};
use crate::core::interaction::SurfaceInteraction;
use crate::core::material::MaterialKey;

/// Maximum depth of the traversal stack.
pub const MAX_TO_VISIT: usize = 64;

/// One traversal frame: a node of a treelet, the next primitive to test
/// within it, and whether the ray is currently in a transformed (object)
/// space.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RayFrame {
    /// Treelet id.
    pub treelet: u32,

    /// Node index within the treelet.
    pub node: u32,

    /// Next primitive to test within the node's leaf range.
    pub primitive: u8,

    /// Whether `ray_transform` applies to this frame.
    pub transformed: bool,
}

/// The hit recorded by a partial trace: the material key and area light id
/// for the scheduler, plus the interaction for shading.
#[derive(Clone, Debug, Default)]
pub struct HitInfo {
    /// Key of the hit material.
    pub material: MaterialKey,

    /// Area light id of the hit primitive; 0 when not emissive.
    pub area_light: u32,

    /// The surface interaction.
    pub isect: SurfaceInteraction,
}

/// A ray suspended between treelets. The state owns its traversal stack so
/// the scheduler can ship it to whichever worker holds the next treelet.
#[derive(Clone, Debug)]
pub struct RayState {
    /// The ray in world space; `t_max` tightens as hits are found.
    pub ray: Ray,

    /// Whether a hit has been recorded.
    pub hit: bool,

    /// The recorded hit.
    pub hit_info: HitInfo,

    /// Object-to-world transform at the recorded hit.
    pub hit_transform: Transform,

    /// Object-to-world transform of the instance currently being
    /// traversed.
    pub ray_transform: Transform,

    /// The traversal stack.
    to_visit: [RayFrame; MAX_TO_VISIT],

    /// Number of live frames.
    to_visit_head: u8,
}

impl RayState {
    /// Creates a ray state.
    ///
    /// * `ray` - The ray, in world space.
    pub fn new(ray: Ray) -> Self {
        Self {
            ray,
            hit: false,
            hit_info: HitInfo::default(),
            hit_transform: Transform::default(),
            ray_transform: Transform::default(),
            to_visit: [RayFrame::default(); MAX_TO_VISIT],
            to_visit_head: 0,
        }
    }

    /// Starts a trace at the root treelet for this ray's direction.
    ///
    /// * `directional` - Whether directional treelets are enabled.
    pub fn start_trace(&mut self, directional: bool) {
        self.to_visit_head = 0;
        self.hit = false;
        self.push(RayFrame {
            treelet: compute_idx(&self.ray.d, directional),
            node: 0,
            primitive: 0,
            transformed: false,
        });
    }

    /// Returns true when the traversal stack is empty.
    pub fn to_visit_empty(&self) -> bool {
        self.to_visit_head == 0
    }

    /// Returns the top frame.
    pub fn top(&self) -> RayFrame {
        debug_assert!(!self.to_visit_empty());
        self.to_visit[self.to_visit_head as usize - 1]
    }

    /// Pushes a frame.
    ///
    /// * `frame` - The frame.
    pub fn push(&mut self, frame: RayFrame) {
        assert!((self.to_visit_head as usize) < MAX_TO_VISIT, "traversal stack overflow");
        self.to_visit[self.to_visit_head as usize] = frame;
        self.to_visit_head += 1;
    }

    /// Pops the top frame.
    pub fn pop(&mut self) {
        debug_assert!(!self.to_visit_empty());
        self.to_visit_head -= 1;
    }

    /// Treelet the trace will execute in next.
    pub fn current_treelet(&self) -> Result<u32> {
        if self.to_visit_empty() {
            return Err(Error::Integrity(String::from(
                "ray state has no current treelet",
            )));
        }
        Ok(self.top().treelet)
    }

    /// Returns true when traversal has run to completion.
    pub fn finished(&self) -> bool {
        self.to_visit_empty()
    }

    /// Returns true when a hit has been recorded.
    pub fn has_hit(&self) -> bool {
        self.hit
    }

    /// Records a hit found while traversing `frame`.
    ///
    /// * `frame`      - The frame being traversed.
    /// * `isect`      - The surface interaction.
    /// * `material`   - Key of the hit material.
    /// * `area_light` - Area light id; 0 when not emissive.
    pub fn set_hit(
        &mut self,
        frame: RayFrame,
        isect: SurfaceInteraction,
        material: MaterialKey,
        area_light: u32,
    ) {
        self.hit = true;
        self.hit_info = HitInfo {
            material,
            area_light,
            isect,
        };
        self.hit_transform = if frame.transformed {
            self.ray_transform
        } else {
            Transform::default()
        };
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::geometry::{point3, ray, vector3, INFINITY};

    #[test]
    fn start_trace_selects_octant_root() {
        let mut state = RayState::new(ray(
            point3(0.0, 0.0, 0.0),
            vector3(1.0, -1.0, 1.0),
            INFINITY,
        ));
        state.start_trace(true);
        assert_eq!(state.current_treelet().unwrap(), 0b101);

        state.start_trace(false);
        assert_eq!(state.current_treelet().unwrap(), 0);
    }

    #[test]
    fn stack_is_lifo() {
        let mut state = RayState::new(ray(point3(0.0, 0.0, 0.0), vector3(0.0, 0.0, 1.0), INFINITY));
        state.start_trace(false);
        state.push(RayFrame {
            treelet: 3,
            node: 7,
            primitive: 1,
            transformed: false,
        });

        assert_eq!(state.top().treelet, 3);
        state.pop();
        assert_eq!(state.top().treelet, 0);
        state.pop();
        assert!(state.finished());
    }
}
