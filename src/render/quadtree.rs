//! The block quadtree of each cell, stored in one arena shared by all cells.
//!
//! Every block keeps a neighbor link per side, pointing at the deepest block
//! across that side whose level does not exceed its own. Splits and merges
//! keep adjacent leaves within one level of each other, which is what the
//! stitched index buffers rely on.

use crate::{
    cell::CellId,
    math::{self, Side},
    render::BlockGeometry,
};
use bevy::{
    math::{bounding::Aabb3d, Vec3A},
    prelude::*,
};
use slab::Slab;
use std::sync::Arc;

/// Children touching each side, ordered along the edge.
///
/// Children are numbered `0` top left, `1` top right, `2` bottom left and `3` bottom right.
const CHILDREN_ON: [[usize; 2]; 4] = [[0, 1], [1, 3], [2, 3], [0, 2]];

/// Back to front child order for a camera in each quadrant of a block.
const VISIT_ORDER: [[usize; 4]; 4] = [[3, 2, 1, 0], [2, 3, 0, 1], [1, 0, 3, 2], [0, 1, 2, 3]];

fn children_on(side: Side) -> [usize; 2] {
    CHILDREN_ON[side.index()]
}

/// Back to front order of the children of a block centered at `center`.
pub fn visit_order(center: Vec2, camera: Vec3) -> [usize; 4] {
    let quadrant = (camera.x > center.x) as usize | ((camera.z > center.y) as usize) << 1;
    VISIT_ORDER[quadrant]
}

/// A generation checked reference into the [`BlockArena`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct BlockHandle {
    index: u32,
    generation: u32,
}

/// Split policy of a cell.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct LodPolicy {
    pub split_coeff: f32,
    pub min_steps: u32,
}

/// A square patch of `resolution` x `resolution` quads sampled every `step` grid samples.
#[derive(Clone, Debug)]
pub struct Block {
    pub(crate) cell: CellId,
    pub(crate) center: Vec2,
    pub(crate) size: Vec2,
    pub(crate) left: u32,
    pub(crate) top: u32,
    pub(crate) step: u32,
    pub(crate) resolution: u32,
    pub(crate) level: u32,
    pub(crate) parent: Option<BlockHandle>,
    pub(crate) children: Option<[BlockHandle; 4]>,
    pub(crate) neighbors: [Option<BlockHandle>; 4],
    /// Height range of the cell when the block was created or last invalidated.
    pub(crate) height_range: Vec2,
    pub(crate) geometry: Option<Arc<BlockGeometry>>,
}

impl Block {
    pub fn root(
        cell: CellId,
        center: Vec2,
        size: Vec2,
        resolution: u32,
        step: u32,
        height_range: Vec2,
    ) -> Self {
        Self {
            cell,
            center,
            size,
            left: 0,
            top: 0,
            step,
            resolution,
            level: 0,
            parent: None,
            children: None,
            neighbors: [None; 4],
            height_range,
            geometry: None,
        }
    }

    pub fn cell(&self) -> CellId {
        self.cell
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn step(&self) -> u32 {
        self.step
    }

    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    /// Grid coordinates of the first sample.
    pub fn origin(&self) -> UVec2 {
        UVec2::new(self.left, self.top)
    }

    /// Number of grid samples spanned along each axis, both borders included.
    pub fn span(&self) -> u32 {
        self.resolution * self.step + 1
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }

    pub fn children(&self) -> Option<[BlockHandle; 4]> {
        self.children
    }

    pub fn neighbor(&self, side: Side) -> Option<BlockHandle> {
        self.neighbors[side.index()]
    }

    pub fn geometry(&self) -> Option<&Arc<BlockGeometry>> {
        self.geometry.as_ref()
    }

    /// Bounds covering any data the block may hold.
    pub fn conservative_bounds(&self) -> Aabb3d {
        let half = self.size / 2.0;

        Aabb3d {
            min: Vec3A::new(self.center.x - half.x, self.height_range.x, self.center.y - half.y),
            max: Vec3A::new(self.center.x + half.x, self.height_range.y, self.center.y + half.y),
        }
    }

    /// Exact bounds once the geometry is built, conservative bounds before.
    pub fn bounding_box(&self) -> Aabb3d {
        match &self.geometry {
            Some(geometry) => geometry.bounding_box,
            None => self.conservative_bounds(),
        }
    }
}

struct Slot {
    generation: u32,
    block: Block,
}

/// Storage for the blocks of every cell.
///
/// Freed slots are reused, stale handles are detected by their generation.
#[derive(Default)]
pub struct BlockArena {
    slots: Slab<Slot>,
    generation: u32,
}

#[cfg(test)]
impl std::ops::Index<BlockHandle> for BlockArena {
    type Output = Block;

    fn index(&self, handle: BlockHandle) -> &Block {
        self.get(handle).expect("stale block handle")
    }
}

impl BlockArena {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, handle: BlockHandle) -> bool {
        self.get(handle).is_some()
    }

    pub fn get(&self, handle: BlockHandle) -> Option<&Block> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .map(|slot| &slot.block)
    }

    pub fn get_mut(&mut self, handle: BlockHandle) -> Option<&mut Block> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .map(|slot| &mut slot.block)
    }

    pub fn insert(&mut self, block: Block) -> BlockHandle {
        self.generation = self.generation.wrapping_add(1);
        let generation = self.generation;
        let index = self.slots.insert(Slot { generation, block });

        BlockHandle {
            index: index as u32,
            generation,
        }
    }

    /// Frees a block and all of its descendants without touching any links.
    pub fn free(&mut self, handle: BlockHandle) {
        if let Some(children) = self.get(handle).and_then(Block::children) {
            for child in children {
                self.free(child);
            }
        }

        if self.contains(handle) {
            self.slots.remove(handle.index as usize);
        }
    }

    fn set_neighbor(&mut self, handle: BlockHandle, side: Side, target: Option<BlockHandle>) {
        if let Some(block) = self.get_mut(handle) {
            block.neighbors[side.index()] = target;
        }
    }

    /// Links two blocks across `side` of `a`.
    pub fn link(&mut self, a: BlockHandle, side: Side, b: BlockHandle) {
        if !self.contains(a) || !self.contains(b) {
            return;
        }

        self.set_neighbor(a, side, Some(b));
        self.set_neighbor(b, side.opposite(), Some(a));
    }

    /// Points `block` and its descendants along `side` at `target`.
    fn relink_edge(&mut self, block: BlockHandle, side: Side, target: Option<BlockHandle>) {
        let Some(entry) = self.get_mut(block) else {
            return;
        };
        entry.neighbors[side.index()] = target;

        if let Some(children) = entry.children {
            for child in children_on(side) {
                self.relink_edge(children[child], side, target);
            }
        }
    }

    /// Clears the links of `block` and its descendants along `side`.
    pub fn unlink_edge(&mut self, block: BlockHandle, side: Side) {
        self.relink_edge(block, side, None);
    }

    /// Splits a leaf into four children, splitting coarser neighbors first.
    ///
    /// Blocks with a step of one cannot be split.
    pub fn split(&mut self, handle: BlockHandle) {
        let Some(block) = self.get(handle) else {
            return;
        };
        if !block.is_leaf() || block.step < 2 {
            return;
        }

        let level = block.level;
        for side in Side::ALL {
            // forced splits may relink this block, so the link is read per side
            let Some(neighbor) = self.get(handle).and_then(|block| block.neighbor(side)) else {
                continue;
            };

            if self.get(neighbor).is_some_and(|neighbor| neighbor.level < level) {
                self.split(neighbor);
            }
        }

        let Some(parent) = self.get(handle).cloned() else {
            return;
        };
        let step = parent.step / 2;
        let span = parent.resolution * step;
        let size = parent.size / 2.0;

        let children: [BlockHandle; 4] = std::array::from_fn(|index| {
            let quadrant = UVec2::new(index as u32 % 2, index as u32 / 2);
            let offset = quadrant.as_vec2() - 0.5;

            self.insert(Block {
                cell: parent.cell,
                center: parent.center + offset * size,
                size,
                left: parent.left + quadrant.x * span,
                top: parent.top + quadrant.y * span,
                step,
                resolution: parent.resolution,
                level: level + 1,
                parent: Some(handle),
                children: None,
                neighbors: [None; 4],
                height_range: parent.height_range,
                geometry: None,
            })
        });

        self.link(children[0], Side::Right, children[1]);
        self.link(children[2], Side::Right, children[3]);
        self.link(children[0], Side::Bottom, children[2]);
        self.link(children[1], Side::Bottom, children[3]);

        for side in Side::ALL {
            let mine = children_on(side);

            let Some(neighbor) = parent.neighbor(side) else {
                continue;
            };
            let Some(across) = self.get(neighbor) else {
                continue;
            };

            match across.children.filter(|_| across.level == level) {
                Some(theirs) => {
                    let theirs = children_on(side.opposite()).map(|index| theirs[index]);

                    for (child, across) in mine.into_iter().zip(theirs) {
                        self.set_neighbor(children[child], side, Some(across));
                        self.relink_edge(across, side.opposite(), Some(children[child]));
                    }
                }
                None => {
                    for child in mine {
                        self.set_neighbor(children[child], side, Some(neighbor));
                    }
                }
            }
        }

        if let Some(block) = self.get_mut(handle) {
            block.children = Some(children);
        }
    }

    /// Collapses the subtree below `handle` into a leaf.
    ///
    /// Finer neighbors that would end up two levels deeper are merged as well.
    pub fn merge(&mut self, handle: BlockHandle) {
        let Some(children) = self.get(handle).and_then(Block::children) else {
            return;
        };

        for child in children {
            self.merge(child);
        }

        let Some(level) = self.get(handle).map(Block::level) else {
            return;
        };

        for side in Side::ALL {
            let Some(across) = self.finer_children_across(handle, side, level) else {
                continue;
            };

            for block in across {
                self.merge(block);
                self.relink_edge(block, side.opposite(), Some(handle));
            }
        }

        for child in children {
            self.free(child);
        }

        if let Some(block) = self.get_mut(handle) {
            block.children = None;
        }
    }

    /// The children of a same level neighbor touching `side` of `handle`.
    fn finer_children_across(
        &self,
        handle: BlockHandle,
        side: Side,
        level: u32,
    ) -> Option<[BlockHandle; 2]> {
        let neighbor = self.get(handle)?.neighbor(side)?;
        let neighbor = self.get(neighbor)?;

        if neighbor.level != level {
            return None;
        }

        let children = neighbor.children?;
        Some(children_on(side.opposite()).map(|index| children[index]))
    }

    /// Splits a leaf only if that does not force any neighbor to split.
    pub fn try_split(&mut self, handle: BlockHandle) -> bool {
        let Some(block) = self.get(handle) else {
            return false;
        };

        if !block.is_leaf() || block.step < 2 {
            return false;
        }

        let coarser_neighbor = Side::ALL.into_iter().any(|side| {
            block
                .neighbor(side)
                .and_then(|neighbor| self.get(neighbor))
                .is_some_and(|neighbor| neighbor.level < block.level)
        });

        if coarser_neighbor {
            return false;
        }

        self.split(handle);
        true
    }

    /// Refines the subtree below `handle` for a camera at `camera`.
    pub fn compute_lod(&mut self, handle: BlockHandle, camera: Vec3, policy: LodPolicy) {
        let Some(block) = self.get(handle) else {
            return;
        };

        let distance_squared = math::distance_squared(&block.bounding_box(), camera);
        let split_distance = block.size.x * policy.split_coeff / block.resolution as f32;

        if distance_squared < split_distance * split_distance && block.step > policy.min_steps.max(1) {
            self.split(handle);
        } else if !block.is_leaf() {
            self.merge(handle);
        }

        let Some((children, center)) = self
            .get(handle)
            .and_then(|block| Some((block.children?, block.center)))
        else {
            return;
        };

        for index in visit_order(center, camera) {
            if self.contains(children[index]) {
                self.compute_lod(children[index], camera, policy);
            }
        }
    }

    /// Leaves of the subtree below `handle`, depth first.
    pub fn leaves(&self, handle: BlockHandle) -> Vec<BlockHandle> {
        let mut leaves = Vec::new();
        let mut stack = vec![handle];

        while let Some(handle) = stack.pop() {
            match self.get(handle).and_then(Block::children) {
                Some(children) => stack.extend(children.into_iter().rev()),
                None if self.contains(handle) => leaves.push(handle),
                None => {}
            }
        }

        leaves
    }

    /// All blocks of the subtree below `handle`, parents before children.
    pub fn descendants(&self, handle: BlockHandle) -> Vec<BlockHandle> {
        let mut blocks = Vec::new();
        let mut stack = vec![handle];

        while let Some(handle) = stack.pop() {
            if let Some(block) = self.get(handle) {
                blocks.push(handle);
                stack.extend(block.children.into_iter().flatten());
            }
        }

        blocks
    }

    /// Whether every leaf below `handle` is at most one level finer than its neighbors
    /// and every link points at a live block.
    pub fn is_balanced(&self, handle: BlockHandle) -> bool {
        self.descendants(handle).into_iter().all(|handle| {
            let Some(block) = self.get(handle) else {
                return false;
            };

            Side::ALL.into_iter().all(|side| match block.neighbor(side) {
                None => true,
                Some(neighbor) => match self.get(neighbor) {
                    None => false,
                    Some(neighbor) => {
                        neighbor.level <= block.level
                            && (!block.is_leaf() || block.level - neighbor.level <= 1)
                    }
                },
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn root(arena: &mut BlockArena, x: f32) -> BlockHandle {
        arena.insert(Block::root(
            CellId(0),
            Vec2::new(x + 8.0, 8.0),
            Vec2::splat(16.0),
            2,
            8,
            Vec2::new(0.0, 1.0),
        ))
    }

    fn leaf_at(arena: &BlockArena, root: BlockHandle, point: Vec2) -> BlockHandle {
        let mut handle = root;

        while let Some(children) = arena[handle].children {
            let center = arena[handle].center;
            let index = (point.x > center.x) as usize | ((point.y > center.y) as usize) << 1;
            handle = children[index];
        }

        handle
    }

    #[test]
    fn children_cover_the_parent() {
        let mut arena = BlockArena::default();
        let root = root(&mut arena, 0.0);

        arena.split(root);
        let children = arena[root].children.unwrap();

        assert_eq!(arena.len(), 5);
        assert_eq!(arena[children[0]].origin(), UVec2::new(0, 0));
        assert_eq!(arena[children[1]].origin(), UVec2::new(8, 0));
        assert_eq!(arena[children[2]].origin(), UVec2::new(0, 8));
        assert_eq!(arena[children[3]].origin(), UVec2::new(8, 8));
        assert_eq!(arena[children[3]].center, Vec2::new(12.0, 12.0));
        assert_eq!(arena[children[0]].step, 4);
        assert_eq!(arena[children[0]].span(), 9);

        assert_eq!(arena[children[0]].neighbor(Side::Right), Some(children[1]));
        assert_eq!(arena[children[3]].neighbor(Side::Top), Some(children[1]));
        assert_eq!(arena[children[0]].neighbor(Side::Top), None);
    }

    #[test]
    fn deep_split_keeps_balance() {
        let mut arena = BlockArena::default();
        let root = root(&mut arena, 0.0);

        arena.split(root);
        for _ in 0..2 {
            let leaf = leaf_at(&arena, root, Vec2::new(7.9, 7.9));
            arena.split(leaf);
        }

        let deepest = leaf_at(&arena, root, Vec2::new(7.9, 7.9));
        assert_eq!(arena[deepest].step, 1);
        assert!(arena.is_balanced(root));

        // the forced splits reached the quadrants around the corner
        let across = leaf_at(&arena, root, Vec2::new(8.1, 7.9));
        assert_eq!(arena[across].level + 1, arena[deepest].level);

        for leaf in arena.leaves(root) {
            for side in Side::ALL {
                if let Some(neighbor) = arena[leaf].neighbor(side) {
                    assert!(arena[leaf].level - arena[neighbor].level <= 1);
                }
            }
        }
    }

    #[test]
    fn try_split_refuses_forced_splits() {
        let mut arena = BlockArena::default();
        let root = root(&mut arena, 0.0);

        arena.split(root);
        let top_left = arena[root].children.unwrap()[0];
        assert!(arena.try_split(top_left));

        let inner = arena[top_left].children.unwrap()[3];
        let leaves_before = arena.leaves(root).len();

        // both outer neighbors of `inner` are coarser
        assert!(!arena.try_split(inner));
        assert_eq!(arena.leaves(root).len(), leaves_before);

        arena.split(inner);
        assert!(arena.is_balanced(root));
        assert!(arena.leaves(root).len() > leaves_before + 3);
    }

    #[test]
    fn stale_handles_are_ignored() {
        let mut arena = BlockArena::default();
        let root = root(&mut arena, 0.0);
        arena.split(root);
        let child = arena[root].children.unwrap()[2];
        arena.merge(root);

        assert!(arena.get(child).is_none());
        arena.split(child);
        arena.merge(child);
        arena.compute_lod(child, Vec3::ZERO, LodPolicy { split_coeff: 16.0, min_steps: 1 });
        arena.link(root, Side::Left, child);
        assert!(!arena.try_split(child));

        assert_eq!(arena.len(), 1);
        assert_eq!(arena[root].neighbor(Side::Left), None);
        assert!(arena.is_balanced(root));
    }

    #[test]
    fn merge_restores_the_root() {
        let mut arena = BlockArena::default();
        let root = root(&mut arena, 0.0);

        arena.split(root);
        let leaf = leaf_at(&arena, root, Vec2::new(1.0, 1.0));
        arena.split(leaf);
        let stale = leaf_at(&arena, root, Vec2::new(1.0, 1.0));

        arena.merge(root);

        assert_eq!(arena.len(), 1);
        assert!(arena[root].is_leaf());
        assert!(arena.get(stale).is_none());
    }

    #[test]
    fn merge_pulls_in_finer_neighbors() {
        let mut arena = BlockArena::default();
        let root = root(&mut arena, 0.0);

        arena.split(root);
        let [top_left, top_right, ..] = arena[root].children.unwrap();
        arena.split(top_left);
        arena.split(top_right);
        let right_inner = arena[top_right].children.unwrap()[0];
        arena.split(right_inner);

        // collapsing the left quadrant would leave `right_inner`'s children two levels finer
        arena.merge(top_left);

        assert!(arena[right_inner].is_leaf());
        assert_eq!(arena[right_inner].neighbor(Side::Left), Some(top_left));
        assert!(arena.is_balanced(root));
    }

    #[test]
    fn linked_roots_split_together() {
        let mut arena = BlockArena::default();
        let left = root(&mut arena, 0.0);
        let right = root(&mut arena, 16.0);
        arena.link(left, Side::Right, right);

        arena.split(left);
        let corner = leaf_at(&arena, left, Vec2::new(15.9, 1.0));
        arena.split(corner);

        assert!(!arena[right].is_leaf());
        let across = leaf_at(&arena, right, Vec2::new(16.1, 1.0));
        assert_eq!(arena[across].neighbor(Side::Left), Some(corner));
        let corner_right = arena[corner].children.unwrap()[1];
        assert_eq!(arena[corner_right].neighbor(Side::Right), Some(across));
        assert!(arena.is_balanced(left));
        assert!(arena.is_balanced(right));

        arena.unlink_edge(left, Side::Right);
        arena.unlink_edge(right, Side::Left);
        arena.free(right);
        assert!(arena.is_balanced(left));
    }

    #[test]
    fn random_lod_updates_stay_balanced() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut arena = BlockArena::default();
        let roots = [root(&mut arena, 0.0), root(&mut arena, 16.0)];
        arena.link(roots[0], Side::Right, roots[1]);

        let policy = LodPolicy {
            split_coeff: 8.0,
            min_steps: 1,
        };

        for _ in 0..200 {
            let camera = Vec3::new(
                rng.random_range(-8.0..40.0),
                rng.random_range(0.0..4.0),
                rng.random_range(-8.0..24.0),
            );

            for root in roots {
                arena.compute_lod(root, camera, policy);
            }

            for root in roots {
                assert!(arena.is_balanced(root));
            }
        }

        for root in roots {
            arena.merge(root);
        }
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn visit_order_is_back_to_front() {
        let center = Vec2::ZERO;

        assert_eq!(visit_order(center, Vec3::new(-1.0, 0.0, -1.0)), [3, 2, 1, 0]);
        assert_eq!(visit_order(center, Vec3::new(1.0, 0.0, 1.0)), [0, 1, 2, 3]);
        assert_eq!(visit_order(center, Vec3::new(1.0, 0.0, -1.0))[3], 1);
        assert_eq!(visit_order(center, Vec3::new(-1.0, 0.0, 1.0))[3], 2);
    }
}
