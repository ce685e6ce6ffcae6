use crate::{
    render::{RenderMesh, TerrainRenderView},
    terrain::TerrainSystem,
};
use bevy::prelude::*;

/// Marks an entity whose position drives terrain streaming and LOD.
///
/// If the entity is an active camera, its frustum also culls the terrain blocks.
#[derive(Clone, Copy, Default, Component)]
pub struct TerrainView;

/// The meshes a terrain emitted this frame, for a render back end to consume.
#[derive(Clone, Default, Component, Deref, DerefMut)]
pub struct TerrainDrawList(pub Vec<RenderMesh>);

/// Streams, refines and draws every [`TerrainSystem`] from the [`TerrainView`]s.
pub struct TerrainPlugin;

impl Plugin for TerrainPlugin {
    fn build(&self, app: &mut App) {
        app.add_systems(Last, update_terrain_views);
    }
}

pub fn update_terrain_views(
    mut terrains: Query<(&mut TerrainSystem, &mut TerrainDrawList, &GlobalTransform)>,
    views: Query<(&GlobalTransform, Option<&Camera>), With<TerrainView>>,
) {
    for (mut terrain, mut draw_list, terrain_transform) in &mut terrains {
        draw_list.clear();

        let world_from_object = terrain_transform.compute_matrix();
        let object_from_world = terrain_transform.affine().inverse();

        for (view_transform, camera) in &views {
            let camera_position = object_from_world.transform_point3(view_transform.translation());

            let view = match camera.filter(|camera| camera.is_active) {
                Some(camera) => {
                    let view_from_world = view_transform.compute_matrix().inverse();
                    let clip_from_object = camera.clip_from_view() * view_from_world * world_from_object;
                    TerrainRenderView::new(camera_position, &clip_from_object)
                }
                None => TerrainRenderView::unculled(camera_position),
            };

            terrain.render(&view, &mut **draw_list);
        }
    }
}
