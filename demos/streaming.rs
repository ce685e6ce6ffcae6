//! Streams a generated 4x4 cell terrain past a moving view, without a window.

use bevy::{app::AppExit, log::LogPlugin, prelude::*, transform::TransformPlugin};
use bevy_terrain_cells::{feeder::MemoryDataSource, prelude::*, properties::FeederProperties};
use image::{GrayImage, ImageFormat, Luma};
use itertools::iproduct;
use std::io::Cursor;

const CELL_COUNT: u32 = 4;
const CELL_SIZE: f32 = 256.0;
const GRID_SIZE: u32 = 129;
const HEIGHT: f32 = 60.0;
const FRAMES: u32 = 600;

fn main() {
    App::new()
        .add_plugins((MinimalPlugins, TransformPlugin, LogPlugin::default(), TerrainPlugin))
        .add_systems(Startup, setup)
        .add_systems(Update, (fly, report))
        .run();
}

/// Rolling hills sampled over the whole terrain, so neighboring cells share their borders.
fn heightmap(cell_x: u32, cell_z: u32) -> Vec<u8> {
    let quads = GRID_SIZE - 1;
    let image = GrayImage::from_fn(GRID_SIZE, GRID_SIZE, |x, y| {
        let position = Vec2::new((cell_x * quads + x) as f32, (cell_z * quads + y) as f32) / 40.0;
        let height = 0.5 + 0.25 * position.x.sin() + 0.25 * (position.y * 1.3).cos();
        Luma([(height * 255.0) as u8])
    });

    let mut bytes = Vec::new();
    if let Err(error) = image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png) {
        error!("Failed to encode a heightmap: {error}");
    }
    bytes
}

fn setup(mut commands: Commands) {
    let mut source = MemoryDataSource::default();
    let mut config = TerrainConfig {
        max_loaded_cells: 6,
        load_distance: 150.0,
        virtual_view_distance: 300.0,
        materials: vec!["grass".to_string(), "rock".to_string()],
        ..default()
    };

    for (x, z) in iproduct!(0..CELL_COUNT, 0..CELL_COUNT) {
        let heightmap_source = format!("cell_{x}_{z}.png");
        source.insert(heightmap_source.clone(), heightmap(x, z));

        config.cells.push(CellConfig {
            name: Some(format!("cell_{x}_{z}")),
            position: [x as f32 * CELL_SIZE, z as f32 * CELL_SIZE],
            size: [CELL_SIZE, HEIGHT, CELL_SIZE],
            grid_width: GRID_SIZE,
            grid_height: GRID_SIZE,
            material_width: 64,
            material_height: 64,
            feeder: FeederProperties {
                heightmap_source,
                smooth_heightmap: true,
                ..default()
            },
            base_material: Some("grass".to_string()),
            ..default()
        });
    }

    commands.spawn(TerrainSystem::new(config).with_feeder(ThreadedDataFeeder::new(source)));
    commands.spawn((TerrainView, Transform::from_xyz(0.0, 80.0, 0.0)));
}

/// Flies diagonally across the terrain.
fn fly(time: Res<Time>, mut views: Query<&mut Transform, With<TerrainView>>) {
    for mut transform in &mut views {
        transform.translation += Vec3::new(1.0, 0.0, 1.0) * 60.0 * time.delta_secs();
    }
}

fn report(
    mut frame: Local<u32>,
    terrains: Query<(&TerrainSystem, &TerrainDrawList)>,
    mut exit: EventWriter<AppExit>,
) {
    *frame += 1;

    if *frame % 60 == 0 {
        for (terrain, draw_list) in &terrains {
            info!(
                "frame {}: {} of {} cells loaded, {} meshes",
                *frame,
                terrain.loaded_cell_count(),
                terrain.cell_count(),
                draw_list.len()
            );
        }
    }

    if *frame >= FRAMES {
        exit.send(AppExit::Success);
    }
}
