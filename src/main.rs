use std::path::PathBuf;

use anyhow::{Context, Result};
use log::info;
use structopt::StructOpt;

use hierarchical_accel::{
    config::BuildConfig,
    render_system::{
        accel::build::{BuildStrategy, HierarchyStrategy},
        context::RenderContext,
        descriptor::RayDescriptor,
    },
    scene::Scene,
    utils,
};

#[derive(Debug, StructOpt)]
#[structopt(no_version)]
struct AppParams {
    /// JSON build settings; defaults apply when omitted
    #[structopt(short, long)]
    config: Option<PathBuf>,

    /// Keep the node hierarchy as nested top level structures
    #[structopt(long)]
    multi_level: bool,

    /// Build with PREFER_FAST_BUILD instead of PREFER_FAST_TRACE
    #[structopt(long)]
    fast_build: bool,

    /// The JSON scene to load, the built-in demo scene when omitted
    scene_file_name: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let app_params = AppParams::from_args();

    let mut config = match &app_params.config {
        Some(path) => BuildConfig::load(path)?,
        None => BuildConfig::default(),
    };
    if app_params.multi_level {
        config.use_multi_level = true;
    }
    if app_params.fast_build {
        config.prefer_fast_trace = false;
    }

    let scene = match &app_params.scene_file_name {
        Some(path) => Scene::load(path)?,
        None => utils::demo_scene()?,
    };
    info!(
        "loaded scene: {} nodes, {} vertices, {} triangles",
        scene.nodes().len(),
        scene.vertices().len(),
        scene.indices().len() / 3
    );

    let context = RenderContext::new().context("failed to set up the device")?;
    let strategy = HierarchyStrategy::from_config(&config);
    let scene = strategy.prepare(scene)?;

    let mut device = context.accel_device(config.prefer_fast_trace);
    let output = strategy
        .build(&scene, &mut device)
        .context("acceleration structure build failed")?;

    let descriptor = RayDescriptor::new(
        context.device.clone(),
        context.descriptor_set_allocator.clone(),
        config.descriptor_binding,
    )?;
    let descriptor_set = descriptor.bind(output.root_structure().clone())?;

    let world = output.bounds.world(&scene);
    info!(
        "root TLAS bound at binding {}: {} BLAS, {} TLAS, world bounds {:?} to {:?}",
        descriptor.binding(),
        output.bottom_levels.len(),
        output.top_levels.len() + 1,
        world.min(),
        world.max()
    );
    drop(descriptor_set);
    Ok(())
}
