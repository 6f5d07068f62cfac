//! Helpers behind the `reign-engine` viewer binary.

use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use log::info;
use pollster::block_on;

use crate::archive::DirectoryArchive;
use crate::engine::ReignEngine;
use crate::instance::InstanceId;
use crate::render::{PixelSurface, Renderer};
use crate::scene::Scene;

/// Scene file looked up inside the asset directory when `--scene` is absent.
pub const DEFAULT_SCENE: &str = "scene.xml";

pub const USAGE: &str = "Usage: reign-engine <asset-dir> [--scene FILE] [--frames N] [--size WxH] [--summary-only] [--output FILE]";

#[derive(Debug, Clone, PartialEq)]
pub struct ViewerOptions {
    pub asset_dir: PathBuf,
    pub scene: Option<PathBuf>,
    pub frames: u32,
    pub width: u32,
    pub height: u32,
    pub summary_only: bool,
    pub output: PathBuf,
}

impl ViewerOptions {
    pub fn parse<I: IntoIterator<Item = String>>(args: I) -> Result<Self> {
        let mut args = args.into_iter();
        let Some(asset_dir) = args.next() else {
            return Err(anyhow!(USAGE));
        };
        let mut options = Self {
            asset_dir: PathBuf::from(asset_dir),
            scene: None,
            frames: 1,
            width: 640,
            height: 480,
            summary_only: false,
            output: PathBuf::from("frame.png"),
        };
        while let Some(arg) = args.next() {
            let mut value = |flag: &str| {
                args.next()
                    .ok_or_else(|| anyhow!("{flag} expects a value. {USAGE}"))
            };
            match arg.as_str() {
                "--scene" => options.scene = Some(PathBuf::from(value("--scene")?)),
                "--frames" => {
                    options.frames = value("--frames")?
                        .parse()
                        .context("--frames expects a whole number")?;
                }
                "--size" => {
                    let size = value("--size")?;
                    let (width, height) = size
                        .split_once('x')
                        .ok_or_else(|| anyhow!("--size expects WIDTHxHEIGHT, got {size}"))?;
                    options.width = width.parse().context("invalid width")?;
                    options.height = height.parse().context("invalid height")?;
                    if options.width == 0 || options.height == 0 {
                        return Err(anyhow!("--size must not be zero"));
                    }
                }
                "--output" => options.output = PathBuf::from(value("--output")?),
                "--summary-only" => options.summary_only = true,
                other => {
                    return Err(anyhow!("Unknown argument: {other}. {USAGE}"));
                }
            }
        }
        Ok(options)
    }

    fn scene_path(&self) -> Option<PathBuf> {
        match &self.scene {
            Some(path) => Some(path.clone()),
            None => {
                let path = self.asset_dir.join(DEFAULT_SCENE);
                path.exists().then_some(path)
            }
        }
    }
}

/// A scene built on an engine, with instance ids by scene name.
pub struct Viewer {
    pub engine: ReignEngine,
    pub names: BTreeMap<String, InstanceId>,
}

impl Viewer {
    pub fn load(options: &ViewerOptions) -> Result<Self> {
        let archive = DirectoryArchive::open(&options.asset_dir)
            .with_context(|| format!("failed to open asset directory {}", options.asset_dir.display()))?;
        let scene = match options.scene_path() {
            Some(path) => {
                let xml = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                Scene::from_xml(&xml).with_context(|| format!("failed to parse {}", path.display()))?
            }
            None => Scene::default(),
        };
        let mut engine = ReignEngine::with_archive(scene.config.clone(), Arc::new(archive));
        let names = scene.instantiate(&mut engine)?;
        Ok(Self { engine, names })
    }

    /// Advances the scene by `frames` ticks at the configured frame rate.
    pub fn advance(&mut self, frames: u32) {
        let step = 1000.0 / self.engine.config().frames_per_second.max(1.0);
        for _ in 0..frames {
            self.engine.update(step);
        }
    }

    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Loaded scene with {} instances", self.names.len());
        for (name, &id) in &self.names {
            let Ok(instance) = self.engine.instance(id) else {
                continue;
            };
            let position = instance.position();
            let _ = write!(
                out,
                " - {name} {id} ({}) pos=({:.2}, {:.2}, {:.2})",
                instance.kind().name(),
                position.x,
                position.y,
                position.z
            );
            if let Some(model) = instance.model() {
                let _ = write!(out, " model={} bones={}", model.path, model.bones.len());
            }
            if let Some(motion) = instance.motion() {
                let _ = write!(out, " motion={} frame={:.2}", motion.name, motion.playback.frame);
            }
            if let Some(effect) = instance.effect() {
                let _ = write!(
                    out,
                    " effect={} sprites={}",
                    effect.effect.path,
                    effect.frame().sprites.len()
                );
            }
            out.push('\n');
        }
        let cache = self.engine.cache();
        let _ = writeln!(
            out,
            "Cache: {} models, {} textures, {} effects",
            cache.model_count(),
            cache.texture_count(),
            cache.effect_count()
        );
        out
    }

    /// Renders the current frame headlessly into a PNG file.
    pub fn render_png(&self, options: &ViewerOptions) -> Result<()> {
        let mut renderer = block_on(Renderer::new(self.engine.config(), false)).map_err(GpuUnavailable::from)?;
        let mut surface = PixelSurface::new(options.width, options.height);
        renderer.render(&self.engine, &mut surface)?;
        surface.save_png(&options.output)?;
        info!("wrote {}", options.output.display());
        Ok(())
    }
}

/// No GPU adapter or device could be created.
#[derive(Debug)]
pub struct GpuUnavailable {
    message: String,
}

impl From<anyhow::Error> for GpuUnavailable {
    fn from(err: anyhow::Error) -> Self {
        Self {
            message: format!("{err:#}"),
        }
    }
}

impl fmt::Display for GpuUnavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GPU unavailable: {}", self.message)
    }
}

impl std::error::Error for GpuUnavailable {}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|arg| arg.to_string()).collect()
    }

    #[test]
    fn parses_flags() {
        let options = ViewerOptions::parse(args(&[
            "assets",
            "--frames",
            "12",
            "--size",
            "320x200",
            "--summary-only",
            "--output",
            "out.png",
        ]))
        .unwrap();
        assert_eq!(options.asset_dir, PathBuf::from("assets"));
        assert_eq!(options.frames, 12);
        assert_eq!((options.width, options.height), (320, 200));
        assert!(options.summary_only);
        assert_eq!(options.output, PathBuf::from("out.png"));
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(ViewerOptions::parse(Vec::new()).is_err());
        assert!(ViewerOptions::parse(args(&["assets", "--bogus"])).is_err());
        assert!(ViewerOptions::parse(args(&["assets", "--frames"])).is_err());
        assert!(ViewerOptions::parse(args(&["assets", "--size", "0x10"])).is_err());
    }

    #[test]
    fn empty_asset_directory_builds_an_empty_scene() {
        let dir = tempfile::tempdir().unwrap();
        let options = ViewerOptions::parse(args(&[dir.path().to_str().unwrap()])).unwrap();
        let mut viewer = Viewer::load(&options).unwrap();
        viewer.advance(3);
        assert_eq!(viewer.engine.ticks(), 3);
        assert!(viewer.summary().starts_with("Loaded scene with 0 instances"));
    }
}
