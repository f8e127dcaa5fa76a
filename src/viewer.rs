//! Load, rebuild and render loop of a ShaderToy viewer.
//!
//! [`Viewer`] ties the pieces together for one window:
//!
//! - loading compiles a description into a fresh [`PassSet`] and texture cache and
//!   swaps them in only if every pass compiled,
//! - the [`FrameGraph`] is rebuilt lazily whenever the pass set or surface size
//!   changes,
//! - each frame advances the clock, swaps feedback images and replays the graph.
//!
//! The viewer is generic over [`RenderDevice`], so the whole loop runs against the
//! CPU recording device in tests.

use std::path::{Path, PathBuf};
use std::time::Instant;

use winit::event::WindowEvent;

use crate::compiler::PassGraphCompiler;
use crate::config::ViewerConfig;
use crate::description::{Document, ShaderDescription, parse_document, write_export};
use crate::device::RenderDevice;
use crate::error::{Error, Result};
use crate::input::Input;
use crate::pass::{PassSet, SamplerSet};
use crate::render_graph::FrameGraph;
use crate::texture::TextureCache;
use crate::uniforms::{FrameClock, GpuInput, local_date};

/// What [`Viewer::load_file`] did with a file.
#[derive(Clone, Debug, PartialEq)]
pub enum Loaded {
    /// The description is now running.
    Shader { name: Option<String> },
    /// The file was an export bundle, split into these files and not run.
    Export(Vec<PathBuf>),
}

pub struct Viewer<D: RenderDevice> {
    device: D,
    config: ViewerConfig,
    compiler: PassGraphCompiler,
    samplers: SamplerSet,
    textures: TextureCache,
    passes: Option<PassSet>,
    /// `None` until built for the current pass set and surface size.
    graph: Option<FrameGraph>,
    clock: FrameClock,
    input: Input,
    surface_size: (u32, u32),
}

impl<D: RenderDevice> Viewer<D> {
    pub fn new(mut device: D, config: ViewerConfig) -> Self {
        let samplers = SamplerSet::new(&mut device);
        let textures = TextureCache::new(config.media_root.clone(), config.remaps.clone());
        Self {
            device,
            compiler: PassGraphCompiler::new(config.cube_face_size),
            samplers,
            textures,
            passes: None,
            graph: None,
            clock: FrameClock::new(Instant::now()),
            input: Input::new(),
            surface_size: (config.width.max(1), config.height.max(1)),
            config,
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn config(&self) -> &ViewerConfig {
        &self.config
    }

    pub fn clock(&self) -> &FrameClock {
        &self.clock
    }

    pub fn passes(&self) -> Option<&PassSet> {
        self.passes.as_ref()
    }

    pub fn graph(&self) -> Option<&FrameGraph> {
        self.graph.as_ref()
    }

    pub fn is_loaded(&self) -> bool {
        self.passes.is_some()
    }

    /// Loads a JSON file.
    ///
    /// Export bundles are written out as one `shader_<id>.json` per shader next to
    /// `path` and the running shader is left alone.
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> Result<Loaded> {
        let path = path.as_ref();
        log::info!("loading {}", path.display());
        let json = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        match parse_document(&json)? {
            Document::Export(shaders) => {
                let dir = path.parent().unwrap_or(Path::new("."));
                write_export(&shaders, dir).map(Loaded::Export)
            }
            Document::Shader(desc) => {
                self.load_description(&desc)?;
                Ok(Loaded::Shader { name: desc.name })
            }
        }
    }

    /// Compiles `desc` and makes it the running shader.
    ///
    /// On failure the previous pass set and its textures stay active.
    pub fn load_description(&mut self, desc: &ShaderDescription) -> Result<()> {
        let mut textures = self.textures.fresh();
        let passes = match self
            .compiler
            .compile(&mut self.device, &mut textures, &self.samplers, desc)
        {
            Ok(passes) => passes,
            Err(e) => {
                textures.clear(&mut self.device);
                return Err(e);
            }
        };

        if let Some(graph) = self.graph.take() {
            graph.destroy(&mut self.device);
        }
        if let Some(old) = self.passes.replace(passes) {
            old.destroy(&mut self.device);
        }
        let mut old_textures = std::mem::replace(&mut self.textures, textures);
        old_textures.clear(&mut self.device);

        self.reset();
        log::info!(
            "running '{}' with {} textures",
            desc.name.as_deref().unwrap_or("untitled"),
            self.textures.len()
        );
        Ok(())
    }

    /// Records the new surface size. The graph is rebuilt on the next frame.
    pub fn resize(&mut self, width: u32, height: u32) {
        let size = (width.max(1), height.max(1));
        if size != self.surface_size {
            log::debug!("surface resized to {}x{}", size.0, size.1);
            self.surface_size = size;
        }
    }

    pub fn surface_size(&self) -> (u32, u32) {
        self.surface_size
    }

    /// Restarts time, the frame counter and input state.
    pub fn reset(&mut self) {
        self.clock.reset(Instant::now());
        self.input.reset();
    }

    pub fn toggle_pause(&mut self, now: Instant) {
        self.clock.toggle_pause(now);
        log::info!(
            "{}",
            if self.clock.is_paused() {
                "paused"
            } else {
                "resumed"
            }
        );
    }

    /// Feeds keyboard and mouse events to the shader inputs.
    pub fn handle_event(&mut self, event: &WindowEvent) {
        self.input.handle_event(event, self.surface_size.1);
    }

    /// Renders and presents one frame. Does nothing until a shader is loaded.
    ///
    /// While paused the last image is presented again without drawing.
    pub fn render_frame(&mut self, now: Instant) -> Result<()> {
        let Some(passes) = self.passes.as_mut() else {
            return Ok(());
        };

        let stale = self
            .graph
            .as_ref()
            .is_none_or(|graph| graph.surface_size() != self.surface_size);
        if stale {
            if let Some(graph) = self.graph.take() {
                graph.destroy(&mut self.device);
            }
            let graph = FrameGraph::builder()
                .surface_size(self.surface_size.0, self.surface_size.1)
                .cube_face_size(self.config.cube_face_size)
                .compose_rect(self.config.compose_rect)
                .build(&mut self.device, passes)?;
            self.graph = Some(graph);
        }
        let Some(graph) = self.graph.as_ref() else {
            return Ok(());
        };

        if self.clock.is_paused() {
            return graph.present(&mut self.device);
        }

        self.clock.tick(now);
        passes.swap_feedback();

        let mut input = GpuInput::default();
        self.clock.write(&mut input);
        input.mouse = self.input.mouse.uniform();
        input.date = local_date();
        graph.execute(
            &mut self.device,
            passes,
            &self.textures,
            &input,
            &self.input.keyboard,
        )?;

        self.input.keyboard.end_frame();
        self.clock.advance_frame();
        log::trace!("frame {} at {:.3}s", self.clock.frame(), self.clock.time());
        Ok(())
    }

    /// Releases every device resource and hands the device back.
    pub fn destroy(mut self) -> D {
        if let Some(graph) = self.graph.take() {
            graph.destroy(&mut self.device);
        }
        if let Some(passes) = self.passes.take() {
            passes.destroy(&mut self.device);
        }
        self.textures.clear(&mut self.device);
        self.samplers.destroy(&mut self.device);
        self.device
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::RecordingDevice;

    const SIMPLE: &str = r#"{ "renderpass": [
        { "name": "Image", "type": "image",
          "code": "void mainImage(out vec4 c, in vec2 p) { c = vec4(1.0); }" }
    ] }"#;

    const BROKEN: &str = r#"{ "renderpass": [
        { "name": "Broken", "type": "image", "code": "BROKEN" }
    ] }"#;

    fn description(json: &str) -> ShaderDescription {
        let Document::Shader(desc) = parse_document(json).unwrap() else {
            panic!("expected a shader");
        };
        desc
    }

    fn viewer() -> Viewer<RecordingDevice> {
        let config = ViewerConfig::new().size(16, 8);
        Viewer::new(RecordingDevice::new(), config)
    }

    fn frames(viewer: &mut Viewer<RecordingDevice>, count: u32) {
        let start = Instant::now();
        for i in 0..count {
            viewer
                .render_frame(start + Duration::from_millis(16 * u64::from(i + 1)))
                .unwrap();
        }
    }

    #[test]
    fn nothing_rendered_before_load() {
        let mut viewer = viewer();
        viewer.render_frame(Instant::now()).unwrap();
        assert!(!viewer.is_loaded());
        assert_eq!(viewer.device().submit_count, 0);
    }

    #[test]
    fn frames_advance() {
        let mut viewer = viewer();
        viewer.load_description(&description(SIMPLE)).unwrap();
        frames(&mut viewer, 3);

        let device = viewer.device();
        let seen: Vec<i32> = device.draws.iter().map(|d| d.frame).collect();
        assert_eq!(seen, vec![0, 1, 2]);
        assert_eq!(device.presents.len(), 3);
        assert_eq!(viewer.clock().frame(), 3);
    }

    #[test]
    fn failed_load_keeps_running_shader() {
        let mut viewer = viewer();
        viewer.load_description(&description(SIMPLE)).unwrap();
        viewer.device_mut().fail_marker = Some("BROKEN".into());

        let err = viewer.load_description(&description(BROKEN)).unwrap_err();
        assert!(matches!(err, Error::ShaderCompile { ref pass, .. } if pass == "Broken"));
        assert_eq!(viewer.device().live_pipelines(), 1);

        frames(&mut viewer, 1);
        assert_eq!(viewer.device().draws.last().unwrap().pass, "Image");
    }

    #[test]
    fn reload_replaces_resources() {
        let mut viewer = viewer();
        viewer.load_description(&description(SIMPLE)).unwrap();
        frames(&mut viewer, 2);
        viewer.load_description(&description(SIMPLE)).unwrap();

        assert!(viewer.graph().is_none());
        assert_eq!(viewer.device().live_pipelines(), 1);
        assert_eq!(viewer.device().live_buffers(), 0);
        assert_eq!(viewer.clock().frame(), 0);
    }

    #[test]
    fn paused_frames_only_present() {
        let mut viewer = viewer();
        viewer.load_description(&description(SIMPLE)).unwrap();
        frames(&mut viewer, 1);
        viewer.toggle_pause(Instant::now());
        frames(&mut viewer, 2);

        assert_eq!(viewer.device().draws.len(), 1);
        assert_eq!(viewer.device().presents.len(), 3);
        assert_eq!(viewer.clock().frame(), 1);
    }

    #[test]
    fn reset_restarts_frame_counter() {
        let mut viewer = viewer();
        viewer.load_description(&description(SIMPLE)).unwrap();
        frames(&mut viewer, 2);
        viewer.reset();
        frames(&mut viewer, 1);
        assert_eq!(viewer.device().draws.last().unwrap().frame, 0);
    }

    #[test]
    fn resize_rebuilds_graph() {
        let mut viewer = viewer();
        viewer.load_description(&description(SIMPLE)).unwrap();
        frames(&mut viewer, 1);
        assert_eq!(viewer.graph().unwrap().surface_size(), (16, 8));

        viewer.resize(32, 0);
        frames(&mut viewer, 1);
        let graph = viewer.graph().unwrap();
        assert_eq!(graph.surface_size(), (32, 1));
        let viewport = viewer.device().image_desc(graph.viewport()).unwrap();
        assert_eq!((viewport.width, viewport.height), (32, 1));
        // The old graph's uniform buffer was released.
        assert_eq!(viewer.device().live_buffers(), 1);
    }

    #[test]
    fn load_file_splits_export() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.json");
        std::fs::write(
            &path,
            r#"{ "numShaders": 1, "shaders": [
                { "info": { "id": "XsXGRn" }, "renderpass": [ { "type": "image", "code": "" } ] }
            ] }"#,
        )
        .unwrap();

        let mut viewer = viewer();
        let Loaded::Export(paths) = viewer.load_file(&path).unwrap() else {
            panic!("expected an export");
        };
        assert_eq!(paths, vec![dir.path().join("shader_XsXGRn.json")]);
        assert!(paths[0].exists());
        assert!(!viewer.is_loaded());
    }

    #[test]
    fn load_file_runs_shader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("demo.json");
        std::fs::write(&path, SIMPLE).unwrap();

        let mut viewer = viewer();
        assert_eq!(viewer.load_file(&path).unwrap(), Loaded::Shader { name: None });
        assert!(viewer.is_loaded());
        assert!(matches!(
            viewer.load_file(dir.path().join("missing.json")),
            Err(Error::Io { .. })
        ));
    }

    #[test]
    fn destroy_releases_everything() {
        let mut viewer = viewer();
        viewer.load_description(&description(SIMPLE)).unwrap();
        frames(&mut viewer, 2);

        let device = viewer.destroy();
        assert_eq!(device.live_images(), 0);
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.live_pipelines(), 0);
    }
}
