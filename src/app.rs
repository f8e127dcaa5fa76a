//! The desktop window: winit event loop driving a [`Viewer`] on a [`GpuContext`].
//!
//! | Input        | Action                         |
//! |--------------|--------------------------------|
//! | drop a file  | load it                        |
//! | `F11`        | toggle borderless fullscreen   |
//! | `Escape`     | leave fullscreen               |
//! | `F5`         | reset time and frame counter   |
//! | `Pause`      | pause or resume                |
//!
//! Every other key and mouse event is forwarded to the shader inputs.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use winit::application::ApplicationHandler;
use winit::event::{ElementState, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::window::{Fullscreen, Window, WindowAttributes, WindowId};

use crate::config::ViewerConfig;
use crate::error::{Error, Result};
use crate::gpu::GpuContext;
use crate::viewer::{Loaded, Viewer};

/// Opens the viewer window and runs until it is closed.
///
/// # Example
/// ```ignore
/// toyframe::run(ViewerConfig::new().title("Seascape").shader("seascape.json"))?;
/// ```
pub fn run(config: ViewerConfig) -> Result<()> {
    let event_loop =
        EventLoop::new().map_err(|e| Error::Window(format!("failed to create event loop: {e}")))?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = ToyframeApp::Pending { config };
    event_loop
        .run_app(&mut app)
        .map_err(|e| Error::Window(e.to_string()))?;
    match app {
        ToyframeApp::Failed(error) => Err(error),
        _ => Ok(()),
    }
}

enum ToyframeApp {
    Pending {
        config: ViewerConfig,
    },
    Running {
        window: Arc<Window>,
        viewer: Viewer<GpuContext>,
    },
    Failed(Error),
}

impl ApplicationHandler for ToyframeApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        let ToyframeApp::Pending { config } = self else {
            return;
        };
        *self = match start(event_loop, config.clone()) {
            Ok((window, viewer)) => ToyframeApp::Running { window, viewer },
            Err(e) => {
                log::error!("{e}");
                event_loop.exit();
                ToyframeApp::Failed(e)
            }
        };
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        let ToyframeApp::Running { window, viewer } = self else {
            return;
        };

        viewer.handle_event(&event);

        match event {
            WindowEvent::CloseRequested => {
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                viewer.device_mut().resize(size.width, size.height);
                viewer.resize(size.width, size.height);
            }
            WindowEvent::DroppedFile(path) => {
                load(viewer, window, &path);
            }
            WindowEvent::KeyboardInput { event, .. }
                if event.state == ElementState::Pressed && !event.repeat =>
            {
                match event.physical_key {
                    PhysicalKey::Code(KeyCode::F11) => {
                        let fullscreen = match window.fullscreen() {
                            Some(_) => None,
                            None => Some(Fullscreen::Borderless(None)),
                        };
                        window.set_fullscreen(fullscreen);
                    }
                    PhysicalKey::Code(KeyCode::Escape) if window.fullscreen().is_some() => {
                        window.set_fullscreen(None);
                    }
                    PhysicalKey::Code(KeyCode::F5) => viewer.reset(),
                    PhysicalKey::Code(KeyCode::Pause) => viewer.toggle_pause(Instant::now()),
                    _ => {}
                }
            }
            WindowEvent::RedrawRequested => {
                if let Err(e) = viewer.render_frame(Instant::now()) {
                    log::error!("frame failed: {e}");
                }
                window.request_redraw();
            }
            _ => {}
        }
    }
}

fn start(
    event_loop: &ActiveEventLoop,
    config: ViewerConfig,
) -> Result<(Arc<Window>, Viewer<GpuContext>)> {
    let mut attrs = WindowAttributes::default()
        .with_title(&config.title)
        .with_inner_size(winit::dpi::LogicalSize::new(config.width, config.height));
    if config.fullscreen {
        attrs = attrs.with_fullscreen(Some(Fullscreen::Borderless(None)));
    }
    let window = Arc::new(
        event_loop
            .create_window(attrs)
            .map_err(|e| Error::Window(format!("failed to create window: {e}")))?,
    );

    let gpu = GpuContext::new(window.clone())?;
    let (width, height) = (gpu.width(), gpu.height());
    let shader = config.shader.clone();
    let mut viewer = Viewer::new(gpu, config);
    viewer.resize(width, height);
    if let Some(path) = shader {
        load(&mut viewer, &window, &path);
    }

    window.request_redraw();
    Ok((window, viewer))
}

/// Loads `path`, reporting the outcome in the log and the window title.
fn load(viewer: &mut Viewer<GpuContext>, window: &Window, path: &Path) {
    match viewer.load_file(path) {
        Ok(Loaded::Shader { name }) => {
            let name = name.unwrap_or_else(|| {
                path.file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_default()
            });
            window.set_title(&format!("{name} - {}", viewer.config().title));
        }
        Ok(Loaded::Export(paths)) => {
            log::info!("split export into {} shader files", paths.len());
        }
        Err(e) => log::error!("failed to load {}: {e}", path.display()),
    }
}
