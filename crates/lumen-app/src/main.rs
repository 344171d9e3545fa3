// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use lumen_core::init_tracing;
use lumen_platform::drawable_size;
use lumen_render::{RenderSize, Renderer};
use lumen_render_vk::{GpuConfig, VkRenderer};
use serde::Deserialize;
use tracing::{error, info, warn};

use lumen_platform::winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::{Window, WindowId},
};

const DEFAULT_CONFIG: &str = "lumen.toml";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file; `lumen.toml` in the working directory when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Skip the validation layer even if the config enables it
    #[arg(long)]
    no_validation: bool,
}

#[derive(Debug, Deserialize, Default)]
struct AppCfg {
    #[serde(default)]
    render: GpuConfig,
}

impl AppCfg {
    fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

/// An explicit path must exist; the default one is optional.
fn load_cfg(explicit: Option<&Path>) -> Result<AppCfg> {
    let path = explicit.unwrap_or(Path::new(DEFAULT_CONFIG));
    let text = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if explicit.is_none() => {
            info!("no {} ({e}), using defaults", path.display());
            return Ok(AppCfg::default());
        }
        Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
    };
    AppCfg::parse(&text).with_context(|| format!("parse {}", path.display()))
}

/// Logs a failed frame or rebuild. Renderer errors are not retried here;
/// returns whether the app may keep running.
fn survives(what: &str, result: Result<()>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            error!("{what} failed: {e:#}");
            false
        }
    }
}

struct App {
    window: Option<Arc<Window>>,
    renderer: Option<VkRenderer>,
    render_size: RenderSize,

    cfg: AppCfg,
    exiting: bool,
    frames: u32,
    last_fps_instant: Instant,

    paused: bool,
    focused: bool,
}

impl App {
    fn new(cfg: AppCfg) -> Self {
        Self {
            window: None,
            renderer: None,
            render_size: RenderSize {
                width: 1,
                height: 1,
            },
            cfg,
            exiting: false,
            frames: 0,
            last_fps_instant: Instant::now(),
            paused: false,
            focused: true,
        }
    }

    fn create_renderer(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let window = Arc::new(
            event_loop
                .create_window(Window::default_attributes().with_title("lumen"))
                .context("create window")?,
        );
        self.render_size = drawable_size(&window);

        let mut renderer =
            VkRenderer::with_config(&*window, &*window, self.render_size, self.cfg.render.clone())?;
        let source = window.clone();
        renderer.set_extent_source(Box::new(move || drawable_size(&source)));

        info!(
            "vsync cfg = {} ({:?})",
            self.cfg.render.vsync, self.cfg.render.present_mode
        );
        self.window = Some(window);
        self.renderer = Some(renderer);
        Ok(())
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        self.exiting = true;
        // The renderer owns the surface; drop it before the window.
        self.renderer = None;
        self.window = None;
        event_loop.exit();
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() {
            if let Err(e) = self.create_renderer(event_loop) {
                error!("vk init failed: {e:#}");
                self.shutdown(event_loop);
                return;
            }
        }

        event_loop.set_control_flow(if self.cfg.render.vsync {
            ControlFlow::Wait
        } else {
            ControlFlow::Poll
        });

        self.paused = self.render_size.is_empty();
        info!("resumed → paused={}", self.paused);

        if !self.paused {
            if let Some(w) = &self.window {
                w.request_redraw();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, window_id: WindowId, event: WindowEvent) {
        if let Some(window) = &self.window {
            if window_id != window.id() {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.shutdown(event_loop);
            }

            WindowEvent::Resized(new_size) => {
                self.render_size = RenderSize {
                    width: new_size.width,
                    height: new_size.height,
                };
                self.paused = self.render_size.is_empty();
                info!(
                    "Resized → {}x{} (paused={})",
                    self.render_size.width, self.render_size.height, self.paused
                );

                // A zero size is forwarded too so the renderer pauses itself.
                if let Some(renderer) = &mut self.renderer {
                    if !survives("resize", renderer.resize(self.render_size)) {
                        self.shutdown(event_loop);
                        return;
                    }
                }
                if !self.paused {
                    if let Some(w) = &self.window {
                        w.request_redraw();
                    }
                }
            }

            WindowEvent::Occluded(occluded) => {
                let now_paused = occluded || self.render_size.is_empty();
                if self.paused != now_paused {
                    self.paused = now_paused;
                    info!("Occluded={} → paused={}", occluded, self.paused);
                }
            }

            WindowEvent::Focused(focused) => {
                if self.focused != focused {
                    self.focused = focused;
                    info!("Focused({})", focused);
                }
            }

            WindowEvent::RedrawRequested => {
                if self.exiting || self.paused {
                    return;
                }
                let Some(renderer) = &mut self.renderer else {
                    return;
                };
                let result = renderer.render();
                let rendered = !renderer.is_paused();
                if !survives("render", result) {
                    self.shutdown(event_loop);
                } else if rendered {
                    // count only frames that were actually rendered
                    self.frames = self.frames.saturating_add(1);
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.exiting {
            return;
        }
        if self.paused {
            event_loop.set_control_flow(ControlFlow::Wait);
            self.frames = 0;
            return;
        }

        // With vsync the present call paces us; without it keep polling.
        event_loop.set_control_flow(if self.cfg.render.vsync {
            ControlFlow::Wait
        } else {
            ControlFlow::Poll
        });
        if let Some(w) = &self.window {
            w.request_redraw();
        }

        let now = Instant::now();
        if now.duration_since(self.last_fps_instant).as_secs_f32() >= 1.0 {
            info!("fps ~ {}", self.frames);
            self.frames = 0;
            self.last_fps_instant = now;
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut cfg = load_cfg(args.config.as_deref())?;
    if args.no_validation {
        cfg.render.validation = false;
    }
    if cfg.render.validation && !cfg!(debug_assertions) {
        warn!("validation enabled in a release build");
    }

    let event_loop: EventLoop<()> = EventLoop::new()?;
    let mut app = App::new(cfg);
    event_loop.run_app(&mut app)?;
    Ok(())
}
