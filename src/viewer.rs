use log::{info, warn};
use minifb::{Key, KeyRepeat, MouseButton, MouseMode, Window, WindowOptions};

use crate::error::{FlowError, Result};
use crate::render;
use crate::simulation::{SimTick, SimulationController, TickEvent};

const CONTROLS: &str = "Click/drag: Add water, Space: Play/Pause, R: Reset, Esc/Q: Exit";

fn title(tick: SimTick, running: bool) -> String {
    let state = if running { "running" } else { "paused" };
    format!("Waterflow - {} ({}) - {}", tick, state, CONTROLS)
}

/// Map a window position to a grid cell.
fn cell_at(mx: f32, my: f32, scale: usize, width: usize, height: usize) -> Option<(usize, usize)> {
    if mx < 0.0 || my < 0.0 {
        return None;
    }
    let x = mx as usize / scale;
    let y = my as usize / scale;
    (x < width && y < height).then_some((x, y))
}

/// Turns mouse polling into source injections: one on press, then one for
/// every pointer movement while the button stays down.
#[derive(Debug, Default)]
struct DragInjector {
    last_pos: Option<(f32, f32)>,
}

impl DragInjector {
    /// Position to inject at this frame, if any.
    fn update(&mut self, down: bool, pos: Option<(f32, f32)>) -> Option<(f32, f32)> {
        if !down {
            self.last_pos = None;
            return None;
        }
        let pos = pos?;
        if self.last_pos == Some(pos) {
            return None;
        }
        self.last_pos = Some(pos);
        Some(pos)
    }
}

/// Run the interactive viewer until the window is closed.
/// Returns the tick the simulation ended on.
pub fn run_viewer(mut controller: SimulationController) -> Result<SimTick> {
    let (width, height) = controller.dimensions();

    // Target ~900 pixels on the larger dimension
    let target_size = 900;
    let scale = if width.max(height) > target_size {
        1
    } else {
        (target_size / width.max(height)).max(1)
    };
    let window_width = width * scale;
    let window_height = height * scale;

    let mut window = Window::new(
        &title(controller.tick(), false),
        window_width,
        window_height,
        WindowOptions {
            resize: false,
            scale: minifb::Scale::X1,
            ..WindowOptions::default()
        },
    )
    .map_err(|e| FlowError::Window(e.to_string()))?;
    window.set_target_fps(60);

    let events = controller.subscribe();

    println!("Viewer started. Controls:");
    println!("  Click/drag: Add water");
    println!("  Space: Play/Pause");
    println!("  R: Reset");
    println!("  Esc/Q: Exit");

    let mut buffer = Vec::new();
    let mut needs_redraw = true;
    let mut drag = DragInjector::default();

    while window.is_open() && !window.is_key_down(Key::Escape) && !window.is_key_down(Key::Q) {
        if window.is_key_pressed(Key::Space, KeyRepeat::No) {
            let toggled = if controller.is_running() { controller.pause() } else { controller.play() };
            if let Err(e) = toggled {
                warn!("Play/pause failed: {}", e);
            }
            needs_redraw = true;
        }

        if window.is_key_pressed(Key::R, KeyRepeat::No) {
            if let Err(e) = controller.pause().and_then(|_| controller.reset()) {
                warn!("Reset failed: {}", e);
            }
        }

        let pressed = drag.update(
            window.get_mouse_down(MouseButton::Left),
            window.get_mouse_pos(MouseMode::Discard),
        );
        if let Some((x, y)) = pressed.and_then(|(mx, my)| cell_at(mx, my, scale, width, height)) {
            if let Err(e) = controller.inject_source(x, y) {
                warn!("Could not add water at ({}, {}): {}", x, y, e);
            }
        }

        for event in events.try_iter() {
            if let TickEvent::Halted { reason } = &event {
                warn!("Simulation halted: {}", reason);
            }
            needs_redraw = true;
        }

        if needs_redraw {
            let (tick, depths) = controller.snapshot()?;
            let img = render::composite(controller.terrain(), &depths);
            buffer = render::to_buffer(&img, scale);
            window.set_title(&title(tick, controller.is_running()));
            needs_redraw = false;
        }

        window
            .update_with_buffer(&buffer, window_width, window_height)
            .map_err(|e| FlowError::Window(e.to_string()))?;
    }

    let tick = controller.end()?;
    info!("Viewer closed at {}", tick);
    Ok(tick)
}
