// SPDX-License-Identifier: CEPL-1.0
pub use winit;

use lumen_render::RenderSize;
use winit::window::Window;

/// Current drawable size of `window` in physical pixels.
pub fn drawable_size(window: &Window) -> RenderSize {
    let size = window.inner_size();
    RenderSize {
        width: size.width,
        height: size.height,
    }
}
