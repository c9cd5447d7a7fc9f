//! GPU resources owned by the demo
//!
//! Handles the procedural torus geometry and the shading rate images.

mod shading_rate;
mod torus;

pub use shading_rate::*;
pub use torus::*;
