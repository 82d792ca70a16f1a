//! Renderer pipeline: host callbacks and the confirmation-delay decorator.

pub mod delayed;
pub mod renderer;

pub use delayed::DelayedRenderer;
pub use renderer::Renderer;
