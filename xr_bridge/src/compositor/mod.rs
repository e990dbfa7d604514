/// Compositor module - vendor compositor SDK boundary and submitted layer types

pub mod compositor;

pub use compositor::*;

// Mock compositor for tests (no headset required)
#[cfg(test)]
pub mod mock_compositor;
