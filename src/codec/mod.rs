// Just enough bitstream parsing to derive stream metadata and repackage
// decoder configs; full codec parsing is out of scope.

pub mod aac;
pub mod avc;
pub mod bits;
pub mod hevc;
