pub mod bounding_box;
pub mod config;
pub mod extract;
pub mod fuse;
pub mod insert;
pub mod memory;
pub mod pipeline;
pub mod postprocess;
pub mod resolve;
pub mod run;
pub mod volume;
