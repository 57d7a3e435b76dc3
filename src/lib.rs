pub mod background_model;
pub mod blob_finder;
pub mod blob_tracker;
pub mod cli;
pub mod depth_source;
pub mod pipeline;
pub mod point_cloud;
