pub mod data_plane;
pub mod proxy_link;
pub mod registry;
pub mod stats;
