pub mod cluster_info;
pub mod signal;
