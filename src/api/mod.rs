pub mod addon_template;
pub mod managed_cluster_addon;
pub mod registration_config;
