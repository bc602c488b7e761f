pub mod cpm_cache;
pub mod cpm_client;
pub mod cpm_colors;
pub mod cpm_config;
pub mod cpm_controllers;
pub mod cpm_models;
pub mod cpm_railways;
pub mod cpm_reconciler;
pub mod cpm_routes;
pub mod cpm_scheduler;
pub mod cpm_views;
