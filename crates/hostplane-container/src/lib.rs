//! Container runtime access for hostplane.
//!
//! This crate provides:
//! - A Docker Engine API client speaking HTTP over the daemon's Unix socket
//! - Site container configuration and the platform to image table
//! - Host port allocation for published site ports

pub mod client;
pub mod config;
pub mod error;
pub mod images;
pub mod logs;
pub mod ports;

pub use client::{ContainerStats, DockerClient, ExecOutput};
pub use config::{ContainerConfig, CONTAINER_HTTP_PORT, SITE_MOUNT_PATH};
pub use error::ContainerError;
pub use images::{image_for_platform, DEFAULT_IMAGE};
pub use ports::allocate_free_port;
