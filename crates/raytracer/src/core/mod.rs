//! # Core Module
//!
//! Shared configuration for the GPU context and the renderer.

pub mod config;

pub use config::{Config, ConfigError, ContextConfig, OutputFormat, RendererConfig};
