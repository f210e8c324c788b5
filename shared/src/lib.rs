//! Sensor acquisition pipeline components.
//!
//! This crate provides the driver abstraction for high-rate imaging sensors,
//! the capture pipeline that configures a sensor and pulls frames from it, and
//! the write-back path that persists frames as FITS files.
//!
//! # Features
//!
//! - `frame-writer` - CFITSIO-backed [`frame_writer::FitsEncoder`]
//! - `full` - everything (default)

pub mod camera_interface;
pub mod capture;
pub mod config_storage;
pub mod frame_writer;
pub mod image_size;
