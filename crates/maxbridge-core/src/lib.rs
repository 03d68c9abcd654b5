//! # maxbridge-core
//!
//! Core types and configuration for the Max Messenger bridge.
//!
//! This crate provides:
//! - The Max wire data model shared by both client modes
//! - Bridge configuration loading and validation (JSON5 format)
//! - Permission and ghost-identity template helpers

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod types;

pub use config::{Config, ConfigError};
pub use types::{
    AttachmentKind, ChatType, ConnectionMode, MaxAttachment, MaxChat, MaxEvent, MaxEventKind,
    MaxLinkedMessage, MaxMessage, MaxPhoto, MaxUser,
};
