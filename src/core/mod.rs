//! Core tracking engine: controller sessions, discovery, fusion and the
//! multi-controller registry.

pub mod bluetooth;
pub mod controller;
pub mod fusion;
pub mod tracker;
