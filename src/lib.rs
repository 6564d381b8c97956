#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::module_name_repetitions)]

pub mod data;
pub mod error;
pub mod gd;
pub mod model;
pub mod telemetry;
pub mod weights;
