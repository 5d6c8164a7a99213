//! Core engine for sightline.
//!
//! sightline drives desktop applications it cannot integrate with by
//! reading the screen: elements are found by OCR and image templates,
//! then clicked or typed into with synthesized input. Failures are
//! classified and walked through a recovery plan before an operator is
//! asked to step in.
//!
//! # Modules
//!
//! - [`engine`]: session facade, the caller-facing API
//! - [`element`]: method selection, hybrid consensus, location cache
//! - [`text`] / [`template`]: the two detectors
//! - [`executor`]: one attempt of an action, plus plain retries
//! - [`recovery`]: error-driven recovery strategies
//! - [`telemetry`]: success rates, timings, error distribution
//! - [`protocol`]: JSON-lines script requests and responses
//!
//! # Detection methods
//!
//! | Method | Target | Confidence |
//! |--------|--------|------------|
//! | **text** | OCR words/phrases, `re:` regex | OCR word confidence |
//! | **template** | PNG in the template library | best of three correlation metrics |
//! | **hybrid** | both, concurrently | boosted ×1.2 when centers are within 20px |
//! | **coordinates** | literal point (actions only) | 1.0 |
//!
//! Live screen capture and real input are behind the `capture` and
//! `input` features; without them frames come from image files and input
//! is recorded only.

pub mod action;
pub mod cache;
pub mod config;
pub mod descriptor;
pub mod detection;
pub mod diagnostics;
pub mod element;
pub mod engine;
pub mod error;
pub mod executor;
pub mod frame;
pub mod geometry;
pub mod input;
pub mod protocol;
pub mod recovery;
pub mod telemetry;
pub mod template;
pub mod text;
pub mod wait;
