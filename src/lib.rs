//! Registry of the coordinate-space transformations of a neuroimaging subject.
//!
//! A subject session has up to seven spaces (T1, resting-state and task EPI,
//! diffusion, T2 and the 2mm/4mm MNI grids). This crate knows, for each ordered
//! pair and linearity, where the transform lives on disk and how to build it from
//! the others with the FSL tools, builds it on first use, and moves ROI images
//! between spaces with it.

pub mod util;
pub mod error;
pub mod space;
pub mod image;
pub mod config;
pub mod subject;
pub mod runner;
pub mod catalog;
pub mod computer;
pub mod roi;
pub mod populate;

pub use error::{Result, TransformError};
pub use space::{Space, SpacePair, TransformRequest};
pub use image::{ImageHandle, MatrixHandle};
pub use config::{Interpolation, TemplateConfig, TransformConfig};
pub use subject::{ImageRole, SubjectContext};
pub use runner::{execute, FslRunner, OutputKind, RecordingRunner, ToolCommand, ToolRunner};
pub use catalog::{resolve, Artifact, Fallback, Registration, Resolution, TransformRecipe};
pub use computer::{EnsureTransform, TransformComputer};
pub use roi::{EmptyRoiCallback, LogEmptyRoi, PathType, RoiOptions, RoiOutcome, RoiTransformer, TransformedRoi};
pub use populate::EpiKind;
