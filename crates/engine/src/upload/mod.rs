//! Resumable upload pipeline.
//!
//! A persisted node is classified into a [`ResumeState`], mapped to a
//! [`GraphState`] and turned into a graph of stage tasks that runs only
//! the stages left. Every stage persists its progress before the next one
//! starts, so an interrupted upload resumes where it stopped.

pub mod draft;
pub mod graph;
pub mod stages;
pub mod state;
pub mod uploader;

pub use draft::UploadDraft;
pub use graph::{
    GraphPolicy, GraphTemplate, StageKind, StageStep, UploadGraph, UploadGraphBuilder, template,
};
pub use stages::StageContext;
pub use state::{GraphState, ResumeState, classify, graph_state};
pub use uploader::{UploadHandle, Uploader};
