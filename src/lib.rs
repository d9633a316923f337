//! Stevedore - containerize a repository and deploy it to Kubernetes.
//!
//! A step-based workflow engine threads one [`workflow::WorkflowState`]
//! through named, independently retryable stages, backed by a concurrent,
//! persistent [`session::SessionStore`] and a deployment verification and
//! recovery loop.

pub mod api;
pub mod config;
pub mod error;
pub mod k8s;
pub mod logging;
pub mod pipeline;
pub mod rest;
pub mod runner;
pub mod session;
pub mod steps;
pub mod templates;
pub mod verify;
pub mod workflow;
