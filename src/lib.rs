//! oneform: declarative OpenNebula resource management.
//!
//! A YAML declaration names clusters, datastores, hosts, images, VM
//! templates, virtual machines and the other objects of an OpenNebula
//! deployment. The planner diffs it against a persisted state lock and the
//! executor drives one handler per resource kind through a [`api::CloudApi`]
//! implementation, reconciling tags, template sections, permissions and
//! locks, and polling until asynchronous transitions settle.

pub mod api;
pub mod config;
pub mod core;
pub mod datasources;
pub mod error;
pub mod logging;
pub mod resources;
pub mod template;
