//! navecd: a GitOps continuous-delivery controller. For each owned
//! `GitopsProject` the controller fetches its Git repository, decrypts
//! in-tree secrets, compiles the project into `Component`s, orders them
//! by dependency, collects garbage, applies manifests and Helm releases,
//! records an inventory, and scans versioned references for upstream
//! updates it writes back to Git.
//!
//! `graph`, `builder`, `project_manager`, `secrets`, `gc`, `inventory`,
//! `kube_apply`, `helmchart`, `reconcile`, `scanner`, `updater` and
//! `scheduler` are the reconciliation engine this crate exists to
//! implement. `crd`, `config`, `leader`, `metrics` and `install` are the
//! ambient process a production deployment wraps it in.

#[macro_use]
extern crate tracing;

pub mod builder;
pub mod config;
pub mod crd;
pub mod errors;
pub mod gc;
pub mod git;
pub mod graph;
pub mod helmchart;
pub mod install;
pub mod inventory;
pub mod kube_apply;
pub mod leader;
pub mod metrics;
pub mod project_manager;
pub mod reconcile;
pub mod scanner;
pub mod scheduler;
pub mod secrets;
pub mod updater;
