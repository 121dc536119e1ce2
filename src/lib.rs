//! # Label Harness
//!
//! A resumable batch runner for LLM text classification experiments.
//!
//! Label Harness runs every record of a loaded corpus through a classifier,
//! stores exactly one result row per record, and derives a confusion matrix
//! and accuracy/precision/recall/F1 from the stored rows. A run can be killed
//! at any point and resumed later without reclassifying finished records.
//!
//! ## Architecture
//!
//! ```text
//!  ┌──────────┐   ┌────────────┐   ┌──────────────┐   ┌──────────┐
//!  │  corpus  │──▶│  worklist  │──▶│  processor   │──▶│ results  │
//!  │ (loaded) │   │ (to do)    │   │ classify +   │   │ (SQLite) │
//!  └──────────┘   └────────────┘   │ parse+score  │   └────┬─────┘
//!                                  └──────────────┘        │
//!      ┌─────────────────────── runner ◀──── metrics ◀─────┘
//!      ▼
//!  ┌──────────┐
//!  │ registry │  running ─▶ completed | failed
//!  └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! lh init                                  # create database
//! lh load narratives.jsonl --source nv24   # import the corpus once
//! lh start                                 # create a run and process it
//! lh resume <run_id>                       # continue after an interruption
//! lh resume <run_id> --retry-errors-only   # re-attempt errored items
//! lh status <run_id>
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Fatal error taxonomy |
//! | [`models`] | Core data types |
//! | [`corpus`] | Corpus store, JSONL loader, slice checksum |
//! | [`registry`] | Run registry lifecycle |
//! | [`results`] | Result log |
//! | [`worklist`] | Remaining-work resolution |
//! | [`classifier`] | Classifier abstraction and HTTP client |
//! | [`parser`] | Classifier response parsing |
//! | [`processor`] | Per-item processing |
//! | [`lock`] | Per-run lock files |
//! | [`metrics`] | Metrics aggregation |
//! | [`runner`] | Run controller |
//! | [`progress`] | Progress reporting on stderr |
//! | [`export`] | Results and metrics artifacts |
//! | [`status`] | `status` and `runs` output |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod classifier;
pub mod config;
pub mod corpus;
pub mod db;
pub mod error;
pub mod export;
pub mod lock;
pub mod metrics;
pub mod migrate;
pub mod models;
pub mod parser;
pub mod processor;
pub mod progress;
pub mod registry;
pub mod results;
pub mod runner;
pub mod status;
pub mod worklist;
