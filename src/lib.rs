//! # Text2SQL Harness
//!
//! Pipeline framework for the two halves of a text-to-SQL service: indexing
//! a semantic-layer manifest (MDL) into retrievable documents, and turning a
//! question plus its SQL result into a natural-language answer streamed
//! token by token.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────────┐   ┌──────────────┐
//! │   MDL    │──▶│ Indexing graph   │──▶│ Doc stores   │
//! │ manifest │   │ DDL/desc/views   │   │ memory/SQLite│
//! └──────────┘   └──────────────────┘   └──────────────┘
//!
//! ┌──────────┐   ┌──────────────┐   ┌──────────────┐   ┌──────────┐
//! │ question │──▶│ SQL executor │──▶│ Answer graph │──▶│  Broker  │──▶ SSE
//! │  + SQL   │   └──────────────┘   │ prompt → LLM │   └──────────┘
//! └──────────┘                      └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! t2s init                               # create document database
//! t2s index ./mdl.json --project-id demo # index a manifest
//! t2s answer --query "How many orders?" --sql "SELECT count(*) FROM orders" \
//!     --sql-summary "Counts orders" --stream
//! t2s serve http                         # start HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`pipeline`] | Dependency-graph executor |
//! | [`mdl`] | Manifest parsing and validation |
//! | [`indexing`] | MDL indexing pipeline |
//! | [`answer`] | Answer generation pipeline |
//! | [`service`] | Asynchronous answer service |
//! | [`broker`] | Per-request token queues |
//! | [`store`] | Document stores |
//! | [`embedding`] | Embedding providers |
//! | [`llm`] | Chat-completion generators |
//! | [`sql_executor`] | SQL execution for answer data |
//! | [`server`] | HTTP API |
//! | [`config`] | TOML configuration |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod answer;
pub mod broker;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod indexing;
pub mod llm;
pub mod logging;
pub mod mdl;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod server;
pub mod service;
pub mod sql_executor;
pub mod store;
