#![deny(unused, dead_code)]
#![deny(clippy::all, clippy::pedantic)]
// Module naming: common pattern in domain-driven code
#![allow(clippy::module_name_repetitions)]
// Function complexity: some functions are inherently complex
#![allow(clippy::too_many_lines)]
#![allow(clippy::too_many_arguments)]
// Variable naming: domain terms often similar
#![allow(clippy::similar_names)]
// Documentation style: many terms don't need backticks
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
// API ergonomics: prefer simplicity over must_use annotations
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
// Format strings: allow non-inlined for readability
#![allow(clippy::uninlined_format_args)]
// Numeric casts: intentional in protocol code
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::cast_possible_wrap)]
// Control flow style
#![allow(clippy::if_not_else)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::single_match_else)]
#![allow(clippy::match_wildcard_for_single_variants)]
#![allow(clippy::manual_let_else)]
// Passing style
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::trivially_copy_pass_by_ref)]
// Self usage
#![allow(clippy::unused_self)]
#![allow(clippy::used_underscore_binding)]
// Option/Result patterns
#![allow(clippy::unnecessary_wraps)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::map_unwrap_or)]
// Type defaults
#![allow(clippy::default_trait_access)]
// Iteration style
#![allow(clippy::explicit_iter_loop)]
#![allow(clippy::explicit_into_iter_loop)]
// Closure style
#![allow(clippy::redundant_closure_for_method_calls)]
// Unit patterns
#![allow(clippy::ignored_unit_patterns)]
// Large types
#![allow(clippy::large_futures)]
#![allow(clippy::large_enum_variant)]
#![allow(clippy::result_large_err)]
// Explicit returns
#![allow(clippy::needless_return)]
#![allow(clippy::semicolon_if_nothing_returned)]
// Explicit type bounds
#![allow(clippy::significant_drop_tightening)]
// Async functions that may not await yet
#![allow(clippy::unused_async)]

//! unitd - topic-based publish/subscribe message broker.
//!
//! # Module Organization
//!
//! ## Core
//! - `core::config` - Configuration parsing and CLI overrides
//! - `core::telemetry` - Logging bootstrap
//!
//! ## Protocol
//! - `protocol` - The ten-packet control alphabet
//! - `protocol::codec` - Binary line-protocol framing
//! - `protocol::frame` - Framing adapters (binary, WebSocket, protobuf)
//! - `protocol::grpc` - Protobuf stream framing
//!
//! ## Messaging
//! - `message` - Messages, id arenas, subscription stats
//! - `message::topic` - Topic parsing, salted hashing and matching
//!
//! ## Broker
//! - `broker::service` - Listeners, protocol demux, lifecycle
//! - `broker::session` - Per-session reader/dispatcher/writer tasks
//! - `broker::conn` - Connection state and routing operations
//! - `broker::cluster` - Contract ownership and RPC forwarding
//! - `broker::cache` - Process-wide connection cache
//!
//! ## Storage
//! - `store` - The adapter contract consumed by the core
//! - `store::mem` - In-memory adapter
//!
//! ## Security & Ops
//! - `security` - Connection ids, client ids, credential collaborator
//! - `ops::meters` - Runtime meters and the varz snapshot

pub mod broker;
pub mod cli;
pub mod core;
pub mod message;
pub mod ops;
pub mod protocol;
pub mod security;
pub mod store;

pub use self::core::config;
pub use broker::Service;
