//! Visitor intelligence engine for Zentinel
//!
//! Identifies returning visitors, correlates HTTP sessions with an
//! out-of-band DNS observation, classifies client anomalies, and gates
//! content between automated clients and people.
//!
//! # Features
//!
//! - Persistent visitor token carried on the HTTP caching validator
//! - Session correlation across HTTP and DNS side channels
//! - Header forensics and client telemetry anomaly rules
//! - Crawler cloaking from a versioned signature list
//! - Non-blocking report dispatch to an HTTP sink
//!
//! # Example
//!
//! ```ignore
//! use zentinel_visitor_intel::{server, VisitorIntelConfig, VisitorIntelEngine};
//! use std::sync::Arc;
//!
//! let engine = VisitorIntelEngine::new(config, "data/crawler_signatures.json".as_ref()).await?;
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//! server::serve(listener, Arc::new(engine)).await?;
//! ```

pub mod cloak;
pub mod config;
pub mod detectors;
pub mod device;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod identity;
pub mod report;
pub mod server;
pub mod sessions;
pub mod telemetry;

pub use cloak::{CloakClassifier, CloakDecision};
pub use config::VisitorIntelConfig;
pub use detectors::{AnomalyDetector, AnomalyKind, AnomalySet};
pub use dispatch::{EventDispatcher, ReportSink};
pub use engine::VisitorIntelEngine;
pub use report::Report;
pub use sessions::SessionCorrelator;
