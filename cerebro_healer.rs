//! # Cerebro Healer - The Self-Healing Decision Engine
//!
//! The decision core of the Cerebro AIOps platform. It ingests dimensional
//! telemetry, detects statistically anomalous or non-linear behavior, diagnoses
//! probable causes and synthesizes a prioritized remediation plan.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                           CEREBRO HEALER ENGINE                              │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  SAMPLES → AGGREGATOR / GRADIENTS / CHAOS → RULES + PATTERNS → DIAGNOSIS    │
//! │  DIAGNOSIS → HOTFIX / REFACTOR / REDESIGN → GENETIC OPTIMIZER → PLAN        │
//! │  PLAN → LIFECYCLE → EFFICACY FEEDBACK → GENERATOR CATALOGS                  │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Multi-window aggregation**: rolling statistics and OLS trends per series
//! - **Gradient analysis**: short/medium/long slopes, acceleration, reversals
//! - **Chaos detection**: phase-space heuristics against a self-learned baseline
//! - **Adaptive rules**: declarative rules reprioritized from their own history
//! - **Plan optimization**: genetic search across efficacy, risk, time, resources
//!
//! ## Author
//!
//! AIOps Team

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================
// All external crate imports, grouped by concern.
// ============================================================================

#![allow(dead_code)]
#![allow(unused_imports)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::error::Error as StdError;
use std::fmt::{self, Debug, Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::signal;
use tokio::sync::Notify;
use tokio::time::{interval, MissedTickBehavior};

// ----------------------------------------------------------------------------
// Concurrency Primitives
// ----------------------------------------------------------------------------
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map as JsonMap, Value as JsonValue};

// ----------------------------------------------------------------------------
// String & Hashing
// ----------------------------------------------------------------------------
use ahash::{AHashMap, AHashSet};
use compact_str::CompactString;

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, trace, warn, Level};
use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, EnvFilter};

// ----------------------------------------------------------------------------
// Time, Math & Randomness
// ----------------------------------------------------------------------------
use chrono::{DateTime, Utc};
use ordered_float::OrderedFloat;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

// ----------------------------------------------------------------------------
// Networking & Async Traits
// ----------------------------------------------------------------------------
use async_trait::async_trait;
use reqwest::Client as HttpClient;

// ----------------------------------------------------------------------------
// UUID, Configuration & CLI
// ----------------------------------------------------------------------------
use clap::{Parser, Subcommand};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use uuid::Uuid;

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================
// Defaults for every tunable of the decision engine. Each one can be
// overridden through `EngineConfig`.
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "cerebro-healer";
pub const ENGINE_FULL_NAME: &str = "Cerebro Self-Healing Engine";

/// Version of the JSON wire format for diagnoses and plans
pub const SCHEMA_VERSION: u32 = 1;

/// Prefix for environment overrides (`CEREBRO_HEALER_OPTIMIZER__GENERATIONS=40`)
pub const ENV_PREFIX: &str = "CEREBRO_HEALER_";

// ----------------------------------------------------------------------------
// Scheduling
// ----------------------------------------------------------------------------

/// Default interval between diagnostic cycles (milliseconds)
pub const DEFAULT_CYCLE_INTERVAL_MS: u64 = 5_000;

/// Minimum allowed cycle interval (milliseconds)
pub const MIN_CYCLE_INTERVAL_MS: u64 = 100;

/// Default timeout for collaborator calls (seconds)
pub const DEFAULT_API_TIMEOUT_SECS: u64 = 5;

/// Cycle duration above which a warning is logged (milliseconds)
pub const CYCLE_WARN_THRESHOLD_MS: u64 = 1_000;

// ----------------------------------------------------------------------------
// Temporal Aggregation
// ----------------------------------------------------------------------------

/// Default aggregation windows (seconds)
pub const DEFAULT_AGGREGATION_WINDOWS: [u64; 4] = [60, 300, 900, 3600];

/// Slopes below this magnitude are considered flat
pub const TREND_EPSILON: f64 = 0.001;

/// Trends with a lower coefficient of determination are considered stable
pub const TREND_MIN_R2: f64 = 0.3;

/// Minimum points for an aggregator trend
pub const MIN_TREND_POINTS: usize = 3;

// ----------------------------------------------------------------------------
// Gradient Analysis
// ----------------------------------------------------------------------------

/// Default sliding window size (points)
pub const DEFAULT_GRADIENT_WINDOW: usize = 50;

/// Default step between consecutive sliding windows (points)
pub const DEFAULT_GRADIENT_OVERLAP: usize = 10;

/// Medium-term window as a multiple of the short window
pub const MEDIUM_TERM_FACTOR: usize = 3;

/// Retained points per series as a multiple of the window
pub const GRADIENT_RETENTION_FACTOR: usize = 10;

/// Gradient snapshots kept per series
pub const GRADIENT_HISTORY_CAP: usize = 100;

/// Minimum R² for a gradient snapshot to be significant
pub const DEFAULT_TREND_CONFIDENCE: f64 = 0.7;

/// Relative slope change that counts as acceleration
pub const ACCELERATION_RATIO: f64 = 0.5;

// ----------------------------------------------------------------------------
// Chaos Detection
// ----------------------------------------------------------------------------

/// Default analysis window (points); twice this many are retained
pub const DEFAULT_CHAOS_WINDOW: usize = 100;

/// Default phase-space embedding dimension
pub const DEFAULT_EMBEDDING_DIM: usize = 3;

/// Default embedding delay
pub const DEFAULT_EMBEDDING_DELAY: usize = 1;

/// Default relative deviation that raises a chaos alarm
pub const DEFAULT_CHAOS_THRESHOLD: f64 = 2.0;

/// Tolerance factor for approximate entropy (fraction of σ)
pub const ENTROPY_TOLERANCE: f64 = 0.2;

/// Pattern length for approximate entropy
pub const ENTROPY_PATTERN_LEN: usize = 2;

/// Minimum points for entropy and Lyapunov estimates
pub const MIN_CHAOS_POINTS: usize = 100;

/// Maximum random pairs sampled by the Lyapunov proxy
pub const LYAPUNOV_MAX_PAIRS: usize = 50;

/// Maximum divergence steps followed by the Lyapunov proxy
pub const LYAPUNOV_MAX_STEPS: usize = 10;

/// Number of log-spaced radii for the correlation-dimension proxy
pub const CORRELATION_RADII: usize = 10;

// ----------------------------------------------------------------------------
// Rules, Diagnosis & Plans
// ----------------------------------------------------------------------------

/// Execution history entries retained by the rule engine
pub const RULE_HISTORY_CAP: usize = 1000;

/// Executions required before a rule is reprioritized
pub const REPRIORITIZE_MIN_EXECUTIONS: u64 = 10;

/// Window of recent executions in the performance report
pub const RULE_REPORT_WINDOW: usize = 100;

/// Diagnoses retained in the ring buffer
pub const DIAGNOSIS_HISTORY_CAP: usize = 100;

/// Anomalies that receive a recommendation
pub const TOP_RECOMMENDATIONS: usize = 3;

/// Plans retained in the ring buffer
pub const PLAN_HISTORY_CAP: usize = 100;

/// Refactor applications and redesign evolutions retained
pub const APPLICATION_HISTORY_CAP: usize = 100;

// ----------------------------------------------------------------------------
// Action Defaults
// ----------------------------------------------------------------------------

pub const HOTFIX_PRIORITY: f64 = 0.8;
pub const HOTFIX_RISK: f64 = 0.3;
pub const HOTFIX_TIME_SECS: f64 = 60.0;
pub const HOTFIX_GENERIC_TIME_SECS: f64 = 30.0;
pub const REFACTOR_PRIORITY: f64 = 0.5;
pub const REFACTOR_RISK: f64 = 0.5;
pub const REFACTOR_TIME_SECS: f64 = 300.0;
pub const REDESIGN_PRIORITY: f64 = 0.3;
pub const REDESIGN_RISK: f64 = 0.7;
pub const REDESIGN_TIME_SECS: f64 = 1800.0;

/// Redesign strategies must score above this to produce an action
pub const REDESIGN_MIN_SCORE: f64 = 0.3;

/// Maximum redesign actions per plan
pub const MAX_REDESIGN_ACTIONS: usize = 2;

/// Strategies applied more recently than this are penalized (days)
pub const REDESIGN_RECENCY_DAYS: f64 = 7.0;

/// Efficacy assumed for templates without history
pub const DEFAULT_TEMPLATE_EFFICACY: f64 = 0.5;

// ----------------------------------------------------------------------------
// Genetic Optimizer
// ----------------------------------------------------------------------------

pub const DEFAULT_POPULATION_SIZE: usize = 50;
pub const DEFAULT_GENERATIONS: usize = 20;
pub const DEFAULT_MUTATION_RATE: f64 = 0.1;
pub const DEFAULT_TOURNAMENT_SIZE: usize = 3;
pub const WEIGHT_EFFICACY: f64 = 0.4;
pub const WEIGHT_RISK: f64 = 0.3;
pub const WEIGHT_TIME: f64 = 0.2;
pub const WEIGHT_RESOURCES: f64 = 0.1;

/// Total plan time that scores zero on the time objective (seconds)
pub const TIME_REFERENCE_SECS: f64 = 3600.0;

/// Distinct resource keys that score zero on the resource objective
pub const RESOURCE_REFERENCE: f64 = 10.0;

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// The shared schema: every component speaks in these types. Wire names
// follow the platform's JSON contract (Portuguese keys).
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Timestamp
// ----------------------------------------------------------------------------

/// Timestamp in nanoseconds since the Unix epoch.
///
/// Serialized as floating-point unix seconds, which is what the collectors
/// and the portal exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    #[inline]
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    #[inline]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs.saturating_mul(1_000_000_000))
    }

    /// Create from fractional unix seconds. `None` when the value is not
    /// finite or does not fit the nanosecond range.
    #[inline]
    pub fn from_secs_f64(secs: f64) -> Option<Self> {
        const NANOS_LIMIT: f64 = 9_223_372_036_854_775_808.0;
        let nanos = (secs * 1e9).round();
        if nanos.is_finite() && (-NANOS_LIMIT..NANOS_LIMIT).contains(&nanos) {
            Some(Self(nanos as i64))
        } else {
            None
        }
    }

    /// Current wall-clock time
    #[inline]
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_nanos() as i64)
    }

    #[inline]
    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn as_secs(&self) -> i64 {
        self.0 / 1_000_000_000
    }

    #[inline]
    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1e9
    }

    /// Seconds elapsed since `earlier` (negative if `earlier` is later)
    #[inline]
    pub fn secs_since(&self, earlier: Timestamp) -> f64 {
        (i128::from(self.0) - i128::from(earlier.0)) as f64 / 1e9
    }

    #[inline]
    pub fn to_datetime(&self) -> DateTime<Utc> {
        let secs = self.0.div_euclid(1_000_000_000);
        let nanos = self.0.rem_euclid(1_000_000_000) as u32;
        DateTime::from_timestamp(secs, nanos).unwrap_or_default()
    }

    pub const EPOCH: Timestamp = Timestamp(0);
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().format("%Y-%m-%d %H:%M:%S%.3f UTC"))
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_secs_f64())
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Timestamp::from_secs_f64(secs)
            .ok_or_else(|| serde::de::Error::custom(format!("timestamp {} is outside the supported range", secs)))
    }
}

// ----------------------------------------------------------------------------
// 3.2 Series Keys & Dimensions
// ----------------------------------------------------------------------------

/// Key of a per-metric series: `"dimension:name"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SeriesKey(CompactString);

impl SeriesKey {
    pub fn new(dimension: &str, name: &str) -> Self {
        let mut key = CompactString::with_capacity(dimension.len() + name.len() + 1);
        key.push_str(dimension);
        key.push(':');
        key.push_str(name);
        Self(key)
    }

    pub fn for_sample(sample: &MetricSample) -> Self {
        Self::new(&sample.dimension, &sample.name)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// The metric name part of the key
    pub fn metric_name(&self) -> &str {
        self.0.split_once(':').map(|(_, n)| n).unwrap_or(self.0.as_str())
    }
}

impl Display for SeriesKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

impl From<&str> for SeriesKey {
    fn from(s: &str) -> Self {
        Self(CompactString::from(s))
    }
}

/// Well-known telemetry dimensions.
pub mod dimensions {
    pub const THROUGHPUT: &str = "throughput";
    pub const ERRORS: &str = "erros";
    pub const LATENCY: &str = "latencia";
    pub const RESOURCES: &str = "recursos";

    /// Whether a larger value is an improvement for this dimension
    pub fn higher_is_better(dimension: &str) -> bool {
        dimension == THROUGHPUT
    }
}

/// Free-form context attached to cycles, diagnoses and actions.
pub type ContextMap = JsonMap<String, JsonValue>;

/// Keep only scalar (string, number, bool) entries of a context.
pub fn scalar_context(context: &ContextMap) -> ContextMap {
    context
        .iter()
        .filter(|(_, v)| v.is_string() || v.is_number() || v.is_boolean())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Render a scalar JSON value the way it is substituted into commands.
pub fn scalar_to_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Generate an identifier of the form `<prefix>_<unix-secs>_<8 hex>`.
pub fn generate_id(prefix: &str) -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("{}_{}_{}", prefix, Timestamp::now().as_secs(), &uuid[..8])
}

// ----------------------------------------------------------------------------
// 3.3 Metric Sample - The Unit of Telemetry
// ----------------------------------------------------------------------------

/// One observation produced by the collector collaborator.
///
/// Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub id: String,
    #[serde(rename = "nome")]
    pub name: String,
    #[serde(rename = "valor")]
    pub value: f64,
    pub timestamp: Timestamp,
    #[serde(rename = "dimensao")]
    pub dimension: String,
    #[serde(rename = "unidade")]
    pub unit: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(rename = "metadados", default)]
    pub metadata: ContextMap,
}

impl MetricSample {
    /// Create a sample with a generated id and no tags.
    pub fn new(
        name: impl Into<String>,
        value: f64,
        timestamp: Timestamp,
        dimension: impl Into<String>,
        unit: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            value,
            timestamp,
            dimension: dimension.into(),
            unit: unit.into(),
            tags: BTreeMap::new(),
            metadata: ContextMap::new(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Decode one sample from the ingestion contract, rejecting missing
    /// or invalid fields.
    pub fn from_json(value: &JsonValue) -> Result<Self, ValidationError> {
        const REQUIRED: [&str; 6] = ["id", "nome", "valor", "timestamp", "dimensao", "unidade"];
        let object = value.as_object().ok_or_else(|| ValidationError::InvalidSample {
            message: "sample is not a JSON object".into(),
        })?;
        if let Some(missing) = REQUIRED.iter().find(|f| !object.contains_key(**f)) {
            return Err(ValidationError::MissingField { field: (*missing).to_string() });
        }
        let sample: MetricSample = serde_json::from_value(value.clone())
            .map_err(|e| ValidationError::InvalidSample { message: e.to_string() })?;
        if !sample.value.is_finite() {
            return Err(ValidationError::InvalidSample {
                message: format!("non-finite value for '{}'", sample.name),
            });
        }
        Ok(sample)
    }

    pub fn to_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }
}

/// Decode a JSON array of samples. Invalid samples are returned alongside
/// their index instead of failing the whole batch.
pub fn decode_samples(value: &JsonValue) -> (Vec<MetricSample>, Vec<(usize, ValidationError)>) {
    let Some(items) = value.as_array() else {
        return (
            Vec::new(),
            vec![(0, ValidationError::InvalidSample { message: "expected a JSON array".into() })],
        );
    };
    let mut samples = Vec::with_capacity(items.len());
    let mut rejected = Vec::new();
    for (index, item) in items.iter().enumerate() {
        match MetricSample::from_json(item) {
            Ok(sample) => samples.push(sample),
            Err(e) => rejected.push((index, e)),
        }
    }
    (samples, rejected)
}

/// Validate that a value lies in [0, 1].
pub fn check_unit_interval(field: &'static str, value: f64) -> Result<f64, ValidationError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(ValidationError::OutOfRange { field, value })
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Error taxonomy for the decision engine:
// - One thiserror enum per subsystem, wrapped by `CerebroError`
// - Per-item failures are values (`ItemFailure`), never cycle aborts
// - Insufficient history is not an error: detectors return empty results
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Root Error Type
// ----------------------------------------------------------------------------

/// Root error type for the decision engine
#[derive(Error, Debug)]
pub enum CerebroError {
    // ---- Configuration Errors ----
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    // ---- Validation Errors ----
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    // ---- Registry Lookups ----
    #[error("Unknown {kind} id '{id}'")]
    UnknownId { kind: &'static str, id: String },

    // ---- Collaborator Errors ----
    #[error("Collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),

    // ---- Rule Errors ----
    #[error("Rule error: {0}")]
    Rule(#[from] RuleError),

    // ---- Pattern Errors ----
    #[error("Pattern error: {0}")]
    Pattern(#[from] PatternError),

    // ---- Plan Errors ----
    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),

    // ---- Serialization Errors ----
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // ---- IO Errors ----
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ---- Scheduling ----
    #[error("A diagnostic cycle is already running on this instance")]
    CycleInProgress,

    // ---- Generic Errors ----
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CerebroError {
    pub fn unknown_id(kind: &'static str, id: impl Into<String>) -> Self {
        CerebroError::UnknownId { kind, id: id.into() }
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            CerebroError::Config(_) => false,
            CerebroError::Validation(_) => true,
            CerebroError::UnknownId { .. } => true,
            CerebroError::Collaborator(e) => e.is_recoverable(),
            CerebroError::Rule(_) => true,
            CerebroError::Pattern(_) => true,
            CerebroError::Plan(_) => true,
            CerebroError::Serialization(_) => true,
            CerebroError::Io(_) => true,
            CerebroError::CycleInProgress => true,
            CerebroError::Internal(_) => false,
        }
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            CerebroError::Config(_) => "config",
            CerebroError::Validation(_) => "validation",
            CerebroError::UnknownId { .. } => "unknown_id",
            CerebroError::Collaborator(_) => "collaborator",
            CerebroError::Rule(_) => "rule",
            CerebroError::Pattern(_) => "pattern",
            CerebroError::Plan(_) => "plan",
            CerebroError::Serialization(_) => "serialization",
            CerebroError::Io(_) => "io",
            CerebroError::CycleInProgress => "scheduling",
            CerebroError::Internal(_) => "internal",
        }
    }

    /// Get suggested recovery action
    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            CerebroError::Config(_) => RecoveryHint::FixConfiguration,
            CerebroError::Collaborator(e) => e.recovery_hint(),
            CerebroError::Validation(_)
            | CerebroError::Rule(_)
            | CerebroError::Pattern(_)
            | CerebroError::UnknownId { .. } => RecoveryHint::Skip,
            CerebroError::CycleInProgress => RecoveryHint::RetryWithBackoff,
            CerebroError::Internal(_) => RecoveryHint::AlertOperator,
            _ => RecoveryHint::RetryImmediate,
        }
    }
}

/// Hints for how to recover from an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryHint {
    /// No recovery possible
    None,
    /// Retry immediately
    RetryImmediate,
    /// Retry with exponential backoff
    RetryWithBackoff,
    /// Reconnect to the service
    Reconnect,
    /// Fix configuration and restart
    FixConfiguration,
    /// Skip this item and continue
    Skip,
    /// Alert operator for manual intervention
    AlertOperator,
}

/// Result alias used across the engine
pub type CerebroResult<T> = Result<T, CerebroError>;

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Validation Errors
// ----------------------------------------------------------------------------

/// Construction-time validation failures. Values are rejected, never clamped.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("'{field}' must lie in [0, 1], got {value}")]
    OutOfRange { field: &'static str, value: f64 },

    #[error("'{field}' must be positive, got {value}")]
    NonPositive { field: &'static str, value: f64 },

    #[error("Duplicate action id '{id}' in plan")]
    DuplicateActionId { id: String },

    #[error("Missing required field '{field}'")]
    MissingField { field: String },

    #[error("Invalid metric sample: {message}")]
    InvalidSample { message: String },

    #[error("Unsupported schema version {found} (supported: {supported})")]
    UnsupportedSchema { found: u32, supported: u32 },
}

// ----------------------------------------------------------------------------
// 4.4 Collaborator Errors
// ----------------------------------------------------------------------------

/// Failures talking to an external collaborator (metric source)
#[derive(Error, Debug)]
pub enum CollaboratorError {
    #[error("Timeout waiting for '{operation}' (waited {timeout_ms}ms)")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Connection to '{endpoint}' failed: {message}")]
    ConnectionFailed { endpoint: String, message: String },

    #[error("'{endpoint}' answered with HTTP {status}")]
    HttpStatus { endpoint: String, status: u16 },

    #[error("Invalid response from '{origin}': {message}")]
    InvalidResponse { origin: String, message: String },

    #[error("Reading '{path}' failed: {message}")]
    Io { path: PathBuf, message: String },
}

impl CollaboratorError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, CollaboratorError::Io { .. })
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            CollaboratorError::ConnectionFailed { .. } => RecoveryHint::Reconnect,
            CollaboratorError::Timeout { .. } => RecoveryHint::RetryWithBackoff,
            CollaboratorError::HttpStatus { .. } => RecoveryHint::RetryWithBackoff,
            CollaboratorError::InvalidResponse { .. } => RecoveryHint::Skip,
            CollaboratorError::Io { .. } => RecoveryHint::FixConfiguration,
        }
    }

    pub fn from_reqwest(endpoint: &str, timeout_ms: u64, error: reqwest::Error) -> Self {
        if error.is_timeout() {
            CollaboratorError::Timeout { operation: format!("GET {}", endpoint), timeout_ms }
        } else if let Some(status) = error.status() {
            CollaboratorError::HttpStatus { endpoint: endpoint.to_string(), status: status.as_u16() }
        } else if error.is_decode() {
            CollaboratorError::InvalidResponse {
                origin: endpoint.to_string(),
                message: error.to_string(),
            }
        } else {
            CollaboratorError::ConnectionFailed {
                endpoint: endpoint.to_string(),
                message: error.to_string(),
            }
        }
    }
}

// ----------------------------------------------------------------------------
// 4.5 Rule, Pattern & Plan Errors
// ----------------------------------------------------------------------------

/// Failure of a single rule's condition or action
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuleError {
    #[error("Hook '{hook}' failed: {message}")]
    HookFailed { hook: String, message: String },

    #[error("Unknown rule hook '{0}'")]
    UnknownHook(String),

    #[error("Metric '{metric}' has a non-finite value")]
    NonFiniteMetric { metric: String },

    #[error("Context key '{0}' is missing")]
    MissingContext(String),
}

/// Failure of a single pattern evaluation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PatternError {
    #[error("Detector '{detector}' failed: {message}")]
    DetectorFailed { detector: String, message: String },

    #[error("Unknown detector '{0}'")]
    UnknownDetector(String),

    #[error("Invalid detector parameter '{param}': {message}")]
    InvalidParameter { param: &'static str, message: String },
}

/// Plan lifecycle errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    #[error("Plan '{0}' not found")]
    NotFound(String),

    #[error("Invalid plan transition {from} -> {to}")]
    InvalidTransition { from: PlanStatus, to: PlanStatus },
}

// ----------------------------------------------------------------------------
// 4.6 Per-Item Failures
// ----------------------------------------------------------------------------

/// Pipeline stage in which an isolated failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Ingest,
    Collect,
    Context,
    Rule,
    Pattern,
    Generate,
    Persist,
}

impl Display for FailureStage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureStage::Ingest => "ingest",
            FailureStage::Collect => "collect",
            FailureStage::Context => "context",
            FailureStage::Rule => "rule",
            FailureStage::Pattern => "pattern",
            FailureStage::Generate => "generate",
            FailureStage::Persist => "persist",
        };
        f.write_str(name)
    }
}

/// One isolated failure: the stage, the item that failed and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub stage: FailureStage,
    pub item: String,
    pub error: String,
}

impl ItemFailure {
    pub fn new(stage: FailureStage, item: impl Into<String>, error: impl Display) -> Self {
        Self { stage, item: item.into(), error: error.to_string() }
    }
}

// ----------------------------------------------------------------------------
// 4.7 Error Statistics Tracking
// ----------------------------------------------------------------------------

/// Tracks error statistics for monitoring
#[derive(Debug, Default)]
pub struct ErrorStats {
    /// Total errors by category
    pub by_category: DashMap<&'static str, AtomicU64>,
    /// Recoverable vs non-recoverable
    pub recoverable_count: AtomicU64,
    pub non_recoverable_count: AtomicU64,
}

impl ErrorStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error
    pub fn record(&self, error: &CerebroError) {
        self.record_category(error.category(), error.is_recoverable());
    }

    /// Record an isolated per-item failure under its stage category
    pub fn record_failure(&self, failure: &ItemFailure) {
        let category = match failure.stage {
            FailureStage::Ingest => "validation",
            FailureStage::Collect => "collaborator",
            FailureStage::Context => "context",
            FailureStage::Rule => "rule",
            FailureStage::Pattern => "pattern",
            FailureStage::Generate => "generate",
            FailureStage::Persist => "io",
        };
        self.record_category(category, true);
    }

    fn record_category(&self, category: &'static str, recoverable: bool) {
        self.by_category
            .entry(category)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, AtomicOrdering::Relaxed);

        if recoverable {
            self.recoverable_count.fetch_add(1, AtomicOrdering::Relaxed);
        } else {
            self.non_recoverable_count.fetch_add(1, AtomicOrdering::Relaxed);
        }
    }

    /// Get total error count
    pub fn total_errors(&self) -> u64 {
        self.recoverable_count.load(AtomicOrdering::Relaxed)
            + self.non_recoverable_count.load(AtomicOrdering::Relaxed)
    }

    /// Get error count by category
    pub fn count_by_category(&self, category: &str) -> u64 {
        self.by_category
            .get(category)
            .map(|v| v.load(AtomicOrdering::Relaxed))
            .unwrap_or(0)
    }

    /// Snapshot of all category counters, sorted by category
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.by_category
            .iter()
            .map(|entry| (entry.key().to_string(), entry.value().load(AtomicOrdering::Relaxed)))
            .collect()
    }
}

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// Configuration management with:
// - TOML file parsing
// - Environment variable overrides (CEREBRO_HEALER_SECTION__FIELD)
// - Validation
// - Declarative catalogs for patterns, rules, templates and strategies
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the decision engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// General engine settings
    #[serde(default)]
    pub engine: GeneralConfig,

    /// Multi-window temporal aggregation
    #[serde(default)]
    pub aggregation: AggregationConfig,

    /// Gradient analysis
    #[serde(default)]
    pub gradient: GradientConfig,

    /// Phase-space chaos detection
    #[serde(default)]
    pub chaos: ChaosConfig,

    /// Rule engine
    #[serde(default)]
    pub rules: RulesConfig,

    /// Diagnosis coordinator
    #[serde(default)]
    pub diagnosis: DiagnosisConfig,

    /// Action generator defaults
    #[serde(default)]
    pub actions: ActionsConfig,

    /// Genetic plan optimizer
    #[serde(default)]
    pub optimizer: OptimizerConfig,

    /// Plan orchestration
    #[serde(default)]
    pub planning: PlanningConfig,

    /// Metric source collaborator
    #[serde(default)]
    pub collaborator: CollaboratorConfig,

    /// Global context merged into every cycle
    #[serde(default)]
    pub context: ContextConfig,

    /// Pattern, rule, template and strategy catalogs
    #[serde(default)]
    pub catalog: CatalogConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML string
    pub fn from_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.cycle_interval_ms < MIN_CYCLE_INTERVAL_MS {
            return Err(ConfigError::invalid_value(
                "engine.cycle_interval_ms",
                format!("Cycle interval must be at least {}ms", MIN_CYCLE_INTERVAL_MS),
            ));
        }

        if self.aggregation.windows_secs.is_empty() {
            return Err(ConfigError::invalid_value(
                "aggregation.windows_secs",
                "At least one aggregation window is required",
            ));
        }
        if self.aggregation.windows_secs.iter().any(|w| *w == 0) {
            return Err(ConfigError::invalid_value(
                "aggregation.windows_secs",
                "Aggregation windows must be positive",
            ));
        }
        check_unit("aggregation.trend_min_r2", self.aggregation.trend_min_r2)?;

        check_nonzero("gradient.window", self.gradient.window)?;
        check_nonzero("gradient.overlap", self.gradient.overlap)?;
        check_nonzero("gradient.history_cap", self.gradient.history_cap)?;
        check_unit("gradient.trend_confidence", self.gradient.trend_confidence)?;

        check_nonzero("chaos.window", self.chaos.window)?;
        check_nonzero("chaos.embedding_dim", self.chaos.embedding_dim)?;
        check_nonzero("chaos.delay", self.chaos.delay)?;
        check_positive("chaos.threshold", self.chaos.threshold)?;
        check_positive("chaos.entropy_tolerance", self.chaos.entropy_tolerance)?;
        check_nonzero("chaos.lyapunov_pairs", self.chaos.lyapunov_pairs)?;
        check_nonzero("chaos.lyapunov_steps", self.chaos.lyapunov_steps)?;

        check_nonzero("rules.history_cap", self.rules.history_cap)?;
        check_nonzero("diagnosis.history_cap", self.diagnosis.history_cap)?;

        let a = &self.actions;
        for (field, value) in [
            ("actions.hotfix_priority", a.hotfix_priority),
            ("actions.hotfix_risk", a.hotfix_risk),
            ("actions.refactor_priority", a.refactor_priority),
            ("actions.refactor_risk", a.refactor_risk),
            ("actions.redesign_priority", a.redesign_priority),
            ("actions.redesign_risk", a.redesign_risk),
            ("actions.redesign_min_score", a.redesign_min_score),
        ] {
            check_unit(field, value)?;
        }
        for (field, value) in [
            ("actions.hotfix_time_secs", a.hotfix_time_secs),
            ("actions.hotfix_generic_time_secs", a.hotfix_generic_time_secs),
            ("actions.refactor_time_secs", a.refactor_time_secs),
            ("actions.redesign_time_secs", a.redesign_time_secs),
            ("actions.recency_days", a.recency_days),
        ] {
            check_positive(field, value)?;
        }

        let o = &self.optimizer;
        if o.population_size < 2 {
            return Err(ConfigError::invalid_value(
                "optimizer.population_size",
                "Population must hold at least 2 chromosomes",
            ));
        }
        check_nonzero("optimizer.tournament_size", o.tournament_size)?;
        check_unit("optimizer.mutation_rate", o.mutation_rate)?;
        for (field, value) in [
            ("optimizer.weights.efficacy", o.weights.efficacy),
            ("optimizer.weights.risk", o.weights.risk),
            ("optimizer.weights.time", o.weights.time),
            ("optimizer.weights.resources", o.weights.resources),
        ] {
            check_unit(field, value)?;
        }
        check_positive("optimizer.time_reference_secs", o.time_reference_secs)?;
        check_positive("optimizer.resource_reference", o.resource_reference)?;

        check_unit("planning.min_plan_score", self.planning.min_plan_score)?;
        check_nonzero("planning.history_cap", self.planning.history_cap)?;

        if self.collaborator.api_timeout_secs == 0 {
            return Err(ConfigError::invalid_value(
                "collaborator.api_timeout_secs",
                "Timeout must be positive",
            ));
        }

        self.catalog.validate()?;
        Ok(())
    }

    /// Create a default config file
    pub fn generate_default_config() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

fn check_unit(field: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::invalid_value(field, format!("{} is outside [0, 1]", value)))
    }
}

fn check_positive(field: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid_value(field, format!("{} must be positive", value)))
    }
}

fn check_nonzero(field: &str, value: usize) -> Result<(), ConfigError> {
    if value > 0 {
        Ok(())
    } else {
        Err(ConfigError::invalid_value(field, "must be greater than zero"))
    }
}

// ----------------------------------------------------------------------------
// 5.2 General Engine Configuration
// ----------------------------------------------------------------------------

/// General engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Engine instance name (one instance per monitored service)
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Interval between diagnostic cycles in milliseconds
    #[serde(default = "default_cycle_interval")]
    pub cycle_interval_ms: u64,

    /// Environment name (prod, staging, dev)
    #[serde(default = "default_environment")]
    pub environment: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            cycle_interval_ms: default_cycle_interval(),
            environment: default_environment(),
        }
    }
}

fn default_instance_name() -> String {
    ENGINE_NAME.into()
}

fn default_cycle_interval() -> u64 {
    DEFAULT_CYCLE_INTERVAL_MS
}

fn default_environment() -> String {
    "production".into()
}

fn default_true() -> bool {
    true
}

// ----------------------------------------------------------------------------
// 5.3 Analysis Configuration
// ----------------------------------------------------------------------------

/// Temporal aggregation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Window lengths in seconds
    #[serde(default = "default_windows")]
    pub windows_secs: Vec<u64>,

    #[serde(default = "default_trend_epsilon")]
    pub trend_epsilon: f64,

    #[serde(default = "default_trend_min_r2")]
    pub trend_min_r2: f64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            windows_secs: default_windows(),
            trend_epsilon: default_trend_epsilon(),
            trend_min_r2: default_trend_min_r2(),
        }
    }
}

fn default_windows() -> Vec<u64> {
    DEFAULT_AGGREGATION_WINDOWS.to_vec()
}

fn default_trend_epsilon() -> f64 {
    TREND_EPSILON
}

fn default_trend_min_r2() -> f64 {
    TREND_MIN_R2
}

/// Gradient analysis settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradientConfig {
    /// Sliding window size W (points)
    #[serde(default = "default_gradient_window")]
    pub window: usize,

    /// Step O between consecutive sliding windows (points)
    #[serde(default = "default_gradient_overlap")]
    pub overlap: usize,

    #[serde(default = "default_gradient_history_cap")]
    pub history_cap: usize,

    /// Minimum R² of both snapshots compared by trend-change detection
    #[serde(default = "default_trend_confidence")]
    pub trend_confidence: f64,
}

impl Default for GradientConfig {
    fn default() -> Self {
        Self {
            window: default_gradient_window(),
            overlap: default_gradient_overlap(),
            history_cap: default_gradient_history_cap(),
            trend_confidence: default_trend_confidence(),
        }
    }
}

fn default_gradient_window() -> usize {
    DEFAULT_GRADIENT_WINDOW
}

fn default_gradient_overlap() -> usize {
    DEFAULT_GRADIENT_OVERLAP
}

fn default_gradient_history_cap() -> usize {
    GRADIENT_HISTORY_CAP
}

fn default_trend_confidence() -> f64 {
    DEFAULT_TREND_CONFIDENCE
}

/// Chaos detector settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChaosConfig {
    /// Analysis window (points); twice this many are retained
    #[serde(default = "default_chaos_window")]
    pub window: usize,

    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,

    #[serde(default = "default_embedding_delay")]
    pub delay: usize,

    /// Relative deviation from the baseline that raises an alarm
    #[serde(default = "default_chaos_threshold")]
    pub threshold: f64,

    /// Approximate-entropy tolerance as a fraction of σ
    #[serde(default = "default_entropy_tolerance")]
    pub entropy_tolerance: f64,

    #[serde(default = "default_lyapunov_pairs")]
    pub lyapunov_pairs: usize,

    #[serde(default = "default_lyapunov_steps")]
    pub lyapunov_steps: usize,

    /// Seed for the Lyapunov sampler (entropy when absent)
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            window: default_chaos_window(),
            embedding_dim: default_embedding_dim(),
            delay: default_embedding_delay(),
            threshold: default_chaos_threshold(),
            entropy_tolerance: default_entropy_tolerance(),
            lyapunov_pairs: default_lyapunov_pairs(),
            lyapunov_steps: default_lyapunov_steps(),
            seed: None,
        }
    }
}

fn default_chaos_window() -> usize {
    DEFAULT_CHAOS_WINDOW
}

fn default_embedding_dim() -> usize {
    DEFAULT_EMBEDDING_DIM
}

fn default_embedding_delay() -> usize {
    DEFAULT_EMBEDDING_DELAY
}

fn default_chaos_threshold() -> f64 {
    DEFAULT_CHAOS_THRESHOLD
}

fn default_entropy_tolerance() -> f64 {
    ENTROPY_TOLERANCE
}

fn default_lyapunov_pairs() -> usize {
    LYAPUNOV_MAX_PAIRS
}

fn default_lyapunov_steps() -> usize {
    LYAPUNOV_MAX_STEPS
}

/// Rule engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesConfig {
    #[serde(default = "default_rule_history_cap")]
    pub history_cap: usize,

    /// Executions a rule needs before its priority adapts
    #[serde(default = "default_reprioritize_min")]
    pub reprioritize_min_executions: u64,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            history_cap: default_rule_history_cap(),
            reprioritize_min_executions: default_reprioritize_min(),
        }
    }
}

fn default_rule_history_cap() -> usize {
    RULE_HISTORY_CAP
}

fn default_reprioritize_min() -> u64 {
    REPRIORITIZE_MIN_EXECUTIONS
}

/// Diagnosis coordinator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosisConfig {
    #[serde(default = "default_diagnosis_history_cap")]
    pub history_cap: usize,

    #[serde(default = "default_recommendations")]
    pub recommendations: usize,
}

impl Default for DiagnosisConfig {
    fn default() -> Self {
        Self {
            history_cap: default_diagnosis_history_cap(),
            recommendations: default_recommendations(),
        }
    }
}

fn default_diagnosis_history_cap() -> usize {
    DIAGNOSIS_HISTORY_CAP
}

fn default_recommendations() -> usize {
    TOP_RECOMMENDATIONS
}

// ----------------------------------------------------------------------------
// 5.4 Planning Configuration
// ----------------------------------------------------------------------------

/// Default priority, risk and time per action kind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionsConfig {
    #[serde(default = "default_hotfix_priority")]
    pub hotfix_priority: f64,
    #[serde(default = "default_hotfix_risk")]
    pub hotfix_risk: f64,
    #[serde(default = "default_hotfix_time")]
    pub hotfix_time_secs: f64,
    /// Time of the generic per-dimension fallback actions
    #[serde(default = "default_hotfix_generic_time")]
    pub hotfix_generic_time_secs: f64,

    #[serde(default = "default_refactor_priority")]
    pub refactor_priority: f64,
    #[serde(default = "default_refactor_risk")]
    pub refactor_risk: f64,
    #[serde(default = "default_refactor_time")]
    pub refactor_time_secs: f64,

    /// Base priority, multiplied by the strategy score
    #[serde(default = "default_redesign_priority")]
    pub redesign_priority: f64,
    #[serde(default = "default_redesign_risk")]
    pub redesign_risk: f64,
    #[serde(default = "default_redesign_time")]
    pub redesign_time_secs: f64,
    #[serde(default = "default_redesign_min_score")]
    pub redesign_min_score: f64,
    #[serde(default = "default_max_redesign_actions")]
    pub max_redesign_actions: usize,
    /// Strategies applied within this many days are penalized
    #[serde(default = "default_recency_days")]
    pub recency_days: f64,
}

impl Default for ActionsConfig {
    fn default() -> Self {
        Self {
            hotfix_priority: default_hotfix_priority(),
            hotfix_risk: default_hotfix_risk(),
            hotfix_time_secs: default_hotfix_time(),
            hotfix_generic_time_secs: default_hotfix_generic_time(),
            refactor_priority: default_refactor_priority(),
            refactor_risk: default_refactor_risk(),
            refactor_time_secs: default_refactor_time(),
            redesign_priority: default_redesign_priority(),
            redesign_risk: default_redesign_risk(),
            redesign_time_secs: default_redesign_time(),
            redesign_min_score: default_redesign_min_score(),
            max_redesign_actions: default_max_redesign_actions(),
            recency_days: default_recency_days(),
        }
    }
}

fn default_hotfix_priority() -> f64 {
    HOTFIX_PRIORITY
}
fn default_hotfix_risk() -> f64 {
    HOTFIX_RISK
}
fn default_hotfix_time() -> f64 {
    HOTFIX_TIME_SECS
}
fn default_hotfix_generic_time() -> f64 {
    HOTFIX_GENERIC_TIME_SECS
}
fn default_refactor_priority() -> f64 {
    REFACTOR_PRIORITY
}
fn default_refactor_risk() -> f64 {
    REFACTOR_RISK
}
fn default_refactor_time() -> f64 {
    REFACTOR_TIME_SECS
}
fn default_redesign_priority() -> f64 {
    REDESIGN_PRIORITY
}
fn default_redesign_risk() -> f64 {
    REDESIGN_RISK
}
fn default_redesign_time() -> f64 {
    REDESIGN_TIME_SECS
}
fn default_redesign_min_score() -> f64 {
    REDESIGN_MIN_SCORE
}
fn default_max_redesign_actions() -> usize {
    MAX_REDESIGN_ACTIONS
}
fn default_recency_days() -> f64 {
    REDESIGN_RECENCY_DAYS
}

/// Objective weights of the plan fitness function
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveWeights {
    #[serde(default = "default_weight_efficacy")]
    pub efficacy: f64,
    #[serde(default = "default_weight_risk")]
    pub risk: f64,
    #[serde(default = "default_weight_time")]
    pub time: f64,
    #[serde(default = "default_weight_resources")]
    pub resources: f64,
}

impl Default for ObjectiveWeights {
    fn default() -> Self {
        Self {
            efficacy: default_weight_efficacy(),
            risk: default_weight_risk(),
            time: default_weight_time(),
            resources: default_weight_resources(),
        }
    }
}

fn default_weight_efficacy() -> f64 {
    WEIGHT_EFFICACY
}
fn default_weight_risk() -> f64 {
    WEIGHT_RISK
}
fn default_weight_time() -> f64 {
    WEIGHT_TIME
}
fn default_weight_resources() -> f64 {
    WEIGHT_RESOURCES
}

/// Genetic optimizer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_population_size")]
    pub population_size: usize,

    #[serde(default = "default_generations")]
    pub generations: usize,

    #[serde(default = "default_mutation_rate")]
    pub mutation_rate: f64,

    #[serde(default = "default_tournament_size")]
    pub tournament_size: usize,

    #[serde(default)]
    pub weights: ObjectiveWeights,

    /// Total plan time scoring zero on the time objective
    #[serde(default = "default_time_reference")]
    pub time_reference_secs: f64,

    /// Distinct resource keys scoring zero on the resource objective
    #[serde(default = "default_resource_reference")]
    pub resource_reference: f64,

    /// RNG seed for reproducible plans (entropy when absent)
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            population_size: default_population_size(),
            generations: default_generations(),
            mutation_rate: default_mutation_rate(),
            tournament_size: default_tournament_size(),
            weights: ObjectiveWeights::default(),
            time_reference_secs: default_time_reference(),
            resource_reference: default_resource_reference(),
            seed: None,
        }
    }
}

fn default_population_size() -> usize {
    DEFAULT_POPULATION_SIZE
}
fn default_generations() -> usize {
    DEFAULT_GENERATIONS
}
fn default_mutation_rate() -> f64 {
    DEFAULT_MUTATION_RATE
}
fn default_tournament_size() -> usize {
    DEFAULT_TOURNAMENT_SIZE
}
fn default_time_reference() -> f64 {
    TIME_REFERENCE_SECS
}
fn default_resource_reference() -> f64 {
    RESOURCE_REFERENCE
}

/// Plan orchestration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanningConfig {
    /// Plans scoring below this are reported as not accepted
    #[serde(default)]
    pub min_plan_score: f64,

    #[serde(default = "default_plan_history_cap")]
    pub history_cap: usize,
}

impl Default for PlanningConfig {
    fn default() -> Self {
        Self { min_plan_score: 0.0, history_cap: default_plan_history_cap() }
    }
}

fn default_plan_history_cap() -> usize {
    PLAN_HISTORY_CAP
}

// ----------------------------------------------------------------------------
// 5.5 Collaborator & Context Configuration
// ----------------------------------------------------------------------------

/// Where samples come from in `run` mode
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaboratorConfig {
    /// `GET {metrics_url}` must return a JSON array of samples
    #[serde(default)]
    pub metrics_url: Option<String>,

    /// JSON array of samples on disk, read every cycle
    #[serde(default)]
    pub metrics_file: Option<PathBuf>,

    #[serde(default = "default_api_timeout")]
    pub api_timeout_secs: u64,
}

impl Default for CollaboratorConfig {
    fn default() -> Self {
        Self { metrics_url: None, metrics_file: None, api_timeout_secs: default_api_timeout() }
    }
}

fn default_api_timeout() -> u64 {
    DEFAULT_API_TIMEOUT_SECS
}

/// Global context entries and enrichers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Entries merged into every cycle context (e.g. `limites`)
    #[serde(default = "default_global_context")]
    pub global: ContextMap,

    /// Enrichers per dimension (`peak`, `count`)
    #[serde(default = "default_enrichers")]
    pub enrichers: BTreeMap<String, Vec<EnricherKind>>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self { global: default_global_context(), enrichers: default_enrichers() }
    }
}

fn default_global_context() -> ContextMap {
    let mut global = ContextMap::new();
    global.insert(
        "limites".into(),
        json!({
            "tempo_resposta": [0.0, 500.0],
            "taxa_erros": [0.0, 0.05],
            "uso_cpu": [0.0, 85.0],
        }),
    );
    global
}

fn default_enrichers() -> BTreeMap<String, Vec<EnricherKind>> {
    [dimensions::LATENCY, dimensions::ERRORS, dimensions::RESOURCES, dimensions::THROUGHPUT]
        .iter()
        .map(|d| (d.to_string(), vec![EnricherKind::Peak, EnricherKind::Count]))
        .collect()
}

// ----------------------------------------------------------------------------
// 5.6 Catalog Configuration
// ----------------------------------------------------------------------------

/// Declarative catalogs loaded into the registries at construction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default)]
    pub patterns: Vec<AnomalyPattern>,

    #[serde(default)]
    pub rules: Vec<RuleSpec>,

    #[serde(default)]
    pub hotfix_templates: Vec<HotfixTemplate>,

    #[serde(default)]
    pub refactor_patterns: Vec<RefactorPattern>,

    #[serde(default)]
    pub redesign_strategies: Vec<RedesignStrategy>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self::builtin()
    }
}

impl CatalogConfig {
    /// An empty catalog
    pub fn empty() -> Self {
        Self {
            patterns: Vec::new(),
            rules: Vec::new(),
            hotfix_templates: Vec::new(),
            refactor_patterns: Vec::new(),
            redesign_strategies: Vec::new(),
        }
    }

    /// The stock catalog covering latency, errors and CPU saturation
    pub fn builtin() -> Self {
        let patterns = vec![
            AnomalyPattern::new("latencia_elevada", "Latência elevada", 0.5)
                .with_dimensions(&[dimensions::LATENCY])
                .with_related_metrics(&["tempo_resposta"])
                .with_description("Tempo de resposta acima dos limites")
                .with_severity(0.7),
            AnomalyPattern::new("taxa_erros_alta", "Taxa de erros alta", 0.5)
                .with_dimensions(&[dimensions::ERRORS])
                .with_related_metrics(&["taxa_erros"])
                .with_description("Taxa de erros acima dos limites")
                .with_severity(0.9),
            AnomalyPattern::new("saturacao_cpu", "Saturação de CPU", 0.5)
                .with_dimensions(&[dimensions::RESOURCES])
                .with_related_metrics(&["uso_cpu"])
                .with_description("Uso de CPU acima dos limites")
                .with_severity(0.6),
        ];

        let rules = vec![
            RuleSpec {
                name: "latencia_critica".into(),
                description: "Latência acima de 1000ms".into(),
                condition: RuleCondition::MetricAbove { metric: "tempo_resposta".into(), threshold: 1000.0 },
                action: RuleAction::Report { message: "Latência crítica detectada".into() },
                priority: 0.9,
            },
            RuleSpec {
                name: "contagem_erros".into(),
                description: "Conta amostras da dimensão de erros".into(),
                condition: RuleCondition::DimensionPresent { dimension: dimensions::ERRORS.into() },
                action: RuleAction::CountDimension { dimension: dimensions::ERRORS.into() },
                priority: 0.5,
            },
        ];

        let hotfix_templates = vec![
            HotfixTemplate::new(
                "cache_latencia",
                "latencia_elevada",
                "Ajusta a política de cache para {anomalia_nome}",
                vec!["redis-cli CONFIG SET maxmemory-policy allkeys-lru".into()],
            )
            .with_impact(dimensions::LATENCY, 0.4),
            HotfixTemplate::new(
                "reinicio_erros",
                "taxa_erros_alta",
                "Reinicia o serviço afetado por {anomalia_nome} (confiança {confianca})",
                vec!["kubectl rollout restart deployment error-handler".into()],
            )
            .with_impact(dimensions::ERRORS, 0.5),
        ];

        let refactor_patterns = vec![RefactorPattern {
            id: "circuit_breaker".into(),
            description: "Introduz circuit breaker para {anomalia_nome}".into(),
            commands: vec!["kubectl apply -f circuit-breaker.yaml".into()],
            impact: [(dimensions::ERRORS.to_string(), 0.5), (dimensions::LATENCY.to_string(), 0.2)]
                .into_iter()
                .collect(),
            conditions: RefactorConditions {
                anomalies: vec!["taxa_erros_alta".into()],
                metrics: Vec::new(),
                context: ContextMap::new(),
            },
            required_resources: ContextMap::new(),
            priority: None,
            risk: None,
            estimated_time_secs: None,
        }];

        let redesign_strategies = vec![RedesignStrategy {
            id: "escalonamento_horizontal".into(),
            description: "Redesenha o serviço para escalonamento horizontal".into(),
            commands: vec!["kubectl apply -f hpa.yaml".into()],
            impact: [(dimensions::LATENCY.to_string(), 0.6), (dimensions::RESOURCES.to_string(), 0.4)]
                .into_iter()
                .collect(),
            target_anomalies: vec!["latencia_elevada".into(), "saturacao_cpu".into()],
            metric_trends: vec![MetricTrend {
                metric: "tempo_resposta".into(),
                direction: TrendDirectionSpec::Increasing,
            }],
            required_resources: ContextMap::new(),
            priority: None,
            risk: None,
            estimated_time_secs: None,
        }];

        Self { patterns, rules, hotfix_templates, refactor_patterns, redesign_strategies }
    }

    /// Validate probabilities and uniqueness of ids in every catalog
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut ids = AHashSet::new();
        for pattern in &self.patterns {
            if !ids.insert(pattern.id.as_str()) {
                return Err(ConfigError::invalid_value(
                    "catalog.patterns",
                    format!("duplicate pattern id '{}'", pattern.id),
                ));
            }
            pattern
                .validate()
                .map_err(|e| ConfigError::invalid_value(format!("catalog.patterns.{}", pattern.id), e.to_string()))?;
        }
        for rule in &self.rules {
            if !rule.priority.is_finite() || rule.priority < 0.0 {
                return Err(ConfigError::invalid_value(
                    format!("catalog.rules.{}", rule.name),
                    "priority must be a non-negative number",
                ));
            }
        }
        for template in &self.hotfix_templates {
            template
                .validate()
                .map_err(|e| ConfigError::invalid_value(format!("catalog.hotfix_templates.{}", template.id), e.to_string()))?;
        }
        for (id, risk, priority, time) in self
            .refactor_patterns
            .iter()
            .map(|p| (&p.id, p.risk, p.priority, p.estimated_time_secs))
            .chain(
                self.redesign_strategies
                    .iter()
                    .map(|s| (&s.id, s.risk, s.priority, s.estimated_time_secs)),
            )
        {
            for (field, value) in [("risk", risk), ("priority", priority)] {
                if let Some(v) = value {
                    check_unit(&format!("catalog.{}.{}", id, field), v)?;
                }
            }
            if let Some(t) = time {
                check_positive(&format!("catalog.{}.estimated_time_secs", id), t)?;
            }
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 5.7 Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// Structured logging with:
// - Per-component targets (cerebro::chaos, cerebro::optimizer, ...)
// - JSON, compact or pretty output
// - RUST_LOG overrides on top of the configured level
// ============================================================================

// ----------------------------------------------------------------------------
// 6.1 Logger Initialization
// ----------------------------------------------------------------------------

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> CerebroResult<()> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "info" => tracing::level_filters::LevelFilter::INFO,
        "warn" => tracing::level_filters::LevelFilter::WARN,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        _ => tracing::level_filters::LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| CerebroError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        "compact" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .compact()
                    .with_ansi(config.colors)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| CerebroError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        _ => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| CerebroError::Internal(format!("Failed to set logger: {}", e)))?;
        }
    }

    info!(
        target: "cerebro::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ----------------------------------------------------------------------------
// 6.2 Logging Macros for Engine Components
// ----------------------------------------------------------------------------

/// Log the summary of a finished diagnostic cycle
#[macro_export]
macro_rules! log_cycle {
    ($diagnosis_id:expr, $anomalies:expr, $score:expr) => {
        tracing::info!(
            target: "cerebro::cycle",
            diagnosis_id = %$diagnosis_id,
            anomalies = $anomalies,
            plan_score = $score,
            "Diagnostic cycle completed"
        )
    };
    ($diagnosis_id:expr, $anomalies:expr, $score:expr, $($field:tt)*) => {
        tracing::info!(
            target: "cerebro::cycle",
            diagnosis_id = %$diagnosis_id,
            anomalies = $anomalies,
            plan_score = $score,
            $($field)*,
            "Diagnostic cycle completed"
        )
    };
}

/// Log an isolated per-item failure
#[macro_export]
macro_rules! log_failure {
    ($failure:expr) => {
        tracing::warn!(
            target: "cerebro::failures",
            stage = %$failure.stage,
            item = %$failure.item,
            error = %$failure.error,
            "Isolated failure"
        )
    };
}

// ----------------------------------------------------------------------------
// 6.3 Performance Timer
// ----------------------------------------------------------------------------

/// A simple timer for measuring operation duration
#[derive(Debug)]
pub struct PerfTimer {
    name: &'static str,
    start: Instant,
    threshold_ms: Option<u64>,
}

impl PerfTimer {
    /// Start a new timer
    pub fn new(name: &'static str) -> Self {
        Self { name, start: Instant::now(), threshold_ms: None }
    }

    /// Start a timer with a warning threshold
    pub fn with_threshold(name: &'static str, threshold_ms: u64) -> Self {
        Self { name, start: Instant::now(), threshold_ms: Some(threshold_ms) }
    }

    /// Get elapsed time in milliseconds
    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Stop the timer and log if above threshold
    pub fn stop(self) -> u64 {
        let elapsed = self.elapsed_ms();

        if let Some(threshold) = self.threshold_ms {
            if elapsed > threshold {
                warn!(
                    target: "cerebro::perf",
                    operation = self.name,
                    elapsed_ms = elapsed,
                    threshold_ms = threshold,
                    "Operation exceeded threshold"
                );
            }
        }

        trace!(
            target: "cerebro::perf",
            operation = self.name,
            elapsed_ms = elapsed,
            "Operation completed"
        );

        elapsed
    }
}

// ============================================================================
// SECTION 7: STATISTICAL FUNCTIONS & REGRESSION
// ============================================================================
// Numerical building blocks shared by the analyzers:
// - Population moments (mean, std, skewness, excess kurtosis)
// - Ordinary least squares with R², standard error and p-value
// - Student-t tail via the regularized incomplete beta function
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 Descriptive Statistics
// ----------------------------------------------------------------------------

/// Statistical functions over plain value slices.
///
/// Moments are population moments (divide by `n`), which is what the
/// chaos baselines and window rollups are defined on.
#[derive(Debug)]
pub struct StatisticalFunctions;

impl StatisticalFunctions {
    pub fn mean(values: &[f64]) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        values.iter().sum::<f64>() / values.len() as f64
    }

    /// Population variance.
    pub fn variance(values: &[f64]) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        let mean = Self::mean(values);
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64
    }

    /// Population standard deviation.
    pub fn std_dev(values: &[f64]) -> f64 {
        Self::variance(values).sqrt()
    }

    /// Median (mean of the two central values for even lengths).
    pub fn median(values: &[f64]) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        }
    }

    /// Biased sample skewness `m3 / m2^1.5`; 0 for a flat series.
    pub fn skewness(values: &[f64]) -> f64 {
        let m2 = Self::variance(values);
        if values.is_empty() || m2 == 0.0 {
            return 0.0;
        }
        let mean = Self::mean(values);
        let m3 = values.iter().map(|v| (v - mean).powi(3)).sum::<f64>() / values.len() as f64;
        m3 / m2.powf(1.5)
    }

    /// Excess kurtosis `m4 / m2² - 3`; 0 for a flat series.
    pub fn kurtosis(values: &[f64]) -> f64 {
        let m2 = Self::variance(values);
        if values.is_empty() || m2 == 0.0 {
            return 0.0;
        }
        let mean = Self::mean(values);
        let m4 = values.iter().map(|v| (v - mean).powi(4)).sum::<f64>() / values.len() as f64;
        m4 / (m2 * m2) - 3.0
    }

    /// Pearson correlation. `None` when either series is constant or the
    /// lengths differ.
    pub fn pearson(x: &[f64], y: &[f64]) -> Option<f64> {
        if x.len() != y.len() || x.len() < 2 {
            return None;
        }
        let mean_x = Self::mean(x);
        let mean_y = Self::mean(y);
        let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
        for (xi, yi) in x.iter().zip(y) {
            let dx = xi - mean_x;
            let dy = yi - mean_y;
            sxy += dx * dy;
            sxx += dx * dx;
            syy += dy * dy;
        }
        if sxx == 0.0 || syy == 0.0 {
            return None;
        }
        Some((sxy / (sxx * syy).sqrt()).clamp(-1.0, 1.0))
    }

    /// Min-max normalization with a small guard against flat series.
    pub fn min_max_normalize(values: &[f64]) -> Vec<f64> {
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        values.iter().map(|v| (v - min) / (max - min + 1e-10)).collect()
    }

    /// Euclidean distance between two equally sized vectors.
    pub fn euclidean(a: &[f64], b: &[f64]) -> f64 {
        a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum::<f64>().sqrt()
    }

    /// Chebyshev (max-coordinate) distance.
    pub fn chebyshev(a: &[f64], b: &[f64]) -> f64 {
        a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f64::max)
    }
}

// ----------------------------------------------------------------------------
// 7.2 Linear Regression
// ----------------------------------------------------------------------------

/// Result of an ordinary least squares fit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegressionResult {
    #[serde(rename = "inclinacao")]
    pub slope: f64,
    #[serde(rename = "intercepto")]
    pub intercept: f64,
    #[serde(rename = "r2")]
    pub r_squared: f64,
    #[serde(rename = "erro_padrao")]
    pub std_err: f64,
    #[serde(rename = "p_valor")]
    pub p_value: f64,
}

impl RegressionResult {
    /// Fit reported for degenerate input.
    pub const FLAT: RegressionResult =
        RegressionResult { slope: 0.0, intercept: 0.0, r_squared: 0.0, std_err: 0.0, p_value: 1.0 };
}

/// Trend analysis functions.
#[derive(Debug)]
pub struct TrendAnalysis;

impl TrendAnalysis {
    /// Fit `y = slope·x + intercept`.
    ///
    /// The p-value is the two-sided test of zero slope under a Student-t
    /// distribution with `n - 2` degrees of freedom. Fewer than two points
    /// or a constant `x` yield [`RegressionResult::FLAT`].
    pub fn linear_regression(xs: &[f64], ys: &[f64]) -> RegressionResult {
        let n = xs.len().min(ys.len());
        if n < 2 {
            return RegressionResult::FLAT;
        }
        let (xs, ys) = (&xs[..n], &ys[..n]);
        let mean_x = StatisticalFunctions::mean(xs);
        let mean_y = StatisticalFunctions::mean(ys);

        let (mut ssxm, mut ssym, mut ssxym) = (0.0, 0.0, 0.0);
        for (x, y) in xs.iter().zip(ys) {
            let dx = x - mean_x;
            let dy = y - mean_y;
            ssxm += dx * dx;
            ssym += dy * dy;
            ssxym += dx * dy;
        }
        if ssxm == 0.0 {
            return RegressionResult { intercept: mean_y, ..RegressionResult::FLAT };
        }

        let slope = ssxym / ssxm;
        let intercept = mean_y - slope * mean_x;
        let r = if ssym == 0.0 { 0.0 } else { (ssxym / (ssxm * ssym).sqrt()).clamp(-1.0, 1.0) };
        let r_squared = r * r;

        if n == 2 {
            let p_value = if ys[0] == ys[1] { 1.0 } else { 0.0 };
            return RegressionResult { slope, intercept, r_squared, std_err: 0.0, p_value };
        }

        let df = (n - 2) as f64;
        let std_err = ((1.0 - r_squared).max(0.0) * ssym / ssxm / df).sqrt();
        let t = r * (df / ((1.0 - r) * (1.0 + r) + 1e-20)).sqrt();
        let p_value = student_t_two_sided(t, df);

        RegressionResult { slope, intercept, r_squared, std_err, p_value }
    }
}

/// Two-sided tail probability of a Student-t statistic.
fn student_t_two_sided(t: f64, df: f64) -> f64 {
    if !t.is_finite() {
        return 0.0;
    }
    let x = df / (df + t * t);
    regularized_incomplete_beta(x, df / 2.0, 0.5).clamp(0.0, 1.0)
}

/// `I_x(a, b)` via its continued fraction (Lentz's method).
fn regularized_incomplete_beta(x: f64, a: f64, b: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }
    let ln_front = ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b) + a * x.ln() + b * (1.0 - x).ln();
    let front = ln_front.exp();
    if x < (a + 1.0) / (a + b + 2.0) {
        front * beta_continued_fraction(x, a, b) / a
    } else {
        1.0 - front * beta_continued_fraction(1.0 - x, b, a) / b
    }
}

fn beta_continued_fraction(x: f64, a: f64, b: f64) -> f64 {
    const MAX_ITERATIONS: usize = 200;
    const EPS: f64 = 1e-14;
    const TINY: f64 = 1e-300;

    let qab = a + b;
    let qap = a + 1.0;
    let qam = a - 1.0;
    let mut c = 1.0;
    let mut d = 1.0 - qab * x / qap;
    if d.abs() < TINY {
        d = TINY;
    }
    d = 1.0 / d;
    let mut h = d;

    for m in 1..=MAX_ITERATIONS {
        let m = m as f64;
        let m2 = 2.0 * m;

        let aa = m * (b - m) * x / ((qam + m2) * (a + m2));
        d = 1.0 + aa * d;
        if d.abs() < TINY {
            d = TINY;
        }
        c = 1.0 + aa / c;
        if c.abs() < TINY {
            c = TINY;
        }
        d = 1.0 / d;
        h *= d * c;

        let aa = -(a + m) * (qab + m) * x / ((a + m2) * (qap + m2));
        d = 1.0 + aa * d;
        if d.abs() < TINY {
            d = TINY;
        }
        c = 1.0 + aa / c;
        if c.abs() < TINY {
            c = TINY;
        }
        d = 1.0 / d;
        let delta = d * c;
        h *= delta;
        if (delta - 1.0).abs() < EPS {
            break;
        }
    }
    h
}

/// Lanczos approximation of `ln Γ(x)` for `x > 0`.
fn ln_gamma(x: f64) -> f64 {
    const COEFFICIENTS: [f64; 6] = [
        76.180_091_729_471_46,
        -86.505_320_329_416_77,
        24.014_098_240_830_91,
        -1.231_739_572_450_155,
        0.001_208_650_973_866_179,
        -0.000_005_395_239_384_953,
    ];
    let mut y = x;
    let tmp = x + 5.5;
    let tmp = tmp - (x + 0.5) * tmp.ln();
    let mut series = 1.000_000_000_190_015;
    for c in COEFFICIENTS {
        y += 1.0;
        series += c / y;
    }
    -tmp + (2.506_628_274_631_000_5 * series / x).ln()
}

// ============================================================================
// SECTION 8: TEMPORAL AGGREGATOR
// ============================================================================
// Bounded multi-window rollups per series:
// - One FIFO per configured window, evicted against the newest sample
// - count/mean/median/min/max/std per window
// - OLS trend classification (stable / increasing / decreasing)
// ============================================================================

// ----------------------------------------------------------------------------
// 8.1 Trend Direction
// ----------------------------------------------------------------------------

/// Direction label shared by the aggregator and the gradient analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrendDirection {
    #[serde(rename = "estavel")]
    Stable,
    #[serde(rename = "crescente")]
    Increasing,
    #[serde(rename = "decrescente")]
    Decreasing,
    #[serde(rename = "acelerando")]
    Accelerating,
    #[serde(rename = "desacelerando")]
    Decelerating,
}

impl TrendDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrendDirection::Stable => "stable",
            TrendDirection::Increasing => "increasing",
            TrendDirection::Decreasing => "decreasing",
            TrendDirection::Accelerating => "accelerating",
            TrendDirection::Decelerating => "decelerating",
        }
    }

    /// Classify a slope: flat when below `epsilon`.
    pub fn of_slope(slope: f64, epsilon: f64) -> Self {
        if slope.abs() < epsilon {
            TrendDirection::Stable
        } else if slope > 0.0 {
            TrendDirection::Increasing
        } else {
            TrendDirection::Decreasing
        }
    }
}

impl Display for TrendDirection {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// 8.2 Window Results
// ----------------------------------------------------------------------------

/// Rollup of one series over one window. All optional fields are `None`
/// when the window holds no data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowStatistics {
    #[serde(rename = "contagem")]
    pub count: usize,
    #[serde(rename = "media")]
    pub mean: Option<f64>,
    #[serde(rename = "mediana")]
    pub median: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    #[serde(rename = "desvio_padrao")]
    pub std_dev: Option<f64>,
}

impl WindowStatistics {
    pub fn no_data() -> Self {
        Self { count: 0, mean: None, median: None, min: None, max: None, std_dev: None }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// OLS trend of one series over one window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrendReport {
    #[serde(rename = "direcao")]
    pub direction: TrendDirection,
    #[serde(rename = "inclinacao")]
    pub slope: f64,
    #[serde(rename = "confianca")]
    pub r_squared: f64,
    #[serde(rename = "amostras")]
    pub samples: usize,
}

// ----------------------------------------------------------------------------
// 8.3 Aggregator
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct SeriesWindows {
    newest: Option<Timestamp>,
    windows: BTreeMap<u64, VecDeque<(Timestamp, f64)>>,
}

/// Multi-window rollups keyed by `"dimension:name"`.
#[derive(Debug)]
pub struct TemporalAggregator {
    windows: Vec<u64>,
    epsilon: f64,
    min_r2: f64,
    series: DashMap<SeriesKey, SeriesWindows>,
}

impl TemporalAggregator {
    pub fn new(config: &AggregationConfig) -> Self {
        let mut windows = config.windows_secs.clone();
        windows.sort_unstable();
        windows.dedup();
        Self {
            windows,
            epsilon: config.trend_epsilon,
            min_r2: config.trend_min_r2,
            series: DashMap::new(),
        }
    }

    /// Configured window lengths, shortest first
    pub fn windows(&self) -> &[u64] {
        &self.windows
    }

    /// Add a sample to every window of its series, evicting points older
    /// than each window relative to the newest observed timestamp.
    pub fn add(&self, sample: &MetricSample) {
        let key = SeriesKey::for_sample(sample);
        let mut entry = self.series.entry(key).or_default();
        let newest = match entry.newest {
            Some(current) if current >= sample.timestamp => current,
            _ => sample.timestamp,
        };
        entry.newest = Some(newest);

        for window in &self.windows {
            let points = entry.windows.entry(*window).or_default();
            points.push_back((sample.timestamp, sample.value));
            let span = *window as f64;
            points.retain(|(ts, _)| newest.secs_since(*ts) <= span);
        }
    }

    fn window_points(&self, dimension: &str, name: &str, window: u64) -> Vec<(Timestamp, f64)> {
        self.series
            .get(&SeriesKey::new(dimension, name))
            .and_then(|entry| entry.windows.get(&window).map(|p| p.iter().copied().collect()))
            .unwrap_or_default()
    }

    /// Rollup of a series over a window
    pub fn statistics(&self, dimension: &str, name: &str, window: u64) -> WindowStatistics {
        let values: Vec<f64> = self.window_points(dimension, name, window).into_iter().map(|(_, v)| v).collect();
        if values.is_empty() {
            return WindowStatistics::no_data();
        }
        let std_dev = if values.len() > 1 { StatisticalFunctions::std_dev(&values) } else { 0.0 };
        WindowStatistics {
            count: values.len(),
            mean: Some(StatisticalFunctions::mean(&values)),
            median: Some(StatisticalFunctions::median(&values)),
            min: values.iter().copied().reduce(f64::min),
            max: values.iter().copied().reduce(f64::max),
            std_dev: Some(std_dev),
        }
    }

    /// OLS trend of a series over a window; stable with fewer than 3 points.
    pub fn trend(&self, dimension: &str, name: &str, window: u64) -> TrendReport {
        let mut points = self.window_points(dimension, name, window);
        if points.len() < MIN_TREND_POINTS {
            return TrendReport {
                direction: TrendDirection::Stable,
                slope: 0.0,
                r_squared: 0.0,
                samples: points.len(),
            };
        }
        points.sort_by_key(|(ts, _)| *ts);
        let origin = points[0].0;
        let xs: Vec<f64> = points.iter().map(|(ts, _)| ts.secs_since(origin)).collect();
        let ys: Vec<f64> = points.iter().map(|(_, v)| *v).collect();

        let fit = TrendAnalysis::linear_regression(&xs, &ys);
        let mse = xs
            .iter()
            .zip(&ys)
            .map(|(x, y)| (y - (fit.slope * x + fit.intercept)).powi(2))
            .sum::<f64>()
            / ys.len() as f64;
        let variance = StatisticalFunctions::variance(&ys);
        let r_squared = if variance > 0.0 { 1.0 - mse / variance } else { 0.0 };

        let direction = if fit.slope.abs() < self.epsilon || r_squared < self.min_r2 {
            TrendDirection::Stable
        } else {
            TrendDirection::of_slope(fit.slope, 0.0)
        };

        TrendReport { direction, slope: fit.slope, r_squared, samples: points.len() }
    }

    /// Number of tracked series
    pub fn series_count(&self) -> usize {
        self.series.len()
    }
}

// ============================================================================
// SECTION 9: GRADIENT ANALYZER
// ============================================================================
// Multi-scale slopes per series:
// - short (last W), medium (last 3W) and long (all retained) regressions
// - sliding windows stepping by O points feed a bounded snapshot history
// - acceleration and trend-change detection over the last two snapshots
// ============================================================================

// ----------------------------------------------------------------------------
// 9.1 Gradient Types
// ----------------------------------------------------------------------------

/// Gradients of one series at several scales.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GradientReport {
    #[serde(rename = "curto_prazo")]
    pub short_term: RegressionResult,
    #[serde(rename = "medio_prazo", default, skip_serializing_if = "Option::is_none")]
    pub medium_term: Option<RegressionResult>,
    #[serde(rename = "longo_prazo")]
    pub long_term: RegressionResult,
    #[serde(rename = "aceleracao", default, skip_serializing_if = "Option::is_none")]
    pub acceleration: Option<f64>,
}

/// Gradient of the most recent sliding window at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GradientSnapshot {
    /// Mean timestamp of the window (unix seconds)
    pub timestamp: f64,
    pub gradient: RegressionResult,
}

/// Outcome of trend-change detection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrendChange {
    #[serde(rename = "mudanca")]
    pub changed: bool,
    #[serde(rename = "direcao")]
    pub direction: TrendDirection,
    #[serde(rename = "confianca")]
    pub confidence: f64,
}

// ----------------------------------------------------------------------------
// 9.2 Analyzer
// ----------------------------------------------------------------------------

/// Sliding-window gradient analysis keyed by `"dimension:name"`.
#[derive(Debug)]
pub struct GradientAnalyzer {
    window: usize,
    step: usize,
    history_cap: usize,
    epsilon: f64,
    series: DashMap<SeriesKey, VecDeque<(f64, f64)>>,
    history: DashMap<SeriesKey, VecDeque<GradientSnapshot>>,
}

impl GradientAnalyzer {
    pub fn new(config: &GradientConfig) -> Self {
        Self {
            window: config.window.max(1),
            step: config.overlap.max(1),
            history_cap: config.history_cap.max(1),
            epsilon: TREND_EPSILON,
            series: DashMap::new(),
            history: DashMap::new(),
        }
    }

    /// Append a point; keeps the last `10·W` points.
    pub fn add_point(&self, key: &SeriesKey, value: f64, timestamp: Timestamp) {
        let retention = self.window * GRADIENT_RETENTION_FACTOR;
        let mut points = self.series.entry(key.clone()).or_default();
        points.push_back((timestamp.as_secs_f64(), value));
        while points.len() > retention {
            points.pop_front();
        }
    }

    pub fn point_count(&self, key: &SeriesKey) -> usize {
        self.series.get(key).map(|p| p.len()).unwrap_or(0)
    }

    fn fit(points: &[(f64, f64)]) -> RegressionResult {
        let Some(&(origin, _)) = points.first() else {
            return RegressionResult::FLAT;
        };
        let xs: Vec<f64> = points.iter().map(|(t, _)| t - origin).collect();
        let ys: Vec<f64> = points.iter().map(|(_, v)| *v).collect();
        TrendAnalysis::linear_regression(&xs, &ys)
    }

    /// Compute short/medium/long gradients and record the newest sliding
    /// window in the snapshot history. `None` until W points exist.
    pub fn compute_gradients(&self, key: &SeriesKey) -> Option<GradientReport> {
        let mut points: Vec<(f64, f64)> = {
            let series = self.series.get(key)?;
            if series.len() < self.window {
                return None;
            }
            series.iter().copied().collect()
        };
        points.sort_by(|a, b| a.0.total_cmp(&b.0));

        let w = self.window;
        let short_term = Self::fit(&points[points.len() - w..]);
        let medium_term = (points.len() >= w * MEDIUM_TERM_FACTOR)
            .then(|| Self::fit(&points[points.len() - w * MEDIUM_TERM_FACTOR..]));
        let long_term = Self::fit(&points);

        let last_start = (0..=points.len() - w).step_by(self.step).last();
        let mut history = self.history.entry(key.clone()).or_default();
        if let Some(start) = last_start {
            let window = &points[start..start + w];
            let mean_ts = window.iter().map(|(t, _)| t).sum::<f64>() / w as f64;
            history.push_back(GradientSnapshot { timestamp: mean_ts, gradient: Self::fit(window) });
            while history.len() > self.history_cap {
                history.pop_front();
            }
        }

        let acceleration = if history.len() >= 2 {
            let previous = history[history.len() - 2];
            let last = history[history.len() - 1];
            let dt = last.timestamp - previous.timestamp;
            (dt > 0.0).then(|| (last.gradient.slope - previous.gradient.slope) / dt)
        } else {
            None
        };

        Some(GradientReport { short_term, medium_term, long_term, acceleration })
    }

    /// Snapshot history of a series, oldest first
    pub fn history(&self, key: &SeriesKey) -> Vec<GradientSnapshot> {
        self.history.get(key).map(|h| h.iter().copied().collect()).unwrap_or_default()
    }

    /// Compare the two most recent snapshots.
    ///
    /// Both must reach `confidence_threshold` in R². A sign flip is a
    /// reversal, a relative slope change above 0.5 is an acceleration, and
    /// otherwise the sustained direction is reported without a change.
    pub fn detect_trend_change(&self, key: &SeriesKey, confidence_threshold: f64) -> TrendChange {
        let stable = |confidence| TrendChange { changed: false, direction: TrendDirection::Stable, confidence };

        let (previous, last) = match self.history.get(key) {
            Some(h) if h.len() >= 2 => (h[h.len() - 2].gradient, h[h.len() - 1].gradient),
            _ => return stable(0.0),
        };

        if last.r_squared < confidence_threshold || previous.r_squared < confidence_threshold {
            return stable(last.r_squared.max(previous.r_squared));
        }

        if (last.slope > 0.0 && previous.slope < 0.0) || (last.slope < 0.0 && previous.slope > 0.0) {
            let direction = if last.slope > 0.0 { TrendDirection::Increasing } else { TrendDirection::Decreasing };
            return TrendChange { changed: true, direction, confidence: last.r_squared };
        }

        let delta = (last.slope - previous.slope).abs();
        let average = (last.slope.abs() + previous.slope.abs()) / 2.0;
        if average > 0.0 && delta / average > ACCELERATION_RATIO {
            let direction = if last.slope.abs() > previous.slope.abs() {
                TrendDirection::Accelerating
            } else {
                TrendDirection::Decelerating
            };
            return TrendChange { changed: true, direction, confidence: last.r_squared };
        }

        TrendChange {
            changed: false,
            direction: TrendDirection::of_slope(last.slope, self.epsilon),
            confidence: last.r_squared,
        }
    }
}

// ============================================================================
// SECTION 10: CHAOS ANOMALY DETECTOR
// ============================================================================
// Non-linear behavior detection on reconstructed phase space:
// - delay embedding, approximate entropy, Lyapunov and correlation proxies
// - a per-series baseline captured on first evaluation
// - relative-deviation alarms against that baseline
//
// The statistics are simple heuristics, compared only against their own
// baseline.
// ============================================================================

// ----------------------------------------------------------------------------
// 10.1 Chaos Statistics
// ----------------------------------------------------------------------------

/// Statistics captured per series and compared against its baseline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChaosStatistics {
    #[serde(rename = "entropia_aproximada")]
    pub approximate_entropy: f64,
    #[serde(rename = "expoente_lyapunov")]
    pub lyapunov: f64,
    #[serde(rename = "dimensao_correlacao")]
    pub correlation_dimension: f64,
    #[serde(rename = "desvio_padrao")]
    pub std_dev: f64,
    #[serde(rename = "curtose")]
    pub kurtosis: f64,
    #[serde(rename = "assimetria")]
    pub skewness: f64,
}

impl ChaosStatistics {
    /// Named values in wire order
    pub fn entries(&self) -> [(&'static str, f64); 6] {
        [
            ("entropia_aproximada", self.approximate_entropy),
            ("expoente_lyapunov", self.lyapunov),
            ("dimensao_correlacao", self.correlation_dimension),
            ("desvio_padrao", self.std_dev),
            ("curtose", self.kurtosis),
            ("assimetria", self.skewness),
        ]
    }
}

/// Outcome of a baseline comparison. Only statistics whose baseline is
/// non-zero produce a deviation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChaosAssessment {
    #[serde(rename = "anomalia")]
    pub anomalous: bool,
    #[serde(rename = "desvios")]
    pub deviations: BTreeMap<String, f64>,
}

// ----------------------------------------------------------------------------
// 10.2 Phase-Space Heuristics
// ----------------------------------------------------------------------------

/// Delay embedding: vectors `[x_i, x_{i+delay}, ...]` of length `dim`.
/// Empty when the series is shorter than `dim·delay`.
pub fn reconstruct_phase_space(series: &[f64], dim: usize, delay: usize) -> Vec<Vec<f64>> {
    if dim == 0 || series.len() < dim * delay {
        return Vec::new();
    }
    let span = (dim - 1) * delay;
    (0..series.len() - span)
        .map(|i| (0..dim).map(|j| series[i + j * delay]).collect())
        .collect()
}

/// Approximate entropy with pattern length `m` and tolerance `r·σ`.
///
/// Quadratic pairwise counting over the z-normalized series. Points with no
/// neighbour inside the tolerance are left out of the log-mean. Returns 0
/// below `MIN_CHAOS_POINTS` or for a flat series.
pub fn approximate_entropy(series: &[f64], m: usize, r: f64) -> f64 {
    if series.len() < MIN_CHAOS_POINTS {
        return 0.0;
    }
    let std = StatisticalFunctions::std_dev(series);
    if std == 0.0 {
        return 0.0;
    }
    let mean = StatisticalFunctions::mean(series);
    let normalized: Vec<f64> = series.iter().map(|v| (v - mean) / std).collect();
    let tolerance = r * std;

    let phi = |len: usize| -> f64 {
        if normalized.len() < len + 1 {
            return 0.0;
        }
        let patterns: Vec<&[f64]> = normalized.windows(len).collect();
        let total = (patterns.len() - 1) as f64;
        let logs: Vec<f64> = patterns
            .iter()
            .enumerate()
            .filter_map(|(i, a)| {
                let count = patterns
                    .iter()
                    .enumerate()
                    .filter(|(j, b)| i != *j && StatisticalFunctions::chebyshev(a, b) <= tolerance)
                    .count();
                (count > 0).then(|| (count as f64 / total).ln())
            })
            .collect();
        StatisticalFunctions::mean(&logs)
    };

    (phi(m) - phi(m + 1)).abs()
}

/// Mean divergence rate of nearest phase-space neighbours.
///
/// Samples up to `max_pairs` random points, follows each one and its
/// nearest neighbour for up to `max_steps` steps and averages
/// `ln(d1/d0)/steps`. Pairs with a zero distance are skipped.
pub fn lyapunov_proxy<R: Rng + ?Sized>(
    series: &[f64],
    dim: usize,
    delay: usize,
    max_pairs: usize,
    max_steps: usize,
    rng: &mut R,
) -> f64 {
    if series.len() < MIN_CHAOS_POINTS {
        return 0.0;
    }
    let points = reconstruct_phase_space(series, dim, delay);
    if points.len() < 10 {
        return 0.0;
    }

    let pairs = max_pairs.min(points.len() / 2);
    let mut divergences = Vec::with_capacity(pairs);
    for _ in 0..pairs {
        let i = rng.gen_range(0..=points.len() - 2);
        let nearest = points
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i)
            .map(|(j, p)| (j, StatisticalFunctions::euclidean(&points[i], p)))
            .min_by(|a, b| a.1.total_cmp(&b.1));
        let Some((j, d0)) = nearest else {
            continue;
        };

        let steps = max_steps.min(points.len() - 1 - i.max(j));
        if steps == 0 || d0 <= 1e-10 {
            continue;
        }
        let d1 = StatisticalFunctions::euclidean(&points[i + steps], &points[j + steps]);
        if d1 > 0.0 {
            divergences.push((d1 / d0).ln() / steps as f64);
        }
    }

    StatisticalFunctions::mean(&divergences)
}

/// Box-counting estimate of the correlation dimension.
///
/// Counts pairwise phase-space distances below 10 log-spaced radii from
/// `0.01·σ` to `σ` and returns the absolute log-log slope.
pub fn correlation_dimension(series: &[f64], dim: usize, delay: usize) -> f64 {
    let points = reconstruct_phase_space(series, dim, delay);
    if points.len() <= 10 {
        return 0.0;
    }
    let mut distances = Vec::with_capacity(points.len() * (points.len() - 1) / 2);
    for i in 0..points.len() {
        for j in i + 1..points.len() {
            distances.push(StatisticalFunctions::euclidean(&points[i], &points[j]));
        }
    }
    let std = StatisticalFunctions::std_dev(series);
    let total = distances.len() as f64;

    let (log_radii, log_counts): (Vec<f64>, Vec<f64>) = (0..CORRELATION_RADII)
        .filter_map(|k| {
            let exponent = -2.0 + 2.0 * k as f64 / (CORRELATION_RADII - 1) as f64;
            let radius = 10f64.powf(exponent) * std;
            let fraction = distances.iter().filter(|d| **d < radius).count() as f64 / total;
            (fraction > 0.0).then(|| (radius.ln(), fraction.ln()))
        })
        .unzip();

    if log_radii.len() < 2 {
        return 0.0;
    }
    TrendAnalysis::linear_regression(&log_radii, &log_counts).slope.abs()
}

// ----------------------------------------------------------------------------
// 10.3 Detector
// ----------------------------------------------------------------------------

/// Per-series chaos detector with self-learned baselines.
#[derive(Debug)]
pub struct ChaosDetector {
    config: ChaosConfig,
    series: DashMap<SeriesKey, VecDeque<f64>>,
    baselines: DashMap<SeriesKey, ChaosStatistics>,
    rng: Mutex<ChaCha20Rng>,
}

impl ChaosDetector {
    pub fn new(config: &ChaosConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => ChaCha20Rng::seed_from_u64(seed),
            None => ChaCha20Rng::from_entropy(),
        };
        Self {
            config: config.clone(),
            series: DashMap::new(),
            baselines: DashMap::new(),
            rng: Mutex::new(rng),
        }
    }

    /// Append a value; keeps the last `2·window` values.
    pub fn add_point(&self, key: &SeriesKey, value: f64) {
        let retention = self.config.window * 2;
        let mut values = self.series.entry(key.clone()).or_default();
        values.push_back(value);
        while values.len() > retention {
            values.pop_front();
        }
    }

    fn recent_values(&self, key: &SeriesKey) -> Option<Vec<f64>> {
        let values = self.series.get(key)?;
        if values.len() < self.config.window {
            return None;
        }
        Some(values.iter().skip(values.len() - self.config.window).copied().collect())
    }

    /// Chaos statistics over the last `window` values; `None` until the
    /// window is full.
    pub fn statistics(&self, key: &SeriesKey) -> Option<ChaosStatistics> {
        let values = self.recent_values(key)?;
        let c = &self.config;
        let lyapunov = {
            let mut rng = self.rng.lock();
            lyapunov_proxy(&values, c.embedding_dim, c.delay, c.lyapunov_pairs, c.lyapunov_steps, &mut *rng)
        };
        Some(ChaosStatistics {
            approximate_entropy: approximate_entropy(&values, ENTROPY_PATTERN_LEN, c.entropy_tolerance),
            lyapunov,
            correlation_dimension: correlation_dimension(&values, c.embedding_dim, c.delay),
            std_dev: StatisticalFunctions::std_dev(&values),
            kurtosis: StatisticalFunctions::kurtosis(&values),
            skewness: StatisticalFunctions::skewness(&values),
        })
    }

    /// Snapshot the current statistics as the series baseline.
    pub fn set_baseline(&self, key: &SeriesKey) -> bool {
        match self.statistics(key) {
            Some(stats) => {
                self.baselines.insert(key.clone(), stats);
                info!(target: "cerebro::chaos", series = %key, "Baseline captured");
                true
            }
            None => false,
        }
    }

    pub fn baseline(&self, key: &SeriesKey) -> Option<ChaosStatistics> {
        self.baselines.get(key).map(|b| *b)
    }

    /// Compare current statistics with the baseline. The first full-window
    /// call captures the baseline and reports no anomaly.
    pub fn detect(&self, key: &SeriesKey, threshold: f64) -> ChaosAssessment {
        let Some(baseline) = self.baseline(key) else {
            self.set_baseline(key);
            return ChaosAssessment::default();
        };
        let Some(current) = self.statistics(key) else {
            return ChaosAssessment::default();
        };

        let deviations: BTreeMap<String, f64> = current
            .entries()
            .iter()
            .zip(baseline.entries().iter())
            .filter(|(_, (_, reference))| *reference != 0.0)
            .map(|((name, value), (_, reference))| (name.to_string(), (value - reference).abs() / reference.abs()))
            .collect();

        let anomalous = deviations.values().any(|d| *d > threshold);
        if anomalous {
            debug!(target: "cerebro::chaos", series = %key, ?deviations, "Chaotic deviation detected");
        }
        ChaosAssessment { anomalous, deviations }
    }

    /// Number of tracked series
    pub fn series_count(&self) -> usize {
        self.series.len()
    }
}

// ============================================================================
// SECTION 11: PHASE 1 TESTS - FOUNDATION & ANALYSIS
// ============================================================================


// ============================================================================
// SECTION 12: ADAPTIVE RULE ENGINE
// ============================================================================
// Ordered condition -> action rules:
// - declarative conditions and actions, custom ones resolved through hooks
// - priority-descending execution, stable on ties (insertion order)
// - per-rule failure isolation and a bounded execution history
// - reprioritization from observed success rates
// ============================================================================

// ----------------------------------------------------------------------------
// 12.1 Conditions, Actions & Hooks
// ----------------------------------------------------------------------------

/// When a rule fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tipo", rename_all = "snake_case")]
pub enum RuleCondition {
    /// Any sample named `metric` is strictly above `threshold`
    MetricAbove { metric: String, threshold: f64 },
    /// Any sample named `metric` is strictly below `threshold`
    MetricBelow { metric: String, threshold: f64 },
    /// At least one sample belongs to `dimension`
    DimensionPresent { dimension: String },
    /// `context[key] == value`; a missing key is an error
    ContextEquals { key: String, value: JsonValue },
    Always,
    /// Delegates to a registered [`RuleHook`]
    Custom { id: String },
}

/// What a rule does when it fires. Producing a result counts as success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tipo", rename_all = "snake_case")]
pub enum RuleAction {
    /// Emit `{key: value}`
    Annotate { key: String, value: JsonValue },
    /// Emit a fixed message
    Report { message: String },
    /// Emit the number of samples in `dimension` (no result when zero)
    CountDimension { dimension: String },
    /// Delegates to a registered [`RuleHook`]
    Custom { id: String },
}

/// Custom rule capability resolved by id.
pub trait RuleHook: Send + Sync + Debug {
    fn evaluate(&self, metrics: &[MetricSample], context: &ContextMap) -> Result<bool, RuleError>;

    fn act(&self, metrics: &[MetricSample], context: &ContextMap) -> Result<Option<JsonValue>, RuleError>;
}

type HookTable = AHashMap<String, Arc<dyn RuleHook>>;

fn lookup_hook<'a>(hooks: &'a HookTable, id: &str) -> Result<&'a Arc<dyn RuleHook>, RuleError> {
    hooks.get(id).ok_or_else(|| RuleError::UnknownHook(id.to_string()))
}

fn metric_values<'a>(
    metrics: &'a [MetricSample],
    name: &'a str,
) -> impl Iterator<Item = Result<f64, RuleError>> + 'a {
    metrics.iter().filter(move |m| m.name == name).map(|m| {
        if m.value.is_finite() {
            Ok(m.value)
        } else {
            Err(RuleError::NonFiniteMetric { metric: m.name.clone() })
        }
    })
}

impl RuleCondition {
    pub fn evaluate(&self, metrics: &[MetricSample], context: &ContextMap, hooks: &HookTable) -> Result<bool, RuleError> {
        match self {
            RuleCondition::MetricAbove { metric, threshold } => {
                let mut fired = false;
                for value in metric_values(metrics, metric) {
                    fired |= value? > *threshold;
                }
                Ok(fired)
            }
            RuleCondition::MetricBelow { metric, threshold } => {
                let mut fired = false;
                for value in metric_values(metrics, metric) {
                    fired |= value? < *threshold;
                }
                Ok(fired)
            }
            RuleCondition::DimensionPresent { dimension } => Ok(metrics.iter().any(|m| &m.dimension == dimension)),
            RuleCondition::ContextEquals { key, value } => context
                .get(key)
                .map(|current| current == value)
                .ok_or_else(|| RuleError::MissingContext(key.clone())),
            RuleCondition::Always => Ok(true),
            RuleCondition::Custom { id } => lookup_hook(hooks, id)?.evaluate(metrics, context),
        }
    }
}

impl RuleAction {
    pub fn run(
        &self,
        metrics: &[MetricSample],
        context: &ContextMap,
        hooks: &HookTable,
    ) -> Result<Option<JsonValue>, RuleError> {
        match self {
            RuleAction::Annotate { key, value } => {
                let mut object = ContextMap::new();
                object.insert(key.clone(), value.clone());
                Ok(Some(JsonValue::Object(object)))
            }
            RuleAction::Report { message } => Ok(Some(JsonValue::String(message.clone()))),
            RuleAction::CountDimension { dimension } => {
                let count = metrics.iter().filter(|m| &m.dimension == dimension).count();
                Ok((count > 0).then(|| json!({ "dimensao": dimension, "contagem": count })))
            }
            RuleAction::Custom { id } => lookup_hook(hooks, id)?.act(metrics, context),
        }
    }
}

// ----------------------------------------------------------------------------
// 12.2 Rules
// ----------------------------------------------------------------------------

/// Declarative rule definition as it appears in the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    #[serde(rename = "nome", default)]
    pub name: String,
    #[serde(rename = "descricao", default)]
    pub description: String,
    #[serde(rename = "condicao")]
    pub condition: RuleCondition,
    #[serde(rename = "acao")]
    pub action: RuleAction,
    #[serde(rename = "prioridade", default)]
    pub priority: f64,
}

/// A registered rule with its execution counters. Rules are never
/// removed; only their priority and position change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(rename = "nome")]
    pub name: String,
    #[serde(rename = "descricao")]
    pub description: String,
    #[serde(rename = "condicao")]
    pub condition: RuleCondition,
    #[serde(rename = "acao")]
    pub action: RuleAction,
    #[serde(rename = "prioridade")]
    pub priority: f64,
    #[serde(rename = "execucoes")]
    pub executions: u64,
    #[serde(rename = "sucessos")]
    pub successes: u64,
    #[serde(rename = "ultima_execucao")]
    pub last_executed: Option<Timestamp>,
}

impl Rule {
    pub fn from_spec(spec: RuleSpec) -> Self {
        Self {
            name: spec.name,
            description: spec.description,
            condition: spec.condition,
            action: spec.action,
            priority: spec.priority,
            executions: 0,
            successes: 0,
            last_executed: None,
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.executions == 0 {
            0.0
        } else {
            self.successes as f64 / self.executions as f64
        }
    }

    /// Priority after adaptation: `p·(0.8 + 0.4·rate)` once the rule has
    /// more than `min_executions` executions, unchanged otherwise.
    pub fn adapted_priority(&self, min_executions: u64) -> f64 {
        if self.executions > min_executions {
            self.priority * (0.8 + 0.4 * self.success_rate())
        } else {
            self.priority
        }
    }
}

/// One entry of the bounded execution history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleExecution {
    #[serde(rename = "regra")]
    pub rule: String,
    pub timestamp: Timestamp,
    #[serde(rename = "resultado")]
    pub success: bool,
    /// Scalar context fields at execution time
    #[serde(rename = "contexto")]
    pub context: ContextMap,
}

/// Result produced by a fired rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleOutcome {
    #[serde(rename = "regra")]
    pub rule: String,
    #[serde(rename = "resultado")]
    pub result: JsonValue,
}

/// Everything one execution pass produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleRun {
    pub outcomes: Vec<RuleOutcome>,
    pub failures: Vec<(String, RuleError)>,
}

// ----------------------------------------------------------------------------
// 12.3 Performance Report
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleStats {
    #[serde(rename = "nome")]
    pub name: String,
    #[serde(rename = "execucoes")]
    pub executions: u64,
    #[serde(rename = "sucessos")]
    pub successes: u64,
    #[serde(rename = "taxa_sucesso")]
    pub success_rate: f64,
    #[serde(rename = "ultima_execucao")]
    pub last_executed: Option<Timestamp>,
    #[serde(rename = "prioridade")]
    pub priority: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentRuleActivity {
    #[serde(rename = "total_execucoes")]
    pub total_executions: usize,
    #[serde(rename = "regras_ativas")]
    pub active_rules: usize,
    #[serde(rename = "taxa_sucesso_global")]
    pub global_success_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RulePerformance {
    #[serde(rename = "estatisticas_regras")]
    pub rules: Vec<RuleStats>,
    #[serde(rename = "analise_recente")]
    pub recent: RecentRuleActivity,
    #[serde(rename = "total_regras")]
    pub total_rules: usize,
}

// ----------------------------------------------------------------------------
// 12.4 Engine
// ----------------------------------------------------------------------------

/// Priority-ordered rule registry.
#[derive(Debug)]
pub struct RuleEngine {
    rules: RwLock<Vec<Rule>>,
    hooks: RwLock<HookTable>,
    history: Mutex<VecDeque<RuleExecution>>,
    history_cap: usize,
    min_executions: u64,
}

impl RuleEngine {
    pub fn new(config: &RulesConfig) -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            hooks: RwLock::new(AHashMap::new()),
            history: Mutex::new(VecDeque::new()),
            history_cap: config.history_cap,
            min_executions: config.reprioritize_min_executions,
        }
    }

    /// Register a rule and restore priority order. Unnamed rules get
    /// `regra_<n>`.
    pub fn add_rule(&self, mut spec: RuleSpec) {
        let mut rules = self.rules.write();
        if spec.name.is_empty() {
            spec.name = format!("regra_{}", rules.len());
        }
        info!(target: "cerebro::rules", rule = %spec.name, priority = spec.priority, "Rule registered");
        rules.push(Rule::from_spec(spec));
        Self::sort(&mut rules);
    }

    /// Register the capability behind `custom` conditions and actions.
    pub fn register_hook(&self, id: impl Into<String>, hook: Arc<dyn RuleHook>) {
        self.hooks.write().insert(id.into(), hook);
    }

    fn sort(rules: &mut [Rule]) {
        rules.sort_by(|a, b| OrderedFloat(b.priority).cmp(&OrderedFloat(a.priority)));
    }

    /// Run every rule whose condition holds, in priority order.
    ///
    /// A failing condition or action is reported for that rule only and
    /// leaves its counters untouched.
    pub fn execute(&self, metrics: &[MetricSample], context: &ContextMap) -> RuleRun {
        let hooks = self.hooks.read().clone();
        let scalars = scalar_context(context);
        let mut run = RuleRun::default();
        let mut executions = Vec::new();

        {
            let mut rules = self.rules.write();
            for rule in rules.iter_mut() {
                let fired = rule
                    .condition
                    .evaluate(metrics, context, &hooks)
                    .and_then(|holds| if holds { rule.action.run(metrics, context, &hooks).map(Some) } else { Ok(None) });

                match fired {
                    Ok(None) => {}
                    Ok(Some(result)) => {
                        let now = Timestamp::now();
                        rule.executions += 1;
                        rule.last_executed = Some(now);
                        let success = result.is_some();
                        if success {
                            rule.successes += 1;
                        }
                        executions.push(RuleExecution {
                            rule: rule.name.clone(),
                            timestamp: now,
                            success,
                            context: scalars.clone(),
                        });
                        if let Some(result) = result {
                            run.outcomes.push(RuleOutcome { rule: rule.name.clone(), result });
                        }
                    }
                    Err(e) => {
                        warn!(target: "cerebro::rules", rule = %rule.name, error = %e, "Rule failed");
                        run.failures.push((rule.name.clone(), e));
                    }
                }
            }
        }

        let mut history = self.history.lock();
        history.extend(executions);
        while history.len() > self.history_cap {
            history.pop_front();
        }

        run
    }

    /// Adapt priorities of well-exercised rules and re-sort.
    pub fn reprioritize(&self) {
        let mut rules = self.rules.write();
        for rule in rules.iter_mut() {
            rule.priority = rule.adapted_priority(self.min_executions);
        }
        Self::sort(&mut rules);
        info!(target: "cerebro::rules", rules = rules.len(), "Rule priorities adapted");
    }

    /// Rules in execution order
    pub fn rules(&self) -> Vec<Rule> {
        self.rules.read().clone()
    }

    pub fn rule(&self, name: &str) -> Result<Rule, CerebroError> {
        self.rules
            .read()
            .iter()
            .find(|r| r.name == name)
            .cloned()
            .ok_or_else(|| CerebroError::unknown_id("rule", name))
    }

    pub fn history_len(&self) -> usize {
        self.history.lock().len()
    }

    pub fn performance(&self) -> RulePerformance {
        let rules = self.rules.read();
        let stats = rules
            .iter()
            .map(|r| RuleStats {
                name: r.name.clone(),
                executions: r.executions,
                successes: r.successes,
                success_rate: r.success_rate(),
                last_executed: r.last_executed,
                priority: r.priority,
            })
            .collect();
        let total_rules = rules.len();
        drop(rules);

        let history = self.history.lock();
        let recent: Vec<&RuleExecution> = history.iter().skip(history.len().saturating_sub(RULE_REPORT_WINDOW)).collect();
        let active: AHashSet<&str> = recent.iter().map(|e| e.rule.as_str()).collect();
        let global_success_rate = if recent.is_empty() {
            0.0
        } else {
            recent.iter().filter(|e| e.success).count() as f64 / recent.len() as f64
        };

        RulePerformance {
            rules: stats,
            recent: RecentRuleActivity {
                total_executions: recent.len(),
                active_rules: active.len(),
                global_success_rate,
            },
            total_rules,
        }
    }
}

// ============================================================================
// SECTION 13: PATTERN MATCHER
// ============================================================================
// Catalog-registered anomaly patterns evaluated against a sample batch:
// - custom / z-score / ratio detectors
// - temporal-shape correlation
// - threshold-violation ratio against `context.limites`
// ============================================================================

// ----------------------------------------------------------------------------
// 13.1 Detectors
// ----------------------------------------------------------------------------

/// Detector attached to a pattern. Takes precedence over the temporal
/// shape and the limits check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tipo", rename_all = "snake_case")]
pub enum DetectorSpec {
    /// Newest value of `metric` against the mean and σ of its other values
    Zscore { metric: String, threshold: f64 },
    /// Newest `numerator` over newest `denominator`
    Ratio { numerator: String, denominator: String, threshold: f64 },
    /// Delegates to a registered [`PatternDetector`]
    Custom { id: String },
}

/// Custom pattern detector resolved by id.
pub trait PatternDetector: Send + Sync + Debug {
    fn detect(&self, metrics: &[MetricSample], context: &ContextMap) -> Result<(bool, f64), PatternError>;
}

type DetectorTable = AHashMap<String, Arc<dyn PatternDetector>>;

fn newest_values(metrics: &[MetricSample], name: &str) -> Vec<f64> {
    let mut matching: Vec<&MetricSample> = metrics.iter().filter(|m| m.name == name).collect();
    matching.sort_by_key(|m| m.timestamp);
    matching.into_iter().map(|m| m.value).collect()
}

/// Map a score against its threshold into a confidence in [0, 1].
fn scaled_confidence(score: f64, threshold: f64) -> f64 {
    (score / (2.0 * threshold)).clamp(0.0, 1.0)
}

impl DetectorSpec {
    pub fn detect(
        &self,
        metrics: &[MetricSample],
        context: &ContextMap,
        detectors: &DetectorTable,
    ) -> Result<(bool, f64), PatternError> {
        match self {
            DetectorSpec::Zscore { metric, threshold } => {
                if !(*threshold > 0.0) {
                    return Err(PatternError::InvalidParameter { param: "threshold", message: "must be positive".into() });
                }
                let mut values = newest_values(metrics, metric);
                let Some(last) = values.pop() else {
                    return Ok((false, 0.0));
                };
                let std = StatisticalFunctions::std_dev(&values);
                if values.len() < 2 || std == 0.0 {
                    return Ok((false, 0.0));
                }
                let z = (last - StatisticalFunctions::mean(&values)).abs() / std;
                Ok((z >= *threshold, scaled_confidence(z, *threshold)))
            }
            DetectorSpec::Ratio { numerator, denominator, threshold } => {
                if !(*threshold > 0.0) {
                    return Err(PatternError::InvalidParameter { param: "threshold", message: "must be positive".into() });
                }
                let (Some(num), Some(den)) =
                    (newest_values(metrics, numerator).pop(), newest_values(metrics, denominator).pop())
                else {
                    return Ok((false, 0.0));
                };
                if den == 0.0 {
                    return Err(PatternError::DetectorFailed {
                        detector: "ratio".into(),
                        message: format!("'{}' is zero", denominator),
                    });
                }
                let ratio = num / den;
                Ok((ratio >= *threshold, scaled_confidence(ratio, *threshold)))
            }
            DetectorSpec::Custom { id } => {
                let detector = detectors.get(id).ok_or_else(|| PatternError::UnknownDetector(id.clone()))?;
                let (matched, confidence) = detector.detect(metrics, context)?;
                if !(0.0..=1.0).contains(&confidence) {
                    return Err(PatternError::DetectorFailed {
                        detector: id.clone(),
                        message: format!("confidence {} outside [0, 1]", confidence),
                    });
                }
                Ok((matched, confidence))
            }
        }
    }
}

// ----------------------------------------------------------------------------
// 13.2 Anomaly Patterns
// ----------------------------------------------------------------------------

fn default_severity() -> f64 {
    0.5
}

/// A catalog-registered anomaly signature. Read-only during matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyPattern {
    pub id: String,
    #[serde(rename = "nome")]
    pub name: String,
    #[serde(rename = "dimensoes", default)]
    pub dimensions: Vec<String>,
    #[serde(rename = "metricas_relacionadas", default)]
    pub related_metrics: Vec<String>,
    #[serde(rename = "limiar_confianca")]
    pub confidence_threshold: f64,
    #[serde(rename = "padrao_temporal", default, skip_serializing_if = "Option::is_none")]
    pub temporal_shape: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detector: Option<DetectorSpec>,
    #[serde(rename = "descricao", default)]
    pub description: String,
    #[serde(rename = "severidade", default = "default_severity")]
    pub severity: f64,
}

impl AnomalyPattern {
    pub fn new(id: impl Into<String>, name: impl Into<String>, confidence_threshold: f64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            dimensions: Vec::new(),
            related_metrics: Vec::new(),
            confidence_threshold,
            temporal_shape: None,
            detector: None,
            description: String::new(),
            severity: default_severity(),
        }
    }

    pub fn with_dimensions(mut self, dimensions: &[&str]) -> Self {
        self.dimensions = dimensions.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_related_metrics(mut self, metrics: &[&str]) -> Self {
        self.related_metrics = metrics.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn with_temporal_shape(mut self, shape: Vec<f64>) -> Self {
        self.temporal_shape = Some(shape);
        self
    }

    pub fn with_detector(mut self, detector: DetectorSpec) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_severity(mut self, severity: f64) -> Self {
        self.severity = severity;
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        check_unit_interval("limiar_confianca", self.confidence_threshold)?;
        check_unit_interval("severidade", self.severity)?;
        Ok(())
    }

    /// Evaluate the pattern against a batch, surfacing detector errors.
    pub fn evaluate(
        &self,
        metrics: &[MetricSample],
        context: &ContextMap,
        detectors: &DetectorTable,
    ) -> Result<(bool, f64), PatternError> {
        if metrics.is_empty() {
            return Ok((false, 0.0));
        }
        if let Some(detector) = &self.detector {
            return detector.detect(metrics, context, detectors);
        }

        let present: AHashSet<&str> = metrics.iter().map(|m| m.name.as_str()).collect();
        if !self.related_metrics.iter().all(|m| present.contains(m.as_str())) {
            return Ok((false, 0.0));
        }
        let mut relevant: Vec<&MetricSample> =
            metrics.iter().filter(|m| self.related_metrics.contains(&m.name)).collect();

        if let Some(shape) = self.temporal_shape.as_ref().filter(|s| !s.is_empty()) {
            if relevant.len() >= shape.len() {
                relevant.sort_by_key(|m| m.timestamp);
                let values: Vec<f64> = relevant[relevant.len() - shape.len()..].iter().map(|m| m.value).collect();
                let observed = StatisticalFunctions::min_max_normalize(&values);
                let expected = StatisticalFunctions::min_max_normalize(shape);
                return Ok(match StatisticalFunctions::pearson(&observed, &expected) {
                    Some(corr) => {
                        let confidence = ((corr + 1.0) / 2.0).max(0.0);
                        (confidence >= self.confidence_threshold, confidence)
                    }
                    None => (false, 0.0),
                });
            }
        }

        if let Some(limits) = context.get("limites").and_then(JsonValue::as_object) {
            if relevant.is_empty() {
                return Ok((false, 0.0));
            }
            let mut violations = 0usize;
            for metric in &relevant {
                let Some(bounds) = limits.get(&metric.name) else {
                    continue;
                };
                let (min, max) = parse_bounds(bounds).ok_or_else(|| PatternError::InvalidParameter {
                    param: "limites",
                    message: format!("expected [min, max] for '{}'", metric.name),
                })?;
                if metric.value < min || metric.value > max {
                    violations += 1;
                }
            }
            let confidence = violations as f64 / relevant.len() as f64;
            return Ok((confidence >= self.confidence_threshold, confidence));
        }

        Ok((false, 0.0))
    }

    /// `(matched, confidence)`; any detector error degrades to `(false, 0.0)`.
    pub fn matches(&self, metrics: &[MetricSample], context: &ContextMap, detectors: &DetectorTable) -> (bool, f64) {
        self.evaluate(metrics, context, detectors).unwrap_or_else(|e| {
            warn!(target: "cerebro::patterns", pattern = %self.id, error = %e, "Pattern evaluation failed");
            (false, 0.0)
        })
    }

    /// Compact form used in diagnosis exports
    pub fn summary(&self) -> AnomalySummary {
        AnomalySummary {
            id: self.id.clone(),
            name: self.name.clone(),
            dimensions: self.dimensions.clone(),
            description: self.description.clone(),
            severity: self.severity,
        }
    }
}

fn parse_bounds(value: &JsonValue) -> Option<(f64, f64)> {
    match value.as_array()?.as_slice() {
        [min, max] => Some((min.as_f64()?, max.as_f64()?)),
        _ => None,
    }
}

// ----------------------------------------------------------------------------
// 13.3 Pattern Catalog
// ----------------------------------------------------------------------------

/// Registered patterns and custom detectors.
#[derive(Debug, Default)]
pub struct PatternCatalog {
    patterns: RwLock<Vec<AnomalyPattern>>,
    detectors: RwLock<DetectorTable>,
}

impl PatternCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pattern, replacing any pattern with the same id.
    pub fn register(&self, pattern: AnomalyPattern) -> Result<(), ValidationError> {
        pattern.validate()?;
        let mut patterns = self.patterns.write();
        info!(target: "cerebro::patterns", pattern = %pattern.id, "Anomaly pattern registered");
        match patterns.iter_mut().find(|p| p.id == pattern.id) {
            Some(existing) => *existing = pattern,
            None => patterns.push(pattern),
        }
        Ok(())
    }

    pub fn register_detector(&self, id: impl Into<String>, detector: Arc<dyn PatternDetector>) {
        self.detectors.write().insert(id.into(), detector);
    }

    pub fn get(&self, id: &str) -> Option<AnomalyPattern> {
        self.patterns.read().iter().find(|p| p.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.patterns.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evaluate every pattern. Matches come back sorted by descending
    /// confidence; evaluation errors are returned per pattern.
    pub fn evaluate_all(
        &self,
        metrics: &[MetricSample],
        context: &ContextMap,
    ) -> (Vec<DetectedAnomaly>, Vec<(String, PatternError)>) {
        let patterns = self.patterns.read().clone();
        let detectors = self.detectors.read().clone();
        let mut anomalies = Vec::new();
        let mut failures = Vec::new();

        for pattern in patterns {
            match pattern.evaluate(metrics, context, &detectors) {
                Ok((true, confidence)) => anomalies.push(DetectedAnomaly { pattern, confidence }),
                Ok((false, _)) => {}
                Err(e) => {
                    warn!(target: "cerebro::patterns", pattern = %pattern.id, error = %e, "Pattern evaluation failed");
                    failures.push((pattern.id.clone(), e));
                }
            }
        }

        anomalies.sort_by(|a, b| OrderedFloat(b.confidence).cmp(&OrderedFloat(a.confidence)));
        (anomalies, failures)
    }
}

// ============================================================================
// SECTION 14: CONTEXT PROCESSOR
// ============================================================================
// Builds the per-cycle context: global entries, cycle facts and the output
// of per-dimension enrichers. Enricher failures are isolated.
// ============================================================================

/// Built-in enrichers selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnricherKind {
    /// `pico_<dimension>`: largest value in the dimension
    Peak,
    /// `contagem_<dimension>`: number of samples in the dimension
    Count,
}

/// Adds derived entries to a cycle context for one dimension.
pub trait ContextEnricher: Send + Sync + Debug {
    fn name(&self) -> &str;

    fn enrich(&self, dimension: &str, samples: &[&MetricSample], context: &mut ContextMap) -> CerebroResult<()>;
}

#[derive(Debug)]
struct PeakEnricher;

impl ContextEnricher for PeakEnricher {
    fn name(&self) -> &str {
        "peak"
    }

    fn enrich(&self, dimension: &str, samples: &[&MetricSample], context: &mut ContextMap) -> CerebroResult<()> {
        if let Some(bad) = samples.iter().find(|s| !s.value.is_finite()) {
            return Err(ValidationError::InvalidSample { message: format!("non-finite value for '{}'", bad.name) }.into());
        }
        if let Some(peak) = samples.iter().map(|s| s.value).reduce(f64::max) {
            context.insert(format!("pico_{}", dimension), json!(peak));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct CountEnricher;

impl ContextEnricher for CountEnricher {
    fn name(&self) -> &str {
        "count"
    }

    fn enrich(&self, dimension: &str, samples: &[&MetricSample], context: &mut ContextMap) -> CerebroResult<()> {
        context.insert(format!("contagem_{}", dimension), json!(samples.len()));
        Ok(())
    }
}

impl EnricherKind {
    pub fn build(&self) -> Arc<dyn ContextEnricher> {
        match self {
            EnricherKind::Peak => Arc::new(PeakEnricher),
            EnricherKind::Count => Arc::new(CountEnricher),
        }
    }
}

/// Global context plus per-dimension enrichers.
#[derive(Debug, Default)]
pub struct ContextProcessor {
    global: RwLock<ContextMap>,
    enrichers: RwLock<BTreeMap<String, Vec<Arc<dyn ContextEnricher>>>>,
}

impl ContextProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &ContextConfig) -> Self {
        let processor = Self::new();
        for (key, value) in &config.global {
            processor.set_global(key.clone(), value.clone());
        }
        for (dimension, kinds) in &config.enrichers {
            for kind in kinds {
                processor.register_enricher(dimension.clone(), kind.build());
            }
        }
        processor
    }

    pub fn set_global(&self, key: impl Into<String>, value: JsonValue) {
        self.global.write().insert(key.into(), value);
    }

    pub fn global(&self) -> ContextMap {
        self.global.read().clone()
    }

    pub fn register_enricher(&self, dimension: impl Into<String>, enricher: Arc<dyn ContextEnricher>) {
        self.enrichers.write().entry(dimension.into()).or_default().push(enricher);
    }

    /// Global entries, `timestamp`, `num_metricas` and the output of the
    /// enrichers of every dimension present in the batch.
    pub fn build_cycle_context(&self, samples: &[MetricSample], now: Timestamp) -> (ContextMap, Vec<ItemFailure>) {
        let mut context = self.global();
        context.insert("timestamp".into(), json!(now.as_secs_f64()));
        context.insert("num_metricas".into(), json!(samples.len()));

        let mut by_dimension: BTreeMap<&str, Vec<&MetricSample>> = BTreeMap::new();
        for sample in samples {
            by_dimension.entry(sample.dimension.as_str()).or_default().push(sample);
        }

        let enrichers = self.enrichers.read().clone();
        let mut failures = Vec::new();
        for (dimension, group) in &by_dimension {
            for enricher in enrichers.get(*dimension).into_iter().flatten() {
                if let Err(e) = enricher.enrich(dimension, group, &mut context) {
                    let failure = ItemFailure::new(FailureStage::Context, format!("{}:{}", enricher.name(), dimension), &e);
                    log_failure!(failure);
                    failures.push(failure);
                }
            }
        }
        (context, failures)
    }
}

// ============================================================================
// SECTION 15: DIAGNOSIS COORDINATOR
// ============================================================================
// One diagnostic cycle over a sample batch:
// - cycle context, series feeding and rule execution
// - pattern matching ranked by confidence
// - gradient, chaos and trend maps attached to the context
// - bounded diagnosis history with JSON snapshots
// ============================================================================

// ----------------------------------------------------------------------------
// 15.1 Diagnosis
// ----------------------------------------------------------------------------

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

/// Reject snapshots written by a newer schema.
pub fn check_schema_version(found: u32) -> Result<(), ValidationError> {
    if found > SCHEMA_VERSION {
        Err(ValidationError::UnsupportedSchema { found, supported: SCHEMA_VERSION })
    } else {
        Ok(())
    }
}

/// A matched pattern and its confidence.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedAnomaly {
    pub pattern: AnomalyPattern,
    pub confidence: f64,
}

/// Exported view of a pattern inside a diagnosis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalySummary {
    pub id: String,
    #[serde(rename = "nome")]
    pub name: String,
    #[serde(rename = "dimensoes", default)]
    pub dimensions: Vec<String>,
    #[serde(rename = "descricao", default)]
    pub description: String,
    #[serde(rename = "severidade", default = "default_severity")]
    pub severity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedAnomalyRecord {
    #[serde(rename = "anomalia")]
    pub anomaly: AnomalySummary,
    #[serde(rename = "confianca")]
    pub confidence: f64,
}

/// Wire form of a [`Diagnosis`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisRecord {
    #[serde(rename = "versao_esquema", default = "default_schema_version")]
    pub schema_version: u32,
    pub id: String,
    pub timestamp: Timestamp,
    #[serde(rename = "anomalias_detectadas", default)]
    pub anomalies: Vec<DetectedAnomalyRecord>,
    #[serde(rename = "metricas_analisadas", default)]
    pub analyzed_metrics: Vec<MetricSample>,
    #[serde(rename = "causa_raiz", default)]
    pub root_cause: Option<String>,
    #[serde(rename = "confianca", default)]
    pub confidence: f64,
    #[serde(rename = "recomendacoes", default)]
    pub recommendations: Vec<String>,
    #[serde(rename = "contexto", default)]
    pub context: ContextMap,
}

/// Outcome of one diagnostic cycle. Anomalies are sorted by descending
/// confidence.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnosis {
    pub id: String,
    pub timestamp: Timestamp,
    pub anomalies: Vec<DetectedAnomaly>,
    pub analyzed_metrics: Vec<MetricSample>,
    pub root_cause: Option<String>,
    pub confidence: f64,
    pub recommendations: Vec<String>,
    pub context: ContextMap,
}

impl Diagnosis {
    pub fn top_anomaly(&self) -> Option<&DetectedAnomaly> {
        self.anomalies.first()
    }

    pub fn anomaly_ids(&self) -> AHashSet<&str> {
        self.anomalies.iter().map(|a| a.pattern.id.as_str()).collect()
    }

    pub fn to_record(&self) -> DiagnosisRecord {
        DiagnosisRecord {
            schema_version: SCHEMA_VERSION,
            id: self.id.clone(),
            timestamp: self.timestamp,
            anomalies: self
                .anomalies
                .iter()
                .map(|a| DetectedAnomalyRecord { anomaly: a.pattern.summary(), confidence: a.confidence })
                .collect(),
            analyzed_metrics: self.analyzed_metrics.clone(),
            root_cause: self.root_cause.clone(),
            confidence: self.confidence,
            recommendations: self.recommendations.clone(),
            context: self.context.clone(),
        }
    }

    /// Rebuild a diagnosis, resolving anomalies by id against `catalog`.
    /// Unknown ids are dropped.
    pub fn from_record(record: DiagnosisRecord, catalog: &PatternCatalog) -> Result<Self, ValidationError> {
        check_schema_version(record.schema_version)?;
        check_unit_interval("confianca", record.confidence)?;

        let mut anomalies = Vec::with_capacity(record.anomalies.len());
        for entry in record.anomalies {
            check_unit_interval("confianca", entry.confidence)?;
            match catalog.get(&entry.anomaly.id) {
                Some(pattern) => anomalies.push(DetectedAnomaly { pattern, confidence: entry.confidence }),
                None => warn!(
                    target: "cerebro::diagnosis",
                    diagnosis = %record.id,
                    pattern = %entry.anomaly.id,
                    "Unknown anomaly id dropped"
                ),
            }
        }

        Ok(Self {
            id: record.id,
            timestamp: record.timestamp,
            anomalies,
            analyzed_metrics: record.analyzed_metrics,
            root_cause: record.root_cause,
            confidence: record.confidence,
            recommendations: record.recommendations,
            context: record.context,
        })
    }

    pub fn to_json(&self) -> JsonValue {
        serde_json::to_value(self.to_record()).unwrap_or(JsonValue::Null)
    }
}

/// A diagnosis plus the failures isolated while producing it.
#[derive(Debug, Clone)]
pub struct DiagnosisOutcome {
    pub diagnosis: Diagnosis,
    pub failures: Vec<ItemFailure>,
}

// ----------------------------------------------------------------------------
// 15.2 Coordinator
// ----------------------------------------------------------------------------

/// Owns the analysis registries and runs diagnostic cycles.
#[derive(Debug)]
pub struct DiagnosisCoordinator {
    config: DiagnosisConfig,
    chaos_threshold: f64,
    aggregator: TemporalAggregator,
    gradients: GradientAnalyzer,
    chaos: ChaosDetector,
    rules: RuleEngine,
    patterns: PatternCatalog,
    context: ContextProcessor,
    history: Mutex<VecDeque<Diagnosis>>,
}

impl DiagnosisCoordinator {
    /// Build every registry and load the configured catalogs.
    pub fn new(config: &EngineConfig) -> CerebroResult<Self> {
        let coordinator = Self {
            config: config.diagnosis.clone(),
            chaos_threshold: config.chaos.threshold,
            aggregator: TemporalAggregator::new(&config.aggregation),
            gradients: GradientAnalyzer::new(&config.gradient),
            chaos: ChaosDetector::new(&config.chaos),
            rules: RuleEngine::new(&config.rules),
            patterns: PatternCatalog::new(),
            context: ContextProcessor::from_config(&config.context),
            history: Mutex::new(VecDeque::new()),
        };
        for pattern in &config.catalog.patterns {
            coordinator.patterns.register(pattern.clone())?;
        }
        for rule in &config.catalog.rules {
            coordinator.rules.add_rule(rule.clone());
        }
        Ok(coordinator)
    }

    pub fn aggregator(&self) -> &TemporalAggregator {
        &self.aggregator
    }

    pub fn gradients(&self) -> &GradientAnalyzer {
        &self.gradients
    }

    pub fn chaos(&self) -> &ChaosDetector {
        &self.chaos
    }

    pub fn rules(&self) -> &RuleEngine {
        &self.rules
    }

    pub fn patterns(&self) -> &PatternCatalog {
        &self.patterns
    }

    pub fn context_processor(&self) -> &ContextProcessor {
        &self.context
    }

    /// Run one diagnostic cycle. Sub-step failures are collected, never
    /// propagated.
    pub fn process(&self, samples: &[MetricSample]) -> DiagnosisOutcome {
        let timer = PerfTimer::new("diagnosis");
        let now = Timestamp::now();
        let (mut context, mut failures) = self.context.build_cycle_context(samples, now);

        let mut ordered: Vec<&MetricSample> = samples.iter().collect();
        ordered.sort_by_key(|s| s.timestamp);
        let mut keys: BTreeMap<SeriesKey, (String, String)> = BTreeMap::new();
        for sample in ordered {
            let key = SeriesKey::for_sample(sample);
            self.chaos.add_point(&key, sample.value);
            self.gradients.add_point(&key, sample.value, sample.timestamp);
            self.aggregator.add(sample);
            keys.entry(key).or_insert_with(|| (sample.dimension.clone(), sample.name.clone()));
        }

        let run = self.rules.execute(samples, &context);
        for (rule, error) in &run.failures {
            let failure = ItemFailure::new(FailureStage::Rule, rule.clone(), error);
            log_failure!(failure);
            failures.push(failure);
        }
        if !run.outcomes.is_empty() {
            context.insert("regras".into(), serde_json::to_value(&run.outcomes).unwrap_or(JsonValue::Null));
        }

        let (anomalies, pattern_failures) = self.patterns.evaluate_all(samples, &context);
        for (pattern, error) in &pattern_failures {
            let failure = ItemFailure::new(FailureStage::Pattern, pattern.clone(), error);
            log_failure!(failure);
            failures.push(failure);
        }

        let shortest_window = self.aggregator.windows().first().copied();
        let mut gradients = ContextMap::new();
        let mut chaos = ContextMap::new();
        let mut trends = ContextMap::new();
        for (key, (dimension, name)) in &keys {
            if let Some(report) = self.gradients.compute_gradients(key) {
                gradients.insert(key.to_string(), json!(report));
            }
            let assessment = self.chaos.detect(key, self.chaos_threshold);
            if assessment.anomalous {
                chaos.insert(key.to_string(), json!(assessment.deviations));
            }
            if let Some(window) = shortest_window {
                let trend = self.aggregator.trend(dimension, name, window);
                if trend.samples > 0 {
                    trends.insert(key.to_string(), json!(trend));
                }
            }
        }
        context.insert("gradientes".into(), JsonValue::Object(gradients));
        context.insert("caos".into(), JsonValue::Object(chaos));
        context.insert("tendencias".into(), JsonValue::Object(trends));

        let (root_cause, confidence) = match anomalies.first() {
            Some(top) => (Some(top.pattern.name.clone()), top.confidence),
            None => (None, 0.0),
        };
        let recommendations = anomalies
            .iter()
            .take(self.config.recommendations)
            .map(|a| format!("Investigate {} (confidence {:.2})", a.pattern.name, a.confidence))
            .collect();

        let diagnosis = Diagnosis {
            id: generate_id("diag"),
            timestamp: now,
            anomalies,
            analyzed_metrics: samples.to_vec(),
            root_cause,
            confidence,
            recommendations,
            context,
        };

        {
            let mut history = self.history.lock();
            history.push_back(diagnosis.clone());
            while history.len() > self.config.history_cap {
                history.pop_front();
            }
        }

        debug!(
            target: "cerebro::diagnosis",
            diagnosis = %diagnosis.id,
            anomalies = diagnosis.anomalies.len(),
            failures = failures.len(),
            elapsed_ms = timer.stop(),
            "Diagnosis produced"
        );
        DiagnosisOutcome { diagnosis, failures }
    }

    pub fn diagnosis(&self, id: &str) -> CerebroResult<Diagnosis> {
        self.history
            .lock()
            .iter()
            .find(|d| d.id == id)
            .cloned()
            .ok_or_else(|| CerebroError::unknown_id("diagnosis", id))
    }

    /// Retained diagnoses, oldest first
    pub fn recent_diagnoses(&self) -> Vec<Diagnosis> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn save_diagnosis(&self, diagnosis: &Diagnosis, path: &Path) -> CerebroResult<()> {
        let json = serde_json::to_string_pretty(&diagnosis.to_record())?;
        fs::write(path, json)?;
        info!(target: "cerebro::diagnosis", diagnosis = %diagnosis.id, path = %path.display(), "Diagnosis saved");
        Ok(())
    }

    pub fn load_diagnosis(&self, path: &Path) -> CerebroResult<Diagnosis> {
        let content = fs::read_to_string(path)?;
        let record: DiagnosisRecord = serde_json::from_str(&content)?;
        Ok(Diagnosis::from_record(record, &self.patterns)?)
    }
}

// ============================================================================
// SECTION 16: PHASE 2 TESTS - RULES, PATTERNS & DIAGNOSIS
// ============================================================================

#[cfg(test)]
mod diagnosis_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use rstest::{fixture, rstest};

    fn sample(name: &str, dimension: &str, value: f64, secs: i64) -> MetricSample {
        MetricSample::new(name, value, Timestamp::from_secs(secs), dimension, "u")
    }

    fn report_rule(name: &str, priority: f64) -> RuleSpec {
        RuleSpec {
            name: name.into(),
            description: String::new(),
            condition: RuleCondition::Always,
            action: RuleAction::Report { message: format!("{} fired", name) },
            priority,
        }
    }

    #[fixture]
    fn coordinator() -> DiagnosisCoordinator {
        DiagnosisCoordinator::new(&EngineConfig::default()).unwrap()
    }

    #[derive(Debug)]
    struct OverconfidentDetector;

    impl PatternDetector for OverconfidentDetector {
        fn detect(&self, _: &[MetricSample], _: &ContextMap) -> Result<(bool, f64), PatternError> {
            Ok((true, 1.5))
        }
    }

    #[derive(Debug)]
    struct BrokenEnricher;

    impl ContextEnricher for BrokenEnricher {
        fn name(&self) -> &str {
            "broken"
        }

        fn enrich(&self, _: &str, _: &[&MetricSample], _: &mut ContextMap) -> CerebroResult<()> {
            Err(CerebroError::Internal("enricher exploded".into()))
        }
    }

    #[derive(Debug)]
    struct ThresholdHook;

    impl RuleHook for ThresholdHook {
        fn evaluate(&self, metrics: &[MetricSample], _: &ContextMap) -> Result<bool, RuleError> {
            Ok(metrics.iter().any(|m| m.value > 10.0))
        }

        fn act(&self, metrics: &[MetricSample], _: &ContextMap) -> Result<Option<JsonValue>, RuleError> {
            Ok(Some(json!(metrics.len())))
        }
    }

    // ------------------------------------------------------------------------
    // Rule engine
    // ------------------------------------------------------------------------

    #[test]
    fn test_rules_run_in_priority_order_with_stable_ties() {
        let engine = RuleEngine::new(&RulesConfig::default());
        engine.add_rule(report_rule("low", 0.1));
        engine.add_rule(report_rule("first_tie", 0.5));
        engine.add_rule(report_rule("second_tie", 0.5));
        engine.add_rule(report_rule("high", 0.9));

        let run = engine.execute(&[], &ContextMap::new());
        let order: Vec<&str> = run.outcomes.iter().map(|o| o.rule.as_str()).collect();
        assert_eq!(order, vec!["high", "first_tie", "second_tie", "low"]);
    }

    #[test]
    fn test_unnamed_rule_gets_positional_name() {
        let engine = RuleEngine::new(&RulesConfig::default());
        engine.add_rule(report_rule("", 0.5));
        assert!(engine.rule("regra_0").is_ok());
        assert!(matches!(engine.rule("missing"), Err(CerebroError::UnknownId { kind: "rule", .. })));
    }

    #[test]
    fn test_failing_rule_is_isolated_and_keeps_counters() {
        let engine = RuleEngine::new(&RulesConfig::default());
        engine.add_rule(RuleSpec {
            name: "needs_context".into(),
            description: String::new(),
            condition: RuleCondition::ContextEquals { key: "ambiente".into(), value: json!("prod") },
            action: RuleAction::Report { message: "prod".into() },
            priority: 1.0,
        });
        engine.add_rule(report_rule("healthy", 0.5));

        let run = engine.execute(&[], &ContextMap::new());
        assert_eq!(run.outcomes.len(), 1);
        assert_eq!(run.failures, vec![("needs_context".to_string(), RuleError::MissingContext("ambiente".into()))]);
        assert_eq!(engine.rule("needs_context").unwrap().executions, 0);
        assert_eq!(engine.rule("healthy").unwrap().executions, 1);
    }

    #[test]
    fn test_non_finite_metric_fails_threshold_rule() {
        let engine = RuleEngine::new(&RulesConfig::default());
        engine.add_rule(RuleSpec {
            name: "cpu".into(),
            description: String::new(),
            condition: RuleCondition::MetricAbove { metric: "uso_cpu".into(), threshold: 90.0 },
            action: RuleAction::Report { message: "cpu".into() },
            priority: 0.5,
        });
        let metrics = vec![sample("uso_cpu", dimensions::RESOURCES, f64::NAN, 1)];
        let run = engine.execute(&metrics, &ContextMap::new());
        assert!(matches!(run.failures[0].1, RuleError::NonFiniteMetric { .. }));
    }

    #[test]
    fn test_custom_hooks_resolve_by_id() {
        let engine = RuleEngine::new(&RulesConfig::default());
        engine.add_rule(RuleSpec {
            name: "hooked".into(),
            description: String::new(),
            condition: RuleCondition::Custom { id: "limiar".into() },
            action: RuleAction::Custom { id: "limiar".into() },
            priority: 0.5,
        });
        let metrics = vec![sample("fila", dimensions::THROUGHPUT, 42.0, 1)];

        let run = engine.execute(&metrics, &ContextMap::new());
        assert_eq!(run.failures[0].1, RuleError::UnknownHook("limiar".into()));

        engine.register_hook("limiar", Arc::new(ThresholdHook));
        let run = engine.execute(&metrics, &ContextMap::new());
        assert_eq!(run.outcomes, vec![RuleOutcome { rule: "hooked".into(), result: json!(1) }]);
    }

    #[test]
    fn test_reprioritize_rewards_successful_rules() {
        let engine = RuleEngine::new(&RulesConfig::default());
        engine.add_rule(RuleSpec {
            name: "never_succeeds".into(),
            description: String::new(),
            condition: RuleCondition::Always,
            action: RuleAction::CountDimension { dimension: dimensions::ERRORS.into() },
            priority: 0.6,
        });
        engine.add_rule(report_rule("always_succeeds", 0.5));

        for _ in 0..11 {
            engine.execute(&[], &ContextMap::new());
        }
        engine.reprioritize();

        let rules = engine.rules();
        assert_eq!(rules[0].name, "always_succeeds");
        assert!((rules[0].priority - 0.6).abs() < 1e-12);
        assert!((rules[1].priority - 0.48).abs() < 1e-12);

        let report = engine.performance();
        assert_eq!(report.total_rules, 2);
        assert_eq!(report.recent.total_executions, 22);
        assert_eq!(report.recent.active_rules, 2);
        assert!((report.recent.global_success_rate - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_rule_history_is_capped() {
        let engine = RuleEngine::new(&RulesConfig { history_cap: 5, ..RulesConfig::default() });
        engine.add_rule(report_rule("tick", 0.5));
        for _ in 0..10 {
            engine.execute(&[], &ContextMap::new());
        }
        assert_eq!(engine.history_len(), 5);
        assert_eq!(engine.rule("tick").unwrap().executions, 10);
    }

    proptest! {
        #[test]
        fn prop_adapted_priority_is_monotone_in_success_rate(
            priority in 0.0f64..=1.0,
            executions in 11u64..500,
            a in 0.0f64..=1.0,
            b in 0.0f64..=1.0,
        ) {
            let (low, high) = if a <= b { (a, b) } else { (b, a) };
            let rule_with = |rate: f64| Rule {
                successes: (rate * executions as f64).floor() as u64,
                executions,
                ..Rule::from_spec(report_rule("r", priority))
            };
            let p_low = rule_with(low).adapted_priority(REPRIORITIZE_MIN_EXECUTIONS);
            let p_high = rule_with(high).adapted_priority(REPRIORITIZE_MIN_EXECUTIONS);
            prop_assert!(p_low <= p_high + 1e-12);
        }
    }

    // ------------------------------------------------------------------------
    // Pattern matcher
    // ------------------------------------------------------------------------

    #[test]
    fn test_temporal_shape_correlation() {
        let pattern = AnomalyPattern::new("rampa", "Rampa", 0.8)
            .with_related_metrics(&["uso_cpu"])
            .with_temporal_shape(vec![1.0, 2.0, 3.0, 4.0]);
        let detectors = DetectorTable::new();

        let rising: Vec<MetricSample> =
            [10.0, 20.0, 30.0, 40.0].iter().enumerate().map(|(i, v)| sample("uso_cpu", "recursos", *v, i as i64)).collect();
        let (matched, confidence) = pattern.matches(&rising, &ContextMap::new(), &detectors);
        assert!(matched);
        assert!((confidence - 1.0).abs() < 1e-9);

        let falling: Vec<MetricSample> =
            [40.0, 30.0, 20.0, 10.0].iter().enumerate().map(|(i, v)| sample("uso_cpu", "recursos", *v, i as i64)).collect();
        let (matched, confidence) = pattern.matches(&falling, &ContextMap::new(), &detectors);
        assert!(!matched);
        assert!(confidence.abs() < 1e-9);
    }

    #[test]
    fn test_missing_related_metric_never_matches() {
        let pattern = AnomalyPattern::new("p", "P", 0.1).with_related_metrics(&["a", "b"]);
        let metrics = vec![sample("a", "x", 1.0, 1)];
        let mut context = ContextMap::new();
        context.insert("limites".into(), json!({"a": [0.0, 0.5]}));
        assert_eq!(pattern.matches(&metrics, &context, &DetectorTable::new()), (false, 0.0));
        assert_eq!(pattern.matches(&[], &context, &DetectorTable::new()), (false, 0.0));
    }

    #[test]
    fn test_limits_violation_ratio() {
        let pattern = AnomalyPattern::new("lat", "Latência", 0.5).with_related_metrics(&["tempo_resposta"]);
        let metrics = vec![
            sample("tempo_resposta", "latencia", 100.0, 1),
            sample("tempo_resposta", "latencia", 900.0, 2),
            sample("tempo_resposta", "latencia", 950.0, 3),
            sample("tempo_resposta", "latencia", 200.0, 4),
        ];
        let mut context = ContextMap::new();
        context.insert("limites".into(), json!({"tempo_resposta": [0.0, 500.0]}));
        let (matched, confidence) = pattern.matches(&metrics, &context, &DetectorTable::new());
        assert!(matched);
        assert!((confidence - 0.5).abs() < 1e-12);

        context.insert("limites".into(), json!({"tempo_resposta": "alto"}));
        assert!(matches!(
            pattern.evaluate(&metrics, &context, &DetectorTable::new()),
            Err(PatternError::InvalidParameter { param: "limites", .. })
        ));
    }

    #[test]
    fn test_zscore_detector_flags_outlier() {
        let pattern = AnomalyPattern::new("pico", "Pico", 0.5)
            .with_detector(DetectorSpec::Zscore { metric: "fila".into(), threshold: 3.0 });
        let mut metrics: Vec<MetricSample> = [10.0, 10.5, 9.5, 10.0, 10.2]
            .iter()
            .enumerate()
            .map(|(i, v)| sample("fila", "throughput", *v, i as i64))
            .collect();
        metrics.push(sample("fila", "throughput", 50.0, 10));

        let (matched, confidence) = pattern.matches(&metrics, &ContextMap::new(), &DetectorTable::new());
        assert!(matched);
        assert_eq!(confidence, 1.0);

        metrics.pop();
        let (matched, _) = pattern.matches(&metrics, &ContextMap::new(), &DetectorTable::new());
        assert!(!matched);
    }

    #[test]
    fn test_ratio_detector_zero_denominator_degrades() {
        let pattern = AnomalyPattern::new("razao", "Razão", 0.5).with_detector(DetectorSpec::Ratio {
            numerator: "erros".into(),
            denominator: "requisicoes".into(),
            threshold: 0.1,
        });
        let metrics = vec![sample("erros", "erros", 5.0, 1), sample("requisicoes", "throughput", 0.0, 1)];
        assert!(matches!(
            pattern.evaluate(&metrics, &ContextMap::new(), &DetectorTable::new()),
            Err(PatternError::DetectorFailed { .. })
        ));
        assert_eq!(pattern.matches(&metrics, &ContextMap::new(), &DetectorTable::new()), (false, 0.0));
    }

    #[test]
    fn test_catalog_isolates_failing_detector_and_sorts_matches() {
        let catalog = PatternCatalog::new();
        catalog.register_detector("overconfident", Arc::new(OverconfidentDetector));
        catalog
            .register(AnomalyPattern::new("custom", "Custom", 0.5).with_detector(DetectorSpec::Custom { id: "overconfident".into() }))
            .unwrap();
        catalog
            .register(AnomalyPattern::new("metade", "Metade", 0.4).with_related_metrics(&["a", "b"]))
            .unwrap();
        catalog.register(AnomalyPattern::new("total", "Total", 0.4).with_related_metrics(&["a"])).unwrap();

        let metrics = vec![sample("a", "x", 10.0, 1), sample("b", "x", 0.5, 1)];
        let mut context = ContextMap::new();
        context.insert("limites".into(), json!({"a": [0.0, 1.0], "b": [0.0, 1.0]}));

        let (anomalies, failures) = catalog.evaluate_all(&metrics, &context);
        let ids: Vec<&str> = anomalies.iter().map(|a| a.pattern.id.as_str()).collect();
        assert_eq!(ids, vec!["total", "metade"]);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "custom");
    }

    #[test]
    fn test_register_replaces_same_id_and_validates() {
        let catalog = PatternCatalog::new();
        catalog.register(AnomalyPattern::new("p", "Antigo", 0.5)).unwrap();
        catalog.register(AnomalyPattern::new("p", "Novo", 0.5)).unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.get("p").unwrap().name, "Novo");
        assert!(matches!(
            catalog.register(AnomalyPattern::new("q", "Q", 1.5)),
            Err(ValidationError::OutOfRange { field: "limiar_confianca", .. })
        ));
    }

    // ------------------------------------------------------------------------
    // Context processor
    // ------------------------------------------------------------------------

    #[test]
    fn test_cycle_context_enrichment_and_isolation() {
        let processor = ContextProcessor::from_config(&ContextConfig::default());
        processor.register_enricher(dimensions::ERRORS, Arc::new(BrokenEnricher));
        let samples = vec![
            sample("tempo_resposta", dimensions::LATENCY, 120.0, 1),
            sample("tempo_resposta", dimensions::LATENCY, 480.0, 2),
            sample("taxa_erros", dimensions::ERRORS, 0.01, 2),
        ];

        let (context, failures) = processor.build_cycle_context(&samples, Timestamp::from_secs(10));
        assert_eq!(context["num_metricas"], json!(3));
        assert_eq!(context["timestamp"], json!(10.0));
        assert_eq!(context["pico_latencia"], json!(480.0));
        assert_eq!(context["contagem_latencia"], json!(2));
        assert_eq!(context["contagem_erros"], json!(1));
        assert!(context.contains_key("limites"));
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].stage, FailureStage::Context);
        assert_eq!(failures[0].item, "broken:erros");
    }

    // ------------------------------------------------------------------------
    // Coordinator
    // ------------------------------------------------------------------------

    fn slow_batch() -> Vec<MetricSample> {
        vec![
            sample("tempo_resposta", dimensions::LATENCY, 1200.0, 100),
            sample("taxa_erros", dimensions::ERRORS, 0.01, 100),
            sample("requisicoes", dimensions::THROUGHPUT, 350.0, 100),
        ]
    }

    #[rstest]
    fn test_cycle_diagnoses_latency(coordinator: DiagnosisCoordinator) {
        let outcome = coordinator.process(&slow_batch());
        let diagnosis = outcome.diagnosis;

        assert!(outcome.failures.is_empty());
        assert_eq!(diagnosis.anomalies.len(), 1);
        assert_eq!(diagnosis.anomalies[0].pattern.id, "latencia_elevada");
        assert_eq!(diagnosis.root_cause.as_deref(), Some("Latência elevada"));
        assert_eq!(diagnosis.confidence, 1.0);
        assert_eq!(diagnosis.recommendations, vec!["Investigate Latência elevada (confidence 1.00)".to_string()]);
        assert_eq!(diagnosis.analyzed_metrics.len(), 3);

        let rules = diagnosis.context["regras"].as_array().unwrap();
        assert_eq!(rules[0]["regra"], json!("latencia_critica"));
        assert_eq!(rules[1]["resultado"]["contagem"], json!(1));
        for key in ["gradientes", "caos", "tendencias", "pico_latencia"] {
            assert!(diagnosis.context.contains_key(key), "missing {}", key);
        }
    }

    #[rstest]
    fn test_empty_batch_yields_empty_diagnosis(coordinator: DiagnosisCoordinator) {
        let diagnosis = coordinator.process(&[]).diagnosis;
        assert!(diagnosis.anomalies.is_empty());
        assert_eq!(diagnosis.root_cause, None);
        assert_eq!(diagnosis.confidence, 0.0);
        assert!(diagnosis.recommendations.is_empty());
    }

    #[test]
    fn test_diagnosis_history_is_capped() {
        let mut config = EngineConfig::default();
        config.diagnosis.history_cap = 3;
        let coordinator = DiagnosisCoordinator::new(&config).unwrap();
        let ids: Vec<String> = (0..5).map(|_| coordinator.process(&slow_batch()).diagnosis.id).collect();

        assert_eq!(coordinator.recent_diagnoses().len(), 3);
        assert!(coordinator.diagnosis(&ids[4]).is_ok());
        assert!(matches!(coordinator.diagnosis(&ids[0]), Err(CerebroError::UnknownId { kind: "diagnosis", .. })));
    }

    #[rstest]
    fn test_diagnosis_round_trip_through_catalog(coordinator: DiagnosisCoordinator) {
        let diagnosis = coordinator.process(&slow_batch()).diagnosis;
        let json = serde_json::to_string(&diagnosis.to_record()).unwrap();
        let record: DiagnosisRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(record.schema_version, SCHEMA_VERSION);

        let back = Diagnosis::from_record(record.clone(), coordinator.patterns()).unwrap();
        assert_eq!(back.anomalies, diagnosis.anomalies);
        assert_eq!(back.root_cause, diagnosis.root_cause);

        let dropped = Diagnosis::from_record(record, &PatternCatalog::new()).unwrap();
        assert!(dropped.anomalies.is_empty());
    }

    #[rstest]
    fn test_diagnosis_snapshot_rejects_newer_schema(coordinator: DiagnosisCoordinator) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diagnostico.json");
        let diagnosis = coordinator.process(&slow_batch()).diagnosis;

        coordinator.save_diagnosis(&diagnosis, &path).unwrap();
        let loaded = coordinator.load_diagnosis(&path).unwrap();
        assert_eq!(loaded.id, diagnosis.id);
        assert_eq!(loaded.anomalies, diagnosis.anomalies);

        let mut value: JsonValue = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        value["versao_esquema"] = json!(SCHEMA_VERSION + 1);
        fs::write(&path, value.to_string()).unwrap();
        assert!(matches!(
            coordinator.load_diagnosis(&path),
            Err(CerebroError::Validation(ValidationError::UnsupportedSchema { .. }))
        ));
    }
}

// ============================================================================
// SECTION 17: CORRECTIVE ACTIONS & PLANS
// ============================================================================
// Validated remediation steps and the plans that group them:
// - fail-fast construction (risk, priority, impact in [0, 1], time > 0)
// - versioned JSON records that re-validate on load
// - forward-only plan lifecycle
// ============================================================================

// ----------------------------------------------------------------------------
// 17.1 Action Kinds
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    #[serde(rename = "hotfix")]
    Hotfix,
    #[serde(rename = "refatoracao")]
    Refactor,
    #[serde(rename = "redesign")]
    Redesign,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Hotfix => "hotfix",
            ActionKind::Refactor => "refatoracao",
            ActionKind::Redesign => "redesign",
        }
    }

    /// Prefix of generated action ids
    pub fn id_prefix(&self) -> &'static str {
        match self {
            ActionKind::Hotfix => "hotfix",
            ActionKind::Refactor => "refat",
            ActionKind::Redesign => "evol",
        }
    }
}

impl Display for ActionKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// 17.2 Corrective Action
// ----------------------------------------------------------------------------

/// Wire form of a [`CorrectiveAction`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub id: String,
    #[serde(rename = "tipo")]
    pub kind: ActionKind,
    #[serde(rename = "descricao")]
    pub description: String,
    #[serde(rename = "comandos", default)]
    pub commands: Vec<String>,
    #[serde(rename = "impacto_estimado", default)]
    pub estimated_impact: BTreeMap<String, f64>,
    #[serde(rename = "tempo_estimado")]
    pub estimated_time_secs: f64,
    #[serde(rename = "recursos_necessarios", default)]
    pub required_resources: ContextMap,
    #[serde(rename = "prioridade")]
    pub priority: f64,
    #[serde(rename = "dependencias", default)]
    pub dependencies: Vec<String>,
    #[serde(rename = "risco")]
    pub risk: f64,
    #[serde(rename = "reversivel")]
    pub reversible: bool,
    #[serde(rename = "contexto", default)]
    pub context: ContextMap,
}

/// One proposed remediation step. Only constructible through
/// [`CorrectiveActionBuilder::build`], which validates every bounded field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ActionRecord", into = "ActionRecord")]
pub struct CorrectiveAction {
    id: String,
    kind: ActionKind,
    description: String,
    commands: Vec<String>,
    estimated_impact: BTreeMap<String, f64>,
    estimated_time_secs: f64,
    required_resources: ContextMap,
    priority: f64,
    dependencies: Vec<String>,
    risk: f64,
    reversible: bool,
    context: ContextMap,
}

impl CorrectiveAction {
    pub fn builder(kind: ActionKind) -> CorrectiveActionBuilder {
        CorrectiveActionBuilder::new(kind)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    pub fn estimated_impact(&self) -> &BTreeMap<String, f64> {
        &self.estimated_impact
    }

    pub fn estimated_time_secs(&self) -> f64 {
        self.estimated_time_secs
    }

    pub fn required_resources(&self) -> &ContextMap {
        &self.required_resources
    }

    pub fn priority(&self) -> f64 {
        self.priority
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn risk(&self) -> f64 {
        self.risk
    }

    pub fn reversible(&self) -> bool {
        self.reversible
    }

    pub fn context(&self) -> &ContextMap {
        &self.context
    }

    /// String entry of the action context
    pub fn context_str(&self, key: &str) -> Option<&str> {
        self.context.get(key).and_then(JsonValue::as_str)
    }
}

impl TryFrom<ActionRecord> for CorrectiveAction {
    type Error = ValidationError;

    fn try_from(record: ActionRecord) -> Result<Self, Self::Error> {
        let action = Self {
            id: record.id,
            kind: record.kind,
            description: record.description,
            commands: record.commands,
            estimated_impact: record.estimated_impact,
            estimated_time_secs: record.estimated_time_secs,
            required_resources: record.required_resources,
            priority: record.priority,
            dependencies: record.dependencies,
            risk: record.risk,
            reversible: record.reversible,
            context: record.context,
        };
        action.validate()?;
        Ok(action)
    }
}

impl From<CorrectiveAction> for ActionRecord {
    fn from(action: CorrectiveAction) -> Self {
        Self {
            id: action.id,
            kind: action.kind,
            description: action.description,
            commands: action.commands,
            estimated_impact: action.estimated_impact,
            estimated_time_secs: action.estimated_time_secs,
            required_resources: action.required_resources,
            priority: action.priority,
            dependencies: action.dependencies,
            risk: action.risk,
            reversible: action.reversible,
            context: action.context,
        }
    }
}

impl CorrectiveAction {
    fn validate(&self) -> Result<(), ValidationError> {
        check_unit_interval("risco", self.risk)?;
        check_unit_interval("prioridade", self.priority)?;
        for impact in self.estimated_impact.values() {
            check_unit_interval("impacto_estimado", *impact)?;
        }
        if !(self.estimated_time_secs.is_finite() && self.estimated_time_secs > 0.0) {
            return Err(ValidationError::NonPositive { field: "tempo_estimado", value: self.estimated_time_secs });
        }
        Ok(())
    }
}

/// Builder for [`CorrectiveAction`]. Defaults: generated id, priority 0.5,
/// risk 0.5, 60 s, reversible.
#[derive(Debug, Clone)]
pub struct CorrectiveActionBuilder {
    action: CorrectiveAction,
}

impl CorrectiveActionBuilder {
    fn new(kind: ActionKind) -> Self {
        Self {
            action: CorrectiveAction {
                id: generate_id(kind.id_prefix()),
                kind,
                description: String::new(),
                commands: Vec::new(),
                estimated_impact: BTreeMap::new(),
                estimated_time_secs: 60.0,
                required_resources: ContextMap::new(),
                priority: 0.5,
                dependencies: Vec::new(),
                risk: 0.5,
                reversible: true,
                context: ContextMap::new(),
            },
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.action.id = id.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.action.description = description.into();
        self
    }

    pub fn commands(mut self, commands: Vec<String>) -> Self {
        self.action.commands = commands;
        self
    }

    pub fn impact(mut self, dimension: impl Into<String>, impact: f64) -> Self {
        self.action.estimated_impact.insert(dimension.into(), impact);
        self
    }

    pub fn impacts(mut self, impacts: BTreeMap<String, f64>) -> Self {
        self.action.estimated_impact = impacts;
        self
    }

    pub fn time_secs(mut self, secs: f64) -> Self {
        self.action.estimated_time_secs = secs;
        self
    }

    pub fn resources(mut self, resources: ContextMap) -> Self {
        self.action.required_resources = resources;
        self
    }

    pub fn priority(mut self, priority: f64) -> Self {
        self.action.priority = priority;
        self
    }

    pub fn risk(mut self, risk: f64) -> Self {
        self.action.risk = risk;
        self
    }

    pub fn dependency(mut self, id: impl Into<String>) -> Self {
        self.action.dependencies.push(id.into());
        self
    }

    pub fn reversible(mut self, reversible: bool) -> Self {
        self.action.reversible = reversible;
        self
    }

    pub fn context_entry(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.action.context.insert(key.into(), value);
        self
    }

    pub fn build(self) -> Result<CorrectiveAction, ValidationError> {
        self.action.validate()?;
        Ok(self.action)
    }
}

// ----------------------------------------------------------------------------
// 17.3 Action Plan
// ----------------------------------------------------------------------------

/// Plan lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlanStatus {
    #[serde(rename = "criado")]
    Created,
    #[serde(rename = "em_execucao")]
    InProgress,
    #[serde(rename = "concluido")]
    Completed,
    #[serde(rename = "falhou")]
    Failed,
    #[serde(rename = "cancelado")]
    Cancelled,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Created => "criado",
            PlanStatus::InProgress => "em_execucao",
            PlanStatus::Completed => "concluido",
            PlanStatus::Failed => "falhou",
            PlanStatus::Cancelled => "cancelado",
        }
    }

    /// `Created → InProgress → {Completed, Failed}`, with `Cancelled`
    /// reachable from both non-terminal states.
    pub fn can_transition_to(&self, next: PlanStatus) -> bool {
        use PlanStatus::*;
        matches!(
            (self, next),
            (Created, InProgress) | (Created, Cancelled) | (InProgress, Completed) | (InProgress, Failed) | (InProgress, Cancelled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PlanStatus::Completed | PlanStatus::Failed | PlanStatus::Cancelled)
    }
}

impl Display for PlanStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire form of an [`ActionPlan`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRecord {
    #[serde(rename = "versao_esquema", default = "default_schema_version")]
    pub schema_version: u32,
    pub id: String,
    #[serde(rename = "diagnostico_id")]
    pub diagnosis_id: String,
    #[serde(rename = "acoes", default)]
    pub actions: Vec<CorrectiveAction>,
    pub timestamp: Timestamp,
    pub score: f64,
    pub status: PlanStatus,
    #[serde(rename = "resultado", default)]
    pub result: Option<ContextMap>,
    #[serde(rename = "metricas_impactadas", default)]
    pub impacted_metrics: Vec<String>,
}

/// A scored set of corrective actions tied to one diagnosis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PlanRecord", into = "PlanRecord")]
pub struct ActionPlan {
    id: String,
    diagnosis_id: String,
    actions: Vec<CorrectiveAction>,
    timestamp: Timestamp,
    score: f64,
    status: PlanStatus,
    result: Option<ContextMap>,
    impacted_metrics: Vec<String>,
}

impl ActionPlan {
    /// New plan in `Created`. Action ids must be unique.
    pub fn new(
        diagnosis_id: impl Into<String>,
        actions: Vec<CorrectiveAction>,
        score: f64,
        impacted_metrics: Vec<String>,
    ) -> Result<Self, ValidationError> {
        let plan = Self {
            id: generate_id("plano"),
            diagnosis_id: diagnosis_id.into(),
            actions,
            timestamp: Timestamp::now(),
            score,
            status: PlanStatus::Created,
            result: None,
            impacted_metrics,
        };
        plan.validate()?;
        Ok(plan)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        check_unit_interval("score", self.score)?;
        let mut seen = AHashSet::new();
        for action in &self.actions {
            if !seen.insert(action.id()) {
                return Err(ValidationError::DuplicateActionId { id: action.id().to_string() });
            }
        }
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn diagnosis_id(&self) -> &str {
        &self.diagnosis_id
    }

    pub fn actions(&self) -> &[CorrectiveAction] {
        &self.actions
    }

    pub fn action(&self, id: &str) -> Option<&CorrectiveAction> {
        self.actions.iter().find(|a| a.id() == id)
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    pub fn status(&self) -> PlanStatus {
        self.status
    }

    pub fn result(&self) -> Option<&ContextMap> {
        self.result.as_ref()
    }

    pub fn impacted_metrics(&self) -> &[String] {
        &self.impacted_metrics
    }

    /// Move to `next`, attaching `result` when given.
    pub fn transition(&mut self, next: PlanStatus, result: Option<ContextMap>) -> Result<(), PlanError> {
        if !self.status.can_transition_to(next) {
            return Err(PlanError::InvalidTransition { from: self.status, to: next });
        }
        self.status = next;
        if result.is_some() {
            self.result = result;
        }
        Ok(())
    }

    pub fn to_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }
}

impl TryFrom<PlanRecord> for ActionPlan {
    type Error = ValidationError;

    fn try_from(record: PlanRecord) -> Result<Self, Self::Error> {
        check_schema_version(record.schema_version)?;
        let plan = Self {
            id: record.id,
            diagnosis_id: record.diagnosis_id,
            actions: record.actions,
            timestamp: record.timestamp,
            score: record.score,
            status: record.status,
            result: record.result,
            impacted_metrics: record.impacted_metrics,
        };
        plan.validate()?;
        Ok(plan)
    }
}

impl From<ActionPlan> for PlanRecord {
    fn from(plan: ActionPlan) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            id: plan.id,
            diagnosis_id: plan.diagnosis_id,
            actions: plan.actions,
            timestamp: plan.timestamp,
            score: plan.score,
            status: plan.status,
            result: plan.result,
            impacted_metrics: plan.impacted_metrics,
        }
    }
}

// ============================================================================
// SECTION 18: ACTION GENERATORS
// ============================================================================
// Three independent generators turn a diagnosis into candidate actions:
// - Hotfix: per-anomaly templates ranked by historical efficacy
// - Refactor: patterns gated on anomalies, metric comparisons and context
// - Redesign: strategies scored on anomaly overlap and gradient trends
// ============================================================================

// ----------------------------------------------------------------------------
// 18.1 Generator Seam & Placeholders
// ----------------------------------------------------------------------------

/// A source of candidate actions that learns from execution feedback.
pub trait ActionGenerator: Send + Sync + Debug {
    fn kind(&self) -> ActionKind;

    /// Candidate actions for a diagnosis plus isolated per-item failures.
    fn generate(&self, diagnosis: &Diagnosis) -> (Vec<CorrectiveAction>, Vec<ItemFailure>);

    /// Feed back the measured efficacy of an action this generator produced.
    fn record_feedback(&self, action: &CorrectiveAction, efficacy: f64);
}

/// Values for `{placeholder}` substitution: scalar context entries, then
/// `anomalia_id`, `anomalia_nome` and `confianca` of `anomaly`.
pub fn placeholder_values(anomaly: Option<&DetectedAnomaly>, context: &ContextMap) -> AHashMap<String, String> {
    let mut values: AHashMap<String, String> =
        context.iter().filter_map(|(k, v)| scalar_to_string(v).map(|s| (k.clone(), s))).collect();
    if let Some(anomaly) = anomaly {
        values.insert("anomalia_id".into(), anomaly.pattern.id.clone());
        values.insert("anomalia_nome".into(), anomaly.pattern.name.clone());
        values.insert("confianca".into(), format!("{:.2}", anomaly.confidence));
    }
    values
}

/// Replace every known `{key}`; unknown placeholders are left verbatim.
pub fn substitute_placeholders(text: &str, values: &AHashMap<String, String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}').and_then(|close| values.get(&after[..close]).map(|v| (close, v))) {
            Some((close, value)) => {
                out.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn substitute_all(commands: &[String], values: &AHashMap<String, String>) -> Vec<String> {
    commands.iter().map(|c| substitute_placeholders(c, values)).collect()
}

fn context_matches(required: &ContextMap, context: &ContextMap) -> bool {
    required.iter().all(|(key, value)| context.get(key) == Some(value))
}

fn check_optional_unit(field: &'static str, value: Option<f64>) -> Result<(), ValidationError> {
    value.map(|v| check_unit_interval(field, v)).transpose().map(|_| ())
}

fn check_optional_time(value: Option<f64>) -> Result<(), ValidationError> {
    match value {
        Some(t) if !(t.is_finite() && t > 0.0) => Err(ValidationError::NonPositive { field: "tempo_estimado", value: t }),
        _ => Ok(()),
    }
}

fn check_impacts(impact: &BTreeMap<String, f64>) -> Result<(), ValidationError> {
    impact.values().try_for_each(|v| check_unit_interval("impacto_estimado", *v).map(|_| ()))
}

// ----------------------------------------------------------------------------
// 18.2 Hotfix Generator
// ----------------------------------------------------------------------------

/// Immediate stabilization template for one anomaly pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotfixTemplate {
    pub id: String,
    #[serde(rename = "anomalia_id")]
    pub anomaly_id: String,
    #[serde(rename = "descricao", default)]
    pub description: String,
    #[serde(rename = "comandos", default)]
    pub commands: Vec<String>,
    #[serde(rename = "impacto_estimado", default)]
    pub impact: BTreeMap<String, f64>,
    /// Context entries that must be equal for the template to apply
    #[serde(rename = "condicoes", default)]
    pub conditions: ContextMap,
    /// Action ids whose efficacy scores this template
    #[serde(rename = "acoes_relacionadas", default)]
    pub related_actions: Vec<String>,
    #[serde(rename = "recursos_necessarios", default)]
    pub required_resources: ContextMap,
    #[serde(rename = "dependencias", default)]
    pub dependencies: Vec<String>,
    #[serde(rename = "prioridade", default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<f64>,
    #[serde(rename = "risco", default, skip_serializing_if = "Option::is_none")]
    pub risk: Option<f64>,
    #[serde(rename = "tempo_estimado", default, skip_serializing_if = "Option::is_none")]
    pub estimated_time_secs: Option<f64>,
    #[serde(rename = "reversivel", default = "default_true")]
    pub reversible: bool,
}

impl HotfixTemplate {
    pub fn new(
        id: impl Into<String>,
        anomaly_id: impl Into<String>,
        description: impl Into<String>,
        commands: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            anomaly_id: anomaly_id.into(),
            description: description.into(),
            commands,
            impact: BTreeMap::new(),
            conditions: ContextMap::new(),
            related_actions: Vec::new(),
            required_resources: ContextMap::new(),
            dependencies: Vec::new(),
            priority: None,
            risk: None,
            estimated_time_secs: None,
            reversible: true,
        }
    }

    pub fn with_impact(mut self, dimension: &str, impact: f64) -> Self {
        self.impact.insert(dimension.to_string(), impact);
        self
    }

    pub fn with_condition(mut self, key: &str, value: JsonValue) -> Self {
        self.conditions.insert(key.to_string(), value);
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        check_impacts(&self.impact)?;
        check_optional_unit("prioridade", self.priority)?;
        check_optional_unit("risco", self.risk)?;
        check_optional_time(self.estimated_time_secs)
    }
}

/// Latest efficacy observed for an action or template id.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EfficacyRecord {
    #[serde(rename = "eficacia")]
    pub efficacy: f64,
    pub timestamp: Timestamp,
}

/// Commands and impact of the generic fallback for one dimension.
fn generic_hotfix(dimension: &str) -> Option<(&'static str, f64)> {
    match dimension {
        dimensions::THROUGHPUT => Some(("kubectl scale deployment app-service --replicas=3", 0.3)),
        dimensions::ERRORS => Some(("kubectl rollout restart deployment error-handler", 0.4)),
        dimensions::LATENCY => Some(("redis-cli CONFIG SET maxmemory-policy allkeys-lru", 0.3)),
        dimensions::RESOURCES => Some((
            "kubectl set resources deployment resource-intensive-app --limits=cpu=2,memory=4Gi",
            0.5,
        )),
        _ => None,
    }
}

const GENERIC_MONITOR_COMMAND: &str = "echo 'Ação genérica: monitorar sistema'";

/// Immediate stabilization actions, one per detected anomaly.
#[derive(Debug)]
pub struct HotfixGenerator {
    config: ActionsConfig,
    templates: RwLock<BTreeMap<String, Vec<HotfixTemplate>>>,
    efficacy: RwLock<AHashMap<String, EfficacyRecord>>,
    rng: Mutex<ChaCha20Rng>,
}

impl HotfixGenerator {
    pub fn new(config: &ActionsConfig, seed: Option<u64>) -> Self {
        Self {
            config: config.clone(),
            templates: RwLock::new(BTreeMap::new()),
            efficacy: RwLock::new(AHashMap::new()),
            rng: Mutex::new(seed.map_or_else(ChaCha20Rng::from_entropy, ChaCha20Rng::seed_from_u64)),
        }
    }

    pub fn register_template(&self, template: HotfixTemplate) -> Result<(), ValidationError> {
        template.validate()?;
        info!(target: "cerebro::hotfix", template = %template.id, anomaly = %template.anomaly_id, "Hotfix template registered");
        self.templates.write().entry(template.anomaly_id.clone()).or_default().push(template);
        Ok(())
    }

    pub fn template_count(&self) -> usize {
        self.templates.read().values().map(Vec::len).sum()
    }

    /// Record the efficacy of an action or template id. The latest value wins.
    pub fn record_efficacy(&self, id: impl Into<String>, efficacy: f64) -> Result<(), ValidationError> {
        check_unit_interval("eficacia", efficacy)?;
        self.efficacy.write().insert(id.into(), EfficacyRecord { efficacy, timestamp: Timestamp::now() });
        Ok(())
    }

    pub fn efficacy(&self, id: &str) -> Option<f64> {
        self.efficacy.read().get(id).map(|r| r.efficacy)
    }

    /// Score: `-1` when conditions do not hold, else the mean efficacy of
    /// the template and its related actions (0.5 without history).
    fn template_score(&self, template: &HotfixTemplate, context: &ContextMap) -> f64 {
        if !context_matches(&template.conditions, context) {
            return -1.0;
        }
        let efficacy = self.efficacy.read();
        let observed: Vec<f64> = std::iter::once(&template.id)
            .chain(template.related_actions.iter())
            .filter_map(|id| efficacy.get(id).map(|r| r.efficacy))
            .collect();
        if observed.is_empty() {
            DEFAULT_TEMPLATE_EFFICACY
        } else {
            StatisticalFunctions::mean(&observed)
        }
    }

    /// Best template for an anomaly; ties are broken at random.
    pub fn select_template(&self, anomaly_id: &str, context: &ContextMap) -> Option<HotfixTemplate> {
        let templates = self.templates.read().get(anomaly_id).cloned()?;
        if templates.len() == 1 {
            return templates.into_iter().next();
        }
        let scores: Vec<f64> = templates.iter().map(|t| self.template_score(t, context)).collect();
        let best = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if best < 0.0 {
            return None;
        }
        let tied: Vec<usize> = scores.iter().enumerate().filter(|(_, s)| **s == best).map(|(i, _)| i).collect();
        let chosen = *tied.choose(&mut *self.rng.lock())?;
        templates.into_iter().nth(chosen)
    }

    fn fill_template(
        &self,
        template: &HotfixTemplate,
        anomaly: &DetectedAnomaly,
        diagnosis: &Diagnosis,
    ) -> Result<CorrectiveAction, ValidationError> {
        let values = placeholder_values(Some(anomaly), &diagnosis.context);
        let mut builder = CorrectiveAction::builder(ActionKind::Hotfix)
            .description(substitute_placeholders(&template.description, &values))
            .commands(substitute_all(&template.commands, &values))
            .impacts(template.impact.clone())
            .time_secs(template.estimated_time_secs.unwrap_or(self.config.hotfix_time_secs))
            .resources(template.required_resources.clone())
            .priority(template.priority.unwrap_or(self.config.hotfix_priority))
            .risk(template.risk.unwrap_or(self.config.hotfix_risk))
            .reversible(template.reversible)
            .context_entry("diagnostico_id", json!(diagnosis.id))
            .context_entry("template_id", json!(template.id))
            .context_entry("anomalia_id", json!(anomaly.pattern.id))
            .context_entry("timestamp", json!(Timestamp::now().as_secs_f64()));
        for dependency in &template.dependencies {
            builder = builder.dependency(dependency.clone());
        }
        builder.build()
    }

    fn generic_action(&self, anomaly: &DetectedAnomaly, diagnosis: &Diagnosis) -> Result<CorrectiveAction, ValidationError> {
        let mut builder = CorrectiveAction::builder(ActionKind::Hotfix)
            .id(generate_id("hotfix_gen"))
            .description(format!("Estabilização imediata para {}", anomaly.pattern.name))
            .time_secs(self.config.hotfix_generic_time_secs)
            .priority(self.config.hotfix_priority)
            .risk(self.config.hotfix_risk)
            .reversible(true)
            .context_entry("diagnostico_id", json!(diagnosis.id))
            .context_entry("anomalia_id", json!(anomaly.pattern.id))
            .context_entry("confianca", json!(anomaly.confidence))
            .context_entry("timestamp", json!(Timestamp::now().as_secs_f64()))
            .context_entry("generica", json!(true));

        let mut commands = Vec::new();
        for dimension in &anomaly.pattern.dimensions {
            if let Some((command, impact)) = generic_hotfix(dimension) {
                commands.push(command.to_string());
                builder = builder.impact(dimension.clone(), impact);
            }
        }
        if commands.is_empty() {
            commands.push(GENERIC_MONITOR_COMMAND.to_string());
        }
        builder.commands(commands).build()
    }
}

impl ActionGenerator for HotfixGenerator {
    fn kind(&self) -> ActionKind {
        ActionKind::Hotfix
    }

    fn generate(&self, diagnosis: &Diagnosis) -> (Vec<CorrectiveAction>, Vec<ItemFailure>) {
        let mut actions = Vec::new();
        let mut failures = Vec::new();
        for anomaly in &diagnosis.anomalies {
            let built = match self.select_template(&anomaly.pattern.id, &diagnosis.context) {
                Some(template) => self.fill_template(&template, anomaly, diagnosis),
                None => self.generic_action(anomaly, diagnosis),
            };
            match built {
                Ok(action) => actions.push(action),
                Err(e) => {
                    let failure = ItemFailure::new(FailureStage::Generate, format!("hotfix:{}", anomaly.pattern.id), e);
                    log_failure!(failure);
                    failures.push(failure);
                }
            }
        }
        debug!(target: "cerebro::hotfix", diagnosis = %diagnosis.id, actions = actions.len(), "Hotfixes generated");
        (actions, failures)
    }

    fn record_feedback(&self, action: &CorrectiveAction, efficacy: f64) {
        let mut ids = vec![action.id().to_string()];
        if let Some(template) = action.context_str("template_id") {
            ids.push(template.to_string());
        }
        for id in ids {
            if let Err(e) = self.record_efficacy(id, efficacy) {
                warn!(target: "cerebro::hotfix", action = %action.id(), error = %e, "Efficacy rejected");
            }
        }
    }
}

// ----------------------------------------------------------------------------
// 18.3 Refactor Engine
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComparisonOp {
    Gt,
    Lt,
    Eq,
    Ne,
}

impl ComparisonOp {
    pub fn holds(&self, left: f64, right: f64) -> bool {
        match self {
            ComparisonOp::Gt => left > right,
            ComparisonOp::Lt => left < right,
            ComparisonOp::Eq => left == right,
            ComparisonOp::Ne => left != right,
        }
    }
}

/// `metric <operator> value`, checked against the first sample of that name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricCondition {
    #[serde(rename = "nome")]
    pub metric: String,
    #[serde(rename = "operador")]
    pub operator: ComparisonOp,
    #[serde(rename = "valor")]
    pub value: f64,
}

/// Every declared condition must hold for a pattern to apply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RefactorConditions {
    #[serde(rename = "anomalias", default)]
    pub anomalies: Vec<String>,
    #[serde(rename = "metricas", default)]
    pub metrics: Vec<MetricCondition>,
    #[serde(rename = "contexto", default)]
    pub context: ContextMap,
}

impl RefactorConditions {
    pub fn hold_for(&self, diagnosis: &Diagnosis) -> bool {
        let detected = diagnosis.anomaly_ids();
        if !self.anomalies.iter().all(|a| detected.contains(a.as_str())) {
            return false;
        }
        let metrics_hold = self.metrics.iter().all(|condition| {
            diagnosis
                .analyzed_metrics
                .iter()
                .find(|m| m.name == condition.metric)
                .is_some_and(|m| condition.operator.holds(m.value, condition.value))
        });
        metrics_hold && context_matches(&self.context, &diagnosis.context)
    }
}

/// Medium-term structural change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefactorPattern {
    pub id: String,
    #[serde(rename = "descricao", default)]
    pub description: String,
    #[serde(rename = "comandos", default)]
    pub commands: Vec<String>,
    #[serde(rename = "impacto_estimado", default)]
    pub impact: BTreeMap<String, f64>,
    #[serde(rename = "condicoes", default)]
    pub conditions: RefactorConditions,
    #[serde(rename = "recursos_necessarios", default)]
    pub required_resources: ContextMap,
    #[serde(rename = "prioridade", default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<f64>,
    #[serde(rename = "risco", default, skip_serializing_if = "Option::is_none")]
    pub risk: Option<f64>,
    #[serde(rename = "tempo_estimado", default, skip_serializing_if = "Option::is_none")]
    pub estimated_time_secs: Option<f64>,
}

impl RefactorPattern {
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_impacts(&self.impact)?;
        check_optional_unit("prioridade", self.priority)?;
        check_optional_unit("risco", self.risk)?;
        check_optional_time(self.estimated_time_secs)
    }
}

/// One entry of a generator's application history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationRecord {
    /// Pattern or strategy id
    #[serde(rename = "origem")]
    pub source: String,
    #[serde(rename = "resultado")]
    pub result: JsonValue,
    pub timestamp: Timestamp,
}

fn push_bounded(history: &mut VecDeque<ApplicationRecord>, record: ApplicationRecord) {
    history.push_back(record);
    while history.len() > APPLICATION_HISTORY_CAP {
        history.pop_front();
    }
}

/// Medium-term restructuring actions, one per applicable pattern.
#[derive(Debug)]
pub struct RefactorEngine {
    config: ActionsConfig,
    patterns: RwLock<Vec<RefactorPattern>>,
    applications: Mutex<VecDeque<ApplicationRecord>>,
}

impl RefactorEngine {
    pub fn new(config: &ActionsConfig) -> Self {
        Self {
            config: config.clone(),
            patterns: RwLock::new(Vec::new()),
            applications: Mutex::new(VecDeque::new()),
        }
    }

    /// Register a pattern, replacing any pattern with the same id.
    pub fn register_pattern(&self, pattern: RefactorPattern) -> Result<(), ValidationError> {
        pattern.validate()?;
        info!(target: "cerebro::refactor", pattern = %pattern.id, "Refactor pattern registered");
        let mut patterns = self.patterns.write();
        match patterns.iter_mut().find(|p| p.id == pattern.id) {
            Some(existing) => *existing = pattern,
            None => patterns.push(pattern),
        }
        Ok(())
    }

    pub fn record_application(&self, pattern: impl Into<String>, result: JsonValue) {
        push_bounded(
            &mut self.applications.lock(),
            ApplicationRecord { source: pattern.into(), result, timestamp: Timestamp::now() },
        );
    }

    /// Application history, oldest first
    pub fn applications(&self) -> Vec<ApplicationRecord> {
        self.applications.lock().iter().cloned().collect()
    }

    /// Ids of the patterns whose conditions all hold
    pub fn applicable_patterns(&self, diagnosis: &Diagnosis) -> Vec<String> {
        self.patterns
            .read()
            .iter()
            .filter(|p| p.conditions.hold_for(diagnosis))
            .map(|p| p.id.clone())
            .collect()
    }

    fn build_action(&self, pattern: &RefactorPattern, diagnosis: &Diagnosis) -> Result<CorrectiveAction, ValidationError> {
        let values = placeholder_values(diagnosis.top_anomaly(), &diagnosis.context);
        CorrectiveAction::builder(ActionKind::Refactor)
            .description(substitute_placeholders(&pattern.description, &values))
            .commands(substitute_all(&pattern.commands, &values))
            .impacts(pattern.impact.clone())
            .time_secs(pattern.estimated_time_secs.unwrap_or(self.config.refactor_time_secs))
            .resources(pattern.required_resources.clone())
            .priority(pattern.priority.unwrap_or(self.config.refactor_priority))
            .risk(pattern.risk.unwrap_or(self.config.refactor_risk))
            .reversible(true)
            .context_entry("diagnostico_id", json!(diagnosis.id))
            .context_entry("padrao", json!(pattern.id))
            .context_entry("timestamp", json!(Timestamp::now().as_secs_f64()))
            .build()
    }
}

impl ActionGenerator for RefactorEngine {
    fn kind(&self) -> ActionKind {
        ActionKind::Refactor
    }

    fn generate(&self, diagnosis: &Diagnosis) -> (Vec<CorrectiveAction>, Vec<ItemFailure>) {
        let patterns: Vec<RefactorPattern> =
            self.patterns.read().iter().filter(|p| p.conditions.hold_for(diagnosis)).cloned().collect();
        let mut actions = Vec::new();
        let mut failures = Vec::new();
        for pattern in &patterns {
            match self.build_action(pattern, diagnosis) {
                Ok(action) => actions.push(action),
                Err(e) => {
                    let failure = ItemFailure::new(FailureStage::Generate, format!("refactor:{}", pattern.id), e);
                    log_failure!(failure);
                    failures.push(failure);
                }
            }
        }
        (actions, failures)
    }

    fn record_feedback(&self, action: &CorrectiveAction, efficacy: f64) {
        if let Some(pattern) = action.context_str("padrao") {
            self.record_application(pattern, json!({ "acao_id": action.id(), "eficacia": efficacy }));
        }
    }
}

// ----------------------------------------------------------------------------
// 18.4 Redesign Planner
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrendDirectionSpec {
    #[serde(rename = "crescente", alias = "increasing")]
    Increasing,
    #[serde(rename = "decrescente", alias = "decreasing")]
    Decreasing,
}

impl TrendDirectionSpec {
    /// Both slopes share the declared sign
    pub fn matches(&self, short_slope: f64, medium_slope: f64) -> bool {
        match self {
            TrendDirectionSpec::Increasing => short_slope > 0.0 && medium_slope > 0.0,
            TrendDirectionSpec::Decreasing => short_slope < 0.0 && medium_slope < 0.0,
        }
    }
}

/// A metric whose gradients must move in `direction`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricTrend {
    #[serde(rename = "metrica")]
    pub metric: String,
    #[serde(rename = "direcao")]
    pub direction: TrendDirectionSpec,
}

/// Long-term architectural change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedesignStrategy {
    pub id: String,
    #[serde(rename = "descricao", default)]
    pub description: String,
    #[serde(rename = "comandos", default)]
    pub commands: Vec<String>,
    #[serde(rename = "impacto_estimado", default)]
    pub impact: BTreeMap<String, f64>,
    #[serde(rename = "anomalias_alvo", default)]
    pub target_anomalies: Vec<String>,
    #[serde(rename = "tendencias_metricas", default)]
    pub metric_trends: Vec<MetricTrend>,
    #[serde(rename = "recursos_necessarios", default)]
    pub required_resources: ContextMap,
    /// Base priority, multiplied by the strategy score
    #[serde(rename = "prioridade", default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<f64>,
    #[serde(rename = "risco", default, skip_serializing_if = "Option::is_none")]
    pub risk: Option<f64>,
    #[serde(rename = "tempo_estimado", default, skip_serializing_if = "Option::is_none")]
    pub estimated_time_secs: Option<f64>,
}

impl RedesignStrategy {
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_impacts(&self.impact)?;
        check_optional_unit("prioridade", self.priority)?;
        check_optional_unit("risco", self.risk)?;
        check_optional_time(self.estimated_time_secs)
    }
}

/// Long-term evolution actions for strategies that score high enough.
#[derive(Debug)]
pub struct RedesignPlanner {
    config: ActionsConfig,
    strategies: RwLock<Vec<RedesignStrategy>>,
    evolutions: Mutex<VecDeque<ApplicationRecord>>,
}

impl RedesignPlanner {
    pub fn new(config: &ActionsConfig) -> Self {
        Self {
            config: config.clone(),
            strategies: RwLock::new(Vec::new()),
            evolutions: Mutex::new(VecDeque::new()),
        }
    }

    /// Register a strategy, replacing any strategy with the same id.
    pub fn register_strategy(&self, strategy: RedesignStrategy) -> Result<(), ValidationError> {
        strategy.validate()?;
        info!(target: "cerebro::redesign", strategy = %strategy.id, "Redesign strategy registered");
        let mut strategies = self.strategies.write();
        match strategies.iter_mut().find(|s| s.id == strategy.id) {
            Some(existing) => *existing = strategy,
            None => strategies.push(strategy),
        }
        Ok(())
    }

    pub fn record_evolution(&self, strategy: impl Into<String>, result: JsonValue, timestamp: Timestamp) {
        push_bounded(&mut self.evolutions.lock(), ApplicationRecord { source: strategy.into(), result, timestamp });
    }

    /// Evolution history, oldest first
    pub fn evolutions(&self) -> Vec<ApplicationRecord> {
        self.evolutions.lock().iter().cloned().collect()
    }

    fn last_evolution(&self, strategy: &str) -> Option<Timestamp> {
        self.evolutions.lock().iter().filter(|e| e.source == strategy).map(|e| e.timestamp).max()
    }

    fn score(&self, strategy: &RedesignStrategy, diagnosis: &Diagnosis, gradients: &[(String, GradientReport)], now: Timestamp) -> f64 {
        let mut score = 0.0;
        if !strategy.target_anomalies.is_empty() {
            let detected = diagnosis.anomaly_ids();
            let hits = strategy.target_anomalies.iter().filter(|a| detected.contains(a.as_str())).count();
            score += hits as f64 / strategy.target_anomalies.len() as f64 * 0.5;
        }
        for trend in &strategy.metric_trends {
            for (series, report) in gradients {
                let Some(medium) = report.medium_term else {
                    continue;
                };
                if series.contains(&trend.metric) && trend.direction.matches(report.short_term.slope, medium.slope) {
                    score += 0.3;
                }
            }
        }
        if let Some(last) = self.last_evolution(&strategy.id) {
            let window = self.config.recency_days * 86_400.0;
            let elapsed = now.secs_since(last).max(0.0);
            if elapsed < window {
                score *= elapsed / window;
            }
        }
        score.clamp(0.0, 1.0)
    }

    /// Score of every registered strategy at `now`
    pub fn score_strategies(&self, diagnosis: &Diagnosis, now: Timestamp) -> BTreeMap<String, f64> {
        let gradients = gradient_reports(&diagnosis.context);
        self.strategies
            .read()
            .iter()
            .map(|s| (s.id.clone(), self.score(s, diagnosis, &gradients, now)))
            .collect()
    }

    fn build_action(&self, strategy: &RedesignStrategy, score: f64, diagnosis: &Diagnosis) -> Result<CorrectiveAction, ValidationError> {
        let values = placeholder_values(diagnosis.top_anomaly(), &diagnosis.context);
        CorrectiveAction::builder(ActionKind::Redesign)
            .description(substitute_placeholders(&strategy.description, &values))
            .commands(substitute_all(&strategy.commands, &values))
            .impacts(strategy.impact.clone())
            .time_secs(strategy.estimated_time_secs.unwrap_or(self.config.redesign_time_secs))
            .resources(strategy.required_resources.clone())
            .priority(strategy.priority.unwrap_or(self.config.redesign_priority) * score)
            .risk(strategy.risk.unwrap_or(self.config.redesign_risk))
            .reversible(false)
            .context_entry("diagnostico_id", json!(diagnosis.id))
            .context_entry("estrategia", json!(strategy.id))
            .context_entry("score", json!(score))
            .context_entry("timestamp", json!(Timestamp::now().as_secs_f64()))
            .build()
    }
}

/// Gradient reports attached to a diagnosis context under `gradientes`.
fn gradient_reports(context: &ContextMap) -> Vec<(String, GradientReport)> {
    context
        .get("gradientes")
        .and_then(JsonValue::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(series, value)| {
                    serde_json::from_value::<GradientReport>(value.clone()).ok().map(|r| (series.clone(), r))
                })
                .collect()
        })
        .unwrap_or_default()
}

impl ActionGenerator for RedesignPlanner {
    fn kind(&self) -> ActionKind {
        ActionKind::Redesign
    }

    fn generate(&self, diagnosis: &Diagnosis) -> (Vec<CorrectiveAction>, Vec<ItemFailure>) {
        let scores = self.score_strategies(diagnosis, Timestamp::now());
        let strategies = self.strategies.read().clone();
        let mut actions = Vec::new();
        let mut failures = Vec::new();
        for strategy in &strategies {
            let score = scores.get(&strategy.id).copied().unwrap_or(0.0);
            if score <= self.config.redesign_min_score {
                continue;
            }
            match self.build_action(strategy, score, diagnosis) {
                Ok(action) => actions.push(action),
                Err(e) => {
                    let failure = ItemFailure::new(FailureStage::Generate, format!("redesign:{}", strategy.id), e);
                    log_failure!(failure);
                    failures.push(failure);
                }
            }
        }
        actions.sort_by(|a, b| OrderedFloat(b.priority()).cmp(&OrderedFloat(a.priority())));
        actions.truncate(self.config.max_redesign_actions);
        (actions, failures)
    }

    fn record_feedback(&self, action: &CorrectiveAction, efficacy: f64) {
        if let Some(strategy) = action.context_str("estrategia") {
            self.record_evolution(strategy, json!({ "acao_id": action.id(), "eficacia": efficacy }), Timestamp::now());
        }
    }
}

// ============================================================================
// SECTION 19: GENETIC PLAN OPTIMIZER
// ============================================================================
// Multi-objective subset selection over candidate actions:
// - chromosomes are index sets, never empty
// - tournament selection, set crossover, flip mutation
// - elitism keeps the best chromosome of every generation
// ============================================================================

/// Index set over the candidate action list.
pub type Chromosome = BTreeSet<usize>;

/// Objective breakdown of a plan. Every component lies in [0, 1].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanFitness {
    #[serde(rename = "eficacia")]
    pub efficacy: f64,
    #[serde(rename = "risco")]
    pub risk: f64,
    #[serde(rename = "tempo")]
    pub time: f64,
    #[serde(rename = "recursos")]
    pub resources: f64,
    pub total: f64,
}

/// Selected actions and their fitness.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizedPlan {
    pub actions: Vec<CorrectiveAction>,
    pub fitness: PlanFitness,
    /// Best total of the initial population, then of each evolved generation
    pub generation_best: Vec<f64>,
}

#[derive(Debug)]
pub struct PlanOptimizer {
    config: OptimizerConfig,
    rng: Mutex<ChaCha20Rng>,
}

impl PlanOptimizer {
    pub fn new(config: &OptimizerConfig) -> Self {
        Self {
            config: config.clone(),
            rng: Mutex::new(config.seed.map_or_else(ChaCha20Rng::from_entropy, ChaCha20Rng::seed_from_u64)),
        }
    }

    /// Score a subset. Impacts combine with diminishing returns per
    /// dimension; risk is inverted and priority-weighted.
    pub fn fitness(&self, chromosome: &Chromosome, actions: &[CorrectiveAction]) -> PlanFitness {
        let selected: Vec<&CorrectiveAction> = chromosome.iter().filter_map(|i| actions.get(*i)).collect();
        if selected.is_empty() {
            return PlanFitness::default();
        }

        let mut combined: BTreeMap<&str, f64> = BTreeMap::new();
        for action in &selected {
            for (dimension, impact) in action.estimated_impact() {
                let c = combined.entry(dimension.as_str()).or_insert(0.0);
                *c += impact * (1.0 - *c);
            }
        }
        let efficacy = if combined.is_empty() {
            0.0
        } else {
            combined.values().sum::<f64>() / combined.len() as f64
        };

        let priority_sum: f64 = selected.iter().map(|a| a.priority()).sum();
        let weighted_risk = if priority_sum > 0.0 {
            selected.iter().map(|a| a.priority() * a.risk()).sum::<f64>() / priority_sum
        } else {
            selected.iter().map(|a| a.risk()).sum::<f64>() / selected.len() as f64
        };
        let risk = 1.0 - weighted_risk;

        let total_time: f64 = selected.iter().map(|a| a.estimated_time_secs()).sum();
        let time = (1.0 - total_time / self.config.time_reference_secs).max(0.0);

        let resource_keys: AHashSet<&str> =
            selected.iter().flat_map(|a| a.required_resources().keys().map(String::as_str)).collect();
        let resources = (1.0 - resource_keys.len() as f64 / self.config.resource_reference).max(0.0);

        let w = &self.config.weights;
        let weight_sum = w.efficacy + w.risk + w.time + w.resources;
        let total = if weight_sum > 0.0 {
            (w.efficacy * efficacy + w.risk * risk + w.time * time + w.resources * resources) / weight_sum
        } else {
            0.0
        };

        PlanFitness { efficacy, risk, time, resources, total }
    }

    fn ensure_non_empty<R: Rng + ?Sized>(chromosome: &mut Chromosome, n: usize, rng: &mut R) {
        if chromosome.is_empty() {
            chromosome.insert(rng.gen_range(0..n));
        }
    }

    fn initial_population<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Vec<Chromosome> {
        (0..self.config.population_size)
            .map(|_| {
                let mut chromosome: Chromosome = (0..n).filter(|_| rng.gen_bool(0.5)).collect();
                Self::ensure_non_empty(&mut chromosome, n, rng);
                chromosome
            })
            .collect()
    }

    /// Best of up to `tournament_size` distinct random candidates.
    fn tournament<R: Rng + ?Sized>(&self, scores: &[f64], exclude: Option<usize>, rng: &mut R) -> Option<usize> {
        let pool: Vec<usize> = (0..scores.len()).filter(|i| Some(*i) != exclude).collect();
        let k = self.config.tournament_size.min(pool.len());
        pool.choose_multiple(rng, k)
            .copied()
            .max_by(|a, b| OrderedFloat(scores[*a]).cmp(&OrderedFloat(scores[*b])))
    }

    /// Shared actions go to both children; exclusive ones to either.
    fn crossover<R: Rng + ?Sized>(a: &Chromosome, b: &Chromosome, rng: &mut R) -> (Chromosome, Chromosome) {
        let mut first: Chromosome = a.intersection(b).copied().collect();
        let mut second = first.clone();
        for gene in a.symmetric_difference(b) {
            if rng.gen_bool(0.5) {
                first.insert(*gene);
            } else {
                second.insert(*gene);
            }
        }
        (first, second)
    }

    fn mutate<R: Rng + ?Sized>(&self, chromosome: &mut Chromosome, n: usize, rng: &mut R) {
        for gene in 0..n {
            if rng.gen::<f64>() < self.config.mutation_rate && !chromosome.remove(&gene) {
                chromosome.insert(gene);
            }
        }
        Self::ensure_non_empty(chromosome, n, rng);
    }

    fn best(scores: &[f64]) -> usize {
        scores
            .iter()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |(bi, bs), (i, s)| if *s > bs { (i, *s) } else { (bi, bs) })
            .0
    }

    /// Evolve a subset of `actions`. No candidates yields an empty plan
    /// scoring zero.
    pub fn optimize(&self, actions: &[CorrectiveAction]) -> OptimizedPlan {
        let n = actions.len();
        if n == 0 {
            return OptimizedPlan { actions: Vec::new(), fitness: PlanFitness::default(), generation_best: Vec::new() };
        }
        let timer = PerfTimer::new("optimize");
        let mut rng = self.rng.lock();
        let rng = &mut *rng;

        let mut population = self.initial_population(n, rng);
        let mut generation_best = Vec::with_capacity(self.config.generations + 1);
        for generation in 0..self.config.generations {
            let scores: Vec<f64> = population.iter().map(|c| self.fitness(c, actions).total).collect();
            generation_best.push(scores[Self::best(&scores)]);
            let elite = population[Self::best(&scores)].clone();

            let mut next = Vec::with_capacity(population.len() + 1);
            next.push(elite);
            for _ in 0..population.len() / 2 {
                let Some(first) = self.tournament(&scores, None, rng) else {
                    break;
                };
                let second = self.tournament(&scores, Some(first), rng).unwrap_or(first);
                let (mut a, mut b) = Self::crossover(&population[first], &population[second], rng);
                self.mutate(&mut a, n, rng);
                self.mutate(&mut b, n, rng);
                next.push(a);
                next.push(b);
            }
            next.truncate(self.config.population_size);
            population = next;
            trace!(target: "cerebro::optimizer", generation, best = scores[Self::best(&scores)], "Generation evolved");
        }

        let scores: Vec<f64> = population.iter().map(|c| self.fitness(c, actions).total).collect();
        let best = &population[Self::best(&scores)];
        let fitness = self.fitness(best, actions);
        generation_best.push(fitness.total);
        let selected = best.iter().filter_map(|i| actions.get(*i).cloned()).collect();
        debug!(
            target: "cerebro::optimizer",
            candidates = n,
            selected = best.len(),
            score = fitness.total,
            elapsed_ms = timer.stop(),
            "Plan optimized"
        );
        OptimizedPlan { actions: selected, fitness, generation_best }
    }
}

// ============================================================================
// SECTION 20: PLAN ORCHESTRATOR
// ============================================================================
// Diagnosis -> candidate actions -> optimized plan:
// - bounded plan store with forward-only status updates
// - efficacy evaluation from before/after snapshots
// - feedback routed to the generator that produced each action
// ============================================================================

/// A plan plus the failures isolated while generating it.
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub plan: ActionPlan,
    pub fitness: PlanFitness,
    pub failures: Vec<ItemFailure>,
}

#[derive(Debug)]
pub struct PlanOrchestrator {
    config: PlanningConfig,
    hotfix: HotfixGenerator,
    refactor: RefactorEngine,
    redesign: RedesignPlanner,
    optimizer: PlanOptimizer,
    plans: Mutex<VecDeque<ActionPlan>>,
}

impl PlanOrchestrator {
    /// Build the generators and load the configured catalogs.
    pub fn new(config: &EngineConfig) -> CerebroResult<Self> {
        let orchestrator = Self {
            config: config.planning.clone(),
            hotfix: HotfixGenerator::new(&config.actions, config.optimizer.seed),
            refactor: RefactorEngine::new(&config.actions),
            redesign: RedesignPlanner::new(&config.actions),
            optimizer: PlanOptimizer::new(&config.optimizer),
            plans: Mutex::new(VecDeque::new()),
        };
        for template in &config.catalog.hotfix_templates {
            orchestrator.hotfix.register_template(template.clone())?;
        }
        for pattern in &config.catalog.refactor_patterns {
            orchestrator.refactor.register_pattern(pattern.clone())?;
        }
        for strategy in &config.catalog.redesign_strategies {
            orchestrator.redesign.register_strategy(strategy.clone())?;
        }
        Ok(orchestrator)
    }

    pub fn hotfix(&self) -> &HotfixGenerator {
        &self.hotfix
    }

    pub fn refactor(&self) -> &RefactorEngine {
        &self.refactor
    }

    pub fn redesign(&self) -> &RedesignPlanner {
        &self.redesign
    }

    pub fn optimizer(&self) -> &PlanOptimizer {
        &self.optimizer
    }

    fn generator(&self, kind: ActionKind) -> &dyn ActionGenerator {
        match kind {
            ActionKind::Hotfix => &self.hotfix,
            ActionKind::Refactor => &self.refactor,
            ActionKind::Redesign => &self.redesign,
        }
    }

    /// Generate, optimize and store a plan for `diagnosis`.
    pub fn generate_plan(&self, diagnosis: &Diagnosis) -> CerebroResult<PlanOutcome> {
        let mut candidates = Vec::new();
        let mut failures = Vec::new();
        for kind in [ActionKind::Hotfix, ActionKind::Refactor, ActionKind::Redesign] {
            let (actions, generator_failures) = self.generator(kind).generate(diagnosis);
            candidates.extend(actions);
            failures.extend(generator_failures);
        }

        let optimized = self.optimizer.optimize(&candidates);
        let impacted: BTreeSet<&str> =
            optimized.actions.iter().flat_map(|a| a.estimated_impact().keys().map(String::as_str)).collect();
        let impacted_metrics: Vec<String> = diagnosis
            .analyzed_metrics
            .iter()
            .filter(|m| impacted.contains(m.dimension.as_str()))
            .map(|m| m.name.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let plan = ActionPlan::new(&diagnosis.id, optimized.actions, optimized.fitness.total, impacted_metrics)?;
        info!(
            target: "cerebro::planning",
            plan = %plan.id(),
            diagnosis = %diagnosis.id,
            candidates = candidates.len(),
            selected = plan.actions().len(),
            score = plan.score(),
            "Action plan generated"
        );

        let mut plans = self.plans.lock();
        plans.push_back(plan.clone());
        while plans.len() > self.config.history_cap {
            plans.pop_front();
        }
        Ok(PlanOutcome { plan, fitness: optimized.fitness, failures })
    }

    pub fn plan(&self, id: &str) -> CerebroResult<ActionPlan> {
        self.plans
            .lock()
            .iter()
            .find(|p| p.id() == id)
            .cloned()
            .ok_or_else(|| CerebroError::unknown_id("plan", id))
    }

    /// Retained plans, oldest first
    pub fn recent_plans(&self) -> Vec<ActionPlan> {
        self.plans.lock().iter().cloned().collect()
    }

    /// Apply a lifecycle transition and return the updated plan.
    pub fn update_status(&self, id: &str, status: PlanStatus, result: Option<ContextMap>) -> CerebroResult<ActionPlan> {
        let mut plans = self.plans.lock();
        let plan = plans
            .iter_mut()
            .find(|p| p.id() == id)
            .ok_or_else(|| PlanError::NotFound(id.to_string()))?;
        let from = plan.status();
        plan.transition(status, result)?;
        info!(target: "cerebro::planning", plan = %id, %from, to = %status, "Plan status updated");
        Ok(plan.clone())
    }

    /// Route per-action efficacy to the generator that produced each
    /// action. Returns how many entries were accepted.
    pub fn record_action_efficacy(&self, plan_id: &str, efficacies: &BTreeMap<String, f64>) -> CerebroResult<usize> {
        let plan = self.plan(plan_id)?;
        let mut accepted = 0;
        for (action_id, efficacy) in efficacies {
            let Some(action) = plan.action(action_id) else {
                warn!(target: "cerebro::planning", plan = %plan_id, action = %action_id, "Efficacy for unknown action ignored");
                continue;
            };
            if let Err(e) = check_unit_interval("eficacia", *efficacy) {
                warn!(target: "cerebro::planning", plan = %plan_id, action = %action_id, error = %e, "Efficacy rejected");
                continue;
            }
            self.generator(action.kind()).record_feedback(action, *efficacy);
            accepted += 1;
        }
        Ok(accepted)
    }

    /// Measure each action's efficacy from before/after snapshots and feed
    /// it back. Lower is better except for throughput.
    pub fn evaluate_efficacy(
        &self,
        plan_id: &str,
        before: &[MetricSample],
        after: &[MetricSample],
    ) -> CerebroResult<BTreeMap<String, f64>> {
        let plan = self.plan(plan_id)?;
        let improvements = dimension_improvements(before, after);

        let mut efficacies = BTreeMap::new();
        for action in plan.actions() {
            let (weighted, weight) = action
                .estimated_impact()
                .iter()
                .filter_map(|(dimension, impact)| improvements.get(dimension.as_str()).map(|imp| (impact * imp, *impact)))
                .fold((0.0, 0.0), |(s, w), (x, i)| (s + x, w + i));
            if weight > 0.0 {
                efficacies.insert(action.id().to_string(), (weighted / weight).clamp(0.0, 1.0));
            }
        }

        self.record_action_efficacy(plan_id, &efficacies)?;
        Ok(efficacies)
    }

    pub fn save_plan(&self, plan: &ActionPlan, path: &Path) -> CerebroResult<()> {
        fs::write(path, serde_json::to_string_pretty(plan)?)?;
        info!(target: "cerebro::planning", plan = %plan.id(), path = %path.display(), "Plan saved");
        Ok(())
    }

    pub fn load_plan(&self, path: &Path) -> CerebroResult<ActionPlan> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Mean relative improvement per dimension over metrics present in both
/// snapshots with a non-zero baseline.
fn dimension_improvements(before: &[MetricSample], after: &[MetricSample]) -> BTreeMap<String, f64> {
    let latest = |samples: &[MetricSample]| -> BTreeMap<SeriesKey, (String, f64)> {
        let mut newest: BTreeMap<SeriesKey, &MetricSample> = BTreeMap::new();
        for sample in samples {
            newest
                .entry(SeriesKey::for_sample(sample))
                .and_modify(|kept| {
                    if sample.timestamp >= kept.timestamp {
                        *kept = sample;
                    }
                })
                .or_insert(sample);
        }
        newest.into_iter().map(|(key, s)| (key, (s.dimension.clone(), s.value))).collect()
    };
    let before = latest(before);
    let after = latest(after);

    let mut per_dimension: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for (key, (dimension, b)) in &before {
        let Some((_, a)) = after.get(key) else {
            continue;
        };
        if *b == 0.0 {
            continue;
        }
        let improvement = if dimensions::higher_is_better(dimension) {
            (a - b) / b
        } else {
            ((b - a) / b).max(0.0)
        };
        per_dimension.entry(dimension.clone()).or_default().push(improvement);
    }
    per_dimension
        .into_iter()
        .map(|(dimension, values)| (dimension, StatisticalFunctions::mean(&values)))
        .collect()
}

// ============================================================================
// SECTION 21: PHASE 3 TESTS - ACTIONS, OPTIMIZER & PLANS
// ============================================================================

#[cfg(test)]
mod planning_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use test_case::test_case;

    fn builtin_pattern(id: &str) -> AnomalyPattern {
        CatalogConfig::builtin().patterns.into_iter().find(|p| p.id == id).unwrap()
    }

    fn diagnosis(anomalies: &[(&str, f64)], metrics: Vec<MetricSample>, context: ContextMap) -> Diagnosis {
        let anomalies: Vec<DetectedAnomaly> = anomalies
            .iter()
            .map(|(id, confidence)| DetectedAnomaly { pattern: builtin_pattern(id), confidence: *confidence })
            .collect();
        Diagnosis {
            id: "diag_teste".into(),
            timestamp: Timestamp::now(),
            root_cause: anomalies.first().map(|a| a.pattern.name.clone()),
            confidence: anomalies.first().map_or(0.0, |a| a.confidence),
            anomalies,
            analyzed_metrics: metrics,
            recommendations: Vec::new(),
            context,
        }
    }

    fn latency(value: f64) -> MetricSample {
        MetricSample::new("tempo_resposta", value, Timestamp::from_secs(100), dimensions::LATENCY, "ms")
    }

    fn action(id: &str, priority: f64, risk: f64, impact: f64, time: f64) -> CorrectiveAction {
        CorrectiveAction::builder(ActionKind::Hotfix)
            .id(id)
            .priority(priority)
            .risk(risk)
            .impact(dimensions::LATENCY, impact)
            .time_secs(time)
            .build()
            .unwrap()
    }

    fn seeded_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.optimizer.seed = Some(7);
        config
    }

    // ------------------------------------------------------------------------
    // Actions & plans
    // ------------------------------------------------------------------------

    #[test]
    fn test_action_builder_fails_fast() {
        let risky = CorrectiveAction::builder(ActionKind::Hotfix).risk(1.5).build();
        assert_eq!(risky.unwrap_err(), ValidationError::OutOfRange { field: "risco", value: 1.5 });

        let instant = CorrectiveAction::builder(ActionKind::Refactor).time_secs(0.0).build();
        assert_eq!(instant.unwrap_err(), ValidationError::NonPositive { field: "tempo_estimado", value: 0.0 });

        let overpromised = CorrectiveAction::builder(ActionKind::Redesign).impact("erros", 2.0).build();
        assert!(matches!(overpromised, Err(ValidationError::OutOfRange { field: "impacto_estimado", .. })));
    }

    #[test]
    fn test_action_json_revalidates_on_load() {
        let original = CorrectiveAction::builder(ActionKind::Refactor)
            .description("Circuit breaker")
            .commands(vec!["kubectl apply -f cb.yaml".into()])
            .impact(dimensions::ERRORS, 0.5)
            .build()
            .unwrap();
        let mut json = serde_json::to_value(&original).unwrap();
        assert_eq!(json["tipo"], json!("refatoracao"));
        assert_eq!(json["tempo_estimado"], json!(60.0));

        let back: CorrectiveAction = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(back, original);

        json["risco"] = json!(1.2);
        assert!(serde_json::from_value::<CorrectiveAction>(json).is_err());
    }

    #[test_case(PlanStatus::Created, PlanStatus::InProgress, true)]
    #[test_case(PlanStatus::Created, PlanStatus::Cancelled, true)]
    #[test_case(PlanStatus::InProgress, PlanStatus::Completed, true)]
    #[test_case(PlanStatus::InProgress, PlanStatus::Failed, true)]
    #[test_case(PlanStatus::InProgress, PlanStatus::Cancelled, true)]
    #[test_case(PlanStatus::Created, PlanStatus::Completed, false)]
    #[test_case(PlanStatus::InProgress, PlanStatus::Created, false)]
    #[test_case(PlanStatus::Completed, PlanStatus::InProgress, false)]
    #[test_case(PlanStatus::Cancelled, PlanStatus::Created, false)]
    fn test_plan_lifecycle(from: PlanStatus, to: PlanStatus, allowed: bool) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test]
    fn test_plan_rejects_duplicate_action_ids() {
        let actions = vec![action("a", 0.5, 0.2, 0.4, 60.0), action("a", 0.5, 0.7, 0.6, 60.0)];
        assert_eq!(
            ActionPlan::new("diag", actions, 0.5, Vec::new()).unwrap_err(),
            ValidationError::DuplicateActionId { id: "a".into() }
        );

        let plan = ActionPlan::new("diag", vec![action("a", 0.5, 0.2, 0.4, 60.0)], 0.5, Vec::new()).unwrap();
        let mut json = serde_json::to_value(&plan).unwrap();
        assert_eq!(json["status"], json!("criado"));
        assert_eq!(json["versao_esquema"], json!(SCHEMA_VERSION));
        let first = json["acoes"][0].clone();
        json["acoes"].as_array_mut().unwrap().push(first);
        assert!(serde_json::from_value::<ActionPlan>(json).is_err());
    }

    // ------------------------------------------------------------------------
    // Placeholders & generators
    // ------------------------------------------------------------------------

    #[test]
    fn test_unknown_placeholders_survive() {
        let mut values = AHashMap::new();
        values.insert("servico".to_string(), "api".to_string());
        assert_eq!(
            substitute_placeholders("restart {servico} {desconhecido} {aberto", &values),
            "restart api {desconhecido} {aberto"
        );
    }

    #[test]
    fn test_hotfix_substitutes_anomaly_name() {
        let generator = HotfixGenerator::new(&ActionsConfig::default(), Some(1));
        generator
            .register_template(HotfixTemplate::new(
                "eco",
                "latencia_elevada",
                "Mitiga {anomalia_nome}",
                vec!["echo '{anomalia_nome}' {pico_latencia} {confianca} {desconhecido}".into()],
            ))
            .unwrap();
        let mut context = ContextMap::new();
        context.insert("pico_latencia".into(), json!(1200.0));
        let diagnosis = diagnosis(&[("latencia_elevada", 0.875)], vec![latency(1200.0)], context);

        let (actions, failures) = generator.generate(&diagnosis);
        assert!(failures.is_empty());
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].commands()[0], "echo 'Latência elevada' 1200.0 0.88 {desconhecido}");
        assert_eq!(actions[0].description(), "Mitiga Latência elevada");
        assert_eq!(actions[0].context_str("template_id"), Some("eco"));
        assert_eq!(actions[0].priority(), HOTFIX_PRIORITY);
        assert!(actions[0].reversible());
    }

    #[test]
    fn test_hotfix_template_selection() {
        let generator = HotfixGenerator::new(&ActionsConfig::default(), Some(1));
        let template = |id: &str| HotfixTemplate::new(id, "latencia_elevada", id, vec![format!("run {}", id)]);
        generator.register_template(template("prod_only").with_condition("ambiente", json!("prod"))).unwrap();
        generator.register_template(template("anywhere")).unwrap();

        let context = ContextMap::new();
        assert_eq!(generator.select_template("latencia_elevada", &context).unwrap().id, "anywhere");

        let mut prod = ContextMap::new();
        prod.insert("ambiente".into(), json!("prod"));
        generator.record_efficacy("prod_only", 0.9).unwrap();
        assert_eq!(generator.select_template("latencia_elevada", &prod).unwrap().id, "prod_only");
        assert!(generator.select_template("taxa_erros_alta", &prod).is_none());
    }

    #[test]
    fn test_hotfix_falls_back_to_generic_commands() {
        let generator = HotfixGenerator::new(&ActionsConfig::default(), Some(1));
        let mut unknown = builtin_pattern("latencia_elevada");
        unknown.id = "sem_dimensao".into();
        unknown.dimensions.clear();
        let mut diagnosis = diagnosis(&[("latencia_elevada", 0.9)], Vec::new(), ContextMap::new());
        diagnosis.anomalies.push(DetectedAnomaly { pattern: unknown, confidence: 0.6 });

        let (actions, _) = generator.generate(&diagnosis);
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].commands(), ["redis-cli CONFIG SET maxmemory-policy allkeys-lru".to_string()]);
        assert_eq!(actions[0].estimated_impact().get(dimensions::LATENCY), Some(&0.3));
        assert_eq!(actions[0].estimated_time_secs(), HOTFIX_GENERIC_TIME_SECS);
        assert_eq!(actions[0].context()["generica"], json!(true));
        assert_eq!(actions[1].commands(), [GENERIC_MONITOR_COMMAND.to_string()]);
    }

    #[test]
    fn test_refactor_conditions_must_all_hold() {
        let engine = RefactorEngine::new(&ActionsConfig::default());
        engine
            .register_pattern(RefactorPattern {
                id: "retry_budget".into(),
                description: "Orçamento de retentativas para {anomalia_nome}".into(),
                commands: vec!["apply retry-budget".into()],
                impact: [(dimensions::ERRORS.to_string(), 0.4)].into_iter().collect(),
                conditions: RefactorConditions {
                    anomalies: vec!["taxa_erros_alta".into()],
                    metrics: vec![MetricCondition { metric: "taxa_erros".into(), operator: ComparisonOp::Gt, value: 0.05 }],
                    context: ContextMap::new(),
                },
                required_resources: ContextMap::new(),
                priority: None,
                risk: None,
                estimated_time_secs: None,
            })
            .unwrap();
        let errors = |v: f64| MetricSample::new("taxa_erros", v, Timestamp::from_secs(1), dimensions::ERRORS, "%");

        let failing = diagnosis(&[("taxa_erros_alta", 0.9)], vec![errors(0.2)], ContextMap::new());
        let (actions, _) = engine.generate(&failing);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].description(), "Orçamento de retentativas para Taxa de erros alta");
        assert_eq!(actions[0].context_str("padrao"), Some("retry_budget"));
        assert_eq!(actions[0].risk(), REFACTOR_RISK);

        let healthy = diagnosis(&[("taxa_erros_alta", 0.9)], vec![errors(0.01)], ContextMap::new());
        assert!(engine.applicable_patterns(&healthy).is_empty());
        let unmeasured = diagnosis(&[("taxa_erros_alta", 0.9)], Vec::new(), ContextMap::new());
        assert!(engine.applicable_patterns(&unmeasured).is_empty());
        let other = diagnosis(&[("latencia_elevada", 0.9)], vec![errors(0.2)], ContextMap::new());
        assert!(engine.applicable_patterns(&other).is_empty());

        engine.record_feedback(&actions[0], 0.7);
        assert_eq!(engine.applications()[0].source, "retry_budget");
    }

    fn rising_latency_context() -> ContextMap {
        let report = GradientReport {
            short_term: RegressionResult { slope: 2.0, ..RegressionResult::FLAT },
            medium_term: Some(RegressionResult { slope: 1.5, ..RegressionResult::FLAT }),
            long_term: RegressionResult { slope: 1.0, ..RegressionResult::FLAT },
            acceleration: None,
        };
        let mut context = ContextMap::new();
        context.insert("gradientes".into(), json!({ "latencia:tempo_resposta": report }));
        context
    }

    #[test]
    fn test_redesign_scoring_and_recency() {
        let planner = RedesignPlanner::new(&ActionsConfig::default());
        for strategy in CatalogConfig::builtin().redesign_strategies {
            planner.register_strategy(strategy).unwrap();
        }
        let diagnosis =
            diagnosis(&[("latencia_elevada", 0.9), ("saturacao_cpu", 0.8)], vec![latency(900.0)], rising_latency_context());
        let now = Timestamp::now();

        let scores = planner.score_strategies(&diagnosis, now);
        assert!((scores["escalonamento_horizontal"] - 0.8).abs() < 1e-9);

        let (actions, _) = planner.generate(&diagnosis);
        assert_eq!(actions.len(), 1);
        assert!((actions[0].priority() - REDESIGN_PRIORITY * 0.8).abs() < 1e-9);
        assert!(!actions[0].reversible());

        let half_window = Timestamp::from_secs_f64(now.as_secs_f64() - 3.5 * 86_400.0).unwrap();
        planner.record_evolution("escalonamento_horizontal", json!({}), half_window);
        let penalized = planner.score_strategies(&diagnosis, now);
        assert!((penalized["escalonamento_horizontal"] - 0.4).abs() < 1e-3);

        planner.record_evolution("escalonamento_horizontal", json!({}), now);
        assert!(planner.generate(&diagnosis).0.is_empty());
    }

    #[test]
    fn test_redesign_keeps_top_two_by_priority() {
        let planner = RedesignPlanner::new(&ActionsConfig::default());
        for (id, priority) in [("a", 0.2), ("b", 0.9), ("c", 0.5)] {
            planner
                .register_strategy(RedesignStrategy {
                    id: id.into(),
                    description: id.into(),
                    commands: Vec::new(),
                    impact: BTreeMap::new(),
                    target_anomalies: vec!["latencia_elevada".into()],
                    metric_trends: Vec::new(),
                    required_resources: ContextMap::new(),
                    priority: Some(priority),
                    risk: None,
                    estimated_time_secs: None,
                })
                .unwrap();
        }
        let diagnosis = diagnosis(&[("latencia_elevada", 0.9)], Vec::new(), ContextMap::new());
        let (actions, _) = planner.generate(&diagnosis);
        let strategies: Vec<&str> = actions.iter().filter_map(|a| a.context_str("estrategia")).collect();
        assert_eq!(strategies, vec!["b", "c"]);
    }

    // ------------------------------------------------------------------------
    // Optimizer
    // ------------------------------------------------------------------------

    fn a_and_b() -> Vec<CorrectiveAction> {
        vec![action("A", 0.5, 0.2, 0.4, 60.0), action("B", 0.5, 0.7, 0.6, 1800.0)]
    }

    // Weights 0.4/0.3/0.2/0.1, time reference 3600 s, no resources.
    #[test_case(&[0], 0.4, 0.8, 1.0 - 60.0 / 3600.0, 0.696_666_666_666_7 ; "only A")]
    #[test_case(&[1], 0.6, 0.3, 0.5, 0.53 ; "only B")]
    #[test_case(&[0, 1], 0.76, 0.55, 1.0 - 1860.0 / 3600.0, 0.665_666_666_666_7 ; "A and B")]
    fn test_fitness_of_a_b_subsets(subset: &[usize], efficacy: f64, risk: f64, time: f64, total: f64) {
        let optimizer = PlanOptimizer::new(&OptimizerConfig::default());
        let chromosome: Chromosome = subset.iter().copied().collect();
        let fitness = optimizer.fitness(&chromosome, &a_and_b());

        assert!((fitness.efficacy - efficacy).abs() < 1e-9, "efficacy {}", fitness.efficacy);
        assert!((fitness.risk - risk).abs() < 1e-9, "risk {}", fitness.risk);
        assert!((fitness.time - time).abs() < 1e-9, "time {}", fitness.time);
        assert!((fitness.resources - 1.0).abs() < 1e-9, "resources {}", fitness.resources);
        assert!((fitness.total - total).abs() < 1e-9, "total {}", fitness.total);
    }

    #[test]
    fn test_optimizer_selects_best_subset_reproducibly() {
        let config = OptimizerConfig { seed: Some(42), ..OptimizerConfig::default() };
        let actions = a_and_b();
        let first = PlanOptimizer::new(&config).optimize(&actions);
        let second = PlanOptimizer::new(&config).optimize(&actions);

        let ids: Vec<&str> = first.actions.iter().map(|a| a.id()).collect();
        assert_eq!(ids, vec!["A"]);
        assert!((first.fitness.total - 0.696_666_666_666_7).abs() < 1e-9);
        assert_eq!(first.generation_best.len(), config.generations + 1);
        assert_eq!(first, second);
    }

    #[test]
    fn test_optimizer_handles_no_candidates() {
        let optimizer = PlanOptimizer::new(&OptimizerConfig::default());
        let plan = optimizer.optimize(&[]);
        assert!(plan.actions.is_empty());
        assert_eq!(plan.fitness.total, 0.0);
        assert!(plan.generation_best.is_empty());
    }

    proptest! {
        #[test]
        fn prop_fitness_components_stay_in_unit_interval(
            specs in prop::collection::vec((0.0f64..=1.0, 0.0f64..=1.0, 0.0f64..=1.0, 1.0f64..5000.0), 1..8),
            mask in prop::collection::vec(any::<bool>(), 8),
        ) {
            let optimizer = PlanOptimizer::new(&OptimizerConfig::default());
            let actions: Vec<CorrectiveAction> = specs
                .iter()
                .enumerate()
                .map(|(i, (p, r, imp, t))| action(&format!("a{}", i), *p, *r, *imp, *t))
                .collect();
            let chromosome: Chromosome = (0..actions.len()).filter(|i| mask[*i]).collect();
            let fitness = optimizer.fitness(&chromosome, &actions);
            for value in [fitness.efficacy, fitness.risk, fitness.time, fitness.resources, fitness.total] {
                prop_assert!((-1e-12..=1.0 + 1e-12).contains(&value));
            }
        }

        #[test]
        fn prop_optimized_plans_are_never_empty(n in 1usize..6, seed in any::<u64>()) {
            let config = OptimizerConfig { seed: Some(seed), population_size: 10, generations: 3, ..OptimizerConfig::default() };
            let actions: Vec<CorrectiveAction> = (0..n).map(|i| action(&format!("a{}", i), 0.5, 0.5, 0.3, 60.0)).collect();
            let plan = PlanOptimizer::new(&config).optimize(&actions);
            prop_assert!(!plan.actions.is_empty());
            let ids: BTreeSet<&str> = plan.actions.iter().map(|a| a.id()).collect();
            prop_assert_eq!(ids.len(), plan.actions.len());
        }

        #[test]
        fn prop_best_fitness_never_decreases_across_generations(
            specs in prop::collection::vec((0.0f64..=1.0, 0.0f64..=1.0, 0.0f64..=1.0, 1.0f64..5000.0), 1..8),
            seed in any::<u64>(),
            generations in 1usize..12,
        ) {
            let config = OptimizerConfig {
                seed: Some(seed),
                population_size: 12,
                generations,
                mutation_rate: 0.3,
                ..OptimizerConfig::default()
            };
            let actions: Vec<CorrectiveAction> = specs
                .iter()
                .enumerate()
                .map(|(i, (p, r, imp, t))| action(&format!("a{}", i), *p, *r, *imp, *t))
                .collect();
            let plan = PlanOptimizer::new(&config).optimize(&actions);

            prop_assert_eq!(plan.generation_best.len(), generations + 1);
            for pair in plan.generation_best.windows(2) {
                prop_assert!(pair[1] >= pair[0], "best fitness dropped: {:?}", plan.generation_best);
            }
            prop_assert!(plan.fitness.total >= plan.generation_best[0]);
            prop_assert_eq!(plan.generation_best.last().copied(), Some(plan.fitness.total));
        }
    }

    // ------------------------------------------------------------------------
    // Orchestrator
    // ------------------------------------------------------------------------

    #[test]
    fn test_plan_generation_and_lifecycle() {
        let orchestrator = PlanOrchestrator::new(&seeded_config()).unwrap();
        let diagnosis = diagnosis(&[("latencia_elevada", 1.0)], vec![latency(1200.0)], ContextMap::new());

        let outcome = orchestrator.generate_plan(&diagnosis).unwrap();
        let plan = outcome.plan;
        assert_eq!(plan.diagnosis_id(), "diag_teste");
        assert_eq!(plan.actions().len(), 1);
        assert_eq!(plan.actions()[0].context_str("template_id"), Some("cache_latencia"));
        assert_eq!(plan.actions()[0].description(), "Ajusta a política de cache para Latência elevada");
        assert_eq!(plan.impacted_metrics(), ["tempo_resposta".to_string()]);
        assert_eq!(plan.status(), PlanStatus::Created);

        let running = orchestrator.update_status(plan.id(), PlanStatus::InProgress, None).unwrap();
        assert_eq!(running.status(), PlanStatus::InProgress);
        let mut result = ContextMap::new();
        result.insert("sucesso".into(), json!(true));
        let done = orchestrator.update_status(plan.id(), PlanStatus::Completed, Some(result)).unwrap();
        assert_eq!(done.result().unwrap()["sucesso"], json!(true));

        assert!(matches!(
            orchestrator.update_status(plan.id(), PlanStatus::InProgress, None),
            Err(CerebroError::Plan(PlanError::InvalidTransition { from: PlanStatus::Completed, to: PlanStatus::InProgress }))
        ));
        assert!(matches!(
            orchestrator.update_status("plano_inexistente", PlanStatus::InProgress, None),
            Err(CerebroError::Plan(PlanError::NotFound(_)))
        ));
    }

    #[test]
    fn test_efficacy_feedback_reaches_hotfix_table() {
        let orchestrator = PlanOrchestrator::new(&seeded_config()).unwrap();
        let diagnosis = diagnosis(&[("latencia_elevada", 1.0)], vec![latency(1000.0)], ContextMap::new());
        let plan = orchestrator.generate_plan(&diagnosis).unwrap().plan;
        let action_id = plan.actions()[0].id().to_string();

        let throughput = |v: f64| MetricSample::new("requisicoes", v, Timestamp::from_secs(1), dimensions::THROUGHPUT, "rps");
        let efficacies = orchestrator
            .evaluate_efficacy(plan.id(), &[latency(1000.0), throughput(100.0)], &[latency(500.0), throughput(50.0)])
            .unwrap();

        assert_eq!(efficacies.len(), 1);
        assert!((efficacies[&action_id] - 0.5).abs() < 1e-9);
        assert_eq!(orchestrator.hotfix().efficacy(&action_id), Some(0.5));
        assert_eq!(orchestrator.hotfix().efficacy("cache_latencia"), Some(0.5));
    }

    #[test]
    fn test_efficacy_baseline_uses_newest_sample_per_series() {
        let at = |value: f64, secs: i64| {
            MetricSample::new("tempo_resposta", value, Timestamp::from_secs(secs), dimensions::LATENCY, "ms")
        };
        // Snapshot arrives out of order; the reading at t=200 is the baseline.
        let before = [at(1000.0, 200), at(500.0, 100)];
        let after = [at(250.0, 300), at(500.0, 400), at(900.0, 350)];

        let improvements = dimension_improvements(&before, &after);
        assert_eq!(improvements.len(), 1);
        assert!((improvements[dimensions::LATENCY] - 0.5).abs() < 1e-9);

        let reordered: Vec<MetricSample> = before.iter().rev().cloned().collect();
        assert_eq!(dimension_improvements(&reordered, &after), improvements);
    }

    #[test]
    fn test_feedback_routes_by_action_kind() {
        let orchestrator = PlanOrchestrator::new(&seeded_config()).unwrap();
        let diagnosis = diagnosis(
            &[("latencia_elevada", 0.9), ("saturacao_cpu", 0.8), ("taxa_erros_alta", 0.7)],
            vec![latency(900.0)],
            rising_latency_context(),
        );
        let plan = orchestrator.generate_plan(&diagnosis).unwrap().plan;
        let efficacies: BTreeMap<String, f64> = plan.actions().iter().map(|a| (a.id().to_string(), 0.6)).collect();

        let accepted = orchestrator.record_action_efficacy(plan.id(), &efficacies).unwrap();
        assert_eq!(accepted, plan.actions().len());
        let kinds: BTreeSet<&str> = plan.actions().iter().map(|a| a.kind().as_str()).collect();
        assert_eq!(orchestrator.refactor().applications().is_empty(), !kinds.contains("refatoracao"));
        assert_eq!(orchestrator.redesign().evolutions().is_empty(), !kinds.contains("redesign"));

        let mut bogus = BTreeMap::new();
        bogus.insert("acao_inexistente".to_string(), 0.5);
        assert_eq!(orchestrator.record_action_efficacy(plan.id(), &bogus).unwrap(), 0);
    }

    #[test]
    fn test_plan_snapshot_round_trip() {
        let orchestrator = PlanOrchestrator::new(&seeded_config()).unwrap();
        let diagnosis = diagnosis(&[("taxa_erros_alta", 0.9)], Vec::new(), ContextMap::new());
        let plan = orchestrator.generate_plan(&diagnosis).unwrap().plan;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plano.json");
        orchestrator.save_plan(&plan, &path).unwrap();
        let loaded = orchestrator.load_plan(&path).unwrap();
        assert_eq!(loaded.id(), plan.id());
        assert_eq!(loaded.actions().len(), plan.actions().len());
        assert_eq!(loaded.status(), PlanStatus::Created);
        assert!(orchestrator.plan(plan.id()).is_ok());
    }
}

// ============================================================================
// SECTION 22: METRIC SOURCE COLLABORATORS
// ============================================================================
// Where samples come from in `run` mode:
// - HTTP endpoint returning a JSON array of samples
// - JSON array on disk, re-read every cycle
// Invalid samples are rejected one by one; transport failures surface as
// `CollaboratorError` and are degraded by the engine, never by the source.
// ============================================================================

// ----------------------------------------------------------------------------
// 22.1 Source Trait
// ----------------------------------------------------------------------------

/// One fetch worth of samples plus the ones rejected at decode time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleBatch {
    pub samples: Vec<MetricSample>,
    pub rejected: Vec<(usize, ValidationError)>,
}

impl SampleBatch {
    pub fn decode(value: &JsonValue) -> Self {
        let (samples, rejected) = decode_samples(value);
        Self { samples, rejected }
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty() && self.rejected.is_empty()
    }
}

/// Trait for anything that can hand the engine a batch of samples
#[async_trait]
pub trait MetricSource: Send + Sync + Debug {
    /// Name used in logs and failure reports
    fn name(&self) -> &str;

    /// Fetch the current batch
    async fn fetch(&self) -> Result<SampleBatch, CollaboratorError>;
}

// ----------------------------------------------------------------------------
// 22.2 HTTP Source
// ----------------------------------------------------------------------------

/// `GET {url}` returning a JSON array of samples
#[derive(Debug)]
pub struct HttpMetricSource {
    name: String,
    url: String,
    timeout_ms: u64,
    client: HttpClient,
}

impl HttpMetricSource {
    pub fn new(url: impl Into<String>, timeout_secs: u64) -> Self {
        let url = url.into();
        let client = HttpClient::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .pool_max_idle_per_host(4)
            .build()
            .unwrap_or_default();

        Self::with_client(url, timeout_secs, client)
    }

    /// Use a preconfigured client (proxies, TLS roots)
    pub fn with_client(url: impl Into<String>, timeout_secs: u64, client: HttpClient) -> Self {
        let url = url.into();
        Self { name: format!("http:{}", url), url, timeout_ms: timeout_secs * 1000, client }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl MetricSource for HttpMetricSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self) -> Result<SampleBatch, CollaboratorError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| CollaboratorError::from_reqwest(&self.url, self.timeout_ms, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CollaboratorError::HttpStatus { endpoint: self.url.clone(), status: status.as_u16() });
        }

        let body: JsonValue = response
            .json()
            .await
            .map_err(|e| CollaboratorError::from_reqwest(&self.url, self.timeout_ms, e))?;
        let batch = SampleBatch::decode(&body);

        debug!(
            target: "cerebro::source::http",
            endpoint = %self.url,
            samples = batch.samples.len(),
            rejected = batch.rejected.len(),
            "Samples fetched"
        );
        Ok(batch)
    }
}

// ----------------------------------------------------------------------------
// 22.3 File Source
// ----------------------------------------------------------------------------

/// JSON array of samples on disk
#[derive(Debug, Clone)]
pub struct FileMetricSource {
    name: String,
    path: PathBuf,
}

impl FileMetricSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self { name: format!("file:{}", path.display()), path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl MetricSource for FileMetricSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self) -> Result<SampleBatch, CollaboratorError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| CollaboratorError::Io { path: self.path.clone(), message: e.to_string() })?;
        let body: JsonValue = serde_json::from_str(&content).map_err(|e| CollaboratorError::InvalidResponse {
            origin: self.path.display().to_string(),
            message: e.to_string(),
        })?;
        let batch = SampleBatch::decode(&body);

        debug!(
            target: "cerebro::source::file",
            path = %self.path.display(),
            samples = batch.samples.len(),
            rejected = batch.rejected.len(),
            "Samples read"
        );
        Ok(batch)
    }
}

/// Pick the configured source. The URL wins when both are set.
pub fn source_from_config(config: &CollaboratorConfig) -> Result<Box<dyn MetricSource>, ConfigError> {
    match (&config.metrics_url, &config.metrics_file) {
        (Some(url), _) => Ok(Box::new(HttpMetricSource::new(url.clone(), config.api_timeout_secs))),
        (None, Some(path)) => Ok(Box::new(FileMetricSource::new(path.clone()))),
        (None, None) => Err(ConfigError::invalid_value(
            "collaborator",
            "either metrics_url or metrics_file is required to run",
        )),
    }
}

// ============================================================================
// SECTION 23: DECISION ENGINE
// ============================================================================
// One instance per monitored service. It owns every registry and runs the
// full pipeline per cycle:
// samples -> diagnosis -> candidate actions -> optimized plan
// Overlapping cycles on the same instance are rejected, not queued.
// ============================================================================

// ----------------------------------------------------------------------------
// 23.1 Cycle Report
// ----------------------------------------------------------------------------

/// Everything one cycle produced
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub diagnosis: Diagnosis,
    pub plan: ActionPlan,
    pub fitness: PlanFitness,
    pub failures: Vec<ItemFailure>,
    /// `plan.score >= planning.min_plan_score`
    pub accepted: bool,
    pub duration_ms: u64,
}

impl CycleReport {
    pub fn to_json(&self) -> JsonValue {
        json!({
            "diagnostico": self.diagnosis.to_json(),
            "plano": self.plan.to_json(),
            "fitness": self.fitness,
            "falhas": self.failures,
            "aceito": self.accepted,
            "duracao_ms": self.duration_ms,
        })
    }
}

// ----------------------------------------------------------------------------
// 23.2 Engine Statistics
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStats {
    pub instance: String,
    pub uptime_secs: f64,
    pub is_running: bool,
    pub cycles: u64,
    pub accepted_plans: u64,
    pub item_failures: u64,
    pub errors: ErrorStatsSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorStatsSummary {
    pub total: u64,
    pub recoverable: u64,
    pub non_recoverable: u64,
    pub by_category: BTreeMap<String, u64>,
}

// ----------------------------------------------------------------------------
// 23.3 Engine
// ----------------------------------------------------------------------------

/// The decision engine instance
#[derive(Debug)]
pub struct DecisionEngine {
    config: EngineConfig,
    coordinator: DiagnosisCoordinator,
    orchestrator: PlanOrchestrator,
    error_stats: ErrorStats,
    cycle_guard: Mutex<()>,
    cycles: AtomicU64,
    accepted_plans: AtomicU64,
    item_failures: AtomicU64,
    shutdown: Notify,
    running: AtomicBool,
    start_time: Timestamp,
}

impl DecisionEngine {
    /// Build every registry from an already validated configuration.
    pub fn from_config(config: &EngineConfig) -> CerebroResult<Self> {
        let engine = Self {
            config: config.clone(),
            coordinator: DiagnosisCoordinator::new(config)?,
            orchestrator: PlanOrchestrator::new(config)?,
            error_stats: ErrorStats::new(),
            cycle_guard: Mutex::new(()),
            cycles: AtomicU64::new(0),
            accepted_plans: AtomicU64::new(0),
            item_failures: AtomicU64::new(0),
            shutdown: Notify::new(),
            running: AtomicBool::new(false),
            start_time: Timestamp::now(),
        };

        info!(
            target: "cerebro::engine",
            instance = %config.engine.instance_name,
            environment = %config.engine.environment,
            patterns = engine.coordinator.patterns().len(),
            rules = engine.coordinator.rules().rules().len(),
            templates = engine.orchestrator.hotfix().template_count(),
            "Decision engine ready"
        );
        Ok(engine)
    }

    /// Create engine from configuration file
    pub fn from_config_file<P: AsRef<Path>>(path: P) -> CerebroResult<Self> {
        let config = EngineConfig::load(path)?;
        Self::from_config(&config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &DiagnosisCoordinator {
        &self.coordinator
    }

    pub fn orchestrator(&self) -> &PlanOrchestrator {
        &self.orchestrator
    }

    pub fn is_running(&self) -> bool {
        self.running.load(AtomicOrdering::Acquire)
    }

    /// Run one full cycle on `samples`. Sub-step failures land in the
    /// report; the only error is an overlapping cycle.
    pub fn run_cycle(&self, samples: &[MetricSample]) -> CerebroResult<CycleReport> {
        self.run_cycle_with(samples, Vec::new())
    }

    fn run_cycle_with(&self, samples: &[MetricSample], mut failures: Vec<ItemFailure>) -> CerebroResult<CycleReport> {
        let Some(_guard) = self.cycle_guard.try_lock() else {
            let error = CerebroError::CycleInProgress;
            self.error_stats.record(&error);
            return Err(error);
        };
        let timer = PerfTimer::with_threshold("cycle", CYCLE_WARN_THRESHOLD_MS);

        let outcome = self.coordinator.process(samples);
        failures.extend(outcome.failures);
        let diagnosis = outcome.diagnosis;

        let (plan, fitness) = match self.orchestrator.generate_plan(&diagnosis) {
            Ok(planned) => {
                failures.extend(planned.failures);
                (planned.plan, planned.fitness)
            }
            Err(e) => {
                let failure = ItemFailure::new(FailureStage::Generate, diagnosis.id.clone(), &e);
                log_failure!(failure);
                failures.push(failure);
                (ActionPlan::new(&diagnosis.id, Vec::new(), 0.0, Vec::new())?, PlanFitness::default())
            }
        };

        for failure in &failures {
            self.error_stats.record_failure(failure);
        }
        let accepted = plan.score() >= self.config.planning.min_plan_score;
        self.cycles.fetch_add(1, AtomicOrdering::Relaxed);
        self.item_failures.fetch_add(failures.len() as u64, AtomicOrdering::Relaxed);
        if accepted {
            self.accepted_plans.fetch_add(1, AtomicOrdering::Relaxed);
        }

        let duration_ms = timer.stop();
        log_cycle!(
            diagnosis.id,
            diagnosis.anomalies.len(),
            plan.score(),
            plan_id = %plan.id(),
            actions = plan.actions().len(),
            failures = failures.len(),
            accepted = accepted,
            duration_ms = duration_ms
        );

        Ok(CycleReport { diagnosis, plan, fitness, failures, accepted, duration_ms })
    }

    /// Fetch from `source` and run a cycle. A collaborator error degrades
    /// to an empty batch plus a `collect` failure.
    pub async fn collect_and_run(&self, source: &dyn MetricSource) -> CerebroResult<CycleReport> {
        let mut failures = Vec::new();
        let samples = match source.fetch().await {
            Ok(batch) => {
                for (index, error) in &batch.rejected {
                    let failure = ItemFailure::new(FailureStage::Ingest, format!("{}#{}", source.name(), index), error);
                    log_failure!(failure);
                    failures.push(failure);
                }
                batch.samples
            }
            Err(e) => {
                warn!(
                    target: "cerebro::engine",
                    source = %source.name(),
                    error = %e,
                    hint = ?e.recovery_hint(),
                    "Metric source unavailable, running on an empty batch"
                );
                failures.push(ItemFailure::new(FailureStage::Collect, source.name(), &e));
                Vec::new()
            }
        };
        self.run_cycle_with(&samples, failures)
    }

    /// Periodic cycles until `shutdown` is called or `max_cycles` ran.
    pub async fn run(&self, source: &dyn MetricSource, max_cycles: Option<u64>) -> CerebroResult<()> {
        info!(
            target: "cerebro::engine",
            version = ENGINE_VERSION,
            source = %source.name(),
            interval_ms = self.config.engine.cycle_interval_ms,
            "Starting decision loop"
        );
        self.running.store(true, AtomicOrdering::Release);

        let mut ticker = interval(Duration::from_millis(self.config.engine.cycle_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut completed = 0u64;

        while self.running.load(AtomicOrdering::Acquire) {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.collect_and_run(source).await {
                        Ok(report) if !report.accepted => {
                            debug!(
                                target: "cerebro::engine",
                                plan = %report.plan.id(),
                                score = report.plan.score(),
                                min_score = self.config.planning.min_plan_score,
                                "Plan below minimum score"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(target: "cerebro::engine", error = %e, "Cycle skipped");
                        }
                    }
                    completed += 1;
                    if max_cycles.is_some_and(|max| completed >= max) {
                        break;
                    }
                }
                _ = self.shutdown.notified() => {
                    info!(target: "cerebro::engine", "Shutdown notification received");
                    break;
                }
            }
        }

        self.running.store(false, AtomicOrdering::Release);
        info!(target: "cerebro::engine", cycles = completed, "Decision loop stopped");
        Ok(())
    }

    /// Signal shutdown
    pub fn shutdown(&self) {
        info!(target: "cerebro::engine", "Shutdown signal received");
        self.running.store(false, AtomicOrdering::Release);
        self.shutdown.notify_one();
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            instance: self.config.engine.instance_name.clone(),
            uptime_secs: Timestamp::now().secs_since(self.start_time),
            is_running: self.is_running(),
            cycles: self.cycles.load(AtomicOrdering::Relaxed),
            accepted_plans: self.accepted_plans.load(AtomicOrdering::Relaxed),
            item_failures: self.item_failures.load(AtomicOrdering::Relaxed),
            errors: ErrorStatsSummary {
                total: self.error_stats.total_errors(),
                recoverable: self.error_stats.recoverable_count.load(AtomicOrdering::Relaxed),
                non_recoverable: self.error_stats.non_recoverable_count.load(AtomicOrdering::Relaxed),
                by_category: self.error_stats.snapshot(),
            },
        }
    }
}

// ============================================================================
// SECTION 24: CLI & COMMAND LINE INTERFACE
// ============================================================================
// Subcommands:
// - run: periodic cycles from the configured metric source
// - diagnose: one cycle over a JSON file of samples
// - validate / generate-config / version
// ============================================================================

// ----------------------------------------------------------------------------
// 24.1 CLI Argument Parser
// ----------------------------------------------------------------------------

/// Cerebro Healer CLI
#[derive(Parser, Debug)]
#[command(
    name = "cerebro-healer",
    author = "AIOps Team",
    version,
    about = "Self-healing decision engine for AIOps",
    long_about = "Cerebro Healer diagnoses anomalous service behavior from dimensional \
                  telemetry and synthesizes an optimized remediation plan of hotfixes, \
                  refactorings and redesigns."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "cerebro-healer.toml", env = "CEREBRO_HEALER_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "CEREBRO_HEALER_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log format override (json, compact, pretty)
    #[arg(long, env = "CEREBRO_HEALER_LOG_FORMAT")]
    pub log_format: Option<String>,

    /// Enable debug mode
    #[arg(short, long, env = "CEREBRO_HEALER_DEBUG")]
    pub debug: bool,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Commands {
    /// Run periodic diagnostic cycles from the configured metric source
    Run {
        /// Stop after this many cycles
        #[arg(long)]
        max_cycles: Option<u64>,
    },

    /// Run one cycle over a JSON array of samples
    Diagnose {
        /// Samples file
        #[arg(short, long)]
        input: PathBuf,

        /// Write the cycle report here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show engine version and build info
    Version,
}

// ----------------------------------------------------------------------------
// 24.2 CLI Handler Functions
// ----------------------------------------------------------------------------

/// Handle the validate subcommand
fn handle_validate(config_path: &Path, verbose: bool) -> CerebroResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    match EngineConfig::load(config_path) {
        Ok(config) => {
            println!("✅ Configuration is valid!");

            if verbose {
                println!("\n📋 Parsed configuration:");
                println!("{}", "=".repeat(60));
                match toml::to_string_pretty(&config) {
                    Ok(s) => println!("{}", s),
                    Err(e) => println!("Failed to serialize: {}", e),
                }
            }

            println!("\n📊 Configuration Summary:");
            println!("  • Instance name: {}", config.engine.instance_name);
            println!("  • Environment: {}", config.engine.environment);
            println!("  • Cycle interval: {}ms", config.engine.cycle_interval_ms);
            println!("  • Aggregation windows: {:?}s", config.aggregation.windows_secs);
            println!(
                "  • Optimizer: population {} x {} generations",
                config.optimizer.population_size, config.optimizer.generations
            );
            println!("  • Minimum plan score: {:.2}", config.planning.min_plan_score);
            println!("  • Catalog:");
            println!("    - {} anomaly patterns", config.catalog.patterns.len());
            println!("    - {} rules", config.catalog.rules.len());
            println!("    - {} hotfix templates", config.catalog.hotfix_templates.len());
            println!("    - {} refactor patterns", config.catalog.refactor_patterns.len());
            println!("    - {} redesign strategies", config.catalog.redesign_strategies.len());
            match (&config.collaborator.metrics_url, &config.collaborator.metrics_file) {
                (Some(url), _) => println!("  • Metric source: {}", url),
                (None, Some(path)) => println!("  • Metric source: {}", path.display()),
                (None, None) => println!("  • Metric source: none (diagnose only)"),
            }

            Ok(())
        }
        Err(e) => {
            println!("❌ Configuration validation failed!");
            println!("Error: {}", e);
            Err(CerebroError::Config(e))
        }
    }
}

/// Handle the generate-config subcommand
fn handle_generate_config(output: Option<&Path>) -> CerebroResult<()> {
    let config_str = EngineConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("✅ Default configuration written to: {}", path.display());
        }
        None => {
            println!("{}", config_str);
        }
    }

    Ok(())
}

/// Handle the diagnose subcommand
fn handle_diagnose(config: &EngineConfig, input: &Path, output: Option<&Path>) -> CerebroResult<CycleReport> {
    let content = fs::read_to_string(input)?;
    let batch = SampleBatch::decode(&serde_json::from_str(&content)?);
    for (index, error) in &batch.rejected {
        warn!(target: "cerebro::cli", index = index, error = %error, "Sample rejected");
    }

    let engine = DecisionEngine::from_config(config)?;
    let report = engine.run_cycle(&batch.samples)?;
    let rendered = serde_json::to_string_pretty(&report.to_json())?;

    match output {
        Some(path) => {
            fs::write(path, &rendered)?;
            println!("✅ Cycle report written to: {}", path.display());
        }
        None => println!("{}", rendered),
    }
    Ok(report)
}

/// Handle the version subcommand
fn handle_version() {
    println!("🧠 {} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!("  • Family: {}", std::env::consts::FAMILY);
    println!("  • Wire schema version: {}", SCHEMA_VERSION);
    println!();
    println!("Features:");
    println!("  • Multi-window temporal aggregation and gradient analysis");
    println!("  • Phase-space chaos detection");
    println!("  • Adaptive rules and pattern catalog");
    println!("  • Hotfix, refactor and redesign generators");
    println!("  • Genetic plan optimization");
}

// ============================================================================
// SECTION 25: MAIN ENTRY POINT
// ============================================================================

/// Resolve SIGINT/SIGTERM into an engine shutdown
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!(target: "cerebro::engine", "Received SIGTERM"),
                    _ = signal::ctrl_c() => info!(target: "cerebro::engine", "Received SIGINT"),
                }
                return;
            }
            Err(e) => warn!(target: "cerebro::engine", error = %e, "SIGTERM handler unavailable"),
        }
    }
    if let Err(e) = signal::ctrl_c().await {
        warn!(target: "cerebro::engine", error = %e, "Ctrl-C handler unavailable");
    }
}

/// Main entry point for the Cerebro healer
#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Subcommands that don't need full initialization
    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        _ => {}
    }

    let config = if cli.config.exists() {
        EngineConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    } else {
        EngineConfig::default()
    };

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if let Some(format) = &cli.log_format {
        logging_config.format = format.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }
    init_logging(&logging_config)?;

    if !cli.config.exists() {
        warn!("Config file not found at {}, using defaults", cli.config.display());
    }

    match cli.command {
        Some(Commands::Diagnose { input, output }) => {
            handle_diagnose(&config, &input, output.as_deref())
                .with_context(|| format!("Diagnosis over {} failed", input.display()))?;
        }
        Some(Commands::Run { max_cycles }) => {
            run_engine(&config, max_cycles).await?;
        }
        None => {
            run_engine(&config, None).await?;
        }
        Some(Commands::Version | Commands::GenerateConfig { .. } | Commands::Validate { .. }) => {}
    }

    Ok(())
}

async fn run_engine(config: &EngineConfig, max_cycles: Option<u64>) -> AnyhowResult<()> {
    info!("🧠 {} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let source = source_from_config(&config.collaborator).context("No metric source configured")?;
    let engine = Arc::new(DecisionEngine::from_config(config)?);

    let signalled = Arc::clone(&engine);
    tokio::spawn(async move {
        wait_for_signal().await;
        signalled.shutdown();
    });

    engine.run(source.as_ref(), max_cycles).await?;

    let stats = engine.stats();
    info!(
        target: "cerebro::engine",
        cycles = stats.cycles,
        accepted_plans = stats.accepted_plans,
        item_failures = stats.item_failures,
        errors = stats.errors.total,
        "Engine shutdown complete"
    );
    Ok(())
}

// ============================================================================
// SECTION 26: PHASE 4 TESTS - SOURCES, ENGINE & CLI
// ============================================================================

#[cfg(test)]
mod engine_tests {
    use super::*;
    use mockall::mock;
    use pretty_assertions::assert_eq;
    use rstest::{fixture, rstest};
    use std::io::Write;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    mock! {
        pub Source {}

        #[async_trait]
        impl MetricSource for Source {
            fn name(&self) -> &str;
            async fn fetch(&self) -> Result<SampleBatch, CollaboratorError>;
        }
    }

    impl Debug for MockSource {
        fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
            f.debug_struct("MockSource").finish()
        }
    }

    fn latency(value: f64) -> MetricSample {
        MetricSample::new("tempo_resposta", value, Timestamp::from_secs(1_700_000_000), dimensions::LATENCY, "ms")
    }

    fn seeded_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.optimizer.seed = Some(11);
        config.chaos.seed = Some(11);
        config.engine.cycle_interval_ms = MIN_CYCLE_INTERVAL_MS;
        config
    }

    #[fixture]
    fn engine() -> DecisionEngine {
        DecisionEngine::from_config(&seeded_config()).unwrap()
    }

    fn samples_file(body: &JsonValue) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", body).unwrap();
        file
    }

    fn test_client() -> HttpClient {
        HttpClient::builder().no_proxy().timeout(Duration::from_secs(2)).build().unwrap()
    }

    /// Answer exactly one request with `status_line` and `body`.
    async fn serve_once(status_line: &'static str, body: String) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 4096];
            let _ = socket.read(&mut request).await;
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
        });
        format!("http://{}/metrics", addr)
    }

    // ------------------------------------------------------------------------
    // Metric sources
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_file_source_rejects_invalid_samples_individually() {
        let mut broken = latency(10.0).to_json();
        broken.as_object_mut().unwrap().remove("valor");
        let file = samples_file(&json!([latency(700.0).to_json(), broken, "not a sample"]));

        let source = FileMetricSource::new(file.path());
        let batch = source.fetch().await.unwrap();

        assert_eq!(batch.samples.len(), 1);
        assert_eq!(batch.samples[0].value, 700.0);
        assert_eq!(batch.rejected.len(), 2);
        assert_eq!(batch.rejected[0], (1, ValidationError::MissingField { field: "valor".into() }));
        assert_eq!(batch.rejected[1].0, 2);
        assert!(source.name().starts_with("file:"));
    }

    #[tokio::test]
    async fn test_file_source_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = FileMetricSource::new(dir.path().join("absent.json"));

        let err = source.fetch().await.unwrap_err();
        assert!(matches!(err, CollaboratorError::Io { .. }));
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn test_file_source_malformed_json_is_invalid_response() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();

        let err = FileMetricSource::new(file.path()).fetch().await.unwrap_err();
        assert!(matches!(err, CollaboratorError::InvalidResponse { .. }));
        assert_eq!(err.recovery_hint(), RecoveryHint::Skip);
    }

    #[tokio::test]
    async fn test_http_source_decodes_sample_array() {
        let body = json!([latency(1500.0).to_json(), latency(1400.0).to_json()]).to_string();
        let url = serve_once("200 OK", body).await;

        let source = HttpMetricSource::with_client(url.clone(), 2, test_client());
        let batch = source.fetch().await.unwrap();

        assert_eq!(source.url(), url);
        assert_eq!(batch.samples.len(), 2);
        assert!(batch.rejected.is_empty());
    }

    #[tokio::test]
    async fn test_http_source_maps_error_status() {
        let url = serve_once("503 Service Unavailable", "[]".into()).await;

        let err = HttpMetricSource::with_client(url, 2, test_client()).fetch().await.unwrap_err();
        match err {
            CollaboratorError::HttpStatus { status, .. } => assert_eq!(status, 503),
            other => panic!("expected HttpStatus, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_http_source_non_json_body_is_invalid_response() {
        let url = serve_once("200 OK", "<html></html>".into()).await;

        let err = HttpMetricSource::with_client(url, 2, test_client()).fetch().await.unwrap_err();
        assert!(matches!(err, CollaboratorError::InvalidResponse { .. }));
    }

    #[test]
    fn test_source_from_config_prefers_url() {
        let mut config = CollaboratorConfig::default();
        assert!(source_from_config(&config).is_err());

        config.metrics_file = Some(PathBuf::from("/tmp/samples.json"));
        assert_eq!(source_from_config(&config).unwrap().name(), "file:/tmp/samples.json");

        config.metrics_url = Some("http://collector:8080/metrics".into());
        assert_eq!(source_from_config(&config).unwrap().name(), "http:http://collector:8080/metrics");
    }

    // ------------------------------------------------------------------------
    // Decision engine
    // ------------------------------------------------------------------------

    #[rstest]
    fn test_cycle_builds_plan_for_latency_breach(engine: DecisionEngine) {
        let report = engine.run_cycle(&[latency(1500.0)]).unwrap();

        assert_eq!(report.diagnosis.root_cause.as_deref(), Some("Latência elevada"));
        assert_eq!(report.diagnosis.confidence, 1.0);
        assert_eq!(report.plan.diagnosis_id(), report.diagnosis.id);
        assert!(!report.plan.actions().is_empty());
        assert!(report.plan.score() > 0.0);
        assert_eq!(report.plan.score(), report.fitness.total);
        assert_eq!(report.plan.impacted_metrics(), ["tempo_resposta".to_string()]);
        assert!(report.accepted);

        assert!(engine.coordinator().diagnosis(&report.diagnosis.id).is_ok());
        assert!(engine.orchestrator().plan(report.plan.id()).is_ok());

        let stats = engine.stats();
        assert_eq!(stats.cycles, 1);
        assert_eq!(stats.accepted_plans, 1);
        assert!(!stats.is_running);
    }

    #[rstest]
    fn test_cycle_survives_out_of_range_timestamps(engine: DecisionEngine) {
        let mut far_future = latency(1500.0).to_json();
        far_future["timestamp"] = json!(1e30);
        let mut far_past = latency(1500.0).to_json();
        far_past["timestamp"] = json!(-1e30);
        let batch = SampleBatch::decode(&json!([far_future, latency(1500.0).to_json(), far_past]));

        assert_eq!(batch.samples.len(), 1);
        assert_eq!(batch.rejected.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![0, 2]);

        let report = engine.run_cycle(&batch.samples).unwrap();
        assert_eq!(report.diagnosis.analyzed_metrics.len(), 1);
        assert_eq!(report.diagnosis.root_cause.as_deref(), Some("Latência elevada"));

        let later = MetricSample::new(
            "tempo_resposta",
            1400.0,
            Timestamp::from_secs(1_700_000_030),
            dimensions::LATENCY,
            "ms",
        );
        engine.run_cycle(&[later]).unwrap();
        let trend = engine.coordinator().aggregator().trend(dimensions::LATENCY, "tempo_resposta", 60);
        assert_eq!(trend.samples, 2);
    }

    #[rstest]
    fn test_cycle_on_empty_batch_is_quiet(engine: DecisionEngine) {
        let report = engine.run_cycle(&[]).unwrap();

        assert!(report.diagnosis.anomalies.is_empty());
        assert_eq!(report.diagnosis.root_cause, None);
        assert_eq!(report.diagnosis.confidence, 0.0);
        assert_eq!(report.plan.diagnosis_id(), report.diagnosis.id);
    }

    #[test]
    fn test_plan_below_minimum_score_is_not_accepted() {
        let mut config = seeded_config();
        config.planning.min_plan_score = 1.0;
        let engine = DecisionEngine::from_config(&config).unwrap();

        let report = engine.run_cycle(&[latency(1500.0)]).unwrap();
        assert!(report.plan.score() < 1.0);
        assert!(!report.accepted);
        assert_eq!(engine.stats().accepted_plans, 0);
        assert_eq!(engine.stats().cycles, 1);
    }

    #[rstest]
    fn test_overlapping_cycle_is_rejected(engine: DecisionEngine) {
        let held = engine.cycle_guard.lock();
        let err = engine.run_cycle(&[latency(1500.0)]).unwrap_err();
        drop(held);

        assert!(matches!(err, CerebroError::CycleInProgress));
        let stats = engine.stats();
        assert_eq!(stats.cycles, 0);
        assert_eq!(stats.errors.by_category.get("scheduling"), Some(&1));

        assert!(engine.run_cycle(&[latency(1500.0)]).is_ok());
    }

    #[rstest]
    #[tokio::test]
    async fn test_unavailable_source_degrades_to_empty_batch(engine: DecisionEngine) {
        let mut source = MockSource::new();
        source.expect_name().return_const("mock".to_string());
        source.expect_fetch().times(1).returning(|| {
            Err(CollaboratorError::ConnectionFailed { endpoint: "mock".into(), message: "refused".into() })
        });

        let report = engine.collect_and_run(&source).await.unwrap();

        assert!(report.diagnosis.anomalies.is_empty());
        assert!(report.diagnosis.analyzed_metrics.is_empty());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].stage, FailureStage::Collect);
        assert_eq!(report.failures[0].item, "mock");

        let stats = engine.stats();
        assert_eq!(stats.item_failures, 1);
        assert_eq!(stats.errors.by_category.get("collaborator"), Some(&1));
    }

    #[rstest]
    #[tokio::test]
    async fn test_rejected_samples_become_ingest_failures(engine: DecisionEngine) {
        let mut source = MockSource::new();
        source.expect_name().return_const("mock".to_string());
        source.expect_fetch().times(1).returning(|| {
            Ok(SampleBatch {
                samples: vec![latency(1500.0)],
                rejected: vec![(3, ValidationError::MissingField { field: "nome".into() })],
            })
        });

        let report = engine.collect_and_run(&source).await.unwrap();

        assert_eq!(report.diagnosis.analyzed_metrics.len(), 1);
        assert_eq!(report.diagnosis.root_cause.as_deref(), Some("Latência elevada"));
        let ingest: Vec<&ItemFailure> =
            report.failures.iter().filter(|f| f.stage == FailureStage::Ingest).collect();
        assert_eq!(ingest.len(), 1);
        assert_eq!(ingest[0].item, "mock#3");
        assert_eq!(engine.stats().errors.by_category.get("validation"), Some(&1));
    }

    #[tokio::test]
    async fn test_run_stops_after_max_cycles() {
        let file = samples_file(&json!([latency(1500.0).to_json()]));
        let engine = DecisionEngine::from_config(&seeded_config()).unwrap();
        let source = FileMetricSource::new(file.path());

        engine.run(&source, Some(2)).await.unwrap();

        let stats = engine.stats();
        assert_eq!(stats.cycles, 2);
        assert!(!stats.is_running);
        assert_eq!(engine.coordinator().recent_diagnoses().len(), 2);
        assert_eq!(engine.orchestrator().recent_plans().len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_stops_running_loop() {
        let file = samples_file(&json!([latency(300.0).to_json()]));
        let engine = Arc::new(DecisionEngine::from_config(&seeded_config()).unwrap());
        let source = Arc::new(FileMetricSource::new(file.path()));

        let runner = {
            let engine = Arc::clone(&engine);
            let source = Arc::clone(&source);
            tokio::spawn(async move { engine.run(source.as_ref(), None).await })
        };

        tokio::time::sleep(Duration::from_millis(250)).await;
        engine.shutdown();

        let finished = tokio::time::timeout(Duration::from_secs(5), runner).await;
        assert!(matches!(finished, Ok(Ok(Ok(())))));
        assert!(!engine.is_running());
        assert!(engine.stats().cycles >= 1);
    }

    #[rstest]
    fn test_report_json_links_plan_to_diagnosis(engine: DecisionEngine) {
        let report = engine.run_cycle(&[latency(1500.0)]).unwrap();
        let json = report.to_json();

        assert_eq!(json["plano"]["diagnostico_id"], json["diagnostico"]["id"]);
        assert_eq!(json["aceito"], JsonValue::Bool(true));
        assert_eq!(json["falhas"], json!([]));
    }

    // ------------------------------------------------------------------------
    // CLI
    // ------------------------------------------------------------------------

    #[test]
    fn test_cli_parses_diagnose() {
        let cli = Cli::try_parse_from(["cerebro-healer", "diagnose", "--input", "samples.json", "-o", "out.json"]).unwrap();

        assert_eq!(
            cli.command,
            Some(Commands::Diagnose { input: PathBuf::from("samples.json"), output: Some(PathBuf::from("out.json")) })
        );
    }

    #[test]
    fn test_cli_parses_run_and_overrides() {
        let cli = Cli::try_parse_from([
            "cerebro-healer",
            "--config",
            "custom.toml",
            "--log-format",
            "json",
            "run",
            "--max-cycles",
            "3",
        ])
        .unwrap();

        assert_eq!(cli.config, PathBuf::from("custom.toml"));
        assert_eq!(cli.log_format.as_deref(), Some("json"));
        assert_eq!(cli.command, Some(Commands::Run { max_cycles: Some(3) }));
    }

    #[test]
    fn test_cli_diagnose_requires_input() {
        assert!(Cli::try_parse_from(["cerebro-healer", "diagnose"]).is_err());
    }

    #[test]
    fn test_diagnose_command_writes_report() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("samples.json");
        let output = dir.path().join("report.json");
        fs::write(&input, json!([latency(1500.0).to_json(), {"nome": "incompleta"}]).to_string()).unwrap();

        let report = handle_diagnose(&seeded_config(), &input, Some(&output)).unwrap();
        assert_eq!(report.diagnosis.analyzed_metrics.len(), 1);

        let written: JsonValue = serde_json::from_str(&fs::read_to_string(&output).unwrap()).unwrap();
        assert_eq!(written["diagnostico"]["id"], JsonValue::String(report.diagnosis.id.clone()));
        assert_eq!(written["diagnostico"]["causa_raiz"], json!("Latência elevada"));
    }

    #[test]
    fn test_generated_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cerebro-healer.toml");

        handle_generate_config(Some(&path)).unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.engine.cycle_interval_ms, DEFAULT_CYCLE_INTERVAL_MS);
        assert!(DecisionEngine::from_config(&config).is_ok());
    }
}
