//! Challenge Instance Control Plane
//!
//! Keeps a fleet of CTF challenge instances converged between what the
//! orchestrator reports as running and what the instance store records.
//! Resolves declarative challenge definitions into deployable objects and
//! extracts per-instance flags from the secret store.
//!
//! ## Module Structure
//!
//! - `config`: runtime configuration from environment variables
//! - `error`: error taxonomy shared across the crate
//! - `definition`: CDF/CTD parsing, schema validation, type definition store
//! - `challenge_type`: challenge type canonicalization and suggestions
//! - `template`: `{{VAR}}` substitution over JSON documents
//! - `provision`: CDF resolution into infrastructure objects
//! - `status`: instance lifecycle state machine
//! - `flag`: flag extraction from embedded values and the secret store
//! - `orchestrator`: read-only orchestrator API client
//! - `store`: instance persistence (PostgreSQL with in-memory fallback)
//! - `rate_limit`: fixed-window rate limiting
//! - `reconciler`: the periodic convergence loop
//! - `api`: read-only HTTP surface

/// Runtime configuration
pub mod config;

/// Error taxonomy
pub mod error;

/// CDF/CTD documents and the type definition store
pub mod definition;

/// Challenge type canonicalization
pub mod challenge_type;

/// Variable substitution
pub mod template;

/// Challenge resolution
pub mod provision;

/// Lifecycle state machine
pub mod status;

/// Flag extraction
pub mod flag;

/// Orchestrator client
pub mod orchestrator;

/// Instance persistence
pub mod store;

/// Fixed-window rate limiting
pub mod rate_limit;

/// Convergence loop
pub mod reconciler;

/// HTTP surface
pub mod api;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use api::{run_api, ApiState};
pub use challenge_type::{
    normalize_challenge_type, validate_challenge_type, ChallengeType, NormalizedType,
};
pub use config::ControlConfig;
pub use definition::{parse_document, serialize_document, TypeDef, TypeDefStore};
pub use error::{ControlError, ControlResult, SchemaViolation};
pub use flag::{FlagResolver, HttpSecretClient, ResolvedFlag, SecretClient, SecretLookup};
pub use orchestrator::{
    challenge_id_from_instance, instance_name, wait_for_address, LiveInstance, OrchestratorClient,
    INSTANCE_PREFIX,
};
pub use provision::{resolve_challenge, ResolvedChallenge};
pub use rate_limit::{
    MemoryRateStore, PgRateStore, RateLimiter, RateLimiterConfig, RateStore, RateWindow,
};
pub use reconciler::{
    spawn_reconciler, CycleStats, EngineStatus, Reconciler, ReconcilerConfig,
};
pub use status::{can_transition, transition, ChallengeStatus, StatusEvent};
pub use store::{
    ChallengeInstance, InstanceStore, MemoryInstanceStore, PgInstanceStore,
};
pub use template::{substitute_variables, VariablesMap};
