//! Strongly-typed domain values shared across the kernel
//!
//! Identifiers and bounded configuration values are newtypes to prevent
//! primitive obsession; numeric values carry their validation ranges.

use nutype::nutype;
use uuid::Uuid;

/// Unique identifier for a message on the bus
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct MessageId(Uuid);

impl MessageId {
    /// Creates a new random message ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Identifier shared across a causal chain of messages
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Creates a new random correlation ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Identifier for a submitted workflow, e.g. `extraction_1a2b3c4d`
#[nutype(
    sanitize(trim),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        From,
        Into,
        AsRef
    )
)]
pub struct WorkflowId(String);

impl WorkflowId {
    /// Creates a new id with the given prefix and a short random suffix
    #[must_use]
    pub fn generate(prefix: &str) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self::new(format!("{prefix}_{}", &suffix[..8]))
    }
}

/// Identifier for one step of a workflow DAG, unique within the workflow
#[nutype(
    sanitize(trim),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        From,
        Into,
        AsRef
    )
)]
pub struct StepId(String);

impl StepId {
    /// Derives a step id from its workflow and a stage name
    #[must_use]
    pub fn for_stage(workflow_id: &WorkflowId, stage: &str) -> Self {
        Self::new(format!("{workflow_id}_{stage}"))
    }
}

/// Identifier for a registered worker instance
#[nutype(
    sanitize(trim),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        From,
        Into,
        AsRef
    )
)]
pub struct WorkerId(String);

impl WorkerId {
    /// Creates a new id with the given role prefix and a short random suffix
    #[must_use]
    pub fn generate(role: &str) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self::new(format!("{role}_{}", &suffix[..8]))
    }
}

/// Name of a bus queue
#[nutype(
    sanitize(trim),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        From,
        Into,
        AsRef
    )
)]
pub struct QueueName(String);

impl QueueName {
    /// Convenience constructor from a static name
    #[must_use]
    pub fn from_static(name: &str) -> Self {
        Self::new(name.to_string())
    }
}

/// Maximum number of messages a queue holds before routing to dead-letter
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1_000_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 1000
)]
pub struct QueueCapacity(usize);

impl QueueCapacity {
    /// Gets the value as usize
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Maximum retry attempts for a failed step or external call
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 10),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 3
)]
pub struct MaxRetries(u32);

impl MaxRetries {
    /// Gets the value as u32
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }
}

/// Base delay for exponential retry backoff, in milliseconds
#[nutype(
    validate(greater_or_equal = 100, less_or_equal = 300_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 1000
)]
pub struct RetryBaseDelayMs(u64);

impl RetryBaseDelayMs {
    /// Converts to Duration
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.into_inner())
    }
}

/// Upper bound on workflows running concurrently
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 10
)]
pub struct MaxConcurrentWorkflows(usize);

impl MaxConcurrentWorkflows {
    /// Gets the value as usize
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Number of permits in a bounded-concurrency pool
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 10_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 10
)]
pub struct PermitCount(usize);

impl PermitCount {
    /// Gets the value as usize
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Byte budget for the local in-memory cache layer
#[nutype(
    validate(greater_or_equal = 1024, less_or_equal = 17_179_869_184),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 104_857_600
)]
pub struct CacheByteBudget(usize);

impl CacheByteBudget {
    /// Gets the value as usize
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(MessageId::generate(), MessageId::generate());
        assert_ne!(CorrelationId::generate(), CorrelationId::generate());
    }

    #[test]
    fn workflow_and_step_ids_compose() {
        let wf = WorkflowId::new("extraction_cafe0123".to_string());
        let step = StepId::for_stage(&wf, "html_extraction");
        assert_eq!(step.to_string(), "extraction_cafe0123_html_extraction");
    }

    #[test]
    fn bounded_values_reject_out_of_range() {
        assert!(QueueCapacity::try_new(0).is_err());
        assert!(MaxRetries::try_new(11).is_err());
        assert!(RetryBaseDelayMs::try_new(50).is_err());
        assert!(MaxConcurrentWorkflows::try_new(0).is_err());
    }

    #[test]
    fn defaults_match_documented_values() {
        assert_eq!(QueueCapacity::default().as_usize(), 1000);
        assert_eq!(MaxRetries::default().as_u32(), 3);
        assert_eq!(MaxConcurrentWorkflows::default().as_usize(), 10);
    }
}
