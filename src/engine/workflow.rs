//! Workflows, steps, and DAG construction
//!
//! A workflow is a job plus its ordered step collection. Steps reference
//! their prerequisites by id; the DAG builder wires the default extraction
//! shape and custom DAGs are validated for unresolved references and cycles
//! before any step is dispatched.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::domain_types::{CorrelationId, StepId, WorkflowId};

/// Roles a step can require and a worker can fill
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRole {
    Analysis,
    Orchestrator,
    HtmlExtractor,
    PdfAnalyzer,
    VisionProcessor,
    Validator,
}

impl WorkerRole {
    /// Wire name of the role
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analysis => "analysis",
            Self::Orchestrator => "orchestrator",
            Self::HtmlExtractor => "html_extractor",
            Self::PdfAnalyzer => "pdf_analyzer",
            Self::VisionProcessor => "vision_processor",
            Self::Validator => "validator",
        }
    }

    /// Parses a wire name
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "analysis" => Some(Self::Analysis),
            "orchestrator" => Some(Self::Orchestrator),
            "html_extractor" => Some(Self::HtmlExtractor),
            "pdf_analyzer" => Some(Self::PdfAnalyzer),
            "vision_processor" => Some(Self::VisionProcessor),
            "validator" => Some(Self::Validator),
            _ => None,
        }
    }
}

impl std::fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state shared by workflows and steps. Terminal states are
/// sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Scheduling hint for a step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// Analysis worker thoroughness
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisDepth {
    Basic,
    #[default]
    Standard,
    Deep,
}

/// Vision worker thoroughness
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageAnalysisDepth {
    #[default]
    Basic,
    Full,
}

/// Validator strictness
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationLevel {
    Basic,
    #[default]
    Standard,
    Strict,
}

/// Recognized options of an extraction job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub analysis_depth: AnalysisDepth,
    pub include_pdfs: bool,
    pub include_images: bool,
    pub ocr_enabled: bool,
    pub image_analysis_depth: ImageAnalysisDepth,
    pub validation_level: ValidationLevel,
    pub priority: TaskPriority,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            analysis_depth: AnalysisDepth::default(),
            include_pdfs: true,
            include_images: false,
            ocr_enabled: true,
            image_analysis_depth: ImageAnalysisDepth::default(),
            validation_level: ValidationLevel::default(),
            priority: TaskPriority::default(),
        }
    }
}

/// One node of a workflow's DAG
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowStep {
    pub step_id: StepId,
    pub role: WorkerRole,
    pub description: String,
    pub input: Value,
    pub prerequisites: Vec<StepId>,
    pub priority: TaskPriority,
    pub status: ExecutionStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl WorkflowStep {
    #[must_use]
    pub fn new(step_id: StepId, role: WorkerRole, description: &str, input: Value) -> Self {
        Self {
            step_id,
            role,
            description: description.to_string(),
            input,
            prerequisites: Vec::new(),
            priority: TaskPriority::Normal,
            status: ExecutionStatus::Pending,
            result: None,
            error: None,
            started_at: None,
            finished_at: None,
            retry_count: 0,
            max_retries: 3,
        }
    }

    #[must_use]
    pub fn after(mut self, prerequisites: Vec<StepId>) -> Self {
        self.prerequisites = prerequisites;
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }
}

/// A job plus its ordered step collection
#[derive(Debug, Clone, Serialize)]
pub struct Workflow {
    pub workflow_id: WorkflowId,
    pub name: String,
    pub description: String,
    pub url: Option<String>,
    pub steps: Vec<WorkflowStep>,
    pub status: ExecutionStatus,
    pub correlation_id: CorrelationId,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: Value,
}

impl Workflow {
    #[must_use]
    pub fn new(workflow_id: WorkflowId, name: String, description: String) -> Self {
        Self {
            workflow_id,
            name,
            description,
            url: None,
            steps: Vec::new(),
            status: ExecutionStatus::Pending,
            correlation_id: CorrelationId::generate(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            metadata: json!({}),
        }
    }

    pub fn step(&self, step_id: &StepId) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| &s.step_id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &StepId) -> Option<&mut WorkflowStep> {
        self.steps.iter_mut().find(|s| &s.step_id == step_id)
    }

    /// Completed steps over total steps
    #[must_use]
    pub fn progress(&self) -> f64 {
        if self.steps.is_empty() {
            return 0.0;
        }
        let completed = self
            .steps
            .iter()
            .filter(|s| s.status == ExecutionStatus::Completed)
            .count();
        completed as f64 / self.steps.len() as f64
    }

    /// Steps that are pending with every prerequisite completed
    #[must_use]
    pub fn ready_steps(&self) -> Vec<StepId> {
        let completed: HashSet<&StepId> = self
            .steps
            .iter()
            .filter(|s| s.status == ExecutionStatus::Completed)
            .map(|s| &s.step_id)
            .collect();
        self.steps
            .iter()
            .filter(|s| {
                s.status == ExecutionStatus::Pending
                    && s.prerequisites.iter().all(|p| completed.contains(p))
            })
            .map(|s| s.step_id.clone())
            .collect()
    }

    /// Whether every step has reached a terminal state
    #[must_use]
    pub fn all_steps_terminal(&self) -> bool {
        self.steps.iter().all(|s| s.status.is_terminal())
    }

    /// Terminal status precedence: cancelled over failed over completed
    #[must_use]
    pub fn final_status(&self) -> ExecutionStatus {
        if self
            .steps
            .iter()
            .any(|s| s.status == ExecutionStatus::Cancelled)
        {
            ExecutionStatus::Cancelled
        } else if self.steps.iter().any(|s| s.status == ExecutionStatus::Failed) {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Completed
        }
    }
}

/// Stage names used by the default extraction DAG
pub mod stages {
    pub const ANALYSIS: &str = "analysis";
    pub const ORCHESTRATION: &str = "orchestration";
    pub const HTML_EXTRACTION: &str = "html_extraction";
    pub const PDF_ANALYSIS: &str = "pdf_analysis";
    pub const VISION_PROCESSING: &str = "vision_processing";
    pub const VALIDATION: &str = "validation";
}

/// Builds the default extraction DAG for a URL:
///
/// ```text
/// analysis -> orchestration -> html_extraction    -> validation
///                           -> pdf_analysis?       ^
///                           -> vision_processing?  ^
/// ```
///
/// Optional extractors are included per the config; validation's
/// prerequisites are exactly the extractors present.
#[must_use]
pub fn build_extraction_workflow(url: &str, config: &ExtractionConfig) -> Workflow {
    let workflow_id = WorkflowId::generate("extraction");
    let analysis_id = StepId::for_stage(&workflow_id, stages::ANALYSIS);
    let orchestration_id = StepId::for_stage(&workflow_id, stages::ORCHESTRATION);
    let html_id = StepId::for_stage(&workflow_id, stages::HTML_EXTRACTION);
    let validation_id = StepId::for_stage(&workflow_id, stages::VALIDATION);

    let mut steps = vec![
        WorkflowStep::new(
            analysis_id.clone(),
            WorkerRole::Analysis,
            "Analyze website and determine extraction strategy",
            json!({ "url": url, "analysis_depth": config.analysis_depth }),
        )
        .with_priority(config.priority),
        WorkflowStep::new(
            orchestration_id.clone(),
            WorkerRole::Orchestrator,
            "Plan and coordinate the extraction process",
            json!({ "url": url, "config": config }),
        )
        .after(vec![analysis_id])
        .with_priority(config.priority),
        WorkflowStep::new(
            html_id.clone(),
            WorkerRole::HtmlExtractor,
            "Extract content from HTML pages",
            json!({ "url": url, "extraction_strategy": "adaptive" }),
        )
        .after(vec![orchestration_id.clone()])
        .with_priority(config.priority),
    ];

    let mut validation_prereqs = vec![html_id];

    if config.include_pdfs {
        let pdf_id = StepId::for_stage(&workflow_id, stages::PDF_ANALYSIS);
        steps.push(
            WorkflowStep::new(
                pdf_id.clone(),
                WorkerRole::PdfAnalyzer,
                "Analyze and extract content from PDF documents",
                json!({ "url": url, "ocr_enabled": config.ocr_enabled }),
            )
            .after(vec![orchestration_id.clone()])
            .with_priority(config.priority),
        );
        validation_prereqs.push(pdf_id);
    }

    if config.include_images {
        let vision_id = StepId::for_stage(&workflow_id, stages::VISION_PROCESSING);
        steps.push(
            WorkflowStep::new(
                vision_id.clone(),
                WorkerRole::VisionProcessor,
                "Process images and visual content",
                json!({ "url": url, "image_analysis_depth": config.image_analysis_depth }),
            )
            .after(vec![orchestration_id.clone()])
            .with_priority(config.priority),
        );
        validation_prereqs.push(vision_id);
    }

    steps.push(
        WorkflowStep::new(
            validation_id,
            WorkerRole::Validator,
            "Validate extracted content quality",
            json!({ "validation_level": config.validation_level }),
        )
        .after(validation_prereqs)
        .with_priority(config.priority),
    );

    let mut workflow = Workflow::new(
        workflow_id,
        format!("Regulation extraction: {url}"),
        format!("Complete extraction workflow for regulations from {url}"),
    );
    workflow.url = Some(url.to_string());
    workflow.metadata = json!({ "url": url, "config": config });
    workflow.steps = steps;
    workflow
}

/// One step of a custom workflow submission
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CustomStepSpec {
    pub step_id: String,
    pub role: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub prerequisites: Vec<String>,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    3
}

/// A custom workflow submission
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CustomWorkflowSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<CustomStepSpec>,
}

impl CustomWorkflowSpec {
    /// Materializes the spec into a workflow, rejecting unknown roles,
    /// duplicate step ids, unresolved prerequisites, and cycles before any
    /// step can be dispatched.
    pub fn into_workflow(self) -> Result<Workflow, String> {
        let workflow_id = WorkflowId::generate("custom");
        let mut steps = Vec::with_capacity(self.steps.len());

        for spec in &self.steps {
            let Some(role) = WorkerRole::parse(&spec.role) else {
                return Err(format!("unknown worker role: {}", spec.role));
            };
            let mut step = WorkflowStep::new(
                StepId::new(spec.step_id.clone()),
                role,
                &spec.description,
                spec.input.clone(),
            )
            .after(
                spec.prerequisites
                    .iter()
                    .map(|p| StepId::new(p.clone()))
                    .collect(),
            )
            .with_priority(spec.priority);
            step.max_retries = spec.max_retries;
            steps.push(step);
        }

        validate_dag(&steps)?;

        let mut workflow = Workflow::new(
            workflow_id.clone(),
            if self.name.is_empty() {
                format!("Custom workflow {workflow_id}")
            } else {
                self.name
            },
            self.description,
        );
        workflow.steps = steps;
        Ok(workflow)
    }
}

/// Checks a step collection for duplicate ids, unresolved prerequisite
/// references, and cycles
pub fn validate_dag(steps: &[WorkflowStep]) -> Result<(), String> {
    let mut ids = HashSet::new();
    for step in steps {
        if !ids.insert(&step.step_id) {
            return Err(format!("duplicate step id: {}", step.step_id));
        }
    }

    for step in steps {
        for prereq in &step.prerequisites {
            if prereq == &step.step_id {
                return Err(format!("step {} depends on itself", step.step_id));
            }
            if !ids.contains(prereq) {
                return Err(format!(
                    "step {} references unknown prerequisite: {prereq}",
                    step.step_id
                ));
            }
        }
    }

    // Kahn's algorithm; any unprocessed remainder is a cycle.
    let mut in_degree: HashMap<&StepId, usize> = steps
        .iter()
        .map(|s| (&s.step_id, s.prerequisites.len()))
        .collect();
    let mut dependents: HashMap<&StepId, Vec<&StepId>> = HashMap::new();
    for step in steps {
        for prereq in &step.prerequisites {
            dependents.entry(prereq).or_default().push(&step.step_id);
        }
    }

    let mut queue: VecDeque<&StepId> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut processed = 0;
    while let Some(id) = queue.pop_front() {
        processed += 1;
        for dependent in dependents.get(id).into_iter().flatten() {
            if let Some(d) = in_degree.get_mut(dependent) {
                *d -= 1;
                if *d == 0 {
                    queue.push_back(*dependent);
                }
            }
        }
    }

    if processed != steps.len() {
        return Err("workflow contains a prerequisite cycle".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_dag_without_optional_branches() {
        let config = ExtractionConfig {
            include_pdfs: false,
            include_images: false,
            ..ExtractionConfig::default()
        };
        let workflow = build_extraction_workflow("https://example.gov/acts", &config);
        assert_eq!(workflow.steps.len(), 4);

        let validation = workflow
            .steps
            .iter()
            .find(|s| s.role == WorkerRole::Validator)
            .unwrap();
        assert_eq!(validation.prerequisites.len(), 1);
        assert!(validation.prerequisites[0].to_string().ends_with("html_extraction"));
    }

    #[test]
    fn optional_branches_join_validation_prerequisites() {
        let config = ExtractionConfig {
            include_pdfs: true,
            include_images: false,
            ..ExtractionConfig::default()
        };
        let workflow = build_extraction_workflow("https://example.gov/acts", &config);
        assert_eq!(workflow.steps.len(), 5);

        let validation = workflow
            .steps
            .iter()
            .find(|s| s.role == WorkerRole::Validator)
            .unwrap();
        let prereq_stages: Vec<String> = validation
            .prerequisites
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(prereq_stages.len(), 2);
        assert!(prereq_stages.iter().any(|p| p.ends_with("html_extraction")));
        assert!(prereq_stages.iter().any(|p| p.ends_with("pdf_analysis")));
    }

    #[test]
    fn ready_steps_respect_prerequisites() {
        let workflow = build_extraction_workflow("https://example.gov", &ExtractionConfig::default());
        let ready = workflow.ready_steps();
        assert_eq!(ready.len(), 1);
        assert!(ready[0].to_string().ends_with("analysis"));
    }

    #[test]
    fn config_defaults_match_documented_values() {
        let config: ExtractionConfig = serde_json::from_str("{}").unwrap();
        assert!(config.include_pdfs);
        assert!(!config.include_images);
        assert!(config.ocr_enabled);
        assert_eq!(config.analysis_depth, AnalysisDepth::Standard);
        assert_eq!(config.validation_level, ValidationLevel::Standard);
        assert_eq!(config.priority, TaskPriority::Normal);
    }

    #[test]
    fn unresolved_prerequisite_is_rejected() {
        let spec = CustomWorkflowSpec {
            name: String::new(),
            description: String::new(),
            steps: vec![CustomStepSpec {
                step_id: "x".to_string(),
                role: "html_extractor".to_string(),
                description: String::new(),
                input: json!({}),
                prerequisites: vec!["missing".to_string()],
                priority: TaskPriority::Normal,
                max_retries: 3,
            }],
        };
        let err = spec.into_workflow().unwrap_err();
        assert!(err.contains("unknown prerequisite"));
    }

    #[test]
    fn cycle_is_rejected() {
        let step = |id: &str, prereq: &str| CustomStepSpec {
            step_id: id.to_string(),
            role: "validator".to_string(),
            description: String::new(),
            input: json!({}),
            prerequisites: vec![prereq.to_string()],
            priority: TaskPriority::Normal,
            max_retries: 3,
        };
        let spec = CustomWorkflowSpec {
            name: String::new(),
            description: String::new(),
            steps: vec![step("a", "b"), step("b", "a")],
        };
        let err = spec.into_workflow().unwrap_err();
        assert!(err.contains("cycle"));
    }

    #[test]
    fn unknown_role_is_rejected() {
        let spec = CustomWorkflowSpec {
            name: String::new(),
            description: String::new(),
            steps: vec![CustomStepSpec {
                step_id: "x".to_string(),
                role: "astrologer".to_string(),
                description: String::new(),
                input: json!({}),
                prerequisites: vec![],
                priority: TaskPriority::Normal,
                max_retries: 3,
            }],
        };
        assert!(spec.into_workflow().unwrap_err().contains("unknown worker role"));
    }

    #[test]
    fn final_status_precedence() {
        let mut workflow = build_extraction_workflow("https://example.gov", &ExtractionConfig::default());
        for step in &mut workflow.steps {
            step.status = ExecutionStatus::Completed;
        }
        assert_eq!(workflow.final_status(), ExecutionStatus::Completed);

        workflow.steps[1].status = ExecutionStatus::Failed;
        assert_eq!(workflow.final_status(), ExecutionStatus::Failed);

        workflow.steps[2].status = ExecutionStatus::Cancelled;
        assert_eq!(workflow.final_status(), ExecutionStatus::Cancelled);
    }
}
