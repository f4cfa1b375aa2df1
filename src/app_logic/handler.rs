use crate::core::{
    AppConfig, ArtifactSinkOperations, CaptureOperations, CategoryRuleSet,
    ClassificationPipeline, CoreDirectorySink, Document, ExportOptions, GroupingMode, LayerId, PlanError,
    PlanReport, PlanSourceOperations, PlanTarget, RecognitionError, RecognitionOperations,
    RenamePlanEntry, SearchHit, SinkError, TempArtifactDir, apply_plan, export_layers,
    search_layers, write_plan_csv,
};
use std::path::PathBuf;
use std::sync::Arc;

// Made pub(crate) for access from main.rs and handler_tests.rs
pub(crate) const APP_NAME: &str = "LayerSorter";

/*
 * Errors that end a whole operation. Everything that only affects a single layer or
 * plan row is reported in the operation's summary instead.
 */
#[derive(Debug)]
pub enum OperationError {
    NoActiveDocument,
    OutputUnavailable(SinkError),
    Authentication(RecognitionError),
    PlanUnavailable(PlanError),
}

impl std::fmt::Display for OperationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationError::NoActiveDocument => write!(f, "Open a document before running this operation."),
            OperationError::OutputUnavailable(e) => write!(f, "Output location is not usable: {e}"),
            OperationError::Authentication(e) => {
                write!(f, "Could not obtain an access token for the recognition service: {e}")
            }
            OperationError::PlanUnavailable(e) => {
                write!(f, "No rename plan found; run the classification first. ({e})")
            }
        }
    }
}

impl std::error::Error for OperationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            OperationError::NoActiveDocument => None,
            OperationError::OutputUnavailable(e) => Some(e),
            OperationError::Authentication(e) => Some(e),
            OperationError::PlanUnavailable(e) => Some(e),
        }
    }
}

pub type OperationResult<T> = std::result::Result<T, OperationError>;

#[derive(Debug, Clone, PartialEq)]
pub struct ExportSummary {
    pub eligible: usize,
    pub exported: usize,
    pub failed: usize,
    pub location: PathBuf,
}

impl ExportSummary {
    pub fn message(&self) -> String {
        if self.eligible == 0 {
            return "No visible, unlocked layers to export.".to_string();
        }
        let mut message = format!(
            "Exported {} of {} layer(s) to {}.",
            self.exported,
            self.eligible,
            self.location.display()
        );
        if self.failed > 0 {
            message.push_str(&format!(" {} layer(s) failed.", self.failed));
        }
        message
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassifySummary {
    pub mode: GroupingMode,
    pub exported: usize,
    pub export_failed: usize,
    pub classified: usize,
    pub unclassified: usize,
    pub recognition_failed: usize,
    pub plan: PlanReport,
    pub plan_file: Option<PathBuf>,
}

impl ClassifySummary {
    pub fn message(&self) -> String {
        if self.exported == 0 && self.export_failed == 0 {
            return "No visible, unlocked layers to classify.".to_string();
        }
        let mut message = format!(
            "Classified {} layer(s) ({} unclassified, {} recognition failure(s)); grouped by {}: {} processed, {} skipped, {} group(s) created.",
            self.classified,
            self.unclassified,
            self.recognition_failed,
            self.mode.display_name(),
            self.plan.processed,
            self.plan.skipped_count(),
            self.plan.groups_created
        );
        if self.export_failed > 0 {
            message.push_str(&format!(" {} layer(s) could not be exported.", self.export_failed));
        }
        if let Some(path) = &self.plan_file {
            message.push_str(&format!(" Plan written to {}.", path.display()));
        }
        message
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenameSummary {
    pub mode: GroupingMode,
    pub plan: PlanReport,
}

impl RenameSummary {
    pub fn message(&self) -> String {
        format!(
            "Renamed and grouped by {}: {} processed, {} skipped, {} group(s) created.",
            self.mode.display_name(),
            self.plan.processed,
            self.plan.skipped_count(),
            self.plan.groups_created
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchSummary {
    pub keyword: String,
    pub hits: Vec<SearchHit>,
}

impl SearchSummary {
    pub fn selected(&self) -> Option<&SearchHit> {
        self.hits.first()
    }

    pub fn message(&self) -> String {
        if self.hits.is_empty() {
            return format!("No layer name contains \"{}\".", self.keyword);
        }
        let mut message = format!("Found {} layer(s):", self.hits.len());
        for (i, hit) in self.hits.iter().enumerate() {
            message.push_str(&format!("\n{}. {hit}", i + 1));
        }
        if let Some(first) = self.selected() {
            message.push_str(&format!("\nSelected: {}", first.path));
        }
        message
    }
}

/*
 * The four top-level operations. Each one works on the document passed in (an
 * absent document is a terminal error) and returns a summary. Collaborators are
 * injected as trait objects so tests can substitute them.
 */
pub struct LayerOpsLogic {
    pub(crate) config: AppConfig,
    pub(crate) capture: Arc<dyn CaptureOperations>,
    pub(crate) recognition: Arc<dyn RecognitionOperations>,
    pub(crate) plan_source: Arc<dyn PlanSourceOperations>,
}

impl LayerOpsLogic {
    pub fn new(
        config: AppConfig,
        capture: Arc<dyn CaptureOperations>,
        recognition: Arc<dyn RecognitionOperations>,
        plan_source: Arc<dyn PlanSourceOperations>,
    ) -> Self {
        LayerOpsLogic {
            config,
            capture,
            recognition,
            plan_source,
        }
    }

    fn export_options(&self) -> ExportOptions {
        ExportOptions {
            canonical_size: self.config.canonical_size,
            accepted_kinds: self.config.accepted_kinds.clone(),
        }
    }

    pub fn export_layers(&self, document: Option<&mut Document>) -> OperationResult<ExportSummary> {
        let document = document.ok_or(OperationError::NoActiveDocument)?;
        let sink = CoreDirectorySink::open(&self.config.resolved_output_dir())
            .map_err(OperationError::OutputUnavailable)?;

        let report = export_layers(&mut document.tree, self.capture.as_ref(), &sink, &self.export_options());
        Ok(ExportSummary {
            eligible: report.eligible,
            exported: report.exported(),
            failed: report.failures.len(),
            location: sink.location().to_path_buf(),
        })
    }

    /*
     * Exports every eligible layer into a temporary directory, classifies the
     * exports and applies the result as a plan. The temporary directory is removed
     * on every way out of this function.
     */
    pub fn classify_and_group(
        &self,
        document: Option<&mut Document>,
        mode: GroupingMode,
    ) -> OperationResult<ClassifySummary> {
        let document = document.ok_or(OperationError::NoActiveDocument)?;
        let artifacts_dir = TempArtifactDir::new().map_err(OperationError::OutputUnavailable)?;
        let top_level_before = document.tree.top_level().to_vec();

        let export = export_layers(
            &mut document.tree,
            self.capture.as_ref(),
            &artifacts_dir,
            &self.export_options(),
        );
        let mut summary = ClassifySummary {
            mode,
            exported: export.exported(),
            export_failed: export.failures.len(),
            classified: 0,
            unclassified: 0,
            recognition_failed: 0,
            plan: PlanReport::default(),
            plan_file: None,
        };
        if export.artifacts.is_empty() {
            log::info!("AppLogic: Nothing exported, skipping classification.");
            return Ok(summary);
        }

        let rules = CategoryRuleSet::new(self.config.category_rules.clone());
        let pipeline = ClassificationPipeline::new(
            self.recognition.as_ref(),
            &rules,
            &self.config.tier_rules,
            &self.config.layer_name_rules,
        );
        let classification = pipeline
            .run(&self.config.recognition.credentials(), &export.artifacts)
            .map_err(|e| {
                log::error!("AppLogic: Classification aborted: {e}");
                OperationError::Authentication(e)
            })?;

        let entries: Vec<RenamePlanEntry> = classification
            .classifications
            .iter()
            .map(|c| {
                let current_name = document.tree.get(c.node).map(|n| n.name.as_str()).unwrap_or_default();
                c.to_plan_entry(current_name)
            })
            .collect();

        if self.config.emit_plan {
            summary.plan_file = self.emit_plan(&entries, &top_level_before);
        }

        summary.classified = classification.classifications.len();
        summary.unclassified = classification.unclassified();
        summary.recognition_failed = classification.failures.len();
        summary.plan = apply_plan(&mut document.tree, &entries, mode);

        if let Err(e) = artifacts_dir.close() {
            log::warn!("AppLogic: Could not remove temporary artifacts: {e}");
        }
        Ok(summary)
    }

    /*
     * Writes the classification plan as CSV, addressing layers by their position
     * among the top-level layers before anything moved. Layers nested in groups
     * have no such position and are left out. Failing to write is not fatal.
     */
    fn emit_plan(&self, entries: &[RenamePlanEntry], top_level_before: &[LayerId]) -> Option<PathBuf> {
        let indexed: Vec<RenamePlanEntry> = entries
            .iter()
            .filter_map(|entry| {
                let PlanTarget::Node(node) = entry.target else {
                    return None;
                };
                let index = top_level_before.iter().position(|&id| id == node)?;
                Some(RenamePlanEntry {
                    target: PlanTarget::Index(index as i64),
                    ..entry.clone()
                })
            })
            .collect();

        let written = CoreDirectorySink::open(&self.config.resolved_output_dir())
            .map_err(|e| e.to_string())
            .and_then(|sink| {
                let path = sink.location().join(&self.config.plan_file_name);
                write_plan_csv(&path, &indexed).map(|_| path).map_err(|e| e.to_string())
            });
        match written {
            Ok(path) => Some(path),
            Err(e) => {
                log::warn!("AppLogic: Could not write the rename plan: {e}");
                None
            }
        }
    }

    pub fn rename_from_plan(
        &self,
        document: Option<&mut Document>,
        mode: GroupingMode,
    ) -> OperationResult<RenameSummary> {
        let document = document.ok_or(OperationError::NoActiveDocument)?;
        let entries = self.plan_source.load_plan().map_err(|e| {
            log::error!("AppLogic: Plan unavailable: {e}");
            OperationError::PlanUnavailable(e)
        })?;
        let plan = apply_plan(&mut document.tree, &entries, mode);
        Ok(RenameSummary { mode, plan })
    }

    /// Searches layer names and makes the first hit the active layer.
    pub fn search(&self, document: Option<&mut Document>, keyword: &str) -> OperationResult<SearchSummary> {
        let document = document.ok_or(OperationError::NoActiveDocument)?;
        let hits = search_layers(&document.tree, keyword);
        if let Some(first) = hits.first() {
            document.active_layer = Some(first.node);
            log::debug!("AppLogic: Selected {} '{}'.", first.node, first.path);
        }
        Ok(SearchSummary {
            keyword: keyword.trim().to_string(),
            hits,
        })
    }
}

