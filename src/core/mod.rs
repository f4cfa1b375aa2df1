/*
 * This module consolidates the core, platform-agnostic logic of the application:
 * the layer tree and its visibility isolation, exporting layers through a capture
 * service, classifying the exports through a recognition service, applying rename
 * plans, and searching layers. It re-exports the abstractions
 * (`CaptureOperations`, `RecognitionOperations`, `ArtifactSinkOperations`,
 * `PlanSourceOperations`, `DocumentStoreOperations`, `ConfigManagerOperations`) that
 * the application logic is wired against, together with their core implementations.
 */
pub mod capture;
pub mod classification;
pub mod config;
pub mod document;
pub mod export;
pub mod failure;
pub mod grouping;
pub mod layer_tree;
pub mod path_utils;
pub mod plan;
pub mod recognition;
pub mod search;
pub mod visibility;

// Tree model
pub use layer_tree::LayerId;
#[cfg(test)]
pub use layer_tree::{ContentKind, LayerKind, LayerTree};

// Capture and export
pub use capture::{CaptureOperations, CoreImageCaptureService};
#[cfg(test)]
pub use capture::{CanvasSize, CaptureError};
pub use export::{
    ArtifactSinkOperations, CoreDirectorySink, ExportOptions, SinkError, TempArtifactDir,
    export_layers,
};

// Recognition and classification
pub use classification::{CategoryRuleSet, ClassificationPipeline};
pub use recognition::{HttpRecognitionService, RecognitionError, RecognitionOperations};
#[cfg(test)]
pub use recognition::{AccessToken, Credentials};

// Plans and grouping
pub use grouping::{GroupingMode, PlanReport, apply_plan};
pub use plan::{
    CoreCsvPlanSource, PlanError, PlanSourceOperations, PlanTarget, RenamePlanEntry,
    write_plan_csv,
};

pub use search::{SearchHit, search_layers};

// Documents and configuration
pub use config::{AppConfig, ConfigManagerOperations, CoreConfigManager};
pub use document::{CoreDocumentStore, Document, DocumentStoreOperations};
