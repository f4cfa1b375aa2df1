/*
 * The application logic layer: `LayerOpsLogic` runs the export, classify, rename
 * and search operations against a document and turns their reports into
 * summaries for the command line. Unit tests for it are in `handler_tests.rs`.
 */
pub mod handler;
