mod app_logic;
mod core;

use crate::app_logic::handler::{APP_NAME, LayerOpsLogic, OperationError};
use crate::core::{
    ConfigManagerOperations, CoreConfigManager, CoreCsvPlanSource, CoreDocumentStore,
    CoreImageCaptureService, Document, DocumentStoreOperations, GroupingMode,
    HttpRecognitionService,
};
use clap::{Parser, Subcommand};
use simplelog::{ColorChoice, Config, LevelFilter, TermLogger, TerminalMode};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Once};

#[derive(Parser, Debug)]
#[command(
    name = "layer_sorter",
    version,
    about = "Export, classify, group and search the layers of a layered document",
    arg_required_else_help = true
)]
struct Cli {
    /// Layered document description (JSON)
    #[arg(value_name = "DOCUMENT")]
    document: PathBuf,
    /// Log at debug level regardless of the configured level
    #[arg(short, long)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Export every visible, unlocked layer as its own image
    Export,
    /// Export, recognise and classify layers, then rename and group them
    Classify {
        /// 1/category, 2/tier or 3/combined
        #[arg(value_name = "MODE")]
        mode: Option<String>,
    },
    /// Rename and group layers from the plan file
    Rename {
        #[arg(value_name = "MODE")]
        mode: Option<String>,
    },
    /// Find layers whose name contains a keyword and select the first one
    Search { keyword: String },
}

static LOGGER_INIT: Once = Once::new();

/*
 * Installs the terminal logger once per process. Logs go to stderr so that stdout
 * only carries the operation summary.
 */
fn initialize_logging_at(level: LevelFilter) {
    LOGGER_INIT.call_once(|| {
        if let Err(e) = TermLogger::init(level, Config::default(), TerminalMode::Stderr, ColorChoice::Auto) {
            eprintln!("Failed to initialize logging: {e}");
        }
    });
}

#[cfg(test)]
pub(crate) fn initialize_logging() {
    initialize_logging_at(LevelFilter::Debug);
}

fn grouping_mode(selector: Option<&str>, default: GroupingMode) -> GroupingMode {
    selector.map(GroupingMode::from_selector).unwrap_or(default)
}

fn load_document(store: &CoreDocumentStore, path: &Path) -> Option<Document> {
    match store.load_document(path) {
        Ok(document) => Some(document),
        Err(e) => {
            log::error!("Main: Could not open document {path:?}: {e}");
            None
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config_manager = CoreConfigManager::new();
    let (mut config, config_problem) = match config_manager.load_config(APP_NAME) {
        Ok(config) => (config, None),
        Err(e) => (Default::default(), Some(e)),
    };
    config.apply_credential_overrides(|name| std::env::var(name).ok());

    let level = if cli.verbose { LevelFilter::Debug } else { config.level_filter() };
    initialize_logging_at(level);
    if let Some(e) = config_problem {
        log::warn!("Main: Using default configuration: {e}");
    }

    let store = CoreDocumentStore::new();
    let mut document = load_document(&store, &cli.document);
    let base_dir = cli.document.parent().map(Path::to_path_buf);

    let recognition = match HttpRecognitionService::new(config.recognition.clone()) {
        Ok(service) => service,
        Err(e) => {
            log::error!("Main: Could not set up the recognition client: {e}");
            return ExitCode::FAILURE;
        }
    };
    let plan_source = CoreCsvPlanSource::new(&config.plan_path());
    let default_mode = config.default_grouping_mode;
    let logic = LayerOpsLogic::new(
        config,
        Arc::new(CoreImageCaptureService::new(base_dir)),
        Arc::new(recognition),
        Arc::new(plan_source),
    );

    let outcome: Result<(String, bool), OperationError> = match &cli.command {
        Command::Export => logic
            .export_layers(document.as_mut())
            .map(|summary| (summary.message(), false)),
        Command::Classify { mode } => logic
            .classify_and_group(document.as_mut(), grouping_mode(mode.as_deref(), default_mode))
            .map(|summary| (summary.message(), true)),
        Command::Rename { mode } => logic
            .rename_from_plan(document.as_mut(), grouping_mode(mode.as_deref(), default_mode))
            .map(|summary| (summary.message(), true)),
        Command::Search { keyword } => logic
            .search(document.as_mut(), keyword)
            .map(|summary| (summary.message(), summary.selected().is_some())),
    };

    match outcome {
        Ok((message, modified)) => {
            println!("{message}");
            if let (true, Some(document)) = (modified, &document) {
                if let Err(e) = store.save_document(document, &cli.document) {
                    log::error!("Main: Could not save document {:?}: {e}", cli.document);
                    return ExitCode::FAILURE;
                }
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}
