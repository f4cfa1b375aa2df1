/*
 * The export driver: walks the document in pre-order, isolates every eligible
 * content layer in turn, has the capture service render it and hands the result to
 * an artifact sink.
 *
 * Eligibility is decided once, against the tree as it was before the first
 * isolation. Each eligible layer gets a sequence index in traversal order, and that
 * index prefixes the artifact name so layers sharing a name do not overwrite each
 * other. A failure on one layer is recorded in the report and the walk continues.
 */
use super::capture::{CanvasSize, CaptureError, CaptureOperations};
use super::failure::ItemFailure;
use super::layer_tree::{ContentKind, LayerId, LayerTree, TreeError};
use super::visibility;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const ILLEGAL_NAME_CHARS: [char; 9] = ['\\', '/', ':', '*', '?', '"', '<', '>', '|'];
const ARTIFACT_EXTENSION: &str = "png";

#[derive(Debug, Clone, PartialEq)]
pub struct ExportOptions {
    pub canonical_size: CanvasSize,
    pub accepted_kinds: Vec<ContentKind>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        ExportOptions {
            canonical_size: CanvasSize::default(),
            accepted_kinds: vec![ContentKind::Pixel, ContentKind::SmartObject],
        }
    }
}

/// One rendered layer, as stored by the sink.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureArtifact {
    pub node: LayerId,
    pub sequence_index: usize,
    pub file_name: String,
    pub location: PathBuf,
    pub bytes: Vec<u8>,
}

#[derive(Debug)]
pub enum SinkError {
    Io(io::Error),
    InvalidName(String),
}

impl From<io::Error> for SinkError {
    fn from(err: io::Error) -> Self {
        SinkError::Io(err)
    }
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkError::Io(e) => write!(f, "Artifact storage I/O error: {e}"),
            SinkError::InvalidName(name) => write!(f, "'{name}' is not a valid artifact name"),
        }
    }
}

impl std::error::Error for SinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SinkError::Io(e) => Some(e),
            _ => None,
        }
    }
}

pub type SinkResult<T> = std::result::Result<T, SinkError>;

/*
 * Where exported artifacts end up. Implementations address artifacts purely by
 * file name inside their location.
 */
pub trait ArtifactSinkOperations: Send + Sync {
    fn location(&self) -> &Path;
    fn store(&self, file_name: &str, bytes: &[u8]) -> SinkResult<PathBuf>;
    fn discard(&self, file_name: &str) -> SinkResult<()>;
}

fn checked_path(dir: &Path, file_name: &str) -> SinkResult<PathBuf> {
    let is_plain = Path::new(file_name)
        .file_name()
        .is_some_and(|plain| plain == file_name);
    if file_name.is_empty() || !is_plain {
        return Err(SinkError::InvalidName(file_name.to_string()));
    }
    Ok(dir.join(file_name))
}

fn write_artifact(dir: &Path, file_name: &str, bytes: &[u8]) -> SinkResult<PathBuf> {
    let path = checked_path(dir, file_name)?;
    fs::write(&path, bytes)?;
    log::trace!("ArtifactSink: Wrote {} bytes to {path:?}", bytes.len());
    Ok(path)
}

fn remove_artifact(dir: &Path, file_name: &str) -> SinkResult<()> {
    let path = checked_path(dir, file_name)?;
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// A plain directory that is created on open if it does not exist yet.
#[derive(Debug)]
pub struct CoreDirectorySink {
    dir: PathBuf,
}

impl CoreDirectorySink {
    pub fn open(dir: &Path) -> SinkResult<Self> {
        if !dir.is_dir() {
            fs::create_dir_all(dir)?;
            log::debug!("ArtifactSink: Created output directory {dir:?}");
        }
        Ok(CoreDirectorySink {
            dir: dir.to_path_buf(),
        })
    }
}

impl ArtifactSinkOperations for CoreDirectorySink {
    fn location(&self) -> &Path {
        &self.dir
    }

    fn store(&self, file_name: &str, bytes: &[u8]) -> SinkResult<PathBuf> {
        write_artifact(&self.dir, file_name, bytes)
    }

    fn discard(&self, file_name: &str) -> SinkResult<()> {
        remove_artifact(&self.dir, file_name)
    }
}

/*
 * A temporary directory owning the artifacts of a single run. Everything in it is
 * deleted when the value is dropped, whichever way the run ends.
 */
#[derive(Debug)]
pub struct TempArtifactDir {
    dir: TempDir,
}

impl TempArtifactDir {
    pub fn new() -> SinkResult<Self> {
        let dir = tempfile::Builder::new().prefix("layer_sorter_").tempdir()?;
        log::debug!("ArtifactSink: Using temporary artifact directory {:?}", dir.path());
        Ok(TempArtifactDir { dir })
    }

    /// Deletes the directory now and reports any error instead of ignoring it.
    pub fn close(self) -> SinkResult<()> {
        self.dir.close()?;
        Ok(())
    }
}

impl ArtifactSinkOperations for TempArtifactDir {
    fn location(&self) -> &Path {
        self.dir.path()
    }

    fn store(&self, file_name: &str, bytes: &[u8]) -> SinkResult<PathBuf> {
        write_artifact(self.dir.path(), file_name, bytes)
    }

    fn discard(&self, file_name: &str) -> SinkResult<()> {
        remove_artifact(self.dir.path(), file_name)
    }
}

/// Why exporting one layer failed.
#[derive(Debug)]
pub enum ExportItemError {
    Isolation(TreeError),
    Capture(CaptureError),
    Sink(SinkError),
}

impl From<TreeError> for ExportItemError {
    fn from(err: TreeError) -> Self {
        ExportItemError::Isolation(err)
    }
}

impl From<CaptureError> for ExportItemError {
    fn from(err: CaptureError) -> Self {
        ExportItemError::Capture(err)
    }
}

impl From<SinkError> for ExportItemError {
    fn from(err: SinkError) -> Self {
        ExportItemError::Sink(err)
    }
}

impl std::fmt::Display for ExportItemError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExportItemError::Isolation(e) => write!(f, "isolation failed: {e}"),
            ExportItemError::Capture(e) => write!(f, "capture failed: {e}"),
            ExportItemError::Sink(e) => write!(f, "storing failed: {e}"),
        }
    }
}

impl std::error::Error for ExportItemError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExportItemError::Isolation(e) => Some(e),
            ExportItemError::Capture(e) => Some(e),
            ExportItemError::Sink(e) => Some(e),
        }
    }
}

#[derive(Debug, Default)]
pub struct ExportReport {
    pub eligible: usize,
    pub artifacts: Vec<CaptureArtifact>,
    pub failures: Vec<ItemFailure<LayerId, ExportItemError>>,
}

impl ExportReport {
    pub fn exported(&self) -> usize {
        self.artifacts.len()
    }
}

/*
 * A layer is exported when it is a content layer of an accepted kind, unlocked,
 * and effectively visible in the tree as given.
 */
pub fn is_eligible(tree: &LayerTree, id: LayerId, accepted_kinds: &[ContentKind]) -> bool {
    let Some(node) = tree.get(id) else {
        return false;
    };
    let accepted = node
        .kind
        .content_kind()
        .is_some_and(|kind| accepted_kinds.contains(&kind));
    accepted && !node.locked && tree.is_effectively_visible(id)
}

/// Eligible layers in pre-order, evaluated against the current tree state.
pub fn eligible_layers(tree: &LayerTree, accepted_kinds: &[ContentKind]) -> Vec<LayerId> {
    tree.pre_order()
        .filter(|&id| is_eligible(tree, id, accepted_kinds))
        .collect()
}

pub fn sanitize_layer_name(name: &str) -> String {
    name.chars()
        .map(|c| if ILLEGAL_NAME_CHARS.contains(&c) { '_' } else { c })
        .collect()
}

/// `{index}_{sanitized name}.png`
pub fn artifact_file_name(sequence_index: usize, layer_name: &str) -> String {
    format!(
        "{sequence_index}_{}.{ARTIFACT_EXTENSION}",
        sanitize_layer_name(layer_name)
    )
}

/*
 * Exports every eligible layer in pre-order, each rendered on its own.
 *
 * Args:
 *     tree: The layers; visibility is changed while a layer is captured and
 *           restored afterwards.
 *     capture: Renders the isolated document.
 *     sink: Receives one file per exported layer.
 *     options: Canvas size and the content kinds that may be exported.
 *
 * Returns:
 *     An `ExportReport` with one artifact per exported layer and one failure per
 *     layer that could not be captured or stored.
 */
pub fn export_layers(
    tree: &mut LayerTree,
    capture: &dyn CaptureOperations,
    sink: &dyn ArtifactSinkOperations,
    options: &ExportOptions,
) -> ExportReport {
    let targets = eligible_layers(tree, &options.accepted_kinds);
    log::info!(
        "ExportDriver: {} eligible layer(s), exporting to {:?}",
        targets.len(),
        sink.location()
    );
    let mut report = ExportReport {
        eligible: targets.len(),
        ..ExportReport::default()
    };

    for (sequence_index, id) in targets.into_iter().enumerate() {
        let name = tree.get(id).map(|n| n.name.clone()).unwrap_or_default();
        let file_name = artifact_file_name(sequence_index, &name);

        match export_one(tree, capture, sink, options.canonical_size, id, &file_name) {
            Ok((location, bytes)) => {
                log::debug!("ExportDriver: Exported {id} '{name}' as {file_name}");
                report.artifacts.push(CaptureArtifact {
                    node: id,
                    sequence_index,
                    file_name,
                    location,
                    bytes,
                });
            }
            Err(cause) => {
                log::warn!("ExportDriver: Skipping {id} '{name}': {cause}");
                report.failures.push(ItemFailure::new(id, cause));
            }
        }
    }

    log::info!(
        "ExportDriver: Exported {} of {} layer(s).",
        report.exported(),
        report.eligible
    );
    report
}

fn export_one(
    tree: &mut LayerTree,
    capture: &dyn CaptureOperations,
    sink: &dyn ArtifactSinkOperations,
    size: CanvasSize,
    id: LayerId,
    file_name: &str,
) -> std::result::Result<(PathBuf, Vec<u8>), ExportItemError> {
    // Visibility is back to normal before the sink is touched.
    let bytes = visibility::with_isolation(tree, id, |isolated| capture.capture(isolated, id, size))??;
    let location = sink.store(file_name, &bytes)?;
    Ok((location, bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::layer_tree::LayerKind;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tempfile::tempdir;

    const PIXEL: LayerKind = LayerKind::Content(ContentKind::Pixel);

    // Records which layers were effectively visible on every call.
    struct RecordingCapture {
        calls: Mutex<Vec<(LayerId, Vec<LayerId>)>>,
        fail_for: Vec<LayerId>,
    }

    impl RecordingCapture {
        fn new(fail_for: Vec<LayerId>) -> Self {
            RecordingCapture {
                calls: Mutex::new(Vec::new()),
                fail_for,
            }
        }
    }

    impl CaptureOperations for RecordingCapture {
        fn capture(&self, tree: &LayerTree, node: LayerId, _size: CanvasSize) -> crate::core::capture::Result<Vec<u8>> {
            let visible: Vec<LayerId> = tree
                .pre_order()
                .filter(|&id| tree.is_effectively_visible(id) && !tree.get(id).unwrap().is_group())
                .collect();
            self.calls.lock().unwrap().push((node, visible));
            if self.fail_for.contains(&node) {
                return Err(CaptureError::Host("render failed".to_string()));
            }
            Ok(vec![node.index() as u8])
        }
    }

    fn visibility_flags(tree: &LayerTree) -> Vec<bool> {
        tree.pre_order().map(|id| tree.get(id).unwrap().visible).collect()
    }

    #[test]
    fn test_sanitize_layer_name_replaces_each_illegal_char() {
        assert_eq!(sanitize_layer_name("A/B:C"), "A_B_C");
        assert_eq!(sanitize_layer_name(r#"a\b*c?d"e<f>g|h"#), "a_b_c_d_e_f_g_h");
        assert_eq!(sanitize_layer_name("plain name"), "plain name");
        assert_eq!(artifact_file_name(3, "A/B"), "3_A_B.png");
    }

    #[test]
    fn test_export_isolates_each_layer_and_restores() {
        let mut tree = LayerTree::new("doc");
        let root = tree.root();
        let a = tree.add_layer(root, "A/1", PIXEL).unwrap();
        let group = tree.add_layer(root, "Set", LayerKind::Group).unwrap();
        let b = tree.add_layer(group, "B", PIXEL).unwrap();
        let text = tree
            .add_layer(root, "caption", LayerKind::Content(ContentKind::Text))
            .unwrap();
        let hidden = tree.add_layer(root, "hidden", PIXEL).unwrap();
        tree.set_visible(hidden, false).unwrap();
        let before = visibility_flags(&tree);

        let out = tempdir().unwrap();
        let sink = CoreDirectorySink::open(&out.path().join("export")).unwrap();
        let capture = RecordingCapture::new(Vec::new());
        let report = export_layers(&mut tree, &capture, &sink, &ExportOptions::default());

        assert_eq!(report.eligible, 2);
        assert_eq!(report.exported(), 2);
        assert!(report.failures.is_empty());
        assert_eq!(report.artifacts[0].file_name, "0_A_1.png");
        assert_eq!(report.artifacts[1].file_name, "1_B.png");
        assert!(report.artifacts.iter().all(|a| a.location.exists()));

        let calls = capture.calls.lock().unwrap();
        assert_eq!(calls[0], (a, vec![a]));
        assert_eq!(calls[1], (b, vec![b]));
        assert!(!calls.iter().any(|(id, _)| *id == text || *id == hidden));
        assert_eq!(visibility_flags(&tree), before);
    }

    #[test]
    fn test_capture_failure_is_recorded_and_walk_continues() {
        let mut tree = LayerTree::new("doc");
        let root = tree.root();
        let first = tree.add_layer(root, "first", PIXEL).unwrap();
        let second = tree.add_layer(root, "second", PIXEL).unwrap();
        let before = visibility_flags(&tree);

        let out = tempdir().unwrap();
        let sink = CoreDirectorySink::open(out.path()).unwrap();
        let capture = RecordingCapture::new(vec![first]);
        let report = export_layers(&mut tree, &capture, &sink, &ExportOptions::default());

        assert_eq!(report.exported(), 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].item, first);
        assert!(matches!(report.failures[0].cause, ExportItemError::Capture(_)));
        // The failed layer keeps its index; the next one does not shift down.
        assert_eq!(report.artifacts[0].node, second);
        assert_eq!(report.artifacts[0].sequence_index, 1);
        assert_eq!(visibility_flags(&tree), before);
    }

    #[test]
    fn test_nothing_eligible_is_an_empty_report() {
        let mut tree = LayerTree::new("doc");
        let root = tree.root();
        let locked = tree.add_layer(root, "locked", PIXEL).unwrap();
        tree.set_locked(locked, true).unwrap();

        let out = tempdir().unwrap();
        let sink = CoreDirectorySink::open(out.path()).unwrap();
        let report = export_layers(
            &mut tree,
            &RecordingCapture::new(Vec::new()),
            &sink,
            &ExportOptions::default(),
        );
        assert_eq!(report.eligible, 0);
        assert_eq!(report.exported(), 0);
        assert!(report.failures.is_empty());
    }

    #[test]
    fn test_sinks_reject_nested_names_and_discard_files() {
        let out = tempdir().unwrap();
        let sink = CoreDirectorySink::open(out.path()).unwrap();
        assert!(matches!(sink.store("../escape.png", b"x"), Err(SinkError::InvalidName(_))));
        assert!(matches!(sink.store("", b"x"), Err(SinkError::InvalidName(_))));

        let path = sink.store("0_a.png", b"x").unwrap();
        assert!(path.exists());
        sink.discard("0_a.png").unwrap();
        assert!(!path.exists());
        sink.discard("0_a.png").unwrap();

        let temp = TempArtifactDir::new().unwrap();
        let temp_location = temp.location().to_path_buf();
        temp.store("1_b.png", b"y").unwrap();
        assert!(temp_location.join("1_b.png").exists());
        temp.close().unwrap();
        assert!(!temp_location.exists());
    }

    #[test]
    fn test_random_trees_export_exactly_the_eligible_layers() {
        let kinds = [
            ContentKind::Pixel,
            ContentKind::SmartObject,
            ContentKind::Text,
            ContentKind::Shape,
            ContentKind::Adjustment,
        ];
        let mut rng = StdRng::seed_from_u64(0xe1161b1e);
        let out = tempdir().unwrap();
        let sink = CoreDirectorySink::open(out.path()).unwrap();

        for _ in 0..40 {
            let mut tree = LayerTree::new("random");
            let mut groups = vec![tree.root()];
            let mut expected = HashSet::new();
            for i in 0..rng.random_range(1..30) {
                let parent = groups[rng.random_range(0..groups.len())];
                let kind = if rng.random_bool(0.25) {
                    LayerKind::Group
                } else {
                    LayerKind::Content(kinds[rng.random_range(0..kinds.len())])
                };
                let id = tree.add_layer(parent, &format!("l{i}"), kind).unwrap();
                tree.set_visible(id, rng.random_bool(0.7)).unwrap();
                tree.set_locked(id, rng.random_bool(0.2)).unwrap();
                if kind.is_group() {
                    groups.push(id);
                }
            }
            for id in tree.pre_order() {
                let node = tree.get(id).unwrap();
                let mut chain_visible = node.visible;
                let mut cursor = node.parent();
                while let Some(parent) = cursor {
                    if parent == tree.root() {
                        break;
                    }
                    chain_visible &= tree.get(parent).unwrap().visible;
                    cursor = tree.parent(parent);
                }
                let kind_ok = matches!(
                    node.kind,
                    LayerKind::Content(ContentKind::Pixel | ContentKind::SmartObject)
                );
                if kind_ok && !node.locked && chain_visible {
                    expected.insert(id);
                }
            }

            let before = visibility_flags(&tree);
            let capture = RecordingCapture::new(Vec::new());
            let report = export_layers(&mut tree, &capture, &sink, &ExportOptions::default());
            let exported: HashSet<LayerId> = report.artifacts.iter().map(|a| a.node).collect();

            assert_eq!(exported, expected);
            assert_eq!(visibility_flags(&tree), before);
        }
    }
}
