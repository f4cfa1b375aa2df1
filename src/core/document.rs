/*
 * The layered document the operations work on, and its JSON description on disk.
 *
 * On disk a document is a nested list of layer records, top-most layer first, the
 * way an editor's layer panel lists them. In memory the layers live in a
 * `LayerTree`. `active_layer` is stored as the chain of child positions leading
 * from the document to the layer, so it survives the round trip without ids.
 */
use super::capture::CanvasSize;
use super::layer_tree::{ContentKind, LayerId, LayerKind, LayerTree, TreeError};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub enum DocumentError {
    Io(io::Error),
    Serde(serde_json::Error),
    Tree(TreeError),
    NotFound(PathBuf),
    Invalid(String),
}

impl From<io::Error> for DocumentError {
    fn from(err: io::Error) -> Self {
        DocumentError::Io(err)
    }
}

impl From<serde_json::Error> for DocumentError {
    fn from(err: serde_json::Error) -> Self {
        DocumentError::Serde(err)
    }
}

impl From<TreeError> for DocumentError {
    fn from(err: TreeError) -> Self {
        DocumentError::Tree(err)
    }
}

impl std::fmt::Display for DocumentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocumentError::Io(e) => write!(f, "Document I/O error: {e}"),
            DocumentError::Serde(e) => write!(f, "Document format error: {e}"),
            DocumentError::Tree(e) => write!(f, "Document structure error: {e}"),
            DocumentError::NotFound(path) => write!(f, "Document {path:?} does not exist"),
            DocumentError::Invalid(msg) => write!(f, "Invalid document: {msg}"),
        }
    }
}

impl std::error::Error for DocumentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DocumentError::Io(e) => Some(e),
            DocumentError::Serde(e) => Some(e),
            DocumentError::Tree(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, DocumentError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerRecordKind {
    Group,
    Pixel,
    SmartObject,
    Text,
    Shape,
    Adjustment,
}

impl From<LayerRecordKind> for LayerKind {
    fn from(kind: LayerRecordKind) -> Self {
        match kind {
            LayerRecordKind::Group => LayerKind::Group,
            LayerRecordKind::Pixel => LayerKind::Content(ContentKind::Pixel),
            LayerRecordKind::SmartObject => LayerKind::Content(ContentKind::SmartObject),
            LayerRecordKind::Text => LayerKind::Content(ContentKind::Text),
            LayerRecordKind::Shape => LayerKind::Content(ContentKind::Shape),
            LayerRecordKind::Adjustment => LayerKind::Content(ContentKind::Adjustment),
        }
    }
}

impl From<LayerKind> for LayerRecordKind {
    fn from(kind: LayerKind) -> Self {
        match kind {
            LayerKind::Group => LayerRecordKind::Group,
            LayerKind::Content(ContentKind::Pixel) => LayerRecordKind::Pixel,
            LayerKind::Content(ContentKind::SmartObject) => LayerRecordKind::SmartObject,
            LayerKind::Content(ContentKind::Text) => LayerRecordKind::Text,
            LayerKind::Content(ContentKind::Shape) => LayerRecordKind::Shape,
            LayerKind::Content(ContentKind::Adjustment) => LayerRecordKind::Adjustment,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerRecord {
    pub name: String,
    pub kind: LayerRecordKind,
    #[serde(default = "default_true")]
    pub visible: bool,
    #[serde(default)]
    pub locked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<LayerRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub name: String,
    pub width: u32,
    pub height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_layer: Option<Vec<usize>>,
    #[serde(default)]
    pub layers: Vec<LayerRecord>,
}

#[derive(Debug, Clone)]
pub struct Document {
    pub name: String,
    pub size: CanvasSize,
    pub tree: LayerTree,
    pub active_layer: Option<LayerId>,
}

impl Document {
    pub fn new(name: &str, size: CanvasSize) -> Self {
        Document {
            name: name.to_string(),
            size,
            tree: LayerTree::new(name),
            active_layer: None,
        }
    }

    pub fn from_record(record: &DocumentRecord) -> Result<Self> {
        let mut document = Document::new(&record.name, CanvasSize::new(record.width, record.height));
        let root = document.tree.root();
        for layer in &record.layers {
            add_record(&mut document.tree, root, layer)?;
        }
        document.active_layer = match &record.active_layer {
            Some(positions) => Some(resolve_positions(&document.tree, positions).ok_or_else(|| {
                DocumentError::Invalid(format!("active layer {positions:?} does not exist"))
            })?),
            None => None,
        };
        Ok(document)
    }

    pub fn to_record(&self) -> DocumentRecord {
        let root = self.tree.root();
        DocumentRecord {
            name: self.name.clone(),
            width: self.size.width,
            height: self.size.height,
            active_layer: self
                .active_layer
                .and_then(|id| positions_of(&self.tree, id)),
            layers: self
                .tree
                .children(root)
                .iter()
                .filter_map(|&id| layer_record(&self.tree, id))
                .collect(),
        }
    }
}

fn add_record(tree: &mut LayerTree, parent: LayerId, record: &LayerRecord) -> Result<()> {
    let kind = LayerKind::from(record.kind);
    if !kind.is_group() && !record.children.is_empty() {
        return Err(DocumentError::Invalid(format!(
            "layer '{}' is not a group but has children",
            record.name
        )));
    }
    let id = tree.add_layer(parent, &record.name, kind)?;
    tree.set_visible(id, record.visible)?;
    tree.set_locked(id, record.locked)?;
    tree.set_source(id, record.source.clone())?;
    for child in &record.children {
        add_record(tree, id, child)?;
    }
    Ok(())
}

fn layer_record(tree: &LayerTree, id: LayerId) -> Option<LayerRecord> {
    let node = tree.get(id)?;
    Some(LayerRecord {
        name: node.name.clone(),
        kind: node.kind.into(),
        visible: node.visible,
        locked: node.locked,
        source: node.source.clone(),
        children: node
            .children()
            .iter()
            .filter_map(|&child| layer_record(tree, child))
            .collect(),
    })
}

fn resolve_positions(tree: &LayerTree, positions: &[usize]) -> Option<LayerId> {
    let mut current = tree.root();
    for &position in positions {
        current = *tree.children(current).get(position)?;
    }
    (current != tree.root()).then_some(current)
}

fn positions_of(tree: &LayerTree, id: LayerId) -> Option<Vec<usize>> {
    if !tree.contains(id) || id == tree.root() {
        return None;
    }
    let mut positions = Vec::new();
    let mut current = id;
    while let Some(parent) = tree.parent(current) {
        positions.push(tree.children(parent).iter().position(|&c| c == current)?);
        current = parent;
    }
    positions.reverse();
    Some(positions)
}

pub trait DocumentStoreOperations: Send + Sync {
    fn load_document(&self, path: &Path) -> Result<Document>;
    fn save_document(&self, document: &Document, path: &Path) -> Result<()>;
}

pub struct CoreDocumentStore {}

impl CoreDocumentStore {
    pub fn new() -> Self {
        CoreDocumentStore {}
    }
}

impl Default for CoreDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentStoreOperations for CoreDocumentStore {
    fn load_document(&self, path: &Path) -> Result<Document> {
        log::trace!("CoreDocumentStore: Loading document from {path:?}");
        if !path.exists() {
            return Err(DocumentError::NotFound(path.to_path_buf()));
        }
        let reader = BufReader::new(File::open(path)?);
        let record: DocumentRecord = serde_json::from_reader(reader)?;
        let document = Document::from_record(&record)?;
        log::debug!(
            "CoreDocumentStore: Loaded '{}' ({} layers) from {path:?}.",
            document.name,
            document.tree.len() - 1
        );
        Ok(document)
    }

    fn save_document(&self, document: &Document, path: &Path) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, &document.to_record())?;
        log::debug!("CoreDocumentStore: Saved '{}' to {path:?}.", document.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"{
        "name": "poster",
        "width": 800,
        "height": 600,
        "active_layer": [1, 0],
        "layers": [
            { "name": "Title", "kind": "text" },
            { "name": "Set", "kind": "group", "visible": false, "children": [
                { "name": "Photo", "kind": "smart_object", "source": "photo.png", "locked": true }
            ]},
            { "name": "Paper", "kind": "pixel", "source": "paper.png" }
        ]
    }"#;

    #[test]
    fn test_record_converts_to_tree() {
        let record: DocumentRecord = serde_json::from_str(SAMPLE).unwrap();
        let doc = Document::from_record(&record).unwrap();

        assert_eq!(doc.size, CanvasSize::new(800, 600));
        assert_eq!(doc.tree.len(), 5);
        let names: Vec<String> = doc
            .tree
            .pre_order()
            .map(|id| doc.tree.display_path(id))
            .collect();
        assert_eq!(names, vec!["Title", "Set", "Set > Photo", "Paper"]);

        let photo = doc.active_layer.unwrap();
        let node = doc.tree.get(photo).unwrap();
        assert_eq!(node.name, "Photo");
        assert!(node.locked);
        assert_eq!(node.kind, LayerKind::Content(ContentKind::SmartObject));
        assert_eq!(node.source, Some(PathBuf::from("photo.png")));
        assert!(!doc.tree.is_effectively_visible(photo));
    }

    #[test]
    fn test_save_and_load_preserves_structure() {
        let record: DocumentRecord = serde_json::from_str(SAMPLE).unwrap();
        let doc = Document::from_record(&record).unwrap();
        let dir = tempdir().unwrap();
        let path = dir.path().join("poster.json");
        let store = CoreDocumentStore::new();

        store.save_document(&doc, &path).unwrap();
        let reloaded = store.load_document(&path).unwrap();

        assert_eq!(reloaded.to_record(), record);
    }

    #[test]
    fn test_mutations_are_persisted() {
        let record: DocumentRecord = serde_json::from_str(SAMPLE).unwrap();
        let mut doc = Document::from_record(&record).unwrap();
        let paper = doc.tree.top_level()[2];
        let group = doc.tree.create_group("【Background】");
        doc.tree.move_into(paper, group).unwrap();
        doc.active_layer = Some(paper);

        let saved = doc.to_record();
        assert_eq!(saved.layers[0].name, "【Background】");
        assert_eq!(saved.layers[0].children[0].name, "Paper");
        assert_eq!(saved.active_layer, Some(vec![0, 0]));
    }

    #[test]
    fn test_invalid_documents_are_rejected() {
        let content_with_children = r#"{"name":"d","width":1,"height":1,"layers":[
            {"name":"p","kind":"pixel","children":[{"name":"c","kind":"pixel"}]}
        ]}"#;
        let record: DocumentRecord = serde_json::from_str(content_with_children).unwrap();
        assert!(matches!(Document::from_record(&record), Err(DocumentError::Invalid(_))));

        let bad_active = r#"{"name":"d","width":1,"height":1,"active_layer":[3],"layers":[]}"#;
        let record: DocumentRecord = serde_json::from_str(bad_active).unwrap();
        assert!(matches!(Document::from_record(&record), Err(DocumentError::Invalid(_))));

        let dir = tempdir().unwrap();
        let store = CoreDocumentStore::new();
        assert!(matches!(
            store.load_document(&dir.path().join("none.json")),
            Err(DocumentError::NotFound(_))
        ));
        let garbage = dir.path().join("garbage.json");
        std::fs::write(&garbage, "{ not json").unwrap();
        assert!(matches!(store.load_document(&garbage), Err(DocumentError::Serde(_))));
    }
}
