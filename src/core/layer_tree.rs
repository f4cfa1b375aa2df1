/*
 * In-memory model of a layered document. Layers live in an arena owned by
 * `LayerTree` and are addressed through `LayerId` handles, which stay valid for the
 * lifetime of the tree (slots are never reused, a removed layer simply stops
 * resolving). Parent links are plain ids, so the tree never holds owning
 * back-references.
 *
 * The root node represents the document itself. It is always a group, is always
 * effectively visible, and can be neither moved nor removed. All mutations apply
 * immediately; traversal that happens after a mutation observes it.
 */
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(u32);

impl LayerId {
    pub fn index(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for LayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/*
 * The flavour of content a leaf layer carries. Only some kinds produce meaningful
 * pixels on their own; the export driver filters on this.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Pixel,
    SmartObject,
    Text,
    Shape,
    Adjustment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerKind {
    Content(ContentKind),
    Group,
}

impl LayerKind {
    pub fn is_group(self) -> bool {
        matches!(self, LayerKind::Group)
    }

    pub fn content_kind(self) -> Option<ContentKind> {
        match self {
            LayerKind::Content(kind) => Some(kind),
            LayerKind::Group => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayerNode {
    pub id: LayerId,
    pub name: String,
    pub kind: LayerKind,
    pub visible: bool,
    pub locked: bool,
    // Location of the pixel data backing a content layer, if the host exposes one.
    pub source: Option<PathBuf>,
    parent: Option<LayerId>,
    children: Vec<LayerId>, // Only populated for groups
}

impl LayerNode {
    pub fn parent(&self) -> Option<LayerId> {
        self.parent
    }

    pub fn children(&self) -> &[LayerId] {
        &self.children
    }

    pub fn is_group(&self) -> bool {
        self.kind.is_group()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    UnknownLayer(LayerId),
    NotAGroup(LayerId),
    InvalidMove { node: LayerId, target: LayerId },
    RootImmutable,
}

impl std::fmt::Display for TreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TreeError::UnknownLayer(id) => write!(f, "Layer {id} does not exist"),
            TreeError::NotAGroup(id) => write!(f, "Layer {id} is not a group"),
            TreeError::InvalidMove { node, target } => write!(
                f,
                "Cannot move layer {node} into {target}: the target is the layer itself or one of its descendants"
            ),
            TreeError::RootImmutable => write!(f, "The document root cannot be moved or removed"),
        }
    }
}

impl std::error::Error for TreeError {}

pub type Result<T> = std::result::Result<T, TreeError>;

#[derive(Debug, Clone)]
pub struct LayerTree {
    slots: Vec<Option<LayerNode>>,
    root: LayerId,
}

impl LayerTree {
    /*
     * Creates a tree holding only the document root, a visible group named after
     * the document.
     */
    pub fn new(document_name: &str) -> Self {
        let root = LayerId(0);
        LayerTree {
            slots: vec![Some(LayerNode {
                id: root,
                name: document_name.to_string(),
                kind: LayerKind::Group,
                visible: true,
                locked: false,
                source: None,
                parent: None,
                children: Vec::new(),
            })],
            root,
        }
    }

    pub fn root(&self) -> LayerId {
        self.root
    }

    pub fn get(&self, id: LayerId) -> Option<&LayerNode> {
        self.slots.get(id.0 as usize).and_then(|slot| slot.as_ref())
    }

    fn node_mut(&mut self, id: LayerId) -> Result<&mut LayerNode> {
        self.slots
            .get_mut(id.0 as usize)
            .and_then(|slot| slot.as_mut())
            .ok_or(TreeError::UnknownLayer(id))
    }

    fn node(&self, id: LayerId) -> Result<&LayerNode> {
        self.get(id).ok_or(TreeError::UnknownLayer(id))
    }

    pub fn contains(&self, id: LayerId) -> bool {
        self.get(id).is_some()
    }

    /// Number of live layers, the root included.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn parent(&self, id: LayerId) -> Option<LayerId> {
        self.get(id).and_then(|node| node.parent)
    }

    pub fn children(&self, id: LayerId) -> &[LayerId] {
        self.get(id).map(|node| node.children.as_slice()).unwrap_or(&[])
    }

    /// The layers sitting directly under the document root, top-most first.
    pub fn top_level(&self) -> &[LayerId] {
        self.children(self.root)
    }

    /*
     * Appends a new layer as the last child of `parent`. The new layer starts
     * visible and unlocked.
     */
    pub fn add_layer(&mut self, parent: LayerId, name: &str, kind: LayerKind) -> Result<LayerId> {
        if !self.node(parent)?.is_group() {
            return Err(TreeError::NotAGroup(parent));
        }
        let id = self.allocate(name, kind, Some(parent));
        self.node_mut(parent)?.children.push(id);
        Ok(id)
    }

    /*
     * Creates an empty group at the very start of the root's child list, so new
     * groups are always promoted to the top of the document.
     */
    pub fn create_group(&mut self, name: &str) -> LayerId {
        let root = self.root;
        let id = self.allocate(name, LayerKind::Group, Some(root));
        if let Some(Some(root_node)) = self.slots.get_mut(root.0 as usize) {
            root_node.children.insert(0, id);
        }
        log::debug!("LayerTree: Created group '{name}' as {id} at the top of the document.");
        id
    }

    fn allocate(&mut self, name: &str, kind: LayerKind, parent: Option<LayerId>) -> LayerId {
        let id = LayerId(self.slots.len() as u32);
        self.slots.push(Some(LayerNode {
            id,
            name: name.to_string(),
            kind,
            visible: true,
            locked: false,
            source: None,
            parent,
            children: Vec::new(),
        }));
        id
    }

    /*
     * Looks up a group by name among the document's top-level layers, where
     * `create_group` puts new groups.
     *
     * Args:
     *   name: exact group name; content layers with that name do not count.
     *
     * Returns:
     *   The first matching group in top-level order, or `None`.
     */
    pub fn find_group_by_name(&self, name: &str) -> Option<LayerId> {
        self.top_level()
            .iter()
            .copied()
            .find(|&id| self.get(id).is_some_and(|n| n.is_group() && n.name == name))
    }

    /// Whether `ancestor` appears on the parent chain of `node`.
    pub fn is_ancestor(&self, ancestor: LayerId, node: LayerId) -> bool {
        self.ancestors(node).any(|id| id == ancestor)
    }

    /*
     * Moves `node` to the end of `target`'s child list. Moving the root, moving a
     * layer into itself, or moving a group into one of its own descendants would
     * break the tree and is rejected with `InvalidMove`.
     */
    pub fn move_into(&mut self, node: LayerId, target: LayerId) -> Result<()> {
        self.check_move(node, target)?;

        let old_parent = self.node(node)?.parent;
        if let Some(old_parent) = old_parent {
            self.node_mut(old_parent)?.children.retain(|&c| c != node);
        }
        self.node_mut(target)?.children.push(node);
        self.node_mut(node)?.parent = Some(target);
        log::trace!("LayerTree: Moved {node} into {target}.");
        Ok(())
    }

    /// Validates a prospective `move_into` without mutating anything.
    pub fn check_move(&self, node: LayerId, target: LayerId) -> Result<()> {
        self.node(node)?;
        if !self.node(target)?.is_group() {
            return Err(TreeError::NotAGroup(target));
        }
        if node == self.root {
            return Err(TreeError::RootImmutable);
        }
        if node == target || self.is_ancestor(node, target) {
            return Err(TreeError::InvalidMove { node, target });
        }
        Ok(())
    }

    /*
     * Removes a layer and its whole subtree. Handles to removed layers stop
     * resolving; they are never handed out again.
     */
    pub fn remove(&mut self, id: LayerId) -> Result<()> {
        if id == self.root {
            return Err(TreeError::RootImmutable);
        }
        let parent = self.node(id)?.parent;
        if let Some(parent) = parent {
            self.node_mut(parent)?.children.retain(|&c| c != id);
        }
        let mut doomed = vec![id];
        while let Some(current) = doomed.pop() {
            if let Some(slot) = self.slots.get_mut(current.0 as usize) {
                if let Some(node) = slot.take() {
                    doomed.extend(node.children);
                }
            }
        }
        Ok(())
    }

    pub fn set_name(&mut self, id: LayerId, name: &str) -> Result<()> {
        self.node_mut(id)?.name = name.to_string();
        Ok(())
    }

    pub fn set_visible(&mut self, id: LayerId, visible: bool) -> Result<()> {
        self.node_mut(id)?.visible = visible;
        Ok(())
    }

    pub fn set_locked(&mut self, id: LayerId, locked: bool) -> Result<()> {
        self.node_mut(id)?.locked = locked;
        Ok(())
    }

    pub fn set_source(&mut self, id: LayerId, source: Option<PathBuf>) -> Result<()> {
        self.node_mut(id)?.source = source;
        Ok(())
    }

    /*
     * A layer is effectively visible when its own flag is set and its parent is
     * effectively visible. The root always is. Unknown ids are never visible.
     */
    pub fn is_effectively_visible(&self, id: LayerId) -> bool {
        if id == self.root {
            return true;
        }
        match self.get(id) {
            Some(node) if node.visible => {
                node.parent.is_some_and(|parent| self.is_effectively_visible(parent))
            }
            _ => false,
        }
    }

    pub fn ancestors(&self, id: LayerId) -> Ancestors<'_> {
        Ancestors {
            tree: self,
            current: self.parent(id),
        }
    }

    /*
     * Human-readable location of a layer: the names from the first level below
     * the document down to the layer itself, joined with " > ".
     */
    pub fn display_path(&self, id: LayerId) -> String {
        let mut names: Vec<&str> = self
            .ancestors(id)
            .filter(|&a| a != self.root)
            .filter_map(|a| self.get(a).map(|n| n.name.as_str()))
            .collect();
        names.reverse();
        if let Some(node) = self.get(id) {
            names.push(&node.name);
        }
        names.join(" > ")
    }

    /// Depth-first pre-order walk over every layer below the root.
    pub fn pre_order(&self) -> PreOrder<'_> {
        let mut stack: Vec<LayerId> = self.top_level().to_vec();
        stack.reverse();
        PreOrder { tree: self, stack }
    }
}

/// Walks the parent chain upwards, ending with the root.
#[derive(Debug)]
pub struct Ancestors<'a> {
    tree: &'a LayerTree,
    current: Option<LayerId>,
}

impl Iterator for Ancestors<'_> {
    type Item = LayerId;

    fn next(&mut self) -> Option<LayerId> {
        let id = self.current?;
        self.current = self.tree.parent(id);
        Some(id)
    }
}

#[derive(Debug)]
pub struct PreOrder<'a> {
    tree: &'a LayerTree,
    stack: Vec<LayerId>,
}

impl Iterator for PreOrder<'_> {
    type Item = LayerId;

    fn next(&mut self) -> Option<LayerId> {
        let id = self.stack.pop()?;
        for &child in self.tree.children(id).iter().rev() {
            self.stack.push(child);
        }
        Some(id)
    }
}
