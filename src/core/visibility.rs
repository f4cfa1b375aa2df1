/*
 * Visibility isolation: temporarily mutates the tree so that exactly one layer and
 * its ancestor chain are visible, then puts every flag back.
 *
 * `VisibilitySnapshot` records the `visible` flag of every layer at one point in
 * time and is consumed by `restore`. `IsolationGuard` ties the snapshot to a scope:
 * dropping the guard restores the tree, which also happens when the code holding it
 * returns early or panics. Callers should never need to restore by hand.
 */
use super::layer_tree::{LayerId, LayerTree, Result, TreeError};
use std::ops::Deref;

#[derive(Debug, Clone, PartialEq)]
pub struct VisibilitySnapshot {
    flags: Vec<(LayerId, bool)>,
}

impl VisibilitySnapshot {
    pub fn capture(tree: &LayerTree) -> Self {
        let flags = tree
            .pre_order()
            .filter_map(|id| tree.get(id).map(|node| (id, node.visible)))
            .collect();
        VisibilitySnapshot { flags }
    }

    /*
     * Writes every recorded flag back. Layers removed since the snapshot was taken
     * are skipped. Only flags that actually differ are touched; the number of
     * layers changed is returned.
     */
    pub fn restore(self, tree: &mut LayerTree) -> usize {
        let mut changed = 0;
        for (id, visible) in self.flags {
            match tree.get(id) {
                Some(node) if node.visible != visible => {
                    if tree.set_visible(id, visible).is_ok() {
                        changed += 1;
                    }
                }
                Some(_) => {}
                None => {
                    log::trace!("VisibilityIsolator: Layer {id} vanished before restore, skipping.");
                }
            }
        }
        changed
    }
}

/*
 * Applies isolation for `target` and returns the snapshot needed to undo it:
 * every layer is hidden, then `target` and each of its ancestors below the root are
 * shown. The root is left alone because it is always effectively visible.
 *
 * Args:
 *     tree: The layers whose visibility flags are changed.
 *     target: The layer that must stay visible.
 *
 * Returns:
 *     The visibility before isolation, or `TreeError::UnknownLayer` if `target`
 *     is not in `tree`.
 */
pub fn isolate(tree: &mut LayerTree, target: LayerId) -> Result<VisibilitySnapshot> {
    if !tree.contains(target) {
        return Err(TreeError::UnknownLayer(target));
    }
    let snapshot = VisibilitySnapshot::capture(tree);
    let root = tree.root();

    let mut keep: Vec<LayerId> = tree.ancestors(target).filter(|&a| a != root).collect();
    if target != root {
        keep.push(target);
    }

    let ids: Vec<LayerId> = tree.pre_order().collect();
    for id in ids {
        let wanted = keep.contains(&id);
        let current = tree.get(id).map(|node| node.visible);
        if current != Some(wanted) {
            tree.set_visible(id, wanted)?;
        }
    }
    log::trace!("VisibilityIsolator: Isolated {target} ({} ancestors kept).", keep.len());
    Ok(snapshot)
}

/*
 * Scoped isolation. While the guard lives, the tree can only be read through it;
 * when it goes out of scope the snapshot is reapplied.
 */
#[derive(Debug)]
pub struct IsolationGuard<'a> {
    tree: &'a mut LayerTree,
    snapshot: Option<VisibilitySnapshot>,
    target: LayerId,
}

impl<'a> IsolationGuard<'a> {
    pub fn acquire(tree: &'a mut LayerTree, target: LayerId) -> Result<Self> {
        let snapshot = isolate(tree, target)?;
        Ok(IsolationGuard {
            tree,
            snapshot: Some(snapshot),
            target,
        })
    }

    pub fn tree(&self) -> &LayerTree {
        &*self.tree
    }
}

impl Deref for IsolationGuard<'_> {
    type Target = LayerTree;

    fn deref(&self) -> &LayerTree {
        &*self.tree
    }
}

impl Drop for IsolationGuard<'_> {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            let changed = snapshot.restore(&mut *self.tree);
            log::trace!(
                "VisibilityIsolator: Restored {changed} visibility flags after isolating {}.",
                self.target
            );
        }
    }
}

/// Runs `f` against the tree while `target` is isolated.
pub fn with_isolation<R>(
    tree: &mut LayerTree,
    target: LayerId,
    f: impl FnOnce(&LayerTree) -> R,
) -> Result<R> {
    let guard = IsolationGuard::acquire(tree, target)?;
    Ok(f(guard.tree()))
}
