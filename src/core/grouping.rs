/*
 * Applies rename plans to the tree: renames each targeted layer and moves it into
 * a group chosen by the grouping mode.
 *
 * Index targets address the document's top-level layers as they were before this
 * pass touched anything. All entries are resolved to layer ids up front, so moves
 * made by earlier entries cannot shift what later entries point at. Groups are
 * created on first use at the top of the document and reused afterwards, also
 * across repeated passes.
 */
use super::failure::ItemFailure;
use super::layer_tree::{LayerId, LayerTree, TreeError};
use super::plan::{PlanTarget, RenamePlanEntry};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupingMode {
    #[default]
    ByCategory,
    ByTier,
    Combined,
}

impl GroupingMode {
    /*
     * Accepts "1"/"2"/"3" or the mode names. Anything else selects grouping by
     * category.
     */
    pub fn from_selector(selector: &str) -> Self {
        match selector.trim().to_lowercase().as_str() {
            "2" | "tier" | "by_tier" => GroupingMode::ByTier,
            "3" | "combined" => GroupingMode::Combined,
            "1" | "category" | "by_category" => GroupingMode::ByCategory,
            other => {
                log::debug!("GroupPlanner: Unknown grouping selector '{other}', using by-category.");
                GroupingMode::ByCategory
            }
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            GroupingMode::ByCategory => "content category",
            GroupingMode::ByTier => "visual tier",
            GroupingMode::Combined => "tier and category",
        }
    }
}

/*
 * The name a layer ends up with: the category (or, lacking one, the tier) followed
 * by the entry's new name. `None` when that would be empty, in which case the layer
 * keeps its name.
 */
pub fn compose_name(entry: &RenamePlanEntry) -> Option<String> {
    let prefix = entry
        .category
        .as_deref()
        .or(entry.visual_tier.as_deref())
        .unwrap_or_default();
    let name = format!("{prefix}{}", entry.new_name);
    (!name.trim().is_empty()).then_some(name)
}

pub fn resolve_group_name(entry: &RenamePlanEntry, mode: GroupingMode) -> Option<String> {
    let category = entry.category.as_deref();
    let tier = entry.visual_tier.as_deref();
    match mode {
        GroupingMode::ByCategory => category.map(str::to_string),
        GroupingMode::ByTier => tier.map(str::to_string),
        GroupingMode::Combined => match (tier, category) {
            (Some(tier), Some(category)) => Some(format!("{tier} - {category}")),
            (Some(only), None) | (None, Some(only)) => Some(only.to_string()),
            (None, None) => None,
        },
    }
}

/// Groups created or found during one pass, by name.
#[derive(Debug, Default)]
pub struct GroupRegistry {
    groups: HashMap<String, LayerId>,
    created: usize,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn created(&self) -> usize {
        self.created
    }

    pub fn get(&self, name: &str) -> Option<LayerId> {
        self.groups.get(name).copied()
    }

    /*
     * The group already known under `name`: the one registered earlier in this
     * pass, else an existing top-level group of that name.
     */
    pub fn lookup(&self, tree: &LayerTree, name: &str) -> Option<LayerId> {
        self.get(name)
            .filter(|&id| tree.contains(id))
            .or_else(|| tree.find_group_by_name(name))
    }

    pub fn get_or_create(&mut self, tree: &mut LayerTree, name: &str) -> LayerId {
        let id = match self.lookup(tree, name) {
            Some(id) => id,
            None => {
                self.created += 1;
                tree.create_group(name)
            }
        };
        self.groups.insert(name.to_string(), id);
        id
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlanItemError {
    IndexOutOfRange(i64),
    UnparsedIndex(String),
    MissingLayer(LayerId),
    AlreadyHandled(LayerId),
    GroupingTarget { node: LayerId, name: String },
    Tree(TreeError),
}

impl From<TreeError> for PlanItemError {
    fn from(err: TreeError) -> Self {
        PlanItemError::Tree(err)
    }
}

impl std::fmt::Display for PlanItemError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanItemError::IndexOutOfRange(index) => {
                write!(f, "index {index} does not address a top-level layer")
            }
            PlanItemError::UnparsedIndex(text) => write!(f, "'{text}' is not a layer index"),
            PlanItemError::MissingLayer(id) => write!(f, "layer {id} no longer exists"),
            PlanItemError::AlreadyHandled(id) => {
                write!(f, "layer {id} was already handled by an earlier row")
            }
            PlanItemError::GroupingTarget { node, name } => {
                write!(f, "layer {node} is the group '{name}' this plan groups into")
            }
            PlanItemError::Tree(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for PlanItemError {}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanReport {
    pub processed: usize,
    pub skipped: Vec<ItemFailure<PlanTarget, PlanItemError>>,
    pub groups_created: usize,
}

impl PlanReport {
    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }
}

fn resolve_target(target: &PlanTarget, top_level: &[LayerId]) -> Result<LayerId, PlanItemError> {
    match target {
        PlanTarget::Node(id) => Ok(*id),
        PlanTarget::Index(index) => usize::try_from(*index)
            .ok()
            .and_then(|i| top_level.get(i).copied())
            .ok_or(PlanItemError::IndexOutOfRange(*index)),
        PlanTarget::Unparsed(text) => Err(PlanItemError::UnparsedIndex(text.clone())),
    }
}

// Index entries run in index order, everything else after them in plan order.
fn application_order(target: &PlanTarget) -> (u8, i64) {
    match target {
        PlanTarget::Index(index) => (0, *index),
        _ => (1, 0),
    }
}

/*
 * Applies `entries` to `tree`, grouping by `mode`.
 *
 * Args:
 *   tree: the document tree; mutated in place.
 *   entries: plan rows. Index targets refer to the top level as it is on entry.
 *   mode: how each row's group name is derived.
 *
 * Returns:
 *   A report of processed rows, skipped rows with their causes, and the number
 *   of groups created. Row failures never abort the pass.
 *
 * A row whose target is itself one of the groups this plan groups into is
 * skipped. This is what happens when an index plan is applied a second time:
 * the groups made by the first pass now occupy the indices.
 */
pub fn apply_plan(tree: &mut LayerTree, entries: &[RenamePlanEntry], mode: GroupingMode) -> PlanReport {
    let top_level = tree.top_level().to_vec();
    let group_names: HashSet<String> = entries
        .iter()
        .filter_map(|entry| resolve_group_name(entry, mode))
        .collect();
    let mut ordered: Vec<(&RenamePlanEntry, Result<LayerId, PlanItemError>)> = entries
        .iter()
        .map(|entry| (entry, resolve_target(&entry.target, &top_level)))
        .collect();
    ordered.sort_by_key(|(entry, _)| application_order(&entry.target));

    let mut registry = GroupRegistry::new();
    let mut handled = HashSet::new();
    let mut report = PlanReport::default();

    for (entry, resolved) in ordered {
        let outcome = resolved.and_then(|node| {
            if !handled.insert(node) {
                return Err(PlanItemError::AlreadyHandled(node));
            }
            if let Some(group) = tree.get(node).filter(|n| n.is_group() && group_names.contains(&n.name)) {
                return Err(PlanItemError::GroupingTarget {
                    node,
                    name: group.name.clone(),
                });
            }
            apply_entry(tree, &mut registry, entry, node, mode)
        });
        match outcome {
            Ok(()) => report.processed += 1,
            Err(cause) => {
                log::warn!("GroupPlanner: Skipping plan row for {}: {cause}", entry.target);
                report.skipped.push(ItemFailure::new(entry.target.clone(), cause));
            }
        }
    }

    report.groups_created = registry.created();
    log::info!(
        "GroupPlanner: Grouped by {}: {} processed, {} skipped, {} group(s) created.",
        mode.display_name(),
        report.processed,
        report.skipped_count(),
        report.groups_created
    );
    report
}

/*
 * Renames and moves one layer. Every check that could fail runs before the tree is
 * touched, so a skipped entry leaves its layer as it was.
 */
fn apply_entry(
    tree: &mut LayerTree,
    registry: &mut GroupRegistry,
    entry: &RenamePlanEntry,
    node: LayerId,
    mode: GroupingMode,
) -> Result<(), PlanItemError> {
    if !tree.contains(node) {
        return Err(PlanItemError::MissingLayer(node));
    }
    if node == tree.root() {
        return Err(TreeError::RootImmutable.into());
    }

    // Resolve the group before renaming, so a renamed group cannot be mistaken for it.
    let group = match resolve_group_name(entry, mode) {
        Some(name) => {
            if let Some(existing) = registry.lookup(tree, &name) {
                tree.check_move(node, existing)?;
            }
            Some(registry.get_or_create(tree, &name))
        }
        None => None,
    };

    if let Some(name) = compose_name(entry) {
        tree.set_name(node, &name)?;
    }
    if let Some(group) = group {
        tree.move_into(node, group)?;
        log::trace!("GroupPlanner: Moved {node} into {group}.");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::layer_tree::{ContentKind, LayerKind};

    const PIXEL: LayerKind = LayerKind::Content(ContentKind::Pixel);

    fn entry(index: i64, name: &str, category: &str, tier: &str) -> RenamePlanEntry {
        RenamePlanEntry::new(PlanTarget::Index(index), name, Some(category), Some(tier))
    }

    fn group_names(tree: &LayerTree) -> Vec<String> {
        tree.pre_order()
            .filter_map(|id| tree.get(id))
            .filter(|n| n.is_group())
            .map(|n| n.name.clone())
            .collect()
    }

    #[test]
    fn test_from_selector_falls_back_to_category() {
        assert_eq!(GroupingMode::from_selector("2"), GroupingMode::ByTier);
        assert_eq!(GroupingMode::from_selector(" 3 "), GroupingMode::Combined);
        assert_eq!(GroupingMode::from_selector("Tier"), GroupingMode::ByTier);
        assert_eq!(GroupingMode::from_selector("7"), GroupingMode::ByCategory);
        assert_eq!(GroupingMode::from_selector(""), GroupingMode::ByCategory);
    }

    #[test]
    fn test_compose_and_resolve_names() {
        let full = entry(0, "Title", "【Text】", "Foreground");
        assert_eq!(compose_name(&full).as_deref(), Some("【Text】Title"));
        assert_eq!(resolve_group_name(&full, GroupingMode::ByCategory).as_deref(), Some("【Text】"));
        assert_eq!(resolve_group_name(&full, GroupingMode::ByTier).as_deref(), Some("Foreground"));
        assert_eq!(
            resolve_group_name(&full, GroupingMode::Combined).as_deref(),
            Some("Foreground - 【Text】")
        );

        let tier_only = RenamePlanEntry::new(PlanTarget::Index(0), "Sky", None, Some("Background"));
        assert_eq!(compose_name(&tier_only).as_deref(), Some("BackgroundSky"));
        assert_eq!(resolve_group_name(&tier_only, GroupingMode::ByCategory), None);
        assert_eq!(
            resolve_group_name(&tier_only, GroupingMode::Combined).as_deref(),
            Some("Background")
        );

        let bare = RenamePlanEntry::new(PlanTarget::Index(0), "Plain", None, None);
        assert_eq!(compose_name(&bare).as_deref(), Some("Plain"));
        assert_eq!(resolve_group_name(&bare, GroupingMode::Combined), None);

        let nothing = RenamePlanEntry::new(PlanTarget::Index(0), "", None, None);
        assert_eq!(compose_name(&nothing), None);
    }

    #[test]
    fn test_plan_with_out_of_range_row_processes_the_rest() {
        let mut tree = LayerTree::new("doc");
        let root = tree.root();
        let first = tree.add_layer(root, "layer a", PIXEL).unwrap();
        let second = tree.add_layer(root, "layer b", PIXEL).unwrap();
        let plan = vec![
            RenamePlanEntry::new(PlanTarget::Index(0), "Title", Some("Text"), None),
            RenamePlanEntry::new(PlanTarget::Index(99), "X", Some("Y"), None),
            RenamePlanEntry::new(PlanTarget::Index(1), "BG", Some("Background"), None),
        ];

        let report = apply_plan(&mut tree, &plan, GroupingMode::ByCategory);

        assert_eq!(report.processed, 2);
        assert_eq!(report.skipped_count(), 1);
        assert_eq!(report.skipped[0].item, PlanTarget::Index(99));
        assert_eq!(report.skipped[0].cause, PlanItemError::IndexOutOfRange(99));
        assert_eq!(report.groups_created, 2);
        assert_eq!(tree.get(first).unwrap().name, "TextTitle");
        assert_eq!(tree.get(second).unwrap().name, "BackgroundBG");
        assert_eq!(tree.display_path(first), "Text > TextTitle");
        assert_eq!(tree.display_path(second), "Background > BackgroundBG");
        // The group created last is the top-most one.
        let top: Vec<&str> = tree
            .top_level()
            .iter()
            .map(|&id| tree.get(id).unwrap().name.as_str())
            .collect();
        assert_eq!(top, vec!["Background", "Text"]);
    }

    #[test]
    fn test_indices_resolve_against_the_original_order() {
        let mut tree = LayerTree::new("doc");
        let root = tree.root();
        let ids: Vec<LayerId> = (0..4)
            .map(|i| tree.add_layer(root, &format!("L{i}"), PIXEL).unwrap())
            .collect();
        // Rows out of order; applying 0 first moves a layer and creates a group,
        // which would shift every live index if they were re-read.
        let plan = vec![
            entry(3, "d", "B", ""),
            entry(0, "a", "A", ""),
            entry(2, "c", "A", ""),
            entry(1, "b", "B", ""),
        ];

        let report = apply_plan(&mut tree, &plan, GroupingMode::ByCategory);

        assert_eq!(report.processed, 4);
        assert_eq!(report.groups_created, 2);
        let names: Vec<&str> = ids.iter().map(|&id| tree.get(id).unwrap().name.as_str()).collect();
        assert_eq!(names, vec!["Aa", "Bb", "Ac", "Bd"]);
        let group_a = tree.find_group_by_name("A").unwrap();
        let group_b = tree.find_group_by_name("B").unwrap();
        assert_eq!(tree.children(group_a), &[ids[0], ids[2]]);
        assert_eq!(tree.children(group_b), &[ids[1], ids[3]]);
    }

    #[test]
    fn test_applying_twice_reuses_groups() {
        let mut tree = LayerTree::new("doc");
        let root = tree.root();
        let a = tree.add_layer(root, "a", PIXEL).unwrap();
        let b = tree.add_layer(root, "b", PIXEL).unwrap();
        let plan = vec![
            RenamePlanEntry::new(PlanTarget::Node(a), "Title", Some("【Text】"), Some("Foreground")),
            RenamePlanEntry::new(PlanTarget::Node(b), "Caption", Some("【Text】"), Some("Foreground")),
        ];

        let first = apply_plan(&mut tree, &plan, GroupingMode::Combined);
        let second = apply_plan(&mut tree, &plan, GroupingMode::Combined);

        assert_eq!(first.groups_created, 1);
        assert_eq!(second.groups_created, 0);
        assert_eq!(second.processed, 2);
        assert_eq!(group_names(&tree), vec!["Foreground - 【Text】"]);
        assert_eq!(tree.get(a).unwrap().name, "【Text】Title");
    }

    #[test]
    fn test_index_plan_twice_never_duplicates_groups() {
        let mut tree = LayerTree::new("doc");
        let root = tree.root();
        tree.add_layer(root, "a", PIXEL).unwrap();
        tree.add_layer(root, "b", PIXEL).unwrap();
        let plan = vec![entry(0, "x", "Cat", ""), entry(1, "y", "Cat", "")];

        apply_plan(&mut tree, &plan, GroupingMode::ByCategory);
        apply_plan(&mut tree, &plan, GroupingMode::ByCategory);

        let cats = group_names(&tree).into_iter().filter(|n| n == "Cat").count();
        assert_eq!(cats, 1);
    }

    #[test]
    fn test_index_plan_twice_with_two_categories_leaves_groups_alone() {
        let mut tree = LayerTree::new("doc");
        let root = tree.root();
        let a = tree.add_layer(root, "a", PIXEL).unwrap();
        let b = tree.add_layer(root, "b", PIXEL).unwrap();
        let plan = vec![entry(0, "x", "A", ""), entry(1, "y", "B", "")];

        let first = apply_plan(&mut tree, &plan, GroupingMode::ByCategory);
        assert_eq!(first.groups_created, 2);
        let layout: Vec<String> = tree.pre_order().map(|id| tree.display_path(id)).collect();
        assert_eq!(layout, vec!["B", "B > By", "A", "A > Ax"]);

        // The created groups now sit at indices 0 and 1.
        let second = apply_plan(&mut tree, &plan, GroupingMode::ByCategory);

        assert_eq!(second.groups_created, 0);
        assert_eq!(second.processed, 0);
        assert_eq!(second.skipped_count(), 2);
        assert!(
            second
                .skipped
                .iter()
                .all(|s| matches!(s.cause, PlanItemError::GroupingTarget { .. }))
        );
        let after: Vec<String> = tree.pre_order().map(|id| tree.display_path(id)).collect();
        assert_eq!(after, layout);
        assert_eq!(tree.get(a).unwrap().name, "Ax");
        assert_eq!(tree.get(b).unwrap().name, "By");
    }

    #[test]
    fn test_group_not_named_by_the_plan_can_still_be_grouped() {
        let mut tree = LayerTree::new("doc");
        let root = tree.root();
        let folder = tree.add_layer(root, "Folder", LayerKind::Group).unwrap();
        let plan = vec![RenamePlanEntry::new(PlanTarget::Index(0), "Set", Some("A"), None)];

        let report = apply_plan(&mut tree, &plan, GroupingMode::ByCategory);

        assert_eq!(report.processed, 1);
        assert_eq!(tree.display_path(folder), "A > ASet");
    }

    #[test]
    fn test_duplicate_and_missing_targets_are_skipped() {
        let mut tree = LayerTree::new("doc");
        let root = tree.root();
        let a = tree.add_layer(root, "a", PIXEL).unwrap();
        let gone = tree.add_layer(root, "gone", PIXEL).unwrap();
        tree.remove(gone).unwrap();
        let plan = vec![
            RenamePlanEntry::new(PlanTarget::Node(a), "first", None, None),
            RenamePlanEntry::new(PlanTarget::Node(a), "second", None, None),
            RenamePlanEntry::new(PlanTarget::Node(gone), "ghost", None, None),
            RenamePlanEntry::new(PlanTarget::Index(-1), "neg", None, None),
            RenamePlanEntry::new(PlanTarget::Unparsed("x".to_string()), "bad", None, None),
        ];

        let report = apply_plan(&mut tree, &plan, GroupingMode::ByCategory);

        assert_eq!(report.processed, 1);
        assert_eq!(tree.get(a).unwrap().name, "first");
        let causes: Vec<&PlanItemError> = report.skipped.iter().map(|s| &s.cause).collect();
        assert_eq!(
            causes,
            vec![
                &PlanItemError::IndexOutOfRange(-1),
                &PlanItemError::AlreadyHandled(a),
                &PlanItemError::MissingLayer(gone),
                &PlanItemError::UnparsedIndex("x".to_string()),
            ]
        );
    }

    #[test]
    fn test_group_cannot_be_moved_into_itself() {
        let mut tree = LayerTree::new("doc");
        let root = tree.root();
        let group = tree.add_layer(root, "Cat", LayerKind::Group).unwrap();
        let inner = tree.add_layer(group, "inner", PIXEL).unwrap();
        let plan = vec![
            RenamePlanEntry::new(PlanTarget::Node(group), "renamed", Some("Cat"), None),
            RenamePlanEntry::new(PlanTarget::Node(inner), "", Some("Cat"), None),
        ];

        let report = apply_plan(&mut tree, &plan, GroupingMode::ByCategory);

        assert_eq!(report.processed, 1);
        assert_eq!(
            report.skipped[0].cause,
            PlanItemError::GroupingTarget {
                node: group,
                name: "Cat".to_string()
            }
        );
        // The skipped entry did not rename the group either.
        assert_eq!(tree.get(group).unwrap().name, "Cat");
        assert_eq!(tree.parent(inner), Some(group));
        assert_eq!(report.groups_created, 0);
    }
}
