/*
 * Keyword search over layer names. Matching is a case-insensitive substring test
 * applied to every layer below the document root, groups included.
 */
use super::layer_tree::{LayerId, LayerTree};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    pub node: LayerId,
    pub name: String,
    pub path: String,
    pub is_group: bool,
}

impl std::fmt::Display for SearchHit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = if self.is_group { "group" } else { "layer" };
        write!(f, "[{kind}] {}", self.path)
    }
}

/*
 * Finds layers and groups whose name contains `keyword`, ignoring case.
 *
 * Args:
 *     tree: The layers to search. The root is not a candidate.
 *     keyword: Text to look for; surrounding whitespace is ignored.
 *
 * Returns:
 *     Hits in pre-order. A blank keyword matches nothing.
 */
pub fn search_layers(tree: &LayerTree, keyword: &str) -> Vec<SearchHit> {
    let needle = keyword.trim().to_lowercase();
    if needle.is_empty() {
        return Vec::new();
    }
    let hits: Vec<SearchHit> = tree
        .pre_order()
        .filter_map(|id| tree.get(id))
        .filter(|node| node.name.to_lowercase().contains(&needle))
        .map(|node| SearchHit {
            node: node.id,
            name: node.name.clone(),
            path: tree.display_path(node.id),
            is_group: node.is_group(),
        })
        .collect();
    log::debug!("LayerSearch: '{keyword}' matched {} layer(s).", hits.len());
    hits
}
