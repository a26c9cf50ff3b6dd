//! Combo menu tree: a precomputed static arena used
//! by [`super::rt`] to compute a shortest navigation path between two
//! screens. Nodes are addressed by index; parent pointers are index
//! values, never owning references, matching the spec's own description
//! of the tree as "a static arena keyed by node index".

use crate::display::MenuId;

/// A node in the menu tree. The root (index 0) is the always-visible main
/// screen; every other node is reached from its parent by one or more
/// button presses recorded in `enter`.
#[derive(Clone, Copy, Debug)]
pub struct MenuNode {
    pub id: Option<MenuId>,
    pub parent: Option<usize>,
}

/// Index into [`MENU_TREE`]. The root main screen is always index 0.
pub type NodeIndex = usize;
pub const ROOT: NodeIndex = 0;

/// The pump's menu list hangs directly off the main screen: `MENU` cycles
/// through entries, `CHECK` enters the highlighted one. `BasalRateProfile`
/// carries its own sub-level for the five profile slots.
pub static MENU_TREE: &[MenuNode] = &[
    MenuNode { id: None, parent: None }, // 0: root / main screen
    MenuNode { id: Some(MenuId::StandardBolus), parent: Some(ROOT) }, // 1
    MenuNode { id: Some(MenuId::MultiwaveBolus), parent: Some(ROOT) }, // 2
    MenuNode { id: Some(MenuId::ExtendedBolus), parent: Some(ROOT) }, // 3
    MenuNode { id: Some(MenuId::Tbr), parent: Some(ROOT) }, // 4
    MenuNode { id: Some(MenuId::BasalRateProfile(1)), parent: Some(ROOT) }, // 5
    MenuNode { id: Some(MenuId::MyData), parent: Some(ROOT) }, // 6
    MenuNode { id: Some(MenuId::Time), parent: Some(ROOT) }, // 7
    MenuNode { id: Some(MenuId::Settings), parent: Some(ROOT) }, // 8
    MenuNode { id: Some(MenuId::BasalRateProfile(2)), parent: Some(5) }, // 9
    MenuNode { id: Some(MenuId::BasalRateProfile(3)), parent: Some(5) }, // 10
    MenuNode { id: Some(MenuId::BasalRateProfile(4)), parent: Some(5) }, // 11
    MenuNode { id: Some(MenuId::BasalRateProfile(5)), parent: Some(5) }, // 12
];

/// Finds the tree index holding `id`, if any.
#[must_use]
pub fn find(id: MenuId) -> Option<NodeIndex> {
    MENU_TREE.iter().position(|n| n.id == Some(id))
}

/// Position of `node` among its siblings (nodes sharing the same parent),
/// in `MENU_TREE` array order -- the number of `MENU` presses needed to
/// walk the highlight from the first sibling onto `node`.
#[must_use]
pub fn sibling_offset(node: NodeIndex) -> usize {
    let parent = MENU_TREE[node].parent;
    MENU_TREE
        .iter()
        .take(node)
        .filter(|n| n.parent == parent)
        .count()
}

fn ancestors(mut node: NodeIndex) -> Vec<NodeIndex> {
    let mut path = vec![node];
    while let Some(parent) = MENU_TREE[node].parent {
        path.push(parent);
        node = parent;
    }
    path
}

/// A navigation step: move from `from` to `to`, either drilling down
/// (`to` is a child of `from`) or backing up (`to` is `from`'s parent).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Step {
    pub from: NodeIndex,
    pub to: NodeIndex,
}

/// Computes the path from `from` to `to` through their lowest common
/// ancestor: first a "back-up" half climbing `from` to the LCA, then a
/// "drill-down" half descending from the LCA to `to`.
#[must_use]
pub fn path(from: NodeIndex, to: NodeIndex) -> Vec<Step> {
    if from == to {
        return Vec::new();
    }
    let from_chain = ancestors(from);
    let to_chain = ancestors(to);

    let lca = from_chain
        .iter()
        .find(|a| to_chain.contains(a))
        .copied()
        .unwrap_or(ROOT);

    let mut steps = Vec::new();
    let mut cur = from;
    for &next in from_chain.iter().skip(1) {
        steps.push(Step { from: cur, to: next });
        cur = next;
        if cur == lca {
            break;
        }
    }

    let mut down_chain: Vec<NodeIndex> = to_chain
        .into_iter()
        .take_while(|&n| n != lca)
        .collect();
    down_chain.reverse();
    for next in down_chain {
        steps.push(Step { from: cur, to: next });
        cur = next;
    }
    steps
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_node_has_empty_path() {
        assert!(path(ROOT, ROOT).is_empty());
    }

    #[test]
    fn sibling_path_goes_through_root() {
        let sb = find(MenuId::StandardBolus).unwrap();
        let tbr = find(MenuId::Tbr).unwrap();
        let steps = path(sb, tbr);
        assert_eq!(steps.first().unwrap().from, sb);
        assert_eq!(steps.last().unwrap().to, tbr);
        assert!(steps.iter().any(|s| s.to == ROOT || s.from == ROOT));
    }

    #[test]
    fn drill_down_from_root_is_one_step() {
        let sb = find(MenuId::StandardBolus).unwrap();
        let steps = path(ROOT, sb);
        assert_eq!(steps, vec![Step { from: ROOT, to: sb }]);
    }

    #[test]
    fn sibling_offset_counts_earlier_siblings() {
        let sb = find(MenuId::StandardBolus).unwrap();
        let tbr = find(MenuId::Tbr).unwrap();
        assert_eq!(sibling_offset(sb), 0);
        assert_eq!(sibling_offset(tbr), 3);
    }

    #[test]
    fn basal_profile_slots_share_a_parent_below_root() {
        let p1 = find(MenuId::BasalRateProfile(1)).unwrap();
        let p3 = find(MenuId::BasalRateProfile(3)).unwrap();
        let steps = path(p1, p3);
        // p1 *is* the parent node (slot 1 doubles as the profile submenu
        // entry point), so the path is a single drill-down step.
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0], Step { from: p1, to: p3 });
    }
}
