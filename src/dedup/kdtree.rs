/// Two-dimensional kd-tree keyed by `[x, y]` points.
///
/// Nodes live in an arena; children are indices into it. Points equal on the
/// split axis go right.
#[derive(Debug)]
pub struct KdTree<T> {
    nodes: Vec<Node<T>>,
    root: Option<usize>,
}

#[derive(Debug)]
struct Node<T> {
    point: [f32; 2],
    value: T,
    left: Option<usize>,
    right: Option<usize>,
}

impl<T> KdTree<T> {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            root: None,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn insert(&mut self, point: [f32; 2], value: T) {
        let idx = self.nodes.len();
        self.nodes.push(Node {
            point,
            value,
            left: None,
            right: None,
        });
        let Some(mut current) = self.root else {
            self.root = Some(idx);
            return;
        };
        let mut depth = 0usize;
        loop {
            let axis = depth % 2;
            let node = &mut self.nodes[current];
            let slot = if point[axis] < node.point[axis] {
                &mut node.left
            } else {
                &mut node.right
            };
            match *slot {
                Some(next) => {
                    current = next;
                    depth += 1;
                }
                None => {
                    *slot = Some(idx);
                    return;
                }
            }
        }
    }

    /// All entries whose Euclidean distance to `center` is at most `radius`.
    pub fn radius_search(&self, center: [f32; 2], radius: f32) -> Vec<(&[f32; 2], &T)> {
        let mut found = Vec::new();
        let Some(root) = self.root else {
            return found;
        };
        let radius_sq = radius * radius;
        let mut stack = vec![(root, 0usize)];
        while let Some((idx, depth)) = stack.pop() {
            let node = &self.nodes[idx];
            let dx = node.point[0] - center[0];
            let dy = node.point[1] - center[1];
            if dx * dx + dy * dy <= radius_sq {
                found.push((&node.point, &node.value));
            }
            let axis = depth % 2;
            let diff = center[axis] - node.point[axis];
            if let Some(left) = node.left {
                if diff < radius {
                    stack.push((left, depth + 1));
                }
            }
            if let Some(right) = node.right {
                if diff >= -radius {
                    stack.push((right, depth + 1));
                }
            }
        }
        found
    }

    /// Drops every entry for which `keep` returns false and rebuilds the tree.
    /// Returns the number of entries removed.
    pub fn retain(&mut self, mut keep: impl FnMut(&T) -> bool) -> usize {
        let before = self.nodes.len();
        let old = std::mem::take(&mut self.nodes);
        self.root = None;
        for node in old {
            if keep(&node.value) {
                self.insert(node.point, node.value);
            }
        }
        before - self.nodes.len()
    }
}

impl<T> Default for KdTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn brute_force(points: &[[f32; 2]], center: [f32; 2], radius: f32) -> Vec<usize> {
        points
            .iter()
            .enumerate()
            .filter(|(_, p)| {
                let dx = p[0] - center[0];
                let dy = p[1] - center[1];
                dx * dx + dy * dy <= radius * radius
            })
            .map(|(i, _)| i)
            .collect()
    }

    #[test]
    fn radius_search_matches_linear_scan() {
        let mut tree = KdTree::new();
        let mut points = Vec::new();
        // Deterministic scatter over the unit square.
        for i in 0..200u32 {
            let x = ((i * 37) % 101) as f32 / 100.0;
            let y = ((i * 61) % 97) as f32 / 96.0;
            points.push([x, y]);
            tree.insert([x, y], i as usize);
        }
        for (center, radius) in [([0.5, 0.5], 0.1), ([0.0, 1.0], 0.25), ([0.33, 0.71], 0.05)] {
            let mut got: Vec<usize> = tree
                .radius_search(center, radius)
                .into_iter()
                .map(|(_, v)| *v)
                .collect();
            got.sort_unstable();
            assert_eq!(got, brute_force(&points, center, radius));
        }
    }

    #[test]
    fn empty_tree_finds_nothing() {
        let tree: KdTree<()> = KdTree::new();
        assert!(tree.radius_search([0.5, 0.5], 1.0).is_empty());
        assert!(tree.is_empty());
    }

    #[test]
    fn zero_radius_matches_exact_point_only() {
        let mut tree = KdTree::new();
        tree.insert([0.2, 0.2], "a");
        tree.insert([0.2, 0.2], "b");
        tree.insert([0.3, 0.2], "c");
        let hits = tree.radius_search([0.2, 0.2], 0.0);
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn retain_rebuilds_searchable_tree() {
        let mut tree = KdTree::new();
        for i in 0..10 {
            tree.insert([i as f32 / 10.0, 0.5], i);
        }
        let removed = tree.retain(|v| v % 2 == 0);
        assert_eq!(removed, 5);
        assert_eq!(tree.len(), 5);
        let hits: Vec<i32> = tree
            .radius_search([0.4, 0.5], 0.15)
            .into_iter()
            .map(|(_, v)| *v)
            .collect();
        assert_eq!(hits, vec![4]);
    }
}
