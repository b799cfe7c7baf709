/// A disjoint-set forest over the dense indices `0..len`.
///
/// Used for both camera connectivity in the view graph and `(camera, keypoint)`
/// connectivity when building tracks.
#[derive(Debug, Clone)]
pub struct UnionFind {
    parent: Vec<usize>,
    size: Vec<usize>,
}

impl UnionFind {
    /// Creates `len` singleton sets.
    pub fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
            size: vec![1; len],
        }
    }

    /// Returns the root of the set containing `id`, compressing the path on the way.
    pub fn find(&mut self, mut id: usize) -> usize {
        let mut root = id;
        while self.parent[root] != root {
            root = self.parent[root];
        }

        while self.parent[id] != root {
            let next = self.parent[id];
            self.parent[id] = root;
            id = next;
        }

        root
    }

    /// Merges the sets of `a` and `b` by size, returning the new root.
    pub fn union(&mut self, a: usize, b: usize) -> usize {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return ra;
        }

        let (big, small) = if self.size[ra] >= self.size[rb] {
            (ra, rb)
        } else {
            (rb, ra)
        };
        self.parent[small] = big;
        self.size[big] += self.size[small];
        big
    }

    /// Whether `a` and `b` are in the same set.
    pub fn connected(&mut self, a: usize, b: usize) -> bool {
        self.find(a) == self.find(b)
    }

    /// Number of elements in the set containing `id`.
    pub fn set_size(&mut self, id: usize) -> usize {
        let root = self.find(id);
        self.size[root]
    }

    /// All sets, each sorted ascending, ordered by their smallest element.
    pub fn groups(&mut self) -> Vec<Vec<usize>> {
        let mut slot = vec![usize::MAX; self.parent.len()];
        let mut groups: Vec<Vec<usize>> = Vec::new();
        for id in 0..self.parent.len() {
            let root = self.find(id);
            if slot[root] == usize::MAX {
                slot[root] = groups.len();
                groups.push(Vec::new());
            }
            groups[slot[root]].push(id);
        }
        groups
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.parent.len()
    }

    /// Whether there are no elements.
    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_singletons() {
        let mut uf = UnionFind::new(10);
        assert_eq!(uf.find(0), 0);
        assert_eq!(uf.find(5), 5);
        assert_eq!(uf.set_size(5), 1);
    }

    #[test]
    fn test_union() {
        let mut uf = UnionFind::new(10);

        uf.union(0, 1);
        assert!(uf.connected(0, 1));

        uf.union(1, 2);
        assert!(uf.connected(0, 2));

        uf.union(3, 4);
        assert!(uf.connected(3, 4));
        assert!(!uf.connected(2, 3));

        uf.union(0, 3);
        assert!(uf.connected(0, 4));
        assert_eq!(uf.set_size(4), 5);
    }

    #[test]
    fn test_groups() {
        let mut uf = UnionFind::new(6);
        uf.union(5, 1);
        uf.union(2, 4);
        uf.union(4, 1);
        assert_eq!(uf.groups(), vec![vec![0], vec![1, 2, 4, 5], vec![3]]);
    }
}
