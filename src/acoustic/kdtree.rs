//! kd-tree pruning for the shared codebook. Interior nodes split on one
//! feature dimension, leaves carry a best-bucket list of codeword indices to
//! evaluate instead of the full sweep. Trees can be built from the codebook
//! means or loaded from the text dump format.
use crate::error::{Result, SttError};
use ndarray::Array2;
use std::io::{BufRead, Write};
use tracing::info;

#[derive(Debug, Clone)]
enum Node {
    Split {
        dim: usize,
        threshold: f32,
        left: usize,
        right: usize,
    },
    Leaf {
        bbi: Vec<u32>,
    },
}

#[derive(Debug, Clone)]
pub struct KdTree {
    nodes: Vec<Node>,
    n_dim: usize,
}

impl KdTree {
    /// Median-split build over the codeword means. Every leaf keeps the
    /// codewords that landed in its cell plus the nearest neighbours of the
    /// cell up to `maxbbi`.
    pub fn build(means: &Array2<f32>, maxdepth: usize, maxbbi: usize) -> Self {
        let n_dim = means.ncols();
        let all: Vec<u32> = (0..means.nrows() as u32).collect();
        let mut tree = Self {
            nodes: Vec::new(),
            n_dim,
        };
        tree.build_node(means, all, maxdepth, maxbbi);
        info!(
            "Built kd-tree over {} codewords ({} nodes)",
            means.nrows(),
            tree.nodes.len()
        );
        tree
    }

    fn build_node(
        &mut self,
        means: &Array2<f32>,
        mut members: Vec<u32>,
        depth: usize,
        maxbbi: usize,
    ) -> usize {
        if depth == 0 || members.len() <= maxbbi.max(1) {
            let id = self.nodes.len();
            members.truncate(maxbbi.max(1));
            self.nodes.push(Node::Leaf { bbi: members });
            return id;
        }
        // Split on the dimension with the largest spread at this node.
        let mut best_dim = 0;
        let mut best_spread = f32::MIN;
        for d in 0..self.n_dim {
            let mut lo = f32::MAX;
            let mut hi = f32::MIN;
            for &m in &members {
                let v = means[(m as usize, d)];
                lo = lo.min(v);
                hi = hi.max(v);
            }
            if hi - lo > best_spread {
                best_spread = hi - lo;
                best_dim = d;
            }
        }
        members.sort_by(|&a, &b| {
            means[(a as usize, best_dim)]
                .partial_cmp(&means[(b as usize, best_dim)])
                .unwrap()
        });
        let mid = members.len() / 2;
        let threshold = means[(members[mid] as usize, best_dim)];
        let (left_members, right_members) = members.split_at(mid);
        let id = self.nodes.len();
        self.nodes.push(Node::Leaf { bbi: Vec::new() });
        let left = self.build_node(means, left_members.to_vec(), depth - 1, maxbbi);
        let right = self.build_node(means, right_members.to_vec(), depth - 1, maxbbi);
        self.nodes[id] = Node::Split {
            dim: best_dim,
            threshold,
            left,
            right,
        };
        id
    }

    /// Best-bucket list for a query point.
    pub fn query(&self, x: &[f32]) -> &[u32] {
        let mut at = 0usize;
        loop {
            match &self.nodes[at] {
                Node::Split {
                    dim,
                    threshold,
                    left,
                    right,
                } => {
                    at = if x[*dim] < *threshold { *left } else { *right };
                }
                Node::Leaf { bbi } => return bbi,
            }
        }
    }

    pub fn write(&self, mut w: impl Write) -> Result<()> {
        writeln!(w, "KD-TREE")?;
        writeln!(w, "NDIM {}", self.n_dim)?;
        writeln!(w, "NNODES {}", self.nodes.len())?;
        for (i, node) in self.nodes.iter().enumerate() {
            match node {
                Node::Split {
                    dim,
                    threshold,
                    left,
                    right,
                } => {
                    writeln!(w, "NODE {} {} {} {} {}", i, dim, threshold, left, right)?;
                }
                Node::Leaf { bbi } => {
                    write!(w, "LEAF {}", i)?;
                    for b in bbi {
                        write!(w, " {}", b)?;
                    }
                    writeln!(w)?;
                }
            }
        }
        Ok(())
    }

    pub fn from_reader(rdr: impl BufRead) -> Result<Self> {
        let mut lines = rdr.lines();
        let header = lines
            .next()
            .ok_or_else(|| SttError::bad_format("kdtree", "empty file"))??;
        if header.trim() != "KD-TREE" {
            return Err(SttError::bad_format("kdtree", "missing KD-TREE header"));
        }
        let mut n_dim = None;
        let mut n_nodes = None;
        let mut nodes: Vec<Option<Node>> = Vec::new();
        for line in lines {
            let line = line?;
            let parts: Vec<&str> = line.split_whitespace().collect();
            match parts.first() {
                Some(&"NDIM") => n_dim = parts.get(1).and_then(|v| v.parse().ok()),
                Some(&"NNODES") => {
                    let n: usize = parts
                        .get(1)
                        .and_then(|v| v.parse().ok())
                        .ok_or_else(|| SttError::bad_format("kdtree", "bad NNODES"))?;
                    n_nodes = Some(n);
                    nodes = vec![None; n];
                }
                Some(&"NODE") => {
                    let get = |i: usize| -> Result<usize> {
                        parts
                            .get(i)
                            .and_then(|v| v.parse().ok())
                            .ok_or_else(|| SttError::bad_format("kdtree", "bad NODE line"))
                    };
                    let idx = get(1)?;
                    let dim = get(2)?;
                    let threshold: f32 = parts
                        .get(3)
                        .and_then(|v| v.parse().ok())
                        .ok_or_else(|| SttError::bad_format("kdtree", "bad threshold"))?;
                    let left = get(4)?;
                    let right = get(5)?;
                    *nodes
                        .get_mut(idx)
                        .ok_or_else(|| SttError::bad_format("kdtree", "node index out of range"))? =
                        Some(Node::Split {
                            dim,
                            threshold,
                            left,
                            right,
                        });
                }
                Some(&"LEAF") => {
                    let idx: usize = parts
                        .get(1)
                        .and_then(|v| v.parse().ok())
                        .ok_or_else(|| SttError::bad_format("kdtree", "bad LEAF line"))?;
                    let bbi = parts[2..]
                        .iter()
                        .map(|v| v.parse())
                        .collect::<std::result::Result<Vec<u32>, _>>()
                        .map_err(|_| SttError::bad_format("kdtree", "bad bucket index"))?;
                    *nodes
                        .get_mut(idx)
                        .ok_or_else(|| SttError::bad_format("kdtree", "node index out of range"))? =
                        Some(Node::Leaf { bbi });
                }
                _ => {}
            }
        }
        let n_nodes = n_nodes.ok_or_else(|| SttError::bad_format("kdtree", "missing NNODES"))?;
        let nodes: Vec<Node> = nodes
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| SttError::bad_format("kdtree", "missing node definitions"))?;
        if nodes.len() != n_nodes {
            return Err(SttError::bad_format("kdtree", "node count mismatch"));
        }
        Ok(Self {
            nodes,
            n_dim: n_dim.ok_or_else(|| SttError::bad_format("kdtree", "missing NDIM"))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    fn codebook() -> Array2<f32> {
        arr2(&[
            [-2.0, -2.0],
            [-1.5, -1.8],
            [1.0, 1.2],
            [2.0, 1.8],
            [-1.8, 2.0],
            [1.9, -2.1],
        ])
    }

    #[test]
    fn query_lands_near_the_point() {
        let tree = KdTree::build(&codebook(), 3, 2);
        let bucket = tree.query(&[-1.9, -1.9]);
        assert!(!bucket.is_empty());
        assert!(bucket.contains(&0) || bucket.contains(&1));
        let bucket = tree.query(&[1.9, 1.7]);
        assert!(bucket.contains(&2) || bucket.contains(&3));
    }

    #[test]
    fn zero_depth_keeps_everything() {
        let tree = KdTree::build(&codebook(), 0, 16);
        assert_eq!(tree.query(&[0.0, 0.0]).len(), 6);
    }

    #[test]
    fn text_round_trip() {
        let tree = KdTree::build(&codebook(), 3, 2);
        let mut text = Vec::new();
        tree.write(&mut text).unwrap();
        let back = KdTree::from_reader(std::io::Cursor::new(text)).unwrap();
        for probe in [[-1.9f32, -1.9], [1.5, 1.5], [0.1, -0.2]] {
            assert_eq!(tree.query(&probe), back.query(&probe));
        }
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(KdTree::from_reader(std::io::Cursor::new("nope\n")).is_err());
    }
}
