//! Word lattice over the backpointer table: nodes are (word, start frame)
//! pairs, edges carry the acoustic and language scores of the arriving word.
//! This is the substrate for the bestpath pass (shortest path over negated
//! log probabilities), posterior pruning and A* N-best extraction.
use crate::logmath::LogMath;
use crate::search::bptable::BpTable;
use crate::search::hmm::{NO_BP, WORST_SCORE};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::io::Write;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct LatNode {
    pub wid: i32,
    pub sf: i32,
    /// First and last frame this (word, start) was observed ending in.
    pub fef: i32,
    pub lef: i32,
}

#[derive(Debug, Clone, Copy)]
pub struct LatEdge {
    pub from: usize,
    pub to: usize,
    pub ascr: i32,
    pub lscr: i32,
}

#[derive(Debug)]
pub struct Lattice {
    pub nodes: Vec<LatNode>,
    pub edges: Vec<LatEdge>,
    pub start: usize,
    pub end: usize,
    /// Score of the start node's own word segment.
    start_score: i32,
    n_frames: i32,
    out_adj: Vec<Vec<usize>>,
    in_adj: Vec<Vec<usize>>,
}

impl Lattice {
    /// Build from the BP table. Nodes observed ending over fewer than
    /// `min_endfr` frames are dropped, except when the whole utterance is
    /// shorter than the threshold (everything would vanish otherwise).
    pub fn from_bptable(bpt: &BpTable, n_frames: i32, min_endfr: i32) -> Option<Self> {
        if bpt.is_empty() || n_frames == 0 {
            return None;
        }
        let final_bp = bpt.best_exit(n_frames - 1, None)?;

        let mut key_to_node: HashMap<(i32, i32), usize> = HashMap::new();
        let mut nodes: Vec<LatNode> = Vec::new();
        let mut bp_node = vec![usize::MAX; bpt.len()];
        for (idx, e) in bpt.iter() {
            if !e.valid {
                continue;
            }
            let node = *key_to_node.entry((e.wid, e.start_frame)).or_insert_with(|| {
                nodes.push(LatNode {
                    wid: e.wid,
                    sf: e.start_frame,
                    fef: e.frame,
                    lef: e.frame,
                });
                nodes.len() - 1
            });
            nodes[node].fef = nodes[node].fef.min(e.frame);
            nodes[node].lef = nodes[node].lef.max(e.frame);
            bp_node[idx as usize] = node;
        }

        let chain = bpt.backtrace(final_bp);
        let start = bp_node[chain.first().copied().unwrap_or(final_bp) as usize];
        let end = bp_node[final_bp as usize];
        let start_score = bpt.get(chain[0]).ascr + bpt.get(chain[0]).lscr;

        // Persistence filter.
        let eff_min_endfr = if n_frames <= min_endfr { 0 } else { min_endfr };
        let keep: Vec<bool> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| i == start || i == end || n.lef - n.fef + 1 >= eff_min_endfr)
            .collect();
        let dropped = keep.iter().filter(|&&k| !k).count();
        if dropped > 0 {
            debug!("{} lattice nodes below the persistence threshold", dropped);
        }

        // Edges from each BP's predecessor node, deduplicated on the node
        // pair keeping the best acoustic score.
        let mut edge_map: HashMap<(usize, usize), LatEdge> = HashMap::new();
        for (idx, e) in bpt.iter() {
            if !e.valid || e.prev == NO_BP {
                continue;
            }
            let from = bp_node[e.prev as usize];
            let to = bp_node[idx as usize];
            if from == usize::MAX || to == usize::MAX || !keep[from] || !keep[to] {
                continue;
            }
            let edge = LatEdge {
                from,
                to,
                ascr: e.ascr,
                lscr: e.lscr,
            };
            edge_map
                .entry((from, to))
                .and_modify(|old| {
                    if old.ascr < edge.ascr {
                        *old = edge;
                    }
                })
                .or_insert(edge);
        }
        let mut edges: Vec<LatEdge> = edge_map.into_values().collect();
        edges.sort_by_key(|e| (e.from, e.to));

        let mut lat = Self {
            out_adj: vec![Vec::new(); nodes.len()],
            in_adj: vec![Vec::new(); nodes.len()],
            nodes,
            edges,
            start,
            end,
            start_score,
            n_frames,
        };
        lat.rebuild_adjacency();
        info!(
            "Lattice: {} nodes, {} edges over {} frames",
            lat.nodes.len(),
            lat.edges.len(),
            n_frames
        );
        Some(lat)
    }

    fn rebuild_adjacency(&mut self) {
        for adj in self.out_adj.iter_mut() {
            adj.clear();
        }
        for adj in self.in_adj.iter_mut() {
            adj.clear();
        }
        for (i, e) in self.edges.iter().enumerate() {
            self.out_adj[e.from].push(i);
            self.in_adj[e.to].push(i);
        }
    }

    pub fn n_frames(&self) -> i32 {
        self.n_frames
    }

    /// Node indices ordered by start frame; edges always run forward in
    /// time, so this is a topological order.
    fn topo_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.nodes.len()).collect();
        order.sort_by_key(|&i| (self.nodes[i].sf, self.nodes[i].fef));
        order
    }

    fn edge_weight(&self, e: &LatEdge, lw_ratio: f32) -> i64 {
        e.ascr as i64 + (e.lscr as f64 * lw_ratio as f64) as i64
    }

    /// Best path from start to end with the language scores rescaled by
    /// `lw_ratio` (`bestpathlw / lw`). Returns node indices and the path
    /// score. Plain DP over the topological order; all weights are
    /// non-positive logs so this is the Dijkstra result.
    pub fn bestpath(&self, lw_ratio: f32) -> Option<(Vec<usize>, i32)> {
        let order = self.topo_order();
        let mut score = vec![i64::MIN; self.nodes.len()];
        let mut pred: Vec<Option<usize>> = vec![None; self.nodes.len()];
        score[self.start] = self.start_score as i64;
        for &n in &order {
            if score[n] == i64::MIN {
                continue;
            }
            for &ei in &self.out_adj[n] {
                let e = &self.edges[ei];
                let cand = score[n] + self.edge_weight(e, lw_ratio);
                if cand > score[e.to] {
                    score[e.to] = cand;
                    pred[e.to] = Some(n);
                }
            }
        }
        if score[self.end] == i64::MIN {
            return None;
        }
        let mut path = vec![self.end];
        while let Some(p) = pred[*path.last().unwrap()] {
            path.push(p);
        }
        path.reverse();
        if path[0] != self.start {
            return None;
        }
        Some((path, score[self.end].clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32))
    }

    /// Forward and backward probability over the DAG, plus the total; the
    /// substrate for posteriors.
    fn alpha_beta(&self, lmath: &LogMath) -> (Vec<i32>, Vec<i32>, i32) {
        let order = self.topo_order();
        let mut alpha = vec![WORST_SCORE; self.nodes.len()];
        alpha[self.start] = self.start_score;
        for &n in &order {
            if alpha[n] <= WORST_SCORE {
                continue;
            }
            for &ei in &self.out_adj[n] {
                let e = &self.edges[ei];
                let cand = alpha[n].saturating_add(e.ascr + e.lscr).max(WORST_SCORE);
                alpha[e.to] = lmath.add(alpha[e.to], cand);
            }
        }
        let mut beta = vec![WORST_SCORE; self.nodes.len()];
        beta[self.end] = 0;
        for &n in order.iter().rev() {
            if beta[n] <= WORST_SCORE {
                continue;
            }
            for &ei in &self.in_adj[n] {
                let e = &self.edges[ei];
                let cand = beta[n].saturating_add(e.ascr + e.lscr).max(WORST_SCORE);
                beta[e.from] = lmath.add(beta[e.from], cand);
            }
        }
        let z = alpha[self.end];
        (alpha, beta, z)
    }

    /// Log posterior per node (`α+β−Z`); zero means certain.
    pub fn node_posteriors(&self, lmath: &LogMath) -> Vec<i32> {
        let (alpha, beta, z) = self.alpha_beta(lmath);
        if z <= WORST_SCORE {
            return vec![0; self.nodes.len()];
        }
        alpha
            .iter()
            .zip(beta.iter())
            .map(|(&a, &b)| {
                if a <= WORST_SCORE || b <= WORST_SCORE {
                    WORST_SCORE
                } else {
                    (a.saturating_add(b).saturating_sub(z)).min(0)
                }
            })
            .collect()
    }

    /// Forward/backward over the lattice; drops edges whose posterior falls
    /// more than `beam` below the total. Returns how many edges were cut.
    pub fn posterior_prune(&mut self, beam: i32, lmath: &LogMath) -> usize {
        let (alpha, beta, z) = self.alpha_beta(lmath);
        if z <= WORST_SCORE {
            return 0;
        }
        let before = self.edges.len();
        let keep: Vec<LatEdge> = self
            .edges
            .iter()
            .filter(|e| {
                let post = alpha[e.from]
                    .saturating_add(e.ascr + e.lscr)
                    .saturating_add(beta[e.to])
                    .saturating_sub(z);
                post >= beam
            })
            .copied()
            .collect();
        self.edges = keep;
        self.rebuild_adjacency();
        let cut = before - self.edges.len();
        if cut > 0 {
            debug!("Posterior pruning cut {} lattice edges", cut);
        }
        cut
    }

    /// A* N-best: partial paths expand in order of actual score plus the
    /// exact best completion, so paths pop in score order.
    pub fn nbest(&self, n: usize, lw_ratio: f32) -> Vec<(Vec<usize>, i32)> {
        if n == 0 {
            return Vec::new();
        }
        // Exact heuristic: best score from each node to the end.
        let order = self.topo_order();
        let mut to_end = vec![i64::MIN; self.nodes.len()];
        to_end[self.end] = 0;
        for &node in order.iter().rev() {
            for &ei in &self.out_adj[node] {
                let e = &self.edges[ei];
                if to_end[e.to] == i64::MIN {
                    continue;
                }
                let cand = to_end[e.to] + self.edge_weight(e, lw_ratio);
                if cand > to_end[node] {
                    to_end[node] = cand;
                }
            }
        }
        if to_end[self.start] == i64::MIN {
            return Vec::new();
        }

        struct Partial {
            est: i64,
            score: i64,
            path: Vec<usize>,
        }
        impl PartialEq for Partial {
            fn eq(&self, other: &Self) -> bool {
                self.est == other.est
            }
        }
        impl Eq for Partial {}
        impl PartialOrd for Partial {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }
        impl Ord for Partial {
            fn cmp(&self, other: &Self) -> Ordering {
                self.est.cmp(&other.est)
            }
        }

        let mut heap = BinaryHeap::new();
        heap.push(Partial {
            est: self.start_score as i64 + to_end[self.start],
            score: self.start_score as i64,
            path: vec![self.start],
        });
        let mut out = Vec::new();
        while let Some(p) = heap.pop() {
            let at = *p.path.last().unwrap();
            if at == self.end {
                out.push((
                    p.path.clone(),
                    p.score.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32,
                ));
                if out.len() >= n {
                    break;
                }
                continue;
            }
            for &ei in &self.out_adj[at] {
                let e = &self.edges[ei];
                if to_end[e.to] == i64::MIN {
                    continue;
                }
                let score = p.score + self.edge_weight(e, lw_ratio);
                let mut path = p.path.clone();
                path.push(e.to);
                heap.push(Partial {
                    est: score + to_end[e.to],
                    score,
                    path,
                });
            }
        }
        out
    }

    /// Text dump in the Sphinx node/edge format.
    pub fn write(&self, mut w: impl Write, word_str: impl Fn(i32) -> String) -> crate::error::Result<()> {
        writeln!(w, "# Generated by xd-stt")?;
        writeln!(w, "Frames {}", self.n_frames)?;
        writeln!(w, "#")?;
        writeln!(w, "Nodes {} (NODEID WORD STARTFRAME FIRST-ENDFRAME LAST-ENDFRAME)", self.nodes.len())?;
        for (i, n) in self.nodes.iter().enumerate() {
            writeln!(
                w,
                "{} {} {} {} {}",
                i,
                word_str(n.wid),
                n.sf,
                n.fef,
                n.lef
            )?;
        }
        writeln!(w, "#")?;
        writeln!(w, "Initial {}", self.start)?;
        writeln!(w, "Final {}", self.end)?;
        writeln!(w, "#")?;
        writeln!(w, "Edges (FROM-NODEID TO-NODEID ASCORE)")?;
        for e in &self.edges {
            writeln!(w, "{} {} {}", e.from, e.to, e.ascr)?;
        }
        writeln!(w, "End")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::bptable::BpTable;
    use crate::search::hmm::NO_BP;

    /// Two competing middle words between a shared start and end:
    /// start(w1) -> w2|w3 -> w4(end), with w2 the better path.
    fn diamond() -> (BpTable, i32) {
        let mut bpt = BpTable::default();
        let a = bpt.enter(9, 1, -100, -100, 0, NO_BP);
        let b = bpt.enter(19, 2, -250, -130, -20, a);
        let c = bpt.enter(19, 3, -300, -170, -30, a);
        bpt.enter(29, 4, -400, -120, -30, b);
        bpt.enter(29, 4, -460, -125, -35, c);
        // A later, better end for the same (word, start) node.
        bpt.enter(30, 4, -390, -110, -30, b);
        (bpt, 31)
    }

    #[test]
    fn nodes_merge_and_edges_dedup() {
        let (bpt, n_frames) = diamond();
        let lat = Lattice::from_bptable(&bpt, n_frames, 0).unwrap();
        // w4 from both ends merges into one node with an end-frame range.
        assert_eq!(lat.nodes.len(), 4);
        let w4 = lat.nodes.iter().find(|n| n.wid == 4).unwrap();
        assert_eq!((w4.fef, w4.lef), (29, 30));
        // Edges: a->b, a->c, b->4, c->4.
        assert_eq!(lat.edges.len(), 4);
        // The duplicate b->4 edge kept the better acoustic score.
        let e = lat
            .edges
            .iter()
            .find(|e| lat.nodes[e.from].wid == 2 && lat.nodes[e.to].wid == 4)
            .unwrap();
        assert_eq!(e.ascr, -110);
    }

    #[test]
    fn bestpath_prefers_the_better_branch() {
        let (bpt, n_frames) = diamond();
        let lat = Lattice::from_bptable(&bpt, n_frames, 0).unwrap();
        let (path, score) = lat.bestpath(1.0).unwrap();
        let words: Vec<i32> = path.iter().map(|&i| lat.nodes[i].wid).collect();
        assert_eq!(words, vec![1, 2, 4]);
        assert_eq!(score, -100 + (-130 - 20) + (-110 - 30));
    }

    #[test]
    fn nbest_orders_paths() {
        let (bpt, n_frames) = diamond();
        let lat = Lattice::from_bptable(&bpt, n_frames, 0).unwrap();
        let paths = lat.nbest(5, 1.0);
        assert_eq!(paths.len(), 2);
        assert!(paths[0].1 >= paths[1].1);
        let first: Vec<i32> = paths[0].0.iter().map(|&i| lat.nodes[i].wid).collect();
        assert_eq!(first, vec![1, 2, 4]);
        let second: Vec<i32> = paths[1].0.iter().map(|&i| lat.nodes[i].wid).collect();
        assert_eq!(second, vec![1, 3, 4]);
    }

    #[test]
    fn posterior_prune_keeps_the_best_path() {
        let (bpt, n_frames) = diamond();
        let mut lat = Lattice::from_bptable(&bpt, n_frames, 0).unwrap();
        let lmath = LogMath::shared_default();
        // A tight beam cuts the weak branch but the best path survives.
        let cut = lat.posterior_prune(-10, &lmath);
        assert!(cut >= 1);
        assert!(lat.bestpath(1.0).is_some());
        let (path, _) = lat.bestpath(1.0).unwrap();
        let words: Vec<i32> = path.iter().map(|&i| lat.nodes[i].wid).collect();
        assert_eq!(words, vec![1, 2, 4]);
    }

    #[test]
    fn short_utterances_keep_their_nodes() {
        let mut bpt = BpTable::default();
        let a = bpt.enter(1, 1, -10, -10, 0, NO_BP);
        bpt.enter(3, 2, -30, -15, -5, a);
        // min_endfr larger than the utterance; nothing should be dropped.
        let lat = Lattice::from_bptable(&bpt, 4, 50).unwrap();
        assert_eq!(lat.nodes.len(), 2);
        assert!(lat.bestpath(1.0).is_some());
    }

    #[test]
    fn empty_table_gives_no_lattice() {
        let bpt = BpTable::default();
        assert!(Lattice::from_bptable(&bpt, 0, 0).is_none());
    }

    #[test]
    fn text_dump_has_nodes_and_edges() {
        let (bpt, n_frames) = diamond();
        let lat = Lattice::from_bptable(&bpt, n_frames, 0).unwrap();
        let mut out = Vec::new();
        lat.write(&mut out, |wid| format!("w{}", wid)).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Frames 31"));
        assert!(text.contains("w2"));
        assert!(text.contains("End"));
    }
}
