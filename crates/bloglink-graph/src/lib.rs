//! In-memory analytics over a snapshot of the site/link relation.
//!
//! The graph is an arena: nodes live in a `Vec` addressed by [`NodeIx`], and a
//! side index maps site ids to positions. Edges are directed, kind-agnostic,
//! and parallel edges collapse into one.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use bloglink_core::SiteId;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;
use thiserror::Error;

pub const CRATE_NAME: &str = "bloglink-graph";

/// Seed used when the caller does not pick one.
pub const DEFAULT_SEED: u64 = 42;

pub type NodeIx = usize;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphError {
    #[error("sample fraction must be in (0, 1], got {0}")]
    InvalidFraction(f64),
}

#[derive(Debug, Clone, Default)]
pub struct LinkGraph {
    nodes: Vec<SiteId>,
    index: HashMap<SiteId, NodeIx>,
    outbound: Vec<Vec<NodeIx>>,
    inbound: Vec<Vec<NodeIx>>,
    edges: HashSet<(NodeIx, NodeIx)>,
}

impl LinkGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from node ids and (source, target) pairs. Nodes are laid out in
    /// ascending id order so results do not depend on input order; edge
    /// endpoints missing from `sites` are added as nodes.
    pub fn from_relation(
        sites: impl IntoIterator<Item = SiteId>,
        edges: impl IntoIterator<Item = (SiteId, SiteId)>,
    ) -> Self {
        let mut graph = Self::new();
        let edges: Vec<(SiteId, SiteId)> = edges.into_iter().collect();
        let ids: BTreeSet<SiteId> = sites
            .into_iter()
            .chain(edges.iter().flat_map(|&(s, t)| [s, t]))
            .collect();
        for id in ids {
            graph.add_node(id);
        }
        for (source, target) in edges {
            graph.add_edge(source, target);
        }
        graph
    }

    pub fn add_node(&mut self, id: SiteId) -> NodeIx {
        if let Some(&ix) = self.index.get(&id) {
            return ix;
        }
        let ix = self.nodes.len();
        self.nodes.push(id);
        self.outbound.push(Vec::new());
        self.inbound.push(Vec::new());
        self.index.insert(id, ix);
        ix
    }

    /// Returns `false` for self-loops and for edges already present.
    pub fn add_edge(&mut self, source: SiteId, target: SiteId) -> bool {
        if source == target {
            return false;
        }
        let s = self.add_node(source);
        let t = self.add_node(target);
        if !self.edges.insert((s, t)) {
            return false;
        }
        self.outbound[s].push(t);
        self.inbound[t].push(s);
        true
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn site_id(&self, ix: NodeIx) -> Option<SiteId> {
        self.nodes.get(ix).copied()
    }

    pub fn index_of(&self, id: SiteId) -> Option<NodeIx> {
        self.index.get(&id).copied()
    }

    pub fn successors(&self, ix: NodeIx) -> &[NodeIx] {
        self.outbound.get(ix).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn predecessors(&self, ix: NodeIx) -> &[NodeIx] {
        self.inbound.get(ix).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Hop count from `source` to every node; `None` where unreachable.
    pub fn bfs_distances(&self, source: NodeIx) -> Vec<Option<u32>> {
        let mut dist = vec![None; self.nodes.len()];
        if source >= self.nodes.len() {
            return dist;
        }
        dist[source] = Some(0);
        let mut queue = VecDeque::from([source]);
        while let Some(node) = queue.pop_front() {
            let next = dist[node].unwrap_or(0) + 1;
            for &succ in &self.outbound[node] {
                if dist[succ].is_none() {
                    dist[succ] = Some(next);
                    queue.push_back(succ);
                }
            }
        }
        dist
    }

    fn undirected_neighbors(&self) -> Vec<BTreeSet<NodeIx>> {
        (0..self.nodes.len())
            .map(|ix| {
                self.outbound[ix]
                    .iter()
                    .chain(self.inbound[ix].iter())
                    .copied()
                    .collect()
            })
            .collect()
    }
}

/// Which BFS sources to use.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleSize {
    All,
    /// `ceil(fraction * n)` sources.
    Fraction(f64),
    Count(usize),
}

/// Pick BFS sources reproducibly: the same graph, size and seed always yield
/// the same sorted index list.
pub fn sample_sources(
    graph: &LinkGraph,
    size: SampleSize,
    seed: u64,
) -> Result<Vec<NodeIx>, GraphError> {
    let n = graph.node_count();
    let take = match size {
        SampleSize::All => n,
        SampleSize::Fraction(f) if f > 0.0 && f <= 1.0 => ((f * n as f64).ceil() as usize).min(n),
        SampleSize::Fraction(f) => return Err(GraphError::InvalidFraction(f)),
        SampleSize::Count(c) => c.min(n),
    };
    let mut all: Vec<NodeIx> = (0..n).collect();
    if take >= n {
        return Ok(all);
    }
    let mut rng = StdRng::seed_from_u64(seed);
    all.shuffle(&mut rng);
    all.truncate(take);
    all.sort_unstable();
    Ok(all)
}

/// Ordered (source, target) pair counts per shortest-path length, plus the
/// pairs with no path at all.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PathHistogram {
    pub by_length: BTreeMap<u32, u64>,
    pub unreachable: u64,
    pub sources: usize,
}

impl PathHistogram {
    pub fn count(&self, length: u32) -> u64 {
        self.by_length.get(&length).copied().unwrap_or(0)
    }

    pub fn reachable_pairs(&self) -> u64 {
        self.by_length.values().sum()
    }

    pub fn total_pairs(&self) -> u64 {
        self.reachable_pairs() + self.unreachable
    }

    pub fn connectivity_ratio(&self) -> f64 {
        match self.total_pairs() {
            0 => 0.0,
            total => self.reachable_pairs() as f64 / total as f64,
        }
    }

    pub fn mean_length(&self) -> Option<f64> {
        let reachable = self.reachable_pairs();
        if reachable == 0 {
            return None;
        }
        let weighted: u64 = self
            .by_length
            .iter()
            .map(|(&len, &count)| u64::from(len) * count)
            .sum();
        Some(weighted as f64 / reachable as f64)
    }

    pub fn max_length(&self) -> Option<u32> {
        self.by_length.keys().next_back().copied()
    }
}

pub fn path_length_histogram(graph: &LinkGraph, sources: &[NodeIx]) -> PathHistogram {
    let mut histogram = PathHistogram::default();
    for &source in sources {
        if source >= graph.node_count() {
            continue;
        }
        histogram.sources += 1;
        for (target, dist) in graph.bfs_distances(source).into_iter().enumerate() {
            if target == source {
                continue;
            }
            match dist {
                Some(len) => *histogram.by_length.entry(len).or_default() += 1,
                None => histogram.unreachable += 1,
            }
        }
    }
    histogram
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NetworkProperties {
    pub nodes: usize,
    pub edges: usize,
    pub average_degree: f64,
    pub max_in_degree: usize,
    pub max_out_degree: usize,
    pub isolated_nodes: usize,
    pub density: f64,
    pub weak_components: usize,
    pub largest_component: usize,
}

pub fn network_properties(graph: &LinkGraph) -> NetworkProperties {
    let n = graph.node_count();
    let e = graph.edge_count();
    let components = weak_component_sizes(graph);
    NetworkProperties {
        nodes: n,
        edges: e,
        average_degree: if n == 0 { 0.0 } else { e as f64 / n as f64 },
        max_in_degree: graph.inbound.iter().map(Vec::len).max().unwrap_or(0),
        max_out_degree: graph.outbound.iter().map(Vec::len).max().unwrap_or(0),
        isolated_nodes: (0..n)
            .filter(|&ix| graph.outbound[ix].is_empty() && graph.inbound[ix].is_empty())
            .count(),
        density: if n < 2 {
            0.0
        } else {
            e as f64 / (n as f64 * (n as f64 - 1.0))
        },
        weak_components: components.len(),
        largest_component: components.iter().copied().max().unwrap_or(0),
    }
}

fn find(parent: &mut [usize], mut x: usize) -> usize {
    while parent[x] != x {
        parent[x] = parent[parent[x]];
        x = parent[x];
    }
    x
}

/// Sizes of the weakly connected components, largest first.
pub fn weak_component_sizes(graph: &LinkGraph) -> Vec<usize> {
    let n = graph.node_count();
    let mut parent: Vec<usize> = (0..n).collect();
    for &(s, t) in &graph.edges {
        let (a, b) = (find(&mut parent, s), find(&mut parent, t));
        if a != b {
            parent[a.max(b)] = a.min(b);
        }
    }
    let mut sizes: HashMap<usize, usize> = HashMap::new();
    for ix in 0..n {
        *sizes.entry(find(&mut parent, ix)).or_default() += 1;
    }
    let mut sizes: Vec<usize> = sizes.into_values().collect();
    sizes.sort_unstable_by(|a, b| b.cmp(a));
    sizes
}

/// Clustering of the undirected simplification of the graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClusteringSummary {
    /// Mean local clustering coefficient; nodes with fewer than two neighbours count as 0.
    pub average_clustering: f64,
    /// 3 x triangles / connected triples.
    pub transitivity: f64,
    pub triangles: u64,
}

pub fn clustering(graph: &LinkGraph) -> ClusteringSummary {
    let neighbors = graph.undirected_neighbors();
    let n = neighbors.len();
    if n == 0 {
        return ClusteringSummary::default();
    }

    let mut local_sum = 0.0;
    let mut closed = 0u64;
    let mut triples = 0u64;
    for nbrs in &neighbors {
        let k = nbrs.len() as u64;
        if k < 2 {
            continue;
        }
        let members: Vec<NodeIx> = nbrs.iter().copied().collect();
        let mut links = 0u64;
        for (i, &u) in members.iter().enumerate() {
            for &w in &members[i + 1..] {
                if neighbors[u].contains(&w) {
                    links += 1;
                }
            }
        }
        let pairs = k * (k - 1) / 2;
        local_sum += links as f64 / pairs as f64;
        closed += links;
        triples += pairs;
    }

    ClusteringSummary {
        average_clustering: local_sum / n as f64,
        transitivity: if triples == 0 {
            0.0
        } else {
            closed as f64 / triples as f64
        },
        triangles: closed / 3,
    }
}
