//! Rate graph construction and path finding.
//!
//! A graph is built fresh from one provider batch (or merged from several)
//! and then queried. Nothing here performs I/O or keeps state between calls.
//!
//! Path search maximizes the product of edge rates. Taking `-ln(rate)` as
//! the edge weight turns that product into a sum, so the best conversion is
//! the shortest path under that weight.

use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet, VecDeque};

use ratemesh_common::{now, CurrencyCode, Timestamp};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Default hop budget for path searches.
pub const DEFAULT_MAX_HOPS: usize = 5;

/// Default number of alternative paths returned by [`find_all_paths`].
pub const DEFAULT_MAX_PATHS: usize = 10;

/// Number of start nodes sampled by the connectivity check.
const CONNECTIVITY_SAMPLE: usize = 5;

/// Cost comparisons closer than this are treated as ties.
const COST_EPSILON: f64 = 1e-12;

/// A directed, quoted conversion from one currency to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateEdge {
    pub from: CurrencyCode,
    pub to: CurrencyCode,
    /// Units of `to` per unit of `from`. Always positive.
    pub rate: f64,
    pub provider_id: String,
    pub observed_at: Timestamp,
}

/// Weighted directed graph of currencies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateGraph {
    pub nodes: BTreeSet<CurrencyCode>,
    pub edges: HashMap<CurrencyCode, HashMap<CurrencyCode, RateEdge>>,
}

impl RateGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an edge, registering both endpoints as nodes.
    pub fn insert_edge(&mut self, edge: RateEdge) {
        self.nodes.insert(edge.from.clone());
        self.nodes.insert(edge.to.clone());
        self.edges
            .entry(edge.from.clone())
            .or_default()
            .insert(edge.to.clone(), edge);
    }

    /// Look up the edge `from -> to`.
    pub fn edge(&self, from: &CurrencyCode, to: &CurrencyCode) -> Option<&RateEdge> {
        self.edges.get(from).and_then(|out| out.get(to))
    }

    /// Outgoing edges of a node.
    pub fn neighbors<'a>(&'a self, from: &CurrencyCode) -> impl Iterator<Item = &'a RateEdge> + 'a {
        self.edges.get(from).into_iter().flat_map(|out| out.values())
    }

    pub fn contains(&self, code: &CurrencyCode) -> bool {
        self.nodes.contains(code)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// A conversion path through the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathResult {
    pub path: Vec<CurrencyCode>,
    /// Product of the rates in `edges_used`.
    pub total_rate: f64,
    /// Number of edges, `path.len() - 1`.
    pub hops: usize,
    pub edges_used: Vec<RateEdge>,
}

impl PathResult {
    /// The zero-hop path from a currency to itself.
    pub fn identity(code: &CurrencyCode) -> Self {
        Self {
            path: vec![code.clone()],
            total_rate: 1.0,
            hops: 0,
            edges_used: Vec::new(),
        }
    }

    fn from_edges(edges: Vec<RateEdge>) -> Option<Self> {
        let first = edges.first()?;
        let mut path = Vec::with_capacity(edges.len() + 1);
        path.push(first.from.clone());
        path.extend(edges.iter().map(|e| e.to.clone()));

        Some(Self {
            total_rate: edges.iter().map(|e| e.rate).product(),
            hops: edges.len(),
            path,
            edges_used: edges,
        })
    }

    /// Whether the rate was inferred through intermediate currencies.
    pub fn is_inferred(&self) -> bool {
        self.hops > 1
    }
}

/// Build a graph from one provider batch quoted against `base`.
///
/// Every `(target, rate)` produces `base -> target` and its inverse
/// `target -> base`. Non-positive or non-finite rates are skipped.
pub fn build_graph(
    rates: &HashMap<CurrencyCode, f64>,
    base: &CurrencyCode,
    provider_id: &str,
) -> RateGraph {
    build_graph_at(rates, base, provider_id, now())
}

/// [`build_graph`] with an explicit observation timestamp.
pub fn build_graph_at(
    rates: &HashMap<CurrencyCode, f64>,
    base: &CurrencyCode,
    provider_id: &str,
    observed_at: Timestamp,
) -> RateGraph {
    let mut graph = RateGraph::new();
    graph.nodes.insert(base.clone());

    for (target, &rate) in rates {
        if target == base || !is_usable_rate(rate) {
            debug!(base = %base, target = %target, rate, "Skipping unusable rate");
            continue;
        }

        graph.insert_edge(RateEdge {
            from: base.clone(),
            to: target.clone(),
            rate,
            provider_id: provider_id.to_string(),
            observed_at,
        });
        graph.insert_edge(RateEdge {
            from: target.clone(),
            to: base.clone(),
            rate: 1.0 / rate,
            provider_id: provider_id.to_string(),
            observed_at,
        });
    }

    graph
}

/// Whether a quoted rate can become an edge.
pub fn is_usable_rate(rate: f64) -> bool {
    rate.is_finite() && rate > 0.0
}

/// Union of several graphs. For duplicate edges the most recently observed
/// one wins; on equal timestamps the edge seen first is kept.
pub fn merge_graphs(graphs: impl IntoIterator<Item = RateGraph>) -> RateGraph {
    let mut merged = RateGraph::new();

    for graph in graphs {
        merged.nodes.extend(graph.nodes);

        for (from, out) in graph.edges {
            let merged_out = merged.edges.entry(from).or_default();
            for (to, edge) in out {
                match merged_out.get(&to) {
                    Some(existing) if existing.observed_at >= edge.observed_at => {}
                    _ => {
                        merged_out.insert(to, edge);
                    }
                }
            }
        }
    }

    merged
}

/// Current currency plus every currency visited on the way there.
type VisitKey = (CurrencyCode, BTreeSet<CurrencyCode>);

fn visit_key(node: &CurrencyCode, path: &[CurrencyCode]) -> VisitKey {
    (node.clone(), path.iter().cloned().collect())
}

/// Frontier entry for the best-path search.
#[derive(Debug)]
struct SearchState {
    cost: f64,
    path: Vec<CurrencyCode>,
}

impl SearchState {
    fn hops(&self) -> usize {
        self.path.len() - 1
    }
}

impl PartialEq for SearchState {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SearchState {}

impl PartialOrd for SearchState {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SearchState {
    // Reversed so the max-heap pops the cheapest, then shortest, state first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .cost
            .total_cmp(&self.cost)
            .then_with(|| other.path.len().cmp(&self.path.len()))
    }
}

/// Find the path with the highest total rate from `from` to `to` using at
/// most `max_hops` edges.
///
/// Runs Dijkstra with weight `-ln(rate)` over states keyed by the current
/// currency and the set of currencies already visited. Two prefixes only
/// compete when they would allow exactly the same continuations, so a
/// cheaper prefix never hides a worse one that can still reach `to`.
/// Because weights may be negative (any rate above 1), a state is re-opened
/// whenever a cheaper cost reaches it, and the search runs until the
/// frontier is empty. States at the hop bound are never expanded. Paths do
/// not revisit a currency. Among equally good paths the one with fewer hops
/// wins.
pub fn find_best_path(
    graph: &RateGraph,
    from: &CurrencyCode,
    to: &CurrencyCode,
    max_hops: usize,
) -> Option<PathResult> {
    if from == to {
        return Some(PathResult::identity(from));
    }
    if max_hops == 0 || !graph.contains(from) || !graph.contains(to) {
        return None;
    }

    let mut best_cost: HashMap<VisitKey, f64> = HashMap::new();
    let mut frontier = BinaryHeap::new();
    let mut found: Option<SearchState> = None;

    best_cost.insert(visit_key(from, std::slice::from_ref(from)), 0.0);
    frontier.push(SearchState {
        cost: 0.0,
        path: vec![from.clone()],
    });

    while let Some(state) = frontier.pop() {
        let hops = state.hops();
        let Some(node) = state.path.last() else {
            continue;
        };

        if node == to {
            let better = match &found {
                None => true,
                Some(current) => {
                    state.cost < current.cost - COST_EPSILON
                        || ((state.cost - current.cost).abs() <= COST_EPSILON
                            && hops < current.hops())
                }
            };
            if better {
                found = Some(state);
            }
            continue;
        }

        if hops >= max_hops {
            continue;
        }

        if let Some(&recorded) = best_cost.get(&visit_key(node, &state.path)) {
            if state.cost > recorded + COST_EPSILON {
                continue;
            }
        }

        for edge in graph.neighbors(node) {
            if state.path.contains(&edge.to) {
                continue;
            }

            let cost = state.cost - edge.rate.ln();
            let mut path = state.path.clone();
            path.push(edge.to.clone());

            let key = visit_key(&edge.to, &path);
            let improves = best_cost
                .get(&key)
                .map_or(true, |&recorded| cost < recorded - COST_EPSILON);

            if improves {
                best_cost.insert(key, cost);
                frontier.push(SearchState { cost, path });
            }
        }
    }

    let found = found?;
    let edges = found
        .path
        .windows(2)
        .map(|pair| graph.edge(&pair[0], &pair[1]).cloned())
        .collect::<Option<Vec<_>>>()?;

    PathResult::from_edges(edges)
}

/// Enumerate up to `max_paths` simple paths of at most `max_hops` edges,
/// best total rate first.
///
/// The depth-first walk visits higher-rate edges first and stops once
/// `max_paths` paths have been collected.
pub fn find_all_paths(
    graph: &RateGraph,
    from: &CurrencyCode,
    to: &CurrencyCode,
    max_paths: usize,
    max_hops: usize,
) -> Vec<PathResult> {
    if max_paths == 0 {
        return Vec::new();
    }
    if from == to {
        return vec![PathResult::identity(from)];
    }
    if !graph.contains(from) || !graph.contains(to) {
        return Vec::new();
    }

    let mut walk = PathWalk {
        graph,
        to,
        max_hops,
        max_paths,
        visited: HashSet::from([from.clone()]),
        edges: Vec::new(),
        results: Vec::new(),
    };
    walk.descend(from);

    let mut results = walk.results;
    results.sort_by(|a, b| {
        b.total_rate
            .total_cmp(&a.total_rate)
            .then_with(|| a.hops.cmp(&b.hops))
    });
    results
}

struct PathWalk<'a> {
    graph: &'a RateGraph,
    to: &'a CurrencyCode,
    max_hops: usize,
    max_paths: usize,
    visited: HashSet<CurrencyCode>,
    edges: Vec<RateEdge>,
    results: Vec<PathResult>,
}

impl PathWalk<'_> {
    fn descend(&mut self, current: &CurrencyCode) {
        if self.results.len() >= self.max_paths {
            return;
        }
        if current == self.to {
            if let Some(found) = PathResult::from_edges(self.edges.clone()) {
                self.results.push(found);
            }
            return;
        }
        if self.edges.len() >= self.max_hops {
            return;
        }

        let mut candidates: Vec<RateEdge> = self
            .graph
            .neighbors(current)
            .filter(|e| !self.visited.contains(&e.to))
            .cloned()
            .collect();
        candidates.sort_by(|a, b| b.rate.total_cmp(&a.rate).then_with(|| a.to.cmp(&b.to)));

        for edge in candidates {
            let next = edge.to.clone();
            self.visited.insert(next.clone());
            self.edges.push(edge);

            self.descend(&next);

            self.edges.pop();
            self.visited.remove(&next);

            if self.results.len() >= self.max_paths {
                return;
            }
        }
    }
}

/// Summary of a graph's size and connectivity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphStats {
    pub node_count: usize,
    pub edge_count: usize,
    pub average_out_degree: f64,
    /// Approximate: every sampled start node reaches every other node.
    pub is_connected: bool,
}

/// Size and approximate connectivity of a graph.
pub fn graph_stats(graph: &RateGraph) -> GraphStats {
    let node_count = graph.node_count();
    let edge_count = graph.edge_count();

    let is_connected = node_count > 0
        && graph
            .nodes
            .iter()
            .take(CONNECTIVITY_SAMPLE)
            .all(|start| reachable_count(graph, start) == node_count);

    GraphStats {
        node_count,
        edge_count,
        average_out_degree: if node_count == 0 {
            0.0
        } else {
            edge_count as f64 / node_count as f64
        },
        is_connected,
    }
}

fn reachable_count(graph: &RateGraph, start: &CurrencyCode) -> usize {
    let mut seen: HashSet<&CurrencyCode> = HashSet::from([start]);
    let mut queue = VecDeque::from([start]);

    while let Some(node) = queue.pop_front() {
        for edge in graph.neighbors(node) {
            if seen.insert(&edge.to) {
                queue.push_back(&edge.to);
            }
        }
    }

    seen.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;

    fn code(s: &str) -> CurrencyCode {
        CurrencyCode::parse(s).unwrap()
    }

    fn rates(pairs: &[(&str, f64)]) -> HashMap<CurrencyCode, f64> {
        pairs.iter().map(|(c, r)| (code(c), *r)).collect()
    }

    fn usd_graph() -> RateGraph {
        build_graph(&rates(&[("EUR", 0.92), ("GBP", 0.79)]), &code("USD"), "test")
    }

    #[test]
    fn test_build_graph_adds_inverse_edges() {
        let graph = usd_graph();

        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.edge_count(), 4);

        let forward = graph.edge(&code("USD"), &code("EUR")).unwrap();
        let inverse = graph.edge(&code("EUR"), &code("USD")).unwrap();
        assert_eq!(forward.rate, 0.92);
        assert!((inverse.rate - 1.0 / 0.92).abs() < 1e-12);
        assert_eq!(inverse.provider_id, "test");
    }

    #[test]
    fn test_build_graph_skips_unusable_rates() {
        let graph = build_graph(
            &rates(&[("EUR", 0.0), ("GBP", -1.0), ("JPY", f64::NAN), ("USD", 1.0)]),
            &code("USD"),
            "test",
        );
        assert_eq!(graph.edge_count(), 0);
        assert_eq!(graph.node_count(), 1);
    }

    #[test]
    fn test_same_currency_is_identity() {
        let graph = usd_graph();
        let result = find_best_path(&graph, &code("EUR"), &code("EUR"), 5).unwrap();

        assert_eq!(result.path, vec![code("EUR")]);
        assert_eq!(result.total_rate, 1.0);
        assert_eq!(result.hops, 0);
        assert!(result.edges_used.is_empty());
    }

    #[test]
    fn test_cross_rate_through_base() {
        let graph = usd_graph();
        let result = find_best_path(&graph, &code("EUR"), &code("GBP"), 5).unwrap();

        assert_eq!(result.path, vec![code("EUR"), code("USD"), code("GBP")]);
        assert_eq!(result.hops, 2);
        assert!(result.is_inferred());
        assert!((result.total_rate - (1.0 / 0.92) * 0.79).abs() < 1e-9);
        assert!((result.total_rate - 0.8587).abs() < 1e-4);
    }

    #[test]
    fn test_direct_quote_is_one_hop() {
        let graph = usd_graph();
        let result = find_best_path(&graph, &code("USD"), &code("GBP"), 5).unwrap();
        assert_eq!(result.hops, 1);
        assert!(!result.is_inferred());
        assert_eq!(result.total_rate, 0.79);
    }

    #[test]
    fn test_hop_bound_is_respected() {
        let graph = usd_graph();
        assert!(find_best_path(&graph, &code("EUR"), &code("GBP"), 1).is_none());
        assert!(find_best_path(&graph, &code("EUR"), &code("GBP"), 0).is_none());
    }

    #[test]
    fn test_unknown_currency_has_no_path() {
        let graph = usd_graph();
        assert!(find_best_path(&graph, &code("EUR"), &code("CHF"), 5).is_none());
    }

    #[test]
    fn test_prefers_better_product_over_fewer_hops() {
        let t = now();
        let mut graph = RateGraph::new();
        let mut add = |from: &str, to: &str, rate: f64| {
            graph.insert_edge(RateEdge {
                from: code(from),
                to: code(to),
                rate,
                provider_id: "p".into(),
                observed_at: t,
            })
        };
        add("AAA", "BBB", 1.0);
        add("AAA", "CCC", 2.0);
        add("CCC", "BBB", 0.6);

        let result = find_best_path(&graph, &code("AAA"), &code("BBB"), 5).unwrap();
        assert_eq!(result.path, vec![code("AAA"), code("CCC"), code("BBB")]);
        assert!((result.total_rate - 1.2).abs() < 1e-12);

        let bounded = find_best_path(&graph, &code("AAA"), &code("BBB"), 1).unwrap();
        assert_eq!(bounded.hops, 1);
        assert_eq!(bounded.total_rate, 1.0);
    }

    #[test]
    fn test_worse_prefix_can_still_win() {
        let t = now();
        let mut graph = RateGraph::new();
        let mut add = |from: &str, to: &str, rate: f64| {
            graph.insert_edge(RateEdge {
                from: code(from),
                to: code(to),
                rate,
                provider_id: "p".into(),
                observed_at: t,
            })
        };
        add("AAA", "CCC", 10.0);
        add("CCC", "BBB", 1.0);
        add("AAA", "DDD", 1.0);
        add("DDD", "BBB", 9.0);
        add("BBB", "CCC", 5.0);
        add("CCC", "TTT", 1.0);

        let result = find_best_path(&graph, &code("AAA"), &code("TTT"), 5).unwrap();
        assert_eq!(
            result.path,
            vec![code("AAA"), code("DDD"), code("BBB"), code("CCC"), code("TTT")]
        );
        assert!((result.total_rate - 45.0).abs() < 1e-9);

        let all = find_all_paths(&graph, &code("AAA"), &code("TTT"), usize::MAX, 5);
        assert!((all[0].total_rate - result.total_rate).abs() < 1e-9);
    }

    #[test]
    fn test_merge_keeps_newest_edge() {
        let t0 = now();
        let g1 = build_graph_at(&rates(&[("EUR", 0.90)]), &code("USD"), "old", t0);
        let g2 = build_graph_at(
            &rates(&[("EUR", 0.93), ("JPY", 150.0)]),
            &code("USD"),
            "new",
            t0 + Duration::seconds(5),
        );
        let expected = g2.edge(&code("USD"), &code("EUR")).unwrap().clone();

        let merged = merge_graphs([g1.clone(), g2.clone()]);
        assert_eq!(merged.edge(&code("USD"), &code("EUR")).unwrap(), &expected);
        assert_eq!(merged.node_count(), 3);

        // Order of inputs does not matter.
        let reversed = merge_graphs([g2, g1]);
        assert_eq!(reversed.edge(&code("USD"), &code("EUR")).unwrap(), &expected);
    }

    #[test]
    fn test_find_all_paths_sorted_best_first() {
        let t = now();
        let g1 = build_graph_at(&rates(&[("EUR", 0.92), ("GBP", 0.79)]), &code("USD"), "a", t);
        let g2 = build_graph_at(&rates(&[("GBP", 0.86)]), &code("EUR"), "b", t);
        let graph = merge_graphs([g1, g2]);

        let paths = find_all_paths(&graph, &code("EUR"), &code("GBP"), 10, 5);
        assert_eq!(paths.len(), 2);
        assert!(paths[0].total_rate >= paths[1].total_rate);
        assert_eq!(paths[0].hops, 1);
        assert_eq!(paths[1].path, vec![code("EUR"), code("USD"), code("GBP")]);

        let limited = find_all_paths(&graph, &code("EUR"), &code("GBP"), 1, 5);
        assert_eq!(limited.len(), 1);

        let identity = find_all_paths(&graph, &code("EUR"), &code("EUR"), 10, 5);
        assert_eq!(identity, vec![PathResult::identity(&code("EUR"))]);
    }

    #[test]
    fn test_graph_stats() {
        let stats = graph_stats(&usd_graph());
        assert_eq!(stats.node_count, 3);
        assert_eq!(stats.edge_count, 4);
        assert!(stats.is_connected);

        let mut split = usd_graph();
        split.nodes.insert(code("XAU"));
        assert!(!graph_stats(&split).is_connected);

        assert!(!graph_stats(&RateGraph::new()).is_connected);
    }

    const CODES: &[&str] = &["EUR", "GBP", "JPY", "CHF", "CAD", "AUD", "BTC", "SEK"];

    fn arb_batch() -> impl Strategy<Value = HashMap<CurrencyCode, f64>> {
        prop::collection::vec(0.001f64..1000.0, CODES.len()).prop_flat_map(|values| {
            prop::sample::subsequence(CODES.to_vec(), 1..=CODES.len()).prop_map(move |picked| {
                picked
                    .into_iter()
                    .zip(values.iter().copied())
                    .map(|(c, r)| (code(c), r))
                    .collect()
            })
        })
    }

    proptest! {
        #[test]
        fn prop_every_edge_has_its_inverse(batch in arb_batch()) {
            let graph = build_graph(&batch, &code("USD"), "p");
            for out in graph.edges.values() {
                for edge in out.values() {
                    let back = graph.edge(&edge.to, &edge.from).unwrap();
                    prop_assert!((back.rate * edge.rate - 1.0).abs() < 1e-9);
                }
            }
        }

        #[test]
        fn prop_paths_are_consistent(batch in arb_batch(), max_hops in 0usize..4) {
            let graph = build_graph(&batch, &code("USD"), "p");
            let nodes: Vec<_> = graph.nodes.iter().cloned().collect();
            for from in &nodes {
                for to in &nodes {
                    if let Some(found) = find_best_path(&graph, from, to, max_hops) {
                        let product: f64 = found.edges_used.iter().map(|e| e.rate).product();
                        let tolerance = 1e-9 * product.abs().max(1.0);
                        prop_assert!((found.total_rate - product).abs() <= tolerance);
                        prop_assert_eq!(found.hops, found.path.len() - 1);
                        prop_assert!(found.hops <= max_hops || from == to);
                    }
                    for alt in find_all_paths(&graph, from, to, 10, max_hops) {
                        prop_assert!(alt.hops <= max_hops || from == to);
                        prop_assert_eq!(alt.hops, alt.path.len() - 1);
                    }
                }
            }
        }

        #[test]
        fn prop_best_path_matches_enumeration(
            usd in arb_batch(),
            eur in arb_batch(),
            max_hops in 1usize..4,
        ) {
            let t = now();
            let graph = merge_graphs([
                build_graph_at(&usd, &code("USD"), "a", t),
                build_graph_at(&eur, &code("EUR"), "b", t),
            ]);
            let nodes: Vec<_> = graph.nodes.iter().cloned().collect();
            for from in &nodes {
                for to in nodes.iter().filter(|to| *to != from) {
                    let best = find_best_path(&graph, from, to, max_hops);
                    let all = find_all_paths(&graph, from, to, usize::MAX, max_hops);
                    match (best, all.first()) {
                        (Some(best), Some(top)) => {
                            let tolerance = 1e-9 * top.total_rate.max(1.0);
                            prop_assert!((best.total_rate - top.total_rate).abs() <= tolerance);
                        }
                        (None, None) => {}
                        (best, top) => {
                            prop_assert!(false, "best {:?} vs enumerated {:?}", best, top)
                        }
                    }
                }
            }
        }

        #[test]
        fn prop_identity_for_present_nodes(batch in arb_batch()) {
            let graph = build_graph(&batch, &code("USD"), "p");
            for node in &graph.nodes {
                let found = find_best_path(&graph, node, node, DEFAULT_MAX_HOPS).unwrap();
                prop_assert_eq!(found.path, vec![node.clone()]);
                prop_assert_eq!(found.total_rate, 1.0);
                prop_assert_eq!(found.hops, 0);
            }
        }
    }
}
