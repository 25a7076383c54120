#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **kira-links** – The entity relationship graph.
//!
//! Links are directed edges between entity IDs, extracted from front-matter
//! arrays and from content patterns (`[[id]]` wiki links and `@id`
//! mentions). The graph keeps forward and backward adjacency so both
//! directions answer in O(1); bidirectional link types additionally
//! materialize a `backlink:<type>` inverse edge.
//!
//! The graph stores only ID strings; entities live elsewhere. That keeps the
//! graph cycle-free with respect to ownership and lets the Host API rebuild
//! it from the vault at startup.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::{Hash, Hasher};

use once_cell::sync::Lazy;
use regex::Regex;

use kira_types::Metadata;

//─────────────────────────────
//  Link types
//─────────────────────────────

/// Standard link types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkType {
    /// Symmetric association.
    RelatesTo,
    /// Source needs target done first.
    DependsOn,
    /// Source blocks target.
    Blocks,
    /// Hierarchy: source is a child of target.
    ChildOf,
    /// Composition: source is part of target.
    PartOf,
    /// Symmetric citation.
    References,
    /// `@id` mention in content.
    Mentions,
    /// `[[id]]` wiki link in content.
    LinksTo,
    /// Assignment edge.
    AssignedTo,
    /// Tag membership (`tag-<name>` pseudo-entities).
    TaggedWith,
    /// Temporal: source comes after target.
    Follows,
    /// Temporal: source comes before target.
    Precedes,
}

impl LinkType {
    /// Canonical snake_case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkType::RelatesTo => "relates_to",
            LinkType::DependsOn => "depends_on",
            LinkType::Blocks => "blocks",
            LinkType::ChildOf => "child_of",
            LinkType::PartOf => "part_of",
            LinkType::References => "references",
            LinkType::Mentions => "mentions",
            LinkType::LinksTo => "links_to",
            LinkType::AssignedTo => "assigned_to",
            LinkType::TaggedWith => "tagged_with",
            LinkType::Follows => "follows",
            LinkType::Precedes => "precedes",
        }
    }

    /// Whether this type materializes an inverse `backlink:<type>` edge.
    pub fn is_bidirectional(&self) -> bool {
        matches!(self, LinkType::RelatesTo | LinkType::References)
    }

    /// Front-matter fields that carry typed link arrays.
    pub const FRONTMATTER_FIELDS: [(&'static str, LinkType); 6] = [
        ("relates_to", LinkType::RelatesTo),
        ("depends_on", LinkType::DependsOn),
        ("blocks", LinkType::Blocks),
        ("child_of", LinkType::ChildOf),
        ("part_of", LinkType::PartOf),
        ("references", LinkType::References),
    ];
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//─────────────────────────────
//  Link edges
//─────────────────────────────

/// Directed edge between two entities.
///
/// Equality and hashing ignore `context`; an edge is identified by its
/// endpoints and type.
#[derive(Debug, Clone)]
pub struct Link {
    /// Edge origin.
    pub source_id: String,
    /// Edge target.
    pub target_id: String,
    /// Snake_case link type; `backlink:<type>` for materialized inverses.
    pub link_type: String,
    /// Optional provenance note (e.g. which field produced the edge).
    pub context: Option<String>,
}

impl Link {
    /// New edge with no context.
    pub fn new(
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        link_type: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            target_id: target_id.into(),
            link_type: link_type.into(),
            context: None,
        }
    }

    /// The materialized inverse of a bidirectional edge.
    pub fn reversed(&self) -> Link {
        Link {
            source_id: self.target_id.clone(),
            target_id: self.source_id.clone(),
            link_type: format!("backlink:{}", self.link_type),
            context: self.context.clone(),
        }
    }
}

impl PartialEq for Link {
    fn eq(&self, other: &Self) -> bool {
        self.source_id == other.source_id
            && self.target_id == other.target_id
            && self.link_type == other.link_type
    }
}

impl Eq for Link {}

impl Hash for Link {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.source_id.hash(state);
        self.target_id.hash(state);
        self.link_type.hash(state);
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} --{}--> {}", self.source_id, self.link_type, self.target_id)
    }
}

//─────────────────────────────
//  Extraction
//─────────────────────────────

static WIKI_LINK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[\[([a-z0-9][a-z0-9-]+)\]\]").unwrap());
static MENTION: Lazy<Regex> = Lazy::new(|| Regex::new(r"@([a-z0-9][a-z0-9-]+)").unwrap());

/// Typed outgoing links declared in front-matter: the six link fields plus
/// `tags` (as `tagged_with` edges to `tag-<name>` pseudo-entities).
pub fn extract_links_from_frontmatter(frontmatter: &Metadata) -> Vec<(LinkType, String)> {
    let mut links = Vec::new();

    for (field, link_type) in LinkType::FRONTMATTER_FIELDS {
        match frontmatter.get(field) {
            Some(serde_json::Value::String(target)) => {
                links.push((link_type, target.clone()));
            }
            Some(serde_json::Value::Array(targets)) => {
                for target in targets.iter().filter_map(serde_json::Value::as_str) {
                    links.push((link_type, target.to_string()));
                }
            }
            _ => {}
        }
    }

    if let Some(serde_json::Value::Array(tags)) = frontmatter.get("tags") {
        for tag in tags.iter().filter_map(serde_json::Value::as_str) {
            links.push((LinkType::TaggedWith, format!("tag-{tag}")));
        }
    }

    links
}

/// Outgoing links found in Markdown content: `[[id]]` and `@id` patterns.
pub fn extract_links_from_content(content: &str) -> Vec<(LinkType, String)> {
    let mut links = Vec::new();
    for caps in WIKI_LINK.captures_iter(content) {
        links.push((LinkType::LinksTo, caps[1].to_string()));
    }
    for caps in MENTION.captures_iter(content) {
        links.push((LinkType::Mentions, caps[1].to_string()));
    }
    links
}

//─────────────────────────────
//  Link graph
//─────────────────────────────

/// Forward and backward adjacency over live entities.
#[derive(Debug, Default)]
pub struct LinkGraph {
    forward: HashMap<String, HashSet<Link>>,
    backward: HashMap<String, HashSet<Link>>,
    entities: HashSet<String>,
}

impl LinkGraph {
    /// Empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity (it may have no edges yet).
    pub fn add_entity(&mut self, entity_id: impl Into<String>) {
        self.entities.insert(entity_id.into());
    }

    /// Entity IDs currently registered.
    pub fn entities(&self) -> &HashSet<String> {
        &self.entities
    }

    /// Remove an entity and every edge touching it. Returns the removed
    /// edges (inverse `backlink:` edges excluded).
    pub fn remove_entity(&mut self, entity_id: &str) -> Vec<Link> {
        let mut removed = Vec::new();

        let outgoing: Vec<Link> = self
            .forward
            .get(entity_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        for link in outgoing {
            if self.remove_link(&link.source_id, &link.target_id, &link.link_type) {
                removed.push(link);
            }
        }

        let incoming: Vec<Link> = self
            .backward
            .get(entity_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        for link in incoming {
            if self.remove_link(&link.source_id, &link.target_id, &link.link_type) {
                removed.push(link);
            }
        }

        self.forward.remove(entity_id);
        self.backward.remove(entity_id);
        self.entities.remove(entity_id);
        removed.retain(|l| !l.link_type.starts_with("backlink:"));
        removed
    }

    /// Add a directed edge. Self-links are dropped. Bidirectional types also
    /// materialize the inverse edge.
    pub fn add_link(&mut self, link: Link) {
        if link.source_id == link.target_id {
            return;
        }

        self.entities.insert(link.source_id.clone());
        self.entities.insert(link.target_id.clone());

        let bidirectional = LinkType::FRONTMATTER_FIELDS
            .iter()
            .find(|(name, _)| *name == link.link_type)
            .map(|(_, lt)| lt.is_bidirectional())
            .unwrap_or(false);

        if bidirectional {
            let inverse = link.reversed();
            self.forward
                .entry(inverse.source_id.clone())
                .or_default()
                .insert(inverse.clone());
            self.backward
                .entry(inverse.target_id.clone())
                .or_default()
                .insert(inverse);
        }

        self.forward
            .entry(link.source_id.clone())
            .or_default()
            .insert(link.clone());
        self.backward
            .entry(link.target_id.clone())
            .or_default()
            .insert(link);
    }

    /// Remove a specific edge (and its materialized inverse).
    pub fn remove_link(&mut self, source_id: &str, target_id: &str, link_type: &str) -> bool {
        let probe = Link::new(source_id, target_id, link_type);

        let forward_found = self
            .forward
            .get_mut(source_id)
            .is_some_and(|set| set.remove(&probe));
        let backward_found = self
            .backward
            .get_mut(target_id)
            .is_some_and(|set| set.remove(&probe));

        if !link_type.starts_with("backlink:") {
            let inverse = probe.reversed();
            if let Some(set) = self.forward.get_mut(target_id) {
                set.remove(&inverse);
            }
            if let Some(set) = self.backward.get_mut(source_id) {
                set.remove(&inverse);
            }
        }

        forward_found && backward_found
    }

    /// Outgoing edges from `entity_id`, optionally filtered by type, sorted
    /// by (type, target).
    pub fn outgoing(&self, entity_id: &str, link_type: Option<&str>) -> Vec<Link> {
        let mut links: Vec<Link> = self
            .forward
            .get(entity_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        if let Some(filter) = link_type {
            links.retain(|l| l.link_type == filter);
        }
        links.sort_by(|a, b| (&a.link_type, &a.target_id).cmp(&(&b.link_type, &b.target_id)));
        links
    }

    /// Incoming edges to `entity_id`, optionally filtered by type, sorted by
    /// (type, source).
    pub fn incoming(&self, entity_id: &str, link_type: Option<&str>) -> Vec<Link> {
        let mut links: Vec<Link> = self
            .backward
            .get(entity_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        if let Some(filter) = link_type {
            links.retain(|l| l.link_type == filter);
        }
        links.sort_by(|a, b| (&a.link_type, &a.source_id).cmp(&(&b.link_type, &b.source_id)));
        links
    }

    /// Entity IDs reachable within `max_depth` hops in either direction,
    /// excluding the starting entity.
    pub fn connected(&self, entity_id: &str, max_depth: usize) -> HashSet<String> {
        let mut connected = HashSet::new();
        let mut visited = HashSet::new();
        let mut queue: VecDeque<(String, usize)> = VecDeque::new();
        queue.push_back((entity_id.to_string(), 0));

        while let Some((current, depth)) = queue.pop_front() {
            if !visited.insert(current.clone()) {
                continue;
            }
            if depth > 0 {
                connected.insert(current.clone());
            }
            if depth < max_depth {
                for link in self.outgoing(&current, None) {
                    queue.push_back((link.target_id, depth + 1));
                }
                for link in self.incoming(&current, None) {
                    queue.push_back((link.source_id, depth + 1));
                }
            }
        }

        connected
    }

    /// Entities with no edges in either direction.
    pub fn find_orphans(&self) -> HashSet<String> {
        self.entities
            .iter()
            .filter(|id| {
                self.forward.get(*id).map_or(true, HashSet::is_empty)
                    && self.backward.get(*id).map_or(true, HashSet::is_empty)
            })
            .cloned()
            .collect()
    }

    /// Edges whose target is not in `known` (tag pseudo-entities excluded).
    pub fn find_broken(&self, known: &HashSet<String>) -> Vec<Link> {
        let mut broken: Vec<Link> = self
            .forward
            .values()
            .flatten()
            .filter(|link| {
                !link.target_id.starts_with("tag-") && !known.contains(&link.target_id)
            })
            .cloned()
            .collect();
        broken.sort_by(|a, b| {
            (&a.source_id, &a.target_id, &a.link_type)
                .cmp(&(&b.source_id, &b.target_id, &b.link_type))
        });
        broken
    }

    /// Cycles over edges of `link_type`, found by DFS with a recursion
    /// stack. Each cycle is reported as the path from the re-entered node
    /// back to itself.
    pub fn find_cycles(&self, link_type: &str) -> Vec<Vec<String>> {
        let mut cycles = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();

        let mut roots: Vec<&String> = self.entities.iter().collect();
        roots.sort_unstable();

        for root in roots {
            if visited.contains(root) {
                continue;
            }
            let mut rec_stack: HashSet<String> = HashSet::new();
            let mut path: Vec<String> = Vec::new();
            self.dfs_cycles(root, link_type, &mut visited, &mut rec_stack, &mut path, &mut cycles);
        }

        cycles
    }

    fn dfs_cycles(
        &self,
        node: &str,
        link_type: &str,
        visited: &mut HashSet<String>,
        rec_stack: &mut HashSet<String>,
        path: &mut Vec<String>,
        cycles: &mut Vec<Vec<String>>,
    ) -> bool {
        visited.insert(node.to_string());
        rec_stack.insert(node.to_string());
        path.push(node.to_string());

        for link in self.outgoing(node, Some(link_type)) {
            let target = &link.target_id;
            if !visited.contains(target) {
                if self.dfs_cycles(target, link_type, visited, rec_stack, path, cycles) {
                    return true;
                }
            } else if rec_stack.contains(target) {
                let start = path.iter().position(|n| n == target).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].to_vec();
                cycle.push(target.clone());
                cycles.push(cycle);
                return true;
            }
        }

        path.pop();
        rec_stack.remove(node);
        false
    }

    /// Edge and entity counts, per link type.
    pub fn stats(&self) -> GraphStats {
        let mut by_type: HashMap<String, usize> = HashMap::new();
        let mut total = 0usize;
        for links in self.forward.values() {
            for link in links {
                total += 1;
                *by_type.entry(link.link_type.clone()).or_insert(0) += 1;
            }
        }
        GraphStats {
            total_entities: self.entities.len(),
            total_links: total,
            links_by_type: by_type,
            orphaned_entities: self.find_orphans().len(),
        }
    }
}

/// Summary counters over the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphStats {
    /// Registered entities.
    pub total_entities: usize,
    /// Directed edges (materialized inverses included).
    pub total_links: usize,
    /// Edge count per link type.
    pub links_by_type: HashMap<String, usize>,
    /// Entities with no edges.
    pub orphaned_entities: usize,
}

/// Replace all outgoing edges of `entity_id` with those extracted from the
/// given front-matter and content.
pub fn update_entity_links(
    graph: &mut LinkGraph,
    entity_id: &str,
    frontmatter: &Metadata,
    content: &str,
) {
    for link in graph.outgoing(entity_id, None) {
        if !link.link_type.starts_with("backlink:") {
            graph.remove_link(&link.source_id, &link.target_id, &link.link_type);
        }
    }

    let mut extracted = extract_links_from_frontmatter(frontmatter);
    extracted.extend(extract_links_from_content(content));

    for (link_type, target) in extracted {
        let mut link = Link::new(entity_id, target, link_type.as_str());
        link.context = Some(link_type.as_str().to_string());
        graph.add_link(link);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(pairs: &[(&str, serde_json::Value)]) -> Metadata {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn frontmatter_extraction_covers_fields_and_tags() {
        let fm = meta(&[
            ("depends_on", json!(["task-1", "task-2"])),
            ("relates_to", json!("note-9")),
            ("tags", json!(["work"])),
        ]);
        let links = extract_links_from_frontmatter(&fm);
        assert!(links.contains(&(LinkType::DependsOn, "task-1".into())));
        assert!(links.contains(&(LinkType::DependsOn, "task-2".into())));
        assert!(links.contains(&(LinkType::RelatesTo, "note-9".into())));
        assert!(links.contains(&(LinkType::TaggedWith, "tag-work".into())));
    }

    #[test]
    fn content_extraction_finds_wiki_links_and_mentions() {
        let links = extract_links_from_content("See [[note-20250101-0900-plan]] and ask @contact-bob.");
        assert!(links.contains(&(LinkType::LinksTo, "note-20250101-0900-plan".into())));
        assert!(links.contains(&(LinkType::Mentions, "contact-bob".into())));
    }

    #[test]
    fn bidirectional_links_materialize_backlinks() {
        let mut graph = LinkGraph::new();
        graph.add_link(Link::new("a", "b", "relates_to"));

        let from_b = graph.outgoing("b", None);
        assert_eq!(from_b.len(), 1);
        assert_eq!(from_b[0].link_type, "backlink:relates_to");

        graph.remove_link("a", "b", "relates_to");
        assert!(graph.outgoing("b", None).is_empty());
        assert!(graph.incoming("a", None).is_empty());
    }

    #[test]
    fn self_links_are_dropped() {
        let mut graph = LinkGraph::new();
        graph.add_link(Link::new("a", "a", "depends_on"));
        assert!(graph.outgoing("a", None).is_empty());
    }

    #[test]
    fn remove_entity_returns_removed_edges() {
        let mut graph = LinkGraph::new();
        graph.add_link(Link::new("a", "b", "depends_on"));
        graph.add_link(Link::new("c", "a", "blocks"));

        let removed = graph.remove_entity("a");
        assert_eq!(removed.len(), 2);
        assert!(graph.outgoing("c", None).is_empty());
        assert!(graph.incoming("b", None).is_empty());
        assert!(!graph.entities().contains("a"));
    }

    #[test]
    fn no_edges_survive_entity_removal() {
        let mut graph = LinkGraph::new();
        graph.add_link(Link::new("a", "b", "relates_to"));
        graph.add_link(Link::new("b", "c", "depends_on"));
        graph.remove_entity("b");

        for id in ["a", "c"] {
            for link in graph.outgoing(id, None).iter().chain(graph.incoming(id, None).iter()) {
                assert_ne!(link.source_id, "b");
                assert_ne!(link.target_id, "b");
            }
        }
    }

    #[test]
    fn connected_respects_depth() {
        let mut graph = LinkGraph::new();
        graph.add_link(Link::new("a", "b", "depends_on"));
        graph.add_link(Link::new("b", "c", "depends_on"));
        graph.add_link(Link::new("c", "d", "depends_on"));

        let depth1 = graph.connected("a", 1);
        assert_eq!(depth1, HashSet::from(["b".to_string()]));

        let depth2 = graph.connected("a", 2);
        assert!(depth2.contains("b") && depth2.contains("c") && !depth2.contains("d"));
    }

    #[test]
    fn orphans_are_entities_without_edges() {
        let mut graph = LinkGraph::new();
        graph.add_entity("lonely-1");
        graph.add_link(Link::new("a", "b", "depends_on"));
        assert_eq!(graph.find_orphans(), HashSet::from(["lonely-1".to_string()]));
    }

    #[test]
    fn broken_links_ignore_tags() {
        let mut graph = LinkGraph::new();
        graph.add_link(Link::new("a", "missing", "depends_on"));
        graph.add_link(Link::new("a", "tag-work", "tagged_with"));

        let known: HashSet<String> = ["a".to_string()].into();
        let broken = graph.find_broken(&known);
        assert_eq!(broken.len(), 1);
        assert_eq!(broken[0].target_id, "missing");
    }

    #[test]
    fn three_node_cycle_is_detected() {
        let mut graph = LinkGraph::new();
        graph.add_link(Link::new("a", "b", "depends_on"));
        graph.add_link(Link::new("b", "c", "depends_on"));
        graph.add_link(Link::new("c", "a", "depends_on"));

        let cycles = graph.find_cycles("depends_on");
        assert_eq!(cycles.len(), 1);
        let members: HashSet<&str> = cycles[0].iter().map(String::as_str).collect();
        assert_eq!(members, HashSet::from(["a", "b", "c"]));
    }

    #[test]
    fn acyclic_graph_has_no_cycles() {
        let mut graph = LinkGraph::new();
        graph.add_link(Link::new("a", "b", "depends_on"));
        graph.add_link(Link::new("a", "c", "depends_on"));
        graph.add_link(Link::new("b", "c", "depends_on"));
        assert!(graph.find_cycles("depends_on").is_empty());
    }

    #[test]
    fn cycles_in_other_types_are_ignored() {
        let mut graph = LinkGraph::new();
        graph.add_link(Link::new("a", "b", "blocks"));
        graph.add_link(Link::new("b", "a", "blocks"));
        assert!(graph.find_cycles("depends_on").is_empty());
    }

    #[test]
    fn update_entity_links_replaces_prior_edges() {
        let mut graph = LinkGraph::new();
        let fm = meta(&[("depends_on", json!(["task-old"]))]);
        update_entity_links(&mut graph, "task-x", &fm, "");
        assert_eq!(graph.outgoing("task-x", None).len(), 1);

        let fm = meta(&[("depends_on", json!(["task-new"]))]);
        update_entity_links(&mut graph, "task-x", &fm, "and [[note-extra]]");

        let targets: HashSet<String> = graph
            .outgoing("task-x", None)
            .into_iter()
            .map(|l| l.target_id)
            .collect();
        assert_eq!(
            targets,
            HashSet::from(["task-new".to_string(), "note-extra".to_string()])
        );
    }

    #[test]
    fn stats_count_links_by_type() {
        let mut graph = LinkGraph::new();
        graph.add_link(Link::new("a", "b", "depends_on"));
        graph.add_link(Link::new("a", "c", "depends_on"));
        graph.add_link(Link::new("b", "c", "blocks"));
        let stats = graph.stats();
        assert_eq!(stats.total_entities, 3);
        assert_eq!(stats.links_by_type["depends_on"], 2);
        assert_eq!(stats.links_by_type["blocks"], 1);
    }
}
