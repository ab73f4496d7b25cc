//! Which CTEs a projection needs, and in which order to build them.
//!
//! Every virtual field is carried by a unit: the CTE of its link field, or a
//!  CTE of its own for conditional fields. A unit depends on the units of the
//!  foreign fields it reads (link titles, lookup targets, filter and sort
//!  fields), so the build order is a post-order walk of that graph.

use indexmap::{IndexMap, IndexSet};
use petgraph::{
    algo::is_cyclic_directed,
    graph::{DiGraph, NodeIndex},
    visit::DfsPostOrder,
};

use crate::{
    parser,
    filter::FilterTree,
    schema::{Field, FieldKind, LookupOptions, SchemaCatalog, SortSpec, TableSchema},
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CteUnit {
    /// A link field along with the lookups and rollups going through it
    Link { table_id: String, field_id: String },
    /// A conditional field, or a lookup that needs its own sort or limit
    Conditional { table_id: String, field_id: String },
}

impl CteUnit {
    pub fn name(&self) -> String {
        match self {
            CteUnit::Link { field_id, .. } => format!("CTE_{field_id}"),
            CteUnit::Conditional { field_id, .. } => format!("CTE_CONDITIONAL_{field_id}"),
        }
    }

    pub fn table_id(&self) -> &str {
        match self {
            CteUnit::Link { table_id, .. } | CteUnit::Conditional { table_id, .. } => table_id,
        }
    }

    pub fn field_id(&self) -> &str {
        match self {
            CteUnit::Link { field_id, .. } | CteUnit::Conditional { field_id, .. } => field_id,
        }
    }
}

/// Sorted or limited lookups can't share the link CTE.
fn needs_own_unit(options: &LookupOptions) -> bool {
    options.sort.is_some() || options.limit.is_some()
}

/// The unit carrying a virtual field; `None` for everything else.
pub fn unit_of(table: &TableSchema, field: &Field) -> Option<CteUnit> {
    let link = |field_id: &str| CteUnit::Link {
        table_id: table.id.clone(),
        field_id: field_id.to_string(),
    };
    let conditional = || CteUnit::Conditional {
        table_id: table.id.clone(),
        field_id: field.id.clone(),
    };
    match &field.kind {
        FieldKind::Link(_) => Some(link(&field.id)),
        FieldKind::Lookup(options) | FieldKind::Rollup { options, .. } => {
            if needs_own_unit(options) {
                Some(conditional())
            } else {
                Some(link(&options.link_field_id))
            }
        }
        FieldKind::ConditionalLookup(_) | FieldKind::ConditionalRollup { .. } => Some(conditional()),
        FieldKind::Column | FieldKind::Formula(_) | FieldKind::System(_) => None,
    }
}

/// Lookups and rollups of `table` carried by the CTE of `link_id`.
pub fn link_members<'t>(table: &'t TableSchema, link_id: &str) -> Vec<&'t Field> {
    table
        .fields()
        .filter(|f| match &f.kind {
            FieldKind::Lookup(options) | FieldKind::Rollup { options, .. } => {
                options.link_field_id == link_id && !needs_own_unit(options)
            }
            _ => false,
        })
        .collect()
}

/// The options behind a conditional unit, borrowed from either a conditional
///  field or a sorted/limited lookup.
#[derive(Debug, Clone, Copy)]
pub struct ConditionalView<'f> {
    pub link_field_id: Option<&'f str>,
    pub foreign_table_id: &'f str,
    pub lookup_field_id: &'f str,
    pub filter: Option<&'f FilterTree>,
    pub sort: Option<&'f SortSpec>,
    pub limit: Option<usize>,
    /// Field values in the filter come from the host row. Lookup filters
    ///  compare foreign fields with each other instead.
    pub host_values: bool,
}

impl<'f> ConditionalView<'f> {
    pub fn of(field: &'f Field) -> Option<Self> {
        match &field.kind {
            FieldKind::ConditionalLookup(o) | FieldKind::ConditionalRollup { options: o, .. } => {
                Some(Self {
                    link_field_id: o.link_field_id.as_deref(),
                    foreign_table_id: &o.foreign_table_id,
                    lookup_field_id: &o.lookup_field_id,
                    filter: o.filter.as_ref(),
                    sort: o.sort.as_ref(),
                    limit: o.limit,
                    host_values: true,
                })
            }
            FieldKind::Lookup(o) | FieldKind::Rollup { options: o, .. } => Some(Self {
                link_field_id: Some(&o.link_field_id),
                foreign_table_id: &o.foreign_table_id,
                lookup_field_id: &o.lookup_field_id,
                filter: o.filter.as_ref(),
                sort: o.sort.as_ref(),
                limit: o.limit,
                host_values: false,
            }),
            _ => None,
        }
    }
}

/// The non-formula fields `field_id` reads, expanding formulas. Formulas that
///  fail to parse or loop contribute what was found so far.
pub fn leaf_fields<'t>(table: &'t TableSchema, field_id: &str) -> Vec<&'t Field> {
    let mut leaves = IndexMap::new();
    let mut seen = IndexSet::new();
    let mut stack = vec![field_id.to_string()];
    while let Some(id) = stack.pop() {
        if !seen.insert(id.clone()) {
            continue;
        }
        let Some(field) = table.field(&id) else {
            continue;
        };
        match &field.kind {
            FieldKind::Formula(options) => {
                let refs: Vec<String> = match &options.tree {
                    Some(tree) => tree.field_references().into_iter().map(str::to_string).collect(),
                    None => match parser::parse(&options.expression) {
                        Ok(tree) => tree.field_references().into_iter().map(str::to_string).collect(),
                        Err(e) => {
                            log::debug!("skipping unparsable formula {}: {e}", field.id);
                            Vec::new()
                        }
                    },
                };
                stack.extend(refs.into_iter().rev());
            }
            _ => {
                leaves.insert(field.id.as_str(), field);
            }
        }
    }
    leaves.into_values().collect()
}

/// The units behind `field_ids` of `table`.
fn units_needed(table: &TableSchema, field_ids: &[&str]) -> Vec<CteUnit> {
    let mut units = Vec::new();
    for id in field_ids {
        for leaf in leaf_fields(table, id) {
            if let Some(unit) = unit_of(table, leaf)
                && !units.contains(&unit)
            {
                units.push(unit);
            }
        }
    }
    units
}

pub struct DependencyGraph {
    graph: DiGraph<CteUnit, ()>,
    nodes: IndexMap<CteUnit, NodeIndex>,
    roots: Vec<NodeIndex>,
}

impl DependencyGraph {
    /// Discovers every unit `projection` (fields of `table`) needs,
    ///  transitively through foreign tables.
    pub fn build(catalog: &dyn SchemaCatalog, table: &TableSchema, projection: &[&str]) -> Self {
        let mut graph = Self {
            graph: DiGraph::new(),
            nodes: IndexMap::new(),
            roots: Vec::new(),
        };
        let mut pending = Vec::new();
        for unit in units_needed(table, projection) {
            let (node, new) = graph.node(unit.clone());
            graph.roots.push(node);
            if new {
                pending.push(unit);
            }
        }
        while let Some(unit) = pending.pop() {
            let from = graph.nodes[&unit];
            for requirement in requirements(catalog, &unit) {
                let (to, new) = graph.node(requirement.clone());
                graph.graph.update_edge(from, to, ());
                if new {
                    pending.push(requirement);
                }
            }
        }
        log::debug!(
            "planned {} CTE(s) for {} ({} root(s))",
            graph.nodes.len(),
            table.id,
            graph.roots.len()
        );
        graph
    }

    fn node(&mut self, unit: CteUnit) -> (NodeIndex, bool) {
        if let Some(node) = self.nodes.get(&unit) {
            return (*node, false);
        }
        let node = self.graph.add_node(unit.clone());
        self.nodes.insert(unit, node);
        (node, true)
    }

    /// Units reading each other. The build still terminates: whichever is
    ///  built first reads NULL for the other.
    pub fn is_cyclic(&self) -> bool {
        is_cyclic_directed(&self.graph)
    }

    /// Units of the root table, the ones joined to the main query.
    pub fn roots(&self) -> impl Iterator<Item = &CteUnit> {
        self.roots.iter().map(|n| &self.graph[*n])
    }

    /// Build order: every unit comes after the units it reads.
    pub fn plan(&self) -> Vec<&CteUnit> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let Some(first) = self.roots.first() else {
            return order;
        };
        let mut dfs = DfsPostOrder::new(&self.graph, *first);
        for root in &self.roots {
            dfs.move_to(*root);
            while let Some(node) = dfs.next(&self.graph) {
                order.push(&self.graph[node]);
            }
        }
        order
    }
}

/// Units read by the body of `unit`.
fn requirements(catalog: &dyn SchemaCatalog, unit: &CteUnit) -> Vec<CteUnit> {
    let Some(host) = catalog.table(unit.table_id()) else {
        return Vec::new();
    };
    let Some(field) = host.field(unit.field_id()) else {
        return Vec::new();
    };
    let mut foreign_ids: Vec<&str> = Vec::new();
    let mut host_ids: Vec<&str> = Vec::new();
    let foreign_table_id = match (unit, &field.kind) {
        (CteUnit::Link { .. }, FieldKind::Link(link)) => {
            foreign_ids.push(&link.title_field_id);
            for member in link_members(host, &field.id) {
                if let FieldKind::Lookup(options) | FieldKind::Rollup { options, .. } = &member.kind {
                    foreign_ids.push(&options.lookup_field_id);
                    if let Some(filter) = &options.filter {
                        foreign_ids.extend(filter.field_ids());
                        foreign_ids.extend(filter.value_field_ids());
                    }
                }
            }
            link.foreign_table_id.as_str()
        }
        (CteUnit::Conditional { .. }, _) => {
            let Some(view) = ConditionalView::of(field) else {
                return Vec::new();
            };
            foreign_ids.push(view.lookup_field_id);
            if let Some(filter) = view.filter {
                foreign_ids.extend(filter.field_ids());
                if view.host_values {
                    host_ids.extend(filter.value_field_ids());
                } else {
                    foreign_ids.extend(filter.value_field_ids());
                }
            }
            if let Some(sort) = view.sort {
                foreign_ids.push(&sort.field_id);
            }
            view.foreign_table_id
        }
        _ => return Vec::new(),
    };

    let mut units = units_needed(host, &host_ids);
    if let Some(foreign) = catalog.table(foreign_table_id) {
        for unit in units_needed(foreign, &foreign_ids) {
            if !units.contains(&unit) {
                units.push(unit);
            }
        }
    }
    units
}
