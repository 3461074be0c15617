use crate::error::{ReconciliationError, Result};
use crate::schema::{Meter, MeterRole, MeterType};
use crate::variance::variance_percentage;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One edge of the site's distribution tree, as stored in the connection map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterConnection {
    pub child_meter_id: String,
    pub parent_meter_id: String,
}

impl MeterConnection {
    pub fn new(child: impl Into<String>, parent: impl Into<String>) -> Self {
        Self {
            child_meter_id: child.into(),
            parent_meter_id: parent.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HierarchyNode {
    pub meter_id: String,
    pub depth: usize,
    pub is_leaf: bool,
    /// The meter's own reading total, including its own corrections.
    pub direct_total: f64,
    /// Signed sum of leaf descendants; equals the signed direct total for a leaf.
    pub hierarchical_total: f64,
    /// Signed corrections carried up from the leaves.
    pub corrections: f64,
    /// `hierarchical_total - direct_total`, parents only.
    pub variance: Option<f64>,
    pub variance_percentage: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct MeterHierarchy {
    meter_types: BTreeMap<String, MeterType>,
    roles: BTreeMap<String, MeterRole>,
    parent_of: BTreeMap<String, String>,
    children_of: BTreeMap<String, Vec<String>>,
    members: BTreeSet<String>,
}

impl MeterHierarchy {
    pub fn from_connections(meters: &[Meter], connections: &[MeterConnection]) -> Result<Self> {
        let mut hierarchy = Self::default();

        for meter in meters {
            hierarchy.meter_types.insert(meter.id.clone(), meter.meter_type);
            hierarchy.members.insert(meter.id.clone());
        }

        for connection in connections {
            let child = &connection.child_meter_id;
            let parent = &connection.parent_meter_id;

            if child == parent {
                return Err(ReconciliationError::HierarchyError(format!(
                    "Meter {} is connected to itself",
                    child
                )));
            }

            if let Some(existing) = hierarchy.parent_of.get(child) {
                if existing == parent {
                    continue;
                }
                return Err(ReconciliationError::HierarchyError(format!(
                    "Meter {} has two parents: {} and {}",
                    child, existing, parent
                )));
            }

            for id in [child, parent] {
                if !hierarchy.meter_types.contains_key(id) {
                    debug!("Connection references meter {} with no meter record", id);
                }
                hierarchy.members.insert(id.clone());
            }

            hierarchy.parent_of.insert(child.clone(), parent.clone());
            hierarchy
                .children_of
                .entry(parent.clone())
                .or_default()
                .push(child.clone());
        }

        hierarchy.check_acyclic()?;
        Ok(hierarchy)
    }

    fn check_acyclic(&self) -> Result<()> {
        for start in self.parent_of.keys() {
            let mut seen = BTreeSet::new();
            let mut current = start.as_str();
            while let Some(parent) = self.parent_of.get(current) {
                if !seen.insert(current) {
                    return Err(ReconciliationError::HierarchyError(format!(
                        "Cycle detected through meter {}",
                        current
                    )));
                }
                current = parent.as_str();
            }
        }
        Ok(())
    }

    pub fn with_roles(mut self, roles: BTreeMap<String, MeterRole>) -> Self {
        self.roles = roles;
        self
    }

    pub fn assign_role(&mut self, meter_id: impl Into<String>, role: MeterRole) {
        self.roles.insert(meter_id.into(), role);
    }

    pub fn role(&self, meter_id: &str) -> MeterRole {
        self.roles.get(meter_id).copied().unwrap_or_default()
    }

    /// Solar sources count against their parent's total.
    pub fn sign(&self, meter_id: &str) -> f64 {
        let solar = match self.role(meter_id) {
            MeterRole::SolarEnergy => true,
            MeterRole::Unassigned => self.meter_types.get(meter_id) == Some(&MeterType::Solar),
            _ => false,
        };
        if solar {
            -1.0
        } else {
            1.0
        }
    }

    pub fn meter_ids(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(String::as_str)
    }

    pub fn parent(&self, meter_id: &str) -> Option<&str> {
        self.parent_of.get(meter_id).map(String::as_str)
    }

    pub fn children(&self, meter_id: &str) -> &[String] {
        self.children_of
            .get(meter_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_leaf(&self, meter_id: &str) -> bool {
        self.children(meter_id).is_empty()
    }

    pub fn roots(&self) -> Vec<&str> {
        self.members
            .iter()
            .filter(|id| !self.parent_of.contains_key(*id))
            .map(String::as_str)
            .collect()
    }

    pub fn ancestors(&self, meter_id: &str) -> Vec<&str> {
        let mut chain = Vec::new();
        let mut current = meter_id;
        while let Some(parent) = self.parent(current) {
            chain.push(parent);
            current = parent;
        }
        chain
    }

    pub fn depth(&self, meter_id: &str) -> usize {
        self.ancestors(meter_id).len()
    }

    pub fn leaves_under<'a>(&'a self, meter_id: &'a str) -> Vec<&'a str> {
        let mut leaves = Vec::new();
        let mut stack = vec![meter_id];
        while let Some(id) = stack.pop() {
            let children = self.children(id);
            if children.is_empty() {
                if id != meter_id {
                    leaves.push(id);
                }
            } else {
                stack.extend(children.iter().rev().map(String::as_str));
            }
        }
        leaves
    }

    /// Signed sum of the leaf values under `meter_id`. A meter with no
    /// children contributes its own signed value; missing values count as zero.
    pub fn hierarchical_total(&self, meter_id: &str, values: &BTreeMap<String, f64>) -> f64 {
        let children = self.children(meter_id);
        if children.is_empty() {
            return self.sign(meter_id) * values.get(meter_id).copied().unwrap_or(0.0);
        }
        children
            .iter()
            .map(|child| self.hierarchical_total(child, values))
            .sum()
    }

    /// Computes a node for every meter, carrying corrections up the tree.
    pub fn aggregate(
        &self,
        values: &BTreeMap<String, f64>,
        corrections: &BTreeMap<String, f64>,
    ) -> BTreeMap<String, HierarchyNode> {
        let mut nodes = BTreeMap::new();
        for root in self.roots() {
            self.visit(root, 0, values, corrections, &mut nodes);
        }
        nodes
    }

    fn visit(
        &self,
        meter_id: &str,
        depth: usize,
        values: &BTreeMap<String, f64>,
        corrections: &BTreeMap<String, f64>,
        nodes: &mut BTreeMap<String, HierarchyNode>,
    ) -> (f64, f64) {
        let own_correction = corrections.get(meter_id).copied().unwrap_or(0.0);
        let direct_total = values.get(meter_id).copied().unwrap_or(0.0) + own_correction;
        let children = self.children(meter_id);

        let (hierarchical_total, carried) = if children.is_empty() {
            let sign = self.sign(meter_id);
            (sign * direct_total, sign * own_correction)
        } else {
            children.iter().fold((0.0, 0.0), |(total, carried), child| {
                let (t, c) = self.visit(child, depth + 1, values, corrections, nodes);
                (total + t, carried + c)
            })
        };

        let (variance, variance_pct) = if children.is_empty() {
            (None, None)
        } else {
            (
                Some(hierarchical_total - direct_total),
                variance_percentage(hierarchical_total, direct_total),
            )
        };

        nodes.insert(
            meter_id.to_string(),
            HierarchyNode {
                meter_id: meter_id.to_string(),
                depth,
                is_leaf: children.is_empty(),
                direct_total,
                hierarchical_total,
                corrections: carried,
                variance,
                variance_percentage: variance_pct,
            },
        );

        (hierarchical_total, carried)
    }
}
