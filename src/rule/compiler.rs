//! Rule activation: validation, dependency graph and evaluation orders.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::debug;
use uuid::Uuid;

use crate::error::ValidationError;

use super::active::{ActiveRule, VarCategory, VarKind, Variable, MOUNT};
use super::{Rule, VarDecl};

/// Validate `rule` and turn it into an [`ActiveRule`].
///
/// A rule without a usable name gets a generated one. Every variable starts
/// undefined; nothing is evaluated and no resource is registered here.
pub fn activate(rule: Rule) -> Result<ActiveRule, ValidationError> {
    let name = rule
        .name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut order = Vec::with_capacity(rule.decls.len());
    let mut vars = BTreeMap::new();
    for (var, decl) in rule.decls {
        if vars.contains_key(&var) {
            return Err(ValidationError::DuplicateVariable { rule: name, var });
        }
        let (kind, deps) = lower(decl);
        order.push(var.clone());
        vars.insert(var.clone(), Variable::new(var, kind, deps));
    }

    if !vars.contains_key(MOUNT) {
        return Err(ValidationError::MissingMount { rule: name });
    }

    check_deps(&name, &order, &vars)?;
    if let Some(cycle) = find_cycle(&order, &vars) {
        return Err(ValidationError::CyclicDependency { rule: name, cycle });
    }

    let until_mount = eval_order(&[MOUNT.to_string()], &vars);
    let all = eval_order(&order, &vars);
    let before: HashSet<&String> = until_mount.iter().collect();
    let after_mount = all.iter().filter(|v| !before.contains(v)).cloned().collect();

    let rule = ActiveRule {
        name,
        vars,
        fragment_cache: HashMap::new(),
        until_mount,
        after_mount,
    };
    debug!(
        rule = %rule.name,
        until_mount = ?rule.until_mount,
        after_mount = ?rule.after_mount,
        "rule activated"
    );
    Ok(rule)
}

fn lower(decl: VarDecl) -> (VarKind, Vec<String>) {
    match decl {
        VarDecl::Mount(d) => {
            let (compute, deps) = d.lower();
            (VarKind::Mount { compute }, deps)
        }
        VarDecl::Query(d) => {
            let (compute, deps) = d.lower();
            (VarKind::Query { compute, query: None }, deps)
        }
        VarDecl::Param(d) => {
            let (compute, deps) = d.lower();
            (VarKind::Param { compute }, deps)
        }
        VarDecl::Sub(d) => {
            let (compute, deps) = d.lower();
            (VarKind::Sub { compute, sub: None }, deps)
        }
        VarDecl::Fragment(d) => {
            let (compute, deps) = d.lower();
            (VarKind::Fragment { compute }, deps)
        }
    }
}

fn check_deps(rule: &str, order: &[String], vars: &BTreeMap<String, Variable>) -> Result<(), ValidationError> {
    for name in order {
        let Some(var) = vars.get(name) else { continue };
        for dep in &var.deps {
            match vars.get(dep).map(Variable::category) {
                None => {
                    return Err(ValidationError::DanglingDependency {
                        rule: rule.to_string(),
                        var: name.clone(),
                        dependency: dep.clone(),
                    })
                }
                Some(VarCategory::Fragments) => {
                    return Err(ValidationError::FragmentDependency {
                        rule: rule.to_string(),
                        var: name.clone(),
                        dependency: dep.clone(),
                    })
                }
                Some(_) => {}
            }
        }
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Depth-first search for a dependency cycle, returned as the path that
/// closes it (first and last entries are the same variable).
fn find_cycle(order: &[String], vars: &BTreeMap<String, Variable>) -> Option<Vec<String>> {
    fn visit(
        name: &str,
        vars: &BTreeMap<String, Variable>,
        marks: &mut HashMap<String, Mark>,
        path: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        match marks.get(name) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => {
                let start = path.iter().position(|p| p == name).unwrap_or(0);
                let mut cycle = path[start..].to_vec();
                cycle.push(name.to_string());
                return Some(cycle);
            }
            None => {}
        }

        marks.insert(name.to_string(), Mark::Visiting);
        path.push(name.to_string());
        if let Some(var) = vars.get(name) {
            for dep in &var.deps {
                if let Some(cycle) = visit(dep, vars, marks, path) {
                    return Some(cycle);
                }
            }
        }
        path.pop();
        marks.insert(name.to_string(), Mark::Done);
        None
    }

    let mut marks = HashMap::new();
    let mut path = Vec::new();
    order.iter().find_map(|name| visit(name, vars, &mut marks, &mut path))
}

/// Reverse breadth-first traversal of the dependency graph from `start`.
///
/// Each step replaces the frontier by its dependencies. Names are emitted in
/// reverse discovery order keeping only the deepest discovery, which puts
/// every variable after all of its dependencies. The graph must be acyclic.
fn eval_order(start: &[String], vars: &BTreeMap<String, Variable>) -> Vec<String> {
    let mut steps: Vec<Vec<String>> = Vec::new();
    let mut frontier: Vec<String> = dedup(start.iter().cloned());

    while !frontier.is_empty() {
        let next = dedup(
            frontier
                .iter()
                .filter_map(|name| vars.get(name))
                .flat_map(|var| var.deps.iter().cloned()),
        );
        steps.push(frontier);
        frontier = next;
    }

    let mut seen = HashSet::new();
    steps
        .into_iter()
        .rev()
        .flatten()
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

fn dedup(names: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    names.filter(|n| seen.insert(n.clone())).collect()
}
