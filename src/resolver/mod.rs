// src/resolver/mod.rs

//! Dependency resolution
//!
//! Turns a requested formula plus the descriptor set into a build order:
//! a depth-first, post-order walk from the root that visits dependencies in
//! their declared order. The result is deterministic for a fixed descriptor
//! set, lists every formula once, and places each formula after all of its
//! dependencies. Resolution has no side effects.

use crate::error::{Error, Result};
use crate::formula::{Formula, FormulaSet};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    /// On the traversal stack
    Visiting,
    /// Emitted into the build order
    Done,
}

/// Compute the build order for `root`
///
/// Fails with `MissingDependency` when the root or any transitively
/// referenced formula has no descriptor, `UnsatisfiedConstraint` when a
/// descriptor exists but its version is rejected by the dependent's
/// constraint, and `CyclicDependency` carrying the cycle's node sequence.
pub fn resolve(root: &str, formulas: &FormulaSet) -> Result<Vec<Arc<Formula>>> {
    let root_formula = formulas.get(root).ok_or_else(|| Error::MissingDependency {
        dependent: None,
        dependency: root.to_string(),
    })?;

    let mut marks: HashMap<String, Mark> = HashMap::new();
    let mut order: Vec<Arc<Formula>> = Vec::new();
    // Explicit stack of (formula, index of the next dependency to visit)
    let mut stack: Vec<(Arc<Formula>, usize)> = vec![(Arc::clone(root_formula), 0)];
    marks.insert(root.to_string(), Mark::Visiting);

    loop {
        let (formula, next) = match stack.last_mut() {
            Some(top) => {
                let next = top.1;
                top.1 += 1;
                (Arc::clone(&top.0), next)
            }
            None => break,
        };

        let Some(dep) = formula.dependencies().get(next) else {
            stack.pop();
            marks.insert(formula.name().to_string(), Mark::Done);
            order.push(formula);
            continue;
        };

        let dep_formula = formulas
            .get(&dep.name)
            .ok_or_else(|| Error::MissingDependency {
                dependent: Some(formula.name().to_string()),
                dependency: dep.name.clone(),
            })?;

        if !dep.constraint.satisfies(dep_formula.version()) {
            return Err(Error::UnsatisfiedConstraint {
                dependent: formula.name().to_string(),
                dependency: dep.name.clone(),
                constraint: dep.constraint.to_string(),
                found: dep_formula.version().to_string(),
            });
        }

        match marks.get(&dep.name) {
            Some(Mark::Done) => {}
            Some(Mark::Visiting) => {
                let start = stack
                    .iter()
                    .position(|(f, _)| f.name() == dep.name)
                    .unwrap_or(0);
                let mut cycle: Vec<String> = stack[start..]
                    .iter()
                    .map(|(f, _)| f.name().to_string())
                    .collect();
                cycle.push(dep.name.clone());
                return Err(Error::CyclicDependency { cycle });
            }
            None => {
                marks.insert(dep.name.clone(), Mark::Visiting);
                stack.push((Arc::clone(dep_formula), 0));
            }
        }
    }

    debug!(
        "Resolved {}: {}",
        root,
        order
            .iter()
            .map(|f| f.name())
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(order)
}
