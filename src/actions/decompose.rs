// src/actions/decompose.rs

//! Composite-to-primitive expansion
//!
//! Composite actions may expand into further composites. Expansion runs as
//! a fixed-point loop: every round replaces each remaining composite with
//! its children, until only primitives remain. Two guards keep this finite:
//!
//! - each pending step remembers the (action, params) hashes of the
//!   composites it descends from; meeting one again is a cycle
//! - the number of rounds is capped at [`MAX_DECOMPOSITION_DEPTH`]
//!
//! Decomposition is all-or-nothing. Any failure discards the partial list.

use super::{EvalContext, Registry, Step};
use crate::error::{Error, Result};
use crate::hash;
use crate::params::Params;
use tracing::debug;

/// Maximum nesting of composite actions
pub const MAX_DECOMPOSITION_DEPTH: usize = 32;

/// A step awaiting expansion, with the hashes of its composite ancestors
struct Pending {
    step: Step,
    ancestors: Vec<String>,
}

/// Hash of an action and its canonical params
///
/// `serde_json::Map` keeps keys sorted, so serialization is canonical.
fn step_hash(action: &str, params: &Params) -> Result<String> {
    let params_json = serde_json::to_string(params)?;
    Ok(hash::sha256(format!("{}:{}", action, params_json).as_bytes()))
}

/// Expand `action` until only primitives remain
///
/// A primitive action is returned as a single step. An unregistered action
/// is an error, as is a registered action that is neither primitive nor
/// decomposable.
pub fn decompose_to_primitives(
    registry: &Registry,
    ctx: &EvalContext,
    action: &str,
    params: &Params,
) -> Result<Vec<Step>> {
    let root = Step::new(action, params.clone());
    registry.require(action)?;

    let mut pending = vec![Pending {
        step: root,
        ancestors: Vec::new(),
    }];
    let mut rounds = 0;

    while pending
        .iter()
        .any(|item| !registry.is_primitive(&item.step.action))
    {
        rounds += 1;
        if rounds > MAX_DECOMPOSITION_DEPTH {
            return Err(Error::DecompositionTooDeep(MAX_DECOMPOSITION_DEPTH));
        }

        let mut next = Vec::with_capacity(pending.len());
        for item in pending {
            if registry.is_primitive(&item.step.action) {
                next.push(item);
            } else {
                next.extend(expand(registry, ctx, item)?);
            }
        }
        pending = next;
    }

    debug!(
        "Decomposed '{}' into {} primitive step(s) in {} round(s)",
        action,
        pending.len(),
        rounds
    );
    Ok(pending.into_iter().map(|item| item.step).collect())
}

fn expand(registry: &Registry, ctx: &EvalContext, item: Pending) -> Result<Vec<Pending>> {
    let Pending { step, mut ancestors } = item;

    let action = registry.require(&step.action)?;
    let decomposable = action
        .as_decomposable()
        .ok_or_else(|| Error::NotDecomposable(step.action.clone()))?;

    let hash = step_hash(&step.action, &step.params)?;
    if ancestors.contains(&hash) {
        return Err(Error::DecompositionCycle(step.action.clone()));
    }
    ancestors.push(hash);

    ctx.cancel.check()?;
    let mut children = decomposable
        .decompose(ctx, &step.params)
        .map_err(|e| Error::Decomposition {
            action: step.action.clone(),
            source: Box::new(e),
        })?;

    // A composite that pinned a checksum for itself hands it to a sole child
    if let ([child], Some(checksum)) = (children.as_mut_slice(), &step.checksum)
        && child.checksum.is_none()
    {
        child.checksum = Some(checksum.clone());
        child.size = step.size;
    }

    Ok(children
        .into_iter()
        .map(|child| Pending {
            step: child,
            ancestors: ancestors.clone(),
        })
        .collect())
}
