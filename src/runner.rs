//! The query runner (spec §4.E): executes a [`Specification`] against a
//! [`FactStore`] snapshot, producing ordered tuples and projections.
//!
//! The runner never mutates storage and never errors on an absent fact —
//! absence always prunes a tuple or drops a projected value, per spec §7's
//! `MissingFact` classification.

use crate::error::{Result, RuntimeDataError};
use crate::fact::{Reference, Scalar};
use crate::spec::ast::{Condition, ExistentialCondition, Label, Match, PathCondition, Projection, Role};
use crate::spec::Specification;
use crate::store::{FactStore, ProjectedValue, QueryResult, Tuple};

/// Run `specification` with `given` references bound to its givens, in
/// declared order (spec §4.E steps 1–4).
pub fn run(
    store: &dyn FactStore,
    given: &[Reference],
    specification: &Specification,
) -> Result<Vec<QueryResult>> {
    if given.len() != specification.given.len() {
        return Ok(Vec::new());
    }

    if store.which_exist(given)?.len() != given.len() {
        // Step 1: any absent given drops the initial tuple entirely.
        return Ok(Vec::new());
    }

    let mut tuple = Tuple::new();
    for (labeled_given, reference) in specification.given.iter().zip(given) {
        if reference.fact_type != labeled_given.fact_type {
            return Ok(Vec::new());
        }
        tuple.insert(labeled_given.label.clone(), reference.clone());
    }

    run_from_tuple(store, tuple, specification)
}

/// Runs given-condition pruning, match expansion, and projection from an
/// already-seeded tuple rather than a positional given-reference list.
///
/// Used by nested sub-specifications whose givens reuse an outer label by
/// name (rather than through the positional given list), and by the
/// inverter/observer (spec §4.F, §4.G), which reconstruct a tuple by
/// walking backward from a newly arrived fact instead of starting from
/// the top of the query.
pub fn run_from_tuple(
    store: &dyn FactStore,
    tuple: Tuple,
    specification: &Specification,
) -> Result<Vec<QueryResult>> {
    for labeled_given in &specification.given {
        if !tuple.contains_key(&labeled_given.label) {
            return Ok(Vec::new());
        }
    }

    // Step 2: given-condition pruning — existentials on givens are
    // evaluated eagerly, before any match runs.
    for labeled_given in &specification.given {
        if !evaluate_conditions(store, &tuple, &labeled_given.conditions)? {
            return Ok(Vec::new());
        }
    }

    // Step 3: match evaluation, in declared order.
    let mut tuples = vec![tuple];
    for m in &specification.matches {
        tuples = expand_matches(store, tuples, m)?;
    }

    // Step 4: projection.
    let mut results = Vec::with_capacity(tuples.len());
    for tuple in tuples {
        if let Some(projection) = evaluate_projection(store, &tuple, &specification.projection)? {
            results.push(QueryResult { tuple, projection });
        }
    }
    Ok(results)
}

/// Evaluates a single existential condition for one candidate fact bound
/// to `owner_label`, with no surrounding tuple — the shape the purge
/// compliance sweep (`crate::purge::eligible_for_purge`) and the
/// observer's `maybeAdd`/`maybeRemove` recheck (`crate::observer`) both
/// need: "does this one fact currently satisfy this existential", not a
/// full specification run.
pub fn existential_holds(
    store: &dyn FactStore,
    owner_label: &str,
    candidate: &Reference,
    condition: &ExistentialCondition,
) -> Result<bool> {
    let mut tuple = Tuple::new();
    tuple.insert(owner_label.to_string(), candidate.clone());
    let satisfied = sub_specification_has_result(store, &tuple, &condition.matches)?;
    Ok(satisfied == condition.exists)
}

/// Evaluates `projection` directly against an already-bound `tuple`,
/// without running any matches — the shape the observer needs to
/// "materialize the nested projection" for a tuple reconstructed by an
/// inverse specification (spec §4.G.2), rather than re-running the whole
/// forward query.
pub fn project(
    store: &dyn FactStore,
    tuple: &Tuple,
    projection: &Projection,
) -> Result<Option<ProjectedValue>> {
    evaluate_projection(store, tuple, projection)
}

/// Extends every tuple in `tuples` with a binding for `m.unknown`,
/// dropping tuples for which no candidate survives `m`'s conditions.
fn expand_matches(store: &dyn FactStore, tuples: Vec<Tuple>, m: &Match) -> Result<Vec<Tuple>> {
    let mut expanded = Vec::new();
    for tuple in tuples {
        for candidate in candidates_for_match(store, &tuple, m)? {
            let mut extended = tuple.clone();
            extended.insert(m.unknown.clone(), candidate);
            if evaluate_conditions(store, &extended, &m.conditions)? {
                expanded.push(extended);
            }
        }
    }
    Ok(expanded)
}

/// Enumerates candidate references for `m.unknown`, using the first path
/// condition that links it to an already-bound label as an index-driven
/// join. Falls back to a full scan by type if no such condition exists —
/// every forward-query example in practice anchors its matches, so this
/// path is rare, but it is not itself unbounded (a type's fact population
/// is finite at any snapshot).
fn candidates_for_match(store: &dyn FactStore, tuple: &Tuple, m: &Match) -> Result<Vec<Reference>> {
    for condition in &m.conditions {
        let Condition::Path(p) = condition else { continue };
        if p.left_label == m.unknown {
            if let Some(bound) = tuple.get(&p.right_label) {
                return candidates_via_path(store, bound, &p.right_roles, &p.left_roles, &m.fact_type);
            }
        }
        if p.right_label == m.unknown {
            if let Some(bound) = tuple.get(&p.left_label) {
                return candidates_via_path(store, bound, &p.left_roles, &p.right_roles, &m.fact_type);
            }
        }
    }
    store
        .by_type(&m.fact_type)?
        .into_iter()
        .filter(|r| r.fact_type == m.fact_type)
        .map(Ok)
        .collect()
}

/// Given a bound reference and the role chain on its side of a path
/// condition (`bound_roles`) plus the role chain on the unknown's side
/// (`unknown_roles`), finds the intermediate "meeting fact" by walking
/// predecessors from `bound`, then finds candidates for the unknown by
/// walking the successor index outward from that meeting fact.
fn candidates_via_path(
    store: &dyn FactStore,
    bound: &Reference,
    bound_roles: &[Role],
    unknown_roles: &[Role],
    unknown_type: &str,
) -> Result<Vec<Reference>> {
    let meet = if bound_roles.is_empty() {
        Some(bound.clone())
    } else {
        predecessor_chain(store, bound, bound_roles)?
    };
    let Some(meet) = meet else { return Ok(Vec::new()) };

    let candidates = if unknown_roles.is_empty() {
        vec![meet]
    } else {
        successor_chain(store, &meet, unknown_roles)?
    };
    Ok(candidates
        .into_iter()
        .filter(|r| r.fact_type == unknown_type)
        .collect())
}

/// Walks predecessors from `origin` through `roles` in order, returning
/// the reference reached, or `None` if any step's predecessor is absent,
/// missing that role, or is a `Many`-valued role (unsupported mid-chain).
fn predecessor_chain(
    store: &dyn FactStore,
    origin: &Reference,
    roles: &[Role],
) -> Result<Option<Reference>> {
    let mut current = origin.clone();
    for role in roles {
        let Some(envelope) = store.load(std::slice::from_ref(&current))?.into_iter().next() else {
            return Ok(None);
        };
        let Some(value) = envelope.fact.predecessors.get(role) else {
            return Ok(None);
        };
        let Some(next) = value.as_single() else {
            return Ok(None);
        };
        current = next.clone();
    }
    Ok(Some(current))
}

/// Inverts a predecessor walk via the store's successor index: finds every
/// reference reachable from `origin` by following `roles` *backward*, one
/// hop per role, last role first.
fn successor_chain(
    store: &dyn FactStore,
    origin: &Reference,
    roles: &[Role],
) -> Result<Vec<Reference>> {
    let mut frontier = vec![origin.clone()];
    for role in roles.iter().rev() {
        let mut next = Vec::new();
        for r in &frontier {
            next.extend(store.successors(r, role)?);
        }
        frontier = next;
    }
    Ok(frontier)
}

/// Evaluates every condition in `conditions` against `tuple`, short-
/// circuiting on the first failure (spec §4.E step 2/3's existential
/// pruning).
fn evaluate_conditions(store: &dyn FactStore, tuple: &Tuple, conditions: &[Condition]) -> Result<bool> {
    for condition in conditions {
        let holds = match condition {
            Condition::Path(p) => evaluate_path(store, tuple, p)?,
            Condition::Existential(e) => evaluate_existential(store, tuple, e)?,
        };
        if !holds {
            return Ok(false);
        }
    }
    Ok(true)
}

fn evaluate_path(store: &dyn FactStore, tuple: &Tuple, p: &PathCondition) -> Result<bool> {
    let (Some(left), Some(right)) = (tuple.get(&p.left_label), tuple.get(&p.right_label)) else {
        return Ok(false);
    };
    let left_end = predecessor_chain(store, left, &p.left_roles)?;
    let right_end = predecessor_chain(store, right, &p.right_roles)?;
    Ok(matches!((left_end, right_end), (Some(l), Some(r)) if l == r))
}

/// Existentials are finite by construction: every sub-match's candidate
/// enumeration is rooted at a label already bound in `tuple` (spec §3
/// "Existential finiteness").
fn evaluate_existential(store: &dyn FactStore, tuple: &Tuple, e: &ExistentialCondition) -> Result<bool> {
    let satisfied = sub_specification_has_result(store, tuple, &e.matches)?;
    Ok(satisfied == e.exists)
}

fn sub_specification_has_result(store: &dyn FactStore, tuple: &Tuple, matches: &[Match]) -> Result<bool> {
    let mut tuples = vec![tuple.clone()];
    for m in matches {
        tuples = expand_matches(store, tuples, m)?;
        if tuples.is_empty() {
            return Ok(false);
        }
    }
    Ok(!tuples.is_empty())
}

/// Evaluates a projection for one surviving tuple (spec §4.E step 4).
/// Returns `None` when the projection must drop the tuple (a referenced
/// label is absent from storage) rather than error.
fn evaluate_projection(
    store: &dyn FactStore,
    tuple: &Tuple,
    projection: &Projection,
) -> Result<Option<ProjectedValue>> {
    match projection {
        Projection::Label(label) => {
            let Some(reference) = tuple.get(label) else { return Ok(None) };
            if store.load(std::slice::from_ref(reference))?.is_empty() {
                return Ok(None);
            }
            Ok(Some(ProjectedValue::Reference(reference.clone())))
        }
        Projection::Field { label, field } => {
            let Some(reference) = tuple.get(label) else { return Ok(None) };
            let Some(envelope) = store.load(std::slice::from_ref(reference))?.into_iter().next() else {
                return Ok(None);
            };
            let Some(value) = envelope.fact.fields.get(field) else {
                return Err(RuntimeDataError::ProjectionFieldMissing {
                    label: label.clone(),
                    field: field.clone(),
                }
                .into());
            };
            Ok(Some(ProjectedValue::Scalar(value.clone())))
        }
        Projection::FactTime(label) => {
            let Some(reference) = tuple.get(label) else { return Ok(None) };
            let Some(known_at) = store.known_at(reference)? else { return Ok(None) };
            Ok(Some(ProjectedValue::Timestamp(known_at)))
        }
        Projection::Specification(nested) => {
            let results = run_nested_with_outer_tuple(store, tuple, nested)?;
            Ok(Some(ProjectedValue::Collection(results)))
        }
        Projection::Composite(entries) => {
            let mut out = Vec::with_capacity(entries.len());
            for (name, p) in entries {
                match evaluate_projection(store, tuple, p)? {
                    Some(value) => out.push((name.clone(), value)),
                    None => return Ok(None),
                }
            }
            Ok(Some(ProjectedValue::Composite(out)))
        }
    }
}

/// A nested sub-specification's conditions may reference any label already
/// bound in the enclosing tuple, not only the labels it redeclares as its
/// own givens — so it is always run seeded with the *entire* outer tuple,
/// never just the positional subset named in `nested.given`.
///
/// Each of the nested spec's own givens is then resolved one of two ways:
/// it either names a label the outer tuple already binds (reusing it, and
/// just checking its conditions still hold), or it names a fresh label —
/// in which case it is an unknown to be introduced exactly like a `Match`,
/// anchored back to the outer tuple through its own path conditions.
fn run_nested_with_outer_tuple(
    store: &dyn FactStore,
    outer: &Tuple,
    nested: &Specification,
) -> Result<Vec<QueryResult>> {
    let mut tuples = vec![outer.clone()];
    for labeled_given in &nested.given {
        if outer.contains_key(&labeled_given.label) {
            let mut surviving = Vec::with_capacity(tuples.len());
            for t in tuples {
                if evaluate_conditions(store, &t, &labeled_given.conditions)? {
                    surviving.push(t);
                }
            }
            tuples = surviving;
        } else {
            let as_match = Match {
                unknown: labeled_given.label.clone(),
                fact_type: labeled_given.fact_type.clone(),
                conditions: labeled_given.conditions.clone(),
            };
            tuples = expand_matches(store, tuples, &as_match)?;
        }
        if tuples.is_empty() {
            return Ok(Vec::new());
        }
    }

    for m in &nested.matches {
        tuples = expand_matches(store, tuples, m)?;
    }

    let mut results = Vec::with_capacity(tuples.len());
    for t in tuples {
        if let Some(projection) = evaluate_projection(store, &t, &nested.projection)? {
            results.push(QueryResult { tuple: t, projection });
        }
    }
    Ok(results)
}
